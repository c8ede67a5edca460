// ABOUTME: Deterministic delta-query construction for tracked entities
// ABOUTME: Tables read the change log joined to live rows; procedures are invoked directly

use crate::error::TrackerError;
use crate::postgres::quote_ident;

use super::entity::{EntityId, EntityKind};
use super::schema::{primary_key, Column};

/// Schema that holds the change-tracking log tables and the global version
/// sequence.
pub const CHANGE_TRACKING_SCHEMA: &str = "relay_ct";

/// Name of the change-log table for a tracked table, inside
/// [`CHANGE_TRACKING_SCHEMA`].
pub fn log_table_name(schema: &str, table: &str) -> String {
    format!("{}__{}", schema, table)
}

/// An executable delta query for one entity.
///
/// The text is a pure function of (entity, columns): identical inputs always
/// produce identical SQL. The single parameter `$1` is the watermark to read
/// past.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaQuery {
    pub kind: EntityKind,
    pub sql: String,
}

/// Build the delta query for an entity.
///
/// For tables, the query reads the change log past the watermark and
/// left-outer-joins the live table on the primary-key columns: inserts and
/// updates pick up current values, deletes yield NULL for every non-key
/// column. Primary-key columns are selected from the log side, which is
/// always populated. Rows come back ordered by change version.
///
/// For procedures, the query invokes the named function with the watermark
/// as its argument; the result set must carry `change_version`,
/// `change_operation`, and `next_version` columns.
///
/// Fails with `InvalidEntity` when a table-kind entity has no primary-key
/// columns, since the join would have no predicate.
pub fn build_delta_query(
    id: &EntityId,
    kind: EntityKind,
    columns: &[Column],
) -> Result<DeltaQuery, TrackerError> {
    let sql = match kind {
        EntityKind::Table => build_table_sql(id, columns)?,
        EntityKind::Procedure => build_procedure_sql(id),
    };
    Ok(DeltaQuery { kind, sql })
}

fn build_table_sql(id: &EntityId, columns: &[Column]) -> Result<String, TrackerError> {
    let pk = primary_key(columns);
    if pk.is_empty() {
        return Err(TrackerError::InvalidEntity(id.qualified_name()));
    }

    let log_table = format!(
        "{}.{}",
        quote_ident(CHANGE_TRACKING_SCHEMA),
        quote_ident(&log_table_name(&id.schema, &id.name))
    );
    let live_table = format!("{}.{}", quote_ident(&id.schema), quote_ident(&id.name));

    let select_columns: Vec<String> = columns
        .iter()
        .map(|c| {
            if c.is_primary_key {
                format!("ct.{}", quote_ident(&c.name))
            } else {
                format!("t.{}", quote_ident(&c.name))
            }
        })
        .collect();

    let join_predicates: Vec<String> = pk
        .iter()
        .map(|c| format!("t.{0} = ct.{0}", quote_ident(&c.name)))
        .collect();

    Ok(format!(
        "SELECT ct.change_version, ct.change_operation, {} \
         FROM {} ct \
         LEFT OUTER JOIN {} t ON {} \
         WHERE ct.change_version > $1 \
         ORDER BY ct.change_version",
        select_columns.join(", "),
        log_table,
        live_table,
        join_predicates.join(" AND ")
    ))
}

fn build_procedure_sql(id: &EntityId) -> String {
    format!(
        "SELECT * FROM {}.{}($1)",
        quote_ident(&id.schema),
        quote_ident(&id.name)
    )
}
