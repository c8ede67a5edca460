// ABOUTME: Catalog introspection for tracked entities
// ABOUTME: Resolves column lists with primary-key flags ordered by ordinal position

use tokio_postgres::Client;

use crate::error::TrackerError;

/// One column of a tracked table, as seen in the catalog.
///
/// Ephemeral: fetched per entity at registration (or per cycle, depending on
/// the schema-refresh policy) and never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    /// `information_schema` spelling of the type, e.g. `character varying`.
    pub data_type: String,
    pub is_primary_key: bool,
    pub ordinal: i32,
}

/// Columns that form the primary key, in ordinal order.
pub fn primary_key(columns: &[Column]) -> Vec<&Column> {
    columns.iter().filter(|c| c.is_primary_key).collect()
}

/// Reads column and constraint metadata from the catalog.
///
/// Pure reads; the result is a snapshot and schema drift between calls is
/// not detected.
pub struct SchemaInspector<'a> {
    client: &'a Client,
}

impl<'a> SchemaInspector<'a> {
    pub fn new(client: &'a Client) -> Self {
        Self { client }
    }

    /// Columns of a table, ordered by ordinal position, with the primary-key
    /// flag derived from constraint metadata.
    ///
    /// Fails with `SchemaNotFound` when the table has no columns in the
    /// catalog, i.e. does not exist.
    pub async fn columns(&self, schema: &str, table: &str) -> Result<Vec<Column>, TrackerError> {
        let rows = self
            .client
            .query(
                "SELECT c.column_name,
                        c.data_type,
                        c.ordinal_position::int AS ordinal_position,
                        pk.column_name IS NOT NULL AS is_primary_key
                 FROM information_schema.columns c
                 LEFT JOIN (
                     SELECT ku.table_schema, ku.table_name, ku.column_name
                     FROM information_schema.table_constraints tc
                     JOIN information_schema.key_column_usage ku
                       ON tc.constraint_type = 'PRIMARY KEY'
                      AND tc.constraint_name = ku.constraint_name
                      AND tc.table_schema = ku.table_schema
                      AND tc.table_name = ku.table_name
                 ) pk
                   ON pk.table_schema = c.table_schema
                  AND pk.table_name = c.table_name
                  AND pk.column_name = c.column_name
                 WHERE c.table_schema = $1 AND c.table_name = $2
                 ORDER BY c.ordinal_position",
                &[&schema, &table],
            )
            .await
            .map_err(|e| TrackerError::query(format!("{}.{}", schema, table), e))?;

        if rows.is_empty() {
            return Err(TrackerError::SchemaNotFound(format!(
                "{}.{}",
                schema, table
            )));
        }

        Ok(rows
            .iter()
            .map(|row| Column {
                name: row.get(0),
                data_type: row.get(1),
                ordinal: row.get(2),
                is_primary_key: row.get(3),
            })
            .collect())
    }

    /// Verify that a procedure exists in the catalog.
    pub async fn procedure_exists(
        &self,
        schema: &str,
        procedure: &str,
    ) -> Result<(), TrackerError> {
        let rows = self
            .client
            .query(
                "SELECT 1
                 FROM pg_proc p
                 JOIN pg_namespace n ON n.oid = p.pronamespace
                 WHERE n.nspname = $1 AND p.proname = $2",
                &[&schema, &procedure],
            )
            .await
            .map_err(|e| TrackerError::query(format!("{}.{}", schema, procedure), e))?;

        if rows.is_empty() {
            return Err(TrackerError::SchemaNotFound(format!(
                "{}.{}",
                schema, procedure
            )));
        }

        Ok(())
    }
}
