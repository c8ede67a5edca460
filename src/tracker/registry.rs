// ABOUTME: Builds the tracked entity set from configuration
// ABOUTME: Performs the idempotent check-then-enable change tracking sequence

use anyhow::{bail, Context, Result};
use tokio_postgres::Client;

use crate::config::{EntityConfig, RelayConfig};
use crate::error::TrackerError;
use crate::postgres::quote_ident;

use super::entity::{EntityId, EntityKind, TrackedEntity};
use super::query::{build_delta_query, log_table_name, CHANGE_TRACKING_SCHEMA};
use super::schema::{primary_key, Column, SchemaInspector};

/// Trigger name installed on every tracked table. Trigger names are scoped
/// to their table, so one name serves all entities.
const TRIGGER_NAME: &str = "relay_ct_log";

/// The set of entities to poll.
///
/// Construction connects to each entity's database, inspects its schema,
/// enables change tracking where requested, and builds the delta query. A
/// failed registration skips that entity with a logged error; the process
/// only fails when nothing registers at all.
pub struct TrackedEntityRegistry {
    entities: Vec<TrackedEntity>,
}

impl TrackedEntityRegistry {
    pub async fn from_config(config: &RelayConfig) -> Result<Self> {
        let mut entities = Vec::with_capacity(config.entities.len());

        for entry in &config.entities {
            match register_entity(entry, config).await {
                Ok(entity) => {
                    tracing::info!("Registered {} ({:?})", entity.id, entity.kind);
                    entities.push(entity);
                }
                Err(e) => {
                    tracing::error!(
                        "Failed to register {}.{}: {:#}",
                        entry.schema,
                        entry.object_name(),
                        e
                    );
                }
            }
        }

        if entities.is_empty() {
            bail!("No entities could be registered; nothing to poll");
        }

        Ok(Self { entities })
    }

    pub fn entities(&self) -> &[TrackedEntity] {
        &self.entities
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

async fn register_entity(entry: &EntityConfig, config: &RelayConfig) -> Result<TrackedEntity> {
    let database = crate::utils::database_name(&entry.url)?;
    let id = EntityId::new(database, entry.schema.clone(), entry.object_name());

    let client = crate::postgres::connect_with_retry(&entry.url)
        .await
        .with_context(|| format!("Failed to connect for registration of {}", id))?;
    let inspector = SchemaInspector::new(&client);

    let (kind, columns) = if entry.is_table() {
        let columns = inspector.columns(&id.schema, &id.name).await?;
        let pk = primary_key(&columns);
        if pk.is_empty() {
            return Err(TrackerError::InvalidEntity(id.qualified_name()).into());
        }

        if entry.auto_enable {
            ensure_tracking(&client, &id, &pk).await?;
        }

        (EntityKind::Table, columns)
    } else {
        inspector.procedure_exists(&id.schema, &id.name).await?;
        (EntityKind::Procedure, Vec::new())
    };

    let query = build_delta_query(&id, kind, &columns)?;

    Ok(TrackedEntity {
        id,
        kind,
        url: entry.url.clone(),
        poll_interval: entry
            .poll_interval_secs
            .map(std::time::Duration::from_secs)
            .unwrap_or_else(|| config.relay.poll_interval()),
        auto_enable: entry.auto_enable,
        columns,
        query,
    })
}

/// Idempotent check-then-enable sequence for one table.
///
/// Catalog lookups decide what is missing; DDL runs only for the missing
/// pieces, so re-registration of an already-tracked table issues no
/// statements.
pub async fn ensure_tracking(client: &Client, id: &EntityId, pk: &[&Column]) -> Result<()> {
    if !database_tracking_enabled(client).await? {
        tracing::info!("Enabling change tracking for database {}...", id.database);
        client
            .batch_execute(&database_tracking_ddl())
            .await
            .context("Failed to enable database-level change tracking")?;
    }

    if !table_tracking_enabled(client, id).await? {
        tracing::info!("Enabling change tracking for {}...", id);
        client
            .batch_execute(&table_tracking_ddl(id, pk))
            .await
            .with_context(|| format!("Failed to enable change tracking for {}", id))?;
    }

    Ok(())
}

/// Whether the change-tracking schema and version sequence exist.
async fn database_tracking_enabled(client: &Client) -> Result<bool> {
    let rows = client
        .query(
            "SELECT 1
             FROM pg_class c
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE n.nspname = $1 AND c.relname = 'change_version' AND c.relkind = 'S'",
            &[&CHANGE_TRACKING_SCHEMA],
        )
        .await
        .context("Failed to check database-level change tracking")?;
    Ok(!rows.is_empty())
}

/// Whether the table's change log and trigger both exist.
async fn table_tracking_enabled(client: &Client, id: &EntityId) -> Result<bool> {
    let log_table = log_table_name(&id.schema, &id.name);
    let rows = client
        .query(
            "SELECT 1
             FROM pg_class c
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE n.nspname = $1 AND c.relname = $2 AND c.relkind = 'r'",
            &[&CHANGE_TRACKING_SCHEMA, &log_table],
        )
        .await
        .context("Failed to check for the change log table")?;
    if rows.is_empty() {
        return Ok(false);
    }

    let rows = client
        .query(
            "SELECT 1
             FROM pg_trigger tg
             JOIN pg_class c ON c.oid = tg.tgrelid
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE n.nspname = $1 AND c.relname = $2 AND tg.tgname = $3
               AND NOT tg.tgisinternal",
            &[&id.schema, &id.name, &TRIGGER_NAME],
        )
        .await
        .context("Failed to check for the change tracking trigger")?;
    Ok(!rows.is_empty())
}

/// DDL for database-level enablement: the tracking schema and the global
/// version sequence.
fn database_tracking_ddl() -> String {
    format!(
        "CREATE SCHEMA IF NOT EXISTS {0}; \
         CREATE SEQUENCE IF NOT EXISTS {0}.change_version",
        quote_ident(CHANGE_TRACKING_SCHEMA)
    )
}

/// DDL for table-level enablement: the change-log table, the trigger
/// function, and the trigger itself.
fn table_tracking_ddl(id: &EntityId, pk: &[&Column]) -> String {
    format!(
        "{}; {}; {}",
        log_table_ddl(id, pk),
        trigger_function_ddl(id, pk),
        trigger_ddl(id)
    )
}

fn qualified_log_table(id: &EntityId) -> String {
    format!(
        "{}.{}",
        quote_ident(CHANGE_TRACKING_SCHEMA),
        quote_ident(&log_table_name(&id.schema, &id.name))
    )
}

fn qualified_log_function(id: &EntityId) -> String {
    format!(
        "{}.{}",
        quote_ident(CHANGE_TRACKING_SCHEMA),
        quote_ident(&format!("{}_log", log_table_name(&id.schema, &id.name)))
    )
}

fn log_table_ddl(id: &EntityId, pk: &[&Column]) -> String {
    let key_columns: Vec<String> = pk
        .iter()
        .map(|c| format!("{} {} NOT NULL", quote_ident(&c.name), c.data_type))
        .collect();

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\
         change_version BIGINT PRIMARY KEY DEFAULT nextval('{}.change_version'), \
         change_operation CHAR(1) NOT NULL, \
         changed_at TIMESTAMPTZ NOT NULL DEFAULT now(), \
         {})",
        qualified_log_table(id),
        CHANGE_TRACKING_SCHEMA,
        key_columns.join(", ")
    )
}

fn trigger_function_ddl(id: &EntityId, pk: &[&Column]) -> String {
    let key_names: Vec<String> = pk.iter().map(|c| quote_ident(&c.name)).collect();
    let old_values: Vec<String> = pk.iter().map(|c| format!("OLD.{}", quote_ident(&c.name))).collect();
    let new_values: Vec<String> = pk.iter().map(|c| format!("NEW.{}", quote_ident(&c.name))).collect();

    let log_table = qualified_log_table(id);
    let columns = format!("change_operation, {}", key_names.join(", "));

    format!(
        "CREATE OR REPLACE FUNCTION {}() RETURNS trigger AS $relay$\n\
         BEGIN\n\
           IF TG_OP = 'DELETE' THEN\n\
             INSERT INTO {} ({}) VALUES ('D', {});\n\
             RETURN OLD;\n\
           ELSIF TG_OP = 'UPDATE' THEN\n\
             INSERT INTO {} ({}) VALUES ('U', {});\n\
             RETURN NEW;\n\
           ELSE\n\
             INSERT INTO {} ({}) VALUES ('I', {});\n\
             RETURN NEW;\n\
           END IF;\n\
         END\n\
         $relay$ LANGUAGE plpgsql",
        qualified_log_function(id),
        log_table,
        columns,
        old_values.join(", "),
        log_table,
        columns,
        new_values.join(", "),
        log_table,
        columns,
        new_values.join(", ")
    )
}

fn trigger_ddl(id: &EntityId) -> String {
    format!(
        "DROP TRIGGER IF EXISTS {0} ON {1}.{2}; \
         CREATE TRIGGER {0} AFTER INSERT OR UPDATE OR DELETE ON {1}.{2} \
         FOR EACH ROW EXECUTE FUNCTION {3}()",
        quote_ident(TRIGGER_NAME),
        quote_ident(&id.schema),
        quote_ident(&id.name),
        qualified_log_function(id)
    )
}
