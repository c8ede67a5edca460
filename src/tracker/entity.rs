// ABOUTME: Tracked entity descriptors: identity, kind, and polling settings
// ABOUTME: An entity is one table or procedure polled for row changes

use std::fmt;
use std::time::Duration;

use super::query::DeltaQuery;
use super::schema::Column;

/// What kind of object an entity polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    /// A table read through its change-tracking log.
    Table,
    /// A procedure that owns its own delta logic and watermark advancement.
    Procedure,
}

/// Fully qualified identity of a tracked entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityId {
    pub database: String,
    pub schema: String,
    pub name: String,
}

impl EntityId {
    pub fn new(
        database: impl Into<String>,
        schema: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            database: database.into(),
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// `database.schema.name`, used as the watermark store key and in logs.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}.{}", self.database, self.schema, self.name)
    }

    /// Lowercased qualified name, used by sinks that derive file or object
    /// names from the entity.
    pub fn file_stem(&self) -> String {
        self.qualified_name().to_lowercase()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.database, self.schema, self.name)
    }
}

/// A registered entity, ready to poll.
///
/// Owned by the registry; only the poller mutates its runtime state (and
/// that lives in the watermark store, not here). `columns` and `query` are
/// the registration-time snapshot; under the every-cycle schema policy the
/// poller re-derives both before each delta query.
#[derive(Debug, Clone)]
pub struct TrackedEntity {
    pub id: EntityId,
    pub kind: EntityKind,
    /// Connection string for the database that owns the entity.
    pub url: String,
    pub poll_interval: Duration,
    pub auto_enable: bool,
    pub columns: Vec<Column>,
    pub query: DeltaQuery,
}
