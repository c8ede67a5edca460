// ABOUTME: Typed error taxonomy for the change-tracking core
// ABOUTME: Separates per-entity setup failures from transient per-cycle failures

use thiserror::Error;

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by the change-tracking engine.
///
/// `SchemaNotFound` and `InvalidEntity` are setup errors: the entity is
/// skipped and never retried until its configuration changes. The other two
/// are transient per-cycle errors: the watermark stays put and the cycle is
/// retried on the next scheduled pass, redelivering the same batch.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// The tracked table or procedure is absent from the catalog.
    #[error("{0} not found in catalog")]
    SchemaNotFound(String),

    /// A table-kind entity has no primary-key columns, so there is no join
    /// key for the delta query.
    #[error("{0} has no primary key columns")]
    InvalidEntity(String),

    /// The delta query (or row conversion) failed for one entity.
    #[error("delta query failed for {entity}")]
    QueryExecution {
        entity: String,
        #[source]
        source: BoxedSource,
    },

    /// The sink callback failed for one entity's batch.
    #[error("sink delivery failed for {entity}")]
    SinkDelivery {
        entity: String,
        #[source]
        source: BoxedSource,
    },
}

impl TrackerError {
    pub fn query(entity: impl Into<String>, source: impl Into<BoxedSource>) -> Self {
        Self::QueryExecution {
            entity: entity.into(),
            source: source.into(),
        }
    }

    pub fn sink(entity: impl Into<String>, source: impl Into<BoxedSource>) -> Self {
        Self::SinkDelivery {
            entity: entity.into(),
            source: source.into(),
        }
    }

    /// Whether the error is permanent for the entity (as opposed to a
    /// transient fault worth retrying on the next pass).
    pub fn is_setup_error(&self) -> bool {
        matches!(self, Self::SchemaNotFound(_) | Self::InvalidEntity(_))
    }
}
