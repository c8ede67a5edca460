// ABOUTME: Change-tracking engine: schema inspection, delta queries, polling
// ABOUTME: Detects row-level mutations and relays ordered batches to a sink

pub mod change;
pub mod entity;
pub mod poller;
pub mod query;
pub mod registry;
pub mod schema;

pub use change::{
    from_procedure_row, from_table_row, max_version, ChangeOperation, RowChange, RowPayload,
    ScalarValue,
};
pub use entity::{EntityId, EntityKind, TrackedEntity};
pub use poller::{PollOptions, Poller, PollStats};
pub use query::{build_delta_query, log_table_name, DeltaQuery, CHANGE_TRACKING_SCHEMA};
pub use registry::{ensure_tracking, TrackedEntityRegistry};
pub use schema::{primary_key, Column, SchemaInspector};
