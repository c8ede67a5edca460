// ABOUTME: Sink contract and construction from configuration
// ABOUTME: A sink consumes one ordered RowChange batch per entity per pass

pub mod console;
pub mod file;
pub mod webhook;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::SinkConfig;
use crate::tracker::{RowChange, TrackedEntity};

pub use console::ConsoleSink;
pub use file::FileSink;
pub use webhook::WebhookSink;

/// Downstream consumer of change batches.
///
/// `deliver` is invoked at most once per entity per poll pass with an
/// ordered batch. Errors never corrupt scheduling: the poller catches them,
/// leaves the entity's watermark unchanged, and redelivers the same batch on
/// the next pass. Implementations must therefore tolerate duplicates
/// (at-least-once delivery).
#[async_trait]
pub trait Sink: Send + Sync {
    async fn deliver(&self, entity: &TrackedEntity, batch: &[RowChange]) -> Result<()>;
}

/// Build the configured sink.
pub fn from_config(config: &SinkConfig) -> Result<Box<dyn Sink>> {
    Ok(match config {
        SinkConfig::Console => Box::new(ConsoleSink::new()),
        SinkConfig::File { directory } => Box::new(FileSink::new(directory.clone())),
        SinkConfig::Webhook { url, api_key } => {
            Box::new(WebhookSink::new(url.clone(), api_key.clone())?)
        }
    })
}

/// Batch name shared by sinks that write to a file or object:
/// `<lowercased qualified name>-changes-<firstVersion>-<lastVersion>.<ext>`.
///
/// Only meaningful for non-empty batches.
pub fn batch_name(entity: &TrackedEntity, batch: &[RowChange], extension: &str) -> Option<String> {
    let first = batch.first()?.change_version;
    let last = batch.last()?.change_version;
    Some(format!(
        "{}-changes-{}-{}.{}",
        entity.id.file_stem(),
        first,
        last,
        extension
    ))
}
