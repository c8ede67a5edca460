// ABOUTME: Console sink: prints change batches to stdout as JSON
// ABOUTME: Intended for development and for piping into other tools

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::tracker::{RowChange, TrackedEntity};

use super::Sink;

/// Prints one JSON line per change.
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl ConsoleSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Sink for ConsoleSink {
    async fn deliver(&self, entity: &TrackedEntity, batch: &[RowChange]) -> Result<()> {
        for change in batch {
            let line = serde_json::to_string(change)
                .with_context(|| format!("Failed to serialize change for {}", entity.id))?;
            println!("{}", line);
        }
        Ok(())
    }
}
