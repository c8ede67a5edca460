// ABOUTME: File sink: writes one JSON document per non-empty batch
// ABOUTME: File names follow <entity>-changes-<firstVersion>-<lastVersion>.json

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;

use crate::tracker::{RowChange, TrackedEntity};

use super::{batch_name, Sink};

/// Writes each batch as a pretty-printed JSON array into a directory.
///
/// Empty batches produce no file: there are no versions to name one with.
pub struct FileSink {
    directory: PathBuf,
}

impl FileSink {
    pub fn new(directory: PathBuf) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn deliver(&self, entity: &TrackedEntity, batch: &[RowChange]) -> Result<()> {
        let Some(name) = batch_name(entity, batch, "json") else {
            return Ok(());
        };

        fs::create_dir_all(&self.directory)
            .await
            .with_context(|| format!("Failed to create sink directory {:?}", self.directory))?;

        let contents = serde_json::to_string_pretty(batch)
            .with_context(|| format!("Failed to serialize batch for {}", entity.id))?;

        let path = self.directory.join(&name);
        fs::write(&path, contents)
            .await
            .with_context(|| format!("Failed to write batch to {:?}", path))?;

        tracing::debug!("Wrote {} changes to {:?}", batch.len(), path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::test_support::test_entity;
    use crate::tracker::{ChangeOperation, RowPayload, ScalarValue};

    fn change(version: i64, name: Option<&str>) -> RowChange {
        let mut row = RowPayload::new();
        row.push("Id", ScalarValue::Int(version));
        row.push(
            "Name",
            name.map(|n| ScalarValue::Text(n.to_string()))
                .unwrap_or(ScalarValue::Null),
        );
        RowChange {
            change_version: version,
            change_operation: ChangeOperation::Insert,
            database: "appdb".to_string(),
            table: "users".to_string(),
            row,
        }
    }

    #[tokio::test]
    async fn test_writes_named_batch_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path().to_path_buf());
        let entity = test_entity("appdb", "public", "users");
        let batch = vec![change(5, Some("ada")), change(8, None)];

        sink.deliver(&entity, &batch).await.unwrap();

        let path = dir.path().join("appdb.public.users-changes-5-8.json");
        let contents = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();

        assert_eq!(parsed.as_array().unwrap().len(), 2);
        assert_eq!(parsed[0]["changeVersion"], 5);
        assert_eq!(parsed[0]["row"]["Name"], "ada");
        assert_eq!(parsed[1]["row"]["Name"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_empty_batch_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path().to_path_buf());
        let entity = test_entity("appdb", "public", "users");

        sink.deliver(&entity, &[]).await.unwrap();

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
