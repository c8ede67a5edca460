// ABOUTME: File-backed watermark store for tracked entities
// ABOUTME: Persists the last processed change version and last-run timestamp together

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Watermark for a single entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityWatermark {
    /// Last change version fully processed. `None` means never polled.
    pub version: Option<i64>,
    /// When the entity last completed a successful cycle.
    pub last_run: Option<DateTime<Utc>>,
}

impl EntityWatermark {
    /// Version to resume from: absent reads as 0, the beginning of retained
    /// history.
    pub fn resume_version(&self) -> i64 {
        self.version.unwrap_or(0)
    }
}

/// Watermarks for every tracked entity, persisted as one JSON file.
///
/// Version and last-run are committed in a single atomic write (temp file
/// plus rename), so the two can never diverge on disk. `advance` refuses to
/// move a watermark backwards.
#[derive(Debug, Serialize, Deserialize)]
pub struct WatermarkStore {
    /// State format version for future migrations.
    version: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    /// Per-entity watermarks keyed by qualified entity name.
    entities: BTreeMap<String, EntityWatermark>,
    #[serde(skip)]
    path: PathBuf,
}

impl WatermarkStore {
    /// Open the store at `path`, loading existing state if present.
    pub async fn open(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read watermark state from {:?}", path))?;
            let mut store: WatermarkStore = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse watermark state from {:?}", path))?;
            store.path = path.to_path_buf();
            Ok(store)
        } else {
            let now = Utc::now();
            Ok(Self {
                version: 1,
                created_at: now,
                updated_at: now,
                entities: BTreeMap::new(),
                path: path.to_path_buf(),
            })
        }
    }

    /// Default state file path: `~/.table-relay/state.json`, falling back to
    /// a relative path when no home directory is available.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".table-relay")
            .join("state.json")
    }

    /// Resume version for an entity: 0 when the entity was never polled.
    pub fn get(&self, entity: &str) -> i64 {
        self.entities
            .get(entity)
            .map(EntityWatermark::resume_version)
            .unwrap_or(0)
    }

    /// Full watermark record for an entity, if one exists.
    pub fn watermark(&self, entity: &str) -> Option<&EntityWatermark> {
        self.entities.get(entity)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &EntityWatermark)> {
        self.entities.iter()
    }

    /// Advance an entity's watermark and persist the store.
    ///
    /// Returns `Ok(false)` without touching anything when `version` is lower
    /// than the stored watermark. A failed persist restores the previous
    /// in-memory record before returning the error, so the watermark only
    /// ever advances together with a successful write.
    pub async fn advance(
        &mut self,
        entity: &str,
        version: i64,
        last_run: DateTime<Utc>,
    ) -> Result<bool> {
        let previous = self.entities.get(entity).cloned();

        if let Some(current) = previous.as_ref().and_then(|w| w.version) {
            if version < current {
                tracing::warn!(
                    "Ignoring watermark regression for {}: {} < {}",
                    entity,
                    version,
                    current
                );
                return Ok(false);
            }
        }

        let previous_updated_at = self.updated_at;
        self.entities.insert(
            entity.to_string(),
            EntityWatermark {
                version: Some(version),
                last_run: Some(last_run),
            },
        );
        self.updated_at = last_run;

        match self.save().await {
            Ok(()) => Ok(true),
            Err(e) => {
                match previous {
                    Some(record) => {
                        self.entities.insert(entity.to_string(), record);
                    }
                    None => {
                        self.entities.remove(entity);
                    }
                }
                self.updated_at = previous_updated_at;
                Err(e)
            }
        }
    }

    /// Persist the store to its path with a temp-file-plus-rename write.
    pub async fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }

        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize watermark state")?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents)
            .await
            .with_context(|| format!("Failed to write watermark state to {:?}", tmp))?;
        fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to move watermark state into {:?}", self.path))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
