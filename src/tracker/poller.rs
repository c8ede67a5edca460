// ABOUTME: Sequential polling scheduler driving all registered entities
// ABOUTME: Executes delta queries, delivers batches to the sink, advances watermarks

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_postgres::{Client, IsolationLevel};

use crate::config::{RelayConfig, SchemaRefresh};
use crate::error::TrackerError;
use crate::sink::Sink;
use crate::state::WatermarkStore;

use super::change::{self, RowChange};
use super::entity::{EntityKind, TrackedEntity};
use super::query::build_delta_query;
use super::registry::TrackedEntityRegistry;
use super::schema::SchemaInspector;

/// Scheduler settings, extracted from the relay configuration once at
/// startup.
#[derive(Debug, Clone)]
pub struct PollOptions {
    /// Sleep between passes over the registry.
    pub pass_interval: Duration,
    /// Invoke the sink even for empty batches.
    pub deliver_empty_batches: bool,
    /// Whether columns are re-inspected before every delta query.
    pub schema_refresh: SchemaRefresh,
}

impl PollOptions {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            pass_interval: config.relay.poll_interval(),
            deliver_empty_batches: config.relay.deliver_empty_batches,
            schema_refresh: config.relay.schema_refresh,
        }
    }
}

/// Outcome of one pass over the registry.
#[derive(Debug, Clone, Default)]
pub struct PollStats {
    pub entities_polled: usize,
    pub changes_delivered: u64,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl PollStats {
    /// Whether the pass completed without per-entity errors.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Drives the polling loop.
///
/// One task polls all entities strictly sequentially: a new pass starts only
/// after the previous pass and the inter-pass sleep have completed, so a
/// slow sink throttles the whole pipeline. Only the poller writes watermarks,
/// and only after the sink returned without error for that cycle.
pub struct Poller {
    registry: TrackedEntityRegistry,
    sink: Box<dyn Sink>,
    store: WatermarkStore,
    options: PollOptions,
    /// Last poll attempt per entity, successful or not. In-memory only: a
    /// restart polls everything immediately.
    last_polled: HashMap<String, Instant>,
}

impl Poller {
    pub fn new(
        registry: TrackedEntityRegistry,
        sink: Box<dyn Sink>,
        store: WatermarkStore,
        options: PollOptions,
    ) -> Self {
        Self {
            registry,
            sink,
            store,
            options,
            last_polled: HashMap::new(),
        }
    }

    /// Run passes until the shutdown channel fires.
    ///
    /// Cancellation is cooperative: it is checked before each entity and at
    /// the pass boundary, and the inter-pass sleep is interruptible, so
    /// shutdown waits at most for the in-flight entity cycle.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        tracing::info!(
            "Starting poller: {} entities, pass interval {:?}",
            self.registry.len(),
            self.options.pass_interval
        );

        let mut passes = 0u64;
        loop {
            passes += 1;
            let (stats, cancelled) = self.run_pass(&mut shutdown, false).await;

            tracing::info!(
                "Pass {} completed: {} entities, {} changes in {}ms",
                passes,
                stats.entities_polled,
                stats.changes_delivered,
                stats.duration_ms
            );
            if !stats.is_success() {
                tracing::warn!("Pass {} had {} errors", passes, stats.errors.len());
            }

            if cancelled {
                break;
            }

            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping poller");
                    break;
                }
                _ = tokio::time::sleep(self.options.pass_interval) => {}
            }
        }

        Ok(())
    }

    /// Run a single pass over the registry and return its stats. Every
    /// entity is polled regardless of its per-entity interval.
    pub async fn run_once(&mut self) -> PollStats {
        let (tx, mut rx) = broadcast::channel(1);
        let (stats, _) = self.run_pass(&mut rx, true).await;
        drop(tx);
        stats
    }

    /// One sequential pass: each due entity runs its full cycle before the
    /// next entity starts. A failing entity is logged and never blocks the
    /// rest of the pass.
    async fn run_pass(
        &mut self,
        shutdown: &mut broadcast::Receiver<()>,
        force: bool,
    ) -> (PollStats, bool) {
        let start = Instant::now();
        let mut stats = PollStats::default();
        let mut cancelled = false;

        let Poller {
            registry,
            sink,
            store,
            options,
            last_polled,
        } = self;

        for entity in registry.entities() {
            if shutdown_requested(shutdown) {
                tracing::info!("Shutdown requested, finishing pass early");
                cancelled = true;
                break;
            }

            let key = entity.id.qualified_name();
            if !force && !is_due(last_polled.get(&key).copied(), entity.poll_interval) {
                continue;
            }
            last_polled.insert(key.clone(), Instant::now());

            stats.entities_polled += 1;
            match poll_entity(entity, sink.as_ref(), store, options).await {
                Ok(delivered) => {
                    stats.changes_delivered += delivered;
                }
                Err(e) => {
                    tracing::error!("Cycle failed for {}: {:?}", key, e);
                    stats.errors.push(format!("{}: {:#}", key, e));
                }
            }
        }

        stats.duration_ms = start.elapsed().as_millis() as u64;
        (stats, cancelled)
    }

    pub fn store(&self) -> &WatermarkStore {
        &self.store
    }
}

fn shutdown_requested(shutdown: &mut broadcast::Receiver<()>) -> bool {
    !matches!(
        shutdown.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    )
}

/// Whether an entity is due for a poll given its last attempt.
fn is_due(last: Option<Instant>, interval: Duration) -> bool {
    last.map_or(true, |t| t.elapsed() >= interval)
}

fn should_deliver(batch_len: usize, deliver_empty: bool) -> bool {
    batch_len > 0 || deliver_empty
}

/// One entity cycle: Querying, Delivering, Advancing.
///
/// The watermark is advanced only when the batch carried a version past the
/// prior watermark and only after the sink returned success, so any failure
/// here redelivers the same batch on the next pass.
async fn poll_entity(
    entity: &TrackedEntity,
    sink: &dyn Sink,
    store: &mut WatermarkStore,
    options: &PollOptions,
) -> Result<u64> {
    let key = entity.id.qualified_name();
    let prior = store.get(&key);

    // Fresh connection scoped to this cycle; dropped on every exit path.
    let mut client = crate::postgres::connect_with_retry(&entity.url)
        .await
        .map_err(|e| TrackerError::query(key.clone(), e))?;

    let query_started = Instant::now();
    let (batch, procedure_watermark) =
        fetch_changes(&mut client, entity, prior, options).await?;
    let query_elapsed = query_started.elapsed();

    let deliver_started = Instant::now();
    if should_deliver(batch.len(), options.deliver_empty_batches) {
        sink.deliver(entity, &batch)
            .await
            .map_err(|e| TrackerError::sink(key.clone(), e))?;
    }

    if !batch.is_empty() {
        tracing::info!(
            "{}: {} changes (query took {:?}, delivery took {:?})",
            key,
            batch.len(),
            query_elapsed,
            deliver_started.elapsed()
        );
    }

    let next = match entity.kind {
        EntityKind::Table => change::max_version(&batch),
        EntityKind::Procedure => procedure_watermark,
    };
    if let Some(version) = next {
        if version > prior {
            store
                .advance(&key, version, Utc::now())
                .await
                .with_context(|| format!("Failed to persist watermark for {}", key))?;
        }
    }

    Ok(batch.len() as u64)
}

/// Execute the delta query and convert its rows.
///
/// Runs inside an uncommitted-read transaction: scanning the change log must
/// not block concurrent writers, at the cost of possibly observing in-flight
/// rows. PostgreSQL executes the level with read-committed semantics.
async fn fetch_changes(
    client: &mut Client,
    entity: &TrackedEntity,
    prior: i64,
    options: &PollOptions,
) -> Result<(Vec<RowChange>, Option<i64>)> {
    let key = entity.id.qualified_name();

    let (columns, query) = match (options.schema_refresh, entity.kind) {
        (SchemaRefresh::EveryCycle, EntityKind::Table) => {
            let inspector = SchemaInspector::new(client);
            let columns = inspector
                .columns(&entity.id.schema, &entity.id.name)
                .await?;
            let query = build_delta_query(&entity.id, entity.kind, &columns)?;
            (columns, query)
        }
        _ => (entity.columns.clone(), entity.query.clone()),
    };

    let transaction = client
        .build_transaction()
        .isolation_level(IsolationLevel::ReadUncommitted)
        .start()
        .await
        .map_err(|e| TrackerError::query(key.clone(), e))?;

    let rows = transaction
        .query(query.sql.as_str(), &[&prior])
        .await
        .map_err(|e| TrackerError::query(key.clone(), e))?;

    transaction
        .commit()
        .await
        .map_err(|e| TrackerError::query(key.clone(), e))?;

    let mut batch = Vec::with_capacity(rows.len());
    let mut procedure_watermark: Option<i64> = None;

    for row in &rows {
        match entity.kind {
            EntityKind::Table => {
                let change = change::from_table_row(&entity.id, &columns, row)
                    .map_err(|e| TrackerError::query(key.clone(), e))?;
                batch.push(change);
            }
            EntityKind::Procedure => {
                let (change, next) = change::from_procedure_row(&entity.id, row)
                    .map_err(|e| TrackerError::query(key.clone(), e))?;
                procedure_watermark =
                    Some(procedure_watermark.map_or(next, |current| current.max(next)));
                batch.push(change);
            }
        }
    }

    Ok((batch, procedure_watermark))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_stats_success() {
        let stats = PollStats {
            entities_polled: 3,
            changes_delivered: 12,
            errors: vec![],
            duration_ms: 40,
        };
        assert!(stats.is_success());
    }

    #[test]
    fn test_poll_stats_with_errors() {
        let stats = PollStats {
            entities_polled: 3,
            changes_delivered: 8,
            errors: vec!["appdb.public.users: timeout".to_string()],
            duration_ms: 40,
        };
        assert!(!stats.is_success());
    }

    #[test]
    fn test_is_due_when_never_polled() {
        assert!(is_due(None, Duration::from_secs(60)));
    }

    #[test]
    fn test_is_due_respects_interval() {
        let just_now = Instant::now();
        assert!(!is_due(Some(just_now), Duration::from_secs(60)));
        assert!(is_due(Some(just_now), Duration::from_secs(0)));
    }

    #[test]
    fn test_should_deliver_empty_batch_policy() {
        assert!(should_deliver(3, false));
        assert!(!should_deliver(0, false));
        assert!(should_deliver(0, true));
    }
}
