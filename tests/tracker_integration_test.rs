// ABOUTME: Integration tests for the change-tracking poller lifecycle
// ABOUTME: Enable, poll, deliver, advance, redeliver; requires a live PostgreSQL

use async_trait::async_trait;
use std::env;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use table_relay::config::{EntityConfig, RelayConfig, RelayOptions, SinkConfig};
use table_relay::sink::Sink;
use table_relay::state::WatermarkStore;
use table_relay::tracker::{
    ChangeOperation, PollOptions, Poller, RowChange, ScalarValue, TrackedEntity,
    TrackedEntityRegistry,
};

/// Source database URL from the environment, or None to skip.
fn get_test_url() -> Option<String> {
    env::var("TEST_SOURCE_URL").ok()
}

fn test_table_name(suffix: &str) -> String {
    format!("relay_test_{}", suffix)
}

/// Sink that records every delivered batch.
#[derive(Clone, Default)]
struct RecordingSink {
    batches: Arc<Mutex<Vec<(String, Vec<RowChange>)>>>,
}

#[async_trait]
impl Sink for RecordingSink {
    async fn deliver(&self, entity: &TrackedEntity, batch: &[RowChange]) -> anyhow::Result<()> {
        self.batches
            .lock()
            .unwrap()
            .push((entity.id.qualified_name(), batch.to_vec()));
        Ok(())
    }
}

/// Sink that always fails delivery.
struct FailingSink;

#[async_trait]
impl Sink for FailingSink {
    async fn deliver(&self, _entity: &TrackedEntity, _batch: &[RowChange]) -> anyhow::Result<()> {
        anyhow::bail!("sink is down")
    }
}

fn table_config(url: &str, table: &str, state_path: PathBuf) -> RelayConfig {
    RelayConfig {
        relay: RelayOptions {
            poll_interval_secs: 1,
            deliver_empty_batches: false,
            schema_refresh: Default::default(),
            state_path: Some(state_path),
        },
        sink: SinkConfig::Console,
        entities: vec![EntityConfig {
            url: url.to_string(),
            schema: "public".to_string(),
            table: Some(table.to_string()),
            procedure: None,
            poll_interval_secs: None,
            auto_enable: true,
        }],
    }
}

fn procedure_config(url: &str, procedure: &str, state_path: PathBuf) -> RelayConfig {
    let mut config = table_config(url, "unused", state_path);
    config.entities[0].table = None;
    config.entities[0].procedure = Some(procedure.to_string());
    config
}

async fn connect(url: &str) -> tokio_postgres::Client {
    table_relay::postgres::connect(url)
        .await
        .expect("Failed to connect to test database")
}

async fn setup_test_table(client: &tokio_postgres::Client, table: &str) {
    cleanup_test_table(client, table).await;
    client
        .batch_execute(&format!(
            r#"CREATE TABLE "public"."{}" (id INTEGER PRIMARY KEY, name TEXT)"#,
            table
        ))
        .await
        .expect("Failed to create test table");
}

async fn cleanup_test_table(client: &tokio_postgres::Client, table: &str) {
    let _ = client
        .batch_execute(&format!(
            r#"
            DROP TABLE IF EXISTS "public"."{0}" CASCADE;
            DROP TABLE IF EXISTS "relay_ct"."public__{0}" CASCADE;
            DROP FUNCTION IF EXISTS "relay_ct"."public__{0}_log"() CASCADE;
            "#,
            table
        ))
        .await;
}

async fn build_poller(
    config: &RelayConfig,
    sink: Box<dyn Sink>,
) -> (Poller, String) {
    let registry = TrackedEntityRegistry::from_config(config)
        .await
        .expect("Failed to build registry");
    let key = registry.entities()[0].id.qualified_name();
    let store = WatermarkStore::open(config.relay.state_path.as_ref().unwrap())
        .await
        .expect("Failed to open watermark store");
    let options = PollOptions::from_config(config);
    (Poller::new(registry, sink, store, options), key)
}

#[tokio::test]
#[ignore]
async fn test_enable_tracking_is_idempotent() {
    let url = get_test_url().expect("TEST_SOURCE_URL must be set");
    let client = connect(&url).await;
    let table = test_table_name("idempotent");
    setup_test_table(&client, &table).await;

    let dir = tempfile::tempdir().unwrap();
    let config = table_config(&url, &table, dir.path().join("state.json"));

    // Registering twice must not fail or install a second trigger.
    TrackedEntityRegistry::from_config(&config).await.unwrap();
    TrackedEntityRegistry::from_config(&config).await.unwrap();

    let rows = client
        .query(
            "SELECT 1 FROM pg_trigger tg
             JOIN pg_class c ON c.oid = tg.tgrelid
             WHERE c.relname = $1 AND tg.tgname = 'relay_ct_log' AND NOT tg.tgisinternal",
            &[&table],
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);

    cleanup_test_table(&client, &table).await;
}

#[tokio::test]
#[ignore]
async fn test_insert_batch_delivery_and_watermark() {
    let url = get_test_url().expect("TEST_SOURCE_URL must be set");
    let client = connect(&url).await;
    let table = test_table_name("inserts");
    setup_test_table(&client, &table).await;

    let dir = tempfile::tempdir().unwrap();
    let config = table_config(&url, &table, dir.path().join("state.json"));
    let sink = RecordingSink::default();
    let (mut poller, key) = build_poller(&config, Box::new(sink.clone())).await;

    client
        .batch_execute(&format!(
            r#"INSERT INTO "public"."{}" (id, name) VALUES (1, 'ada'), (2, 'grace'), (3, 'edsger')"#,
            table
        ))
        .await
        .unwrap();

    let stats = poller.run_once().await;
    assert!(stats.is_success(), "errors: {:?}", stats.errors);

    // Exactly one batch of three inserts, in version order.
    let batches = sink.batches.lock().unwrap().clone();
    assert_eq!(batches.len(), 1);
    let (entity, batch) = &batches[0];
    assert_eq!(entity, &key);
    assert_eq!(batch.len(), 3);
    for change in batch {
        assert_eq!(change.change_operation, ChangeOperation::Insert);
    }
    assert!(batch.windows(2).all(|w| w[0].change_version <= w[1].change_version));
    let ids: Vec<&ScalarValue> = batch.iter().map(|c| c.row.get("id").unwrap()).collect();
    assert_eq!(
        ids,
        vec![&ScalarValue::Int(1), &ScalarValue::Int(2), &ScalarValue::Int(3)]
    );

    // Watermark advanced to the batch's highest version.
    let max_version = batch.last().unwrap().change_version;
    assert_eq!(poller.store().get(&key), max_version);

    // A poll with no new writes delivers nothing and moves nothing.
    let stats = poller.run_once().await;
    assert!(stats.is_success());
    assert_eq!(stats.changes_delivered, 0);
    assert_eq!(sink.batches.lock().unwrap().len(), 1);
    assert_eq!(poller.store().get(&key), max_version);

    cleanup_test_table(&client, &table).await;
}

#[tokio::test]
#[ignore]
async fn test_delete_payload_contains_key_only() {
    let url = get_test_url().expect("TEST_SOURCE_URL must be set");
    let client = connect(&url).await;
    let table = test_table_name("deletes");
    setup_test_table(&client, &table).await;

    let dir = tempfile::tempdir().unwrap();
    let config = table_config(&url, &table, dir.path().join("state.json"));
    let sink = RecordingSink::default();
    let (mut poller, _key) = build_poller(&config, Box::new(sink.clone())).await;

    client
        .batch_execute(&format!(
            r#"INSERT INTO "public"."{0}" (id, name) VALUES (1, 'ada'), (2, 'grace');
               "#,
            table
        ))
        .await
        .unwrap();
    poller.run_once().await;

    client
        .batch_execute(&format!(r#"DELETE FROM "public"."{}" WHERE id = 2"#, table))
        .await
        .unwrap();
    let stats = poller.run_once().await;
    assert!(stats.is_success(), "errors: {:?}", stats.errors);

    let batches = sink.batches.lock().unwrap().clone();
    let batch = &batches.last().unwrap().1;
    assert_eq!(batch.len(), 1);

    // The row is gone: only the key survives, the live column reads NULL.
    let change = &batch[0];
    assert_eq!(change.change_operation, ChangeOperation::Delete);
    assert_eq!(change.row.get("id"), Some(&ScalarValue::Int(2)));
    assert_eq!(change.row.get("name"), Some(&ScalarValue::Null));

    cleanup_test_table(&client, &table).await;
}

#[tokio::test]
#[ignore]
async fn test_failing_sink_does_not_advance() {
    let url = get_test_url().expect("TEST_SOURCE_URL must be set");
    let client = connect(&url).await;
    let table = test_table_name("failing");
    setup_test_table(&client, &table).await;

    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");
    let config = table_config(&url, &table, state_path.clone());

    let (mut failing, key) = build_poller(&config, Box::new(FailingSink)).await;
    client
        .batch_execute(&format!(
            r#"INSERT INTO "public"."{}" (id, name) VALUES (1, 'ada')"#,
            table
        ))
        .await
        .unwrap();

    let stats = failing.run_once().await;
    assert!(!stats.is_success());
    assert_eq!(failing.store().get(&key), 0);
    drop(failing);

    // The same batch is redelivered once delivery succeeds.
    let sink = RecordingSink::default();
    let (mut poller, key) = build_poller(&config, Box::new(sink.clone())).await;
    let stats = poller.run_once().await;
    assert!(stats.is_success(), "errors: {:?}", stats.errors);

    let batches = sink.batches.lock().unwrap().clone();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].1.len(), 1);
    assert!(poller.store().get(&key) > 0);

    cleanup_test_table(&client, &table).await;
}

#[tokio::test]
#[ignore]
async fn test_replay_reproduces_identical_batch() {
    let url = get_test_url().expect("TEST_SOURCE_URL must be set");
    let client = connect(&url).await;
    let table = test_table_name("replay");
    setup_test_table(&client, &table).await;

    let dir = tempfile::tempdir().unwrap();
    let config = table_config(&url, &table, dir.path().join("state.json"));
    let sink = RecordingSink::default();
    let (mut poller, _key) = build_poller(&config, Box::new(sink.clone())).await;

    client
        .batch_execute(&format!(
            r#"INSERT INTO "public"."{}" (id, name) VALUES (1, 'ada'), (2, 'grace')"#,
            table
        ))
        .await
        .unwrap();
    poller.run_once().await;
    drop(poller);

    // Re-running the cycle with the watermark reset must reproduce the
    // batch exactly, given no intervening writes.
    let replay_config = table_config(&url, &table, dir.path().join("replay-state.json"));
    let replay_sink = RecordingSink::default();
    let (mut replay_poller, _) = build_poller(&replay_config, Box::new(replay_sink.clone())).await;
    replay_poller.run_once().await;

    let first = sink.batches.lock().unwrap().clone();
    let second = replay_sink.batches.lock().unwrap().clone();
    assert_eq!(first[0].1, second[0].1);

    cleanup_test_table(&client, &table).await;
}

#[tokio::test]
#[ignore]
async fn test_procedure_entity_advances_from_output_parameter() {
    let url = get_test_url().expect("TEST_SOURCE_URL must be set");
    let client = connect(&url).await;

    client
        .batch_execute(
            r#"
            CREATE OR REPLACE FUNCTION public.relay_test_proc(since BIGINT)
            RETURNS TABLE(change_version BIGINT, change_operation TEXT, next_version BIGINT, note TEXT) AS $$
                SELECT since + 1, 'I'::text, since + 10, 'proc row'::text WHERE since < 10
            $$ LANGUAGE sql;
            "#,
        )
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let config = procedure_config(&url, "relay_test_proc", dir.path().join("state.json"));
    let sink = RecordingSink::default();
    let (mut poller, key) = build_poller(&config, Box::new(sink.clone())).await;

    let stats = poller.run_once().await;
    assert!(stats.is_success(), "errors: {:?}", stats.errors);

    let batches = sink.batches.lock().unwrap().clone();
    assert_eq!(batches.len(), 1);
    let change = &batches[0].1[0];
    assert_eq!(change.change_version, 1);
    assert_eq!(change.row.get("note"), Some(&ScalarValue::Text("proc row".to_string())));

    // The watermark comes from next_version, not from the change rows.
    assert_eq!(poller.store().get(&key), 10);

    // The procedure reports nothing past its own watermark.
    let stats = poller.run_once().await;
    assert!(stats.is_success());
    assert_eq!(stats.changes_delivered, 0);
    assert_eq!(poller.store().get(&key), 10);

    let _ = client
        .batch_execute("DROP FUNCTION IF EXISTS public.relay_test_proc(BIGINT)")
        .await;
}

#[tokio::test]
#[ignore]
async fn test_entity_without_primary_key_is_rejected() {
    let url = get_test_url().expect("TEST_SOURCE_URL must be set");
    let client = connect(&url).await;
    let table = test_table_name("no_pk");
    cleanup_test_table(&client, &table).await;
    client
        .batch_execute(&format!(
            r#"CREATE TABLE "public"."{}" (id INTEGER, name TEXT)"#,
            table
        ))
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let config = table_config(&url, &table, dir.path().join("state.json"));

    // The only configured entity is invalid, so registration as a whole
    // has nothing left to poll.
    let result = TrackedEntityRegistry::from_config(&config).await;
    assert!(result.is_err());

    cleanup_test_table(&client, &table).await;
}
