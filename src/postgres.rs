// ABOUTME: PostgreSQL connection helpers shared by the registry and the poller
// ABOUTME: TLS-capable connect with retry, plus identifier quoting for dynamic SQL

use anyhow::{Context, Result};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use std::time::Duration;
use tokio_postgres::Client;

/// Connect to a PostgreSQL database.
///
/// The connection task is spawned onto the runtime; dropping the returned
/// client closes the connection.
pub async fn connect(url: &str) -> Result<Client> {
    let connector = TlsConnector::builder()
        .build()
        .context("Failed to build TLS connector")?;
    let tls = MakeTlsConnector::new(connector);

    let (client, connection) = tokio_postgres::connect(url, tls)
        .await
        .with_context(|| format!("Failed to connect to {}", crate::utils::sanitize_url(url)))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("PostgreSQL connection error: {}", e);
        }
    });

    Ok(client)
}

/// Connect with automatic retry on transient failures (3 retries, doubling
/// delay starting at 1 second).
pub async fn connect_with_retry(url: &str) -> Result<Client> {
    crate::utils::retry_with_backoff(|| connect(url), 3, Duration::from_secs(1)).await
}

/// Quote an identifier for embedding in dynamic SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
