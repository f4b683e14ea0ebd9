//! Script to release conversion claims that never completed.

use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use std::env;

use conversion_delivery::claim_store::{ClaimStore, PgClaimStore};

/// Main entry point for the reconciliation script.
///
/// Resets claimed slots older than `RECONCILE_AFTER_SECS` (default 900) that
/// have no stored event id and no successful audit row, so the next delivery
/// pass can send them again.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt::init();

    let database_url = env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let older_than_secs: i64 = match env::var("RECONCILE_AFTER_SECS") {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("RECONCILE_AFTER_SECS must be a number, got '{}'", raw))?,
        Err(_) => 900,
    };

    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&database_url)
        .await?;

    tracing::info!(
        "Connected to database. Releasing claims older than {}s...",
        older_than_secs
    );

    let store = PgClaimStore::new(pool);
    let reset = store
        .reconcile_stale(chrono::Duration::seconds(older_than_secs))
        .await?;

    tracing::info!("Reconciliation complete. Reset {} stale claim(s).", reset);

    Ok(())
}
