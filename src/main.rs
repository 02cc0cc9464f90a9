/// Process entrypoint.
///
/// Wiring the five job workers, the sweeper, and the MCP proxy manager all
/// needs concrete `services` implementations (document store, graph store,
/// model factory, blob storage, builtin tool catalog) that this crate
/// deliberately does not own — the host application constructs those and
/// drives `worker::spawn`/`Sweeper::run`/`McpProxyManager` itself. This
/// binary only proves the process boots: config, logging, and a pool.

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

use kbforge::config::Config;
use kbforge::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    logging::init_logging(&config);
    tracing::info!("kbforge starting");

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .idle_timeout(Duration::from_secs(config.database.idle_timeout_secs))
        .max_lifetime(Duration::from_secs(config.database.max_lifetime_secs))
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    sqlx::query("SELECT 1").execute(&pool).await.context("database connectivity check failed")?;
    tracing::info!("kbforge connected to database, ready for host application to wire workers");

    Ok(())
}
