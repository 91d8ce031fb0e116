//! rowbase - Main entry point.
//!
//! Small inspection tool over the rowbase pool: lists tables and columns,
//! and reports pool statistics.

use clap::Parser;
use rowbase::config::{Command, Config};
use rowbase::db::{ConnectionPool, DataHandler};
use rowbase::models::ConnectionConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

async fn run(config: &Config, handler: &DataHandler) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    let output = match &config.command {
        Command::Tables => serde_json::to_value(handler.tables().await?)?,
        Command::Columns { table } => serde_json::json!({
            "table": table,
            "columns": handler.columns(table).await?,
        }),
        Command::PoolStats { hold_ms } => {
            let guard = handler.pool().acquire().await?;
            if *hold_ms > 0 {
                tokio::time::sleep(Duration::from_millis(*hold_ms)).await;
            }
            let connections = handler.pool().connections();
            guard.release();
            serde_json::json!({
                "database": handler.dialect().display_name(),
                "statistics": handler.pool().statistics(),
                "connections": connections,
            })
        }
    };
    Ok(output)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    init_tracing(&config);

    let conn_config = ConnectionConfig::parse(&config.database)?;
    info!(
        database = %conn_config.masked_connection_string(),
        db_type = %conn_config.db_type,
        "Starting rowbase v{}",
        env!("CARGO_PKG_VERSION")
    );

    let pool = Arc::new(ConnectionPool::connect(conn_config).await?);
    let handler = DataHandler::new(pool);

    let result = run(&config, &handler).await;
    let stats = handler.shutdown().await;
    info!(
        opened = stats.opened,
        returned = stats.returned,
        "Pool shut down"
    );

    match result {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Command failed");
            Err(e)
        }
    }
}
