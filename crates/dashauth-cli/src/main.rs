//! dashauth - keep a dashboard API session alive from the terminal.
//!
//! Logs in against the backend's `/auth` endpoints, persists the session
//! between runs and refreshes it ahead of expiry.

mod commands;

use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use dashauth_core::storage::open_store;
use dashauth_core::{AuthClient, Config, SessionManager};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use commands::Command;

/// Log file name prefix inside the log directory (rotated daily)
const LOG_FILE_PREFIX: &str = "dashauth.log";

/// Initialize the tracing subscriber for logging.
/// Long-running commands also log to a rolling file under `log_dir`.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = Command::parse(&args)?;
    if command == Command::Help {
        commands::print_usage();
        return Ok(());
    }

    let mut config = Config::load()?.apply_env()?;
    let data_dir = config.data_dir()?;

    let log_dir = (command == Command::Watch).then(|| data_dir.join("logs"));
    let _log_guard = init_tracing(log_dir.as_deref());
    info!(?command, api = %config.api_base_url, storage = ?config.storage, "dashauth starting");

    let store = open_store(config.storage, &data_dir, config.passphrase.as_deref())?;
    let api = AuthClient::new(&config.api_base_url, config.request_timeout_secs)?;
    let manager = SessionManager::new(Arc::new(api), store, config.refresh.clone());
    manager.init().await;

    let result = commands::run(command, &manager, &mut config).await;

    manager.teardown();
    info!("dashauth shutting down");
    result
}
