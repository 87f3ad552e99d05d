//! Session logging setup
//!
//! Logs go to stderr and to a per-session file under the data directory's
//! `logs/` subfolder, named `session_YYYYMMDD_HHMMSS.log`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::{EngineError, Result};

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Returns the path of
/// the session log file.
pub fn init(level: &str, logs_dir: &Path) -> Result<PathBuf> {
    let filename = format!(
        "session_{}.log",
        chrono::Local::now().format("%Y%m%d_%H%M%S")
    );
    let log_path = logs_dir.join(filename);
    let log_file = std::fs::File::create(&log_path)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(log_file)),
        )
        .try_init()
        .map_err(|e| EngineError::Config(format!("failed to init logging: {}", e)))?;

    tracing::info!("Logging to {:?}", log_path);
    Ok(log_path)
}
