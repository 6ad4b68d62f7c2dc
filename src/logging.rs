//! Logging setup: console plus a monthly log file.

use chrono::{DateTime, Utc};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt};

/// `sundial-cam-2026Oct.log`
pub fn log_file_name(at: DateTime<Utc>) -> String {
    at.format("sundial-cam-%Y%b.log").to_string()
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `level` when set. Without a log directory only the
/// console is used. Returns the log file path, if any.
pub fn init(
    level: &str,
    log_dir: Option<&Path>,
) -> Result<Option<PathBuf>, Box<dyn std::error::Error + Send + Sync + 'static>> {
    let log_path = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            Some(dir.join(log_file_name(Utc::now())))
        }
        None => None,
    };

    let file_layer = match &log_path {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_target(false),
            )
        }
        None => None,
    };

    let console_layer = fmt::layer().with_ansi(!cfg!(windows)).with_target(false);

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    let collector = tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(filter);
    tracing::subscriber::set_global_default(collector)?;

    if let Some(path) = &log_path {
        tracing::debug!("Logging to {}", path.display());
    }
    Ok(log_path)
}
