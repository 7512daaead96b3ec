// ===============================
// src/logging.rs
// ===============================
//
// Console log (text atau JSON) + optional append-only error log file.
// RUST_LOG overrides the default filter.
//
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing_subscriber::{
    filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

use crate::config::LogFormat;

const DEFAULT_FILTER: &str = "fill_download=info";

#[derive(Debug, Error)]
pub enum LogInitError {
    #[error("cannot open error log {path}: {source}")]
    ErrorLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("tracing subscriber already installed: {0}")]
    Install(String),
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

pub fn init(format: LogFormat, error_log: Option<&Path>) -> Result<(), LogInitError> {
    let console = match format {
        LogFormat::Json => fmt::layer().json().with_filter(env_filter()).boxed(),
        LogFormat::Text => fmt::layer().with_filter(env_filter()).boxed(),
    };

    let errors = match error_log {
        Some(path) => {
            let open_err = |source| LogInitError::ErrorLog { path: path.to_path_buf(), source };
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent).map_err(open_err)?;
                }
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(open_err)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(LevelFilter::WARN),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(errors)
        .try_init()
        .map_err(|e| LogInitError::Install(e.to_string()))
}
