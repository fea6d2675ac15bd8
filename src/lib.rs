//! Options Market Data Relay Library
//!
//! A market-data relay microservice that tracks the at-the-money option
//! chain on an upstream quote feed and forwards normalised quotes to a
//! downstream event hub.

pub mod cli;
pub mod config;
pub mod contracts;
pub mod feed;
pub mod gateway;
pub mod handler;
pub mod service;

use anyhow::Result;
use std::path::Path;

/// Application result type for consistent error handling
pub type AppResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Initialize tracing subscriber for logging
///
/// Writes to stdout and, when `log_file` is given, to a daily-rolling file.
pub fn init_logging(level: &str, log_file: Option<&str>) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("optrelay={}", level).into());

    let file_layer = log_file.map(|path| {
        let path = Path::new(path);
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "optrelay.log".to_string());
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(tracing_appender::rolling::daily(dir, name))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    Ok(())
}
