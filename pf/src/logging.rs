//! Logging setup for the `pf` binary and embedders

use std::fs;
use std::path::Path;

use eyre::{Context, Result};
use tracing::{Level, debug, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Name of the manager's log file inside the log directory
pub const LOG_FILE_NAME: &str = "pagefleet.log";

/// Parse a level name, falling back to INFO for anything unknown
pub fn parse_level(level: Option<&str>) -> Level {
    match level.map(|s| s.to_uppercase()) {
        Some(s) => match s.as_str() {
            "TRACE" => Level::TRACE,
            "DEBUG" => Level::DEBUG,
            "INFO" => Level::INFO,
            "WARN" | "WARNING" => Level::WARN,
            "ERROR" => Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                Level::INFO
            }
        },
        None => Level::INFO,
    }
}

/// Install the global subscriber
///
/// The file layer writes `<log_dir>/pagefleet.log` at `file_level` (refined by
/// `RUST_LOG`); the stderr layer only shows `console_level` and above. Calling
/// this again once a subscriber is installed is a no-op.
pub fn setup_logging(log_dir: &Path, file_level: Option<&str>, console_level: Option<&str>) -> Result<()> {
    fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(LOG_FILE_NAME))
        .context("Failed to open log file")?;

    let file_level = parse_level(file_level);
    let console_level = console_level.map(|l| parse_level(Some(l))).unwrap_or(Level::WARN);

    let file_filter = EnvFilter::from_default_env().add_directive(file_level.into());
    let file_layer = fmt::layer()
        .with_writer(log_file)
        .with_ansi(false)
        .with_filter(file_filter);
    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(LevelFilter::from_level(console_level));

    if tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .is_err()
    {
        debug!("setup_logging: subscriber already installed");
        return Ok(());
    }

    info!(?file_level, ?console_level, "Logging initialized");
    Ok(())
}
