//! Daemon log setup
//!
//! Everything goes to `<log_dir>/tsm.log`. At debug and trace the same lines
//! are mirrored to stderr so a foreground run shows them too.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::LevelFilter;

pub const LOG_FILE_NAME: &str = "tsm.log";

/// Log file path inside `log_dir`
pub fn log_file_path(log_dir: &Path) -> PathBuf {
    log_dir.join(LOG_FILE_NAME)
}

fn format_line(record: &log::Record, message: &std::fmt::Arguments) -> String {
    format!(
        "{} [{}] {}: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
        record.level(),
        record.target(),
        message
    )
}

/// Install the global logger. Can only succeed once per process.
pub fn init(log_dir: &Path, level: LevelFilter) -> Result<(), LoggingError> {
    fs::create_dir_all(log_dir)?;
    let file = fern::log_file(log_file_path(log_dir))?;

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| out.finish(format_args!("{}", format_line(record, message))))
        .level(level)
        // sled is chatty at debug
        .level_for("sled", level.min(LevelFilter::Info))
        .chain(file);

    if level >= LevelFilter::Debug {
        dispatch = dispatch.chain(io::stderr());
    }

    dispatch.apply()?;
    log::debug!("Logging to {} at {}", log_file_path(log_dir).display(), level);
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Failed to open log file: {0}")]
    Io(#[from] io::Error),

    #[error("Logger already installed: {0}")]
    AlreadySet(#[from] log::SetLoggerError),
}
