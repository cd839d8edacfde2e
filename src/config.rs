//! Daemon configuration (`config.json`)

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default config file, relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Game server executable
    pub game_exe_path: PathBuf,
    /// Save directory or single save file
    pub game_save_path: PathBuf,
    /// Update procedure; empty disables updates
    pub update_command: String,
    pub backups_dir: PathBuf,
    /// sled database directory
    pub database_path: PathBuf,
    /// Control socket
    pub socket_path: PathBuf,
    pub log_dir: PathBuf,
    /// error, warn, info, debug or trace
    pub log_level: String,
    /// Wait after the game server exits before touching its files
    pub stop_grace_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            game_exe_path: PathBuf::new(),
            game_save_path: PathBuf::new(),
            update_command: String::new(),
            backups_dir: PathBuf::from("backups"),
            database_path: PathBuf::from("tsm.db"),
            socket_path: PathBuf::from("tsm.sock"),
            log_dir: PathBuf::from("logs"),
            log_level: "warn".to_string(),
            stop_grace_secs: 3,
        }
    }
}

/// Result of [`Config::load`]
#[derive(Debug)]
pub enum Loaded {
    /// Read from an existing file
    Existing(Config),
    /// No file was present; a default one was written to this path
    Generated(PathBuf),
}

impl Config {
    /// Read `path`, or write a default config there if it doesn't exist
    pub fn load(path: &Path) -> Result<Loaded, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Self::default().write(path)?;
                return Ok(Loaded::Generated(path.to_path_buf()));
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        serde_json::from_str(&content).map(Loaded::Existing).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Write as pretty-printed JSON
    pub fn write(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        fs::write(path, json + "\n").map_err(|e| ConfigError::Write {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Check that the paths the daemon can't start without exist
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.game_exe_path.as_os_str().is_empty() {
            return Err(ConfigError::Missing("game_exe_path"));
        }
        if !self.game_exe_path.is_file() {
            return Err(ConfigError::NotFound {
                key: "game_exe_path",
                path: self.game_exe_path.clone(),
            });
        }
        if self.game_save_path.as_os_str().is_empty() {
            return Err(ConfigError::Missing("game_save_path"));
        }
        if !self.game_save_path.exists() {
            return Err(ConfigError::NotFound {
                key: "game_save_path",
                path: self.game_save_path.clone(),
            });
        }
        self.level_filter()?;
        Ok(())
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn level_filter(&self) -> Result<log::LevelFilter, ConfigError> {
        self.log_level
            .parse()
            .map_err(|_| ConfigError::InvalidLogLevel(self.log_level.clone()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {}", .path.display(), .source)]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write {}: {}", .path.display(), .source)]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid config {}: {}", .path.display(), .source)]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("{key} points to {}, which does not exist", .path.display())]
    NotFound { key: &'static str, path: PathBuf },

    #[error("Unknown log level: {0}")]
    InvalidLogLevel(String),
}
