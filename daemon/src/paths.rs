/// Canonical file paths for AudioPin data files.
///
/// Everything lives under %APPDATA%\AudioPin\ (or `$XDG_CONFIG_HOME/audiopin`
/// / `~/.config/audiopin` outside Windows):
///   - config.toml   Edited by the user, watched by the daemon.
///   - status.toml   Written by the daemon for external tools.
///   - audiopin.log  Log of the current run.
use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};

const APP_DIR_NAME: &str = "AudioPin";
const UNIX_APP_DIR_NAME: &str = "audiopin";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const STATUS_FILE_NAME: &str = "status.toml";
pub const LOG_FILE_NAME: &str = "audiopin.log";

/// Returns the AudioPin application data directory.
pub fn app_data_dir() -> Result<PathBuf> {
    if let Ok(appdata) = std::env::var("APPDATA") {
        return Ok(PathBuf::from(appdata).join(APP_DIR_NAME));
    }
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return Ok(PathBuf::from(xdg).join(UNIX_APP_DIR_NAME));
    }
    std::env::var("HOME")
        .map(|home| PathBuf::from(home).join(".config").join(UNIX_APP_DIR_NAME))
        .map_err(|_| anyhow!("Neither APPDATA nor HOME is set"))
}

pub fn config_file_path(app_dir: &Path) -> PathBuf {
    app_dir.join(CONFIG_FILE_NAME)
}

pub fn status_file_path(app_dir: &Path) -> PathBuf {
    app_dir.join(STATUS_FILE_NAME)
}

pub fn log_file_path(app_dir: &Path) -> PathBuf {
    app_dir.join(LOG_FILE_NAME)
}
