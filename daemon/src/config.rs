use anyhow::{Context, Result};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::devices::{self, DeviceSet};
use crate::event::DaemonEvent;
use crate::registry::clamp_delay;

pub const DEFAULT_DELAY_SECS: f64 = 1.0;
pub const DEFAULT_SOUND_VOLUME_VIEW_PATH: &str = "SoundVolumeView.exe";

/// Written on first start when no config file exists yet.
const DEFAULT_CONFIG_TEMPLATE: &str = r#"[global]
sound_volume_view_path = "SoundVolumeView.exe"
default_delay_secs = 1.0

[[applications]]
name = "MyExampleApp1.exe"
device = "MyExampleAudioDevice"

[[applications]]
name = "MyExampleApp2.exe"
device = "MyExampleAudioDevice"
delay_secs = 2.5
"#;

/// Root configuration structure. Deserialized from %APPDATA%\AudioPin\config.toml.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub applications: Vec<ApplicationConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    /// Path to the SoundVolumeView executable used to assign devices.
    #[serde(default = "default_sound_volume_view_path")]
    pub sound_volume_view_path: String,
    /// Delay used by applications that do not set `delay_secs`.
    #[serde(default = "default_delay")]
    pub default_delay_secs: f64,
    /// Explicit device list.  When absent, devices are discovered via SoundVolumeView.
    #[serde(default)]
    pub devices: Option<Vec<String>>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            sound_volume_view_path: DEFAULT_SOUND_VOLUME_VIEW_PATH.to_string(),
            default_delay_secs: DEFAULT_DELAY_SECS,
            devices: None,
        }
    }
}

/// Raw configuration entry for one application.
///
/// Fields are loosely typed so a single malformed entry can be rejected
/// without failing the whole file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApplicationConfig {
    pub name: Option<String>,
    pub device: Option<String>,
    pub delay_secs: Option<toml::Value>,
}

/// A validated `(name, device, delay)` triple ready for registration.
#[derive(Debug, Clone, PartialEq)]
pub struct AppEntry {
    pub name: String,
    pub device: String,
    pub delay_secs: f64,
}

impl Config {
    /// Validates every application entry.  Invalid entries are logged and skipped.
    pub fn entries(&self) -> Vec<AppEntry> {
        if self.applications.is_empty() {
            warn!("No applications defined in the config. Add apps to the config file and it will be reloaded");
        }
        let default_delay = clamp_delay(self.global.default_delay_secs);
        self.applications
            .iter()
            .filter_map(|app| app.validate(default_delay))
            .collect()
    }
}

impl ApplicationConfig {
    fn validate(&self, default_delay: f64) -> Option<AppEntry> {
        let name = match self.name.as_deref().map(str::trim) {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => {
                warn!("Skipping application entry without a 'name'");
                return None;
            }
        };

        let device = match self.device.as_deref().map(str::trim) {
            Some(d) if !d.is_empty() => d.to_string(),
            _ => {
                warn!("Application '{name}' is missing a 'device'. Apps require a device defining the audio output");
                return None;
            }
        };

        let delay_secs = match &self.delay_secs {
            None => default_delay,
            Some(value) => match parse_delay(value) {
                Some(secs) => clamp_delay(secs),
                None => {
                    warn!("Delay of '{name}' is not a number: {value}");
                    return None;
                }
            },
        };

        Some(AppEntry { name, device, delay_secs })
    }
}

fn parse_delay(value: &toml::Value) -> Option<f64> {
    match value {
        toml::Value::Integer(i) => Some(*i as f64),
        toml::Value::Float(f) => Some(*f),
        toml::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Writes an example config to `path` unless a file already exists there.
/// Returns true when a file was created.
pub fn write_default(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
    }
    std::fs::write(path, DEFAULT_CONFIG_TEMPLATE)
        .with_context(|| format!("Failed to write default config: {}", path.display()))?;
    Ok(true)
}

/// Makes `path` absolute against the working directory.  Watcher events carry
/// paths joined onto the watched directory, so a bare file name would never
/// match them.
pub fn resolve_path(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path)
        .with_context(|| format!("Failed to resolve config path: {}", path.display()))
}

/// The directory to watch for `path`, and the path its events will carry for
/// the config file.
fn watch_target(path: &Path) -> Result<(PathBuf, PathBuf)> {
    let path = resolve_path(path)?;
    let (Some(dir), Some(file_name)) = (path.parent(), path.file_name()) else {
        anyhow::bail!("Config path has no parent directory: {}", path.display());
    };
    let dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    let file = dir.join(file_name);
    Ok((dir, file))
}

/// Runs device discovery on a blocking thread.  Failure degrades to an empty
/// set so every registration is rejected until the next successful reload.
pub async fn discover_devices(global: GlobalConfig) -> DeviceSet {
    match tokio::task::spawn_blocking(move || devices::discover(&global)).await {
        Ok(Ok(set)) => set,
        Ok(Err(e)) => {
            error!("Device discovery failed: {e:#}");
            DeviceSet::default()
        }
        Err(e) => {
            error!("Device discovery task panicked: {e}");
            DeviceSet::default()
        }
    }
}

/// Spawns a file watcher on the parent directory of `path`.  Whenever the config
/// file is created or modified, reloads it, refreshes the device set and sends
/// a `ConfigReloaded` event.
pub async fn watch_config(path: PathBuf, tx: mpsc::Sender<DaemonEvent>) {
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Event>(16);

    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = watch_tx.blocking_send(event);
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            error!("Failed to create config file watcher: {e}");
            return;
        }
    };

    // Watch the parent directory rather than the file directly so we catch
    // editor-style atomic saves (write-new + rename).
    let (watch_dir, config_file) = match watch_target(&path) {
        Ok(target) => target,
        Err(e) => {
            error!("{e:#}");
            return;
        }
    };

    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        error!("Failed to watch config directory: {e}");
        return;
    }

    while let Some(event) = watch_rx.recv().await {
        let affects_config = event.paths.iter().any(|p| p == &config_file);
        let is_write = matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
        );
        if !(affects_config && is_write) {
            continue;
        }

        info!("Reloading config file...");
        match load_or_default(&path) {
            Ok(config) => {
                let devices = discover_devices(config.global.clone()).await;
                if tx.send(DaemonEvent::ConfigReloaded { config, devices }).await.is_err() {
                    break;
                }
            }
            Err(e) => error!("Failed to reload config: {e:#}"),
        }
    }
}

fn default_sound_volume_view_path() -> String {
    DEFAULT_SOUND_VOLUME_VIEW_PATH.to_string()
}

fn default_delay() -> f64 {
    DEFAULT_DELAY_SECS
}
