use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::error;

use crate::registry::{Assignment, Registry};

/// Current operational state of the daemon.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    /// No application is registered.
    Idle,
    /// At least one application is registered and being watched.
    Watching,
    /// Shutdown in progress; no further commands will be issued.
    Stopping,
}

/// Outcome of the most recent device assignment for one application.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct AssignmentStatus {
    /// `"ok"` or `"failed"`.
    pub result: String,
    pub device: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// RFC 3339 timestamp.
    pub at: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct AppStatus {
    pub device: String,
    pub delay_secs: f64,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_assignment: Option<AssignmentStatus>,
}

/// Runtime status written by the daemon to %APPDATA%\AudioPin\status.toml.
/// External tools read this file to display which devices are pinned.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DaemonStatus {
    /// Daemon binary version (set from Cargo.toml at compile time).
    pub version: String,
    pub state: DaemonState,
    /// Keyed by canonical process name.
    #[serde(default)]
    pub applications: BTreeMap<String, AppStatus>,
}

impl DaemonStatus {
    /// Constructs the initial idle status on daemon startup.
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: DaemonState::Idle,
            applications: BTreeMap::new(),
        }
    }

    /// Refreshes the application table from `registry`.
    pub fn update_from(&mut self, registry: &Registry) {
        self.applications = registry
            .iter()
            .map(|(name, app)| {
                let status = AppStatus {
                    device: app.device.clone(),
                    delay_secs: app.delay_secs,
                    running: app.running,
                    instance: app.active_instance.filter(|_| app.running),
                    last_assignment: app.last_assignment.as_ref().map(AssignmentStatus::from),
                };
                (name.to_string(), status)
            })
            .collect();
        if self.state != DaemonState::Stopping {
            self.state = if self.applications.is_empty() {
                DaemonState::Idle
            } else {
                DaemonState::Watching
            };
        }
    }
}

impl From<&Assignment> for AssignmentStatus {
    fn from(assignment: &Assignment) -> Self {
        match assignment {
            Assignment::Succeeded { device, at } => Self {
                result: "ok".to_string(),
                device: device.clone(),
                exit_code: None,
                at: at.clone(),
            },
            Assignment::Failed { device, code, at } => Self {
                result: "failed".to_string(),
                device: device.clone(),
                exit_code: *code,
                at: at.clone(),
            },
        }
    }
}

/// Serializes `status` to TOML and writes it to `path`.
/// Creates the parent directory if it does not exist.
/// Logs errors rather than panicking; a status write failure must
/// never crash the daemon.
pub fn write_status(path: &Path, status: &DaemonStatus) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            error!("Failed to create directory {}: {e}", parent.display());
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                error!("Failed to write status file: {e}");
            }
        }
        Err(e) => error!("Failed to serialize status: {e}"),
    }
}
