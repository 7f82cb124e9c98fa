/// In-memory table of watched applications and their live process state.
///
/// Keys are canonical process names (see [`canonical_name`]).  The registry is
/// owned by the event loop and only mutated through the operations below; it
/// is discarded and rebuilt on every config reload.
use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::devices::DeviceSet;

pub const EXE_SUFFIX: &str = ".exe";
pub const MIN_DELAY_SECS: f64 = 0.0;
pub const MAX_DELAY_SECS: f64 = 60.0;

/// Opaque identifier of one running occurrence of a process (the OS PID).
pub type InstanceId = u32;

/// Lower-cases `name` and appends `.exe` when it is missing.
pub fn canonical_name(name: &str) -> String {
    let mut canonical = name.trim().to_lowercase();
    if !canonical.ends_with(EXE_SUFFIX) {
        canonical.push_str(EXE_SUFFIX);
    }
    canonical
}

/// Clamps a delay to [[`MIN_DELAY_SECS`], [`MAX_DELAY_SECS`]].  NaN maps to 0.
pub fn clamp_delay(secs: f64) -> f64 {
    if secs.is_nan() {
        return MIN_DELAY_SECS;
    }
    secs.clamp(MIN_DELAY_SECS, MAX_DELAY_SECS)
}

/// Result of the last device-assignment command issued for an application.
#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    Succeeded { device: String, at: String },
    Failed { device: String, code: Option<i32>, at: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchedApplication {
    pub device: String,
    pub delay_secs: f64,
    pub running: bool,
    /// Only meaningful while `running` is true.
    pub active_instance: Option<InstanceId>,
    pub last_assignment: Option<Assignment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Added,
    Updated,
    /// Already registered with the same device; nothing changed.
    Unchanged,
    /// The device is not in the valid-device set.
    Rejected,
}

impl RegisterOutcome {
    /// True when the entry was (re)created and the process list must be checked.
    pub fn needs_reconcile(self) -> bool {
        matches!(self, RegisterOutcome::Added | RegisterOutcome::Updated)
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    apps: BTreeMap<String, WatchedApplication>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or updates `name`.  The returned outcome tells the caller whether a
    /// reconciliation pass against the live process list is required.
    pub fn register(
        &mut self,
        name: &str,
        device: &str,
        delay_secs: f64,
        valid_devices: &DeviceSet,
    ) -> RegisterOutcome {
        if !valid_devices.contains(device) {
            warn!(
                "Application '{name}' has an invalid device '{device}'. Allowed devices are: {valid_devices}"
            );
            return RegisterOutcome::Rejected;
        }

        let key = canonical_name(name);
        let outcome = match self.apps.get(&key) {
            Some(existing) if existing.device == device => return RegisterOutcome::Unchanged,
            Some(_) => RegisterOutcome::Updated,
            None => RegisterOutcome::Added,
        };

        self.apps.insert(
            key,
            WatchedApplication {
                device: device.to_string(),
                delay_secs: clamp_delay(delay_secs),
                running: false,
                active_instance: None,
                last_assignment: None,
            },
        );

        match outcome {
            RegisterOutcome::Added => info!("Added app: {name}"),
            _ => info!("Updated app: {name}"),
        }
        outcome
    }

    /// Returns true when the caller must schedule a command for this start.
    pub fn mark_running(&mut self, name: &str, instance: InstanceId) -> bool {
        let Some(app) = self.apps.get_mut(&canonical_name(name)) else {
            return false;
        };
        if app.running {
            return false;
        }
        app.running = true;
        app.active_instance = Some(instance);
        true
    }

    /// Clears the running state only if `instance` is the tracked one.
    pub fn mark_stopped(&mut self, name: &str, instance: InstanceId) -> bool {
        let Some(app) = self.apps.get_mut(&canonical_name(name)) else {
            return false;
        };
        if !app.running || app.active_instance != Some(instance) {
            return false;
        }
        app.running = false;
        app.active_instance = None;
        true
    }

    /// Marks every entry as not running, keeping device and delay.
    pub fn reset_all(&mut self) {
        for app in self.apps.values_mut() {
            app.running = false;
            app.active_instance = None;
        }
    }

    pub fn record_assignment(&mut self, name: &str, assignment: Assignment) {
        if let Some(app) = self.apps.get_mut(&canonical_name(name)) {
            app.last_assignment = Some(assignment);
        }
    }

    pub fn get(&self, name: &str) -> Option<&WatchedApplication> {
        self.apps.get(&canonical_name(name))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.apps.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &WatchedApplication)> {
        self.apps.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}
