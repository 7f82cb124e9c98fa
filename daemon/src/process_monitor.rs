use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use sysinfo::{ProcessesToUpdate, System};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error};

use crate::event::DaemonEvent;
use crate::registry::{canonical_name, InstanceId};

const POLL_INTERVAL_MS: u64 = 500;

/// Canonical names of the currently registered applications.  Written by the
/// event loop after every (re)load, read by the watcher on each poll.
pub type WatchedNames = Arc<RwLock<HashSet<String>>>;

/// Synchronous "which instances of these applications are running right now"
/// query.
pub trait ProcessSource: Send {
    /// Live instances keyed by canonical name, taken from one scan of the
    /// process table.  Names without a live instance are absent.
    fn running_instances(&mut self, names: &[String]) -> HashMap<String, Vec<InstanceId>>;
}

/// [`ProcessSource`] backed by the OS process table.
pub struct SystemProcesses {
    sys: System,
}

impl SystemProcesses {
    pub fn new() -> Self {
        Self { sys: System::new() }
    }
}

impl ProcessSource for SystemProcesses {
    fn running_instances(&mut self, names: &[String]) -> HashMap<String, Vec<InstanceId>> {
        self.sys.refresh_processes(ProcessesToUpdate::All, true);
        let mut live: HashMap<String, Vec<InstanceId>> = HashMap::new();
        for (pid, process) in self.sys.processes() {
            let name = canonical_name(&process.name().to_string_lossy());
            if names.contains(&name) {
                live.entry(name).or_default().push(pid.as_u32());
            }
        }
        for pids in live.values_mut() {
            pids.sort_unstable();
        }
        live
    }
}

/// Polls the OS process list every [`POLL_INTERVAL_MS`] milliseconds and emits
/// [`DaemonEvent::ProcessStarted`] / [`DaemonEvent::ProcessStopped`] for every
/// instance of a watched executable that appears or disappears.
///
/// The baseline is empty, so the first poll reports every live watched
/// instance.  That covers processes launched between the registration-time
/// reconciliation and the first poll; instances reconciliation already marked
/// running are absorbed by the registry.  Returns when the event loop goes
/// away or the platform is unsupported.
pub async fn run(watched: WatchedNames, tx: mpsc::Sender<DaemonEvent>) {
    if !sysinfo::IS_SUPPORTED_SYSTEM {
        error!("Process watching is not supported on this platform");
        return;
    }

    let mut sys = System::new();
    let mut known: HashMap<InstanceId, String> = HashMap::new();
    let mut ticker = interval(Duration::from_millis(POLL_INTERVAL_MS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        sys.refresh_processes(ProcessesToUpdate::All, true);
        let current = {
            let names = match watched.read() {
                Ok(names) => names,
                Err(poisoned) => poisoned.into_inner(),
            };
            snapshot(
                sys.processes()
                    .iter()
                    .map(|(pid, p)| (pid.as_u32(), p.name().to_string_lossy().into_owned())),
                &names,
            )
        };

        for evt in diff(&known, &current) {
            debug!("Process event: {evt:?}");
            if tx.send(evt).await.is_err() {
                return;
            }
        }
        known = current;
    }
}

/// Keeps the processes whose canonical name is watched.
fn snapshot<I>(processes: I, watched: &HashSet<String>) -> HashMap<InstanceId, String>
where
    I: IntoIterator<Item = (InstanceId, String)>,
{
    processes
        .into_iter()
        .map(|(pid, name)| (pid, canonical_name(&name)))
        .filter(|(_, name)| watched.contains(name))
        .collect()
}

/// Stop events first, then start events.  A PID reused under another name
/// yields a stop for the old name and a start for the new one.
pub(crate) fn diff(
    previous: &HashMap<InstanceId, String>,
    current: &HashMap<InstanceId, String>,
) -> Vec<DaemonEvent> {
    let mut stopped: Vec<(InstanceId, &String)> = previous
        .iter()
        .filter(|&(pid, name)| current.get(pid) != Some(name))
        .map(|(pid, name)| (*pid, name))
        .collect();
    let mut started: Vec<(InstanceId, &String)> = current
        .iter()
        .filter(|&(pid, name)| previous.get(pid) != Some(name))
        .map(|(pid, name)| (*pid, name))
        .collect();
    stopped.sort();
    started.sort();

    stopped
        .into_iter()
        .map(|(instance, name)| DaemonEvent::ProcessStopped { name: name.clone(), instance })
        .chain(
            started
                .into_iter()
                .map(|(instance, name)| DaemonEvent::ProcessStarted { name: name.clone(), instance }),
        )
        .collect()
}

/// True when another process runs under this executable's name.
pub fn another_instance_running() -> bool {
    let Some(exe_name) = std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_os_string()))
    else {
        return false;
    };
    let me = sysinfo::get_current_pid().ok();

    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);
    sys.processes()
        .iter()
        .any(|(pid, p)| Some(*pid) != me && p.name() == exe_name.as_os_str())
}
