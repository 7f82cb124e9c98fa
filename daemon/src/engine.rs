/// Process event reconciler.
///
/// The `Engine` owns the registry and the scheduler and is driven by a single
/// consumer of the daemon event queue, so every mutation of either is
/// serialized without locks.  Device-assignment commands run elsewhere and
/// report back through the same queue.
use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{AppEntry, Config, GlobalConfig};
use crate::devices::DeviceSet;
use crate::event::DaemonEvent;
use crate::executor::{self, DeviceExecutor, ExecError};
use crate::process_monitor::{ProcessSource, WatchedNames};
use crate::registry::{canonical_name, Assignment, InstanceId, RegisterOutcome, Registry};
use crate::scheduler::{CommandId, Scheduler};

/// Builds the executor for a given global config (the tool path may change on reload).
pub type ExecutorFactory = Box<dyn Fn(&GlobalConfig) -> Arc<dyn DeviceExecutor> + Send>;

pub struct Engine<P: ProcessSource> {
    registry: Registry,
    scheduler: Scheduler,
    devices: DeviceSet,
    processes: P,
    make_executor: ExecutorFactory,
    executor: Arc<dyn DeviceExecutor>,
    watched: WatchedNames,
    tx: mpsc::Sender<DaemonEvent>,
}

impl<P: ProcessSource> Engine<P> {
    pub fn new(
        processes: P,
        make_executor: ExecutorFactory,
        watched: WatchedNames,
        tx: mpsc::Sender<DaemonEvent>,
    ) -> Self {
        let executor = make_executor(&GlobalConfig::default());
        Self {
            registry: Registry::new(),
            scheduler: Scheduler::new(tx.clone()),
            devices: DeviceSet::default(),
            processes,
            make_executor,
            executor,
            watched,
            tx,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn pending_commands(&self) -> usize {
        self.scheduler.pending_len()
    }

    /// Handles one event.  Returns false once the daemon should exit.
    pub fn handle(&mut self, event: DaemonEvent) -> bool {
        match event {
            DaemonEvent::ProcessStarted { name, instance } => self.process_started(&name, instance),
            DaemonEvent::ProcessStopped { name, instance } => self.process_stopped(&name, instance),
            DaemonEvent::TimerFired(id) => self.timer_fired(id),
            DaemonEvent::CommandFinished { application, device, result } => {
                self.command_finished(&application, &device, result)
            }
            DaemonEvent::ConfigReloaded { config, devices } => self.reload(&config, devices),
            DaemonEvent::ResetRequested => self.reset_all(),
            DaemonEvent::Shutdown => {
                self.shutdown();
                return false;
            }
        }
        true
    }

    /// Discards all state and rebuilds it from `config`.  Pending commands
    /// from the previous configuration are cancelled first.
    pub fn reload(&mut self, config: &Config, devices: DeviceSet) {
        self.scheduler.cancel_all();
        self.registry = Registry::new();
        self.devices = devices;
        self.executor = (self.make_executor)(&config.global);
        self.scheduler.resume();

        self.register_all(&config.entries());
        if self.registry.is_empty() {
            warn!("No valid applications registered");
        } else {
            info!(
                "Watching {} application(s), {} command(s) pending",
                self.registry.len(),
                self.pending_commands()
            );
        }
    }

    /// Registers `entries` in order, then reconciles every added or updated
    /// application with the live process list in one pass.
    pub fn register_all(&mut self, entries: &[AppEntry]) -> Vec<RegisterOutcome> {
        let mut to_reconcile: Vec<String> = Vec::new();
        let outcomes = entries
            .iter()
            .map(|entry| {
                let outcome = self.registry.register(
                    &entry.name,
                    &entry.device,
                    entry.delay_secs,
                    &self.devices,
                );
                let canonical = canonical_name(&entry.name);
                if outcome.needs_reconcile() && !to_reconcile.contains(&canonical) {
                    to_reconcile.push(canonical);
                }
                outcome
            })
            .collect();
        self.reconcile(&to_reconcile);
        self.publish_watched();
        outcomes
    }

    /// Replays a start for every live instance of `names`, from a single scan
    /// of the process table.
    fn reconcile(&mut self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        let live = self.processes.running_instances(names);
        for name in names {
            for &instance in live.get(name).into_iter().flatten() {
                self.process_started(name, instance);
            }
        }
    }

    pub fn process_started(&mut self, name: &str, instance: InstanceId) {
        let canonical = canonical_name(name);
        if !self.registry.mark_running(&canonical, instance) {
            return;
        }
        let Some(app) = self.registry.get(&canonical) else {
            return;
        };
        info!("Found new process running: '{canonical}' ({instance})");
        let (device, delay) = (app.device.clone(), app.delay_secs);
        self.scheduler.arm(&canonical, &device, delay);
    }

    /// A stop never cancels an armed command; it only updates running state.
    pub fn process_stopped(&mut self, name: &str, instance: InstanceId) {
        let canonical = canonical_name(name);
        if self.registry.mark_stopped(&canonical, instance) {
            info!("Process '{canonical}' has ended");
        } else {
            debug!("Ignoring stop of '{canonical}' ({instance}): not the tracked instance");
        }
    }

    fn timer_fired(&mut self, id: CommandId) {
        match self.scheduler.fire(id) {
            Some(command) => {
                let late = Instant::now().saturating_duration_since(command.fire_at);
                debug!("Firing command {id} for '{}' ({late:?} late)", command.application);
                executor::dispatch(Arc::clone(&self.executor), command, self.tx.clone())
            }
            None => debug!("Ignoring cancelled command {id}"),
        }
    }

    fn command_finished(&mut self, application: &str, device: &str, result: Result<i32, ExecError>) {
        let at = chrono::Local::now().to_rfc3339();
        let device = device.to_string();
        let assignment = if executor::report(application, &device, &result) {
            Assignment::Succeeded { device, at }
        } else {
            Assignment::Failed { device, code: result.ok(), at }
        };
        self.registry.record_assignment(application, assignment);
    }

    /// Cancels pending commands, clears running state and replays a start for
    /// every live instance of every registered application.
    pub fn reset_all(&mut self) {
        info!("Resetting process state");
        self.scheduler.cancel_all();
        self.registry.reset_all();

        let names: Vec<String> = self.registry.names().map(str::to_string).collect();
        self.reconcile(&names);
    }

    /// Halts the scheduler; no command fires after this returns.
    pub fn shutdown(&mut self) {
        let cancelled = self.scheduler.halt();
        info!("Stopped scheduler ({cancelled} pending command(s) cancelled)");
    }

    fn publish_watched(&self) {
        let names: HashSet<String> = self.registry.names().map(str::to_string).collect();
        match self.watched.write() {
            Ok(mut guard) => *guard = names,
            Err(poisoned) => *poisoned.into_inner() = names,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, RwLock};
    use tokio::time::{sleep, Duration};

    use crate::config::ApplicationConfig;
    use crate::process_monitor;

    type Calls = Arc<Mutex<Vec<(String, String)>>>;
    type Live = Arc<Mutex<HashMap<String, Vec<InstanceId>>>>;

    struct FakeProcesses {
        live: Live,
        scans: Arc<AtomicUsize>,
    }

    impl ProcessSource for FakeProcesses {
        fn running_instances(&mut self, names: &[String]) -> HashMap<String, Vec<InstanceId>> {
            self.scans.fetch_add(1, Ordering::SeqCst);
            let live = self.live.lock().unwrap();
            names
                .iter()
                .filter_map(|n| live.get(n).map(|pids| (n.clone(), pids.clone())))
                .collect()
        }
    }

    struct Recorder {
        calls: Calls,
        exit_code: i32,
    }

    impl DeviceExecutor for Recorder {
        fn execute(&self, application: &str, device: &str) -> Result<i32, ExecError> {
            self.calls
                .lock()
                .unwrap()
                .push((application.to_string(), device.to_string()));
            Ok(self.exit_code)
        }
    }

    struct Harness {
        engine: Engine<FakeProcesses>,
        rx: mpsc::Receiver<DaemonEvent>,
        calls: Calls,
        live: Live,
        scans: Arc<AtomicUsize>,
        watched: WatchedNames,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_exit_code(0)
        }

        fn with_exit_code(exit_code: i32) -> Self {
            let (tx, rx) = mpsc::channel(64);
            let calls: Calls = Arc::default();
            let live: Live = Arc::default();
            let scans: Arc<AtomicUsize> = Arc::default();
            let watched: WatchedNames = Arc::new(RwLock::new(HashSet::new()));
            let recorder: Arc<dyn DeviceExecutor> =
                Arc::new(Recorder { calls: Arc::clone(&calls), exit_code });
            let engine = Engine::new(
                FakeProcesses { live: Arc::clone(&live), scans: Arc::clone(&scans) },
                Box::new(move |_: &GlobalConfig| Arc::clone(&recorder)),
                Arc::clone(&watched),
                tx,
            );
            let mut h = Self { engine, rx, calls, live, scans, watched };
            h.engine.devices = DeviceSet::from_names(["Headset", "Speakers"]);
            h
        }

        fn register(&mut self, name: &str, device: &str, delay_secs: f64) -> RegisterOutcome {
            let entry = AppEntry { name: name.into(), device: device.into(), delay_secs };
            self.engine.register_all(&[entry]).remove(0)
        }

        fn set_live(&self, name: &str, instances: &[InstanceId]) {
            self.live.lock().unwrap().insert(name.to_string(), instances.to_vec());
        }

        fn start(&mut self, name: &str, instance: InstanceId) {
            self.engine.handle(DaemonEvent::ProcessStarted { name: name.into(), instance });
        }

        fn stop(&mut self, name: &str, instance: InstanceId) {
            self.engine.handle(DaemonEvent::ProcessStopped { name: name.into(), instance });
        }

        /// Advances simulated time by `secs`, then feeds queued events back
        /// into the engine until every dispatched command has reported back.
        async fn run_for(&mut self, secs: f64) {
            sleep(Duration::from_secs_f64(secs)).await;
            let mut in_flight = 0usize;
            loop {
                let evt = if in_flight > 0 {
                    self.rx.recv().await.expect("event channel closed")
                } else {
                    match self.rx.try_recv() {
                        Ok(evt) => evt,
                        Err(_) => break,
                    }
                };
                match &evt {
                    DaemonEvent::TimerFired(_) => {
                        let before = self.engine.pending_commands();
                        self.engine.handle(evt);
                        if self.engine.pending_commands() < before {
                            in_flight += 1;
                        }
                    }
                    DaemonEvent::CommandFinished { .. } => {
                        in_flight -= 1;
                        self.engine.handle(evt);
                    }
                    _ => {
                        self.engine.handle(evt);
                    }
                }
            }
        }

        fn scans(&self) -> usize {
            self.scans.load(Ordering::SeqCst)
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    fn call(app: &str, device: &str) -> (String, String) {
        (app.to_string(), device.to_string())
    }

    // ── registration & reconciliation ─────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn register_already_running_schedules_exactly_one_command() {
        let mut h = Harness::new();
        h.set_live("game.exe", &[100]);

        assert_eq!(h.register("Game", "Headset", 1.0), RegisterOutcome::Added);
        assert_eq!(h.engine.pending_commands(), 1);
        assert!(h.engine.registry().get("game.exe").unwrap().running);

        h.run_for(1.5).await;
        assert_eq!(h.calls(), vec![call("game.exe", "Headset")]);
    }

    #[tokio::test(start_paused = true)]
    async fn register_with_two_live_instances_arms_once() {
        let mut h = Harness::new();
        h.set_live("game.exe", &[100, 101]);
        h.register("game.exe", "Headset", 0.0);
        assert_eq!(h.engine.pending_commands(), 1);
        assert_eq!(h.engine.registry().get("game.exe").unwrap().active_instance, Some(100));
    }

    #[tokio::test(start_paused = true)]
    async fn reregister_same_device_is_a_noop() {
        let mut h = Harness::new();
        h.set_live("game.exe", &[100]);
        h.register("game.exe", "Headset", 1.0);
        h.run_for(2.0).await;

        assert_eq!(h.register("game.exe", "Headset", 1.0), RegisterOutcome::Unchanged);
        assert_eq!(h.engine.pending_commands(), 0);
        assert!(h.engine.registry().get("game.exe").unwrap().running);

        h.run_for(5.0).await;
        assert_eq!(h.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reregister_new_device_uses_it_for_later_starts() {
        let mut h = Harness::new();
        h.register("game.exe", "Headset", 1.0);
        h.start("game.exe", 100);
        h.run_for(2.0).await;

        // Still running: the reconciliation pass re-arms with the new device.
        h.set_live("game.exe", &[100]);
        assert_eq!(h.register("game.exe", "Speakers", 1.0), RegisterOutcome::Updated);
        h.run_for(2.0).await;

        h.stop("game.exe", 100);
        h.set_live("game.exe", &[]);
        h.start("game.exe", 200);
        h.run_for(2.0).await;

        assert_eq!(
            h.calls(),
            vec![
                call("game.exe", "Headset"),
                call("game.exe", "Speakers"),
                call("game.exe", "Speakers"),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn first_watcher_poll_covers_process_started_after_registration() {
        let mut h = Harness::new();
        h.register("game.exe", "Headset", 1.0);
        assert_eq!(h.engine.pending_commands(), 0);

        // game.exe launched before the watcher's first poll.
        let live = HashMap::from([(100, "game.exe".to_string())]);
        for evt in process_monitor::diff(&HashMap::new(), &live) {
            h.engine.handle(evt);
        }
        assert_eq!(h.engine.pending_commands(), 1);

        h.run_for(1.5).await;
        assert_eq!(h.calls(), vec![call("game.exe", "Headset")]);
    }

    #[tokio::test(start_paused = true)]
    async fn first_watcher_poll_does_not_rearm_reconciled_instances() {
        let mut h = Harness::new();
        h.set_live("game.exe", &[100, 101]);
        h.register("game.exe", "Headset", 1.0);
        assert_eq!(h.engine.pending_commands(), 1);

        let live = HashMap::from([(100, "game.exe".to_string()), (101, "game.exe".to_string())]);
        for evt in process_monitor::diff(&HashMap::new(), &live) {
            h.engine.handle(evt);
        }
        assert_eq!(h.engine.pending_commands(), 1);

        h.run_for(1.5).await;
        assert_eq!(h.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn register_rejects_invalid_device() {
        let mut h = Harness::new();
        h.set_live("game.exe", &[100]);
        assert_eq!(h.register("game.exe", "Nope", 1.0), RegisterOutcome::Rejected);
        assert_eq!(h.engine.pending_commands(), 0);
        assert!(h.engine.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn register_publishes_watched_names() {
        let mut h = Harness::new();
        h.register("Game", "Headset", 1.0);
        assert!(h.watched.read().unwrap().contains("game.exe"));
    }

    // ── start / stop events ───────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn start_event_fires_after_delay() {
        let mut h = Harness::new();
        h.register("game.exe", "Headset", 2.0);
        h.start("game.exe", 100);

        h.run_for(1.9).await;
        assert!(h.calls().is_empty());

        h.run_for(0.2).await;
        assert_eq!(h.calls(), vec![call("game.exe", "Headset")]);

        h.run_for(10.0).await;
        assert_eq!(h.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_start_events_execute_once() {
        let mut h = Harness::new();
        h.register("game.exe", "Headset", 2.0);
        h.start("game.exe", 100);
        h.start("GAME.EXE", 100);

        h.run_for(3.0).await;
        assert_eq!(h.calls(), vec![call("game.exe", "Headset")]);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_process_is_ignored() {
        let mut h = Harness::new();
        h.start("other.exe", 1);
        assert_eq!(h.engine.pending_commands(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_stop_after_restart_is_a_noop() {
        let mut h = Harness::new();
        h.register("game.exe", "Headset", 0.0);
        h.start("game.exe", 100);
        h.stop("game.exe", 100);
        h.start("game.exe", 101);
        h.stop("game.exe", 100);

        let app = h.engine.registry().get("game.exe").unwrap();
        assert!(app.running);
        assert_eq!(app.active_instance, Some(101));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_delay_does_not_cancel_command() {
        let mut h = Harness::new();
        h.register("browser.exe", "Speakers", 1.0);
        h.start("browser.exe", 7);
        h.run_for(0.5).await;
        h.stop("browser.exe", 7);

        assert!(!h.engine.registry().get("browser.exe").unwrap().running);
        h.run_for(1.0).await;
        assert_eq!(h.calls(), vec![call("browser.exe", "Speakers")]);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_stop_schedules_again() {
        let mut h = Harness::new();
        h.register("game.exe", "Headset", 0.5);
        h.start("game.exe", 100);
        h.run_for(1.0).await;
        h.stop("game.exe", 100);
        h.start("game.exe", 101);
        h.run_for(1.0).await;
        assert_eq!(h.calls().len(), 2);
    }

    // ── execution results ─────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn failed_command_keeps_running_state_and_does_not_retry() {
        let mut h = Harness::with_exit_code(5);
        h.register("game.exe", "Headset", 1.0);
        h.start("game.exe", 100);
        h.run_for(2.0).await;

        let app = h.engine.registry().get("game.exe").unwrap();
        assert!(app.running);
        assert!(matches!(
            app.last_assignment,
            Some(Assignment::Failed { code: Some(5), .. })
        ));

        h.run_for(30.0).await;
        assert_eq!(h.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_command_is_recorded() {
        let mut h = Harness::new();
        h.register("game.exe", "Headset", 0.0);
        h.start("game.exe", 100);
        h.run_for(0.1).await;
        assert!(matches!(
            h.engine.registry().get("game.exe").unwrap().last_assignment,
            Some(Assignment::Succeeded { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn applications_fire_independently() {
        let mut h = Harness::new();
        h.register("game.exe", "Headset", 2.0);
        h.register("browser.exe", "Speakers", 1.0);
        h.start("game.exe", 1);
        h.start("browser.exe", 2);

        h.run_for(1.5).await;
        assert_eq!(h.calls(), vec![call("browser.exe", "Speakers")]);
        h.run_for(1.0).await;
        assert_eq!(h.calls().len(), 2);
    }

    // ── cancellation, reset, reload, shutdown ─────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn shutdown_prevents_due_commands_from_firing() {
        let mut h = Harness::new();
        h.register("game.exe", "Headset", 1.0);
        h.start("game.exe", 100);

        // The timer elapses and queues its event before shutdown is handled.
        sleep(Duration::from_secs(2)).await;
        assert!(!h.engine.handle(DaemonEvent::Shutdown));

        h.run_for(5.0).await;
        assert!(h.calls().is_empty());

        h.stop("game.exe", 100);
        h.start("game.exe", 101);
        assert_eq!(h.engine.pending_commands(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_rearms_live_instances_and_drops_stale_pending() {
        let mut h = Harness::new();
        h.register("game.exe", "Headset", 1.0);
        h.register("browser.exe", "Speakers", 1.0);
        h.start("game.exe", 100);
        h.start("browser.exe", 7);
        assert_eq!(h.engine.pending_commands(), 2);

        // browser.exe exited without a stop event reaching us.
        h.set_live("game.exe", &[100]);
        h.engine.handle(DaemonEvent::ResetRequested);

        assert_eq!(h.engine.pending_commands(), 1);
        assert!(h.engine.registry().get("game.exe").unwrap().running);
        assert!(!h.engine.registry().get("browser.exe").unwrap().running);
        assert_eq!(h.scans(), 1);

        h.run_for(2.0).await;
        assert_eq!(h.calls(), vec![call("game.exe", "Headset")]);
    }

    #[tokio::test(start_paused = true)]
    async fn reload_rebuilds_registry_and_cancels_pending() {
        let mut h = Harness::new();
        h.register("game.exe", "Headset", 1.0);
        h.start("game.exe", 100);

        let config = Config {
            applications: vec![
                ApplicationConfig {
                    name: Some("browser.exe".into()),
                    device: Some("Speakers".into()),
                    delay_secs: Some(toml::Value::Float(0.5)),
                },
                ApplicationConfig {
                    name: Some("broken.exe".into()),
                    device: None,
                    delay_secs: None,
                },
            ],
            ..Config::default()
        };
        h.set_live("browser.exe", &[7]);
        h.engine.handle(DaemonEvent::ConfigReloaded {
            config,
            devices: DeviceSet::from_names(["Speakers"]),
        });

        assert!(h.engine.registry().get("game.exe").is_none());
        assert_eq!(h.engine.registry().len(), 1);
        assert_eq!(*h.watched.read().unwrap(), HashSet::from(["browser.exe".to_string()]));

        h.run_for(2.0).await;
        assert_eq!(h.calls(), vec![call("browser.exe", "Speakers")]);
    }

    #[tokio::test(start_paused = true)]
    async fn reload_scans_process_table_once() {
        let mut h = Harness::new();
        let entry = |name: &str, device: &str| ApplicationConfig {
            name: Some(name.into()),
            device: Some(device.into()),
            delay_secs: None,
        };
        let config = Config {
            applications: vec![
                entry("game.exe", "Headset"),
                entry("browser.exe", "Speakers"),
                entry("chat.exe", "Speakers"),
                entry("game.exe", "Speakers"),
            ],
            ..Config::default()
        };
        h.set_live("game.exe", &[100]);
        h.set_live("chat.exe", &[5]);
        h.engine.reload(&config, DeviceSet::from_names(["Headset", "Speakers"]));

        assert_eq!(h.scans(), 1);
        assert_eq!(h.engine.pending_commands(), 2);

        h.run_for(2.0).await;
        let mut calls = h.calls();
        calls.sort();
        assert_eq!(calls, vec![call("chat.exe", "Speakers"), call("game.exe", "Speakers")]);
    }

    #[tokio::test(start_paused = true)]
    async fn reload_after_shutdown_resumes_scheduling() {
        let mut h = Harness::new();
        h.engine.shutdown();

        let config = Config {
            applications: vec![ApplicationConfig {
                name: Some("game.exe".into()),
                device: Some("Headset".into()),
                delay_secs: None,
            }],
            ..Config::default()
        };
        h.set_live("game.exe", &[1]);
        h.engine.reload(&config, DeviceSet::from_names(["Headset"]));
        assert_eq!(h.engine.pending_commands(), 1);
    }
}
