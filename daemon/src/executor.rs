/// Device-assignment boundary: invokes SoundVolumeView for one application.
///
/// Commands run on Tokio's blocking pool so a slow or hanging tool never
/// stalls the event loop.  The outcome is posted back as
/// [`DaemonEvent::CommandFinished`].
use std::io;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::event::DaemonEvent;
use crate::scheduler::PendingCommand;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to launch '{tool}': {source}")]
    Launch {
        tool: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to wait for '{tool}': {source}")]
    Wait {
        tool: String,
        #[source]
        source: io::Error,
    },
    #[error("'{tool}' was terminated without an exit code")]
    Terminated { tool: String },
    #[error("'{tool}' did not finish within {timeout:?} and was killed")]
    TimedOut { tool: String, timeout: Duration },
    #[error("executor task aborted: {0}")]
    Aborted(String),
}

/// Assigns `device` as the output device of `application` and returns the
/// tool's exit code.  Zero means success.
pub trait DeviceExecutor: Send + Sync + 'static {
    fn execute(&self, application: &str, device: &str) -> Result<i32, ExecError>;
}

/// How long SoundVolumeView may run before it is killed.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
const WAIT_POLL: Duration = Duration::from_millis(20);

/// Runs `SoundVolumeView.exe /SetAppDefault "<device>" 0 "<application>"`.
#[derive(Debug, Clone)]
pub struct SoundVolumeView {
    tool: String,
}

impl SoundVolumeView {
    pub fn new(tool: impl Into<String>) -> Self {
        Self { tool: tool.into() }
    }
}

impl DeviceExecutor for SoundVolumeView {
    fn execute(&self, application: &str, device: &str) -> Result<i32, ExecError> {
        // Role 0 = console; SoundVolumeView applies it to all roles for app defaults.
        let mut child = Command::new(&self.tool)
            .arg("/SetAppDefault")
            .arg(device)
            .arg("0")
            .arg(application)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| ExecError::Launch { tool: self.tool.clone(), source })?;
        wait_for(&mut child, &self.tool, COMMAND_TIMEOUT)
    }
}

/// Waits for `child` to exit and returns its exit code.  A child still running
/// after `timeout` is killed, so a hung tool cannot pin a blocking thread
/// (and with it, runtime shutdown).
fn wait_for(child: &mut Child, tool: &str, timeout: Duration) -> Result<i32, ExecError> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                return status
                    .code()
                    .ok_or_else(|| ExecError::Terminated { tool: tool.to_string() })
            }
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ExecError::TimedOut { tool: tool.to_string(), timeout });
            }
            Ok(None) => std::thread::sleep(WAIT_POLL),
            Err(source) => return Err(ExecError::Wait { tool: tool.to_string(), source }),
        }
    }
}

/// Runs `command` off the event loop and reports the result to `tx`.
pub fn dispatch(
    executor: Arc<dyn DeviceExecutor>,
    command: PendingCommand,
    tx: mpsc::Sender<DaemonEvent>,
) {
    tokio::spawn(async move {
        let PendingCommand { application, device, .. } = command;
        let (app, dev) = (application.clone(), device.clone());
        let result = tokio::task::spawn_blocking(move || executor.execute(&app, &dev))
            .await
            .unwrap_or_else(|e| Err(ExecError::Aborted(e.to_string())));
        let _ = tx
            .send(DaemonEvent::CommandFinished { application, device, result })
            .await;
    });
}

/// Logs the outcome of a finished command.  Returns true on success.
pub fn report(application: &str, device: &str, result: &Result<i32, ExecError>) -> bool {
    match result {
        Ok(0) => {
            info!("Set audio device of application '{application}' to '{device}'");
            true
        }
        Ok(code) => {
            warn!(
                "SoundVolumeView failed to set audio device '{device}' for application '{application}'. Error code: {code}"
            );
            false
        }
        Err(e) => {
            warn!("Could not set audio device '{device}' for application '{application}': {e}");
            false
        }
    }
}
