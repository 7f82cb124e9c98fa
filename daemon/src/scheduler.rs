/// One-shot delayed device-assignment commands.
///
/// Each armed command gets a small timer task that sleeps until its deadline
/// and then posts [`DaemonEvent::TimerFired`] back to the event loop.  The
/// table of pending commands is owned by the event loop; a command only fires
/// if its id is still present when that event is handled, so nothing fires
/// after [`Scheduler::cancel_all`] returns even if a timer already elapsed.
use std::collections::HashMap;
use std::fmt;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::debug;

use crate::event::DaemonEvent;
use crate::registry::clamp_delay;

/// Identifies a pending command.  Ids increase monotonically and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommand {
    pub application: String,
    pub device: String,
    pub fire_at: Instant,
}

struct Slot {
    command: PendingCommand,
    timer: JoinHandle<()>,
}

pub struct Scheduler {
    tx: mpsc::Sender<DaemonEvent>,
    pending: HashMap<CommandId, Slot>,
    next_id: u64,
    halted: bool,
}

impl Scheduler {
    pub fn new(tx: mpsc::Sender<DaemonEvent>) -> Self {
        Self {
            tx,
            pending: HashMap::new(),
            next_id: 0,
            halted: false,
        }
    }

    /// Arms a command that fires after `delay_secs`.  Returns `None` while halted.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn arm(&mut self, application: &str, device: &str, delay_secs: f64) -> Option<CommandId> {
        if self.halted {
            debug!("Scheduler halted; not arming command for '{application}'");
            return None;
        }

        let id = CommandId(self.next_id);
        self.next_id += 1;

        let fire_at = Instant::now() + Duration::from_secs_f64(clamp_delay(delay_secs));
        let tx = self.tx.clone();
        let timer = tokio::spawn(async move {
            sleep_until(fire_at).await;
            let _ = tx.send(DaemonEvent::TimerFired(id)).await;
        });

        debug!("Armed command {id} for '{application}' -> '{device}' in {delay_secs:.3}s");
        self.pending.insert(
            id,
            Slot {
                command: PendingCommand {
                    application: application.to_string(),
                    device: device.to_string(),
                    fire_at,
                },
                timer,
            },
        );
        Some(id)
    }

    /// Removes and returns the command for an elapsed timer.  `None` means the
    /// command was cancelled after the timer elapsed.
    pub fn fire(&mut self, id: CommandId) -> Option<PendingCommand> {
        self.pending.remove(&id).map(|slot| slot.command)
    }

    /// Aborts every armed timer and clears the table.  Returns the number of
    /// commands cancelled.
    pub fn cancel_all(&mut self) -> usize {
        let cancelled = self.pending.len();
        for (_, slot) in self.pending.drain() {
            slot.timer.abort();
        }
        if cancelled > 0 {
            debug!("Cancelled {cancelled} pending command(s)");
        }
        cancelled
    }

    /// Cancels everything and refuses further arms until [`Scheduler::resume`].
    pub fn halt(&mut self) -> usize {
        self.halted = true;
        self.cancel_all()
    }

    pub fn resume(&mut self) {
        self.halted = false;
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
