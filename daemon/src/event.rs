use crate::config::Config;
use crate::devices::DeviceSet;
use crate::executor::ExecError;
use crate::registry::InstanceId;
use crate::scheduler::CommandId;

#[derive(Debug)]
pub enum DaemonEvent {
    /// A process with a watched name appeared. `name` is canonical.
    ProcessStarted { name: String, instance: InstanceId },
    /// A process with a watched name exited.
    ProcessStopped { name: String, instance: InstanceId },
    /// A scheduler timer elapsed. Ignored if the command was cancelled meanwhile.
    TimerFired(CommandId),
    /// The device-assignment tool returned for `application`.
    CommandFinished {
        application: String,
        device: String,
        result: Result<i32, ExecError>,
    },
    /// The config file changed on disk and was re-parsed; devices were re-discovered.
    ConfigReloaded { config: Config, devices: DeviceSet },
    /// Re-derive running state from the live process list.
    ResetRequested,
    /// Ctrl+C received; halt all timers and exit.
    Shutdown,
}
