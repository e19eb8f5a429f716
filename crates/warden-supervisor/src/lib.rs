//! Process supervision and the service lifecycle.
//!
//! * [`process`] – spawn, poll and stop one process ([`ProcessControl`]).
//! * [`resolver`] – dependency ordering and cycle detection.
//! * [`instance`] – the lock-protected table of running instances.
//! * [`orchestrator`] – `initialize_all` / `shutdown_all` / `status` /
//!   `health_check_all` over a whole configuration.
//! * [`watchdog`] – periodic crash detection.
//! * [`bus`] – lifecycle event broadcast.

pub mod bus;
pub mod instance;
pub mod orchestrator;
pub mod process;
pub mod resolver;
pub mod watchdog;

#[cfg(test)]
mod testing;

pub use bus::{LifecycleBus, LifecycleReceiver};
pub use instance::{Instance, InstanceTable};
pub use orchestrator::{CheckReport, InitReport, Orchestrator, ServiceFailure, ShutdownReport};
pub use process::{ExitInfo, LaunchSpec, ProcessControl, ProcessHandle, StopOutcome, UnixProcessControl};
pub use resolver::{DependencyError, DependencyResolver};
pub use watchdog::Watchdog;
