//! Health probing and the retry loop that drives service startup.
//!
//! * [`health`] – one bounded HTTP check per call ([`HealthCheck`]).
//! * [`retry`] – [`RetryManager`], the single start-and-wait-for-health loop
//!   with exponential backoff, also reused for registry reconnects.
//! * [`clock`] – time source abstraction so backoff delays can be verified.

pub mod clock;
pub mod health;
pub mod retry;

#[cfg(any(test, feature = "test-support"))]
pub mod stub;

pub use clock::{Clock, FakeClock, TokioClock};
pub use health::{HealthCheck, HealthProbe, HttpHealthChecker};
pub use retry::{HealthWait, Readiness, RetryManager, RetryOutcome, StartAttempt};
