//! [`RetryManager`] – start, wait for health, back off, try again.
//!
//! One attempt is a call to [`StartAttempt::start`] followed by polling
//! [`StartAttempt::poll`] every `check_interval` until it reports ready or
//! `startup_timeout` runs out. A failed start and a health timeout take the
//! same path: wait `policy.delay(k)` and retry, for at most
//! `policy.max_attempts()` attempts in total.
//!
//! Errors that are not retryable (see [`WardenError::is_retryable`]) end the
//! loop at once. A shutdown signal is honoured before every attempt, during
//! every backoff and between health polls, never in the middle of a request.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{info, warn};
use warden_types::{BackoffPolicy, WardenError};

use crate::clock::{Clock, TokioClock};

/// What one health poll observed.
#[derive(Debug, Clone, PartialEq)]
pub enum Readiness {
    Ready,
    /// Not ready yet; keep polling until the deadline.
    Pending,
    /// The attempt is lost (e.g. the process exited); stop polling.
    Failed(WardenError),
}

/// The per-service operations driven by [`RetryManager::attempt`].
#[async_trait]
pub trait StartAttempt: Send {
    /// Launch once. `attempt` is 1-based.
    async fn start(&mut self, attempt: u32) -> Result<(), WardenError>;

    /// One readiness poll after a successful start.
    async fn poll(&mut self) -> Readiness;

    /// Tear down a started attempt that never became healthy.
    async fn abort(&mut self) {}
}

/// Per-attempt health wait bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthWait {
    pub check_interval: Duration,
    pub startup_timeout: Duration,
}

/// Outcome of [`RetryManager::attempt`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome {
    pub success: bool,
    /// Attempts made, including the first.
    pub attempts: u32,
    /// Reason for the most recent failure; `None` on a first-try success.
    pub last_error: Option<WardenError>,
}

impl RetryOutcome {
    pub fn cancelled(&self) -> bool {
        matches!(self.last_error, Some(WardenError::Cancelled))
    }

    pub fn into_result(self) -> Result<u32, WardenError> {
        if self.success {
            Ok(self.attempts)
        } else {
            Err(self.last_error.unwrap_or(WardenError::Cancelled))
        }
    }
}

#[derive(Clone)]
pub struct RetryManager {
    policy: BackoffPolicy,
    clock: Arc<dyn Clock>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl std::fmt::Debug for RetryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryManager")
            .field("policy", &self.policy)
            .field("cancellable", &self.shutdown.is_some())
            .finish()
    }
}

impl RetryManager {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            clock: Arc::new(TokioClock),
            shutdown: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Abort between steps once `shutdown` reads `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Drive `target` until it is healthy, retries run out, a fatal error
    /// occurs or shutdown is requested.
    pub async fn attempt<A>(&self, service: &str, target: &mut A, wait: HealthWait) -> RetryOutcome
    where
        A: StartAttempt + ?Sized,
    {
        let mut last_error = None;
        let max_attempts = self.policy.max_attempts();

        for n in 0..max_attempts {
            if n > 0 && self.pause(self.policy.delay(n - 1)).await {
                return cancelled(n);
            }
            if self.is_shutting_down() {
                return cancelled(n);
            }

            let attempt = n + 1;
            if let Err(e) = target.start(attempt).await {
                if !e.is_retryable() {
                    warn!(service, attempt, error = %e, "Start failed; not retryable");
                    return RetryOutcome {
                        success: false,
                        attempts: attempt,
                        last_error: Some(e),
                    };
                }
                warn!(service, attempt, max_attempts, error = %e, "Start attempt failed");
                last_error = Some(e);
                continue;
            }

            match self.wait_healthy(service, target, wait).await {
                Ok(()) => {
                    info!(service, attempt, "Service healthy");
                    return RetryOutcome {
                        success: true,
                        attempts: attempt,
                        last_error,
                    };
                }
                Err(WardenError::Cancelled) => {
                    target.abort().await;
                    return cancelled(attempt);
                }
                Err(e) => {
                    warn!(service, attempt, max_attempts, error = %e, "Attempt did not become healthy");
                    target.abort().await;
                    if !e.is_retryable() {
                        return RetryOutcome {
                            success: false,
                            attempts: attempt,
                            last_error: Some(e),
                        };
                    }
                    last_error = Some(e);
                }
            }
        }

        RetryOutcome {
            success: false,
            attempts: max_attempts,
            last_error,
        }
    }

    /// Retry a plain fallible operation with the same backoff schedule.
    ///
    /// Used for registry reconnects. Non-retryable errors return at once.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, WardenError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, WardenError>>,
    {
        let max_attempts = self.policy.max_attempts();
        let mut last_error = WardenError::Cancelled;

        for n in 0..max_attempts {
            if n > 0 && self.pause(self.policy.delay(n - 1)).await {
                return Err(WardenError::Cancelled);
            }
            match op(n + 1).await {
                Ok(v) => return Ok(v),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(operation = what, attempt = n + 1, max_attempts, error = %e, "Operation failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn wait_healthy<A>(&self, service: &str, target: &mut A, wait: HealthWait) -> Result<(), WardenError>
    where
        A: StartAttempt + ?Sized,
    {
        let deadline = self.clock.now() + wait.startup_timeout;
        loop {
            match target.poll().await {
                Readiness::Ready => return Ok(()),
                Readiness::Failed(e) => return Err(e),
                Readiness::Pending => {}
            }

            let now = self.clock.now();
            if now >= deadline {
                return Err(WardenError::HealthCheck {
                    service: service.to_string(),
                    reason: format!("not healthy within {:?}", wait.startup_timeout),
                });
            }
            let nap = wait.check_interval.min(deadline - now);
            if self.pause(nap).await {
                return Err(WardenError::Cancelled);
            }
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Sleep for `duration`; `true` when shutdown cut the sleep short.
    async fn pause(&self, duration: Duration) -> bool {
        let Some(rx) = &self.shutdown else {
            self.clock.sleep(duration).await;
            return false;
        };
        if *rx.borrow() {
            return true;
        }
        let mut rx = rx.clone();
        let signalled = tokio::select! {
            _ = self.clock.sleep(duration) => None,
            res = rx.wait_for(|stop| *stop) => Some(res.is_ok()),
        };
        match signalled {
            Some(true) => true,
            Some(false) => {
                // Nobody can signal shutdown any more; wait out the delay.
                self.clock.sleep(duration).await;
                false
            }
            None => *rx.borrow(),
        }
    }
}

fn cancelled(attempts: u32) -> RetryOutcome {
    RetryOutcome {
        success: false,
        attempts,
        last_error: Some(WardenError::Cancelled),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
