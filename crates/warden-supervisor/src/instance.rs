//! Runtime records of started services.
//!
//! [`InstanceTable`] owns every [`Instance`] behind one `RwLock`. Writers
//! hold the lock only for the duration of a single state change, never
//! across an `.await` on a process or network call. Readers get
//! [`ServiceStatus`] snapshots, never references.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;
use warden_types::{HealthState, ServiceClass, ServiceState, ServiceStatus, WardenError};

use crate::process::ProcessHandle;

#[derive(Debug, Clone)]
pub struct Instance {
    pub name: String,
    pub class: ServiceClass,
    pub state: ServiceState,
    pub health: HealthState,
    /// `None` for external services, one-shot tasks that finished, and
    /// between attempts.
    pub process: Option<ProcessHandle>,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<WardenError>,
    /// Registry id once registration succeeded.
    pub registration: Option<String>,
}

impl Instance {
    fn status(&self) -> ServiceStatus {
        ServiceStatus {
            name: self.name.clone(),
            class: self.class,
            state: self.state,
            health: self.health,
            pid: self.process.map(|p| p.pid),
            run_id: Some(self.run_id),
            started_at: Some(self.started_at),
            attempts: self.attempts,
            last_error: self.last_error.as_ref().map(ToString::to_string),
        }
    }

    fn transition(&mut self, next: ServiceState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            warn!(service = %self.name, from = %self.state, to = %next, "Rejected state transition");
            false
        }
    }
}

/// Name → instance map shared by every supervisor task.
#[derive(Debug, Clone, Default)]
pub struct InstanceTable {
    inner: Arc<RwLock<HashMap<String, Instance>>>,
}

impl InstanceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `name` for a new start.
    ///
    /// Fails when an instance of `name` is already starting, running or
    /// stopping. A failed or stopped record is replaced.
    pub async fn begin(&self, name: &str, class: ServiceClass) -> Result<Uuid, WardenError> {
        let mut map = self.inner.write().await;
        if let Some(existing) = map.get(name)
            && existing.state.is_active()
        {
            return Err(WardenError::Startup {
                service: name.to_string(),
                reason: format!("already {}", existing.state),
                retryable: false,
            });
        }
        let run_id = Uuid::new_v4();
        map.insert(
            name.to_string(),
            Instance {
                name: name.to_string(),
                class,
                state: ServiceState::Starting,
                health: HealthState::Unknown,
                process: None,
                run_id,
                started_at: Utc::now(),
                attempts: 0,
                last_error: None,
                registration: None,
            },
        );
        Ok(run_id)
    }

    /// Record the current attempt and the process it spawned, if any.
    pub async fn record_attempt(&self, name: &str, attempt: u32, process: Option<ProcessHandle>) {
        if let Some(inst) = self.inner.write().await.get_mut(name) {
            inst.attempts = attempt;
            inst.process = process;
            if attempt > 1 {
                inst.transition(ServiceState::Starting);
            }
        }
    }

    /// Forget the process of an attempt that was torn down.
    pub async fn clear_process(&self, name: &str) {
        if let Some(inst) = self.inner.write().await.get_mut(name) {
            inst.process = None;
        }
    }

    pub async fn record_error(&self, name: &str, error: WardenError) {
        if let Some(inst) = self.inner.write().await.get_mut(name) {
            inst.last_error = Some(error);
        }
    }

    pub async fn mark_running(&self, name: &str, process: Option<ProcessHandle>, health: HealthState) -> bool {
        let mut map = self.inner.write().await;
        let Some(inst) = map.get_mut(name) else {
            return false;
        };
        if !inst.transition(ServiceState::Running) {
            return false;
        }
        inst.process = process;
        inst.health = health;
        inst.last_error = None;
        true
    }

    /// Move to `Failed`. The process handle is cleared; the caller has
    /// already stopped it or found it dead.
    pub async fn mark_failed(&self, name: &str, error: WardenError) {
        if let Some(inst) = self.inner.write().await.get_mut(name) {
            inst.transition(ServiceState::Failed);
            inst.process = None;
            inst.health = HealthState::Unhealthy;
            inst.last_error = Some(error);
        }
    }

    /// Move to `Stopping` and hand back the process to stop and the registry
    /// id to withdraw. `None` when there is nothing to stop.
    pub async fn mark_stopping(&self, name: &str) -> Option<(Option<ProcessHandle>, Option<String>)> {
        let mut map = self.inner.write().await;
        let inst = map.get_mut(name)?;
        if !matches!(inst.state, ServiceState::Starting | ServiceState::Running) {
            return None;
        }
        inst.transition(ServiceState::Stopping);
        inst.health = HealthState::Unknown;
        inst.last_error = None;
        Some((inst.process.take(), inst.registration.take()))
    }

    /// A stopped instance carries no health verdict and no error from the
    /// run it ended.
    pub async fn mark_stopped(&self, name: &str) {
        if let Some(inst) = self.inner.write().await.get_mut(name) {
            inst.transition(ServiceState::Stopped);
            inst.process = None;
            inst.health = HealthState::Unknown;
            inst.last_error = None;
        }
    }

    pub async fn set_health(&self, name: &str, health: HealthState) {
        if let Some(inst) = self.inner.write().await.get_mut(name) {
            inst.health = health;
        }
    }

    pub async fn set_registration(&self, name: &str, id: Option<String>) {
        if let Some(inst) = self.inner.write().await.get_mut(name) {
            inst.registration = id;
        }
    }

    /// Take the registry id so it is withdrawn exactly once.
    pub async fn take_registration(&self, name: &str) -> Option<String> {
        self.inner.write().await.get_mut(name)?.registration.take()
    }

    pub async fn get(&self, name: &str) -> Option<Instance> {
        self.inner.read().await.get(name).cloned()
    }

    pub async fn state(&self, name: &str) -> Option<ServiceState> {
        self.inner.read().await.get(name).map(|i| i.state)
    }

    pub async fn status(&self, name: &str) -> Option<ServiceStatus> {
        self.inner.read().await.get(name).map(Instance::status)
    }

    /// Every instance currently in `state`.
    pub async fn in_state(&self, state: ServiceState) -> Vec<Instance> {
        let map = self.inner.read().await;
        let mut found: Vec<Instance> = map.values().filter(|i| i.state == state).cloned().collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HANDLE: ProcessHandle = ProcessHandle { id: 7, pid: 4242 };

    #[tokio::test]
    async fn one_active_instance_per_name() {
        let table = InstanceTable::new();
        table.begin("tts", ServiceClass::Base).await.expect("first claim");
        let err = table.begin("tts", ServiceClass::Base).await.unwrap_err();
        assert!(matches!(err, WardenError::Startup { retryable: false, .. }));
    }

    #[tokio::test]
    async fn failed_instance_can_be_claimed_again() {
        let table = InstanceTable::new();
        let first = table.begin("tts", ServiceClass::Optional).await.expect("claim");
        table
            .mark_failed("tts", WardenError::HealthCheck { service: "tts".into(), reason: "timeout".into() })
            .await;
        let second = table.begin("tts", ServiceClass::Optional).await.expect("reclaim");
        assert_ne!(first, second, "each start gets a fresh run id");
    }

    #[tokio::test]
    async fn running_snapshot_carries_pid_and_health() {
        let table = InstanceTable::new();
        table.begin("llm", ServiceClass::Base).await.expect("claim");
        table.record_attempt("llm", 2, Some(HANDLE)).await;
        assert!(table.mark_running("llm", Some(HANDLE), HealthState::Healthy).await);

        let status = table.status("llm").await.expect("status");
        assert_eq!(status.state, ServiceState::Running);
        assert_eq!(status.pid, Some(4242));
        assert_eq!(status.attempts, 2);
        assert_eq!(status.health, HealthState::Healthy);
    }

    #[tokio::test]
    async fn stopping_hands_back_process_and_registration_once() {
        let table = InstanceTable::new();
        table.begin("asr", ServiceClass::Base).await.expect("claim");
        table.mark_running("asr", Some(HANDLE), HealthState::Healthy).await;
        table.set_registration("asr", Some("asr-1".into())).await;

        let (process, registration) = table.mark_stopping("asr").await.expect("something to stop");
        assert_eq!(process, Some(HANDLE));
        assert_eq!(registration.as_deref(), Some("asr-1"));
        table.mark_stopped("asr").await;

        assert_eq!(table.state("asr").await, Some(ServiceState::Stopped));
        assert!(table.mark_stopping("asr").await.is_none(), "already stopped");
    }

    #[tokio::test]
    async fn stopping_a_starting_instance_clears_attempt_failures() {
        let table = InstanceTable::new();
        table.begin("tts", ServiceClass::Optional).await.expect("claim");
        table.record_attempt("tts", 1, Some(HANDLE)).await;
        table
            .record_error("tts", WardenError::HealthCheck { service: "tts".into(), reason: "HTTP 503".into() })
            .await;
        table.set_health("tts", HealthState::Unhealthy).await;

        let (process, _) = table.mark_stopping("tts").await.expect("starting can be stopped");
        assert_eq!(process, Some(HANDLE));
        let stopping = table.status("tts").await.expect("status");
        assert_eq!(stopping.state, ServiceState::Stopping);
        assert_eq!(stopping.health, HealthState::Unknown);
        assert!(stopping.last_error.is_none());

        table.mark_stopped("tts").await;
        let stopped = table.status("tts").await.expect("status");
        assert_eq!(stopped.state, ServiceState::Stopped);
        assert_eq!(stopped.health, HealthState::Unknown);
        assert!(stopped.last_error.is_none());
        assert_eq!(stopped.pid, None);
    }

    #[tokio::test]
    async fn illegal_transition_is_ignored() {
        let table = InstanceTable::new();
        table.begin("db", ServiceClass::Base).await.expect("claim");
        table.mark_running("db", None, HealthState::Unknown).await;
        table.mark_stopping("db").await;
        table.mark_stopped("db").await;
        assert!(!table.mark_running("db", None, HealthState::Healthy).await);
        assert_eq!(table.state("db").await, Some(ServiceState::Stopped));
    }

    #[tokio::test]
    async fn unknown_name_has_no_status() {
        assert!(InstanceTable::new().status("ghost").await.is_none());
    }
}
