//! Shared vocabulary for the Warden service-lifecycle manager.
//!
//! Every other crate in the workspace speaks in these types: the immutable
//! [`ServiceDefinition`] produced by `warden-config`, the runtime
//! [`ServiceState`] machine driven by `warden-supervisor`, the
//! [`RegistryEntry`] published through `warden-discovery`, the
//! [`BackoffPolicy`] shared by every retry loop, and the [`WardenError`]
//! taxonomy.

pub mod backoff;
pub mod event;

pub use backoff::BackoffPolicy;
pub use event::{LifecycleEvent, LifecycleKind};

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// Static definitions
// ─────────────────────────────────────────────────────────────────────────────

/// Whether a service is required for overall system health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServiceClass {
    /// Failure degrades the reported initialization result.
    Base,
    /// Best-effort; failure is logged but non-fatal.
    #[default]
    Optional,
}

impl fmt::Display for ServiceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceClass::Base => write!(f, "base"),
            ServiceClass::Optional => write!(f, "optional"),
        }
    }
}

/// How the service command is turned into an executable invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Launcher {
    /// `command[0]` is executed directly with `command[1..]` as arguments.
    #[default]
    Direct,
    /// The command words are joined and handed to `/bin/sh -c`.
    Shell,
    /// `<conda_env>/bin/python` runs the command (script followed by args).
    Python,
}

/// Opt-in registration of a started service with the discovery registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverySpec {
    /// Registry id. Defaults to `<name>-1` when not configured.
    pub service_id: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A fully validated, immutable description of one managed service.
///
/// Produced by the config loader; the supervisor never re-validates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    /// Unique key across the whole configuration.
    pub name: String,
    /// Program followed by its arguments. Never empty.
    pub command: Vec<String>,
    pub launcher: Launcher,
    /// Working directory of the child. Inherited from the supervisor when `None`.
    pub working_dir: Option<PathBuf>,
    /// Declared variables layered on top of the parent environment.
    pub environment: BTreeMap<String, String>,
    /// Conda-style environment prefix whose `bin/` and `lib/` the child must see.
    pub conda_env: Option<PathBuf>,
    /// `false` marks a one-shot task that must exit successfully to count as up.
    pub run_in_background: bool,
    /// File name (relative to the log directory) receiving stdout and stderr.
    pub log_file: Option<String>,
    pub startup_timeout: Duration,
    pub health_check_url: Option<String>,
    pub dependencies: Vec<String>,
    pub class: ServiceClass,
    pub discovery: Option<DiscoverySpec>,
    /// The process is managed elsewhere; Warden only locates and probes it.
    pub external: bool,
}

impl ServiceDefinition {
    /// Minimal definition used as a starting point by builders and tests.
    pub fn new(name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command,
            launcher: Launcher::Direct,
            working_dir: None,
            environment: BTreeMap::new(),
            conda_env: None,
            run_in_background: true,
            log_file: None,
            startup_timeout: Duration::from_secs(30),
            health_check_url: None,
            dependencies: Vec::new(),
            class: ServiceClass::Optional,
            discovery: None,
            external: false,
        }
    }

    pub fn is_base(&self) -> bool {
        self.class == ServiceClass::Base
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Runtime state
// ─────────────────────────────────────────────────────────────────────────────

/// Per-instance lifecycle state.
///
/// `NotStarted → Starting → (Running | Failed) → Stopping → Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    NotStarted,
    Starting,
    Running,
    Failed,
    Stopping,
    Stopped,
}

impl ServiceState {
    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// `Starting → Starting` is allowed so a retry can restart the attempt,
    /// and `Stopped`/`Failed` may re-enter `Starting` on an explicit restart.
    pub fn can_transition_to(self, next: ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (self, next),
            (NotStarted, Starting)
                | (Starting, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Running, Failed)
                | (Failed, Stopping)
                | (Failed, Stopped)
                | (Stopping, Stopped)
                | (Stopped, Starting)
                | (Failed, Starting)
        )
    }

    /// Whether an instance in this state occupies its name in the active set.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ServiceState::Starting | ServiceState::Running | ServiceState::Stopping
        )
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::NotStarted => "not_started",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Failed => "failed",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Result of the most recent health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// No probe has been made yet.
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// Operator-facing condition derived from state and health.
///
/// Keeps "never started", "started but unhealthy" and "healthy" apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    NeverStarted,
    Starting,
    Healthy,
    Unhealthy,
    Failed,
    Stopping,
    Stopped,
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Condition::NeverStarted => "never started",
            Condition::Starting => "starting",
            Condition::Healthy => "healthy",
            Condition::Unhealthy => "unhealthy",
            Condition::Failed => "failed",
            Condition::Stopping => "stopping",
            Condition::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Point-in-time snapshot of one service, as returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub class: ServiceClass,
    pub state: ServiceState,
    pub health: HealthState,
    pub pid: Option<u32>,
    pub run_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl ServiceStatus {
    /// Snapshot for a configured service that has never been started.
    pub fn never_started(name: impl Into<String>, class: ServiceClass) -> Self {
        Self {
            name: name.into(),
            class,
            state: ServiceState::NotStarted,
            health: HealthState::Unknown,
            pid: None,
            run_id: None,
            started_at: None,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn condition(&self) -> Condition {
        match (self.state, self.health) {
            (ServiceState::NotStarted, _) => Condition::NeverStarted,
            (ServiceState::Starting, _) => Condition::Starting,
            (ServiceState::Running, HealthState::Unhealthy) => Condition::Unhealthy,
            (ServiceState::Running, _) => Condition::Healthy,
            (ServiceState::Failed, _) => Condition::Failed,
            (ServiceState::Stopping, _) => Condition::Stopping,
            (ServiceState::Stopped, _) => Condition::Stopped,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Discovery
// ─────────────────────────────────────────────────────────────────────────────

/// The record published to the discovery registry for one started instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub service: String,
    pub id: String,
    pub address: String,
    pub port: u16,
    pub health_check_url: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl RegistryEntry {
    /// Build the entry for a definition that opted into discovery.
    pub fn for_definition(def: &ServiceDefinition) -> Option<Self> {
        let spec = def.discovery.as_ref()?;
        Some(Self {
            service: def.name.clone(),
            id: spec.service_id.clone(),
            address: spec.address.clone(),
            port: spec.port,
            health_check_url: def.health_check_url.clone(),
            tags: spec.tags.clone(),
        })
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            address: self.address.clone(),
            port: self.port,
        }
    }
}

/// A live network address returned by a registry lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Failure taxonomy shared by every lifecycle component.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WardenError {
    /// Malformed, missing or cyclic configuration. Never retried.
    #[error("Config Error: {0}")]
    Config(String),

    #[error("Startup Error on {service}: {reason}")]
    Startup {
        service: String,
        reason: String,
        /// `false` for failures no retry can fix (missing executable, bad permissions).
        retryable: bool,
    },

    #[error("Health Check Error on {service}: {reason}")]
    HealthCheck { service: String, reason: String },

    #[error("Stop Error on {service}: {reason}")]
    Stop { service: String, reason: String },

    #[error("Registry Error: {0}")]
    Registry(String),

    #[error("Dependency {dependency} of {service} did not reach running")]
    DependencyFailed { service: String, dependency: String },

    #[error("Cancelled by shutdown request")]
    Cancelled,
}

impl WardenError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            WardenError::Startup { retryable, .. } => *retryable,
            WardenError::HealthCheck { .. } | WardenError::Registry(_) => true,
            WardenError::Config(_)
            | WardenError::Stop { .. }
            | WardenError::DependencyFailed { .. }
            | WardenError::Cancelled => false,
        }
    }
}
