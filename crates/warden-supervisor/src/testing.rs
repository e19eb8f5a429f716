//! Fakes shared by the supervisor's unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use warden_config::{HealthSettings, RegistryBackend, RegistrySettings, Settings};
use warden_probe::{HealthCheck, HealthProbe};
use warden_types::{BackoffPolicy, ServiceClass, ServiceDefinition, WardenError};

use crate::process::{ExitInfo, LaunchSpec, ProcessControl, ProcessHandle, StopOutcome};

pub(crate) type Journal = Arc<Mutex<Vec<String>>>;

pub(crate) fn journal_of(journal: &Journal) -> Vec<String> {
    journal.lock().unwrap().clone()
}

// ── Fake process control ────────────────────────────────────────────

pub(crate) struct FakeProc {
    service: String,
    exit: Option<ExitInfo>,
}

/// Processes that live until stopped or crashed on request.
#[derive(Default)]
pub(crate) struct FakeProcessControl {
    next_id: AtomicU64,
    procs: Mutex<HashMap<u64, FakeProc>>,
    /// Spawns of these services always fail (retryably).
    failing: Mutex<HashSet<String>>,
    /// These services exit with the given code right after spawning.
    exits: Mutex<HashMap<String, i32>>,
    /// Stops of these services report an error and leave the process alive.
    stuck: Mutex<HashSet<String>>,
    spawn_attempts: Mutex<Vec<String>>,
    journal: Journal,
}

impl FakeProcessControl {
    pub(crate) fn with_journal(journal: Journal) -> Self {
        Self {
            journal,
            ..Self::default()
        }
    }

    pub(crate) fn fail_spawns_of(&self, service: &str) {
        self.failing.lock().unwrap().insert(service.to_string());
    }

    pub(crate) fn exit_immediately(&self, service: &str, code: i32) {
        self.exits.lock().unwrap().insert(service.to_string(), code);
    }

    pub(crate) fn fail_stops_of(&self, service: &str) {
        self.stuck.lock().unwrap().insert(service.to_string());
    }

    pub(crate) fn spawn_attempts(&self) -> Vec<String> {
        self.spawn_attempts.lock().unwrap().clone()
    }

    pub(crate) fn crash(&self, service: &str, code: i32) {
        for p in self.procs.lock().unwrap().values_mut() {
            if p.service == service && p.exit.is_none() {
                p.exit = Some(ExitInfo { code: Some(code) });
            }
        }
    }
}

#[async_trait]
impl ProcessControl for FakeProcessControl {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<ProcessHandle, WardenError> {
        self.spawn_attempts.lock().unwrap().push(spec.service.clone());
        if self.failing.lock().unwrap().contains(&spec.service) {
            return Err(WardenError::Startup {
                service: spec.service.clone(),
                reason: "address already in use".into(),
                retryable: true,
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let exit = self
            .exits
            .lock()
            .unwrap()
            .get(&spec.service)
            .map(|&code| ExitInfo { code: Some(code) });
        self.procs.lock().unwrap().insert(
            id,
            FakeProc {
                service: spec.service.clone(),
                exit,
            },
        );
        self.journal.lock().unwrap().push(format!("spawn:{}", spec.service));
        Ok(ProcessHandle {
            id,
            pid: 1000 + id as u32,
        })
    }

    async fn try_wait(&self, handle: &ProcessHandle) -> Result<Option<ExitInfo>, WardenError> {
        Ok(match self.procs.lock().unwrap().get(&handle.id) {
            Some(p) => p.exit,
            None => Some(ExitInfo { code: None }),
        })
    }

    async fn stop(&self, handle: &ProcessHandle, _grace: Duration) -> Result<StopOutcome, WardenError> {
        let mut procs = self.procs.lock().unwrap();
        let Some(p) = procs.get_mut(&handle.id) else {
            return Ok(StopOutcome::AlreadyExited);
        };
        if p.exit.is_some() {
            return Ok(StopOutcome::AlreadyExited);
        }
        if self.stuck.lock().unwrap().contains(&p.service) {
            return Err(WardenError::Stop {
                service: p.service.clone(),
                reason: "operation not permitted".into(),
            });
        }
        p.exit = Some(ExitInfo { code: None });
        self.journal.lock().unwrap().push(format!("stop:{}", p.service));
        Ok(StopOutcome::Graceful)
    }
}

// ── Scripted health ─────────────────────────────────────────────────

/// Results per URL are consumed in order; an exhausted script is healthy.
#[derive(Default)]
pub(crate) struct ScriptedHealth {
    scripts: Mutex<HashMap<String, VecDeque<bool>>>,
    down: Mutex<HashSet<String>>,
}

impl ScriptedHealth {
    pub(crate) fn script(&self, url: &str, results: &[bool]) {
        self.scripts
            .lock()
            .unwrap()
            .insert(url.to_string(), results.iter().copied().collect());
    }

    pub(crate) fn set_down(&self, url: &str) {
        self.down.lock().unwrap().insert(url.to_string());
    }
}

#[async_trait]
impl HealthCheck for ScriptedHealth {
    async fn probe(&self, url: &str, _timeout: Duration) -> HealthProbe {
        let healthy = !self.down.lock().unwrap().contains(url)
            && self
                .scripts
                .lock()
                .unwrap()
                .get_mut(url)
                .and_then(VecDeque::pop_front)
                .unwrap_or(true);
        if healthy {
            HealthProbe::Healthy {
                status: 200,
                latency: Duration::ZERO,
            }
        } else {
            HealthProbe::Unhealthy {
                reason: "HTTP 503".into(),
            }
        }
    }
}

pub(crate) fn settings(max_retries: u32) -> Settings {
    Settings {
        log_dir: PathBuf::from("logs"),
        grace_period: Duration::from_secs(1),
        retry: BackoffPolicy {
            max_retries,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(5),
        },
        health: HealthSettings {
            check_interval: Duration::from_secs(2),
            request_timeout: Duration::from_secs(1),
            default_startup_timeout: Duration::from_secs(30),
        },
        registry: RegistrySettings {
            backend: RegistryBackend::None,
            check_interval: Duration::from_secs(10),
            check_timeout: Duration::from_secs(3),
            deregister_critical_after: Duration::from_secs(60),
        },
    }
}

pub(crate) fn service(name: &str, deps: &[&str], class: ServiceClass) -> ServiceDefinition {
    let mut def = ServiceDefinition::new(name, vec![format!("/opt/agent/bin/{name}")]);
    def.dependencies = deps.iter().map(|d| d.to_string()).collect();
    def.class = class;
    def.startup_timeout = Duration::from_secs(10);
    def
}

pub(crate) fn url_of(name: &str) -> String {
    format!("http://{name}.test/health")
}

pub(crate) fn with_url(mut def: ServiceDefinition) -> ServiceDefinition {
    def.health_check_url = Some(url_of(&def.name));
    def
}
