//! [`Orchestrator`] – the lifecycle API the CLI drives.
//!
//! | Operation | Effect |
//! |---|---|
//! | [`initialize_all`](Orchestrator::initialize_all) | Start every configured service in dependency order |
//! | [`shutdown_all`](Orchestrator::shutdown_all) | Deregister everything, then stop in reverse order |
//! | [`status`](Orchestrator::status) | Per-service [`ServiceStatus`] snapshot |
//! | [`health_check_all`](Orchestrator::health_check_all) | Probe every started service once |
//! | [`start_selected`](Orchestrator::start_selected) | Start named services plus their dependencies |
//! | [`reap`](Orchestrator::reap) | Detect running processes that exited on their own |
//! | [`check_only`](Orchestrator::check_only) | Resolve order and probe health without starting anything |
//!
//! Each service of a plan runs on its own tokio task. A task first waits on
//! the gates of its dependencies (one `watch` channel per service, set once
//! the dependency is running or has failed), then drives its own start
//! through [`RetryManager::attempt`]. Independent services therefore start
//! concurrently while dependents queue behind their prerequisites.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use warden_config::WardenConfig;
use warden_discovery::ServiceRegistry;
use warden_probe::{Clock, HealthCheck, HealthWait, Readiness, RetryManager, StartAttempt, TokioClock};
use warden_types::{
    HealthState, LifecycleKind, RegistryEntry, ServiceDefinition, ServiceState, ServiceStatus, WardenError,
};

use crate::bus::{LifecycleBus, LifecycleReceiver};
use crate::instance::InstanceTable;
use crate::process::{ExitInfo, LaunchSpec, ProcessControl, ProcessHandle};
use crate::resolver::DependencyResolver;

// ─────────────────────────────────────────────────────────────────────────────
// Reports
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceFailure {
    pub service: String,
    pub attempts: u32,
    pub error: WardenError,
}

/// Result of starting a plan.
///
/// `success` is `false` exactly when a base service failed; optional
/// failures are listed but do not change it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitReport {
    pub success: bool,
    /// Services that reached `Running`, in completion order.
    pub started: Vec<String>,
    pub failed_base: Vec<ServiceFailure>,
    pub failed_optional: Vec<ServiceFailure>,
    /// Services that were already active.
    pub skipped: Vec<String>,
}

impl InitReport {
    pub fn failed_base_names(&self) -> Vec<&str> {
        self.failed_base.iter().map(|f| f.service.as_str()).collect()
    }

    pub fn failed_optional_names(&self) -> Vec<&str> {
        self.failed_optional.iter().map(|f| f.service.as_str()).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShutdownReport {
    /// In stop order.
    pub stopped: Vec<String>,
    /// Registry ids withdrawn.
    pub deregistered: Vec<String>,
    /// Stop and deregistration failures. None of them abort the shutdown.
    pub errors: Vec<(String, WardenError)>,
}

/// Outcome of [`Orchestrator::check_only`].
#[derive(Debug, Clone, PartialEq)]
pub struct CheckReport {
    pub waves: Vec<Vec<String>>,
    /// `Unknown` for services with nothing to probe.
    pub health: BTreeMap<String, HealthState>,
}

enum StartOutcome {
    Started,
    AlreadyActive,
    Failed(ServiceFailure),
}

// ─────────────────────────────────────────────────────────────────────────────
// Orchestrator
// ─────────────────────────────────────────────────────────────────────────────

/// Cheap to clone; clones share the instance table and event bus.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<WardenConfig>,
    processes: Arc<dyn ProcessControl>,
    health: Arc<dyn HealthCheck>,
    registry: Option<Arc<dyn ServiceRegistry>>,
    table: InstanceTable,
    bus: LifecycleBus,
    clock: Arc<dyn Clock>,
    shutdown: Option<watch::Receiver<bool>>,
    parent_env: Arc<BTreeMap<String, String>>,
}

impl Orchestrator {
    pub fn new(config: WardenConfig, processes: Arc<dyn ProcessControl>, health: Arc<dyn HealthCheck>) -> Self {
        Self {
            config: Arc::new(config),
            processes,
            health,
            registry: None,
            table: InstanceTable::new(),
            bus: LifecycleBus::default(),
            clock: Arc::new(TokioClock),
            shutdown: None,
            parent_env: Arc::new(std::env::vars().collect()),
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn ServiceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Interrupt retry loops once `shutdown` reads `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Environment children inherit instead of the supervisor's own.
    pub fn with_parent_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.parent_env = Arc::new(env);
        self
    }

    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    pub fn subscribe(&self) -> LifecycleReceiver {
        self.bus.subscribe()
    }

    pub fn bus(&self) -> &LifecycleBus {
        &self.bus
    }

    fn resolver(&self) -> Result<DependencyResolver, WardenError> {
        Ok(DependencyResolver::new(self.config.services.iter())?)
    }

    fn definition(&self, name: &str) -> Result<&ServiceDefinition, WardenError> {
        self.config
            .services
            .get(name)
            .ok_or_else(|| WardenError::Config(format!("Unknown service '{name}'")))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Start
    // ─────────────────────────────────────────────────────────────────────

    /// Start every configured service.
    ///
    /// A cycle or undeclared dependency is returned as an error before
    /// anything is spawned.
    #[tracing::instrument(skip(self))]
    pub async fn initialize_all(&self) -> Result<InitReport, WardenError> {
        let order = self.resolver()?.order()?;
        info!(services = order.len(), "Initializing services");
        Ok(self.run_plan(order).await)
    }

    /// Start `names` together with everything they depend on.
    #[tracing::instrument(skip(self))]
    pub async fn start_selected(&self, names: &[&str]) -> Result<InitReport, WardenError> {
        let plan = self.resolver()?.closure(names)?;
        Ok(self.run_plan(plan).await)
    }

    /// Start one service whose dependencies must already be running.
    pub async fn start_service(&self, name: &str) -> Result<(), WardenError> {
        self.definition(name)?;
        let report = self.run_plan(vec![name.to_string()]).await;
        match report.failed_base.into_iter().chain(report.failed_optional).next() {
            Some(failure) => Err(failure.error),
            None => Ok(()),
        }
    }

    pub async fn restart_service(&self, name: &str) -> Result<(), WardenError> {
        self.stop_service(name).await?;
        self.start_service(name).await
    }

    async fn run_plan(&self, plan: Vec<String>) -> InitReport {
        let mut gates: HashMap<String, watch::Receiver<Option<bool>>> = HashMap::new();
        let mut tasks = Vec::with_capacity(plan.len());
        let mut names = Vec::with_capacity(plan.len());

        for name in plan {
            let Some(def) = self.config.services.get(&name).cloned() else {
                continue;
            };
            let waits: Vec<(String, Option<watch::Receiver<Option<bool>>>)> = def
                .dependencies
                .iter()
                .map(|dep| (dep.clone(), gates.get(dep).cloned()))
                .collect();
            let (gate, rx) = watch::channel(None);
            gates.insert(name.clone(), rx);

            let this = self.clone();
            names.push(name);
            tasks.push(tokio::spawn(async move {
                let outcome = this.start_after_dependencies(&def, waits).await;
                gate.send_replace(Some(!matches!(outcome, StartOutcome::Failed(_))));
                outcome
            }));
        }

        let mut report = InitReport::default();
        for (name, joined) in names.into_iter().zip(join_all(tasks).await) {
            let outcome = joined.unwrap_or_else(|e| {
                error!(service = %name, error = %e, "Start task panicked");
                StartOutcome::Failed(ServiceFailure {
                    service: name.clone(),
                    attempts: 0,
                    error: WardenError::Startup {
                        service: name.clone(),
                        reason: format!("start task aborted: {e}"),
                        retryable: false,
                    },
                })
            });
            match outcome {
                StartOutcome::Started => report.started.push(name),
                StartOutcome::AlreadyActive => report.skipped.push(name),
                StartOutcome::Failed(failure) => {
                    let base = self.config.services.get(&name).is_some_and(ServiceDefinition::is_base);
                    if base {
                        report.failed_base.push(failure);
                    } else {
                        report.failed_optional.push(failure);
                    }
                }
            }
        }
        report.success = report.failed_base.is_empty();

        if report.success {
            info!(
                started = report.started.len(),
                failed_optional = report.failed_optional.len(),
                "Initialization complete"
            );
        } else {
            error!(failed_base = ?report.failed_base_names(), "Initialization degraded: base services failed");
        }
        report
    }

    async fn start_after_dependencies(
        &self,
        def: &ServiceDefinition,
        waits: Vec<(String, Option<watch::Receiver<Option<bool>>>)>,
    ) -> StartOutcome {
        for (dep, gate) in waits {
            let up = match gate {
                Some(mut rx) => rx
                    .wait_for(Option::is_some)
                    .await
                    .map(|v| *v == Some(true))
                    .unwrap_or(false),
                // Outside the plan: must already be running.
                None => self.table.state(&dep).await == Some(ServiceState::Running),
            };
            if !up {
                let error = WardenError::DependencyFailed {
                    service: def.name.clone(),
                    dependency: dep,
                };
                warn!(service = %def.name, error = %error, "Not starting");
                if self.table.begin(&def.name, def.class).await.is_ok() {
                    self.table.mark_failed(&def.name, error.clone()).await;
                }
                self.bus.emit(&def.name, LifecycleKind::Failed { reason: error.to_string() });
                return StartOutcome::Failed(ServiceFailure {
                    service: def.name.clone(),
                    attempts: 0,
                    error,
                });
            }
        }
        self.start_one(def).await
    }

    async fn start_one(&self, def: &ServiceDefinition) -> StartOutcome {
        let run_id = match self.table.begin(&def.name, def.class).await {
            Ok(id) => id,
            Err(e) => {
                debug!(service = %def.name, reason = %e, "Skipping start");
                return StartOutcome::AlreadyActive;
            }
        };
        info!(service = %def.name, %run_id, class = %def.class, external = def.external, "Starting service");

        let settings = &self.config.settings;
        let mut retry = RetryManager::new(settings.retry.clone()).with_clock(self.clock.clone());
        if let Some(shutdown) = &self.shutdown {
            retry = retry.with_shutdown(shutdown.clone());
        }
        let wait = HealthWait {
            check_interval: settings.health.check_interval,
            startup_timeout: def.startup_timeout,
        };

        let (outcome, process, health) = if def.external {
            let mut target = Locate {
                orch: self,
                def,
                health: HealthState::Unknown,
            };
            let outcome = retry.attempt(&def.name, &mut target, wait).await;
            (outcome, None, target.health)
        } else {
            let spec = LaunchSpec::from_definition(def, &settings.log_dir, self.parent_env.as_ref().clone());
            let mut target = Launch {
                orch: self,
                def,
                spec,
                process: None,
                health: HealthState::Unknown,
            };
            let outcome = retry.attempt(&def.name, &mut target, wait).await;
            (outcome, target.process, target.health)
        };

        if !outcome.success {
            let attempts = outcome.attempts;
            let error = outcome.last_error.unwrap_or(WardenError::Cancelled);
            self.table.mark_failed(&def.name, error.clone()).await;
            self.bus.emit(&def.name, LifecycleKind::Failed { reason: error.to_string() });
            if def.is_base() {
                error!(service = %def.name, attempts, error = %error, "Base service failed to start");
            } else {
                warn!(service = %def.name, attempts, error = %error, "Optional service failed to start");
            }
            return StartOutcome::Failed(ServiceFailure {
                service: def.name.clone(),
                attempts,
                error,
            });
        }

        if !self.table.mark_running(&def.name, process, health).await {
            // Stopped while the last attempt was in flight.
            if let Some(handle) = process
                && let Err(e) = self.processes.stop(&handle, settings.grace_period).await
            {
                warn!(service = %def.name, error = %e, "Stop of half-started process failed");
                self.table.record_error(&def.name, e).await;
            }
            return StartOutcome::Failed(ServiceFailure {
                service: def.name.clone(),
                attempts: outcome.attempts,
                error: WardenError::Cancelled,
            });
        }
        let pid = process.map(|p| p.pid);
        info!(service = %def.name, pid = ?pid, attempts = outcome.attempts, "Service running");
        self.bus.emit(&def.name, LifecycleKind::Running { pid });

        if !def.external {
            self.register(def).await;
        }
        StartOutcome::Started
    }

    /// Publish a running service. Failures degrade discovery only.
    async fn register(&self, def: &ServiceDefinition) {
        let (Some(registry), Some(entry)) = (&self.registry, RegistryEntry::for_definition(def)) else {
            return;
        };
        match registry.register(&entry).await {
            Ok(()) => {
                info!(service = %def.name, id = %entry.id, backend = registry.backend(), "Registered");
                self.table.set_registration(&def.name, Some(entry.id.clone())).await;
                self.bus.emit(&def.name, LifecycleKind::Registered { id: entry.id });
            }
            Err(e) => {
                warn!(service = %def.name, id = %entry.id, error = %e, "Registration failed; service runs undiscoverable");
            }
        }
    }

    async fn deregister(&self, service: &str, id: &str) -> Result<(), WardenError> {
        let Some(registry) = &self.registry else {
            return Ok(());
        };
        match registry.deregister(id).await {
            Ok(()) => {
                info!(service, id, "Deregistered");
                self.bus.emit(service, LifecycleKind::Deregistered { id: id.to_string() });
                Ok(())
            }
            Err(e) => {
                warn!(service, id, error = %e, "Deregistration failed");
                Err(e.into())
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Stop
    // ─────────────────────────────────────────────────────────────────────

    /// Reverse start order; reverse declaration order when the graph is unusable.
    fn stop_order(&self) -> Vec<String> {
        let mut order = match self.resolver().and_then(|r| r.order().map_err(WardenError::from)) {
            Ok(order) => order,
            Err(_) => self.config.services.names().map(str::to_string).collect(),
        };
        order.reverse();
        order
    }

    /// Withdraw every registration, then stop every active instance.
    ///
    /// Errors are collected and logged; shutdown always runs to completion.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown_all(&self) -> ShutdownReport {
        let order = self.stop_order();
        let mut report = ShutdownReport::default();

        for name in &order {
            if let Some(id) = self.table.take_registration(name).await {
                match self.deregister(name, &id).await {
                    Ok(()) => report.deregistered.push(id),
                    Err(e) => report.errors.push((name.clone(), e)),
                }
            }
        }

        for name in &order {
            match self.stop_instance(name).await {
                Ok(true) => report.stopped.push(name.clone()),
                Ok(false) => {}
                Err(e) => {
                    report.stopped.push(name.clone());
                    report.errors.push((name.clone(), e));
                }
            }
        }
        info!(stopped = report.stopped.len(), errors = report.errors.len(), "Shutdown complete");
        report
    }

    /// Stop one service. Stopping a service that is not active succeeds.
    pub async fn stop_service(&self, name: &str) -> Result<(), WardenError> {
        self.definition(name)?;
        self.stop_instance(name).await.map(|_| ())
    }

    /// `Ok(false)` when there was nothing to stop. The instance ends
    /// `Stopped` even when the stop reports an error.
    async fn stop_instance(&self, name: &str) -> Result<bool, WardenError> {
        let Some((process, registration)) = self.table.mark_stopping(name).await else {
            return Ok(false);
        };
        if let Some(id) = registration {
            let _ = self.deregister(name, &id).await;
        }
        self.bus.emit(name, LifecycleKind::Stopping);

        let result = match process {
            Some(handle) => match self.processes.stop(&handle, self.config.settings.grace_period).await {
                Ok(outcome) => {
                    debug!(service = name, ?outcome, "Process stop");
                    Ok(())
                }
                Err(e) => Err(e),
            },
            None => Ok(()),
        };

        self.table.mark_stopped(name).await;
        self.bus.emit(name, LifecycleKind::Stopped);
        match result {
            Ok(()) => {
                info!(service = name, "Service stopped");
                Ok(true)
            }
            Err(e) => {
                error!(service = name, error = %e, "Stop failed");
                Err(e)
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────

    /// Snapshot of every configured service, started or not.
    pub async fn status(&self) -> BTreeMap<String, ServiceStatus> {
        let mut out = BTreeMap::new();
        for def in self.config.services.iter() {
            let status = match self.table.status(&def.name).await {
                Some(s) => s,
                None => ServiceStatus::never_started(&def.name, def.class),
            };
            out.insert(def.name.clone(), status);
        }
        out
    }

    /// Probe every running service once, concurrently.
    ///
    /// Services that are not running report `Unknown` (never started or
    /// stopped) or `Unhealthy` (failed) without a probe.
    #[tracing::instrument(skip(self))]
    pub async fn health_check_all(&self) -> BTreeMap<String, HealthState> {
        let probes = self.config.services.iter().map(|def| async move {
            let health = self.probe_started(def).await;
            (def.name.clone(), health)
        });
        join_all(probes).await.into_iter().collect()
    }

    async fn probe_started(&self, def: &ServiceDefinition) -> HealthState {
        let Some(inst) = self.table.get(&def.name).await else {
            return HealthState::Unknown;
        };
        match inst.state {
            ServiceState::Running => {}
            ServiceState::Failed => return HealthState::Unhealthy,
            _ => return HealthState::Unknown,
        }

        let health = if let Some(url) = &def.health_check_url {
            self.probe_url(&def.name, url).await
        } else if let Some(handle) = inst.process {
            match self.processes.try_wait(&handle).await {
                Ok(None) => HealthState::Healthy,
                _ => HealthState::Unhealthy,
            }
        } else {
            HealthState::Healthy
        };
        self.table.set_health(&def.name, health).await;
        health
    }

    async fn probe_url(&self, service: &str, url: &str) -> HealthState {
        let probe = self.health.probe(url, self.config.settings.health.request_timeout).await;
        if probe.is_healthy() {
            HealthState::Healthy
        } else {
            debug!(service, url, ?probe, "Health probe failed");
            HealthState::Unhealthy
        }
    }

    /// Mark running services whose process has exited as failed.
    ///
    /// Their registry entries are withdrawn. Returns the affected names.
    pub async fn reap(&self) -> Vec<String> {
        let mut crashed = Vec::new();
        for inst in self.table.in_state(ServiceState::Running).await {
            let Some(handle) = inst.process else {
                continue;
            };
            let exit = match self.processes.try_wait(&handle).await {
                Ok(Some(exit)) => exit,
                Ok(None) => continue,
                Err(e) => {
                    warn!(service = %inst.name, error = %e, "Cannot query process");
                    continue;
                }
            };
            warn!(service = %inst.name, pid = handle.pid, code = ?exit.code, "Service exited unexpectedly");
            if let Some(id) = self.table.take_registration(&inst.name).await {
                let _ = self.deregister(&inst.name, &id).await;
            }
            self.table
                .mark_failed(
                    &inst.name,
                    WardenError::Startup {
                        service: inst.name.clone(),
                        reason: format!("exited unexpectedly ({})", describe_exit(exit)),
                        retryable: true,
                    },
                )
                .await;
            self.bus.emit(&inst.name, LifecycleKind::Crashed { exit_code: exit.code });
            crashed.push(inst.name);
        }
        crashed
    }

    /// Validate the dependency graph and probe every health URL once.
    ///
    /// Starts nothing. External services with discovery are looked up in the
    /// registry instead.
    #[tracing::instrument(skip(self))]
    pub async fn check_only(&self) -> Result<CheckReport, WardenError> {
        let waves = self.resolver()?.waves()?;
        let probes = self.config.services.iter().map(|def| async move {
            let health = match (&self.registry, &def.discovery, &def.health_check_url) {
                (Some(registry), Some(_), _) if def.external => match registry.resolve(&def.name).await {
                    Ok(endpoints) if !endpoints.is_empty() => HealthState::Healthy,
                    Ok(_) => HealthState::Unhealthy,
                    Err(e) => {
                        warn!(service = %def.name, error = %e, "Registry lookup failed");
                        HealthState::Unhealthy
                    }
                },
                (_, _, Some(url)) => self.probe_url(&def.name, url).await,
                _ => HealthState::Unknown,
            };
            (def.name.clone(), health)
        });
        let health = join_all(probes).await.into_iter().collect();
        Ok(CheckReport { waves, health })
    }
}

fn describe_exit(exit: ExitInfo) -> String {
    match exit.code {
        Some(code) => format!("exit code {code}"),
        None => "killed by signal".to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Start attempts
// ─────────────────────────────────────────────────────────────────────────────

/// Spawns the service process and waits for it to become ready.
struct Launch<'a> {
    orch: &'a Orchestrator,
    def: &'a ServiceDefinition,
    spec: LaunchSpec,
    process: Option<ProcessHandle>,
    health: HealthState,
}

#[async_trait]
impl StartAttempt for Launch<'_> {
    async fn start(&mut self, attempt: u32) -> Result<(), WardenError> {
        let name = &self.def.name;
        // stop_service ran while we were backing off.
        if self.orch.table.state(name).await != Some(ServiceState::Starting) {
            return Err(WardenError::Cancelled);
        }
        self.orch.bus.emit(name, LifecycleKind::Starting { attempt });
        match self.orch.processes.spawn(&self.spec).await {
            Ok(handle) => {
                self.process = Some(handle);
                self.orch.table.record_attempt(name, attempt, Some(handle)).await;
                Ok(())
            }
            Err(e) => {
                self.orch.table.record_attempt(name, attempt, None).await;
                self.orch.table.record_error(name, e.clone()).await;
                self.orch.bus.emit(
                    name,
                    LifecycleKind::AttemptFailed {
                        attempt,
                        reason: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    async fn poll(&mut self) -> Readiness {
        let Some(handle) = self.process else {
            return Readiness::Failed(WardenError::Cancelled);
        };
        match self.orch.processes.try_wait(&handle).await {
            Ok(Some(exit)) => {
                self.process = None;
                // A one-shot task is up once it has finished cleanly.
                if !self.def.run_in_background && exit.success() {
                    return Readiness::Ready;
                }
                let error = WardenError::Startup {
                    service: self.def.name.clone(),
                    reason: format!("exited during startup ({})", describe_exit(exit)),
                    retryable: true,
                };
                self.orch.table.record_error(&self.def.name, error.clone()).await;
                return Readiness::Failed(error);
            }
            Ok(None) => {}
            Err(e) => return Readiness::Failed(e),
        }

        if !self.def.run_in_background {
            return Readiness::Pending;
        }
        let Some(url) = &self.def.health_check_url else {
            return Readiness::Ready;
        };
        let timeout = self.orch.config.settings.health.request_timeout;
        if self.orch.health.check(url, timeout).await {
            self.health = HealthState::Healthy;
            Readiness::Ready
        } else {
            self.health = HealthState::Unhealthy;
            Readiness::Pending
        }
    }

    async fn abort(&mut self) {
        let Some(handle) = self.process.take() else {
            return;
        };
        if let Err(e) = self
            .orch
            .processes
            .stop(&handle, self.orch.config.settings.grace_period)
            .await
        {
            warn!(service = %self.def.name, error = %e, "Could not stop failed attempt");
        }
        self.orch.table.clear_process(&self.def.name).await;
    }
}

/// Confirms an externally managed service is reachable.
struct Locate<'a> {
    orch: &'a Orchestrator,
    def: &'a ServiceDefinition,
    health: HealthState,
}

#[async_trait]
impl StartAttempt for Locate<'_> {
    async fn start(&mut self, attempt: u32) -> Result<(), WardenError> {
        self.orch.bus.emit(&self.def.name, LifecycleKind::Starting { attempt });
        self.orch.table.record_attempt(&self.def.name, attempt, None).await;
        Ok(())
    }

    async fn poll(&mut self) -> Readiness {
        if let (Some(registry), Some(_)) = (&self.orch.registry, &self.def.discovery) {
            return match registry.resolve(&self.def.name).await {
                Ok(endpoints) if !endpoints.is_empty() => {
                    debug!(service = %self.def.name, endpoint = %endpoints[0], "Located external service");
                    self.health = HealthState::Healthy;
                    Readiness::Ready
                }
                Ok(_) => Readiness::Pending,
                Err(e) => {
                    warn!(service = %self.def.name, error = %e, "Registry lookup failed");
                    Readiness::Pending
                }
            };
        }
        match &self.def.health_check_url {
            Some(url) => {
                let timeout = self.orch.config.settings.health.request_timeout;
                if self.orch.health.check(url, timeout).await {
                    self.health = HealthState::Healthy;
                    Readiness::Ready
                } else {
                    Readiness::Pending
                }
            }
            None => Readiness::Failed(WardenError::Config(format!(
                "external service '{}' has no health URL and no registry to locate it",
                self.def.name
            ))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
