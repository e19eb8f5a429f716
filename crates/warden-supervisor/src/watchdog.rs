//! [`Watchdog`] – periodic crash detection for running services.
//!
//! Every `interval` the watchdog calls [`Orchestrator::reap`], which moves
//! services whose process exited on its own to `Failed` and withdraws their
//! registry entries. With [`restart_crashed`](Watchdog::restart_crashed) set,
//! each crashed service is started again through the normal retry path, up to
//! `max_restarts` times per service.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::orchestrator::Orchestrator;

pub struct Watchdog {
    orch: Orchestrator,
    interval: Duration,
    restart: bool,
    max_restarts: u32,
    restarts: HashMap<String, u32>,
}

impl Watchdog {
    pub fn new(orch: Orchestrator, interval: Duration) -> Self {
        Self {
            orch,
            interval,
            restart: false,
            max_restarts: 3,
            restarts: HashMap::new(),
        }
    }

    /// Start crashed services again, at most `max_restarts` times each.
    pub fn restart_crashed(mut self, max_restarts: u32) -> Self {
        self.restart = true;
        self.max_restarts = max_restarts;
        self
    }

    /// One pass: reap, then restart what is allowed. Returns the crashed names.
    pub async fn sweep(&mut self) -> Vec<String> {
        let crashed = self.orch.reap().await;
        if !self.restart {
            return crashed;
        }
        for name in &crashed {
            let used = self.restarts.entry(name.clone()).or_insert(0);
            if *used >= self.max_restarts {
                error!(service = %name, restarts = *used, "Restart limit reached; leaving service failed");
                continue;
            }
            *used += 1;
            info!(service = %name, restart = *used, "Restarting crashed service");
            if let Err(e) = self.orch.start_service(name).await {
                warn!(service = %name, error = %e, "Restart failed");
            }
        }
        crashed
    }

    /// Sweep every `interval` until `shutdown` reads `true`.
    pub fn spawn(mut self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => {}
                    _ = shutdown.wait_for(|stop| *stop) => break,
                }
                self.sweep().await;
            }
            debug!("Watchdog stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use warden_config::{ServiceSet, WardenConfig};
    use warden_probe::FakeClock;
    use warden_types::{ServiceClass, ServiceState};

    use crate::testing::{FakeProcessControl, ScriptedHealth, service, settings};

    fn orchestrator(processes: Arc<FakeProcessControl>) -> Orchestrator {
        let config = WardenConfig {
            settings: settings(0),
            services: ServiceSet::new(vec![
                service("tts", &[], ServiceClass::Optional),
                service("asr", &[], ServiceClass::Optional),
            ]),
        };
        Orchestrator::new(config, processes, Arc::new(ScriptedHealth::default())).with_clock(Arc::new(FakeClock::new()))
    }

    #[tokio::test]
    async fn sweep_reports_crashed_services() {
        let processes = Arc::new(FakeProcessControl::default());
        let orch = orchestrator(processes.clone());
        orch.initialize_all().await.expect("init");

        let mut dog = Watchdog::new(orch.clone(), Duration::from_secs(5));
        assert!(dog.sweep().await.is_empty());

        processes.crash("asr", 139);
        assert_eq!(dog.sweep().await, vec!["asr"]);
        assert_eq!(orch.status().await["asr"].state, ServiceState::Failed);
        assert_eq!(orch.status().await["tts"].state, ServiceState::Running);
    }

    #[tokio::test]
    async fn crashed_service_is_restarted_up_to_limit() {
        let processes = Arc::new(FakeProcessControl::default());
        let orch = orchestrator(processes.clone());
        orch.initialize_all().await.expect("init");
        let mut dog = Watchdog::new(orch.clone(), Duration::from_secs(5)).restart_crashed(1);

        processes.crash("tts", 1);
        dog.sweep().await;
        assert_eq!(orch.status().await["tts"].state, ServiceState::Running, "first crash restarts");

        processes.crash("tts", 1);
        dog.sweep().await;
        assert_eq!(orch.status().await["tts"].state, ServiceState::Failed, "limit reached");

        let tts_spawns = processes.spawn_attempts().iter().filter(|s| *s == "tts").count();
        assert_eq!(tts_spawns, 2);
    }

    #[tokio::test]
    async fn background_loop_stops_on_shutdown() {
        let processes = Arc::new(FakeProcessControl::default());
        let orch = orchestrator(processes.clone());
        orch.initialize_all().await.expect("init");

        let (tx, rx) = watch::channel(false);
        let handle = Watchdog::new(orch.clone(), Duration::from_millis(10)).spawn(rx);

        processes.crash("tts", 1);
        let mut failed = false;
        for _ in 0..100 {
            if orch.status().await["tts"].state == ServiceState::Failed {
                failed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(failed, "watchdog should reap the crash");

        tx.send(true).expect("watchdog alive");
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("stops promptly")
            .expect("join");
    }
}
