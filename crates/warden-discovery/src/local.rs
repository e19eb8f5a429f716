//! In-process registry for single-host deployments and tests.
//!
//! Health monitoring is a sweep: [`LocalRegistry::refresh`] probes every
//! entry that carries a health-check URL and marks it passing or critical.
//! [`LocalRegistry::spawn_monitor`] runs the sweep on an interval until the
//! shutdown signal fires.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use warden_probe::HealthCheck;
use warden_types::{Endpoint, RegistryEntry};

use crate::{RegistryError, ServiceRegistry};

#[derive(Debug, Clone)]
struct Slot {
    entry: RegistryEntry,
    passing: bool,
}

pub struct LocalRegistry {
    slots: RwLock<HashMap<String, Slot>>,
    checker: Arc<dyn HealthCheck>,
    probe_timeout: Duration,
}

impl LocalRegistry {
    pub fn new(checker: Arc<dyn HealthCheck>, probe_timeout: Duration) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            checker,
            probe_timeout,
        }
    }

    /// Probe every entry with a health-check URL once.
    ///
    /// Returns the ids that are critical after the sweep.
    pub async fn refresh(&self) -> Vec<String> {
        let targets: Vec<(String, String)> = {
            let slots = self.slots.read().await;
            slots
                .iter()
                .filter_map(|(id, slot)| {
                    slot.entry
                        .health_check_url
                        .as_ref()
                        .map(|url| (id.clone(), url.clone()))
                })
                .collect()
        };

        let mut results = Vec::with_capacity(targets.len());
        for (id, url) in targets {
            let healthy = self.checker.check(&url, self.probe_timeout).await;
            results.push((id, healthy));
        }

        let mut critical = Vec::new();
        let mut slots = self.slots.write().await;
        for (id, healthy) in results {
            // Deregistered while probing.
            let Some(slot) = slots.get_mut(&id) else {
                continue;
            };
            if slot.passing && !healthy {
                warn!(id = %id, service = %slot.entry.service, "Registry entry is now critical");
            } else if !slot.passing && healthy {
                info!(id = %id, service = %slot.entry.service, "Registry entry is passing again");
            }
            slot.passing = healthy;
            if !healthy {
                critical.push(id);
            }
        }
        critical.sort();
        critical
    }

    /// Run [`refresh`](Self::refresh) every `interval` until `shutdown` reads `true`.
    pub fn spawn_monitor(self: &Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    res = shutdown.wait_for(|stop| *stop) => {
                        if res.is_ok() {
                            debug!("Local registry monitor stopped");
                        }
                        break;
                    }
                }
                registry.refresh().await;
            }
        })
    }
}

#[async_trait]
impl ServiceRegistry for LocalRegistry {
    async fn register(&self, entry: &RegistryEntry) -> Result<(), RegistryError> {
        let mut slots = self.slots.write().await;
        // Registration follows a passing startup check.
        slots.insert(
            entry.id.clone(),
            Slot {
                entry: entry.clone(),
                passing: true,
            },
        );
        debug!(service = %entry.service, id = %entry.id, "Registered locally");
        Ok(())
    }

    async fn resolve(&self, service: &str) -> Result<Vec<Endpoint>, RegistryError> {
        let slots = self.slots.read().await;
        let mut live: Vec<(&String, Endpoint)> = slots
            .iter()
            .filter(|(_, slot)| slot.passing && slot.entry.service == service)
            .map(|(id, slot)| (id, slot.entry.endpoint()))
            .collect();
        live.sort_by(|a, b| a.0.cmp(b.0));
        Ok(live.into_iter().map(|(_, ep)| ep).collect())
    }

    async fn deregister(&self, id: &str) -> Result<(), RegistryError> {
        self.slots.write().await.remove(id);
        Ok(())
    }

    async fn services(&self) -> Result<Vec<String>, RegistryError> {
        let slots = self.slots.read().await;
        let mut names: Vec<String> = slots.values().map(|s| s.entry.service.clone()).collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn backend(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_probe::HttpHealthChecker;
    use warden_probe::stub::StubServer;

    fn local() -> LocalRegistry {
        LocalRegistry::new(Arc::new(HttpHealthChecker::new()), Duration::from_millis(300))
    }

    fn entry(service: &str, id: &str, port: u16, url: Option<String>) -> RegistryEntry {
        RegistryEntry {
            service: service.into(),
            id: id.into(),
            address: "127.0.0.1".into(),
            port,
            health_check_url: url,
            tags: Vec::new(),
        }
    }

    #[tokio::test]
    async fn crashed_instance_disappears_after_monitor_sweep() {
        let server = StubServer::start(200).await.expect("stub");
        let registry = local();
        let d = entry("D", "D-1", server.addr().port(), Some(server.url("/health")));
        registry.register(&d).await.expect("register");

        assert_eq!(registry.resolve("D").await.expect("resolve"), vec![d.endpoint()]);

        // Process crash: the endpoint stops answering.
        server.stop().await;
        let critical = registry.refresh().await;

        assert_eq!(critical, vec!["D-1".to_string()]);
        assert!(registry.resolve("D").await.expect("resolve").is_empty(), "no stale address");
    }

    #[tokio::test]
    async fn background_monitor_marks_entry_critical() {
        let server = StubServer::start(200).await.expect("stub");
        let registry = Arc::new(local());
        registry
            .register(&entry("D", "D-1", 1, Some(server.url("/health"))))
            .await
            .expect("register");

        let (tx, rx) = watch::channel(false);
        let monitor = registry.spawn_monitor(Duration::from_millis(20), rx);

        server.set_status(500);
        let mut gone = false;
        for _ in 0..100 {
            if registry.resolve("D").await.expect("resolve").is_empty() {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(gone, "monitor should have marked D-1 critical");

        tx.send(true).expect("monitor alive");
        tokio::time::timeout(Duration::from_secs(1), monitor)
            .await
            .expect("monitor stops on shutdown")
            .expect("join");
    }

    #[tokio::test]
    async fn recovered_instance_is_resolvable_again() {
        let server = StubServer::start(503).await.expect("stub");
        let registry = local();
        registry
            .register(&entry("tts", "tts-1", 9880, Some(server.url("/health"))))
            .await
            .expect("register");

        registry.refresh().await;
        assert!(registry.resolve("tts").await.expect("resolve").is_empty());

        server.set_status(200);
        assert!(registry.refresh().await.is_empty());
        assert_eq!(registry.resolve("tts").await.expect("resolve").len(), 1);
    }

    #[tokio::test]
    async fn register_same_id_twice_updates_in_place() {
        let registry = local();
        registry.register(&entry("asr", "asr-1", 7000, None)).await.expect("first");
        registry.register(&entry("asr", "asr-1", 7001, None)).await.expect("second");

        let endpoints = registry.resolve("asr").await.expect("resolve");
        assert_eq!(endpoints, vec![Endpoint { address: "127.0.0.1".into(), port: 7001 }]);
    }

    #[tokio::test]
    async fn multiple_instances_resolve_in_id_order() {
        let registry = local();
        registry.register(&entry("gateway", "gateway-2", 8002, None)).await.expect("register");
        registry.register(&entry("gateway", "gateway-1", 8001, None)).await.expect("register");
        registry.register(&entry("asr", "asr-1", 7000, None)).await.expect("register");

        let ports: Vec<u16> = registry
            .resolve("gateway")
            .await
            .expect("resolve")
            .iter()
            .map(|e| e.port)
            .collect();
        assert_eq!(ports, vec![8001, 8002]);
        assert_eq!(registry.services().await.expect("services"), vec!["asr", "gateway"]);
    }

    #[tokio::test]
    async fn deregister_is_idempotent() {
        let registry = local();
        registry.register(&entry("asr", "asr-1", 7000, None)).await.expect("register");
        registry.deregister("asr-1").await.expect("first");
        registry.deregister("asr-1").await.expect("second");
        assert!(registry.resolve("asr").await.expect("resolve").is_empty());
    }

    #[tokio::test]
    async fn unknown_service_resolves_to_empty_list() {
        assert!(local().resolve("nobody").await.expect("resolve").is_empty());
    }
}
