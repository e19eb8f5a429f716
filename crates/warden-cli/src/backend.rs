//! Registry backend selection from `settings.registry`.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;
use warden_config::{RegistryBackend, Settings};
use warden_discovery::{ConsulCheck, ConsulRegistry, LocalRegistry, ServiceRegistry};
use warden_probe::{HttpHealthChecker, RetryManager};

/// The configured registry and, for the local backend, its health monitor.
pub struct Backend {
    pub registry: Option<Arc<dyn ServiceRegistry>>,
    pub monitor: Option<JoinHandle<()>>,
}

/// Build the registry named by `settings`.
///
/// With `shutdown` set, reconnect backoff is cancellable and the local
/// registry starts its monitor; one-off commands pass `None`.
pub fn build(settings: &Settings, shutdown: Option<watch::Receiver<bool>>) -> Backend {
    let reg = &settings.registry;
    match &reg.backend {
        RegistryBackend::None => Backend {
            registry: None,
            monitor: None,
        },
        RegistryBackend::Local => {
            let local = Arc::new(LocalRegistry::new(Arc::new(HttpHealthChecker::new()), reg.check_timeout));
            let monitor = shutdown.map(|rx| local.spawn_monitor(reg.check_interval, rx));
            info!(monitor = monitor.is_some(), "Using in-process service registry");
            Backend {
                registry: Some(local),
                monitor,
            }
        }
        RegistryBackend::Consul { url, token } => {
            let mut retry = RetryManager::new(settings.retry);
            if let Some(rx) = shutdown {
                retry = retry.with_shutdown(rx);
            }
            let check = ConsulCheck {
                interval: reg.check_interval,
                timeout: reg.check_timeout,
                deregister_critical_after: reg.deregister_critical_after,
            };
            info!(url = %url, "Using Consul service registry");
            Backend {
                registry: Some(Arc::new(ConsulRegistry::new(url.clone(), token.clone(), check, retry))),
                monitor: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_config::{Format, LoadOptions, parse_str};

    fn settings(registry_yaml: &str) -> Settings {
        let yaml = format!("settings:\n  registry:\n{registry_yaml}\nbase_services: []\n");
        parse_str(&yaml, Format::Yaml, &LoadOptions::default())
            .expect("valid config")
            .settings
    }

    #[test]
    fn no_backend_means_no_registry() {
        let backend = build(&settings("    backend: none"), None);
        assert!(backend.registry.is_none());
        assert!(backend.monitor.is_none());
    }

    #[tokio::test]
    async fn local_backend_runs_monitor_until_shutdown() {
        let (tx, rx) = watch::channel(false);
        let backend = build(&settings("    backend: local"), Some(rx));
        assert!(backend.registry.is_some());

        tx.send(true).expect("monitor alive");
        let monitor = backend.monitor.expect("monitor spawned");
        tokio::time::timeout(std::time::Duration::from_secs(1), monitor)
            .await
            .expect("monitor stops")
            .expect("join");
    }

    #[test]
    fn consul_backend_without_shutdown_builds_client() {
        let backend = build(
            &settings("    backend: consul\n    consul_url: http://127.0.0.1:8500"),
            None,
        );
        assert!(backend.registry.is_some());
        assert!(backend.monitor.is_none());
    }
}
