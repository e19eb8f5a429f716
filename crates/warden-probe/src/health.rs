//! HTTP health probe.
//!
//! A single check is one bounded GET. Any 2xx is healthy; timeouts, refused
//! connections and every other status are unhealthy. There are no retries
//! here; callers poll.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

/// Detailed result of one probe, for logging and status output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthProbe {
    Healthy { status: u16, latency: Duration },
    Unhealthy { reason: String },
}

impl HealthProbe {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthProbe::Healthy { .. })
    }
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Issue one request to `url`, giving up after `timeout`.
    async fn probe(&self, url: &str, timeout: Duration) -> HealthProbe;

    /// `true` when the endpoint answered 2xx within `timeout`.
    async fn check(&self, url: &str, timeout: Duration) -> bool {
        self.probe(url, timeout).await.is_healthy()
    }
}

/// [`HealthCheck`] backed by a shared `reqwest` client.
#[derive(Debug, Clone, Default)]
pub struct HttpHealthChecker {
    client: reqwest::Client,
}

impl HttpHealthChecker {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl HealthCheck for HttpHealthChecker {
    async fn probe(&self, url: &str, timeout: Duration) -> HealthProbe {
        let started = Instant::now();
        let request = self.client.get(url).timeout(timeout).send();
        // The outer bound also covers DNS resolution.
        let result = match tokio::time::timeout(timeout, request).await {
            Ok(r) => r,
            Err(_) => {
                return HealthProbe::Unhealthy {
                    reason: format!("no response within {timeout:?}"),
                };
            }
        };

        let probe = match result {
            Ok(resp) if resp.status().is_success() => HealthProbe::Healthy {
                status: resp.status().as_u16(),
                latency: started.elapsed(),
            },
            Ok(resp) => HealthProbe::Unhealthy {
                reason: format!("HTTP {}", resp.status()),
            },
            Err(e) if e.is_timeout() => HealthProbe::Unhealthy {
                reason: format!("no response within {timeout:?}"),
            },
            Err(e) if e.is_connect() => HealthProbe::Unhealthy {
                reason: format!("connection failed: {e}"),
            },
            Err(e) => HealthProbe::Unhealthy {
                reason: e.to_string(),
            },
        };
        debug!(url, healthy = probe.is_healthy(), "Health probe");
        probe
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubServer;

    const TIMEOUT: Duration = Duration::from_millis(300);

    #[tokio::test]
    async fn ok_status_is_healthy() {
        let server = StubServer::start(200).await.expect("stub");
        let checker = HttpHealthChecker::new();
        assert!(checker.check(&server.url("/health"), TIMEOUT).await);
        assert_eq!(server.hits(), 1, "a single check issues a single request");
    }

    #[tokio::test]
    async fn server_error_is_unhealthy() {
        let server = StubServer::start(500).await.expect("stub");
        let checker = HttpHealthChecker::new();
        let probe = checker.probe(&server.url("/health"), TIMEOUT).await;
        assert_eq!(
            probe,
            HealthProbe::Unhealthy {
                reason: "HTTP 500 Internal Server Error".to_string()
            }
        );
    }

    #[tokio::test]
    async fn slow_endpoint_times_out_within_bound() {
        let server = StubServer::start(200).await.expect("stub");
        server.set_delay(Duration::from_secs(5));
        let checker = HttpHealthChecker::new();

        let started = Instant::now();
        assert!(!checker.check(&server.url("/health"), TIMEOUT).await);
        let elapsed = started.elapsed();
        assert!(elapsed >= TIMEOUT, "gave up early: {elapsed:?}");
        assert!(elapsed < TIMEOUT * 4, "over-waited: {elapsed:?}");
    }

    #[tokio::test]
    async fn refused_connection_is_unhealthy() {
        let server = StubServer::start(200).await.expect("stub");
        let url = server.url("/health");
        server.stop().await;

        let checker = HttpHealthChecker::new();
        assert!(!checker.check(&url, TIMEOUT).await);
    }

    #[tokio::test]
    async fn no_content_is_healthy() {
        let server = StubServer::start(204).await.expect("stub");
        let checker = HttpHealthChecker::new();
        assert!(checker.check(&server.url("/api/tags"), TIMEOUT).await);
        assert_eq!(server.paths(), vec!["/api/tags".to_string()]);
    }
}
