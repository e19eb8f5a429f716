//! Typed client for the Consul agent HTTP API.
//!
//! | Operation | Request |
//! |---|---|
//! | register | `PUT /v1/agent/service/register` |
//! | resolve | `GET /v1/health/service/<name>?passing=true` |
//! | deregister | `PUT /v1/agent/service/deregister/<id>` |
//! | services | `GET /v1/catalog/services` |
//! | leader | `GET /v1/status/leader` |
//!
//! Transport failures and 5xx answers are retried through the shared
//! [`RetryManager`]; 4xx answers are returned as [`RegistryError::Rejected`].
//! Deregistration is the exception: it is sent once, so a dead agent never
//! holds up a shutdown. Consul drops the leftover entry itself after
//! `deregister_critical_after`.
//!
//! Names and ids are percent-encoded as single path segments.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use warden_probe::RetryManager;
use warden_types::{Endpoint, RegistryEntry, WardenError};

use crate::{RegistryError, ServiceRegistry};

/// Health-check parameters attached to every registration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsulCheck {
    pub interval: Duration,
    pub timeout: Duration,
    /// Consul drops the service after it has been critical this long. Zero disables.
    pub deregister_critical_after: Duration,
}

impl Default for ConsulCheck {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(3),
            deregister_critical_after: Duration::from_secs(60),
        }
    }
}

pub struct ConsulRegistry {
    base_url: String,
    token: Option<String>,
    check: ConsulCheck,
    client: reqwest::Client,
    retry: RetryManager,
}

impl std::fmt::Debug for ConsulRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsulRegistry")
            .field("base_url", &self.base_url)
            .field("token", if self.token.is_some() { &"<redacted>" } else { &"<not set>" })
            .field("check", &self.check)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct RegisterBody<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    tags: &'a [String],
    address: &'a str,
    port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    check: Option<CheckBody<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CheckBody<'a> {
    #[serde(rename = "HTTP")]
    http: &'a str,
    interval: String,
    timeout: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    deregister_critical_service_after: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    node: NodeInfo,
    service: ServiceInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeInfo {
    #[serde(default)]
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceInfo {
    #[serde(default)]
    address: String,
    port: u16,
}

/// Consul duration syntax: whole seconds, e.g. `"10s"`.
fn go_duration(d: Duration) -> String {
    format!("{}s", d.as_secs().max(1))
}

/// Transport errors and 5xx become a retryable [`WardenError::Registry`];
/// every other answer is `Ok` so the retry loop ends.
async fn exchange(req: RequestBuilder) -> Result<(StatusCode, String), WardenError> {
    let resp = req.send().await.map_err(|e| WardenError::Registry(e.to_string()))?;
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    if status.is_server_error() {
        return Err(WardenError::Registry(format!("HTTP {status}: {body}")));
    }
    Ok((status, body))
}

fn classify(outcome: Result<(StatusCode, String), WardenError>) -> Result<(StatusCode, String), RegistryError> {
    match outcome {
        Ok((status, body)) if status.is_success() || status == StatusCode::NOT_FOUND => Ok((status, body)),
        Ok((status, body)) => Err(RegistryError::Rejected {
            status: status.as_u16(),
            body,
        }),
        Err(WardenError::Registry(reason)) => Err(RegistryError::Unreachable(reason)),
        Err(other) => Err(RegistryError::Unreachable(other.to_string())),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────────────

impl ConsulRegistry {
    /// `base_url` is the agent address, e.g. `http://127.0.0.1:8500`.
    pub fn new(base_url: impl Into<String>, token: Option<String>, check: ConsulCheck, retry: RetryManager) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            check,
            client: reqwest::Client::new(),
            retry,
        }
    }

    /// Agent URL with `segments` appended, each one encoded on its own.
    fn url(&self, segments: &[&str]) -> Result<Url, RegistryError> {
        let mut url = Url::parse(&self.base_url).map_err(|e| RegistryError::InvalidUrl(format!("{}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|()| RegistryError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: &Url) -> RequestBuilder {
        let mut req = self
            .client
            .request(method, url.clone())
            .timeout(self.check.timeout.max(Duration::from_secs(1)) * 2);
        if let Some(token) = &self.token {
            req = req.header("X-Consul-Token", token);
        }
        req
    }

    /// Send with reconnect-on-failure; returns the body of a 2xx or 404 answer.
    async fn send(
        &self,
        what: &str,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<(StatusCode, String), RegistryError> {
        let outcome = self.retry.retry(what, |_| exchange(build())).await;
        classify(outcome)
    }

    /// One request, no reconnect.
    async fn send_once(&self, req: RequestBuilder) -> Result<(StatusCode, String), RegistryError> {
        classify(exchange(req).await)
    }

    /// Address of the current Raft leader; `Unreachable` when there is none.
    pub async fn leader(&self) -> Result<String, RegistryError> {
        let url = self.url(&["v1", "status", "leader"])?;
        let (_, body) = self.send("consul leader", || self.request(Method::GET, &url)).await?;
        let leader: String =
            serde_json::from_str(&body).map_err(|e| RegistryError::Decode(e.to_string()))?;
        if leader.is_empty() {
            return Err(RegistryError::Unreachable("cluster has no leader".into()));
        }
        Ok(leader)
    }
}

#[async_trait]
impl ServiceRegistry for ConsulRegistry {
    async fn register(&self, entry: &RegistryEntry) -> Result<(), RegistryError> {
        let check = entry.health_check_url.as_deref().map(|url| CheckBody {
            http: url,
            interval: go_duration(self.check.interval),
            timeout: go_duration(self.check.timeout),
            deregister_critical_service_after: (!self.check.deregister_critical_after.is_zero())
                .then(|| go_duration(self.check.deregister_critical_after)),
        });
        let body = RegisterBody {
            id: &entry.id,
            name: &entry.service,
            tags: &entry.tags,
            address: &entry.address,
            port: entry.port,
            check,
        };
        let payload = serde_json::to_value(&body).map_err(|e| RegistryError::Decode(e.to_string()))?;

        let url = self.url(&["v1", "agent", "service", "register"])?;
        let (status, body) = self
            .send("consul register", || self.request(Method::PUT, &url).json(&payload))
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Err(RegistryError::Rejected { status: 404, body });
        }
        info!(service = %entry.service, id = %entry.id, address = %entry.endpoint(), "Registered with Consul");
        Ok(())
    }

    async fn resolve(&self, service: &str) -> Result<Vec<Endpoint>, RegistryError> {
        let mut url = self.url(&["v1", "health", "service", service])?;
        url.query_pairs_mut().append_pair("passing", "true");
        let (status, body) = self.send("consul resolve", || self.request(Method::GET, &url)).await?;
        if status == StatusCode::NOT_FOUND || body.trim().is_empty() {
            return Ok(Vec::new());
        }
        let entries: Vec<HealthEntry> =
            serde_json::from_str(&body).map_err(|e| RegistryError::Decode(e.to_string()))?;

        let endpoints: Vec<Endpoint> = entries
            .into_iter()
            .map(|e| Endpoint {
                address: if e.service.address.is_empty() {
                    e.node.address
                } else {
                    e.service.address
                },
                port: e.service.port,
            })
            .collect();
        debug!(service, instances = endpoints.len(), "Resolved via Consul");
        Ok(endpoints)
    }

    async fn deregister(&self, id: &str) -> Result<(), RegistryError> {
        let url = self.url(&["v1", "agent", "service", "deregister", id])?;
        self.send_once(self.request(Method::PUT, &url)).await?;
        info!(id, "Deregistered from Consul");
        Ok(())
    }

    async fn services(&self) -> Result<Vec<String>, RegistryError> {
        let url = self.url(&["v1", "catalog", "services"])?;
        let (_, body) = self.send("consul services", || self.request(Method::GET, &url)).await?;
        let services: BTreeMap<String, Vec<String>> =
            serde_json::from_str(&body).map_err(|e| RegistryError::Decode(e.to_string()))?;
        Ok(services.into_keys().filter(|name| name != "consul").collect())
    }

    fn backend(&self) -> &'static str {
        "consul"
    }
}
