//! On-disk schema, exactly as the YAML/TOML file spells it.
//!
//! Nothing here is validated. [`crate::model`] turns a [`RawConfig`] into
//! typed [`warden_types::ServiceDefinition`]s.

use std::collections::BTreeMap;

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfig {
    /// Substitution variables available as `${name}`.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,

    /// Named overlays selected with `--env`.
    #[serde(default)]
    pub environments: BTreeMap<String, RawEnvironment>,

    #[serde(default)]
    pub settings: RawSettings,

    #[serde(default)]
    pub base_services: Vec<RawEntry>,

    #[serde(default)]
    pub optional_services: Vec<RawEntry>,

    /// Older files nest both groups under one key.
    #[serde(default)]
    pub external_services: Option<RawGroups>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawEnvironment {
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawGroups {
    #[serde(default)]
    pub base_services: Vec<RawEntry>,
    #[serde(default)]
    pub optional_services: Vec<RawEntry>,
}

/// A service entry, either `{name: x, ...}` or the keyed `{x: {...}}` form.
///
/// The keyed form is tried first: a named entry always has a string under
/// `name`, which can never deserialize as a service body.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawEntry {
    Keyed(BTreeMap<String, RawService>),
    Named(RawService),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawService {
    #[serde(default, alias = "service_name")]
    pub name: Option<String>,

    #[serde(default, alias = "script")]
    pub command: Option<RawCommand>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    #[serde(default)]
    pub conda_env: Option<String>,

    #[serde(default)]
    pub use_python: bool,

    #[serde(default)]
    pub shell: bool,

    #[serde(default)]
    pub working_dir: Option<String>,

    #[serde(default = "default_true")]
    pub run_in_background: bool,

    /// Overrides the class implied by the enclosing section.
    #[serde(default)]
    pub is_base: Option<bool>,

    #[serde(default)]
    pub log_file: Option<String>,

    /// Seconds.
    #[serde(default)]
    pub startup_timeout: Option<u64>,

    #[serde(default)]
    pub health_check_url: Option<String>,

    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default)]
    pub discovery: Option<RawDiscovery>,

    #[serde(default)]
    pub external: bool,
}

/// `command: "ollama serve"` or `command: ["ollama", "serve"]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawCommand {
    Line(String),
    Words(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawDiscovery {
    #[serde(default)]
    pub service_id: Option<String>,
    #[serde(default = "default_address")]
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct RawSettings {
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// Seconds between SIGTERM and SIGKILL.
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,

    #[serde(default, alias = "retry_config")]
    pub retry: RawRetry,

    #[serde(default)]
    pub health_check: RawHealthCheck,

    #[serde(default)]
    pub registry: RawRegistry,
}

impl Default for RawSettings {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            grace_period_secs: default_grace_period(),
            retry: RawRetry::default(),
            health_check: RawHealthCheck::default(),
            registry: RawRegistry::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawRetry {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay", alias = "base_delay")]
    pub base_delay_secs: f64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_max_delay", alias = "max_delay")]
    pub max_delay_secs: f64,
}

impl Default for RawRetry {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_secs: default_base_delay(),
            backoff_factor: default_backoff_factor(),
            max_delay_secs: default_max_delay(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawHealthCheck {
    /// Startup timeout for services that do not set their own.
    #[serde(default = "default_startup_timeout", alias = "default_timeout")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_check_interval", alias = "check_interval")]
    pub check_interval_secs: f64,
    /// Bound on a single probe request.
    #[serde(default = "default_request_timeout", alias = "timeout_secs")]
    pub request_timeout_secs: f64,
}

impl Default for RawHealthCheck {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_startup_timeout(),
            check_interval_secs: default_check_interval(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct RawRegistry {
    /// `consul`, `local` or `none`.
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_consul_url")]
    pub consul_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_registry_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default = "default_registry_check_timeout")]
    pub check_timeout_secs: u64,
    #[serde(default = "default_deregister_after")]
    pub deregister_critical_after_secs: u64,
}

impl std::fmt::Debug for RawRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawRegistry")
            .field("backend", &self.backend)
            .field("consul_url", &self.consul_url)
            .field("token", if self.token.is_some() { &"<redacted>" } else { &"<not set>" })
            .finish()
    }
}

impl Default for RawRegistry {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            consul_url: default_consul_url(),
            token: None,
            check_interval_secs: default_registry_check_interval(),
            check_timeout_secs: default_registry_check_timeout(),
            deregister_critical_after_secs: default_deregister_after(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_address() -> String {
    "127.0.0.1".to_string()
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_grace_period() -> u64 {
    10
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_delay() -> f64 {
    1.0
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_max_delay() -> f64 {
    30.0
}
fn default_startup_timeout() -> u64 {
    30
}
fn default_check_interval() -> f64 {
    2.0
}
fn default_request_timeout() -> f64 {
    3.0
}
fn default_backend() -> String {
    "none".to_string()
}
fn default_consul_url() -> String {
    "http://127.0.0.1:8500".to_string()
}
fn default_registry_check_interval() -> u64 {
    10
}
fn default_registry_check_timeout() -> u64 {
    3
}
fn default_deregister_after() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_and_keyed_entries_both_parse() {
        let src = r#"
base_services:
  - name: ollama_server
    command: ollama serve
  - tts_server:
      script: /opt/tts/server.py
      use_python: true
      conda_env: /opt/envs/tts
"#;
        let raw: RawConfig = serde_yaml::from_str(src).expect("parse");
        assert_eq!(raw.base_services.len(), 2);
        match &raw.base_services[0] {
            RawEntry::Named(svc) => assert_eq!(svc.name.as_deref(), Some("ollama_server")),
            other => panic!("expected named entry, got {other:?}"),
        }
        match &raw.base_services[1] {
            RawEntry::Keyed(map) => {
                let svc = map.get("tts_server").expect("tts entry");
                assert!(svc.use_python);
                assert!(matches!(svc.command, Some(RawCommand::Line(_))));
            }
            other => panic!("expected keyed entry, got {other:?}"),
        }
    }

    #[test]
    fn legacy_setting_names_are_accepted() {
        let src = r#"
settings:
  retry_config:
    max_retries: 5
    base_delay: 0.5
    max_delay: 8
    backoff_factor: 3
  health_check:
    default_timeout: 45
    check_interval: 1
"#;
        let raw: RawConfig = serde_yaml::from_str(src).expect("parse");
        assert_eq!(raw.settings.retry.max_retries, 5);
        assert_eq!(raw.settings.retry.base_delay_secs, 0.5);
        assert_eq!(raw.settings.retry.max_delay_secs, 8.0);
        assert_eq!(raw.settings.health_check.default_timeout_secs, 45);
    }

    #[test]
    fn defaults_match_documented_values() {
        let raw: RawConfig = serde_yaml::from_str("{}").expect("parse");
        assert_eq!(raw.settings.grace_period_secs, 10);
        assert_eq!(raw.settings.retry.max_retries, 3);
        assert_eq!(raw.settings.health_check.default_timeout_secs, 30);
        assert_eq!(raw.settings.registry.consul_url, "http://127.0.0.1:8500");
        assert_eq!(raw.settings.registry.backend, "none");
    }

    #[test]
    fn registry_debug_redacts_token() {
        let registry = RawRegistry {
            token: Some("acl-secret".to_string()),
            ..RawRegistry::default()
        };
        let debug_str = format!("{registry:?}");
        assert!(!debug_str.contains("acl-secret"));
        assert!(debug_str.contains("<redacted>"));
    }

    #[test]
    fn toml_source_uses_the_same_schema() {
        let src = r#"
[[base_services]]
name = "mysql_proxy"
command = ["python", "proxy.py"]
dependencies = []
"#;
        let raw: RawConfig = toml::from_str(src).expect("parse");
        assert_eq!(raw.base_services.len(), 1);
    }
}
