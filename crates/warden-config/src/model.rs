//! Validated configuration and the raw → typed conversion.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use warden_types::{
    BackoffPolicy, DiscoverySpec, Launcher, ServiceClass, ServiceDefinition,
};

use crate::ConfigError;
use crate::raw::{RawCommand, RawConfig, RawEntry, RawRegistry, RawService, RawSettings};
use crate::substitute::{resolve_vars, substitute};

// ─────────────────────────────────────────────────────────────────────────────
// Typed settings
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct HealthSettings {
    /// Pause between health polls while a service is starting.
    pub check_interval: Duration,
    /// Bound on a single probe request.
    pub request_timeout: Duration,
    /// Startup timeout for services that do not declare their own.
    pub default_startup_timeout: Duration,
}

/// Where started services are published.
#[derive(Clone, PartialEq)]
pub enum RegistryBackend {
    None,
    /// In-process registry with its own health monitor.
    Local,
    Consul { url: String, token: Option<String> },
}

impl std::fmt::Debug for RegistryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryBackend::None => write!(f, "None"),
            RegistryBackend::Local => write!(f, "Local"),
            RegistryBackend::Consul { url, token } => f
                .debug_struct("Consul")
                .field("url", url)
                .field("token", if token.is_some() { &"<redacted>" } else { &"<not set>" })
                .finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegistrySettings {
    pub backend: RegistryBackend,
    /// Interval of the registry's own health monitoring.
    pub check_interval: Duration,
    pub check_timeout: Duration,
    pub deregister_critical_after: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub log_dir: PathBuf,
    /// Time between the graceful signal and the forced kill.
    pub grace_period: Duration,
    pub retry: BackoffPolicy,
    pub health: HealthSettings,
    pub registry: RegistrySettings,
}

/// Service definitions in declaration order: base services first, then
/// optional services, each group in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceSet {
    services: Vec<ServiceDefinition>,
}

impl ServiceSet {
    pub fn new(services: Vec<ServiceDefinition>) -> Self {
        Self { services }
    }

    pub fn get(&self, name: &str) -> Option<&ServiceDefinition> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceDefinition> {
        self.services.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.iter().map(|s| s.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn as_slice(&self) -> &[ServiceDefinition] {
        &self.services
    }
}

/// The fully validated result of loading a config file.
#[derive(Debug, Clone, PartialEq)]
pub struct WardenConfig {
    pub settings: Settings,
    pub services: ServiceSet,
}

// ─────────────────────────────────────────────────────────────────────────────
// Conversion
// ─────────────────────────────────────────────────────────────────────────────

/// Validate `raw`, applying the selected environment overlay and `overrides`
/// (highest precedence) to the substitution variables.
pub(crate) fn build(
    raw: RawConfig,
    environment: Option<&str>,
    overrides: &BTreeMap<String, String>,
) -> Result<WardenConfig, ConfigError> {
    let mut vars = raw.vars.clone();
    if let Some(env) = environment {
        let overlay = raw
            .environments
            .get(env)
            .ok_or_else(|| ConfigError::UnknownEnvironment(env.to_string()))?;
        vars.extend(overlay.vars.clone());
    }
    vars.extend(overrides.clone());
    let vars = resolve_vars(&vars)?;

    let settings = build_settings(&raw.settings, &vars)?;

    let mut entries: Vec<(ServiceClass, RawEntry)> = Vec::new();
    let groups = raw.external_services.unwrap_or_default();
    for e in raw.base_services.into_iter().chain(groups.base_services) {
        entries.push((ServiceClass::Base, e));
    }
    for e in raw.optional_services.into_iter().chain(groups.optional_services) {
        entries.push((ServiceClass::Optional, e));
    }

    let mut services = Vec::with_capacity(entries.len());
    let mut seen = HashSet::new();
    for (index, (class, entry)) in entries.into_iter().enumerate() {
        let def = build_service(index, class, entry, &settings, &vars)?;
        if !seen.insert(def.name.clone()) {
            return Err(ConfigError::Duplicate(def.name));
        }
        services.push(def);
    }

    for def in &services {
        for dep in &def.dependencies {
            if !seen.contains(dep) {
                return Err(ConfigError::UnknownDependency {
                    service: def.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    Ok(WardenConfig {
        settings,
        services: ServiceSet::new(services),
    })
}

fn build_settings(raw: &RawSettings, vars: &BTreeMap<String, String>) -> Result<Settings, ConfigError> {
    let retry = &raw.retry;
    let secs = |field: &'static str, v: f64| -> Result<Duration, ConfigError> {
        Duration::try_from_secs_f64(v).map_err(|_| ConfigError::InvalidSetting {
            field,
            reason: format!("{v} is not a valid number of seconds"),
        })
    };

    if raw.health_check.default_timeout_secs == 0 {
        return Err(ConfigError::InvalidSetting {
            field: "health_check.default_timeout",
            reason: "must be greater than zero".into(),
        });
    }
    if !(retry.backoff_factor.is_finite() && retry.backoff_factor > 0.0) {
        return Err(ConfigError::InvalidSetting {
            field: "retry.backoff_factor",
            reason: format!("{} must be a positive number", retry.backoff_factor),
        });
    }

    let check_interval = secs("health_check.check_interval", raw.health_check.check_interval_secs)?;
    if check_interval.is_zero() {
        return Err(ConfigError::InvalidSetting {
            field: "health_check.check_interval",
            reason: "must be greater than zero".into(),
        });
    }

    Ok(Settings {
        log_dir: PathBuf::from(substitute(&raw.log_dir, vars)?),
        grace_period: Duration::from_secs(raw.grace_period_secs),
        retry: BackoffPolicy {
            max_retries: retry.max_retries,
            base_delay: secs("retry.base_delay", retry.base_delay_secs)?,
            backoff_factor: retry.backoff_factor,
            max_delay: secs("retry.max_delay", retry.max_delay_secs)?,
        },
        health: HealthSettings {
            check_interval,
            request_timeout: secs("health_check.request_timeout", raw.health_check.request_timeout_secs)?
                .max(Duration::from_millis(1)),
            default_startup_timeout: Duration::from_secs(raw.health_check.default_timeout_secs),
        },
        registry: build_registry(&raw.registry, vars)?,
    })
}

fn build_registry(raw: &RawRegistry, vars: &BTreeMap<String, String>) -> Result<RegistrySettings, ConfigError> {
    let backend = match raw.backend.as_str() {
        "none" => RegistryBackend::None,
        "local" => RegistryBackend::Local,
        "consul" => {
            let url = substitute(&raw.consul_url, vars)?;
            if !is_http_url(&url) {
                return Err(ConfigError::InvalidSetting {
                    field: "registry.consul_url",
                    reason: format!("{url} is not an http(s) URL"),
                });
            }
            RegistryBackend::Consul {
                url: url.trim_end_matches('/').to_string(),
                token: raw.token.clone(),
            }
        }
        other => {
            return Err(ConfigError::InvalidSetting {
                field: "registry.backend",
                reason: format!("unknown backend {other:?}; expected consul, local or none"),
            });
        }
    };

    Ok(RegistrySettings {
        backend,
        check_interval: Duration::from_secs(raw.check_interval_secs.max(1)),
        check_timeout: Duration::from_secs(raw.check_timeout_secs.max(1)),
        deregister_critical_after: Duration::from_secs(raw.deregister_critical_after_secs),
    })
}

fn build_service(
    index: usize,
    class: ServiceClass,
    entry: RawEntry,
    settings: &Settings,
    vars: &BTreeMap<String, String>,
) -> Result<ServiceDefinition, ConfigError> {
    let (name, raw) = match entry {
        RawEntry::Named(raw) => match raw.name.clone() {
            Some(name) => (name, raw),
            None => {
                return Err(ConfigError::MissingField {
                    service: format!("entry #{}", index + 1),
                    field: "name",
                });
            }
        },
        RawEntry::Keyed(map) => {
            let count = map.len();
            let mut iter = map.into_iter();
            match (iter.next(), iter.next()) {
                (Some((key, raw)), None) => (raw.name.clone().unwrap_or(key), raw),
                _ => {
                    return Err(ConfigError::Invalid {
                        service: format!("entry #{}", index + 1),
                        reason: format!("keyed entry must have exactly one key, found {count}"),
                    });
                }
            }
        }
    };
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(ConfigError::MissingField {
            service: format!("entry #{}", index + 1),
            field: "name",
        });
    }

    let invalid = |reason: String| ConfigError::Invalid {
        service: name.clone(),
        reason,
    };
    let sub = |s: &str| substitute(s, vars);

    let RawService {
        command,
        args,
        environment,
        conda_env,
        use_python,
        shell,
        working_dir,
        run_in_background,
        is_base,
        log_file,
        startup_timeout,
        health_check_url,
        dependencies,
        discovery,
        external,
        ..
    } = raw;

    let mut words: Vec<String> = match command {
        Some(RawCommand::Line(line)) => sub(&line)?.split_whitespace().map(str::to_string).collect(),
        Some(RawCommand::Words(words)) => words.iter().map(|w| sub(w)).collect::<Result<_, _>>()?,
        None => Vec::new(),
    };
    for arg in &args {
        words.push(sub(arg)?);
    }
    if words.is_empty() && !external {
        return Err(ConfigError::MissingField {
            service: name.clone(),
            field: "command",
        });
    }

    if use_python && shell {
        return Err(invalid("use_python and shell are mutually exclusive".into()));
    }
    let conda_env = conda_env.map(|p| sub(&p)).transpose()?.map(PathBuf::from);
    let launcher = if use_python {
        if conda_env.is_none() {
            return Err(invalid("use_python requires conda_env".into()));
        }
        Launcher::Python
    } else if shell {
        Launcher::Shell
    } else {
        Launcher::Direct
    };

    let working_dir = match working_dir {
        Some(dir) => Some(PathBuf::from(sub(&dir)?)),
        // Python scripts run next to their source file.
        None if launcher == Launcher::Python => words
            .first()
            .map(Path::new)
            .filter(|p| p.is_absolute())
            .and_then(Path::parent)
            .map(Path::to_path_buf),
        None => None,
    };

    let environment = environment
        .into_iter()
        .map(|(k, v)| Ok((k, sub(&v)?)))
        .collect::<Result<BTreeMap<_, _>, ConfigError>>()?;

    let startup_timeout = match startup_timeout {
        Some(0) => return Err(invalid("startup_timeout must be greater than zero".into())),
        Some(secs) => Duration::from_secs(secs),
        None => settings.health.default_startup_timeout,
    };

    let health_check_url = match health_check_url {
        Some(url) => {
            let url = sub(&url)?;
            if !is_http_url(&url) {
                return Err(invalid(format!("health_check_url {url} is not an http(s) URL")));
            }
            Some(url)
        }
        None => None,
    };

    let discovery = match discovery {
        Some(d) => {
            if d.port == 0 {
                return Err(invalid("discovery.port must be non-zero".into()));
            }
            Some(DiscoverySpec {
                service_id: match d.service_id {
                    Some(id) => sub(&id)?,
                    None => format!("{name}-1"),
                },
                address: sub(&d.address)?,
                port: d.port,
                tags: d.tags,
            })
        }
        None => None,
    };

    if external && health_check_url.is_none() && discovery.is_none() {
        return Err(invalid(
            "external services need a health_check_url or a discovery section".into(),
        ));
    }

    let class = match is_base {
        Some(true) => ServiceClass::Base,
        Some(false) => ServiceClass::Optional,
        None => class,
    };

    Ok(ServiceDefinition {
        name,
        command: words,
        launcher,
        working_dir,
        environment,
        conda_env,
        run_in_background,
        log_file: log_file.map(|f| sub(&f)).transpose()?,
        startup_timeout,
        health_check_url,
        dependencies,
        class,
        discovery,
        external,
    })
}

fn is_http_url(url: &str) -> bool {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"));
    matches!(rest, Some(host) if !host.is_empty())
}
