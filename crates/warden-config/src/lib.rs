//! Configuration loader – turns a YAML (or TOML) service file into a
//! validated [`WardenConfig`].
//!
//! Loading is all-or-nothing: missing names or commands, duplicate names,
//! unknown dependencies and unknown `${placeholders}` are reported as a
//! [`ConfigError`] and nothing is returned. Once loaded, definitions are
//! never re-validated by the supervisor.
//!
//! # Environment variables
//!
//! | Variable | Effect |
//! |---|---|
//! | `WARDEN_LOG_DIR` | Overrides `settings.log_dir`. |
//! | `WARDEN_CONSUL_URL` | Switches the registry backend to Consul at this URL. |
//! | `WARDEN_CONSUL_TOKEN` | ACL token sent to Consul. |
//! | `WARDEN_GRACE_PERIOD_SECS` | Overrides `settings.grace_period_secs`. |

pub mod model;
pub mod raw;
pub mod substitute;

pub use model::{
    HealthSettings, RegistryBackend, RegistrySettings, ServiceSet, Settings, WardenConfig,
};

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};
use warden_types::WardenError;

use crate::raw::RawConfig;

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("unsupported config format {0:?}; expected .yaml, .yml or .toml")]
    UnsupportedFormat(String),

    #[error("{service}: missing required field `{field}`")]
    MissingField { service: String, field: &'static str },

    #[error("duplicate service name {0:?}")]
    Duplicate(String),

    #[error("{service} depends on undeclared service {dependency:?}")]
    UnknownDependency { service: String, dependency: String },

    #[error("unknown variable ${{{0}}}")]
    UnknownVariable(String),

    #[error("unterminated placeholder in {0:?}")]
    UnterminatedPlaceholder(String),

    #[error("variable cycle: {0}")]
    VariableCycle(String),

    #[error("unknown environment {0:?}")]
    UnknownEnvironment(String),

    #[error("{service}: {reason}")]
    Invalid { service: String, reason: String },

    #[error("invalid setting {field}: {reason}")]
    InvalidSetting { field: &'static str, reason: String },
}

impl From<ConfigError> for WardenError {
    fn from(e: ConfigError) -> Self {
        WardenError::Config(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────────────────

/// Source syntax, chosen from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Toml,
}

impl Format {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Ok(Format::Yaml),
            Some("toml") => Ok(Format::Toml),
            other => Err(ConfigError::UnsupportedFormat(other.unwrap_or("").to_string())),
        }
    }
}

/// Caller-side knobs applied while loading.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Name of the `environments:` overlay to apply.
    pub environment: Option<String>,
    /// Extra variables that win over both `vars` and the overlay.
    pub overrides: BTreeMap<String, String>,
}

/// Read and validate the config file at `path`.
pub fn load(path: &Path, opts: &LoadOptions) -> Result<WardenConfig, ConfigError> {
    let format = Format::from_path(path)?;
    let src = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let cfg = parse_str(&src, format, opts)?;
    info!(
        path = %path.display(),
        services = cfg.services.len(),
        environment = opts.environment.as_deref().unwrap_or("default"),
        "Configuration loaded"
    );
    Ok(cfg)
}

/// Parse and validate an in-memory config source.
pub fn parse_str(src: &str, format: Format, opts: &LoadOptions) -> Result<WardenConfig, ConfigError> {
    let raw: RawConfig = match format {
        Format::Yaml => serde_yaml::from_str(src).map_err(|e| ConfigError::Parse(e.to_string()))?,
        Format::Toml => toml::from_str(src).map_err(|e| ConfigError::Parse(e.to_string()))?,
    };
    let cfg = model::build(raw, opts.environment.as_deref(), &opts.overrides)?;
    for def in cfg.services.iter() {
        debug!(service = %def.name, class = %def.class, deps = ?def.dependencies, "Service definition validated");
    }
    Ok(cfg)
}

/// Apply `WARDEN_*` environment variable overrides to `cfg`.
///
/// Invalid numeric values are ignored and the loaded value is kept.
pub fn apply_env_overrides(cfg: &mut WardenConfig) {
    if let Ok(v) = std::env::var("WARDEN_LOG_DIR") {
        cfg.settings.log_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("WARDEN_CONSUL_URL") {
        let token = match &cfg.settings.registry.backend {
            RegistryBackend::Consul { token, .. } => token.clone(),
            _ => None,
        };
        cfg.settings.registry.backend = RegistryBackend::Consul {
            url: v.trim_end_matches('/').to_string(),
            token,
        };
    }
    if let Ok(v) = std::env::var("WARDEN_CONSUL_TOKEN")
        && let RegistryBackend::Consul { token, .. } = &mut cfg.settings.registry.backend {
            *token = Some(v);
        }
    if let Ok(v) = std::env::var("WARDEN_GRACE_PERIOD_SECS")
        && let Ok(secs) = v.parse::<u64>() {
            cfg.settings.grace_period = Duration::from_secs(secs);
        }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
