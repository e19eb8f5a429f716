//! Service discovery: publish started services and resolve names to live
//! addresses.
//!
//! Two [`ServiceRegistry`] backends are provided:
//!
//! | Backend | Health monitoring |
//! |---|---|
//! | [`ConsulRegistry`] | Consul agent HTTP checks registered with each entry |
//! | [`LocalRegistry`] | In-process probe sweep ([`LocalRegistry::refresh`]) |
//!
//! Lookups only return entries that currently pass health monitoring. An
//! empty result means "unavailable" and is not an error.

pub mod consul;
pub mod local;

pub use consul::{ConsulCheck, ConsulRegistry};
pub use local::LocalRegistry;

use async_trait::async_trait;
use thiserror::Error;
use warden_types::{Endpoint, RegistryEntry, WardenError};

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Transport failure or a 5xx answer; worth reconnecting.
    #[error("registry unreachable: {0}")]
    Unreachable(String),

    /// The registry understood the request and refused it.
    #[error("registry rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("malformed registry response: {0}")]
    Decode(String),

    #[error("invalid registry URL: {0}")]
    InvalidUrl(String),
}

impl From<RegistryError> for WardenError {
    fn from(e: RegistryError) -> Self {
        WardenError::Registry(e.to_string())
    }
}

#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Publish `entry`. Registering an existing id replaces it.
    async fn register(&self, entry: &RegistryEntry) -> Result<(), RegistryError>;

    /// Live addresses of `service`; empty when no instance is passing.
    async fn resolve(&self, service: &str) -> Result<Vec<Endpoint>, RegistryError>;

    /// Remove the entry with `id`. Unknown ids are not an error.
    async fn deregister(&self, id: &str) -> Result<(), RegistryError>;

    /// Names of every registered service.
    async fn services(&self) -> Result<Vec<String>, RegistryError>;

    /// Short backend name for logs.
    fn backend(&self) -> &'static str;
}
