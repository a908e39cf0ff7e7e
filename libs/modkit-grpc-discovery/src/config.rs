//! Resolver configuration.
//!
//! Configuration is layered with figment:
//!
//! 1. built-in defaults ([`DiscoveryConfig::default`])
//! 2. an optional YAML file
//! 3. environment variables with the `APP__` prefix and `__` as separator,
//!    e.g. `APP__GRPC_DISCOVERY__WORKER_THREADS=4`
//!
//! Only the [`DiscoveryConfig::SECTION`] section of the merged document is read.

use std::path::Path;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};

/// Configuration error for discovery config loading
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("config file does not exist: {0}")]
    MissingFile(String),
    #[error("invalid '{section}' config: {source}")]
    Invalid {
        section: &'static str,
        #[source]
        source: Box<figment::Error>,
    },
}

/// Metadata keys read from registered instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetadataKeys {
    /// Key carrying the gRPC port of an instance.
    pub port_key: String,
    /// Deprecated spelling of `port_key`, still honored with a warning.
    pub legacy_port_key: String,
    /// Key carrying a JSON gRPC service config.
    pub service_config_key: String,
}

impl Default for MetadataKeys {
    fn default() -> Self {
        Self {
            port_key: "gRPC_port".to_owned(),
            legacy_port_key: "gRPC.port".to_owned(),
            service_config_key: "gRPC_service_config".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoveryConfig {
    /// URI scheme served by the discovery resolver factory.
    pub scheme: String,
    /// Provider priority; higher wins when several providers serve one scheme.
    pub priority: u8,
    pub metadata: MetadataKeys,
    /// Threads of the shared worker runtime used when no offload executor is supplied.
    pub worker_threads: usize,
    pub worker_thread_name: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            scheme: crate::factory::DISCOVERY_SCHEME.to_owned(),
            priority: 6,
            metadata: MetadataKeys::default(),
            worker_threads: 1,
            worker_thread_name: "grpc-discovery-worker".to_owned(),
        }
    }
}

impl DiscoveryConfig {
    pub const SECTION: &'static str = "grpc_discovery";

    /// Base figment: defaults, then the YAML file (if any), then `APP__*` env vars.
    ///
    /// # Errors
    /// Returns `ConfigError::MissingFile` if `path` is given but is not a file.
    pub fn figment(path: Option<&Path>) -> Result<Figment, ConfigError> {
        let mut figment =
            Figment::new().merge(Serialized::default(Self::SECTION, Self::default()));
        if let Some(path) = path {
            if !path.is_file() {
                return Err(ConfigError::MissingFile(path.display().to_string()));
            }
            figment = figment.merge(Yaml::file(path));
        }
        Ok(figment.merge(Env::prefixed("APP__").split("__")))
    }

    /// Extract the discovery section from an already assembled figment.
    ///
    /// A missing section yields the defaults.
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` if the section exists but cannot be deserialized.
    pub fn from_figment(figment: &Figment) -> Result<Self, ConfigError> {
        if !figment.contains(Self::SECTION) {
            return Ok(Self::default());
        }
        figment
            .extract_inner(Self::SECTION)
            .map_err(|e| ConfigError::Invalid {
                section: Self::SECTION,
                source: Box::new(e),
            })
    }

    /// Load the configuration with the layering described in the module docs.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file is missing or the section is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::from_figment(&Self::figment(path)?)
    }
}
