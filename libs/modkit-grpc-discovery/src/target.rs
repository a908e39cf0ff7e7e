//! Conversion of registry instances into connection targets.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::config::MetadataKeys;
use crate::error::ResolverError;
use crate::instance::ServiceInstance;

/// Attribute key for the logical service name a target was resolved for.
pub const SERVICE_NAME_KEY: &str = "serviceName";
/// Attribute key for the registry instance id a target was derived from.
pub const INSTANCE_ID_KEY: &str = "instanceId";

/// Resolver-scoped metadata attached to a target, for load-balancing policies
/// that need to map connections back to registry entries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Attributes(BTreeMap<String, String>);

impl Attributes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A concrete endpoint the connection layer should dial.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub host: String,
    pub port: u16,
    pub attributes: Attributes,
}

impl ResolvedTarget {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            attributes: Attributes::new(),
        }
    }

    #[must_use]
    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// `host:port`, with IPv6 literals bracketed.
    #[must_use]
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for ResolvedTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

/// Derives targets and ports from registry instances of one logical service.
#[derive(Clone, Debug)]
pub struct TargetExtractor {
    service_name: Arc<str>,
    keys: MetadataKeys,
}

impl TargetExtractor {
    #[must_use]
    pub fn new(service_name: impl Into<Arc<str>>, keys: MetadataKeys) -> Self {
        Self {
            service_name: service_name.into(),
            keys,
        }
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    #[must_use]
    pub fn keys(&self) -> &MetadataKeys {
        &self.keys
    }

    /// gRPC port of an instance.
    ///
    /// Lookup order: the port key, then the legacy key (logged as deprecated),
    /// then the instance's declared port.
    ///
    /// # Errors
    /// Returns `ResolverError::InvalidPort` if the metadata value is not a valid port.
    pub fn grpc_port(&self, instance: &ServiceInstance) -> Result<u16, ResolverError> {
        let value = match instance.metadata_value(&self.keys.port_key) {
            Some(value) => value,
            None => match instance.metadata_value(&self.keys.legacy_port_key) {
                Some(value) => {
                    tracing::warn!(
                        service = %self.service_name,
                        instance_id = %instance.instance_id,
                        legacy_key = %self.keys.legacy_port_key,
                        key = %self.keys.port_key,
                        "Found legacy grpc port metadata, use the current key instead"
                    );
                    value
                }
                None => return Ok(instance.port),
            },
        };

        value
            .parse::<u16>()
            .map_err(|source| ResolverError::InvalidPort {
                service: self.service_name.to_string(),
                instance_id: instance.instance_id.clone(),
                value: value.to_owned(),
                source,
            })
    }

    #[must_use]
    pub fn attributes(&self, instance: &ServiceInstance) -> Attributes {
        Attributes::new()
            .with(SERVICE_NAME_KEY, &*self.service_name)
            .with(INSTANCE_ID_KEY, instance.instance_id.as_str())
    }

    /// # Errors
    /// Returns `ResolverError::InvalidPort` if the port metadata is malformed.
    pub fn to_target(&self, instance: &ServiceInstance) -> Result<ResolvedTarget, ResolverError> {
        let port = self.grpc_port(instance)?;
        tracing::debug!(
            service = %self.service_name,
            host = %instance.host,
            port,
            "Found gRPC server"
        );
        Ok(ResolvedTarget::new(instance.host.clone(), port).with_attributes(self.attributes(instance)))
    }

    /// # Errors
    /// Fails on the first instance with malformed port metadata.
    pub fn to_targets(
        &self,
        instances: &[ServiceInstance],
    ) -> Result<Vec<ResolvedTarget>, ResolverError> {
        instances.iter().map(|i| self.to_target(i)).collect()
    }
}
