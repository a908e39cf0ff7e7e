use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One registered instance of a logical service, as returned by the registry.
///
/// Instances are immutable snapshots; every poll fetches a fresh list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub service_id: String,
    pub instance_id: String,
    pub host: String,
    /// Port declared by the registration itself, used when no gRPC port metadata exists.
    pub port: u16,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ServiceInstance {
    #[must_use]
    pub fn new(
        service_id: impl Into<String>,
        instance_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            instance_id: instance_id.into(),
            host: host.into(),
            port,
            metadata: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}
