//! Registry client contract and an in-process registry implementation.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch;

use crate::instance::ServiceInstance;

/// Source of registered service instances.
///
/// Implementations are called from the resolver's worker executor and may block
/// on network I/O.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Returns every instance currently registered under `service_id`.
    ///
    /// # Errors
    /// Returns an error when the registry cannot be queried.
    async fn get_instances(&self, service_id: &str) -> anyhow::Result<Vec<ServiceInstance>>;
}

/// Registry that keeps instances in memory, keyed by service id.
///
/// Every mutation bumps a heartbeat counter published on a `watch` channel, so
/// resolver factories can follow it via
/// [`DiscoveryResolverFactory::watch_heartbeats`](crate::DiscoveryResolverFactory::watch_heartbeats).
pub struct InMemoryRegistry {
    inner: DashMap<String, Vec<ServiceInstance>>,
    heartbeat: watch::Sender<u64>,
}

impl std::fmt::Debug for InMemoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let services: Vec<String> = self.inner.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("InMemoryRegistry")
            .field("services", &services)
            .field("heartbeat", &*self.heartbeat.borrow())
            .finish()
    }
}

impl InMemoryRegistry {
    #[must_use]
    pub fn new() -> Self {
        let (heartbeat, _) = watch::channel(0);
        Self {
            inner: DashMap::new(),
            heartbeat,
        }
    }

    /// Register or update an instance
    pub fn register(&self, instance: ServiceInstance) {
        {
            let mut vec = self.inner.entry(instance.service_id.clone()).or_default();
            // replace by instance_id if it already exists
            if let Some(pos) = vec
                .iter()
                .position(|i| i.instance_id == instance.instance_id)
            {
                vec[pos] = instance;
            } else {
                vec.push(instance);
            }
        }
        self.heartbeat();
    }

    /// Remove an instance. Returns `true` if it was registered.
    pub fn deregister(&self, service_id: &str, instance_id: &str) -> bool {
        let removed = self
            .inner
            .get_mut(service_id)
            .is_some_and(|mut vec| {
                let before = vec.len();
                vec.retain(|i| i.instance_id != instance_id);
                vec.len() != before
            });
        if removed {
            self.heartbeat();
        }
        removed
    }

    /// Replace every instance of a service at once.
    pub fn replace(&self, service_id: &str, instances: Vec<ServiceInstance>) {
        self.inner.insert(service_id.to_owned(), instances);
        self.heartbeat();
    }

    #[must_use]
    pub fn instances_of(&self, service_id: &str) -> Vec<ServiceInstance> {
        self.inner
            .get(service_id)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// Publish a new heartbeat value without changing any registration.
    pub fn heartbeat(&self) {
        self.heartbeat.send_modify(|value| *value += 1);
    }

    /// Subscribe to heartbeat values.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.heartbeat.subscribe()
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryClient for InMemoryRegistry {
    async fn get_instances(&self, service_id: &str) -> anyhow::Result<Vec<ServiceInstance>> {
        Ok(self.instances_of(service_id))
    }
}
