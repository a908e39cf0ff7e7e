use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DiscoveryConfig;
use crate::error::ResolverError;
use crate::executor::SharedWorkerPool;
use crate::heartbeat::HeartbeatMonitor;
use crate::provider::{NameResolverProvider, TargetUri};
use crate::registry::RegistryClient;
use crate::resolver::{DiscoveryResolver, NameResolver, ResolverArgs, ResolverId};

pub const DISCOVERY_SCHEME: &str = "discovery";

type LiveResolvers = DashMap<ResolverId, DiscoveryResolver>;

/// Creates [`DiscoveryResolver`]s for `discovery:[//authority]/<service>`
/// targets and forwards registry heartbeats to them.
///
/// Resolvers are tracked from creation until their shutdown. All of them share
/// one worker pool, built lazily from the factory config.
pub struct DiscoveryResolverFactory {
    client: Arc<dyn RegistryClient>,
    config: DiscoveryConfig,
    pool: Arc<SharedWorkerPool>,
    resolvers: Arc<LiveResolvers>,
    monitor: HeartbeatMonitor<u64>,
}

impl fmt::Debug for DiscoveryResolverFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryResolverFactory")
            .field("scheme", &self.config.scheme)
            .field("priority", &self.config.priority)
            .field("live_resolvers", &self.resolvers.len())
            .finish_non_exhaustive()
    }
}

impl DiscoveryResolverFactory {
    #[must_use]
    pub fn new(client: Arc<dyn RegistryClient>, config: DiscoveryConfig) -> Self {
        let pool = Arc::new(SharedWorkerPool::new(
            config.worker_threads,
            config.worker_thread_name.clone(),
        ));
        Self {
            client,
            config,
            pool,
            resolvers: Arc::new(DashMap::new()),
            monitor: HeartbeatMonitor::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Create a resolver for `target`, or `Ok(None)` for another scheme.
    ///
    /// # Errors
    /// Returns `ResolverError::InvalidTarget` if the path does not name a
    /// service, e.g. `discovery:///` or `discovery:orders`.
    pub fn new_resolver(
        &self,
        target: &TargetUri,
        args: &ResolverArgs,
    ) -> Result<Option<DiscoveryResolver>, ResolverError> {
        if !target.scheme().eq_ignore_ascii_case(&self.config.scheme) {
            return Ok(None);
        }
        let Some(service) = target.path().strip_prefix('/').filter(|s| !s.is_empty()) else {
            return Err(ResolverError::invalid_target(
                &self.config.scheme,
                target.as_str(),
            ));
        };

        let resolver = DiscoveryResolver::new(
            service,
            Arc::clone(&self.client),
            args,
            self.config.metadata.clone(),
            Arc::clone(&self.pool),
        );
        let live = Arc::downgrade(&self.resolvers);
        resolver.on_shutdown(move |id| {
            if let Some(live) = live.upgrade() {
                live.remove(&id);
            }
        });
        self.resolvers.insert(resolver.id(), resolver.clone());
        tracing::debug!(service, id = %resolver.id(), "Created discovery resolver");
        Ok(Some(resolver))
    }

    /// Handle a registry heartbeat; returns the number of resolvers asked to
    /// refresh (zero for a repeated value).
    pub fn heartbeat(&self, value: u64) -> usize {
        if !self.monitor.update(value) {
            return 0;
        }
        // refresh outside the map guards; a refresh may end in a listener that shuts its resolver down
        let live: Vec<DiscoveryResolver> =
            self.resolvers.iter().map(|entry| entry.value().clone()).collect();
        for resolver in &live {
            resolver.refresh_from_external();
        }
        tracing::trace!(value, refreshed = live.len(), "Processed registry heartbeat");
        live.len()
    }

    /// Feed every value published on `heartbeats` into [`heartbeat`](Self::heartbeat)
    /// until `cancel` fires or the sender goes away.
    pub fn watch_heartbeats(
        self: &Arc<Self>,
        mut heartbeats: watch::Receiver<u64>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let factory = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    changed = heartbeats.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let value = *heartbeats.borrow_and_update();
                        factory.heartbeat(value);
                    }
                }
            }
            tracing::debug!("Heartbeat watcher stopped");
        })
    }

    /// Resolvers created and not yet shut down.
    #[must_use]
    pub fn live_resolvers(&self) -> usize {
        self.resolvers.len()
    }

    /// Forget all tracked resolvers. They keep running until shut down by
    /// their channels but no longer receive heartbeats.
    pub fn destroy(&self) {
        self.resolvers.clear();
    }
}

impl NameResolverProvider for DiscoveryResolverFactory {
    fn scheme(&self) -> &str {
        &self.config.scheme
    }

    fn priority(&self) -> u8 {
        self.config.priority
    }

    fn new_name_resolver(
        &self,
        target: &TargetUri,
        args: &ResolverArgs,
    ) -> Result<Option<Box<dyn NameResolver>>, ResolverError> {
        Ok(self
            .new_resolver(target, args)?
            .map(|resolver| Box::new(resolver) as Box<dyn NameResolver>))
    }
}
