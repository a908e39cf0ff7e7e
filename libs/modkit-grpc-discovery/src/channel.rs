//! Tonic channel wiring for name resolvers.
//!
//! [`discovery_channel`] starts a resolver against a [`BalanceListener`] that
//! turns every published target list into `Insert`/`Remove` changes on a
//! tonic balance channel:
//! - targets are keyed by their `host:port` authority;
//! - an error from the resolver keeps the current endpoints in place;
//! - each endpoint gets the configured timeouts and HTTP/2 keepalive.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tonic::Status;
use tonic::transport::channel::Change;
use tonic::transport::{Channel, Endpoint};
use tracing::Instrument;

use crate::error::ResolverError;
use crate::resolution::{ConfigOrError, ResolutionResult, ResolverListener};
use crate::resolver::NameResolver;
use crate::target::ResolvedTarget;

/// Transport settings for endpoints created from resolved targets.
#[derive(Debug, Clone)]
pub struct GrpcClientConfig {
    /// Timeout for establishing a connection to one endpoint.
    pub connect_timeout: Duration,

    /// Timeout for individual RPC calls (applied at transport level).
    pub rpc_timeout: Duration,

    /// URI scheme endpoints are dialed with, `http` or `https`.
    pub uri_scheme: String,

    /// Capacity of the balance channel's change queue.
    pub balance_buffer: usize,

    /// Log endpoint changes at info level.
    pub enable_tracing: bool,
}

impl Default for GrpcClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(30),
            uri_scheme: "http".to_owned(),
            balance_buffer: 1024,
            enable_tracing: true,
        }
    }
}

impl GrpcClientConfig {
    /// Set the connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the RPC timeout.
    #[must_use]
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Set the URI scheme endpoints are dialed with.
    #[must_use]
    pub fn with_uri_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.uri_scheme = scheme.into();
        self
    }

    /// Set the change queue capacity; zero is raised to one.
    #[must_use]
    pub fn with_balance_buffer(mut self, capacity: usize) -> Self {
        self.balance_buffer = capacity.max(1);
        self
    }

    /// Disable info-level logging of endpoint changes.
    #[must_use]
    pub fn without_tracing(mut self) -> Self {
        self.enable_tracing = false;
        self
    }
}

/// Build a tonic `Endpoint` for `authority` (`host:port`) with timeouts and
/// keepalive settings.
///
/// # Errors
/// Returns an error if `<scheme>://<authority>` is not a valid URI.
pub fn build_endpoint(
    authority: &str,
    cfg: &GrpcClientConfig,
) -> Result<Endpoint, tonic::transport::Error> {
    let endpoint = Endpoint::from_shared(format!("{}://{authority}", cfg.uri_scheme))?
        .connect_timeout(cfg.connect_timeout)
        .timeout(cfg.rpc_timeout)
        .tcp_keepalive(Some(Duration::from_secs(30)))
        .http2_keep_alive_interval(Duration::from_secs(30))
        .keep_alive_timeout(Duration::from_secs(10))
        .keep_alive_while_idle(true);

    Ok(endpoint)
}

/// Feeds resolution results into a balance channel as endpoint changes.
pub struct BalanceListener {
    service: String,
    cfg: GrpcClientConfig,
    current: Mutex<HashSet<String>>,
    changes: mpsc::UnboundedSender<Change<String, Endpoint>>,
}

impl std::fmt::Debug for BalanceListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BalanceListener")
            .field("service", &self.service)
            .field("endpoints", &self.endpoints())
            .finish_non_exhaustive()
    }
}

impl BalanceListener {
    #[must_use]
    pub fn new(
        service: impl Into<String>,
        cfg: GrpcClientConfig,
        changes: mpsc::UnboundedSender<Change<String, Endpoint>>,
    ) -> Self {
        Self {
            service: service.into(),
            cfg,
            current: Mutex::new(HashSet::new()),
            changes,
        }
    }

    /// Authorities currently inserted into the channel, sorted.
    #[must_use]
    pub fn endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = self.current.lock().iter().cloned().collect();
        endpoints.sort();
        endpoints
    }

    fn send(&self, change: Change<String, Endpoint>) {
        if self.changes.send(change).is_err() {
            tracing::debug!(service = %self.service, "Balance channel is gone, dropping endpoint change");
        }
    }
}

impl ResolverListener for BalanceListener {
    fn on_result(&self, result: ResolutionResult) {
        if let Some(ConfigOrError::Error(status)) = &result.service_config {
            tracing::warn!(service = %self.service, error = %status.message(), "Ignoring invalid service config");
        }

        let wanted: Vec<String> = result.addresses.iter().map(ResolvedTarget::authority).collect();
        let mut current = self.current.lock();

        let removed: Vec<String> = current
            .iter()
            .filter(|authority| !wanted.contains(*authority))
            .cloned()
            .collect();
        for authority in removed {
            current.remove(&authority);
            self.send(Change::Remove(authority));
        }

        let mut added = 0_usize;
        for authority in wanted {
            if current.contains(&authority) {
                continue;
            }
            match build_endpoint(&authority, &self.cfg) {
                Ok(endpoint) => {
                    current.insert(authority.clone());
                    self.send(Change::Insert(authority, endpoint));
                    added += 1;
                }
                Err(e) => {
                    tracing::warn!(service = %self.service, %authority, error = %e, "Skipping target with invalid endpoint");
                }
            }
        }

        if self.cfg.enable_tracing {
            tracing::info!(service = %self.service, added, total = current.len(), "Updated balance channel endpoints");
        }
    }

    fn on_error(&self, status: Status) {
        tracing::warn!(
            service = %self.service,
            code = ?status.code(),
            error = %status.message(),
            "Name resolution failed, keeping current endpoints"
        );
    }
}

/// A balance channel kept in sync with a running resolver.
///
/// Dropping it shuts the resolver down.
pub struct DiscoveryChannel {
    channel: Channel,
    resolver: Box<dyn NameResolver>,
    listener: Arc<BalanceListener>,
    forwarder: JoinHandle<()>,
}

impl std::fmt::Debug for DiscoveryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryChannel")
            .field("resolver", &self.resolver)
            .field("listener", &self.listener)
            .finish_non_exhaustive()
    }
}

impl DiscoveryChannel {
    /// A handle to the balanced channel; clones are cheap.
    #[must_use]
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    /// Authorities currently inserted into the channel, sorted.
    #[must_use]
    pub fn endpoints(&self) -> Vec<String> {
        self.listener.endpoints()
    }

    /// Ask the resolver for a new resolution.
    ///
    /// # Errors
    /// Propagates the resolver's refusal, e.g. after shutdown.
    pub fn refresh(&self) -> Result<(), ResolverError> {
        self.resolver.refresh()
    }
}

impl Drop for DiscoveryChannel {
    fn drop(&mut self) {
        self.resolver.shutdown();
        self.forwarder.abort();
    }
}

/// Start `resolver` and route its results into a new tonic balance channel.
///
/// Must be called within a tokio runtime.
///
/// # Errors
/// Returns the resolver's error if it cannot be started.
pub fn discovery_channel(
    resolver: Box<dyn NameResolver>,
    cfg: &GrpcClientConfig,
) -> Result<DiscoveryChannel, ResolverError> {
    let service = resolver.service_authority().to_owned();
    let (channel, balance_tx) = Channel::balance_channel::<String>(cfg.balance_buffer);
    let (changes_tx, mut changes_rx) = mpsc::unbounded_channel();

    let span = tracing::debug_span!("grpc_discovery_channel", service = %service);
    let forwarder = tokio::spawn(
        async move {
            while let Some(change) = changes_rx.recv().await {
                if balance_tx.send(change).await.is_err() {
                    break;
                }
            }
            tracing::debug!("Endpoint forwarder stopped");
        }
        .instrument(span),
    );

    let listener = Arc::new(BalanceListener::new(service, cfg.clone(), changes_tx));
    if let Err(e) = resolver.start(listener.clone()) {
        forwarder.abort();
        return Err(e);
    }

    Ok(DiscoveryChannel {
        channel,
        resolver,
        listener,
        forwarder,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(authorities: &[(&str, u16)]) -> ResolutionResult {
        ResolutionResult::new(
            authorities
                .iter()
                .map(|(host, port)| ResolvedTarget::new(*host, *port))
                .collect(),
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Change<String, Endpoint>>) -> (Vec<String>, Vec<String>) {
        let (mut inserted, mut removed) = (Vec::new(), Vec::new());
        while let Ok(change) = rx.try_recv() {
            match change {
                Change::Insert(key, _) => inserted.push(key),
                Change::Remove(key) => removed.push(key),
            }
        }
        inserted.sort();
        removed.sort();
        (inserted, removed)
    }

    #[test]
    fn test_default_config() {
        let cfg = GrpcClientConfig::default();
        assert_eq!(cfg.connect_timeout, Duration::from_secs(10));
        assert_eq!(cfg.rpc_timeout, Duration::from_secs(30));
        assert_eq!(cfg.uri_scheme, "http");
        assert!(cfg.enable_tracing);
    }

    #[test]
    fn test_build_endpoint() {
        let cfg = GrpcClientConfig::default();
        assert!(build_endpoint("10.0.0.1:9090", &cfg).is_ok());
        assert!(build_endpoint("[::1]:9090", &cfg).is_ok());
        assert!(build_endpoint("bad host:9090", &cfg).is_err());
    }

    #[test]
    fn listener_sends_only_the_difference() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = BalanceListener::new("orders", GrpcClientConfig::default(), tx);

        listener.on_result(result(&[("10.0.0.1", 9090), ("10.0.0.2", 8080)]));
        let (inserted, removed) = drain(&mut rx);
        assert_eq!(inserted, vec!["10.0.0.1:9090", "10.0.0.2:8080"]);
        assert!(removed.is_empty());

        listener.on_result(result(&[("10.0.0.2", 8080), ("10.0.0.3", 8080)]));
        let (inserted, removed) = drain(&mut rx);
        assert_eq!(inserted, vec!["10.0.0.3:8080"]);
        assert_eq!(removed, vec!["10.0.0.1:9090"]);
        assert_eq!(listener.endpoints(), vec!["10.0.0.2:8080", "10.0.0.3:8080"]);
    }

    #[test]
    fn errors_keep_current_endpoints() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = BalanceListener::new("orders", GrpcClientConfig::default(), tx);
        listener.on_result(result(&[("10.0.0.1", 9090)]));
        drain(&mut rx);

        listener.on_error(Status::unavailable("No servers found for orders"));
        assert_eq!(drain(&mut rx), (Vec::new(), Vec::new()));
        assert_eq!(listener.endpoints(), vec!["10.0.0.1:9090"]);
    }

    #[test]
    fn invalid_targets_are_skipped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = BalanceListener::new("orders", GrpcClientConfig::default(), tx);
        listener.on_result(result(&[("bad host", 9090), ("10.0.0.1", 9090)]));
        let (inserted, _) = drain(&mut rx);
        assert_eq!(inserted, vec!["10.0.0.1:9090"]);
    }
}
