//! Registry-backed name resolver.
//!
//! A poll is split in two halves:
//!
//! - fetch and compute, on the worker executor: query the registry, diff the
//!   answer against the last published snapshot, build targets and config;
//! - commit, on the synchronization context: clear the in-flight flag, store
//!   the new snapshot and notify the listener, unless the resolver was shut
//!   down in the meantime.
//!
//! All resolver state is only mutated by lifecycle calls and by commit tasks,
//! and the listener is only ever called from commit tasks.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use parking_lot::Mutex;
use tonic::Status;

use crate::config::MetadataKeys;
use crate::differ::needs_update;
use crate::error::ResolverError;
use crate::executor::{OffloadExecutor, SharedWorkerPool};
use crate::instance::ServiceInstance;
use crate::registry::RegistryClient;
use crate::resolution::{ResolutionResult, ResolverListener};
use crate::service_config::{DefaultServiceConfigParser, ServiceConfigParser, resolve_service_config};
use crate::sync_context::SynchronizationContext;
use crate::target::TargetExtractor;

/// Translates a logical target into network targets, on demand.
///
/// Lifecycle calls are expected to be serialized by the caller, typically by
/// issuing them from the channel's [`SynchronizationContext`].
pub trait NameResolver: Send + Sync + fmt::Debug {
    /// Authority the channel should use for this target.
    fn service_authority(&self) -> &str;

    /// Start resolving and report results to `listener`.
    ///
    /// # Errors
    /// Returns `ResolverError::IllegalState` unless the resolver is freshly created.
    fn start(&self, listener: Arc<dyn ResolverListener>) -> Result<(), ResolverError>;

    /// Ask for a new resolution.
    ///
    /// # Errors
    /// Returns `ResolverError::IllegalState` if the resolver is not started.
    fn refresh(&self) -> Result<(), ResolverError>;

    /// Stop resolving. Idempotent.
    fn shutdown(&self);
}

/// Channel-supplied collaborators of a resolver.
#[derive(Clone)]
pub struct ResolverArgs {
    pub sync_context: Arc<SynchronizationContext>,
    /// Executor for polls; when `None` the resolver borrows a shared worker pool.
    pub offload_executor: Option<Arc<dyn OffloadExecutor>>,
    pub service_config_parser: Arc<dyn ServiceConfigParser>,
    /// Port for targets that do not name one.
    pub default_port: Option<u16>,
}

impl fmt::Debug for ResolverArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverArgs")
            .field("sync_context", &self.sync_context)
            .field("offload_executor", &self.offload_executor.is_some())
            .field("default_port", &self.default_port)
            .finish_non_exhaustive()
    }
}

impl ResolverArgs {
    /// Args with the default service config parser and no offload executor.
    #[must_use]
    pub fn new(sync_context: Arc<SynchronizationContext>) -> Self {
        Self {
            sync_context,
            offload_executor: None,
            service_config_parser: Arc::new(DefaultServiceConfigParser),
            default_port: None,
        }
    }

    /// Run polls on `executor` instead of the shared worker pool.
    #[must_use]
    pub fn with_offload_executor(mut self, executor: Arc<dyn OffloadExecutor>) -> Self {
        self.offload_executor = Some(executor);
        self
    }

    /// Set the service config parser.
    #[must_use]
    pub fn with_service_config_parser(mut self, parser: Arc<dyn ServiceConfigParser>) -> Self {
        self.service_config_parser = parser;
        self
    }

    /// Set the port used for targets that do not name one.
    #[must_use]
    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = Some(port);
        self
    }
}

/// Process-unique resolver identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResolverId(u64);

impl ResolverId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ResolverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resolver-{}", self.0)
    }
}

type ShutdownHook = Box<dyn FnOnce(ResolverId) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Created,
    Started,
    Shutdown,
}

struct State {
    phase: Phase,
    listener: Option<Arc<dyn ResolverListener>>,
    executor: Option<Arc<dyn OffloadExecutor>>,
    resolving: bool,
    /// What the listener was last told.
    instances: Arc<[ServiceInstance]>,
}

enum PollOutcome {
    KeepPrevious,
    Publish {
        result: ResolutionResult,
        instances: Arc<[ServiceInstance]>,
    },
    Failed(Status),
}

fn empty_snapshot() -> Arc<[ServiceInstance]> {
    Arc::from(Vec::new())
}

struct Inner {
    id: ResolverId,
    name: Arc<str>,
    client: Arc<dyn RegistryClient>,
    sync_context: Arc<SynchronizationContext>,
    offload_executor: Option<Arc<dyn OffloadExecutor>>,
    pool: Arc<SharedWorkerPool>,
    service_config_parser: Arc<dyn ServiceConfigParser>,
    extractor: TargetExtractor,
    shutdown_hook: Mutex<Option<ShutdownHook>>,
    state: Mutex<State>,
}

/// Resolves a logical service name through a [`RegistryClient`].
///
/// Cloning yields another handle to the same resolver.
#[derive(Clone)]
pub struct DiscoveryResolver {
    inner: Arc<Inner>,
}

impl DiscoveryResolver {
    #[must_use]
    pub fn new(
        name: impl Into<Arc<str>>,
        client: Arc<dyn RegistryClient>,
        args: &ResolverArgs,
        keys: MetadataKeys,
        pool: Arc<SharedWorkerPool>,
    ) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(Inner {
                id: ResolverId::next(),
                extractor: TargetExtractor::new(Arc::clone(&name), keys),
                name,
                client,
                sync_context: Arc::clone(&args.sync_context),
                offload_executor: args.offload_executor.clone(),
                pool,
                service_config_parser: Arc::clone(&args.service_config_parser),
                shutdown_hook: Mutex::new(None),
                state: Mutex::new(State {
                    phase: Phase::Created,
                    listener: None,
                    executor: None,
                    resolving: false,
                    instances: empty_snapshot(),
                }),
            }),
        }
    }

    /// Register a callback invoked by the first [`shutdown`](NameResolver::shutdown).
    pub fn on_shutdown(&self, hook: impl FnOnce(ResolverId) + Send + 'static) {
        *self.inner.shutdown_hook.lock() = Some(Box::new(hook));
    }

    #[must_use]
    pub fn id(&self) -> ResolverId {
        self.inner.id
    }

    /// Logical service name looked up in the registry.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Started and not shut down.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    /// Trigger a refresh from any thread, e.g. a registry heartbeat handler.
    ///
    /// The request hops onto the synchronization context first, so it is a
    /// no-op for resolvers that are not started or already shut down.
    pub fn refresh_from_external(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.sync_context.execute(move || {
            if inner.is_active() {
                inner.resolve();
            }
        });
    }
}

impl NameResolver for DiscoveryResolver {
    fn service_authority(&self) -> &str {
        &self.inner.name
    }

    fn start(&self, listener: Arc<dyn ResolverListener>) -> Result<(), ResolverError> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            match state.phase {
                Phase::Created => {}
                Phase::Started => return Err(ResolverError::IllegalState("already started")),
                Phase::Shutdown => return Err(ResolverError::IllegalState("already shut down")),
            }
            let executor = match &inner.offload_executor {
                Some(executor) => Arc::clone(executor),
                None => inner.pool.acquire()?,
            };
            state.executor = Some(executor);
            state.listener = Some(listener);
            state.phase = Phase::Started;
        }
        inner.resolve();
        Ok(())
    }

    fn refresh(&self) -> Result<(), ResolverError> {
        if self.inner.state.lock().phase != Phase::Started {
            return Err(ResolverError::IllegalState("not started"));
        }
        self.inner.resolve();
        Ok(())
    }

    fn shutdown(&self) {
        let inner = &self.inner;
        let executor = {
            let mut state = inner.state.lock();
            state.phase = Phase::Shutdown;
            state.listener = None;
            state.instances = empty_snapshot();
            state.executor.take()
        };
        if executor.is_some() && inner.offload_executor.is_none() {
            inner.pool.release();
        }
        let hook = inner.shutdown_hook.lock().take();
        if let Some(hook) = hook {
            hook(inner.id);
        }
    }
}

impl fmt::Debug for DiscoveryResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryResolver")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Inner {
    fn is_active(&self) -> bool {
        self.state.lock().listener.is_some()
    }

    /// Schedule a poll unless one is already in flight.
    fn resolve(self: &Arc<Self>) {
        tracing::debug!(service = %self.name, "Scheduled resolve");
        let (executor, previous) = {
            let mut state = self.state.lock();
            if state.resolving {
                return;
            }
            let Some(executor) = state.executor.clone() else {
                return;
            };
            state.resolving = true;
            (executor, Arc::clone(&state.instances))
        };

        let this = Arc::clone(self);
        executor.spawn(Box::pin(async move {
            let outcome = this.poll(&previous).await;
            let inner = Arc::clone(&this);
            this.sync_context.execute(move || inner.complete(outcome));
        }));
    }

    async fn poll(&self, previous: &[ServiceInstance]) -> PollOutcome {
        match AssertUnwindSafe(self.resolve_internal(previous))
            .catch_unwind()
            .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                tracing::error!(service = %self.name, error = %err, "Failed to update server list");
                let mut status =
                    Status::unavailable(format!("Failed to update server list for {}", self.name));
                status.set_source(Arc::new(err));
                PollOutcome::Failed(status)
            }
            Err(_) => {
                tracing::error!(service = %self.name, "Registry poll panicked");
                PollOutcome::Failed(Status::unavailable(format!(
                    "Failed to update server list for {}: poll panicked",
                    self.name
                )))
            }
        }
    }

    async fn resolve_internal(
        &self,
        previous: &[ServiceInstance],
    ) -> Result<PollOutcome, ResolverError> {
        let instances = self
            .client
            .get_instances(&self.name)
            .await
            .map_err(|source| ResolverError::Registry {
                service: self.name.to_string(),
                source,
            })?;

        if instances.is_empty() {
            tracing::error!(service = %self.name, "No servers found");
            return Ok(PollOutcome::Failed(Status::unavailable(format!(
                "No servers found for {}",
                self.name
            ))));
        }
        tracing::debug!(service = %self.name, count = instances.len(), "Got candidate servers");

        if !needs_update(&self.extractor, previous, &instances)? {
            tracing::debug!(service = %self.name, "Nothing has changed... skipping update");
            return Ok(PollOutcome::KeepPrevious);
        }

        tracing::debug!(service = %self.name, "Ready to update server list");
        let addresses = self.extractor.to_targets(&instances)?;
        let service_config = resolve_service_config(
            &self.name,
            &instances,
            &self.extractor.keys().service_config_key,
            self.service_config_parser.as_ref(),
        );
        Ok(PollOutcome::Publish {
            result: ResolutionResult::new(addresses).with_service_config(service_config),
            instances: instances.into(),
        })
    }

    /// Runs on the synchronization context.
    fn complete(&self, outcome: PollOutcome) {
        let (listener, notification) = {
            let mut state = self.state.lock();
            state.resolving = false;
            let Some(listener) = state.listener.clone() else {
                tracing::debug!(service = %self.name, "Resolver is shut down, discarding poll result");
                return;
            };
            match outcome {
                PollOutcome::KeepPrevious => return,
                PollOutcome::Publish { result, instances } => {
                    state.instances = instances;
                    (listener, Ok(result))
                }
                PollOutcome::Failed(status) => {
                    state.instances = empty_snapshot();
                    (listener, Err(status))
                }
            }
        };

        match notification {
            Ok(result) => {
                let count = result.addresses.len();
                listener.on_result(result);
                tracing::info!(service = %self.name, count, "Done updating server list");
            }
            Err(status) => listener.on_error(status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolution::ConfigOrError;
    use async_trait::async_trait;
    use std::error::Error as _;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;
    use tokio::sync::{Notify, Semaphore, mpsc};
    use tonic::Code;

    enum Mode {
        Answer(Vec<ServiceInstance>),
        Fail(&'static str),
        Panic,
    }

    struct ScriptedRegistry {
        mode: Mutex<Mode>,
        calls: AtomicUsize,
        entered: Notify,
        gated: AtomicBool,
        gate: Semaphore,
    }

    impl ScriptedRegistry {
        fn new(instances: Vec<ServiceInstance>) -> Arc<Self> {
            Arc::new(Self {
                mode: Mutex::new(Mode::Answer(instances)),
                calls: AtomicUsize::new(0),
                entered: Notify::new(),
                gated: AtomicBool::new(false),
                gate: Semaphore::new(0),
            })
        }

        fn answer(&self, instances: Vec<ServiceInstance>) {
            *self.mode.lock() = Mode::Answer(instances);
        }

        fn set_mode(&self, mode: Mode) {
            *self.mode.lock() = mode;
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RegistryClient for ScriptedRegistry {
        async fn get_instances(&self, _service_id: &str) -> anyhow::Result<Vec<ServiceInstance>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            if self.gated.load(Ordering::SeqCst) {
                self.gate.acquire().await?.forget();
            }
            match &*self.mode.lock() {
                Mode::Answer(instances) => Ok(instances.clone()),
                Mode::Fail(reason) => anyhow::bail!("{reason}"),
                Mode::Panic => panic!("registry exploded"),
            }
        }
    }

    /// Counts finished polls, commit step included.
    struct TrackingExecutor {
        done: Arc<AtomicUsize>,
        notify: Arc<Notify>,
    }

    impl TrackingExecutor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                done: Arc::new(AtomicUsize::new(0)),
                notify: Arc::new(Notify::new()),
            })
        }

        async fn wait_polls(&self, n: usize) {
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    let notified = self.notify.notified();
                    if self.done.load(Ordering::SeqCst) >= n {
                        return;
                    }
                    notified.await;
                }
            })
            .await
            .expect("poll did not finish in time");
        }
    }

    impl OffloadExecutor for TrackingExecutor {
        fn spawn(&self, task: futures::future::BoxFuture<'static, ()>) {
            let (done, notify) = (self.done.clone(), self.notify.clone());
            drop(tokio::spawn(async move {
                task.await;
                done.fetch_add(1, Ordering::SeqCst);
                notify.notify_waiters();
            }));
        }
    }

    #[derive(Debug)]
    enum Event {
        Result(ResolutionResult),
        Error(Status),
    }

    struct Recorder {
        ctx: Arc<SynchronizationContext>,
        tx: mpsc::UnboundedSender<Event>,
        off_context: AtomicBool,
    }

    impl Recorder {
        fn check_context(&self) {
            if !self.ctx.is_current_thread() {
                self.off_context.store(true, Ordering::SeqCst);
            }
        }
    }

    impl ResolverListener for Recorder {
        fn on_result(&self, result: ResolutionResult) {
            self.check_context();
            self.tx.send(Event::Result(result)).unwrap();
        }

        fn on_error(&self, status: Status) {
            self.check_context();
            self.tx.send(Event::Error(status)).unwrap();
        }
    }

    struct Harness {
        registry: Arc<ScriptedRegistry>,
        executor: Arc<TrackingExecutor>,
        resolver: DiscoveryResolver,
        recorder: Arc<Recorder>,
        events: mpsc::UnboundedReceiver<Event>,
    }

    impl Harness {
        fn new(instances: Vec<ServiceInstance>) -> Self {
            let registry = ScriptedRegistry::new(instances);
            let executor = TrackingExecutor::new();
            let ctx = Arc::new(SynchronizationContext::new());
            let args = ResolverArgs::new(ctx.clone()).with_offload_executor(executor.clone());
            let resolver = DiscoveryResolver::new(
                "orders",
                registry.clone(),
                &args,
                MetadataKeys::default(),
                Arc::new(SharedWorkerPool::new(1, "unused")),
            );
            let (tx, events) = mpsc::unbounded_channel();
            let recorder = Arc::new(Recorder {
                ctx,
                tx,
                off_context: AtomicBool::new(false),
            });
            Self {
                registry,
                executor,
                resolver,
                recorder,
                events,
            }
        }

        fn start(&self) {
            self.resolver.start(self.recorder.clone()).unwrap();
        }

        fn snapshot_len(&self) -> usize {
            self.resolver.inner.state.lock().instances.len()
        }

        fn is_resolving(&self) -> bool {
            self.resolver.inner.state.lock().resolving
        }

        fn next_result(&mut self) -> ResolutionResult {
            match self.events.try_recv() {
                Ok(Event::Result(result)) => result,
                other => panic!("expected a result, got {other:?}"),
            }
        }

        fn next_error(&mut self) -> Status {
            match self.events.try_recv() {
                Ok(Event::Error(status)) => status,
                other => panic!("expected an error, got {other:?}"),
            }
        }

        fn assert_quiet(&mut self) {
            assert!(self.events.try_recv().is_err(), "unexpected listener call");
        }
    }

    fn instance_a() -> ServiceInstance {
        ServiceInstance::new("orders", "a", "10.0.0.1", 8080).with_metadata("gRPC_port", "9090")
    }

    fn instance_b() -> ServiceInstance {
        ServiceInstance::new("orders", "b", "10.0.0.2", 8080)
    }

    fn authorities(result: &ResolutionResult) -> Vec<String> {
        result.addresses.iter().map(|t| t.authority()).collect()
    }

    #[tokio::test]
    async fn outage_and_recovery_scenario() {
        let mut h = Harness::new(vec![instance_a(), instance_b()]);
        h.start();
        h.executor.wait_polls(1).await;
        let first = h.next_result();
        assert_eq!(authorities(&first), vec!["10.0.0.1:9090", "10.0.0.2:8080"]);
        assert_eq!(h.snapshot_len(), 2);

        // unchanged registry: no notification
        h.resolver.refresh().unwrap();
        h.executor.wait_polls(2).await;
        h.assert_quiet();

        // total outage
        h.registry.answer(Vec::new());
        h.resolver.refresh().unwrap();
        h.executor.wait_polls(3).await;
        let status = h.next_error();
        assert_eq!(status.code(), Code::Unavailable);
        assert!(status.message().contains("No servers found for orders"));
        assert_eq!(h.snapshot_len(), 0);

        // recovery with A only
        h.registry.answer(vec![instance_a()]);
        h.resolver.refresh().unwrap();
        h.executor.wait_polls(4).await;
        assert_eq!(authorities(&h.next_result()), vec!["10.0.0.1:9090"]);
        assert_eq!(h.snapshot_len(), 1);

        assert!(!h.recorder.off_context.load(Ordering::SeqCst));
        assert_eq!(h.registry.calls(), 4);
    }

    #[tokio::test]
    async fn permuted_list_is_not_republished() {
        let mut h = Harness::new(vec![instance_a(), instance_b()]);
        h.start();
        h.executor.wait_polls(1).await;
        h.next_result();

        h.registry.answer(vec![instance_b(), instance_a()]);
        h.resolver.refresh().unwrap();
        h.executor.wait_polls(2).await;
        h.assert_quiet();
    }

    #[tokio::test]
    async fn refresh_while_polling_is_coalesced() {
        let mut h = Harness::new(vec![instance_a()]);
        h.registry.gated.store(true, Ordering::SeqCst);
        h.start();
        h.registry.entered.notified().await;
        assert!(h.is_resolving());

        for _ in 0..3 {
            h.resolver.refresh().unwrap();
        }
        h.resolver.refresh_from_external();
        assert_eq!(h.registry.calls(), 1);

        h.registry.gated.store(false, Ordering::SeqCst);
        h.registry.gate.add_permits(1);
        h.executor.wait_polls(1).await;
        assert_eq!(h.registry.calls(), 1, "no second concurrent poll");
        assert!(!h.is_resolving());
        h.next_result();
        h.assert_quiet();

        // the flag is cleared, so the next refresh polls again
        h.resolver.refresh().unwrap();
        h.executor.wait_polls(2).await;
        assert_eq!(h.registry.calls(), 2);
    }

    #[tokio::test]
    async fn shutdown_during_poll_discards_result() {
        let mut h = Harness::new(vec![instance_a()]);
        h.registry.gated.store(true, Ordering::SeqCst);
        h.start();
        h.registry.entered.notified().await;

        h.resolver.shutdown();
        assert!(!h.resolver.is_active());

        h.registry.gate.add_permits(1);
        h.executor.wait_polls(1).await;
        h.assert_quiet();
        assert_eq!(h.snapshot_len(), 0);
    }

    #[tokio::test]
    async fn registry_failure_resets_snapshot() {
        let mut h = Harness::new(vec![instance_a(), instance_b()]);
        h.start();
        h.executor.wait_polls(1).await;
        h.next_result();

        h.registry.set_mode(Mode::Fail("registry down"));
        h.resolver.refresh().unwrap();
        h.executor.wait_polls(2).await;
        let status = h.next_error();
        assert_eq!(status.code(), Code::Unavailable);
        let source = status.source().unwrap().downcast_ref::<ResolverError>();
        assert!(matches!(source, Some(ResolverError::Registry { .. })));
        assert_eq!(h.snapshot_len(), 0);

        // same instances as before the failure are published again in full
        h.registry.answer(vec![instance_a(), instance_b()]);
        h.resolver.refresh().unwrap();
        h.executor.wait_polls(3).await;
        assert_eq!(h.next_result().addresses.len(), 2);
    }

    #[tokio::test]
    async fn malformed_port_fails_the_poll() {
        let bad = instance_b().with_metadata("gRPC_port", "not-a-port");
        let mut h = Harness::new(vec![instance_a(), bad]);
        h.start();
        h.executor.wait_polls(1).await;

        let status = h.next_error();
        assert_eq!(status.code(), Code::Unavailable);
        let source = status.source().unwrap().downcast_ref::<ResolverError>();
        assert!(matches!(source, Some(ResolverError::InvalidPort { .. })));
        assert_eq!(h.snapshot_len(), 0);
    }

    #[tokio::test]
    async fn panicking_registry_is_reported_and_recovers() {
        let mut h = Harness::new(Vec::new());
        h.registry.set_mode(Mode::Panic);
        h.start();
        h.executor.wait_polls(1).await;
        assert_eq!(h.next_error().code(), Code::Unavailable);
        assert!(!h.is_resolving());

        h.registry.answer(vec![instance_a()]);
        h.resolver.refresh().unwrap();
        h.executor.wait_polls(2).await;
        assert_eq!(h.next_result().addresses.len(), 1);
    }

    #[tokio::test]
    async fn service_config_travels_with_the_targets() {
        let inst = instance_a().with_metadata("gRPC_service_config", "{not json");
        let mut h = Harness::new(vec![inst]);
        h.start();
        h.executor.wait_polls(1).await;

        let result = h.next_result();
        assert_eq!(result.addresses.len(), 1, "targets survive a broken config");
        match result.service_config {
            Some(ConfigOrError::Error(status)) => assert_eq!(status.code(), Code::Unknown),
            other => panic!("expected a config error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn lifecycle_state_checks() {
        let h = Harness::new(vec![instance_a()]);
        assert!(matches!(
            h.resolver.refresh(),
            Err(ResolverError::IllegalState("not started"))
        ));

        h.start();
        assert!(matches!(
            h.resolver.start(h.recorder.clone()),
            Err(ResolverError::IllegalState("already started"))
        ));
        h.executor.wait_polls(1).await;

        h.resolver.shutdown();
        h.resolver.shutdown();
        assert!(h.resolver.refresh().is_err());
        assert!(matches!(
            h.resolver.start(h.recorder.clone()),
            Err(ResolverError::IllegalState("already shut down"))
        ));
        assert_eq!(h.resolver.service_authority(), "orders");
    }

    #[tokio::test]
    async fn external_refresh_is_a_noop_when_inactive() {
        let h = Harness::new(vec![instance_a()]);
        h.resolver.refresh_from_external();
        assert_eq!(h.registry.calls(), 0);

        h.start();
        h.executor.wait_polls(1).await;
        h.resolver.refresh_from_external();
        h.executor.wait_polls(2).await;
        assert_eq!(h.registry.calls(), 2);

        h.resolver.shutdown();
        h.resolver.refresh_from_external();
        tokio::task::yield_now().await;
        assert_eq!(h.registry.calls(), 2);
    }

    #[tokio::test]
    async fn shutdown_hook_runs_once() {
        let h = Harness::new(vec![instance_a()]);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let id = h.resolver.id();
        h.resolver.on_shutdown(move |seen| {
            assert_eq!(seen, id);
            c.fetch_add(1, Ordering::SeqCst);
        });

        h.resolver.shutdown();
        h.resolver.shutdown();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shared_pool_is_borrowed_without_offload_executor() {
        let registry = ScriptedRegistry::new(vec![instance_a()]);
        let pool = Arc::new(SharedWorkerPool::new(1, "discovery-test"));
        let args = ResolverArgs::new(Arc::new(SynchronizationContext::new()));
        let resolver =
            DiscoveryResolver::new("orders", registry, &args, MetadataKeys::default(), pool.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder {
            ctx: args.sync_context.clone(),
            tx,
            off_context: AtomicBool::new(false),
        });
        resolver.start(recorder.clone()).unwrap();
        assert_eq!(pool.holders(), 1);

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, Event::Result(_)));
        assert!(!recorder.off_context.load(Ordering::SeqCst));

        resolver.shutdown();
        assert_eq!(pool.holders(), 0);
    }
}
