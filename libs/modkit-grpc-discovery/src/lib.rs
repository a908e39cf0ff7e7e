#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
//! Registry-backed name resolution for gRPC channels.
//!
//! A [`DiscoveryResolver`] turns a logical target such as `discovery:///orders`
//! into the set of concrete endpoints currently registered for `orders`, and
//! keeps that set fresh as the registry changes:
//!
//! - polls run on a worker executor and may block on the registry;
//! - all resolver state and every listener callback stay on a single-threaded
//!   [`SynchronizationContext`];
//! - unchanged instance lists are not republished, and an empty list is always
//!   reported as `UNAVAILABLE`.
//!
//! [`DiscoveryResolverFactory`] creates resolvers from target URIs and fans
//! registry heartbeats out to every live resolver. [`channel::discovery_channel`]
//! plugs a resolver into a tonic balance channel.

pub mod channel;
pub mod config;
mod differ;
mod error;
mod executor;
mod factory;
mod heartbeat;
mod instance;
mod provider;
mod registry;
mod resolution;
mod resolver;
mod service_config;
mod static_resolver;
mod sync_context;
mod target;

pub use config::{ConfigError, DiscoveryConfig, MetadataKeys};
pub use differ::needs_update;
pub use error::ResolverError;
pub use executor::{OffloadExecutor, SharedWorkerPool};
pub use factory::{DISCOVERY_SCHEME, DiscoveryResolverFactory};
pub use heartbeat::HeartbeatMonitor;
pub use instance::ServiceInstance;
pub use provider::{NameResolverProvider, ResolverRegistry, TargetUri};
pub use registry::{InMemoryRegistry, RegistryClient};
pub use resolution::{ConfigOrError, ResolutionResult, ResolverListener};
pub use resolver::{DiscoveryResolver, NameResolver, ResolverArgs, ResolverId};
pub use service_config::{
    DefaultServiceConfigParser, MethodConfig, MethodName, RetryPolicy, RetryThrottling,
    ServiceConfig, ServiceConfigParser,
};
pub use static_resolver::{DEFAULT_PORT, STATIC_SCHEME, StaticNameResolver, StaticResolverProvider};
pub use sync_context::SynchronizationContext;
pub use target::{Attributes, INSTANCE_ID_KEY, ResolvedTarget, SERVICE_NAME_KEY, TargetExtractor};
