use std::sync::Arc;

use tonic::Status;

use crate::service_config::ServiceConfig;
use crate::target::ResolvedTarget;

/// Outcome of parsing an embedded service config.
///
/// A broken config is reported next to otherwise valid targets rather than
/// being dropped.
#[derive(Clone, Debug)]
pub enum ConfigOrError {
    Config(Arc<ServiceConfig>),
    Error(Status),
}

impl ConfigOrError {
    #[must_use]
    pub fn config(&self) -> Option<&ServiceConfig> {
        match self {
            Self::Config(config) => Some(config),
            Self::Error(_) => None,
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&Status> {
        match self {
            Self::Config(_) => None,
            Self::Error(status) => Some(status),
        }
    }
}

/// Targets published for one logical service.
#[derive(Clone, Debug, Default)]
pub struct ResolutionResult {
    pub addresses: Vec<ResolvedTarget>,
    /// `None` when no instance carries a service config.
    pub service_config: Option<ConfigOrError>,
}

impl ResolutionResult {
    #[must_use]
    pub fn new(addresses: Vec<ResolvedTarget>) -> Self {
        Self {
            addresses,
            service_config: None,
        }
    }

    #[must_use]
    pub fn with_service_config(mut self, service_config: Option<ConfigOrError>) -> Self {
        self.service_config = service_config;
        self
    }
}

/// Receiver of resolution updates.
///
/// Discovery resolvers call these only from their synchronization context, so
/// notifications for one resolver are totally ordered.
pub trait ResolverListener: Send + Sync {
    fn on_result(&self, result: ResolutionResult);

    fn on_error(&self, status: Status);
}
