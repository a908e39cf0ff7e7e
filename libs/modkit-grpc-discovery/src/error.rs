use std::num::ParseIntError;

/// Errors raised by resolvers, factories and the worker pool.
///
/// Configuration problems (`InvalidTarget`, `MalformedTarget`, `InvalidPort`) surface immediately
/// to the caller. Poll-time failures never cross into the caller; they reach the
/// listener as an `UNAVAILABLE` status carrying this error as its source.
#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    #[error(
        "Incorrectly formatted target uri; expected: '{scheme}:[//]/<service-name>'; but was '{target}'"
    )]
    InvalidTarget { scheme: String, target: String },

    #[error("target '{target}' is not a valid URI: {source}")]
    MalformedTarget {
        target: String,
        #[source]
        source: url::ParseError,
    },

    #[error("no name resolver provider registered for scheme '{0}'")]
    UnsupportedScheme(String),

    #[error(
        "Failed to parse gRPC port information '{value}' of instance '{instance_id}' for '{service}'"
    )]
    InvalidPort {
        service: String,
        instance_id: String,
        value: String,
        #[source]
        source: ParseIntError,
    },

    #[error("registry query for '{service}' failed: {source}")]
    Registry {
        service: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to start shared worker pool: {0}")]
    WorkerPool(#[from] std::io::Error),

    #[error("Must have at least one target, but was: '{0}'")]
    NoTargets(String),
}

impl ResolverError {
    pub(crate) fn invalid_target(scheme: &str, target: &str) -> Self {
        Self::InvalidTarget {
            scheme: scheme.to_owned(),
            target: target.to_owned(),
        }
    }
}
