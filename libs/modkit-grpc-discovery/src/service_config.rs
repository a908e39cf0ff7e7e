//! gRPC service config carried in registry metadata.
//!
//! Every instance of a logical service is expected to publish the same config,
//! so the first non-empty value found wins; configs are never merged.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tonic::Status;

use crate::instance::ServiceInstance;
use crate::resolution::ConfigOrError;

const STATUS_CODE_NAMES: [&str; 17] = [
    "OK",
    "CANCELLED",
    "UNKNOWN",
    "INVALID_ARGUMENT",
    "DEADLINE_EXCEEDED",
    "NOT_FOUND",
    "ALREADY_EXISTS",
    "PERMISSION_DENIED",
    "RESOURCE_EXHAUSTED",
    "FAILED_PRECONDITION",
    "ABORTED",
    "OUT_OF_RANGE",
    "UNIMPLEMENTED",
    "INTERNAL",
    "UNAVAILABLE",
    "DATA_LOSS",
    "UNAUTHENTICATED",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancing_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub load_balancing_config: Vec<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub method_config: Vec<MethodConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_throttling: Option<RetryThrottling>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodConfig {
    #[serde(default)]
    pub name: Vec<MethodName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for_ready: Option<bool>,
    /// Proto3 JSON duration, e.g. `"5s"` or `"0.25s"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

impl MethodConfig {
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.as_deref().and_then(parse_duration)
    }
}

/// Empty service and method match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodName {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: String,
    pub max_backoff: String,
    pub backoff_multiplier: f64,
    pub retryable_status_codes: Vec<String>,
}

impl RetryPolicy {
    #[must_use]
    pub fn initial_backoff(&self) -> Option<Duration> {
        parse_duration(&self.initial_backoff)
    }

    #[must_use]
    pub fn max_backoff(&self) -> Option<Duration> {
        parse_duration(&self.max_backoff)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryThrottling {
    pub max_tokens: u32,
    pub token_ratio: f64,
}

impl ServiceConfig {
    fn validate(&self) -> Result<(), String> {
        for method in &self.method_config {
            if let Some(timeout) = &method.timeout {
                parse_duration(timeout).ok_or_else(|| format!("invalid timeout '{timeout}'"))?;
            }
            if let Some(policy) = &method.retry_policy {
                policy.validate()?;
            }
        }
        if let Some(throttling) = &self.retry_throttling {
            if throttling.max_tokens == 0 || throttling.max_tokens > 1000 {
                return Err("retryThrottling.maxTokens must be in (0, 1000]".to_owned());
            }
            if throttling.token_ratio.is_nan() || throttling.token_ratio <= 0.0 {
                return Err("retryThrottling.tokenRatio must be positive".to_owned());
            }
        }
        Ok(())
    }
}

impl RetryPolicy {
    fn validate(&self) -> Result<(), String> {
        if self.max_attempts < 2 {
            return Err("retryPolicy.maxAttempts must be greater than 1".to_owned());
        }
        for (field, value) in [
            ("initialBackoff", &self.initial_backoff),
            ("maxBackoff", &self.max_backoff),
        ] {
            match parse_duration(value) {
                Some(d) if !d.is_zero() => {}
                _ => return Err(format!("retryPolicy.{field} must be a positive duration, got '{value}'")),
            }
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier <= 0.0 {
            return Err("retryPolicy.backoffMultiplier must be positive".to_owned());
        }
        if self.retryable_status_codes.is_empty() {
            return Err("retryPolicy.retryableStatusCodes must not be empty".to_owned());
        }
        if let Some(code) = self
            .retryable_status_codes
            .iter()
            .find(|code| !STATUS_CODE_NAMES.contains(&code.as_str()))
        {
            return Err(format!("unknown status code '{code}' in retryPolicy"));
        }
        Ok(())
    }
}

/// Parses proto3 JSON durations such as `"1s"` or `"0.050s"`.
fn parse_duration(value: &str) -> Option<Duration> {
    let secs: f64 = value.strip_suffix('s')?.parse().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

/// Turns a generic JSON object into a typed service config.
pub trait ServiceConfigParser: Send + Sync {
    fn parse_service_config(&self, raw: &Map<String, Value>) -> ConfigOrError;
}

/// Deserializes and validates method and retry settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultServiceConfigParser;

impl ServiceConfigParser for DefaultServiceConfigParser {
    fn parse_service_config(&self, raw: &Map<String, Value>) -> ConfigOrError {
        let config: ServiceConfig = match serde_json::from_value(Value::Object(raw.clone())) {
            Ok(config) => config,
            Err(e) => {
                return ConfigOrError::Error(Status::invalid_argument(format!(
                    "Invalid grpc service config: {e}"
                )));
            }
        };
        match config.validate() {
            Ok(()) => ConfigOrError::Config(Arc::new(config)),
            Err(reason) => ConfigOrError::Error(Status::invalid_argument(format!(
                "Invalid grpc service config: {reason}"
            ))),
        }
    }
}

/// First non-empty service config value found on `instances`.
pub(crate) fn find_service_config<'a>(instances: &'a [ServiceInstance], key: &str) -> Option<&'a str> {
    instances
        .iter()
        .filter_map(|inst| inst.metadata_value(key))
        .find(|value| !value.is_empty())
}

/// Extracts and parses the service config published by `instances`.
///
/// Returns `None` when no instance publishes one. Malformed JSON yields an
/// `UNKNOWN` error rather than "no config".
pub(crate) fn resolve_service_config(
    service: &str,
    instances: &[ServiceInstance],
    key: &str,
    parser: &dyn ServiceConfigParser,
) -> Option<ConfigOrError> {
    let raw = find_service_config(instances, key)?;
    tracing::debug!(service, "Found service config");
    if tracing::enabled!(tracing::Level::TRACE) {
        // keep multi-line configs on one log line
        let escaped = raw.replace('\r', "\\r").replace('\n', "\\n");
        tracing::trace!(service, config = %escaped, "Service config");
    }

    match serde_json::from_str::<Map<String, Value>>(raw) {
        Ok(parsed) => Some(parser.parse_service_config(&parsed)),
        Err(e) => {
            tracing::warn!(service, error = %e, "Failed to parse grpc service config");
            let mut status = Status::unknown("Failed to parse grpc service config");
            status.set_source(Arc::new(e));
            Some(ConfigOrError::Error(status))
        }
    }
}
