use std::sync::Arc;

use crate::error::ResolverError;
use crate::provider::{NameResolverProvider, TargetUri};
use crate::resolution::{ResolutionResult, ResolverListener};
use crate::resolver::{NameResolver, ResolverArgs};
use crate::target::ResolvedTarget;

pub const STATIC_SCHEME: &str = "static";

/// Port used for static targets that name none, unless the channel supplies one.
pub const DEFAULT_PORT: u16 = 9090;

/// Always answers with the same fixed targets.
#[derive(Clone, Debug)]
pub struct StaticNameResolver {
    authority: String,
    result: ResolutionResult,
}

impl StaticNameResolver {
    /// # Errors
    /// Returns `ResolverError::NoTargets` if `targets` is empty.
    pub fn new(
        authority: impl Into<String>,
        targets: Vec<ResolvedTarget>,
    ) -> Result<Self, ResolverError> {
        let authority = authority.into();
        if targets.is_empty() {
            return Err(ResolverError::NoTargets(authority));
        }
        Ok(Self::with_result(authority, ResolutionResult::new(targets)))
    }

    #[must_use]
    pub fn with_result(authority: impl Into<String>, result: ResolutionResult) -> Self {
        Self {
            authority: authority.into(),
            result,
        }
    }

    /// Build from a comma separated `host[:port]` list such as
    /// `10.0.0.1:9000,[::1]:9001,backend`.
    ///
    /// # Errors
    /// Returns `ResolverError::NoTargets` for an empty list and
    /// `ResolverError::InvalidTarget` for an unparsable entry.
    pub fn parse(authority: &str, default_port: Option<u16>) -> Result<Self, ResolverError> {
        let port = default_port.unwrap_or(DEFAULT_PORT);
        let targets = authority
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| parse_host_port(entry, port))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(authority, targets)
    }
}

fn parse_host_port(entry: &str, default_port: u16) -> Result<ResolvedTarget, ResolverError> {
    let invalid = || ResolverError::invalid_target(STATIC_SCHEME, entry);
    let parse_port = |raw: &str| raw.parse::<u16>().map_err(|_| invalid());

    if let Some(rest) = entry.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        let port = match tail {
            "" => default_port,
            _ => parse_port(tail.strip_prefix(':').ok_or_else(invalid)?)?,
        };
        return Ok(ResolvedTarget::new(host, port));
    }

    match entry.split_once(':') {
        // a bare IPv6 address has no port
        Some(_) if entry.matches(':').count() > 1 => Ok(ResolvedTarget::new(entry, default_port)),
        Some((host, port)) if !host.is_empty() => Ok(ResolvedTarget::new(host, parse_port(port)?)),
        Some(_) => Err(invalid()),
        None => Ok(ResolvedTarget::new(entry, default_port)),
    }
}

impl NameResolver for StaticNameResolver {
    fn service_authority(&self) -> &str {
        &self.authority
    }

    fn start(&self, listener: Arc<dyn ResolverListener>) -> Result<(), ResolverError> {
        listener.on_result(self.result.clone());
        Ok(())
    }

    fn refresh(&self) -> Result<(), ResolverError> {
        Ok(())
    }

    fn shutdown(&self) {}
}

/// Provider for `static://host:port` and `static:///host1:port1,host2:port2`
/// targets.
///
/// A single host may be given as the authority; a list goes in the path.
#[derive(Clone, Copy, Debug, Default)]
pub struct StaticResolverProvider;

impl NameResolverProvider for StaticResolverProvider {
    fn scheme(&self) -> &str {
        STATIC_SCHEME
    }

    fn priority(&self) -> u8 {
        5
    }

    fn new_name_resolver(
        &self,
        target: &TargetUri,
        args: &ResolverArgs,
    ) -> Result<Option<Box<dyn NameResolver>>, ResolverError> {
        if target.scheme() != STATIC_SCHEME {
            return Ok(None);
        }
        let hosts = match target.authority() {
            Some(authority) if !authority.is_empty() => authority,
            _ => target.path().trim_start_matches('/'),
        };
        let resolver = StaticNameResolver::parse(hosts, args.default_port)?;
        Ok(Some(Box::new(resolver)))
    }
}
