//! Scheme-based resolver lookup.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use url::{Position, Url};

use crate::error::ResolverError;
use crate::resolver::{NameResolver, ResolverArgs};

/// A parsed `scheme:[//authority]path` target.
///
/// Query and fragment are dropped; the path is percent-decoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetUri {
    scheme: String,
    authority: Option<String>,
    path: String,
    raw: String,
}

impl TargetUri {
    /// Parse `target` as an absolute URI.
    ///
    /// # Errors
    /// Returns `ResolverError::MalformedTarget` if `target` is not a URI and
    /// `ResolverError::InvalidTarget` if its path does not decode to UTF-8.
    pub fn parse(target: &str) -> Result<Self, ResolverError> {
        let url = Url::parse(target).map_err(|source| ResolverError::MalformedTarget {
            target: target.to_owned(),
            source,
        })?;
        let authority = url
            .has_host()
            .then(|| url[Position::BeforeUsername..Position::AfterPort].to_owned());
        let path = urlencoding::decode(url.path())
            .map_err(|_| ResolverError::invalid_target(url.scheme(), target))?
            .into_owned();

        Ok(Self {
            scheme: url.scheme().to_owned(),
            authority,
            path,
            raw: target.to_owned(),
        })
    }

    /// Lower-cased scheme.
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    #[must_use]
    pub fn authority(&self) -> Option<&str> {
        self.authority.as_deref()
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The target exactly as given.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// `true` for targets of the form `scheme:/...`.
///
/// `host:port` parses as a URI with scheme `host`; it is still treated as a
/// bare name.
fn looks_like_uri(target: &str) -> bool {
    let Some((scheme, rest)) = target.split_once(':') else {
        return false;
    };
    let mut chars = scheme.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        && rest.starts_with('/')
}

impl fmt::Display for TargetUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Creates resolvers for one URI scheme.
pub trait NameResolverProvider: Send + Sync {
    fn scheme(&self) -> &str;

    /// Higher wins when several providers claim the same scheme.
    fn priority(&self) -> u8;

    fn is_available(&self) -> bool {
        true
    }

    /// Build a resolver for `target`, or `Ok(None)` if this provider does not
    /// handle it.
    ///
    /// # Errors
    /// Returns an error if `target` uses this provider's scheme but is malformed.
    fn new_name_resolver(
        &self,
        target: &TargetUri,
        args: &ResolverArgs,
    ) -> Result<Option<Box<dyn NameResolver>>, ResolverError>;
}

/// Registered providers, looked up by scheme.
#[derive(Default)]
pub struct ResolverRegistry {
    providers: RwLock<Vec<Arc<dyn NameResolverProvider>>>,
}

impl fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let providers = self.providers.read();
        f.debug_list()
            .entries(providers.iter().map(|p| (p.scheme().to_owned(), p.priority())))
            .finish()
    }
}

impl ResolverRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, provider: Arc<dyn NameResolverProvider>) {
        tracing::debug!(
            scheme = provider.scheme(),
            priority = provider.priority(),
            "Registered name resolver provider"
        );
        self.providers.write().push(provider);
    }

    /// Remove every provider of `scheme`; returns how many were removed.
    pub fn deregister(&self, scheme: &str) -> usize {
        let mut providers = self.providers.write();
        let before = providers.len();
        providers.retain(|p| !p.scheme().eq_ignore_ascii_case(scheme));
        before - providers.len()
    }

    /// Highest-priority available provider for `scheme`; the earliest
    /// registered wins a tie.
    #[must_use]
    pub fn provider_for(&self, scheme: &str) -> Option<Arc<dyn NameResolverProvider>> {
        Self::best(
            self.providers
                .read()
                .iter()
                .filter(|p| p.scheme().eq_ignore_ascii_case(scheme)),
        )
    }

    /// Scheme of the highest-priority available provider.
    #[must_use]
    pub fn default_scheme(&self) -> Option<String> {
        Self::best(self.providers.read().iter()).map(|p| p.scheme().to_owned())
    }

    fn best<'a>(
        providers: impl Iterator<Item = &'a Arc<dyn NameResolverProvider>>,
    ) -> Option<Arc<dyn NameResolverProvider>> {
        let mut best: Option<&Arc<dyn NameResolverProvider>> = None;
        for provider in providers.filter(|p| p.is_available()) {
            if best.is_none_or(|b| provider.priority() > b.priority()) {
                best = Some(provider);
            }
        }
        best.cloned()
    }

    /// Create a resolver for `target`.
    ///
    /// A target that is not of the form `scheme:/...` and has no provider for
    /// its scheme is retried as `<default-scheme>:///<target>`.
    ///
    /// # Errors
    /// Returns `ResolverError::UnsupportedScheme` when no provider accepts the
    /// target, a parse error for a malformed URI, or the provider's error for
    /// a malformed target.
    pub fn new_name_resolver(
        &self,
        target: &str,
        args: &ResolverArgs,
    ) -> Result<Box<dyn NameResolver>, ResolverError> {
        let parsed = TargetUri::parse(target);
        if let Ok(uri) = &parsed
            && let Some(provider) = self.provider_for(uri.scheme())
            && let Some(resolver) = provider.new_name_resolver(uri, args)?
        {
            return Ok(resolver);
        }

        let uri_like = looks_like_uri(target);
        if !uri_like
            && let Some(scheme) = self.default_scheme()
            && let Some(provider) = self.provider_for(&scheme)
        {
            let uri = TargetUri::parse(&format!("{scheme}:///{target}"))?;
            if let Some(resolver) = provider.new_name_resolver(&uri, args)? {
                return Ok(resolver);
            }
        }

        match parsed {
            Ok(uri) => Err(ResolverError::UnsupportedScheme(uri.scheme)),
            Err(e) if uri_like => Err(e),
            Err(_) => Err(ResolverError::UnsupportedScheme(target.to_owned())),
        }
    }
}
