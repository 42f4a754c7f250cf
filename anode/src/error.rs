use std::fmt;

use crate::Token;

/// Type alias for boxed errors that can be sent across threads.
///
/// User supplied callbacks (factories, constructors, hooks) report failures
/// with this type; the engine wraps them into [`ResolveError`].
pub type StdError = Box<dyn std::error::Error + Send + Sync>;

pub type ResolveResult<T> = Result<T, ResolveError>;

/// Chain of tokens from the root resolution to the failure point.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ResolutionPath(pub Vec<Token>);

impl ResolutionPath {
    pub fn tokens(&self) -> &[Token] {
        &self.0
    }

    pub fn contains(&self, token: &Token) -> bool {
        self.0.contains(token)
    }
}

impl fmt::Display for ResolutionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<root>");
        }
        for (i, token) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" -> ")?;
            }
            write!(f, "{token}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ResolutionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// Errors raised by the resolution engine.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// A provider declaration is malformed.
    #[error("Invalid provider for {token}: {reason}")]
    Configuration { token: String, reason: String },
    /// No eligible provider exists for a required token.
    #[error("No provider for {token} (path: {path})")]
    MissingProvider { token: Token, path: ResolutionPath },
    /// A token was requested while it was already being resolved.
    #[error("Circular dependency detected: {path}")]
    CircularDependency { path: ResolutionPath },
    /// Operation invalid for the provider lifetime or the named scope.
    #[error("Scope error for {token}: {reason} (path: {path})")]
    Scope {
        token: String,
        reason: String,
        path: ResolutionPath,
    },
    /// A produced value was rejected by a validation interceptor.
    #[error("Validation failed for {token}: {reason} (path: {path})")]
    Validation {
        token: Token,
        reason: String,
        path: ResolutionPath,
    },
    /// An asynchronous provider or hook was reached from synchronous resolution.
    #[error("Asynchronous {what} reached from synchronous resolution of {token} (path: {path})")]
    AsyncInSyncPath {
        token: Token,
        what: &'static str,
        path: ResolutionPath,
    },
    /// A factory, constructor, hook or interceptor failed.
    #[error("Cannot produce {token}: {source} (path: {path})")]
    Production {
        token: Token,
        path: ResolutionPath,
        #[source]
        source: StdError,
    },
    /// The produced value does not have the requested type.
    #[error("Value of {token} is not a {expected}")]
    TypeMismatch { token: Token, expected: &'static str },
    /// Releasing a cached instance failed.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl ResolveError {
    /// Resolution path attached to the error, if any.
    pub fn path(&self) -> Option<&ResolutionPath> {
        match self {
            Self::MissingProvider { path, .. }
            | Self::CircularDependency { path }
            | Self::Scope { path, .. }
            | Self::Validation { path, .. }
            | Self::AsyncInSyncPath { path, .. }
            | Self::Production { path, .. } => Some(path),
            Self::Configuration { .. } | Self::TypeMismatch { .. } | Self::Cache(_) => None,
        }
    }

    pub fn is_missing_provider(&self) -> bool {
        matches!(self, Self::MissingProvider { .. })
    }

    pub fn is_circular(&self) -> bool {
        matches!(self, Self::CircularDependency { .. })
    }

    pub(crate) fn configuration(token: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::Configuration {
            token: token.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn scope(
        token: impl fmt::Display,
        reason: impl Into<String>,
        path: ResolutionPath,
    ) -> Self {
        Self::Scope {
            token: token.to_string(),
            reason: reason.into(),
            path,
        }
    }
}

/// Errors raised by [`TieredCache`](crate::TieredCache) removals.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Release callback for {key} failed: {source}")]
    Release {
        key: String,
        #[source]
        source: StdError,
    },
    #[error("Release callback for {key} is asynchronous, use an async removal")]
    AsyncRelease { key: String },
}
