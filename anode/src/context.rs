use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use crate::{ResolutionPath, ResolveError, StdError, Token};

/// How a resolution was started.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResolutionStrategy {
    #[default]
    Default,
    Lazy,
    Async,
}

/// Per-call options of [`Container::get`](crate::Container::get) and friends.
#[derive(Clone, Debug, Default)]
pub struct ResolveOptions {
    /// Return `None` instead of failing when nothing can be resolved.
    pub optional: bool,
    /// Delegate straight to the parent container.
    pub skip_self: bool,
    /// Never delegate to the parent container.
    pub self_only: bool,
    /// Return a deferred handle resolving on first use.
    pub lazy: bool,
    /// Key of the request context used by `request` scoped providers.
    pub request_id: Option<String>,
    /// Name of the managed scope used by `scoped` providers.
    pub scope: Option<String>,
    /// Merged over the container default metadata.
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ResolveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn skip_self(mut self) -> Self {
        self.skip_self = true;
        self
    }

    pub fn self_only(mut self) -> Self {
        self.self_only = true;
        self
    }

    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    pub fn request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Options inherited by the dependencies of a resolution.
    pub(crate) fn for_dependency(ctx: &ResolutionContext, optional: bool) -> Self {
        Self {
            optional,
            request_id: ctx.request_id.clone(),
            scope: ctx.scope.clone(),
            metadata: ctx.metadata.clone(),
            ..Default::default()
        }
    }
}

/// Record describing one resolution in progress.
///
/// A context is built for every requested token. It is handed to `when`
/// predicates, interceptors and middleware, and its `path` doubles as the
/// in-progress resolution stack used to detect cycles.
#[derive(Clone, Debug)]
pub struct ResolutionContext {
    pub token: Token,
    pub request_id: Option<String>,
    pub scope: Option<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Number of enclosing resolutions.
    pub depth: usize,
    /// Tokens from the root resolution up to and including `token`.
    pub path: ResolutionPath,
    pub strategy: ResolutionStrategy,
    /// Shared by clones; dropped once the resolution is over.
    active: Arc<()>,
}

impl ResolutionContext {
    pub(crate) fn new(
        token: Token,
        options: &ResolveOptions,
        defaults: &BTreeMap<String, serde_json::Value>,
        parent: Option<&ResolutionContext>,
        strategy: ResolutionStrategy,
    ) -> Self {
        let mut metadata = defaults.clone();
        metadata.extend(
            options
                .metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        let mut path = parent.map(|v| v.path.0.clone()).unwrap_or_default();
        path.push(token.clone());
        Self {
            token,
            request_id: options.request_id.clone(),
            scope: options.scope.clone(),
            metadata,
            depth: parent.map_or(0, |v| v.depth + 1),
            path: ResolutionPath(path),
            strategy,
            active: Arc::new(()),
        }
    }

    /// Handle telling whether this resolution is still in progress.
    pub(crate) fn liveness(&self) -> Weak<()> {
        Arc::downgrade(&self.active)
    }

    /// Copy that does not keep this resolution alive.
    pub(crate) fn detached(&self) -> Self {
        Self {
            active: Arc::new(()),
            ..self.clone()
        }
    }

    pub fn get_metadata(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(key)
    }

    pub fn is_root(&self) -> bool {
        self.depth == 0
    }

    /// Wraps a failure raised while producing this context's token.
    ///
    /// Engine errors passed through user callbacks are returned unchanged.
    pub fn error(&self, source: impl Into<StdError>) -> ResolveError {
        match source.into().downcast::<ResolveError>() {
            Ok(err) => *err,
            Err(source) => ResolveError::Production {
                token: self.token.clone(),
                path: self.path.clone(),
                source,
            },
        }
    }

    /// Token of the resolution that requested this one.
    pub fn requested_by(&self) -> Option<&Token> {
        let tokens = self.path.tokens();
        tokens.len().checked_sub(2).map(|i| &tokens[i])
    }
}
