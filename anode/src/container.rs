use std::any::type_name;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use futures::future::BoxFuture;

use crate::inject::Deferred;
use crate::interceptor::{run_chain, run_chain_async};
use crate::{
    BoxInterceptor, CacheOptions, CacheStats, CycleAnalysis, Dependency, DependencyGraph,
    DependencyNode, Factory, Injector, Instance, Interceptor, Lazy, MetadataProvider, Middleware,
    Provider, ProviderRegistry, Registration, Release, ResolutionContext, ResolutionPath,
    ResolutionStrategy, ResolveError, ResolveOptions, ResolveResult, Scope, ScopeManager,
    ScopedContext, SetOptions, Strategy, TieredCache, Token, TokenRef,
};
use crate::middleware::MiddlewareStack;

/// Settings of a [`Container`], inherited by its children.
#[derive(Clone)]
pub struct ContainerOptions {
    /// Seeds the metadata of every resolution context.
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Chain used by providers that declare no interceptors.
    pub interceptors: Vec<BoxInterceptor>,
    /// Singleton cache settings.
    pub cache: CacheOptions,
    /// Source of implicit class providers.
    pub metadata_provider: Option<Arc<dyn MetadataProvider>>,
    /// When disabled, missing providers resolve to `None`.
    pub strict: bool,
    /// Logs resolution failures.
    pub debug: bool,
}

impl ContainerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.interceptors.push(BoxInterceptor::new(interceptor));
        self
    }

    pub fn cache(mut self, cache: CacheOptions) -> Self {
        self.cache = cache;
        self
    }

    pub fn metadata_provider(mut self, provider: impl MetadataProvider + 'static) -> Self {
        self.metadata_provider = Some(Arc::new(provider));
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            metadata: BTreeMap::new(),
            interceptors: Vec::new(),
            cache: CacheOptions::default(),
            metadata_provider: None,
            strict: true,
            debug: false,
        }
    }
}

/// Counters of a container; nested resolutions are counted too.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContainerStats {
    pub resolutions: u64,
    pub creations: u64,
    pub cache_hits: u64,
    pub errors: u64,
    /// Statistics of the singleton cache.
    pub cache: CacheStats,
}

#[derive(Default)]
struct Counters {
    resolutions: AtomicU64,
    creations: AtomicU64,
    cache_hits: AtomicU64,
    errors: AtomicU64,
}

/// Outcome of [`Container::validate`].
#[derive(Clone, Debug, Default)]
pub struct ValidationReport {
    /// No cycles and no missing dependencies.
    pub valid: bool,
    pub cycles: Vec<Vec<Token>>,
    pub missing: Vec<Token>,
    /// Tokens whose providers depend on themselves; not counted as cycles.
    pub self_dependencies: Vec<Token>,
    pub analysis: CycleAnalysis,
    /// Production order, empty when the graph has cycles.
    pub resolution_order: Vec<Token>,
}

#[derive(Default)]
struct RequestContexts {
    contexts: HashMap<String, Arc<ScopedContext>>,
    // Creation order, disposal walks it backwards.
    order: Vec<String>,
}

struct ContainerInner {
    registry: ProviderRegistry,
    parent: Option<Container>,
    options: ContainerOptions,
    middleware: RwLock<Arc<MiddlewareStack>>,
    singletons: TieredCache<Token, Instance>,
    requests: Mutex<RequestContexts>,
    scopes: ScopeManager,
    counters: Counters,
}

enum Plan {
    Ready(Option<Instance>),
    Delegate(Container),
    /// `use_existing` provider, resolved as its target token.
    Alias(Token, ResolutionContext),
    Produce(Arc<Registration>, ResolutionContext),
}

thread_local! {
    static PRODUCING: RefCell<Vec<(usize, Token)>> = const { RefCell::new(Vec::new()) };
}

/// Marks a synchronous production as running on the current thread.
///
/// Resolutions started from inside a factory without the injector carry no
/// parent path; this stack still lets them see the productions they are
/// nested in.
struct Producing;

impl Producing {
    fn enter(container: usize, token: &Token) -> Self {
        PRODUCING.with_borrow_mut(|v| v.push((container, token.clone())));
        Self
    }

    /// Cycle path when `token` is already being produced on this thread.
    fn cycle(container: usize, token: &Token, path: &ResolutionPath) -> Option<ResolutionPath> {
        PRODUCING.with_borrow(|v| {
            let pos = v.iter().position(|(c, t)| *c == container && t == token)?;
            let root = path.tokens().first();
            let mut tokens: Vec<_> = v[pos..]
                .iter()
                .enumerate()
                .take_while(|(i, (_, t))| *i == 0 || Some(t) != root)
                .map(|(_, (_, t))| t.clone())
                .collect();
            tokens.extend(path.tokens().iter().cloned());
            Some(ResolutionPath(tokens))
        })
    }
}

impl Drop for Producing {
    fn drop(&mut self) {
        PRODUCING.with_borrow_mut(|v| {
            v.pop();
        });
    }
}

/// Resolution engine holding providers and the instances they produce.
///
/// `Container` is a cheap handle; clones share the same state. A child
/// container created with [`Container::create_child`] falls back to its
/// parent for tokens it has no provider for.
///
/// # Examples
///
/// ```rust
/// use anode::{Container, Dependency, Provider, ResolveOptions, Scope};
///
/// let container = Container::new();
/// container
///     .add_provider(Provider::new("counter").use_factory([], |_| Ok(0u32)).scope(Scope::Transient))
///     .unwrap();
///
/// let child = container.create_child([Provider::new("name").use_value("child")]).unwrap();
/// assert!(child.has_provider("counter"));
/// assert!(!child.has("counter"));
/// assert!(child.get("missing", &ResolveOptions::new().optional()).unwrap().is_none());
/// ```
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

/// Non-owning handle to a [`Container`].
#[derive(Clone)]
pub(crate) struct WeakContainer(Weak<ContainerInner>);

impl WeakContainer {
    pub(crate) fn upgrade(&self) -> Option<Container> {
        self.0.upgrade().map(|inner| Container { inner })
    }
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

impl Container {
    pub fn new() -> Self {
        Self::with_options(ContainerOptions::default())
    }

    pub fn with_options(options: ContainerOptions) -> Self {
        Self::build(options, None, MiddlewareStack::default())
    }

    fn build(options: ContainerOptions, parent: Option<Container>, middleware: MiddlewareStack) -> Self {
        let singletons = TieredCache::new(options.cache.clone()).with_release_error_handler(
            |token: &Token, err| {
                tracing::error!(token = %token, "Cannot release singleton: {err}");
            },
        );
        Self {
            inner: Arc::new(ContainerInner {
                registry: ProviderRegistry::new(),
                parent,
                options,
                middleware: RwLock::new(Arc::new(middleware)),
                singletons,
                requests: Mutex::default(),
                scopes: ScopeManager::new(),
                counters: Counters::default(),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakContainer {
        WeakContainer(Arc::downgrade(&self.inner))
    }

    pub fn options(&self) -> &ContainerOptions {
        &self.inner.options
    }

    pub fn parent(&self) -> Option<&Container> {
        self.inner.parent.as_ref()
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.inner.registry
    }

    /// Named scopes used by `scoped` providers.
    pub fn scopes(&self) -> &ScopeManager {
        &self.inner.scopes
    }

    /// Validates the declaration and registers it.
    ///
    /// Fails with [`ResolveError::Configuration`] unless exactly one
    /// production strategy is declared.
    pub fn add_provider(&self, provider: Provider) -> ResolveResult<()> {
        let registration = provider.into_registration()?;
        tracing::trace!(
            token = %registration.token,
            strategy = registration.strategy.kind(),
            scope = %registration.scope,
            "Provider registered"
        );
        self.inner.registry.register(registration);
        Ok(())
    }

    pub fn add_providers(&self, providers: impl IntoIterator<Item = Provider>) -> ResolveResult<()> {
        providers
            .into_iter()
            .try_for_each(|provider| self.add_provider(provider))
    }

    /// Registers a middleware wrapping every production of this container.
    pub fn use_middleware(&self, middleware: Middleware) -> &Self {
        let mut guard = self
            .inner
            .middleware
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let mut stack = MiddlewareStack::clone(&guard);
        stack.push(middleware);
        *guard = Arc::new(stack);
        self
    }

    fn middleware(&self) -> Arc<MiddlewareStack> {
        self.inner
            .middleware
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Creates a child container owning `providers`.
    ///
    /// The child copies the current middleware list and options.
    pub fn create_child(&self, providers: impl IntoIterator<Item = Provider>) -> ResolveResult<Container> {
        let middleware = MiddlewareStack::clone(&self.middleware());
        let child = Self::build(self.inner.options.clone(), Some(self.clone()), middleware);
        child.add_providers(providers)?;
        Ok(child)
    }

    /// Checks for providers of `token` in this container only.
    pub fn has(&self, token: impl Into<TokenRef>) -> bool {
        self.inner.registry.has(&token.into().resolve())
    }

    /// Checks for providers of `token` in this container and its ancestors.
    pub fn has_provider(&self, token: impl Into<TokenRef>) -> bool {
        let token = token.into().resolve();
        self.has_token(&token)
    }

    fn has_token(&self, token: &Token) -> bool {
        self.inner.registry.has(token)
            || self.inner.parent.as_ref().is_some_and(|v| v.has_token(token))
    }

    pub fn stats(&self) -> ContainerStats {
        let counters = &self.inner.counters;
        ContainerStats {
            resolutions: counters.resolutions.load(Ordering::Relaxed),
            creations: counters.creations.load(Ordering::Relaxed),
            cache_hits: counters.cache_hits.load(Ordering::Relaxed),
            errors: counters.errors.load(Ordering::Relaxed),
            cache: self.inner.singletons.stats(),
        }
    }

    /// Resolves `token` without suspending.
    ///
    /// Returns `None` only for optional or non-strict resolutions of
    /// unresolvable tokens. Asynchronous providers, hooks and middleware fail
    /// with [`ResolveError::AsyncInSyncPath`].
    pub fn get(
        &self,
        token: impl Into<TokenRef>,
        options: &ResolveOptions,
    ) -> ResolveResult<Option<Instance>> {
        let token = token.into().resolve();
        let result = self.resolve_in(&token, options, None, ResolutionStrategy::Default);
        self.finish(&token, options, result)
    }

    pub async fn get_async(
        &self,
        token: impl Into<TokenRef>,
        options: &ResolveOptions,
    ) -> ResolveResult<Option<Instance>> {
        let token = token.into().resolve();
        let result = self
            .resolve_in_async(&token, options, None, ResolutionStrategy::Async)
            .await;
        self.finish(&token, options, result)
    }

    /// Resolves `token` and downcasts the value to `T`.
    pub fn resolve<T>(&self, token: impl Into<TokenRef>) -> ResolveResult<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let token = token.into().resolve();
        let instance = self.get(&token, &ResolveOptions::default())?;
        require(token, instance)
    }

    pub async fn resolve_async<T>(&self, token: impl Into<TokenRef>) -> ResolveResult<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let token = token.into().resolve();
        let instance = self.get_async(&token, &ResolveOptions::default()).await?;
        require_async(token, instance).await
    }

    /// Resolves `token` optionally, `None` when nothing can provide it.
    pub fn try_resolve<T>(&self, token: impl Into<TokenRef>) -> ResolveResult<Option<Arc<T>>>
    where
        T: Send + Sync + 'static,
    {
        let token = token.into().resolve();
        match self.get(&token, &ResolveOptions::new().optional())? {
            Some(instance) => require(token, Some(instance)).map(Some),
            None => Ok(None),
        }
    }

    /// Returns a handle resolving `token` on first use.
    pub fn get_lazy<T>(&self, token: impl Into<TokenRef>) -> Lazy<T>
    where
        T: Send + Sync + 'static,
    {
        let token = token.into().resolve();
        let deferred = Deferred::new(self, token, ResolveOptions::default(), None);
        Lazy::deferred(Arc::new(deferred))
    }

    /// Produces one fresh instance per `multi` provider of `token`.
    ///
    /// Single-valued providers are ignored and nothing is cached. Without
    /// local `multi` providers the parent container is asked.
    pub fn get_all(&self, token: impl Into<TokenRef>) -> ResolveResult<Vec<Instance>> {
        let token = token.into().resolve();
        let options = ResolveOptions::default();
        let ctx = self.context(&token, &options, None, ResolutionStrategy::Default);
        let providers = self.multi_providers(&ctx);
        if providers.is_empty()
            && let Some(parent) = &self.inner.parent
        {
            return parent.get_all(&token);
        }
        let result = providers
            .iter()
            .map(|registration| self.produce(registration, &ctx, false))
            .collect();
        self.count_error(&token, result)
    }

    pub async fn get_all_async(&self, token: impl Into<TokenRef>) -> ResolveResult<Vec<Instance>> {
        let token = token.into().resolve();
        let options = ResolveOptions::default();
        let ctx = self.context(&token, &options, None, ResolutionStrategy::Async);
        let providers = self.multi_providers(&ctx);
        if providers.is_empty()
            && let Some(parent) = &self.inner.parent
        {
            return Box::pin(parent.get_all_async(&token)).await;
        }
        let mut instances = Vec::with_capacity(providers.len());
        for registration in &providers {
            match self.produce_async(registration, &ctx, false).await {
                Ok(instance) => instances.push(instance),
                Err(err) => return self.count_error(&token, Err(err)),
            }
        }
        Ok(instances)
    }

    pub fn resolve_all<T>(&self, token: impl Into<TokenRef>) -> ResolveResult<Vec<Arc<T>>>
    where
        T: Send + Sync + 'static,
    {
        let token = token.into().resolve();
        self.get_all(&token)?
            .into_iter()
            .map(|v| downcast(&token, v))
            .collect()
    }

    /// Returns the request context `id`, creating it when missing.
    pub fn request_context(&self, id: impl Into<String>) -> Arc<ScopedContext> {
        let id = id.into();
        let mut requests = self.requests();
        if let Some(context) = requests.contexts.get(&id) {
            return context.clone();
        }
        let context = Arc::new(ScopedContext::new(id.clone()));
        requests.order.push(id.clone());
        requests.contexts.insert(id, context.clone());
        context
    }

    /// Creates the request context `id` falling back to the context `parent`.
    pub fn create_child_request(
        &self,
        parent: impl Into<String>,
        id: impl Into<String>,
    ) -> Arc<ScopedContext> {
        let parent = self.request_context(parent);
        let id = id.into();
        let mut requests = self.requests();
        if let Some(context) = requests.contexts.get(&id) {
            return context.clone();
        }
        let context = Arc::new(ScopedContext::with_parent(id.clone(), parent));
        requests.order.push(id.clone());
        requests.contexts.insert(id, context.clone());
        context
    }

    /// Tears down the request context `id` and forgets it.
    pub async fn end_request(&self, id: &str) -> ResolveResult<()> {
        let context = {
            let mut requests = self.requests();
            requests.order.retain(|v| v != id);
            requests.contexts.remove(id)
        };
        match context {
            Some(context) => context.dispose_async().await,
            None => Ok(()),
        }
    }

    fn requests(&self) -> MutexGuard<'_, RequestContexts> {
        self.inner.requests.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Builds the dependency graph of the registered providers and reports
    /// its cycles and missing dependencies.
    ///
    /// Lazy dependencies are left out of the graph, optional ones are not
    /// reported as missing.
    pub fn validate(&self) -> ValidationReport {
        let mut nodes: Vec<DependencyNode> = Vec::new();
        for registration in self.inner.registry.all_providers() {
            let dependencies: Vec<Dependency> = registration
                .dependencies()
                .into_iter()
                .filter(|v| !v.lazy)
                .collect();
            let tokens: Vec<Token> = dependencies.iter().map(|v| v.token.resolve()).collect();
            let optional: Vec<Token> = dependencies
                .iter()
                .filter(|v| v.optional)
                .map(|v| v.token.resolve())
                .collect();
            match nodes.iter_mut().find(|v| v.token == registration.token) {
                // Providers of one token share a node; a dependency stays
                // optional only while every provider declares it so.
                Some(node) => {
                    node.optional
                        .retain(|v| optional.contains(v) || !tokens.contains(v));
                    for token in tokens {
                        if !node.dependencies.contains(&token) {
                            if optional.contains(&token) {
                                node.optional.push(token.clone());
                            }
                            node.dependencies.push(token);
                        }
                    }
                }
                None => nodes.push(
                    DependencyNode::new(registration.token.clone(), tokens, registration.scope)
                        .optional(optional),
                ),
            }
        }
        let mut graph = DependencyGraph::new();
        for node in nodes {
            graph.add_node(node);
        }
        let analysis = graph.get_cycle_analysis();
        let missing: Vec<Token> = graph
            .get_missing_dependencies()
            .into_iter()
            .filter(|token| !self.has_token(token) && self.implicit_spec(token).is_none())
            .collect();
        let resolution_order = if analysis.cycles.is_empty() {
            graph.get_resolution_order()
        } else {
            Vec::new()
        };
        ValidationReport {
            valid: analysis.cycles.is_empty() && missing.is_empty(),
            cycles: analysis.cycles.clone(),
            missing,
            self_dependencies: graph.self_loops(),
            analysis,
            resolution_order,
        }
    }

    /// Tears down request contexts in reverse creation order, clears named
    /// scopes, then releases every singleton.
    ///
    /// All teardown runs even after a failure; the first failure is returned.
    pub async fn dispose(&self) -> ResolveResult<()> {
        let contexts: Vec<Arc<ScopedContext>> = {
            let mut requests = self.requests();
            let mut contexts = std::mem::take(&mut requests.contexts);
            std::mem::take(&mut requests.order)
                .into_iter()
                .rev()
                .filter_map(|id| contexts.remove(&id))
                .collect()
        };
        let mut result = Ok(());
        for context in contexts {
            if let Err(err) = context.dispose_async().await {
                tracing::error!(request = %context.id(), "Cannot dispose request context: {err}");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        if let Err(err) = self.inner.scopes.clear_all().await {
            tracing::error!("Cannot clear scopes: {err}");
            if result.is_ok() {
                result = Err(err);
            }
        }
        if let Err(err) = self.inner.singletons.clear_async().await {
            tracing::error!("Cannot release singletons: {err}");
            if result.is_ok() {
                result = Err(err.into());
            }
        }
        tracing::debug!("Container disposed");
        result
    }

    pub(crate) fn resolve_nested(
        &self,
        token: &Token,
        options: &ResolveOptions,
        parent: Option<&ResolutionContext>,
    ) -> ResolveResult<Option<Instance>> {
        self.resolve_in(token, options, parent, ResolutionStrategy::Default)
    }

    pub(crate) fn resolve_nested_async<'a>(
        &'a self,
        token: &'a Token,
        options: &'a ResolveOptions,
        parent: Option<&'a ResolutionContext>,
    ) -> BoxFuture<'a, ResolveResult<Option<Instance>>> {
        self.resolve_in_async(token, options, parent, ResolutionStrategy::Async)
    }

    /// Resolves a deferred handle, continuing `parent` when its requester is
    /// still in progress.
    pub(crate) fn resolve_deferred(
        &self,
        token: &Token,
        options: &ResolveOptions,
        parent: Option<&ResolutionContext>,
    ) -> ResolveResult<Instance> {
        let result = self.resolve_in(token, options, parent, ResolutionStrategy::Lazy);
        let instance = self.finish(token, options, result)?;
        instance.ok_or_else(|| missing_provider(token, ResolutionPath(vec![token.clone()])))
    }

    pub(crate) async fn resolve_deferred_async(
        &self,
        token: &Token,
        options: &ResolveOptions,
        parent: Option<&ResolutionContext>,
    ) -> ResolveResult<Instance> {
        let result = self
            .resolve_in_async(token, options, parent, ResolutionStrategy::Lazy)
            .await;
        let instance = self.finish(token, options, result)?;
        instance.ok_or_else(|| missing_provider(token, ResolutionPath(vec![token.clone()])))
    }

    fn finish(
        &self,
        token: &Token,
        options: &ResolveOptions,
        result: ResolveResult<Option<Instance>>,
    ) -> ResolveResult<Option<Instance>> {
        match result {
            Err(err) if options.optional && (err.is_missing_provider() || err.is_circular()) => {
                Ok(None)
            }
            Err(err) if !self.inner.options.strict && err.is_missing_provider() => {
                tracing::debug!(token = %token, "Unresolved in non-strict mode: {err}");
                Ok(None)
            }
            result => self.count_error(token, result),
        }
    }

    fn count_error<T>(&self, token: &Token, result: ResolveResult<T>) -> ResolveResult<T> {
        if let Err(err) = &result {
            self.inner.counters.errors.fetch_add(1, Ordering::Relaxed);
            if self.inner.options.debug {
                tracing::debug!(token = %token, "Resolution failed: {err}");
            }
        }
        result
    }

    fn context(
        &self,
        token: &Token,
        options: &ResolveOptions,
        parent: Option<&ResolutionContext>,
        strategy: ResolutionStrategy,
    ) -> ResolutionContext {
        ResolutionContext::new(
            token.clone(),
            options,
            &self.inner.options.metadata,
            parent,
            strategy,
        )
    }

    fn deferred(
        &self,
        token: &Token,
        options: &ResolveOptions,
        requester: Option<&ResolutionContext>,
    ) -> Instance {
        Arc::new(Deferred::new(self, token.clone(), options.clone(), requester))
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    fn resolve_in(
        &self,
        token: &Token,
        options: &ResolveOptions,
        parent: Option<&ResolutionContext>,
        strategy: ResolutionStrategy,
    ) -> ResolveResult<Option<Instance>> {
        self.inner.counters.resolutions.fetch_add(1, Ordering::Relaxed);
        match self.plan(token, options, parent, strategy)? {
            Plan::Ready(instance) => Ok(instance),
            Plan::Delegate(container) => {
                let options = delegated(options);
                container.resolve_in(token, &options, parent, strategy)
            }
            Plan::Alias(target, ctx) => self.alias(&target, &ctx).map(Some),
            Plan::Produce(registration, ctx) => self.produce(&registration, &ctx, true).map(Some),
        }
    }

    fn resolve_in_async<'a>(
        &'a self,
        token: &'a Token,
        options: &'a ResolveOptions,
        parent: Option<&'a ResolutionContext>,
        strategy: ResolutionStrategy,
    ) -> BoxFuture<'a, ResolveResult<Option<Instance>>> {
        Box::pin(async move {
            self.inner.counters.resolutions.fetch_add(1, Ordering::Relaxed);
            match self.plan(token, options, parent, strategy)? {
                Plan::Ready(instance) => Ok(instance),
                Plan::Delegate(container) => {
                    let options = delegated(options);
                    container
                        .resolve_in_async(token, &options, parent, strategy)
                        .await
                }
                Plan::Alias(target, ctx) => self.alias_async(&target, &ctx).await.map(Some),
                Plan::Produce(registration, ctx) => self
                    .produce_async(&registration, &ctx, true)
                    .await
                    .map(Some),
            }
        })
    }

    /// Decides how a resolution proceeds, without producing anything.
    fn plan(
        &self,
        token: &Token,
        options: &ResolveOptions,
        parent: Option<&ResolutionContext>,
        strategy: ResolutionStrategy,
    ) -> ResolveResult<Plan> {
        let lazy_allowed = strategy != ResolutionStrategy::Lazy;
        if options.lazy && lazy_allowed {
            return Ok(Plan::Ready(Some(self.deferred(token, options, parent))));
        }
        let ctx = self.context(token, options, parent, strategy);
        if parent.is_some_and(|v| v.path.contains(token)) {
            return Err(ResolveError::CircularDependency { path: ctx.path });
        }
        if let Some(path) = Producing::cycle(self.id(), token, &ctx.path) {
            return Err(ResolveError::CircularDependency { path });
        }
        if options.skip_self {
            return match &self.inner.parent {
                Some(parent) => Ok(Plan::Delegate(parent.clone())),
                None => Err(missing_provider(token, ctx.path)),
            };
        }
        let Some(registration) = self.select_provider(&ctx) else {
            if !options.self_only
                && let Some(parent) = &self.inner.parent
            {
                tracing::trace!(token = %token, "Delegating to parent container");
                return Ok(Plan::Delegate(parent.clone()));
            }
            if options.optional {
                return Ok(Plan::Ready(None));
            }
            return Err(missing_provider(token, ctx.path));
        };
        if registration.lazy && lazy_allowed {
            return Ok(Plan::Ready(Some(self.deferred(token, options, parent))));
        }
        if let Strategy::Existing(target) = &registration.strategy {
            return Ok(Plan::Alias(target.resolve(), ctx));
        }
        if let Some(instance) = self.lookup(&registration, &ctx)? {
            self.inner.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(token = %token, scope = %registration.scope, "Cache hit");
            return Ok(Plan::Ready(Some(instance)));
        }
        Ok(Plan::Produce(registration, ctx))
    }

    fn select_provider(&self, ctx: &ResolutionContext) -> Option<Arc<Registration>> {
        let providers = self.inner.registry.providers_for(&ctx.token);
        if let Some(registration) = providers.iter().find(|v| !v.multi && v.is_eligible(ctx)) {
            return Some(registration.clone());
        }
        if let Some(spec) = self.implicit_spec(&ctx.token) {
            match Provider::new(&ctx.token).use_class_spec(spec).into_registration() {
                Ok(registration) => return Some(Arc::new(registration)),
                Err(err) => tracing::warn!(token = %ctx.token, "Invalid implicit provider: {err}"),
            }
        }
        let fallback = providers.into_iter().find(|v| !v.multi)?;
        tracing::debug!(
            token = %ctx.token,
            "No eligible provider, falling back to the first registered one"
        );
        Some(fallback)
    }

    fn implicit_spec(&self, token: &Token) -> Option<crate::ClassSpec> {
        self.inner
            .options
            .metadata_provider
            .as_ref()
            .and_then(|v| v.class_spec(token))
    }

    fn multi_providers(&self, ctx: &ResolutionContext) -> Vec<Arc<Registration>> {
        self.inner
            .registry
            .providers_for(&ctx.token)
            .into_iter()
            .filter(|v| v.multi && v.is_eligible(ctx))
            .collect()
    }

    fn lookup(
        &self,
        registration: &Registration,
        ctx: &ResolutionContext,
    ) -> ResolveResult<Option<Instance>> {
        match registration.scope {
            Scope::Singleton => Ok(self.inner.singletons.get(&ctx.token)),
            Scope::Request => {
                let id = request_id(ctx)?;
                let context = self.requests().contexts.get(id).cloned();
                Ok(context.and_then(|v| v.get(&ctx.token)))
            }
            Scope::Scoped => {
                let name = scope_name(ctx)?;
                if !self.inner.scopes.has_scope(name) {
                    return Err(ResolveError::scope(
                        &ctx.token,
                        format!("scope {name:?} does not exist"),
                        ctx.path.clone(),
                    ));
                }
                Ok(self.inner.scopes.get_from_scope(name, &ctx.token))
            }
            Scope::Transient | Scope::Prototype => Ok(None),
        }
    }

    fn store(
        &self,
        registration: &Registration,
        ctx: &ResolutionContext,
        instance: &Instance,
    ) -> ResolveResult<()> {
        let lifecycle = registration.lifecycle.clone();
        match registration.scope {
            Scope::Singleton => {
                let on_release = if !lifecycle.has_teardown() {
                    None
                } else if lifecycle.has_async_teardown() {
                    Some(Release::from_async(move |instance: Instance| async move {
                        lifecycle.teardown_async(&instance).await
                    }))
                } else {
                    Some(Release::sync(move |instance: Instance| lifecycle.teardown(&instance)))
                };
                self.inner.singletons.set_with(
                    ctx.token.clone(),
                    instance.clone(),
                    SetOptions {
                        ttl: None,
                        on_release,
                    },
                );
            }
            Scope::Request => {
                let context = self.request_context(request_id(ctx)?);
                context.set_with(ctx.token.clone(), instance.clone(), lifecycle);
            }
            Scope::Scoped => {
                self.inner
                    .scopes
                    .set_in_scope_with(scope_name(ctx)?, ctx.token.clone(), instance.clone(), lifecycle)
                    .map_err(|err| with_path(err, ctx))?;
            }
            Scope::Transient | Scope::Prototype => {}
        }
        Ok(())
    }

    fn produce(
        &self,
        registration: &Arc<Registration>,
        ctx: &ResolutionContext,
        cache: bool,
    ) -> ResolveResult<Instance> {
        if let Strategy::Existing(target) = &registration.strategy {
            return self.alias(&target.resolve(), ctx);
        }
        if registration.strategy.is_async() {
            return Err(async_in_sync(ctx, "provider"));
        }
        if registration
            .lifecycle
            .on_init
            .as_ref()
            .is_some_and(|v| v.is_async())
        {
            return Err(async_in_sync(ctx, "initialization hook"));
        }
        let _producing = (!registration.multi).then(|| Producing::enter(self.id(), &ctx.token));
        let middleware = self.middleware();
        middleware.run_before(ctx)?;
        let produce = || self.instantiate(registration, ctx);
        let instance = run_chain(ctx, self.chain(registration), &produce)?;
        let instance = middleware.run_after(ctx, instance)?;
        if cache {
            self.store(registration, ctx, &instance)?;
        }
        self.created(registration, ctx);
        if let Some(hook) = &registration.lifecycle.on_init
            && let Some(Err(err)) = hook.call(&instance)
        {
            tracing::warn!(token = %ctx.token, path = %ctx.path, "Initialization hook failed: {err}");
        }
        Ok(instance)
    }

    async fn produce_async(
        &self,
        registration: &Arc<Registration>,
        ctx: &ResolutionContext,
        cache: bool,
    ) -> ResolveResult<Instance> {
        if let Strategy::Existing(target) = &registration.strategy {
            return self.alias_async(&target.resolve(), ctx).await;
        }
        let middleware = self.middleware();
        middleware.run_before_async(ctx).await?;
        let produce =
            move || Box::pin(self.instantiate_async(registration, ctx)) as BoxFuture<'_, _>;
        let instance = run_chain_async(ctx, self.chain(registration), &produce).await?;
        let instance = middleware.run_after_async(ctx, instance).await?;
        if cache {
            self.store(registration, ctx, &instance)?;
        }
        self.created(registration, ctx);
        if let Some(hook) = &registration.lifecycle.on_init {
            hook.call_async(&instance).await.map_err(|e| ctx.error(e))?;
        }
        Ok(instance)
    }

    /// Resolves the target of an alias; the alias itself is never produced.
    fn alias(&self, target: &Token, ctx: &ResolutionContext) -> ResolveResult<Instance> {
        let options = ResolveOptions::for_dependency(ctx, false);
        let instance = self.resolve_in(target, &options, Some(ctx), ResolutionStrategy::Default)?;
        instance.ok_or_else(|| missing_provider(target, ctx.path.clone()))
    }

    async fn alias_async(&self, target: &Token, ctx: &ResolutionContext) -> ResolveResult<Instance> {
        let options = ResolveOptions::for_dependency(ctx, false);
        let instance = self
            .resolve_in_async(target, &options, Some(ctx), ResolutionStrategy::Async)
            .await?;
        instance.ok_or_else(|| missing_provider(target, ctx.path.clone()))
    }

    fn chain<'a>(&'a self, registration: &'a Registration) -> &'a [BoxInterceptor] {
        if registration.interceptors.is_empty() {
            &self.inner.options.interceptors
        } else {
            &registration.interceptors
        }
    }

    fn created(&self, registration: &Registration, ctx: &ResolutionContext) {
        self.inner.counters.creations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            token = %ctx.token,
            scope = %registration.scope,
            strategy = registration.strategy.kind(),
            depth = ctx.depth,
            "Instance created"
        );
    }

    fn instantiate(
        &self,
        registration: &Registration,
        ctx: &ResolutionContext,
    ) -> ResolveResult<Instance> {
        match &registration.strategy {
            Strategy::Class(spec) => {
                let args = self.resolve_dependencies(&spec.dependencies, ctx)?;
                let injector = Injector::new(self.clone(), ctx.clone(), args);
                (spec.construct)(&injector).map_err(|e| ctx.error(e))
            }
            Strategy::Value(value) => Ok(value.clone()),
            Strategy::Factory {
                dependencies,
                factory: Factory::Sync(factory),
            } => {
                let args = self.resolve_dependencies(dependencies, ctx)?;
                let injector = Injector::new(self.clone(), ctx.clone(), args);
                factory(&injector).map_err(|e| ctx.error(e))
            }
            Strategy::Factory {
                factory: Factory::Async(_),
                ..
            }
            | Strategy::Async(_) => Err(async_in_sync(ctx, "provider")),
            Strategy::Existing(target) => self.alias(&target.resolve(), ctx),
        }
    }

    async fn instantiate_async(
        &self,
        registration: &Registration,
        ctx: &ResolutionContext,
    ) -> ResolveResult<Instance> {
        match &registration.strategy {
            Strategy::Class(spec) => {
                let args = self
                    .resolve_dependencies_async(&spec.dependencies, ctx)
                    .await?;
                let injector = Injector::new(self.clone(), ctx.clone(), args);
                (spec.construct)(&injector).map_err(|e| ctx.error(e))
            }
            Strategy::Value(value) => Ok(value.clone()),
            Strategy::Factory {
                dependencies,
                factory,
            } => {
                let args = self.resolve_dependencies_async(dependencies, ctx).await?;
                let injector = Injector::new(self.clone(), ctx.clone(), args);
                let result = match factory {
                    Factory::Sync(factory) => factory(&injector),
                    Factory::Async(factory) => factory(injector).await,
                };
                result.map_err(|e| ctx.error(e))
            }
            Strategy::Async(factory) => factory().await.map_err(|e| ctx.error(e)),
            Strategy::Existing(target) => self.alias_async(&target.resolve(), ctx).await,
        }
    }

    fn resolve_dependencies(
        &self,
        dependencies: &[Dependency],
        ctx: &ResolutionContext,
    ) -> ResolveResult<Vec<Option<Instance>>> {
        dependencies
            .iter()
            .map(|dependency| {
                let token = dependency.token.resolve();
                let options = dependency_options(dependency, ctx);
                let result = self.resolve_in(&token, &options, Some(ctx), ResolutionStrategy::Default);
                dependency_result(dependency, &token, ctx, result)
            })
            .collect()
    }

    async fn resolve_dependencies_async(
        &self,
        dependencies: &[Dependency],
        ctx: &ResolutionContext,
    ) -> ResolveResult<Vec<Option<Instance>>> {
        let mut args = Vec::with_capacity(dependencies.len());
        for dependency in dependencies {
            let token = dependency.token.resolve();
            let options = dependency_options(dependency, ctx);
            let result = self
                .resolve_in_async(&token, &options, Some(ctx), ResolutionStrategy::Async)
                .await;
            args.push(dependency_result(dependency, &token, ctx, result)?);
        }
        Ok(args)
    }
}

fn delegated(options: &ResolveOptions) -> ResolveOptions {
    ResolveOptions {
        skip_self: false,
        ..options.clone()
    }
}

fn dependency_options(dependency: &Dependency, ctx: &ResolutionContext) -> ResolveOptions {
    let mut options = ResolveOptions::for_dependency(ctx, false);
    options.lazy = dependency.lazy;
    options
}

fn dependency_result(
    dependency: &Dependency,
    token: &Token,
    ctx: &ResolutionContext,
    result: ResolveResult<Option<Instance>>,
) -> ResolveResult<Option<Instance>> {
    match result {
        Ok(Some(instance)) => Ok(Some(instance)),
        Ok(None) if dependency.optional => Ok(None),
        Ok(None) => {
            let mut path = ctx.path.0.clone();
            path.push(token.clone());
            Err(missing_provider(token, ResolutionPath(path)))
        }
        Err(err) if dependency.optional => {
            tracing::debug!(token = %token, requested_by = %ctx.token, "Optional dependency skipped: {err}");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

fn request_id(ctx: &ResolutionContext) -> ResolveResult<&str> {
    ctx.request_id.as_deref().ok_or_else(|| {
        ResolveError::scope(
            &ctx.token,
            "request scoped provider resolved without a request id",
            ctx.path.clone(),
        )
    })
}

fn scope_name(ctx: &ResolutionContext) -> ResolveResult<&str> {
    ctx.scope.as_deref().ok_or_else(|| {
        ResolveError::scope(
            &ctx.token,
            "scoped provider resolved without a scope name",
            ctx.path.clone(),
        )
    })
}

fn with_path(err: ResolveError, ctx: &ResolutionContext) -> ResolveError {
    match err {
        ResolveError::Scope { token, reason, .. } => ResolveError::Scope {
            token,
            reason,
            path: ctx.path.clone(),
        },
        err => err,
    }
}

fn missing_provider(token: &Token, path: ResolutionPath) -> ResolveError {
    ResolveError::MissingProvider {
        token: token.clone(),
        path,
    }
}

fn async_in_sync(ctx: &ResolutionContext, what: &'static str) -> ResolveError {
    ResolveError::AsyncInSyncPath {
        token: ctx.token.clone(),
        what,
        path: ctx.path.clone(),
    }
}

pub(crate) fn downcast<T>(token: &Token, instance: Instance) -> ResolveResult<Arc<T>>
where
    T: Send + Sync + 'static,
{
    instance
        .downcast::<T>()
        .map_err(|_| ResolveError::TypeMismatch {
            token: token.clone(),
            expected: type_name::<T>(),
        })
}

/// Downcasts a resolved value, forcing deferred handles.
pub(crate) fn require<T>(token: Token, instance: Option<Instance>) -> ResolveResult<Arc<T>>
where
    T: Send + Sync + 'static,
{
    let Some(instance) = instance else {
        return Err(missing_provider(&token, ResolutionPath(vec![token.clone()])));
    };
    let instance = match instance.downcast::<Deferred>() {
        Ok(deferred) => deferred.force()?,
        Err(instance) => instance,
    };
    downcast(&token, instance)
}

pub(crate) async fn require_async<T>(token: Token, instance: Option<Instance>) -> ResolveResult<Arc<T>>
where
    T: Send + Sync + 'static,
{
    let Some(instance) = instance else {
        return Err(missing_provider(&token, ResolutionPath(vec![token.clone()])));
    };
    let instance = match instance.downcast::<Deferred>() {
        Ok(deferred) => deferred.force_async().await?,
        Err(instance) => instance,
    };
    downcast(&token, instance)
}
