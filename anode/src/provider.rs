use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::{
    BoxInterceptor, ClassSpec, Dependency, Hook, Injectable, Injector, Instance, Interceptor, Lifecycle,
    ResolutionContext, ResolveError, ResolveResult, StdError, Token, TokenRef,
};

/// Lifetime policy of produced instances.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// One instance per container, kept until disposal.
    #[default]
    Singleton,
    /// A new instance for every resolution.
    Transient,
    /// One instance per request identifier.
    Request,
    /// A new instance for every resolution, sharing a behavioural template.
    Prototype,
    /// One instance per named scope of the scope manager.
    Scoped,
}

impl Scope {
    /// Whether instances outlive the resolution that produced them.
    pub fn is_cached(self) -> bool {
        matches!(self, Self::Singleton | Self::Request | Self::Scoped)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Singleton => "singleton",
            Self::Transient => "transient",
            Self::Request => "request",
            Self::Prototype => "prototype",
            Self::Scoped => "scoped",
        };
        f.write_str(name)
    }
}

pub(crate) type Predicate = Arc<dyn Fn(&ResolutionContext) -> bool + Send + Sync>;
pub(crate) type SyncFactoryFn = dyn Fn(&Injector) -> Result<Instance, StdError> + Send + Sync;
pub(crate) type AsyncFactoryFn =
    dyn Fn(Injector) -> BoxFuture<'static, Result<Instance, StdError>> + Send + Sync;
pub(crate) type AsyncFn = dyn Fn() -> BoxFuture<'static, Result<Instance, StdError>> + Send + Sync;

#[derive(Clone)]
pub enum Factory {
    Sync(Arc<SyncFactoryFn>),
    Async(Arc<AsyncFactoryFn>),
}

/// How a registered provider produces its value.
#[derive(Clone)]
pub enum Strategy {
    Class(ClassSpec),
    Value(Instance),
    Factory {
        dependencies: Vec<Dependency>,
        factory: Factory,
    },
    Existing(TokenRef),
    Async(Arc<AsyncFn>),
}

impl Strategy {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Class(_) => "class",
            Self::Value(_) => "value",
            Self::Factory {
                factory: Factory::Sync(_),
                ..
            } => "factory",
            Self::Factory {
                factory: Factory::Async(_),
                ..
            } => "async factory",
            Self::Existing(_) => "existing",
            Self::Async(_) => "async",
        }
    }

    /// Whether production must suspend.
    pub fn is_async(&self) -> bool {
        matches!(
            self,
            Self::Async(_)
                | Self::Factory {
                    factory: Factory::Async(_),
                    ..
                }
        )
    }
}

/// Declarative description of how to produce the value of a token.
///
/// A declaration may carry any combination of `use_*` fields; the container
/// rejects declarations without exactly one of them when they are added.
///
/// # Examples
///
/// ```rust
/// use anode::{Container, Dependency, Provider, Scope};
///
/// let container = Container::new();
/// container
///     .add_provider(Provider::new("url").use_value("https://x".to_string()))
///     .unwrap();
/// container
///     .add_provider(
///         Provider::new("greeting")
///             .use_factory([Dependency::new("url")], |injector| {
///                 let url = injector.arg::<String>(0)?;
///                 Ok(format!("hello {url}"))
///             })
///             .scope(Scope::Transient),
///     )
///     .unwrap();
///
/// let greeting = container.resolve::<String>("greeting").unwrap();
/// assert_eq!(greeting.as_str(), "hello https://x");
/// ```
#[must_use]
pub struct Provider {
    token: TokenRef,
    class: Option<ClassSpec>,
    value: Option<Instance>,
    factory: Option<(Vec<Dependency>, Factory)>,
    existing: Option<TokenRef>,
    async_fn: Option<Arc<AsyncFn>>,
    scope: Option<Scope>,
    multi: bool,
    lazy: bool,
    when: Option<Predicate>,
    interceptors: Vec<BoxInterceptor>,
    tags: Vec<String>,
    metadata: BTreeMap<String, serde_json::Value>,
    lifecycle: Lifecycle,
}

impl Provider {
    pub fn new(token: impl Into<TokenRef>) -> Self {
        Self {
            token: token.into(),
            class: None,
            value: None,
            factory: None,
            existing: None,
            async_fn: None,
            scope: None,
            multi: false,
            lazy: false,
            when: None,
            interceptors: Vec::new(),
            tags: Vec::new(),
            metadata: BTreeMap::new(),
            lifecycle: Lifecycle::default(),
        }
    }

    /// Declares a class provider registered under the type's own token.
    pub fn class<T>() -> Self
    where
        T: Injectable,
    {
        Self::new(Token::of::<T>()).use_class::<T>()
    }

    /// Declares a value provider registered under the type's own token.
    pub fn value<T>(value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        Self::new(Token::of::<T>()).use_value(value)
    }

    pub fn use_class<T>(self) -> Self
    where
        T: Injectable,
    {
        self.use_class_spec(ClassSpec::of::<T>())
    }

    pub fn use_class_spec(mut self, spec: ClassSpec) -> Self {
        self.class = Some(spec);
        self
    }

    pub fn use_value<T>(self, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.use_instance(Arc::new(value))
    }

    pub fn use_instance(mut self, instance: Instance) -> Self {
        self.value = Some(instance);
        self
    }

    /// Produces the value by calling `factory` with the resolved `dependencies`.
    pub fn use_factory<T, F>(mut self, dependencies: impl IntoIterator<Item = Dependency>, factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&Injector) -> Result<T, StdError> + Send + Sync + 'static,
    {
        let factory = Factory::Sync(Arc::new(move |injector: &Injector| {
            factory(injector).map(|v| Arc::new(v) as Instance)
        }));
        self.factory = Some((dependencies.into_iter().collect(), factory));
        self
    }

    pub fn use_async_factory<T, F, Fut>(
        mut self,
        dependencies: impl IntoIterator<Item = Dependency>,
        factory: F,
    ) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(Injector) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, StdError>> + Send + 'static,
    {
        let factory = Factory::Async(Arc::new(move |injector: Injector| {
            let future = factory(injector);
            Box::pin(async move { future.await.map(|v| Arc::new(v) as Instance) })
                as BoxFuture<'static, _>
        }));
        self.factory = Some((dependencies.into_iter().collect(), factory));
        self
    }

    /// Forwards to another token, sharing its instance and scope.
    pub fn use_existing(mut self, token: impl Into<TokenRef>) -> Self {
        self.existing = Some(token.into());
        self
    }

    /// Produces the value with a zero-argument asynchronous factory.
    pub fn use_async<T, F, Fut>(mut self, f: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, StdError>> + Send + 'static,
    {
        self.async_fn = Some(Arc::new(move || {
            let future = f();
            Box::pin(async move { future.await.map(|v| Arc::new(v) as Instance) })
                as BoxFuture<'static, _>
        }));
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Contributes to a multi-valued token, see [`Container::get_all`](crate::Container::get_all).
    pub fn multi(mut self) -> Self {
        self.multi = true;
        self
    }

    /// Resolves to a deferred handle instead of the instance.
    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    /// Makes the provider eligible only when `predicate` holds.
    pub fn when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ResolutionContext) -> bool + Send + Sync + 'static,
    {
        self.when = Some(Arc::new(predicate));
        self
    }

    /// Appends a local interceptor; the first one added is the outermost.
    ///
    /// Providers without local interceptors use the container default chain.
    pub fn interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.interceptors.push(BoxInterceptor::new(interceptor));
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn on_init(mut self, hook: Hook) -> Self {
        self.lifecycle.on_init = Some(hook);
        self
    }

    pub fn on_destroy(mut self, hook: Hook) -> Self {
        self.lifecycle.on_destroy = Some(hook);
        self
    }

    pub fn dispose(mut self, hook: Hook) -> Self {
        self.lifecycle.dispose = Some(hook);
        self
    }

    /// Checks the declaration and turns it into a registration.
    pub(crate) fn into_registration(self) -> ResolveResult<Registration> {
        let token = self.token.resolve();
        let mut declared = Vec::new();
        if self.class.is_some() {
            declared.push("use_class");
        }
        if self.value.is_some() {
            declared.push("use_value");
        }
        if let Some((_, factory)) = &self.factory {
            declared.push(match factory {
                Factory::Sync(_) => "use_factory",
                Factory::Async(_) => "use_async_factory",
            });
        }
        if self.existing.is_some() {
            declared.push("use_existing");
        }
        if self.async_fn.is_some() {
            declared.push("use_async");
        }
        if declared.len() > 1 {
            return Err(ResolveError::configuration(
                &token,
                format!("multiple production strategies: {}", declared.join(", ")),
            ));
        }
        let mut lifecycle = self.lifecycle;
        let (strategy, default_scope) = if let Some(spec) = self.class {
            let scope = spec.scope;
            lifecycle = spec.lifecycle.clone().merged_with(lifecycle);
            (Strategy::Class(spec), scope)
        } else if let Some(value) = self.value {
            (Strategy::Value(value), None)
        } else if let Some((dependencies, factory)) = self.factory {
            (
                Strategy::Factory {
                    dependencies,
                    factory,
                },
                None,
            )
        } else if let Some(target) = self.existing {
            if !target.is_forward() && target.resolve() == token {
                return Err(ResolveError::configuration(&token, "alias refers to itself"));
            }
            (Strategy::Existing(target), None)
        } else if let Some(f) = self.async_fn {
            (Strategy::Async(f), None)
        } else {
            return Err(ResolveError::configuration(
                &token,
                "no production strategy, expected one of use_class, use_value, use_factory, use_existing, use_async",
            ));
        };
        let scope = match strategy {
            // Literal values are shared by construction.
            Strategy::Value(_) => Scope::Singleton,
            _ => self.scope.or(default_scope).unwrap_or_default(),
        };
        Ok(Registration {
            token,
            strategy,
            scope,
            multi: self.multi,
            lazy: self.lazy,
            when: self.when,
            interceptors: self.interceptors,
            tags: self.tags,
            metadata: self.metadata,
            lifecycle,
        })
    }
}

/// Validated provider stored in the registry.
pub struct Registration {
    pub(crate) token: Token,
    pub(crate) strategy: Strategy,
    pub(crate) scope: Scope,
    pub(crate) multi: bool,
    pub(crate) lazy: bool,
    pub(crate) when: Option<Predicate>,
    pub(crate) interceptors: Vec<BoxInterceptor>,
    pub(crate) tags: Vec<String>,
    pub(crate) metadata: BTreeMap<String, serde_json::Value>,
    pub(crate) lifecycle: Lifecycle,
}

impl Registration {
    pub fn token(&self) -> &Token {
        &self.token
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn is_multi(&self) -> bool {
        self.multi
    }

    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    pub fn is_conditional(&self) -> bool {
        self.when.is_some()
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }

    /// Evaluates the `when` predicate; unconditional providers are always eligible.
    pub fn is_eligible(&self, ctx: &ResolutionContext) -> bool {
        self.when.as_ref().is_none_or(|when| when(ctx))
    }

    /// Declared dependencies, aliases included.
    pub fn dependencies(&self) -> Vec<Dependency> {
        match &self.strategy {
            Strategy::Class(spec) => spec.dependencies.clone(),
            Strategy::Factory { dependencies, .. } => dependencies.clone(),
            Strategy::Existing(target) => vec![Dependency::new(target.clone())],
            Strategy::Value(_) | Strategy::Async(_) => Vec::new(),
        }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("token", &self.token)
            .field("strategy", &self.strategy.kind())
            .field("scope", &self.scope)
            .field("multi", &self.multi)
            .field("lazy", &self.lazy)
            .field("conditional", &self.when.is_some())
            .field("tags", &self.tags)
            .finish()
    }
}
