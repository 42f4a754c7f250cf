//! Class metadata and argument injection.
//!
//! This module provides the interface between the resolution engine and the
//! types it constructs:
//!
//! - [`Injectable`] - Declares constructor dependencies and how to build a type
//! - [`ClassSpec`] - Type-erased form of an [`Injectable`] used by class providers
//! - [`MetadataProvider`] - Supplies class specs for tokens without an explicit provider
//! - [`Injector`] - Positional access to resolved arguments during construction
//!
//! # Examples
//!
//! Declaring dependencies by hand:
//!
//! ```rust
//! use anode::{Container, Dependency, Injectable, Injector, Provider, StdError};
//! use std::sync::Arc;
//!
//! struct Config {
//!     url: String,
//! }
//!
//! struct Client {
//!     config: Arc<Config>,
//! }
//!
//! impl Injectable for Client {
//!     fn dependencies() -> Vec<Dependency> {
//!         vec![Dependency::of::<Config>()]
//!     }
//!
//!     fn construct(injector: &Injector) -> Result<Self, StdError> {
//!         Ok(Self {
//!             config: injector.arg(0)?,
//!         })
//!     }
//! }
//!
//! let container = Container::new();
//! container
//!     .add_provider(Provider::value(Config { url: "https://x".into() }))
//!     .unwrap();
//! container.add_provider(Provider::class::<Client>()).unwrap();
//!
//! let client = container.resolve::<Client>(anode::Token::of::<Client>()).unwrap();
//! assert_eq!(client.config.url, "https://x");
//! ```

use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;

use crate::container::WeakContainer;
use crate::{
    Container, Instance, Lifecycle, ResolutionContext, ResolveError, ResolveOptions,
    ResolveResult, Scope, StdError, Token, TokenRef,
};

/// Descriptor of one constructor or factory argument.
#[derive(Clone, Debug)]
pub struct Dependency {
    pub token: TokenRef,
    /// Substitute `None` when the dependency cannot be resolved.
    pub optional: bool,
    /// Inject a deferred handle instead of the instance.
    pub lazy: bool,
}

impl Dependency {
    pub fn new(token: impl Into<TokenRef>) -> Self {
        Self {
            token: token.into(),
            optional: false,
            lazy: false,
        }
    }

    pub fn of<T>() -> Self
    where
        T: ?Sized + 'static,
    {
        Self::new(Token::of::<T>())
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }
}

/// Trait for types the container can construct.
///
/// With the `macros` feature enabled the implementation can be derived, see
/// `#[derive(Injectable)]`.
pub trait Injectable: Send + Sync + Sized + 'static {
    /// Ordered constructor dependencies, matching the positions read by
    /// [`Injectable::construct`].
    fn dependencies() -> Vec<Dependency> {
        Vec::new()
    }

    fn construct(injector: &Injector) -> Result<Self, StdError>;

    /// Default lifetime used when the provider does not declare one.
    fn scope() -> Option<Scope> {
        None
    }

    /// Lifecycle hooks attached to every instance.
    fn lifecycle() -> Lifecycle {
        Lifecycle::default()
    }
}

type ConstructFn = dyn Fn(&Injector) -> Result<Instance, StdError> + Send + Sync;

/// Type-erased construction recipe of a class provider.
#[derive(Clone)]
pub struct ClassSpec {
    pub(crate) type_name: &'static str,
    pub(crate) dependencies: Vec<Dependency>,
    pub(crate) construct: Arc<ConstructFn>,
    pub(crate) scope: Option<Scope>,
    pub(crate) lifecycle: Lifecycle,
}

impl ClassSpec {
    pub fn of<T>() -> Self
    where
        T: Injectable,
    {
        Self {
            type_name: type_name::<T>(),
            dependencies: T::dependencies(),
            construct: Arc::new(|injector: &Injector| -> Result<Instance, StdError> {
                Ok(Arc::new(T::construct(injector)?))
            }),
            scope: T::scope(),
            lifecycle: T::lifecycle(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }
}

impl fmt::Debug for ClassSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassSpec")
            .field("type_name", &self.type_name)
            .field("dependencies", &self.dependencies)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Source of class specs for tokens resolved without an explicit provider.
pub trait MetadataProvider: Send + Sync {
    fn class_spec(&self, token: &Token) -> Option<ClassSpec>;
}

/// Explicitly populated [`MetadataProvider`].
#[derive(Default)]
pub struct InjectableRegistry {
    classes: DashMap<Token, ClassSpec>,
}

impl InjectableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T>(&self) -> &Self
    where
        T: Injectable,
    {
        self.classes.insert(Token::of::<T>(), ClassSpec::of::<T>());
        self
    }

    pub fn with<T>(self) -> Self
    where
        T: Injectable,
    {
        self.register::<T>();
        self
    }

    pub fn contains(&self, token: &Token) -> bool {
        self.classes.contains_key(token)
    }
}

impl MetadataProvider for InjectableRegistry {
    fn class_spec(&self, token: &Token) -> Option<ClassSpec> {
        self.classes.get(token).map(|v| v.clone())
    }
}

/// Arguments and resolution context handed to constructors and factories.
///
/// Arguments are positional, in the order of the declared dependencies.
/// Further tokens can be resolved with [`Injector::resolve`]; such secondary
/// resolutions continue the current resolution path, so cycles through them
/// are detected as well.
pub struct Injector {
    container: Container,
    context: ResolutionContext,
    args: Vec<Option<Instance>>,
}

impl Injector {
    pub(crate) fn new(
        container: Container,
        context: ResolutionContext,
        args: Vec<Option<Instance>>,
    ) -> Self {
        Self {
            container,
            context,
            args,
        }
    }

    pub fn context(&self) -> &ResolutionContext {
        &self.context
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Raw argument at `index`, `None` for a missing optional dependency.
    pub fn raw(&self, index: usize) -> Option<&Instance> {
        self.args.get(index).and_then(Option::as_ref)
    }

    /// Required argument at `index` downcast to `T`.
    ///
    /// Deferred arguments are resolved on access.
    pub fn arg<T>(&self, index: usize) -> Result<Arc<T>, StdError>
    where
        T: Send + Sync + 'static,
    {
        match self.optional_arg(index)? {
            Some(v) => Ok(v),
            None => Err(format!(
                "Missing argument {index} of {}",
                self.context.token.describe()
            )
            .into()),
        }
    }

    pub fn optional_arg<T>(&self, index: usize) -> Result<Option<Arc<T>>, StdError>
    where
        T: Send + Sync + 'static,
    {
        let Some(instance) = self.raw(index) else {
            return Ok(None);
        };
        let instance = match instance.clone().downcast::<Deferred>() {
            Ok(deferred) => deferred.force()?,
            Err(instance) => instance,
        };
        instance
            .downcast::<T>()
            .map(Some)
            .map_err(|_| format!("Argument {index} is not a {}", type_name::<T>()).into())
    }

    /// Argument at `index` as a deferred handle.
    ///
    /// Eagerly resolved arguments are wrapped into an already resolved handle.
    pub fn lazy_arg<T>(&self, index: usize) -> Result<Lazy<T>, StdError>
    where
        T: Send + Sync + 'static,
    {
        match self.raw(index) {
            Some(instance) => Ok(Lazy::from_instance(instance.clone())),
            None => Err(format!("Missing argument {index}").into()),
        }
    }

    /// Resolves `token` with explicit options, continuing the current path.
    pub fn get(
        &self,
        token: impl Into<TokenRef>,
        options: &ResolveOptions,
    ) -> ResolveResult<Option<Instance>> {
        self.container
            .resolve_nested(&token.into().resolve(), options, Some(&self.context))
    }

    /// Resolves `token` as a dependency of the current resolution.
    pub fn resolve<T>(&self, token: impl Into<Token>) -> ResolveResult<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let token = token.into();
        let options = ResolveOptions::for_dependency(&self.context, false);
        let instance = self
            .container
            .resolve_nested(&token, &options, Some(&self.context))?;
        crate::container::require(token, instance)
    }

    pub async fn resolve_async<T>(&self, token: impl Into<Token>) -> ResolveResult<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let token = token.into();
        let options = ResolveOptions::for_dependency(&self.context, false);
        let instance = self
            .container
            .resolve_nested_async(&token, &options, Some(&self.context))
            .await?;
        crate::container::require_async(token, instance).await
    }
}

/// Type-erased deferred resolution stored in place of an instance.
pub(crate) struct Deferred {
    container: WeakContainer,
    token: Token,
    options: ResolveOptions,
    requester: Option<Requester>,
    cell: OnceLock<Instance>,
}

/// Resolution that handed out a deferred dependency.
struct Requester {
    context: ResolutionContext,
    active: Weak<()>,
}

impl Deferred {
    pub(crate) fn new(
        container: &Container,
        token: Token,
        mut options: ResolveOptions,
        requester: Option<&ResolutionContext>,
    ) -> Self {
        options.lazy = false;
        Self {
            container: container.downgrade(),
            token,
            options,
            requester: requester.map(|v| Requester {
                context: v.detached(),
                active: v.liveness(),
            }),
            cell: OnceLock::new(),
        }
    }

    fn container(&self) -> ResolveResult<Container> {
        self.container.upgrade().ok_or_else(|| {
            ResolveError::scope(
                &self.token,
                "container was dropped before the deferred value was used",
                Default::default(),
            )
        })
    }

    /// Requester path to continue while the requester is still being produced.
    fn parent(&self) -> Option<&ResolutionContext> {
        self.requester
            .as_ref()
            .filter(|v| v.active.strong_count() > 0)
            .map(|v| &v.context)
    }

    pub(crate) fn force(&self) -> ResolveResult<Instance> {
        if let Some(v) = self.cell.get() {
            return Ok(v.clone());
        }
        let instance =
            self.container()?
                .resolve_deferred(&self.token, &self.options, self.parent())?;
        Ok(self.cell.get_or_init(|| instance).clone())
    }

    pub(crate) async fn force_async(&self) -> ResolveResult<Instance> {
        if let Some(v) = self.cell.get() {
            return Ok(v.clone());
        }
        let instance = self
            .container()?
            .resolve_deferred_async(&self.token, &self.options, self.parent())
            .await?;
        Ok(self.cell.get_or_init(|| instance).clone())
    }
}

/// Handle resolving its value on first use.
///
/// The produced value is memoized, later calls return the same instance.
pub struct Lazy<T> {
    source: LazySource,
    _marker: PhantomData<fn() -> T>,
}

enum LazySource {
    Deferred(Arc<Deferred>),
    Ready(Instance),
}

impl<T> Lazy<T>
where
    T: Send + Sync + 'static,
{
    pub(crate) fn deferred(deferred: Arc<Deferred>) -> Self {
        Self {
            source: LazySource::Deferred(deferred),
            _marker: PhantomData,
        }
    }

    /// Wraps an instance returned by a lazy resolution.
    pub fn from_instance(instance: Instance) -> Self {
        let source = match instance.downcast::<Deferred>() {
            Ok(deferred) => LazySource::Deferred(deferred),
            Err(instance) => LazySource::Ready(instance),
        };
        Self {
            source,
            _marker: PhantomData,
        }
    }

    pub fn is_resolved(&self) -> bool {
        match &self.source {
            LazySource::Deferred(v) => v.cell.get().is_some(),
            LazySource::Ready(_) => true,
        }
    }

    pub fn get(&self) -> ResolveResult<Arc<T>> {
        match &self.source {
            LazySource::Deferred(v) => crate::container::downcast(&v.token, v.force()?),
            LazySource::Ready(v) => crate::container::downcast(&Token::of::<T>(), v.clone()),
        }
    }

    pub async fn get_async(&self) -> ResolveResult<Arc<T>> {
        match &self.source {
            LazySource::Deferred(v) => crate::container::downcast(&v.token, v.force_async().await?),
            LazySource::Ready(v) => crate::container::downcast(&Token::of::<T>(), v.clone()),
        }
    }
}

impl<T> Clone for Lazy<T> {
    fn clone(&self) -> Self {
        let source = match &self.source {
            LazySource::Deferred(v) => LazySource::Deferred(v.clone()),
            LazySource::Ready(v) => LazySource::Ready(v.clone()),
        };
        Self {
            source,
            _marker: PhantomData,
        }
    }
}
