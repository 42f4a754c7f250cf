//! Wrappers around the production of one instance.
//!
//! An [`Interceptor`] receives the current [`ResolutionContext`] and a handle
//! to the rest of the chain. It continues the chain by calling `run` on the
//! handle, may skip it to short-circuit, and may transform the result or
//! recover from its error afterwards. The first interceptor of a chain is the
//! outermost one.
//!
//! # Examples
//!
//! ```rust
//! use anode::{AsyncNext, Container, Instance, Interceptor, Next, Provider, ResolutionContext, ResolveResult, Scope};
//! use std::sync::Arc;
//!
//! struct Fallback;
//!
//! impl Interceptor for Fallback {
//!     fn intercept(&self, _ctx: &ResolutionContext, next: Next<'_>) -> ResolveResult<Instance> {
//!         next.run().or_else(|_| Ok(Arc::new(String::from("fallback")) as Instance))
//!     }
//!
//!     async fn intercept_async(
//!         &self,
//!         _ctx: &ResolutionContext,
//!         next: AsyncNext<'_>,
//!     ) -> ResolveResult<Instance> {
//!         next.run().await.or_else(|_| Ok(Arc::new(String::from("fallback")) as Instance))
//!     }
//! }
//!
//! let container = Container::new();
//! container
//!     .add_provider(
//!         Provider::new("flaky")
//!             .use_factory([], |_| -> Result<String, anode::StdError> { Err("down".into()) })
//!             .scope(Scope::Transient)
//!             .interceptor(Fallback),
//!     )
//!     .unwrap();
//!
//! assert_eq!(container.resolve::<String>("flaky").unwrap().as_str(), "fallback");
//! ```

use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::{Instance, ResolutionContext, ResolveError, ResolveResult, StdError};

/// Wrapper around the production step of a provider.
///
/// Only [`Interceptor::intercept_async`] is required. Interceptors without a
/// synchronous implementation fail explicitly when reached from
/// [`Container::get`](crate::Container::get).
pub trait Interceptor: Send + Sync + 'static {
    fn intercept(&self, ctx: &ResolutionContext, next: Next<'_>) -> ResolveResult<Instance> {
        let _ = next;
        Err(ResolveError::AsyncInSyncPath {
            token: ctx.token.clone(),
            what: "interceptor",
            path: ctx.path.clone(),
        })
    }

    fn intercept_async(
        &self,
        ctx: &ResolutionContext,
        next: AsyncNext<'_>,
    ) -> impl Future<Output = ResolveResult<Instance>> + Send;
}

impl<T> Interceptor for Arc<T>
where
    T: Interceptor,
{
    fn intercept(&self, ctx: &ResolutionContext, next: Next<'_>) -> ResolveResult<Instance> {
        T::intercept(self, ctx, next)
    }

    async fn intercept_async(
        &self,
        ctx: &ResolutionContext,
        next: AsyncNext<'_>,
    ) -> ResolveResult<Instance> {
        T::intercept_async(self, ctx, next).await
    }
}

#[async_trait]
trait DynInterceptor: Send + Sync {
    fn intercept(&self, ctx: &ResolutionContext, next: Next<'_>) -> ResolveResult<Instance>;

    async fn intercept_async(
        &self,
        ctx: &ResolutionContext,
        next: AsyncNext<'_>,
    ) -> ResolveResult<Instance>;

    fn name(&self) -> &'static str;
}

#[async_trait]
impl<T> DynInterceptor for T
where
    T: Interceptor,
{
    fn intercept(&self, ctx: &ResolutionContext, next: Next<'_>) -> ResolveResult<Instance> {
        T::intercept(self, ctx, next)
    }

    async fn intercept_async(
        &self,
        ctx: &ResolutionContext,
        next: AsyncNext<'_>,
    ) -> ResolveResult<Instance> {
        T::intercept_async(self, ctx, next).await
    }

    fn name(&self) -> &'static str {
        type_name::<T>()
    }
}

/// Type-erased, shareable interceptor.
#[derive(Clone)]
pub struct BoxInterceptor(Arc<dyn DynInterceptor>);

impl BoxInterceptor {
    pub fn new<T>(interceptor: T) -> Self
    where
        T: Interceptor,
    {
        Self(Arc::new(interceptor))
    }

    pub fn name(&self) -> &'static str {
        self.0.name()
    }
}

impl fmt::Debug for BoxInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BoxInterceptor").field(&self.name()).finish()
    }
}

type SyncProduce<'a> = dyn Fn() -> ResolveResult<Instance> + 'a;
type AsyncProduce<'a> = dyn Fn() -> BoxFuture<'a, ResolveResult<Instance>> + Send + Sync + 'a;

/// Remainder of a synchronous interceptor chain.
pub struct Next<'a> {
    ctx: &'a ResolutionContext,
    chain: &'a [BoxInterceptor],
    produce: &'a SyncProduce<'a>,
}

impl<'a> Next<'a> {
    pub(crate) fn new(
        ctx: &'a ResolutionContext,
        chain: &'a [BoxInterceptor],
        produce: &'a SyncProduce<'a>,
    ) -> Self {
        Self {
            ctx,
            chain,
            produce,
        }
    }

    pub fn context(&self) -> &ResolutionContext {
        self.ctx
    }

    /// Runs the rest of the chain; may be called more than once.
    pub fn run(&self) -> ResolveResult<Instance> {
        match self.chain.split_first() {
            Some((first, rest)) => first.0.intercept(self.ctx, Next::new(self.ctx, rest, self.produce)),
            None => (self.produce)(),
        }
    }
}

/// Remainder of an asynchronous interceptor chain.
pub struct AsyncNext<'a> {
    ctx: &'a ResolutionContext,
    chain: &'a [BoxInterceptor],
    produce: &'a AsyncProduce<'a>,
}

impl<'a> AsyncNext<'a> {
    pub(crate) fn new(
        ctx: &'a ResolutionContext,
        chain: &'a [BoxInterceptor],
        produce: &'a AsyncProduce<'a>,
    ) -> Self {
        Self {
            ctx,
            chain,
            produce,
        }
    }

    pub fn context(&self) -> &ResolutionContext {
        self.ctx
    }

    /// Runs the rest of the chain; may be called more than once.
    pub async fn run(&self) -> ResolveResult<Instance> {
        match self.chain.split_first() {
            Some((first, rest)) => {
                first
                    .0
                    .intercept_async(self.ctx, AsyncNext::new(self.ctx, rest, self.produce))
                    .await
            }
            None => (self.produce)().await,
        }
    }
}

type PreHook = dyn Fn(&ResolutionContext) -> Result<(), StdError> + Send + Sync;
type PostHook = dyn Fn(&ResolutionContext, Instance) -> Result<Instance, StdError> + Send + Sync;

pub struct HookInterceptor {
    pre: Box<PreHook>,
    post: Box<PostHook>,
}

impl Interceptor for HookInterceptor {
    fn intercept(&self, ctx: &ResolutionContext, next: Next<'_>) -> ResolveResult<Instance> {
        (self.pre)(ctx).map_err(|e| ctx.error(e))?;
        let instance = next.run()?;
        (self.post)(ctx, instance).map_err(|e| ctx.error(e))
    }

    async fn intercept_async(
        &self,
        ctx: &ResolutionContext,
        next: AsyncNext<'_>,
    ) -> ResolveResult<Instance> {
        (self.pre)(ctx).map_err(|e| ctx.error(e))?;
        let instance = next.run().await?;
        (self.post)(ctx, instance).map_err(|e| ctx.error(e))
    }
}

/// Builds an interceptor from a hook run before the chain and a hook
/// transforming its result.
pub fn from_hooks<Pre, Post>(pre: Pre, post: Post) -> HookInterceptor
where
    Pre: Fn(&ResolutionContext) -> Result<(), StdError> + Send + Sync + 'static,
    Post: Fn(&ResolutionContext, Instance) -> Result<Instance, StdError> + Send + Sync + 'static,
{
    HookInterceptor {
        pre: Box::new(pre),
        post: Box::new(post),
    }
}

/// Several interceptors acting as one; the first is the outermost.
pub struct ComposedInterceptor {
    chain: Vec<BoxInterceptor>,
}

impl Interceptor for ComposedInterceptor {
    fn intercept(&self, ctx: &ResolutionContext, next: Next<'_>) -> ResolveResult<Instance> {
        let produce = || next.run();
        Next::new(ctx, &self.chain, &produce).run()
    }

    async fn intercept_async(
        &self,
        ctx: &ResolutionContext,
        next: AsyncNext<'_>,
    ) -> ResolveResult<Instance> {
        let next = &next;
        let produce = move || Box::pin(next.run()) as BoxFuture<'_, _>;
        AsyncNext::new(ctx, &self.chain, &produce).run().await
    }
}

pub fn compose(interceptors: impl IntoIterator<Item = BoxInterceptor>) -> ComposedInterceptor {
    ComposedInterceptor {
        chain: interceptors.into_iter().collect(),
    }
}

/// Interceptor applied only to resolutions accepted by a predicate.
pub struct ConditionalInterceptor<I> {
    predicate: Box<dyn Fn(&ResolutionContext) -> bool + Send + Sync>,
    inner: I,
}

impl<I> Interceptor for ConditionalInterceptor<I>
where
    I: Interceptor,
{
    fn intercept(&self, ctx: &ResolutionContext, next: Next<'_>) -> ResolveResult<Instance> {
        if (self.predicate)(ctx) {
            self.inner.intercept(ctx, next)
        } else {
            next.run()
        }
    }

    async fn intercept_async(
        &self,
        ctx: &ResolutionContext,
        next: AsyncNext<'_>,
    ) -> ResolveResult<Instance> {
        if (self.predicate)(ctx) {
            self.inner.intercept_async(ctx, next).await
        } else {
            next.run().await
        }
    }
}

pub fn when<F, I>(predicate: F, interceptor: I) -> ConditionalInterceptor<I>
where
    F: Fn(&ResolutionContext) -> bool + Send + Sync + 'static,
    I: Interceptor,
{
    ConditionalInterceptor {
        predicate: Box::new(predicate),
        inner: interceptor,
    }
}

/// Runs `produce` wrapped by `chain`.
pub(crate) fn run_chain(
    ctx: &ResolutionContext,
    chain: &[BoxInterceptor],
    produce: &SyncProduce<'_>,
) -> ResolveResult<Instance> {
    Next::new(ctx, chain, produce).run()
}

pub(crate) async fn run_chain_async<'a>(
    ctx: &'a ResolutionContext,
    chain: &'a [BoxInterceptor],
    produce: &'a AsyncProduce<'a>,
) -> ResolveResult<Instance> {
    AsyncNext::new(ctx, chain, produce).run().await
}
