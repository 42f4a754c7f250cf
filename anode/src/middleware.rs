use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::{Instance, ResolutionContext, ResolveError, ResolveResult, StdError};

type SyncBefore = dyn Fn(&ResolutionContext) -> Result<(), StdError> + Send + Sync;
type AsyncBefore =
    dyn Fn(ResolutionContext) -> BoxFuture<'static, Result<(), StdError>> + Send + Sync;
type SyncAfter = dyn Fn(&ResolutionContext, Instance) -> Result<Instance, StdError> + Send + Sync;
type AsyncAfter = dyn Fn(ResolutionContext, Instance) -> BoxFuture<'static, Result<Instance, StdError>>
    + Send
    + Sync;

#[derive(Clone)]
enum Before {
    Sync(Arc<SyncBefore>),
    Async(Arc<AsyncBefore>),
}

#[derive(Clone)]
enum After {
    Sync(Arc<SyncAfter>),
    Async(Arc<AsyncAfter>),
}

/// Container-wide wrapper around every production.
///
/// Before hooks run in ascending priority order, after hooks in the reverse
/// order, so the middleware with the lowest priority is the outermost one.
/// Cache hits and alias providers bypass middleware entirely.
///
/// # Examples
///
/// ```rust
/// use anode::{Container, Middleware, Provider, Scope};
///
/// let container = Container::new();
/// container.use_middleware(
///     Middleware::new("audit")
///         .priority(10)
///         .before(|ctx| {
///             println!("producing {}", ctx.token);
///             Ok(())
///         }),
/// );
/// container
///     .add_provider(Provider::new("answer").use_factory([], |_| Ok(42u32)).scope(Scope::Transient))
///     .unwrap();
/// assert_eq!(*container.resolve::<u32>("answer").unwrap(), 42);
/// ```
#[derive(Clone)]
#[must_use]
pub struct Middleware {
    name: String,
    priority: i32,
    before: Option<Before>,
    after: Option<After>,
}

impl Middleware {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: 0,
            before: None,
            after: None,
        }
    }

    /// Lower values run their before hook first and their after hook last.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn before<F>(mut self, f: F) -> Self
    where
        F: Fn(&ResolutionContext) -> Result<(), StdError> + Send + Sync + 'static,
    {
        self.before = Some(Before::Sync(Arc::new(f)));
        self
    }

    /// Asynchronous before hook; resolutions through [`Container::get`](crate::Container::get)
    /// fail when they reach it.
    pub fn before_async<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ResolutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StdError>> + Send + 'static,
    {
        self.before = Some(Before::Async(Arc::new(move |ctx: ResolutionContext| {
            Box::pin(f(ctx)) as BoxFuture<'static, _>
        })));
        self
    }

    /// After hook receiving the produced value and returning its replacement.
    pub fn after<F>(mut self, f: F) -> Self
    where
        F: Fn(&ResolutionContext, Instance) -> Result<Instance, StdError> + Send + Sync + 'static,
    {
        self.after = Some(After::Sync(Arc::new(f)));
        self
    }

    pub fn after_async<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ResolutionContext, Instance) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Instance, StdError>> + Send + 'static,
    {
        self.after = Some(After::Async(Arc::new(
            move |ctx: ResolutionContext, instance: Instance| {
                Box::pin(f(ctx, instance)) as BoxFuture<'static, _>
            },
        )));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_priority(&self) -> i32 {
        self.priority
    }

    fn async_in_sync(&self, ctx: &ResolutionContext) -> ResolveError {
        tracing::error!(middleware = %self.name, token = %ctx.token, "Asynchronous middleware hook reached from synchronous resolution");
        ResolveError::AsyncInSyncPath {
            token: ctx.token.clone(),
            what: "middleware hook",
            path: ctx.path.clone(),
        }
    }
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Middleware")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Middleware of one container sorted by priority.
#[derive(Clone, Debug, Default)]
pub(crate) struct MiddlewareStack {
    items: Vec<Middleware>,
}

impl MiddlewareStack {
    /// Inserts keeping the order stable among equal priorities.
    pub(crate) fn push(&mut self, middleware: Middleware) {
        let pos = self
            .items
            .partition_point(|v| v.priority <= middleware.priority);
        self.items.insert(pos, middleware);
    }

    pub(crate) fn run_before(&self, ctx: &ResolutionContext) -> ResolveResult<()> {
        for middleware in &self.items {
            match &middleware.before {
                Some(Before::Sync(f)) => f(ctx).map_err(|e| ctx.error(e))?,
                Some(Before::Async(_)) => return Err(middleware.async_in_sync(ctx)),
                None => {}
            }
        }
        Ok(())
    }

    pub(crate) fn run_after(
        &self,
        ctx: &ResolutionContext,
        mut instance: Instance,
    ) -> ResolveResult<Instance> {
        for middleware in self.items.iter().rev() {
            instance = match &middleware.after {
                Some(After::Sync(f)) => f(ctx, instance).map_err(|e| ctx.error(e))?,
                Some(After::Async(_)) => return Err(middleware.async_in_sync(ctx)),
                None => instance,
            };
        }
        Ok(instance)
    }

    pub(crate) async fn run_before_async(&self, ctx: &ResolutionContext) -> ResolveResult<()> {
        for middleware in &self.items {
            match &middleware.before {
                Some(Before::Sync(f)) => f(ctx).map_err(|e| ctx.error(e))?,
                Some(Before::Async(f)) => f(ctx.clone()).await.map_err(|e| ctx.error(e))?,
                None => {}
            }
        }
        Ok(())
    }

    pub(crate) async fn run_after_async(
        &self,
        ctx: &ResolutionContext,
        mut instance: Instance,
    ) -> ResolveResult<Instance> {
        for middleware in self.items.iter().rev() {
            instance = match &middleware.after {
                Some(After::Sync(f)) => f(ctx, instance).map_err(|e| ctx.error(e))?,
                Some(After::Async(f)) => f(ctx.clone(), instance)
                    .await
                    .map_err(|e| ctx.error(e))?,
                None => instance,
            };
        }
        Ok(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_priority_order() {
        let mut stack = MiddlewareStack::default();
        stack.push(Middleware::new("c").priority(50));
        stack.push(Middleware::new("a").priority(10));
        stack.push(Middleware::new("d").priority(50));
        stack.push(Middleware::new("b").priority(10));

        let names: Vec<_> = stack.items.iter().map(Middleware::name).collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
    }
}
