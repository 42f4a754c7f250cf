use std::time::Duration;

use crate::{
    AsyncNext, CacheOptions, Instance, Interceptor, Next, ResolutionContext, ResolveError,
    ResolveResult, TieredCache, Token,
};

/// Emits `tracing` events around every production.
#[derive(Clone, Debug, Default)]
pub struct LoggingInterceptor;

impl LoggingInterceptor {
    pub fn new() -> Self {
        Self
    }

    fn finish(
        ctx: &ResolutionContext,
        started: tokio::time::Instant,
        result: ResolveResult<Instance>,
    ) -> ResolveResult<Instance> {
        let elapsed = started.elapsed();
        match &result {
            Ok(_) => tracing::debug!(
                token = %ctx.token,
                depth = ctx.depth,
                elapsed = ?elapsed,
                "Resolved"
            ),
            Err(err) => tracing::warn!(
                token = %ctx.token,
                depth = ctx.depth,
                elapsed = ?elapsed,
                "Resolution failed: {err}"
            ),
        }
        result
    }
}

impl Interceptor for LoggingInterceptor {
    fn intercept(&self, ctx: &ResolutionContext, next: Next<'_>) -> ResolveResult<Instance> {
        tracing::debug!(token = %ctx.token, path = %ctx.path, "Resolving");
        let started = tokio::time::Instant::now();
        Self::finish(ctx, started, next.run())
    }

    async fn intercept_async(
        &self,
        ctx: &ResolutionContext,
        next: AsyncNext<'_>,
    ) -> ResolveResult<Instance> {
        tracing::debug!(token = %ctx.token, path = %ctx.path, "Resolving");
        let started = tokio::time::Instant::now();
        Self::finish(ctx, started, next.run().await)
    }
}

type CacheKey = (Token, Option<String>);

/// Memoizes produced values for a limited time.
///
/// Values are keyed by token and request identifier. A cache hit skips the
/// rest of the chain.
pub struct CachingInterceptor {
    cache: TieredCache<CacheKey, Instance>,
}

impl CachingInterceptor {
    pub fn new(ttl: Duration) -> Self {
        Self::with_options(CacheOptions {
            ttl: Some(ttl),
            ..Default::default()
        })
    }

    pub fn with_options(options: CacheOptions) -> Self {
        Self {
            cache: TieredCache::new(options),
        }
    }

    pub fn cache(&self) -> &TieredCache<CacheKey, Instance> {
        &self.cache
    }

    fn key(ctx: &ResolutionContext) -> CacheKey {
        (ctx.token.clone(), ctx.request_id.clone())
    }
}

impl Interceptor for CachingInterceptor {
    fn intercept(&self, ctx: &ResolutionContext, next: Next<'_>) -> ResolveResult<Instance> {
        let key = Self::key(ctx);
        if let Some(instance) = self.cache.get(&key) {
            tracing::trace!(token = %ctx.token, "Cached value reused");
            return Ok(instance);
        }
        let instance = next.run()?;
        self.cache.set(key, instance.clone());
        Ok(instance)
    }

    async fn intercept_async(
        &self,
        ctx: &ResolutionContext,
        next: AsyncNext<'_>,
    ) -> ResolveResult<Instance> {
        let key = Self::key(ctx);
        if let Some(instance) = self.cache.get(&key) {
            tracing::trace!(token = %ctx.token, "Cached value reused");
            return Ok(instance);
        }
        let instance = next.run().await?;
        self.cache.set(key, instance.clone());
        Ok(instance)
    }
}

type Check = dyn Fn(&ResolutionContext, &Instance) -> Result<(), String> + Send + Sync;

/// Rejects produced values failing a check with [`ResolveError::Validation`].
pub struct ValidationInterceptor {
    check: Box<Check>,
}

impl ValidationInterceptor {
    pub fn new<F>(check: F) -> Self
    where
        F: Fn(&ResolutionContext, &Instance) -> Result<(), String> + Send + Sync + 'static,
    {
        Self {
            check: Box::new(check),
        }
    }

    /// Checks values of type `T`; values of another type are rejected.
    pub fn typed<T, F>(check: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&T) -> Result<(), String> + Send + Sync + 'static,
    {
        Self::new(move |_, instance| match instance.downcast_ref::<T>() {
            Some(v) => check(v),
            None => Err(format!("expected {}", std::any::type_name::<T>())),
        })
    }

    fn validate(&self, ctx: &ResolutionContext, instance: Instance) -> ResolveResult<Instance> {
        match (self.check)(ctx, &instance) {
            Ok(()) => Ok(instance),
            Err(reason) => Err(ResolveError::Validation {
                token: ctx.token.clone(),
                reason,
                path: ctx.path.clone(),
            }),
        }
    }
}

impl Interceptor for ValidationInterceptor {
    fn intercept(&self, ctx: &ResolutionContext, next: Next<'_>) -> ResolveResult<Instance> {
        self.validate(ctx, next.run()?)
    }

    async fn intercept_async(
        &self,
        ctx: &ResolutionContext,
        next: AsyncNext<'_>,
    ) -> ResolveResult<Instance> {
        self.validate(ctx, next.run().await?)
    }
}

/// Re-runs the chain when production fails.
///
/// Only [`ResolveError::Production`] failures are retried; configuration,
/// cycle and missing provider errors are returned at once. The synchronous
/// path blocks the thread between attempts.
#[derive(Clone, Debug)]
pub struct RetryInterceptor {
    attempts: usize,
    delay: Duration,
}

impl RetryInterceptor {
    /// `attempts` counts the first try, zero is treated as one.
    pub fn new(attempts: usize, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    fn should_retry(&self, attempt: usize, err: &ResolveError) -> bool {
        attempt < self.attempts && matches!(err, ResolveError::Production { .. })
    }
}

impl Interceptor for RetryInterceptor {
    fn intercept(&self, ctx: &ResolutionContext, next: Next<'_>) -> ResolveResult<Instance> {
        let mut attempt = 1;
        loop {
            match next.run() {
                Err(err) if self.should_retry(attempt, &err) => {
                    tracing::debug!(token = %ctx.token, attempt, "Retrying after failure: {err}");
                    attempt += 1;
                    if !self.delay.is_zero() {
                        std::thread::sleep(self.delay);
                    }
                }
                result => return result,
            }
        }
    }

    async fn intercept_async(
        &self,
        ctx: &ResolutionContext,
        next: AsyncNext<'_>,
    ) -> ResolveResult<Instance> {
        let mut attempt = 1;
        loop {
            match next.run().await {
                Err(err) if self.should_retry(attempt, &err) => {
                    tracing::debug!(token = %ctx.token, attempt, "Retrying after failure: {err}");
                    attempt += 1;
                    tokio::time::sleep(self.delay).await;
                }
                result => return result,
            }
        }
    }
}
