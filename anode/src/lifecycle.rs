use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::{Instance, StdError};

type SyncHookFn = dyn Fn(&Instance) -> Result<(), StdError> + Send + Sync;
type AsyncHookFn = dyn Fn(Instance) -> BoxFuture<'static, Result<(), StdError>> + Send + Sync;

/// Callback invoked on a produced instance.
#[derive(Clone)]
pub enum Hook {
    Sync(Arc<SyncHookFn>),
    Async(Arc<AsyncHookFn>),
}

impl Hook {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&Instance) -> Result<(), StdError> + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(f))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Instance) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StdError>> + Send + 'static,
    {
        Self::Async(Arc::new(move |instance: Instance| {
            Box::pin(f(instance)) as BoxFuture<'static, _>
        }))
    }

    /// Hook receiving the instance downcast to `T`.
    ///
    /// Instances of another type are ignored.
    pub fn typed<T, F>(f: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&T) -> Result<(), StdError> + Send + Sync + 'static,
    {
        Self::sync(move |instance| match instance.downcast_ref::<T>() {
            Some(v) => f(v),
            None => Ok(()),
        })
    }

    pub fn typed_async<T, F, Fut>(f: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StdError>> + Send + 'static,
    {
        let f = Arc::new(f);
        Self::Async(Arc::new(move |instance: Instance| {
            let f = f.clone();
            Box::pin(async move {
                match instance.downcast::<T>() {
                    Ok(v) => f(v).await,
                    Err(_) => Ok(()),
                }
            }) as BoxFuture<'static, _>
        }))
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Self::Async(_))
    }

    /// Runs the hook without suspending.
    ///
    /// Returns `None` when the hook is asynchronous and cannot run here.
    pub fn call(&self, instance: &Instance) -> Option<Result<(), StdError>> {
        match self {
            Self::Sync(f) => Some(f(instance)),
            Self::Async(_) => None,
        }
    }

    pub async fn call_async(&self, instance: &Instance) -> Result<(), StdError> {
        match self {
            Self::Sync(f) => f(instance),
            Self::Async(f) => f(instance.clone()).await,
        }
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Hook::Sync"),
            Self::Async(_) => f.write_str("Hook::Async"),
        }
    }
}

/// Lifecycle hooks attached to the instances of one provider.
///
/// `on_init` runs right after production, `on_destroy` and `dispose` run when
/// the instance leaves the cache or scope holding it.
#[derive(Clone, Debug, Default)]
pub struct Lifecycle {
    pub on_init: Option<Hook>,
    pub on_destroy: Option<Hook>,
    pub dispose: Option<Hook>,
}

impl Lifecycle {
    pub fn is_empty(&self) -> bool {
        self.on_init.is_none() && self.on_destroy.is_none() && self.dispose.is_none()
    }

    /// Hooks of `other` take precedence over hooks of `self`.
    pub(crate) fn merged_with(self, other: Lifecycle) -> Lifecycle {
        Lifecycle {
            on_init: other.on_init.or(self.on_init),
            on_destroy: other.on_destroy.or(self.on_destroy),
            dispose: other.dispose.or(self.dispose),
        }
    }

    pub(crate) fn has_teardown(&self) -> bool {
        self.on_destroy.is_some() || self.dispose.is_some()
    }

    pub(crate) fn has_async_teardown(&self) -> bool {
        self.on_destroy.as_ref().is_some_and(Hook::is_async)
            || self.dispose.as_ref().is_some_and(Hook::is_async)
    }

    /// Runs `on_destroy` then `dispose`, stopping at the first failure.
    pub(crate) fn teardown(&self, instance: &Instance) -> Result<(), StdError> {
        for hook in [&self.on_destroy, &self.dispose].into_iter().flatten() {
            match hook.call(instance) {
                Some(result) => result?,
                None => return Err("asynchronous teardown hook requires async disposal".into()),
            }
        }
        Ok(())
    }

    pub(crate) async fn teardown_async(&self, instance: &Instance) -> Result<(), StdError> {
        for hook in [&self.on_destroy, &self.dispose].into_iter().flatten() {
            hook.call_async(instance).await?;
        }
        Ok(())
    }
}
