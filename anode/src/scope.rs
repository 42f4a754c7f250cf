//! Instance buckets for the `request` and `scoped` lifetimes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;

use crate::{Instance, Lifecycle, ResolutionPath, ResolveError, ResolveResult, Token};

#[derive(Clone)]
struct Stored {
    instance: Instance,
    lifecycle: Lifecycle,
}

#[derive(Default)]
struct Bucket {
    instances: HashMap<Token, Stored>,
    // Insertion order, teardown walks it backwards.
    order: Vec<Token>,
}

impl Bucket {
    fn insert(&mut self, token: Token, instance: Instance, lifecycle: Lifecycle) {
        if self
            .instances
            .insert(token.clone(), Stored { instance, lifecycle })
            .is_none()
        {
            self.order.push(token);
        }
    }

    fn drain_reversed(&mut self) -> Vec<(Token, Stored)> {
        let mut instances = std::mem::take(&mut self.instances);
        std::mem::take(&mut self.order)
            .into_iter()
            .rev()
            .filter_map(|token| instances.remove(&token).map(|v| (token, v)))
            .collect()
    }
}

fn teardown_error(token: Token, source: crate::StdError) -> ResolveError {
    ResolveError::Production {
        path: ResolutionPath(vec![token.clone()]),
        token,
        source,
    }
}

/// Bucket of instances produced for one logical request.
///
/// Lookups fall back to the parent context; instances stored in a child are
/// never visible from its parent.
pub struct ScopedContext {
    id: String,
    parent: Option<Arc<ScopedContext>>,
    bucket: Mutex<Bucket>,
}

impl ScopedContext {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent: None,
            bucket: Mutex::default(),
        }
    }

    pub fn with_parent(id: impl Into<String>, parent: Arc<ScopedContext>) -> Self {
        Self {
            id: id.into(),
            parent: Some(parent),
            bucket: Mutex::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent(&self) -> Option<&Arc<ScopedContext>> {
        self.parent.as_ref()
    }

    pub fn get(&self, token: &Token) -> Option<Instance> {
        if let Some(stored) = self.lock().instances.get(token) {
            return Some(stored.instance.clone());
        }
        self.parent.as_ref().and_then(|v| v.get(token))
    }

    pub fn has(&self, token: &Token) -> bool {
        self.get(token).is_some()
    }

    /// Checks this context only, ignoring the parent.
    pub fn has_own(&self, token: &Token) -> bool {
        self.lock().instances.contains_key(token)
    }

    pub fn set(&self, token: Token, instance: Instance) {
        self.set_with(token, instance, Lifecycle::default());
    }

    /// Stores `instance` with the hooks run when the context is disposed.
    pub fn set_with(&self, token: Token, instance: Instance, lifecycle: Lifecycle) {
        self.lock().insert(token, instance, lifecycle);
    }

    pub fn len(&self) -> usize {
        self.lock().instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tears down owned instances in reverse insertion order.
    ///
    /// Every instance is torn down even if an earlier one fails; the first
    /// failure is returned. Asynchronous hooks fail here, use
    /// [`ScopedContext::dispose_async`] for them.
    pub fn dispose(&self) -> ResolveResult<()> {
        let drained = self.lock().drain_reversed();
        let mut result = Ok(());
        for (token, stored) in drained {
            if let Err(err) = stored.lifecycle.teardown(&stored.instance) {
                tracing::error!(context = %self.id, token = %token, "Cannot tear down instance: {err}");
                if result.is_ok() {
                    result = Err(teardown_error(token, err));
                }
            }
        }
        result
    }

    pub async fn dispose_async(&self) -> ResolveResult<()> {
        let drained = self.lock().drain_reversed();
        let mut result = Ok(());
        for (token, stored) in drained {
            if let Err(err) = stored.lifecycle.teardown_async(&stored.instance).await {
                tracing::error!(context = %self.id, token = %token, "Cannot tear down instance: {err}");
                if result.is_ok() {
                    result = Err(teardown_error(token, err));
                }
            }
        }
        result
    }

    fn lock(&self) -> MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Registry of named scopes backing the `scoped` lifetime.
///
/// # Examples
///
/// ```rust
/// use anode::{Container, Provider, ResolveOptions, Scope};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let container = Container::new();
/// container.add_provider(
///     Provider::new("session")
///         .use_factory([], |_| Ok(String::from("session")))
///         .scope(Scope::Scoped),
/// )?;
///
/// container.scopes().create_scope("job-1");
/// let options = ResolveOptions::new().scope("job-1");
/// let first = container.get("session", &options)?.unwrap();
/// let second = container.get("session", &options)?.unwrap();
/// assert!(std::sync::Arc::ptr_eq(&first, &second));
///
/// container.scopes().clear_scope("job-1").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct ScopeManager {
    scopes: DashMap<String, Bucket>,
}

impl ScopeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty scope, keeping an existing one untouched.
    pub fn create_scope(&self, name: impl Into<String>) {
        self.scopes.entry(name.into()).or_default();
    }

    pub fn has_scope(&self, name: &str) -> bool {
        self.scopes.contains_key(name)
    }

    pub fn scope_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.scopes.iter().map(|v| v.key().clone()).collect();
        names.sort();
        names
    }

    pub fn set_in_scope(&self, name: &str, token: Token, instance: Instance) -> ResolveResult<()> {
        self.set_in_scope_with(name, token, instance, Lifecycle::default())
    }

    pub fn set_in_scope_with(
        &self,
        name: &str,
        token: Token,
        instance: Instance,
        lifecycle: Lifecycle,
    ) -> ResolveResult<()> {
        let Some(mut bucket) = self.scopes.get_mut(name) else {
            return Err(ResolveError::scope(
                &token,
                format!("scope {name:?} does not exist"),
                ResolutionPath::default(),
            ));
        };
        bucket.insert(token, instance, lifecycle);
        Ok(())
    }

    pub fn get_from_scope(&self, name: &str, token: &Token) -> Option<Instance> {
        self.scopes
            .get(name)
            .and_then(|v| v.instances.get(token).map(|v| v.instance.clone()))
    }

    /// Tears down every instance of the scope, then leaves it empty.
    ///
    /// The scope itself stays registered.
    pub async fn clear_scope(&self, name: &str) -> ResolveResult<()> {
        let drained = match self.scopes.get_mut(name) {
            Some(mut bucket) => bucket.drain_reversed(),
            None => {
                return Err(ResolveError::scope(
                    name,
                    "scope does not exist",
                    ResolutionPath::default(),
                ));
            }
        };
        let mut result = Ok(());
        for (token, stored) in drained {
            if let Err(err) = stored.lifecycle.teardown_async(&stored.instance).await {
                tracing::error!(scope = %name, token = %token, "Cannot tear down instance: {err}");
                if result.is_ok() {
                    result = Err(teardown_error(token, err));
                }
            }
        }
        result
    }

    /// Forgets the scope without running any teardown.
    pub fn delete_scope(&self, name: &str) -> bool {
        self.scopes.remove(name).is_some()
    }

    /// Clears and removes every scope.
    pub async fn clear_all(&self) -> ResolveResult<()> {
        let mut result = Ok(());
        for name in self.scope_names() {
            let cleared = self.clear_scope(&name).await;
            self.delete_scope(&name);
            if result.is_ok() {
                result = cleared;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::Hook;

    fn recording(log: &Arc<Mutex<Vec<String>>>, name: &str) -> Lifecycle {
        let destroy_log = log.clone();
        let destroy_name = name.to_string();
        let dispose_log = log.clone();
        let dispose_name = name.to_string();
        Lifecycle {
            on_init: None,
            on_destroy: Some(Hook::sync(move |_| {
                destroy_log
                    .lock()
                    .unwrap()
                    .push(format!("destroy {destroy_name}"));
                Ok(())
            })),
            dispose: Some(Hook::sync(move |_| {
                dispose_log
                    .lock()
                    .unwrap()
                    .push(format!("dispose {dispose_name}"));
                Ok(())
            })),
        }
    }

    #[test]
    fn test_parent_fallback() {
        let parent = Arc::new(ScopedContext::new("parent"));
        parent.set("a".into(), Arc::new(1u32));
        let child = ScopedContext::with_parent("child", parent.clone());
        child.set("b".into(), Arc::new(2u32));

        assert!(child.has(&"a".into()));
        assert!(!child.has_own(&"a".into()));
        assert!(child.has(&"b".into()));
        assert!(!parent.has(&"b".into()));
    }

    #[test]
    fn test_dispose_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let context = ScopedContext::new("request");
        context.set_with("a".into(), Arc::new(1u32), recording(&log, "a"));
        context.set_with("b".into(), Arc::new(2u32), recording(&log, "b"));

        context.dispose().unwrap();
        assert!(context.is_empty());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["destroy b", "dispose b", "destroy a", "dispose a"],
        );
    }

    #[tokio::test]
    async fn test_scope_manager() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = ScopeManager::new();
        let err = manager
            .set_in_scope("missing", "a".into(), Arc::new(1u32))
            .unwrap_err();
        assert!(matches!(err, ResolveError::Scope { .. }));

        manager.create_scope("job");
        manager
            .set_in_scope_with("job", "a".into(), Arc::new(1u32), recording(&log, "a"))
            .unwrap();
        assert!(manager.get_from_scope("job", &"a".into()).is_some());

        manager.clear_scope("job").await.unwrap();
        assert!(manager.has_scope("job"));
        assert!(manager.get_from_scope("job", &"a".into()).is_none());
        assert_eq!(log.lock().unwrap().len(), 2);

        manager
            .set_in_scope_with("job", "b".into(), Arc::new(2u32), recording(&log, "b"))
            .unwrap();
        assert!(manager.delete_scope("job"));
        assert!(!manager.has_scope("job"));
        assert_eq!(log.lock().unwrap().len(), 2);
    }
}
