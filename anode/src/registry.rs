use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{Registration, Scope, Token};

#[derive(Default)]
struct RegistryState {
    providers: HashMap<Token, Vec<Arc<Registration>>>,
    by_tag: HashMap<String, Vec<Arc<Registration>>>,
    by_scope: HashMap<Scope, Vec<Arc<Registration>>>,
    // Registration order across all tokens.
    order: Vec<Arc<Registration>>,
}

/// Index of registered providers.
///
/// Providers of one token keep their registration order. The registry does
/// not validate anything, see [`Container::add_provider`](crate::Container::add_provider).
#[derive(Default)]
pub struct ProviderRegistry {
    state: RwLock<RegistryState>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, registration: Registration) -> Arc<Registration> {
        let registration = Arc::new(registration);
        let mut state = self.write();
        state
            .providers
            .entry(registration.token.clone())
            .or_default()
            .push(registration.clone());
        for tag in &registration.tags {
            state
                .by_tag
                .entry(tag.clone())
                .or_default()
                .push(registration.clone());
        }
        state
            .by_scope
            .entry(registration.scope)
            .or_default()
            .push(registration.clone());
        state.order.push(registration.clone());
        registration
    }

    pub fn providers_for(&self, token: &Token) -> Vec<Arc<Registration>> {
        self.read()
            .providers
            .get(token)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has(&self, token: &Token) -> bool {
        self.read()
            .providers
            .get(token)
            .is_some_and(|v| !v.is_empty())
    }

    pub fn providers_by_tag(&self, tag: &str) -> Vec<Arc<Registration>> {
        self.read().by_tag.get(tag).cloned().unwrap_or_default()
    }

    pub fn providers_by_scope(&self, scope: Scope) -> Vec<Arc<Registration>> {
        self.read().by_scope.get(&scope).cloned().unwrap_or_default()
    }

    /// Every provider in registration order.
    pub fn all_providers(&self) -> Vec<Arc<Registration>> {
        self.read().order.clone()
    }

    pub fn tokens(&self) -> Vec<Token> {
        let state = self.read();
        let mut tokens: Vec<Token> = Vec::with_capacity(state.providers.len());
        for registration in &state.order {
            if !tokens.contains(&registration.token) {
                tokens.push(registration.token.clone());
            }
        }
        tokens
    }

    pub fn len(&self) -> usize {
        self.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        *self.write() = RegistryState::default();
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Provider;

    fn registration(provider: Provider) -> Registration {
        provider.into_registration().unwrap()
    }

    #[test]
    fn test_registration_order() {
        let registry = ProviderRegistry::new();
        registry.register(registration(Provider::new("a").use_value(1u32).tag("x")));
        registry.register(registration(Provider::new("b").use_value(2u32)));
        registry.register(registration(
            Provider::new("a")
                .use_factory([], |_| Ok(3u32))
                .scope(Scope::Transient)
                .tag("x"),
        ));

        let providers = registry.providers_for(&"a".into());
        assert_eq!(providers.len(), 2);
        assert!(matches!(providers[0].strategy(), crate::Strategy::Value(_)));
        assert_eq!(providers[1].scope(), Scope::Transient);
        assert_eq!(registry.providers_by_tag("x").len(), 2);
        assert_eq!(registry.providers_by_scope(Scope::Singleton).len(), 2);
        assert_eq!(registry.tokens(), vec![Token::from("a"), Token::from("b")]);
        assert_eq!(registry.len(), 3);
        assert!(registry.has(&"b".into()));
        assert!(!registry.has(&"c".into()));

        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.providers_by_tag("x").is_empty());
    }
}
