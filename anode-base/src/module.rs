use std::any::{TypeId, type_name};
use std::collections::HashSet;
use std::fmt;

use anode::{Container, Provider, ResolveError, ResolveResult, Token};

/// A named group of providers that may depend on other modules.
///
/// # Example
///
/// ```rust
/// use anode::{Container, Provider, Token};
/// use anode_base::{Module, ModuleLoader, ModuleRef};
///
/// struct Storage;
///
/// impl Module for Storage {
///     fn providers() -> Vec<Provider> {
///         vec![Provider::new("dsn").use_value(String::from("sqlite::memory:"))]
///     }
///
///     fn exports() -> Vec<Token> {
///         vec![Token::name("dsn")]
///     }
/// }
///
/// struct App;
///
/// impl Module for App {
///     fn imports() -> Vec<ModuleRef> {
///         vec![ModuleRef::of::<Storage>()]
///     }
///
///     fn providers() -> Vec<Provider> {
///         Vec::new()
///     }
/// }
///
/// let container = Container::new();
/// ModuleLoader::new().load::<App>(&container).unwrap();
/// assert!(container.has_provider("dsn"));
/// ```
pub trait Module: 'static {
    /// Modules loaded before this one.
    fn imports() -> Vec<ModuleRef> {
        Vec::new()
    }

    fn providers() -> Vec<Provider>;

    /// Tokens this module promises to provide once loaded.
    fn exports() -> Vec<Token> {
        Vec::new()
    }
}

/// Type erased handle to a [`Module`] implementation.
#[derive(Clone, Copy)]
pub struct ModuleRef {
    type_id: TypeId,
    name: &'static str,
    imports: fn() -> Vec<ModuleRef>,
    providers: fn() -> Vec<Provider>,
    exports: fn() -> Vec<Token>,
}

impl ModuleRef {
    pub fn of<M>() -> Self
    where
        M: Module,
    {
        Self {
            type_id: TypeId::of::<M>(),
            name: type_name::<M>(),
            imports: M::imports,
            providers: M::providers,
            exports: M::exports,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for ModuleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ModuleRef").field(&self.name).finish()
    }
}

/// Registers module providers into a container.
///
/// Imports are loaded depth first before the importing module. Each module is
/// loaded at most once per loader, so diamond and cyclic imports terminate.
#[derive(Default)]
pub struct ModuleLoader {
    visited: HashSet<TypeId>,
    loaded: Vec<&'static str>,
}

impl ModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load<M>(&mut self, container: &Container) -> ResolveResult<()>
    where
        M: Module,
    {
        self.load_ref(container, ModuleRef::of::<M>())
    }

    pub fn load_ref(&mut self, container: &Container, module: ModuleRef) -> ResolveResult<()> {
        if !self.visited.insert(module.type_id) {
            return Ok(());
        }
        for import in (module.imports)() {
            self.load_ref(container, import)?;
        }
        let providers = (module.providers)();
        let count = providers.len();
        container.add_providers(providers)?;
        for token in (module.exports)() {
            if !container.has_provider(&token) {
                return Err(ResolveError::Configuration {
                    token: token.to_string(),
                    reason: format!("exported by {} without a provider", module.name),
                });
            }
        }
        tracing::debug!(module = module.name, providers = count, "Module loaded");
        self.loaded.push(module.name);
        Ok(())
    }

    pub fn is_loaded<M>(&self) -> bool
    where
        M: Module,
    {
        self.visited.contains(&TypeId::of::<M>())
    }

    /// Names of the loaded modules in load order.
    pub fn loaded(&self) -> &[&'static str] {
        &self.loaded
    }
}
