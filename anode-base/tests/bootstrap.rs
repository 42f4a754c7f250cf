use std::sync::Arc;
use std::time::Duration;

use anode::{
    Container, ContainerOptions, Dependency, Hook, Injectable, Injector, Provider, ResolveError,
    StdError, Token,
};
use anode_base::{
    BootstrapOptions, CancellationToken, Config, Module, ModuleLoader, ModuleRef, bootstrap,
    bootstrap_app,
};
use tokio::sync::Notify;

struct Database {
    url: String,
}

struct Repository {
    database: Arc<Database>,
}

impl Injectable for Repository {
    fn dependencies() -> Vec<Dependency> {
        vec![Dependency::of::<Database>()]
    }

    fn construct(injector: &Injector) -> Result<Self, StdError> {
        Ok(Self {
            database: injector.arg::<Database>(0)?,
        })
    }
}

struct App {
    repository: Arc<Repository>,
}

impl Injectable for App {
    fn dependencies() -> Vec<Dependency> {
        vec![Dependency::of::<Repository>()]
    }

    fn construct(injector: &Injector) -> Result<Self, StdError> {
        Ok(Self {
            repository: injector.arg::<Repository>(0)?,
        })
    }
}

struct StorageModule;

impl Module for StorageModule {
    fn providers() -> Vec<Provider> {
        vec![Provider::value(Database {
            url: "sqlite::memory:".into(),
        })]
    }

    fn exports() -> Vec<Token> {
        vec![Token::of::<Database>()]
    }
}

struct RepositoryModule;

impl Module for RepositoryModule {
    fn imports() -> Vec<ModuleRef> {
        vec![ModuleRef::of::<StorageModule>()]
    }

    fn providers() -> Vec<Provider> {
        vec![Provider::class::<Repository>()]
    }
}

struct AppModule;

impl Module for AppModule {
    fn imports() -> Vec<ModuleRef> {
        vec![
            ModuleRef::of::<StorageModule>(),
            ModuleRef::of::<RepositoryModule>(),
        ]
    }

    fn providers() -> Vec<Provider> {
        Vec::new()
    }
}

struct PingModule;

impl Module for PingModule {
    fn imports() -> Vec<ModuleRef> {
        vec![ModuleRef::of::<PongModule>()]
    }

    fn providers() -> Vec<Provider> {
        vec![Provider::new("ping").use_value(1u8)]
    }
}

struct PongModule;

impl Module for PongModule {
    fn imports() -> Vec<ModuleRef> {
        vec![ModuleRef::of::<PingModule>()]
    }

    fn providers() -> Vec<Provider> {
        vec![Provider::new("pong").use_value(2u8)]
    }
}

struct BrokenExportModule;

impl Module for BrokenExportModule {
    fn providers() -> Vec<Provider> {
        Vec::new()
    }

    fn exports() -> Vec<Token> {
        vec![Token::name("ghost")]
    }
}

struct CyclicModule;

impl Module for CyclicModule {
    fn providers() -> Vec<Provider> {
        vec![
            Provider::new("a").use_factory([Dependency::new("b")], |_| Ok(1u8)),
            Provider::new("b").use_factory([Dependency::new("a")], |_| Ok(2u8)),
        ]
    }
}

struct MissingModule;

impl Module for MissingModule {
    fn providers() -> Vec<Provider> {
        vec![Provider::new("service").use_factory([Dependency::new("ghost")], |_| Ok(1u8))]
    }
}

#[test]
fn test_module_loader_order() {
    let container = Container::new();
    let mut loader = ModuleLoader::new();
    loader.load::<AppModule>(&container).unwrap();

    let names: Vec<_> = loader
        .loaded()
        .iter()
        .map(|v| v.rsplit("::").next().unwrap_or_default())
        .collect();
    assert_eq!(names, vec!["StorageModule", "RepositoryModule", "AppModule"]);
    assert!(loader.is_loaded::<StorageModule>());
    assert_eq!(container.registry().providers_for(&Token::of::<Database>()).len(), 1);

    let repository = container
        .resolve::<Repository>(Token::of::<Repository>())
        .unwrap();
    assert_eq!(repository.database.url, "sqlite::memory:");
}

#[test]
fn test_module_loader_loads_once() {
    let container = Container::new();
    let mut loader = ModuleLoader::new();
    loader.load::<AppModule>(&container).unwrap();
    loader.load::<StorageModule>(&container).unwrap();
    assert_eq!(loader.loaded().len(), 3);

    loader.load::<PingModule>(&container).unwrap();
    assert_eq!(loader.loaded().len(), 5);
    assert!(container.has("ping"));
    assert!(container.has("pong"));
}

#[test]
fn test_module_loader_missing_export() {
    let container = Container::new();
    let err = ModuleLoader::new()
        .load::<BrokenExportModule>(&container)
        .unwrap_err();
    assert!(matches!(err, ResolveError::Configuration { token, .. } if token == "ghost"));
}

#[tokio::test]
async fn test_bootstrap_app() {
    let options = BootstrapOptions::new().validate(true);
    let (container, app) = bootstrap_app::<AppModule, App>(options).await.unwrap();

    let app = app.unwrap();
    assert_eq!(app.repository.database.url, "sqlite::memory:");

    let again = container.resolve::<App>(Token::of::<App>()).unwrap();
    assert!(Arc::ptr_eq(&app, &again));
}

#[tokio::test]
async fn test_bootstrap_app_non_strict() {
    let options = BootstrapOptions::new().strict(false);
    let (_, app) = bootstrap_app::<StorageModule, App>(options)
        .await
        .unwrap();
    assert!(app.is_none());

    let err = bootstrap_app::<StorageModule, App>(BootstrapOptions::new())
        .await
        .err().unwrap();
    assert!(err.is_missing_provider());
}

#[tokio::test]
async fn test_bootstrap_validation_cycle() {
    let err = bootstrap::<CyclicModule>(BootstrapOptions::new().validate(true))
        .await
        .err()
        .unwrap();
    match err {
        ResolveError::Validation { path, reason, .. } => {
            assert_eq!(path.tokens().len(), 2);
            assert!(reason.starts_with("dependency cycle"));
        }
        err => panic!("unexpected error: {err}"),
    }

    assert!(
        bootstrap::<CyclicModule>(BootstrapOptions::new())
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn test_bootstrap_validation_missing() {
    let err = bootstrap::<MissingModule>(BootstrapOptions::new().validate(true))
        .await
        .err()
        .unwrap();
    match err {
        ResolveError::Validation { token, reason, .. } => {
            assert_eq!(token, Token::name("ghost"));
            assert_eq!(reason, "missing providers: ghost");
        }
        err => panic!("unexpected error: {err}"),
    }
}

#[tokio::test]
async fn test_bootstrap_registers_config() {
    let config = Config::parse(
        r#"
    {
        "bootstrap": {"strict": false, "validate": true},
        "container": {"metadata": {"env": "test"}},
        "name": "anode"
    }
    "#,
    )
    .unwrap();
    let options = BootstrapOptions::from_config(config).unwrap();
    assert!(!options.strict);
    assert!(options.validate);
    assert!(!options.auto_dispose);

    let container = bootstrap::<StorageModule>(options).await.unwrap();
    assert!(!container.options().strict);
    assert_eq!(container.options().metadata["env"], "test");

    let config = container.resolve::<Config>(Token::of::<Config>()).unwrap();
    let name: String = config.get("name").unwrap();
    assert_eq!(name, "anode");
    assert!(container.try_resolve::<u8>("nothing").unwrap().is_none());
}

#[tokio::test]
async fn test_bootstrap_container_options() {
    let options = BootstrapOptions::new()
        .debug(true)
        .container_options(ContainerOptions::new().metadata("region", "eu").strict(false));
    let container = bootstrap::<StorageModule>(options).await.unwrap();

    assert!(container.options().strict);
    assert!(container.options().debug);
    assert_eq!(container.options().metadata["region"], "eu");
}

struct DisposableModule;

impl Module for DisposableModule {
    fn providers() -> Vec<Provider> {
        vec![
            Provider::new("signal")
                .use_value(Arc::new(Notify::new()))
                .on_destroy(Hook::typed(|notify: &Arc<Notify>| {
                    notify.notify_one();
                    Ok(())
                })),
        ]
    }
}

#[tokio::test]
async fn test_bootstrap_auto_dispose() {
    let shutdown = CancellationToken::new();
    let options = BootstrapOptions::new()
        .auto_dispose(true)
        .shutdown(shutdown.clone());
    let container = bootstrap::<DisposableModule>(options).await.unwrap();

    let notify = container.resolve::<Arc<Notify>>("signal").unwrap();
    let notified = notify.notified();
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), notified)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_bootstrap_options_from_matches() {
    let command = BootstrapOptions::args(clap::Command::new("app"));
    let matches = command
        .clone()
        .try_get_matches_from(["app", "--strict", "false", "--validate", "--auto-dispose"])
        .unwrap();
    let options = BootstrapOptions::from_matches(&matches).await.unwrap();
    assert!(!options.strict);
    assert!(!options.debug);
    assert!(options.validate);
    assert!(options.auto_dispose);

    let matches = command.try_get_matches_from(["app"]).unwrap();
    let options = BootstrapOptions::from_matches(&matches).await.unwrap();
    assert!(options.strict);
    assert!(!options.validate);
}
