use std::sync::Arc;

use anode::{
    Container, ContainerOptions, Injectable, Instance, Provider, ResolutionPath, ResolveError,
    ResolveResult, StdError, Token, ValidationReport,
};
use clap::{Arg, ArgAction, ArgMatches};
use serde::{Deserialize, Serialize};

use crate::{Config, ContainerConfig, ConfigSection, Module, ModuleLoader};

pub use tokio_util::sync::CancellationToken;

/// Options of [`bootstrap`], read from the `bootstrap` config section and
/// command line flags.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapOptions {
    /// Fail on missing providers instead of resolving them to nothing.
    pub strict: bool,
    pub debug: bool,
    /// Validate the dependency graph before returning the container.
    pub validate: bool,
    /// Dispose the container on ctrl-c or when the shutdown token fires.
    pub auto_dispose: bool,
    #[serde(skip)]
    container: ContainerOptions,
    #[serde(skip)]
    config: Option<Arc<Config>>,
    #[serde(skip)]
    shutdown: Option<CancellationToken>,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            strict: true,
            debug: false,
            validate: false,
            auto_dispose: false,
            container: ContainerOptions::default(),
            config: None,
            shutdown: None,
        }
    }
}

impl ConfigSection for BootstrapOptions {
    fn key() -> &'static str {
        "bootstrap"
    }
}

impl BootstrapOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn validate(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    pub fn auto_dispose(mut self, auto_dispose: bool) -> Self {
        self.auto_dispose = auto_dispose;
        self
    }

    /// Base options of the root container. `strict` and `debug` are
    /// overridden by the bootstrap flags.
    pub fn container_options(mut self, options: ContainerOptions) -> Self {
        self.container = options;
        self
    }

    /// Registers `config` as a value provider of [`Config`].
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(Arc::new(config));
        self
    }

    pub fn shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Reads the `bootstrap` and `container` sections of `config` and keeps
    /// the config for registration.
    pub fn from_config(config: Config) -> Result<Self, StdError> {
        let mut options = config.section::<Self>()?.unwrap_or_default();
        if let Some(container) = config.section::<ContainerConfig>()? {
            options.container = container.options();
        }
        options.config = Some(Arc::new(config));
        Ok(options)
    }

    /// Adds the bootstrap flags and config file arguments to `command`.
    pub fn args(command: clap::Command) -> clap::Command {
        let flag = |name: &'static str, help: &'static str| {
            Arg::new(name)
                .long(name)
                .help(help)
                .num_args(0..=1)
                .value_parser(clap::value_parser!(bool))
                .default_missing_value("true")
        };
        command
            .arg(Arg::new("config").long("config").short('c'))
            .arg(
                Arg::new("config-override")
                    .long("config-override")
                    .short('o')
                    .action(ArgAction::Append),
            )
            .arg(flag("strict", "Fail on missing providers"))
            .arg(flag("debug", "Log every resolution"))
            .arg(flag("validate", "Validate the dependency graph"))
            .arg(flag("auto-dispose", "Dispose the container on shutdown"))
    }

    /// Overrides options with the flags present in `matches`.
    pub fn with_matches(mut self, matches: &ArgMatches) -> Self {
        let flag = |name: &str| matches.get_one::<bool>(name).copied();
        if let Some(v) = flag("strict") {
            self.strict = v;
        }
        if let Some(v) = flag("debug") {
            self.debug = v;
        }
        if let Some(v) = flag("validate") {
            self.validate = v;
        }
        if let Some(v) = flag("auto-dispose") {
            self.auto_dispose = v;
        }
        self
    }

    /// Loads the config files named by `matches` and applies the flags on
    /// top of the config sections.
    pub async fn from_matches(matches: &ArgMatches) -> Result<Self, StdError> {
        let config = match matches.get_one::<String>("config") {
            Some(path) => {
                let overrides = matches
                    .get_many::<String>("config-override")
                    .unwrap_or_default();
                Config::parse_files(path, overrides).await?
            }
            None => Config::new(),
        };
        Ok(Self::from_config(config)?.with_matches(matches))
    }
}

/// Creates a root container and loads `M` with its imports into it.
///
/// # Example
///
/// ```rust
/// use anode::Provider;
/// use anode_base::{BootstrapOptions, Module, bootstrap};
///
/// struct App;
///
/// impl Module for App {
///     fn providers() -> Vec<Provider> {
///         vec![Provider::new("name").use_value(String::from("anode"))]
///     }
/// }
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let container = bootstrap::<App>(BootstrapOptions::new().validate(true)).await?;
///     let name = container.resolve::<String>("name")?;
///     assert_eq!(name.as_str(), "anode");
///     container.dispose().await?;
///     Ok(())
/// }
/// ```
pub async fn bootstrap<M>(options: BootstrapOptions) -> ResolveResult<Container>
where
    M: Module,
{
    let container = Container::with_options(
        options
            .container
            .clone()
            .strict(options.strict)
            .debug(options.debug),
    );
    if let Some(config) = &options.config {
        container.add_provider(
            Provider::new(Token::of::<Config>()).use_instance(config.clone() as Instance),
        )?;
    }
    let mut loader = ModuleLoader::new();
    loader.load::<M>(&container)?;
    tracing::info!(modules = ?loader.loaded(), "Container bootstrapped");
    if options.validate {
        check_report(container.validate())?;
    }
    if options.auto_dispose {
        spawn_dispose(container.clone(), options.shutdown.clone().unwrap_or_default());
    }
    Ok(container)
}

/// Bootstraps `M` and resolves the root object `A`.
///
/// `A` is registered as a class provider when no module provides it. In non
/// strict mode an unresolvable root yields `None`.
pub async fn bootstrap_app<M, A>(
    options: BootstrapOptions,
) -> ResolveResult<(Container, Option<Arc<A>>)>
where
    M: Module,
    A: Injectable,
{
    let strict = options.strict;
    let container = bootstrap::<M>(options).await?;
    let token = Token::of::<A>();
    if !container.has_provider(&token) {
        container.add_provider(Provider::class::<A>())?;
    }
    let app = match container.resolve_async::<A>(&token).await {
        Ok(app) => Some(app),
        Err(err) if !strict && err.is_missing_provider() => {
            tracing::warn!(token = %token, "Root object is not resolvable: {err}");
            None
        }
        Err(err) => return Err(err),
    };
    Ok((container, app))
}

fn check_report(report: ValidationReport) -> ResolveResult<()> {
    if report.valid {
        return Ok(());
    }
    if let Some(cycle) = report.cycles.first()
        && let Some(token) = cycle.first()
    {
        let path = ResolutionPath(cycle.clone());
        return Err(ResolveError::Validation {
            token: token.clone(),
            reason: format!("dependency cycle {path}"),
            path,
        });
    }
    if let Some(token) = report.missing.first() {
        let missing: Vec<_> = report.missing.iter().map(|v| v.to_string()).collect();
        return Err(ResolveError::Validation {
            token: token.clone(),
            reason: format!("missing providers: {}", missing.join(", ")),
            path: ResolutionPath::default(),
        });
    }
    Ok(())
}

fn spawn_dispose(container: Container, shutdown: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    tracing::error!("Cannot listen for shutdown signal: {err}");
                    shutdown.cancelled().await;
                }
            }
            _ = shutdown.cancelled() => {}
        }
        tracing::info!("Disposing container");
        if let Err(err) = container.dispose().await {
            tracing::error!("Cannot dispose container: {err}");
        }
    });
}
