//! # anode-base
//!
//! Application level building blocks on top of the anode container:
//! modules, bootstrap and configuration.
//!
//! ## Core Components
//!
//! - **Modules**: Provider groups with imports, loaded depth first and once
//! - **Bootstrap**: Root container creation with validation and shutdown handling
//! - **Configuration**: Layered JSON config with typed sections
//! - **Tracing**: Subscriber setup from the `tracing` config section
//!
//! ## Quick Start
//!
//! ```rust
//! use anode::{Dependency, Provider};
//! use anode_base::{BootstrapOptions, Config, Module, bootstrap};
//!
//! struct App;
//!
//! impl Module for App {
//!     fn providers() -> Vec<Provider> {
//!         vec![
//!             Provider::new("greeting").use_factory([Dependency::of::<Config>()], |injector| {
//!                 let config = injector.arg::<Config>(0)?;
//!                 let name: String = config.get("name")?;
//!                 Ok(format!("hello {name}"))
//!             }),
//!         ]
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let config = Config::new().with("name", "anode");
//!     let options = BootstrapOptions::from_config(config)?.validate(true);
//!     let container = bootstrap::<App>(options).await?;
//!
//!     let greeting = container.resolve::<String>("greeting")?;
//!     assert_eq!(greeting.as_str(), "hello anode");
//!     Ok(())
//! }
//! ```

mod bootstrap;
mod config;
mod module;
mod tracing;

pub use bootstrap::*;
pub use config::*;
pub use module::*;
pub use tracing::*;
