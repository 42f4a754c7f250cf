//! # anode
//!
//! A dependency resolution runtime: declarative providers keyed by tokens,
//! produced on demand into fully wired object graphs.
//!
//! ## Core Concepts
//!
//! - **Token**: The identity under which a value is registered and requested
//! - **Provider**: A rule producing the value of a token (class, value, factory, alias, async)
//! - **Scope**: How long a produced instance lives and who shares it
//! - **Container**: Resolves tokens, caches instances, delegates to its parent
//! - **Interceptor**: A wrapper around the production of one provider
//! - **Middleware**: A priority ordered wrapper around every production of a container
//!
//! ## Basic Usage
//!
//! ```rust
//! use anode::{Container, Dependency, Provider, Scope};
//!
//! let container = Container::new();
//! container
//!     .add_provider(Provider::new("url").use_value(String::from("https://x")))
//!     .unwrap();
//! container
//!     .add_provider(
//!         Provider::new("client")
//!             .use_factory([Dependency::new("url")], |injector| {
//!                 let url = injector.arg::<String>(0)?;
//!                 Ok(format!("client for {url}"))
//!             })
//!             .scope(Scope::Singleton),
//!     )
//!     .unwrap();
//!
//! let first = container.resolve::<String>("client").unwrap();
//! let second = container.resolve::<String>("client").unwrap();
//! assert!(std::sync::Arc::ptr_eq(&first, &second));
//! ```
//!
//! ## Asynchronous Providers
//!
//! ```rust
//! use anode::{Container, Provider};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let container = Container::new();
//!     container.add_provider(
//!         Provider::new("pool").use_async(|| async { Ok(vec![1u8, 2, 3]) }),
//!     )?;
//!
//!     let pool = container.resolve_async::<Vec<u8>>("pool").await?;
//!     assert_eq!(pool.len(), 3);
//!     assert!(container.resolve::<Vec<u8>>("pool").is_err());
//!     Ok(())
//! }
//! ```
//!
//! ## Using Macros
//!
//! With the `macros` feature enabled, class providers can be derived:
//!
//! ```rust
//! use anode::{Container, Injectable, Provider};
//! use std::sync::Arc;
//!
//! struct Settings {
//!     name: String,
//! }
//!
//! #[derive(Injectable)]
//! struct Greeter {
//!     settings: Arc<Settings>,
//! }
//!
//! let container = Container::new();
//! container
//!     .add_provider(Provider::value(Settings { name: "anode".into() }))
//!     .unwrap();
//! container.add_provider(Provider::class::<Greeter>()).unwrap();
//!
//! let greeter = container.resolve::<Greeter>(anode::Token::of::<Greeter>()).unwrap();
//! assert_eq!(greeter.settings.name, "anode");
//! ```
//!
//! ## Features
//!
//! - `macros` (default): Enables `#[derive(Injectable)]`

use std::any::Any;
use std::sync::Arc;

mod cache;
mod container;
mod context;
mod error;
mod graph;
mod inject;
mod interceptor;
mod interceptors;
mod lifecycle;
mod middleware;
mod provider;
mod registry;
mod scope;
mod token;

pub use cache::*;
pub use container::{Container, ContainerOptions, ContainerStats, ValidationReport};
pub use context::*;
pub use error::*;
pub use graph::*;
pub use inject::{
    ClassSpec, Dependency, Injectable, InjectableRegistry, Injector, Lazy, MetadataProvider,
};
pub use interceptor::{
    AsyncNext, BoxInterceptor, ComposedInterceptor, ConditionalInterceptor, HookInterceptor,
    Interceptor, Next, compose, from_hooks, when,
};
pub use interceptors::*;
pub use lifecycle::*;
pub use middleware::Middleware;
pub use provider::*;
pub use registry::*;
pub use scope::*;
pub use token::*;

#[cfg(feature = "macros")]
pub use anode_macros::*;

/// Type-erased produced value shared between its consumers.
pub type Instance = Arc<dyn Any + Send + Sync>;
