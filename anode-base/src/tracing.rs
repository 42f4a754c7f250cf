use std::str::FromStr as _;

use anode::StdError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing_subscriber::filter::{Directive, EnvFilter};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::{Config, ConfigSection};

/// Installs the global tracing subscriber.
pub struct Tracing;

impl Tracing {
    /// Installs a formatting subscriber filtered by `config`.
    ///
    /// Fails when a directive cannot be parsed or a global subscriber is
    /// already set.
    pub fn init(config: &TracingConfig) -> Result<(), StdError> {
        let filter = config.env_filter()?;
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::Layer::default())
            .try_init()?;
        Ok(())
    }

    /// Installs the subscriber described by the `tracing` section of `config`.
    ///
    /// Returns `false` without touching the global state when the section is
    /// absent.
    pub fn init_from(config: &Config) -> Result<bool, StdError> {
        match config.section::<TracingConfig>()? {
            Some(v) => {
                Self::init(&v)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TracingConfig {
    #[serde(
        serialize_with = "serialize_level",
        deserialize_with = "deserialize_level",
        default = "default_level"
    )]
    pub level: tracing::Level,
    #[serde(default)]
    pub directives: Vec<String>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            directives: Vec::new(),
        }
    }
}

impl ConfigSection for TracingConfig {
    fn key() -> &'static str {
        "tracing"
    }
}

impl TracingConfig {
    pub fn env_filter(&self) -> Result<EnvFilter, StdError> {
        let mut directives = Vec::new();
        for directive in &self.directives {
            directives.push(directive.parse::<Directive>()?);
        }
        Ok(new_env_filter(&directives, self.level))
    }
}

fn new_env_filter(directives: &[Directive], level: tracing::Level) -> EnvFilter {
    let mut filter = EnvFilter::default();
    for directive in directives {
        filter = filter.add_directive(directive.clone());
    }
    filter.add_directive(level.into())
}

fn serialize_level<S>(v: &tracing::Level, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(v.as_str())
}

fn deserialize_level<'de, D>(deserializer: D) -> Result<tracing::Level, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    String::deserialize(deserializer)
        .and_then(|v| tracing::Level::from_str(&v).map_err(|v| Error::custom(format!("{v}"))))
}

fn default_level() -> tracing::Level {
    tracing::Level::DEBUG
}
