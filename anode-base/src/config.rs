use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anode::{
    CacheOptions, ContainerOptions, Dependency, EvictionPolicy, Provider, StdError, Token,
};
use duration_str::deserialize_option_duration;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Layered JSON configuration split into named top level sections.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub(crate) configs: BTreeMap<String, serde_json::Value>,
}

/// Typed view of a single top level configuration section.
pub trait ConfigSection: DeserializeOwned {
    fn key() -> &'static str;
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<T>(&self, name: impl AsRef<str>) -> Result<T, StdError>
    where
        T: DeserializeOwned,
    {
        Ok(serde_json::from_value(
            self.configs
                .get(name.as_ref())
                .cloned()
                .unwrap_or(serde_json::Value::Null),
        )?)
    }

    /// Returns the section of `T`, or `None` when the config has no such key.
    pub fn section<T>(&self) -> Result<Option<T>, StdError>
    where
        T: ConfigSection,
    {
        match self.configs.get(T::key()) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    pub fn set<T>(&mut self, name: impl Into<String>, value: T) -> Result<(), StdError>
    where
        T: Serialize,
    {
        self.configs
            .insert(name.into(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Builder variant of [`Config::set`]. Values that cannot be serialized
    /// are stored as `null`.
    pub fn with<T>(mut self, name: impl Into<String>, value: T) -> Self
    where
        T: Serialize,
    {
        let value = serde_json::to_value(value).unwrap_or_default();
        self.configs.insert(name.into(), value);
        self
    }

    /// Deep merges `other` into this config.
    ///
    /// Objects are merged key by key, arrays are concatenated and every other
    /// value is replaced.
    pub fn merge_from(&mut self, other: Self) -> Result<(), StdError> {
        for (key, value) in other.configs {
            let entry = self.configs.entry(key);
            merge_json_from(entry.or_insert(serde_json::Value::Null), value)?;
        }
        Ok(())
    }

    pub fn parse<T>(text: T) -> Result<Self, StdError>
    where
        T: AsRef<str>,
    {
        Ok(serde_json::from_str(text.as_ref())?)
    }

    pub async fn parse_file(path: impl AsRef<Path>) -> Result<Self, StdError> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::parse(text)
    }

    /// Parses `path` and merges every override file on top of it in order.
    pub async fn parse_files<I, P>(path: impl AsRef<Path>, overrides: I) -> Result<Self, StdError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut config = Self::parse_file(path).await?;
        for path in overrides {
            config.merge_from(Self::parse_file(path).await?)?;
        }
        Ok(config)
    }

    /// Check if the config is empty
    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// Get the number of config entries
    pub fn len(&self) -> usize {
        self.configs.len()
    }
}

/// Returns a singleton provider of the section `T` read from the registered
/// [`Config`].
///
/// ```rust
/// use anode::{Container, Provider, Token};
/// use anode_base::{Config, ConfigSection, config_section};
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct Database {
///     host: String,
/// }
///
/// impl ConfigSection for Database {
///     fn key() -> &'static str {
///         "database"
///     }
/// }
///
/// let config = Config::parse(r#"{"database": {"host": "localhost"}}"#).unwrap();
/// let container = Container::new();
/// container.add_provider(Provider::value(config)).unwrap();
/// container.add_provider(config_section::<Database>()).unwrap();
///
/// let database = container.resolve::<Database>(Token::of::<Database>()).unwrap();
/// assert_eq!(database.host, "localhost");
/// ```
pub fn config_section<T>() -> Provider
where
    T: ConfigSection + Send + Sync + 'static,
{
    Provider::new(Token::of::<T>())
        .use_factory([Dependency::of::<Config>()], |injector| {
            let config = injector.arg::<Config>(0)?;
            config.get::<T>(T::key())
        })
        .tag("config")
}

/// Container settings read from the `container` section.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(default)]
    pub capacity: Option<usize>,
    #[serde(default, deserialize_with = "deserialize_option_duration")]
    pub ttl: Option<Duration>,
    #[serde(default)]
    pub policy: EvictionPolicy,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ConfigSection for ContainerConfig {
    fn key() -> &'static str {
        "container"
    }
}

impl ContainerConfig {
    pub fn options(&self) -> ContainerOptions {
        let mut options = ContainerOptions::new().cache(CacheOptions {
            capacity: self.capacity,
            ttl: self.ttl,
            policy: self.policy,
        });
        options.metadata = self.metadata.clone();
        options
    }
}

fn merge_json_from(lhs: &mut serde_json::Value, rhs: serde_json::Value) -> Result<(), StdError> {
    match lhs {
        serde_json::Value::Object(l) => match rhs {
            serde_json::Value::Object(r) => {
                for (key, value) in r {
                    let entry = l.entry(key);
                    merge_json_from(entry.or_insert(serde_json::Value::Null), value)?;
                }
            }
            _ => *lhs = rhs,
        },
        serde_json::Value::Array(l) => match rhs {
            serde_json::Value::Array(r) => {
                l.extend(r);
            }
            _ => *lhs = rhs,
        },
        _ => *lhs = rhs,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_json_null_is_replaced() {
        let mut lhs = serde_json::Value::Null;
        merge_json_from(&mut lhs, serde_json::json!({"a": 1})).unwrap();
        assert_eq!(lhs, serde_json::json!({"a": 1}));
    }

    #[test]
    fn test_merge_json_object_over_array() {
        let mut lhs = serde_json::json!([1, 2]);
        merge_json_from(&mut lhs, serde_json::json!({"a": 1})).unwrap();
        assert_eq!(lhs, serde_json::json!({"a": 1}));
    }
}
