use std::io::Write as _;
use std::time::Duration;

use anode::{Container, EvictionPolicy, Provider, Token};
use anode_base::{Config, ConfigSection, ContainerConfig, TracingConfig, config_section};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct TestConfig {
    name: String,
    port: u16,
    enabled: bool,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct DatabaseConfig {
    host: String,
    port: u16,
    ssl: bool,
}

impl ConfigSection for DatabaseConfig {
    fn key() -> &'static str {
        "database"
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct ServerConfig {
    bind_addr: String,
    workers: u32,
}

fn write_config(text: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

#[test]
fn test_config_new() {
    let config = Config::new();
    assert!(config.is_empty());
    assert_eq!(config.len(), 0);
}

#[test]
fn test_config_set_and_get() {
    let mut config = Config::new();
    let app = TestConfig {
        name: "test_app".to_string(),
        port: 8080,
        enabled: true,
    };
    config.set("app", &app).unwrap();

    let retrieved: TestConfig = config.get("app").unwrap();
    assert_eq!(retrieved, app);
    assert_eq!(config.len(), 1);
}

#[test]
fn test_config_get_nonexistent() {
    let config = Config::new();
    let result: Option<String> = config.get("nonexistent").unwrap();
    assert_eq!(result, None);
}

#[test]
fn test_config_with() {
    let config = Config::new().with("port", 8080u16).with("name", "anode");

    let port: u16 = config.get("port").unwrap();
    let name: String = config.get("name").unwrap();
    assert_eq!(port, 8080);
    assert_eq!(name, "anode");
}

#[test]
fn test_config_parse_invalid_json() {
    assert!(Config::parse(r#"{ "invalid": json }"#).is_err());
}

#[test]
fn test_config_type_conversion_error() {
    let config = Config::new().with("port", "not_a_number");
    let result: Result<i32, _> = config.get("port");
    assert!(result.is_err());
}

#[test]
fn test_config_section() {
    let config = Config::parse(
        r#"
    {
        "database": {
            "host": "localhost",
            "port": 5432,
            "ssl": true
        }
    }
    "#,
    )
    .unwrap();

    let database = config.section::<DatabaseConfig>().unwrap().unwrap();
    assert_eq!(database.host, "localhost");
    assert_eq!(database.port, 5432);

    assert!(Config::new().section::<DatabaseConfig>().unwrap().is_none());

    let broken = Config::new().with("database", "localhost");
    assert!(broken.section::<DatabaseConfig>().is_err());
}

#[test]
fn test_config_merge_objects() {
    let mut config = Config::parse(
        r#"
    {
        "server": {"bind_addr": "localhost:8080", "workers": 1},
        "database": {"host": "localhost"}
    }
    "#,
    )
    .unwrap();
    let overrides = Config::parse(
        r#"
    {
        "server": {"bind_addr": "0.0.0.0:8080", "workers": 4},
        "database": {"port": 5432, "ssl": true}
    }
    "#,
    )
    .unwrap();
    config.merge_from(overrides).unwrap();

    let server: ServerConfig = config.get("server").unwrap();
    assert_eq!(server.bind_addr, "0.0.0.0:8080");
    assert_eq!(server.workers, 4);

    let database: DatabaseConfig = config.get("database").unwrap();
    assert_eq!(
        database,
        DatabaseConfig {
            host: "localhost".into(),
            port: 5432,
            ssl: true,
        }
    );
}

#[test]
fn test_config_merge_arrays_and_primitives() {
    let mut config = Config::parse(r#"{"tags": ["web"], "port": 8080}"#).unwrap();
    config
        .merge_from(Config::parse(r#"{"tags": ["logging"], "port": 9090}"#).unwrap())
        .unwrap();
    config.merge_from(Config::new()).unwrap();

    let tags: Vec<String> = config.get("tags").unwrap();
    let port: u16 = config.get("port").unwrap();
    assert_eq!(tags, vec!["web", "logging"]);
    assert_eq!(port, 9090);
}

#[test]
fn test_config_serialization() {
    let config = Config::new().with("app_name", "test_app").with("port", 8080u16);
    let serialized = serde_json::to_string(&config).unwrap();
    let deserialized: Config = serde_json::from_str(&serialized).unwrap();

    let app_name: String = deserialized.get("app_name").unwrap();
    let port: u16 = deserialized.get("port").unwrap();
    assert_eq!(app_name, "test_app");
    assert_eq!(port, 8080);
}

#[tokio::test]
async fn test_config_parse_file() {
    let file = write_config(
        r#"
    {
        "server": {"bind_addr": "127.0.0.1:8080", "workers": 4},
        "database": {"host": "localhost", "port": 5432, "ssl": true}
    }
    "#,
    );

    let config = Config::parse_file(file.path()).await.unwrap();
    let server: ServerConfig = config.get("server").unwrap();
    assert_eq!(server.workers, 4);
    assert_eq!(config.len(), 2);
}

#[tokio::test]
async fn test_config_parse_file_not_found() {
    assert!(Config::parse_file("nonexistent_file.json").await.is_err());
}

#[tokio::test]
async fn test_config_parse_files_with_overrides() {
    let base = write_config(r#"{"server": {"bind_addr": "localhost:80", "workers": 1}}"#);
    let first = write_config(r#"{"server": {"workers": 2}}"#);
    let second = write_config(r#"{"server": {"workers": 8}, "name": "prod"}"#);

    let config = Config::parse_files(base.path(), [first.path(), second.path()])
        .await
        .unwrap();
    let server: ServerConfig = config.get("server").unwrap();
    let name: String = config.get("name").unwrap();
    assert_eq!(server.bind_addr, "localhost:80");
    assert_eq!(server.workers, 8);
    assert_eq!(name, "prod");
}

#[test]
fn test_config_section_provider() {
    let config = Config::parse(
        r#"{"database": {"host": "injected_host", "port": 3306, "ssl": false}}"#,
    )
    .unwrap();
    let container = Container::new();
    container.add_provider(Provider::value(config)).unwrap();
    container
        .add_provider(config_section::<DatabaseConfig>())
        .unwrap();

    let first = container
        .resolve::<DatabaseConfig>(Token::of::<DatabaseConfig>())
        .unwrap();
    let second = container
        .resolve::<DatabaseConfig>(Token::of::<DatabaseConfig>())
        .unwrap();
    assert_eq!(first.host, "injected_host");
    assert_eq!(first.port, 3306);
    assert!(std::sync::Arc::ptr_eq(&first, &second));
}

#[test]
fn test_config_section_provider_without_config() {
    let container = Container::new();
    container
        .add_provider(config_section::<DatabaseConfig>())
        .unwrap();

    let err = container
        .resolve::<DatabaseConfig>(Token::of::<DatabaseConfig>())
        .unwrap_err();
    assert!(err.is_missing_provider());
}

#[test]
fn test_container_config() {
    let config = Config::parse(
        r#"
    {
        "container": {
            "capacity": 16,
            "ttl": "5s",
            "policy": "lfu",
            "metadata": {"env": "test"}
        }
    }
    "#,
    )
    .unwrap();

    let container = config.section::<ContainerConfig>().unwrap().unwrap();
    assert_eq!(container.capacity, Some(16));
    assert_eq!(container.ttl, Some(Duration::from_secs(5)));
    assert_eq!(container.policy, EvictionPolicy::Lfu);

    let options = container.options();
    assert_eq!(options.cache.capacity, Some(16));
    assert_eq!(options.cache.ttl, Some(Duration::from_secs(5)));
    assert_eq!(options.cache.policy, EvictionPolicy::Lfu);
    assert_eq!(options.metadata["env"], "test");
}

#[test]
fn test_container_config_defaults() {
    let container: ContainerConfig = Config::parse(r#"{"container": {}}"#)
        .unwrap()
        .get("container")
        .unwrap();
    assert_eq!(container.capacity, None);
    assert_eq!(container.ttl, None);
    assert_eq!(container.policy, EvictionPolicy::Lru);
}

#[test]
fn test_tracing_config() {
    let config = Config::parse(
        r#"{"tracing": {"level": "info", "directives": ["anode=trace"]}}"#,
    )
    .unwrap();
    let tracing = config.section::<TracingConfig>().unwrap().unwrap();
    assert_eq!(tracing.level, tracing::Level::INFO);

    let filter = tracing.env_filter().unwrap().to_string();
    assert!(filter.contains("anode=trace"));
    assert!(filter.contains("info"));

    let default = TracingConfig::default();
    assert_eq!(default.level, tracing::Level::DEBUG);
    assert!(default.directives.is_empty());
}

#[test]
fn test_tracing_config_invalid() {
    assert!(
        Config::parse(r#"{"tracing": {"level": "loud"}}"#)
            .unwrap()
            .section::<TracingConfig>()
            .is_err()
    );

    let tracing = TracingConfig {
        level: tracing::Level::INFO,
        directives: vec!["anode=loud".into()],
    };
    assert!(tracing.env_filter().is_err());
}
