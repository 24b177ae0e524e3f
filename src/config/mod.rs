/// Configuration management for umbral
///
/// Pools and their servers are immutable records once loaded; a changed
/// configuration is applied by building a new registry and handing both to
/// the reload coordinator.
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::continuum::Distribution;
use crate::hash::HashKind;

/// Main umbral configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Server pools, in routing order
    pub pools: Vec<PoolConfig>,
}

/// One routing domain: a listener plus the servers behind it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    /// `host:port` or a unix socket path
    pub listen: String,
    /// File mode of a unix socket listener
    #[serde(default)]
    pub perm: Option<u32>,
    #[serde(default)]
    pub distribution: Distribution,
    #[serde(default)]
    pub hash: HashKind,
    /// Two-byte delimiter pair, e.g. `"{}"`
    #[serde(default)]
    pub hash_tag: Option<String>,
    /// Connection idle timeout; none means wait forever
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Maximum client connections, 0 for unlimited
    #[serde(default)]
    pub client_connections: u32,
    /// Maximum connections per server
    #[serde(default = "default_server_connections")]
    pub server_connections: u32,
    #[serde(default)]
    pub auto_eject_hosts: bool,
    #[serde(default = "default_server_retry_timeout_ms")]
    pub server_retry_timeout_ms: u64,
    #[serde(default = "default_server_failure_limit")]
    pub server_failure_limit: u32,
    /// Minimum spacing between two continuum rebuilds
    #[serde(default = "default_rebuild_interval_ms")]
    pub rebuild_interval_ms: u64,
    #[serde(default)]
    pub preconnect: bool,
    #[serde(default)]
    pub redis: bool,
    #[serde(default)]
    pub redis_auth: Option<String>,
    #[serde(default)]
    pub redis_db: u32,
    pub servers: Vec<ServerConfig>,
}

/// A backend record, written as `host:port:weight [name]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub weight: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (text, compact)
    pub format: String,
}

fn default_backlog() -> u32 {
    512
}

fn default_server_connections() -> u32 {
    1
}

fn default_server_retry_timeout_ms() -> u64 {
    30_000
}

fn default_server_failure_limit() -> u32 {
    2
}

fn default_rebuild_interval_ms() -> u64 {
    100
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn new(host: &str, port: u16, weight: u32) -> Self {
        Self {
            name: format!("{}:{}", host, port),
            host: host.to_string(),
            port,
            weight,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `host:port:weight`
    pub fn pname(&self) -> String {
        format!("{}:{}:{}", self.host, self.port, self.weight)
    }
}

impl FromStr for ServerConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |why: &str| ConfigError::ValidationError(format!("server '{}': {}", s, why));

        let mut fields = s.split_whitespace();
        let address = fields.next().ok_or_else(|| invalid("empty server record"))?;
        let name = fields.next();
        if fields.next().is_some() {
            return Err(invalid("trailing fields"));
        }

        let mut parts = address.rsplitn(3, ':');
        let weight = parts.next().ok_or_else(|| invalid("missing weight"))?;
        let port = parts.next().ok_or_else(|| invalid("missing port"))?;
        let host = parts.next().ok_or_else(|| invalid("missing host"))?;
        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        let port: u16 = port.parse().map_err(|_| invalid("invalid port"))?;
        let weight: u32 = weight.parse().map_err(|_| invalid("invalid weight"))?;

        let server = ServerConfig::new(host, port, weight);
        Ok(match name {
            Some(name) => server.with_name(name),
            None => server,
        })
    }
}

impl TryFrom<String> for ServerConfig {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ServerConfig> for String {
    fn from(server: ServerConfig) -> Self {
        server.to_string()
    }
}

impl fmt::Display for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name == self.address() {
            write!(f, "{}", self.pname())
        } else {
            write!(f, "{} {}", self.pname(), self.name)
        }
    }
}

impl PoolConfig {
    /// Pool with default settings and the given servers
    pub fn new(name: &str, listen: &str, servers: Vec<ServerConfig>) -> Self {
        Self {
            name: name.to_string(),
            listen: listen.to_string(),
            perm: None,
            distribution: Distribution::default(),
            hash: HashKind::default(),
            hash_tag: None,
            timeout_ms: None,
            backlog: default_backlog(),
            client_connections: 0,
            server_connections: default_server_connections(),
            auto_eject_hosts: false,
            server_retry_timeout_ms: default_server_retry_timeout_ms(),
            server_failure_limit: default_server_failure_limit(),
            rebuild_interval_ms: default_rebuild_interval_ms(),
            preconnect: false,
            redis: false,
            redis_auth: None,
            redis_db: 0,
            servers,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn server_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.server_retry_timeout_ms)
    }

    pub fn rebuild_interval(&self) -> Duration {
        Duration::from_millis(self.rebuild_interval_ms)
    }

    /// Hash tag as a delimiter pair; only meaningful after `validate`
    pub fn hash_tag_pair(&self) -> Option<[u8; 2]> {
        self.hash_tag
            .as_deref()
            .and_then(|tag| <[u8; 2]>::try_from(tag.as_bytes()).ok())
    }

    /// Validate one pool record
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |why: String| ConfigError::ValidationError(why);

        if self.name.trim().is_empty() {
            return Err(invalid("pool name cannot be empty".to_string()));
        }

        if self.listen.trim().is_empty() {
            return Err(invalid(format!("pool '{}': listen cannot be empty", self.name)));
        }

        if self.servers.is_empty() {
            return Err(invalid(format!("pool '{}': servers cannot be empty", self.name)));
        }

        if let Some(tag) = &self.hash_tag {
            if tag.len() != 2 {
                return Err(invalid(format!(
                    "pool '{}': hash_tag '{}' must be exactly two characters",
                    self.name, tag
                )));
            }
        }

        if self.server_connections == 0 {
            return Err(invalid(format!(
                "pool '{}': server_connections must be greater than 0",
                self.name
            )));
        }

        if self.server_failure_limit == 0 {
            return Err(invalid(format!(
                "pool '{}': server_failure_limit must be greater than 0",
                self.name
            )));
        }

        let mut names = HashSet::new();
        for server in &self.servers {
            if server.weight == 0 {
                return Err(invalid(format!(
                    "pool '{}': server '{}' weight must be greater than 0",
                    self.name, server.name
                )));
            }
            if server.port == 0 {
                return Err(invalid(format!(
                    "pool '{}': server '{}' port must be greater than 0",
                    self.name, server.name
                )));
            }
            if !names.insert(server.name.as_str()) {
                return Err(invalid(format!(
                    "pool '{}': duplicate server name '{}'",
                    self.name, server.name
                )));
            }
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut pool = PoolConfig::new(
            "alpha",
            "127.0.0.1:22121",
            vec![
                ServerConfig::new("127.0.0.1", 11211, 1),
                ServerConfig::new("127.0.0.1", 11212, 1),
            ],
        );
        pool.hash_tag = Some("{}".to_string());
        pool.auto_eject_hosts = true;
        pool.timeout_ms = Some(400);

        Self {
            logging: LoggingConfig::default(),
            pools: vec![pool],
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        content.parse()
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pools.is_empty() {
            return Err(ConfigError::ValidationError(
                "pools cannot be empty".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for pool in &self.pools {
            pool.validate()?;
            if !names.insert(pool.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate pool name '{}'",
                    pool.name
                )));
            }
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "text" | "compact" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Find a pool by name
    pub fn pool(&self, name: &str) -> Option<&PoolConfig> {
        self.pools.iter().find(|pool| pool.name == name)
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let mut cache = PoolConfig::new(
            "cache",
            "0.0.0.0:22121",
            vec![
                ServerConfig::new("10.0.1.20", 11211, 1).with_name("cache-a"),
                ServerConfig::new("10.0.1.21", 11211, 1).with_name("cache-b"),
                ServerConfig::new("10.0.1.22", 11211, 2).with_name("cache-c"),
            ],
        );
        cache.timeout_ms = Some(400);
        cache.auto_eject_hosts = true;
        cache.preconnect = true;

        let mut sessions = PoolConfig::new(
            "sessions",
            "0.0.0.0:22122",
            vec![
                ServerConfig::new("10.0.1.30", 6379, 1),
                ServerConfig::new("10.0.1.31", 6379, 1),
            ],
        );
        sessions.redis = true;
        sessions.hash = HashKind::Murmur;
        sessions.hash_tag = Some("{}".to_string());
        sessions.auto_eject_hosts = true;
        sessions.server_failure_limit = 3;

        let config = Config {
            logging: LoggingConfig::default(),
            pools: vec![cache, sessions],
        };

        config.save_to_file(path)
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(s).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
[logging]
level = "debug"
format = "compact"

[[pools]]
name = "alpha"
listen = "127.0.0.1:22121"
hash = "md5"
hash_tag = "{}"
distribution = "modula"
auto_eject_hosts = true
server_failure_limit = 3
servers = ["127.0.0.1:11211:1 a", "127.0.0.1:11212:2"]

[[pools]]
name = "beta"
listen = "/tmp/beta.sock"
perm = 0o600
servers = ["cache.internal:11211:1"]
"#;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_sample() {
        let config: Config = SAMPLE.parse().unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.pools.len(), 2);

        let alpha = config.pool("alpha").unwrap();
        assert_eq!(alpha.hash, HashKind::Md5);
        assert_eq!(alpha.distribution, Distribution::Modula);
        assert_eq!(alpha.hash_tag_pair(), Some(*b"{}"));
        assert_eq!(alpha.server_failure_limit, 3);
        assert_eq!(alpha.servers[0].name, "a");
        assert_eq!(alpha.servers[1].name, "127.0.0.1:11212");
        assert_eq!(alpha.servers[1].weight, 2);

        let beta = config.pool("beta").unwrap();
        assert_eq!(beta.perm, Some(0o600));
        assert_eq!(beta.hash, HashKind::Fnv1a64);
        assert_eq!(beta.distribution, Distribution::Ketama);
        assert_eq!(beta.backlog, 512);
        assert_eq!(beta.server_connections, 1);
        assert!(!beta.auto_eject_hosts);
        assert_eq!(beta.server_retry_timeout(), Duration::from_secs(30));
        assert_eq!(beta.timeout(), None);
    }

    #[test]
    fn test_server_record_parsing() {
        let server: ServerConfig = "10.0.0.1:11211:3 primary".parse().unwrap();
        assert_eq!(server.host, "10.0.0.1");
        assert_eq!(server.port, 11211);
        assert_eq!(server.weight, 3);
        assert_eq!(server.name, "primary");
        assert_eq!(server.to_string(), "10.0.0.1:11211:3 primary");

        let server: ServerConfig = "cache:6379:1".parse().unwrap();
        assert_eq!(server.name, "cache:6379");
        assert_eq!(server.to_string(), "cache:6379:1");

        assert!("cache:6379".parse::<ServerConfig>().is_err());
        assert!("cache:port:1".parse::<ServerConfig>().is_err());
        assert!(":6379:1".parse::<ServerConfig>().is_err());
        assert!("a:1:1 b c".parse::<ServerConfig>().is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.pools[0].servers.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pools[0].hash_tag = Some("{".to_string());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        let duplicate = config.pools[0].clone();
        config.pools.push(duplicate);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        let first = config.pools[0].servers[0].clone();
        config.pools[0].servers.push(first);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pools[0].servers[0].weight = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pools.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed_config: Config = toml_str.parse().unwrap();
        assert_eq!(parsed_config.pools[0].servers, config.pools[0].servers);
    }

    #[test]
    fn test_config_file_operations() {
        let temp_file = NamedTempFile::new().unwrap();

        Config::create_example_config(temp_file.path()).unwrap();
        let loaded_config = Config::load_from_file(temp_file.path()).unwrap();
        assert_eq!(loaded_config.pools.len(), 2);
        assert_eq!(loaded_config.pools[1].hash, HashKind::Murmur);
        assert!(loaded_config.pools[1].redis);
    }

    #[test]
    fn test_missing_file() {
        let result = Config::load_from_file("/nonexistent/umbral.toml");
        assert!(matches!(result, Err(ConfigError::IoError(_))));
    }
}
