//! Configuration for memring

use crate::hashring::HashAlgorithm;
use serde::{Deserialize, Deserializer};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Default memcached address used when no servers are configured
pub const DEFAULT_SERVER: &str = "127.0.0.1:11211";

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub servers: Servers,
    pub client: ClientConfig,
}

/// Server locations, in any of the three accepted shapes
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Servers {
    /// A single `host:port`
    Single(String),
    /// Several `host:port` entries with equal weight
    List(Vec<String>),
    /// `host:port` mapped to its weight
    Weighted(BTreeMap<String, u32>),
}

impl Servers {
    /// Flatten into `(address, weight)` pairs; weighted maps come out sorted by address
    pub fn entries(&self) -> Vec<(String, u32)> {
        match self {
            Self::Single(addr) => vec![(addr.clone(), 1)],
            Self::List(addrs) => addrs.iter().map(|a| (a.clone(), 1)).collect(),
            Self::Weighted(map) => map.iter().map(|(a, w)| (a.clone(), *w)).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Single(addr) => addr.is_empty(),
            Self::List(addrs) => addrs.is_empty(),
            Self::Weighted(map) => map.is_empty(),
        }
    }
}

impl Default for Servers {
    fn default() -> Self {
        Self::Single(DEFAULT_SERVER.to_string())
    }
}

/// Accepts either one address or a list of them
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(addr) => vec![addr],
        OneOrMany::Many(addrs) => addrs,
    })
}

impl From<&str> for Servers {
    fn from(addr: &str) -> Self {
        Self::Single(addr.to_string())
    }
}

impl From<String> for Servers {
    fn from(addr: String) -> Self {
        Self::Single(addr)
    }
}

impl From<Vec<String>> for Servers {
    fn from(addrs: Vec<String>) -> Self {
        Self::List(addrs)
    }
}

impl From<Vec<&str>> for Servers {
    fn from(addrs: Vec<&str>) -> Self {
        Self::List(addrs.into_iter().map(str::to_string).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Servers {
    fn from(addrs: [&str; N]) -> Self {
        Self::List(addrs.iter().map(|a| (*a).to_string()).collect())
    }
}

impl From<BTreeMap<String, u32>> for Servers {
    fn from(map: BTreeMap<String, u32>) -> Self {
        Self::Weighted(map)
    }
}

impl From<HashMap<String, u32>> for Servers {
    fn from(map: HashMap<String, u32>) -> Self {
        Self::Weighted(map.into_iter().collect())
    }
}

/// Client behaviour configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Maximum key length in bytes
    pub max_key_size: usize,

    /// Maximum key lifetime in seconds
    pub max_expiration: u32,

    /// Maximum encoded value size in bytes
    pub max_value: usize,

    /// Maximum number of connections per server
    pub pool_size: usize,

    /// Hash used to place servers and keys on the ring
    pub algorithm: HashAlgorithm,

    /// Interval between reconnection attempts after the first one (milliseconds)
    pub reconnect_ms: u64,

    /// Connect, acquire and request timeout (milliseconds)
    pub timeout_ms: u64,

    /// Extra attempts per call after a transport failure
    pub retries: u32,

    /// Consecutive failures before a server is considered dead
    pub failures: u32,

    /// Delay between a server dying and the first reconnection attempt (milliseconds)
    pub retry_ms: u64,

    /// Allow dead servers to be taken out of the ring
    pub remove: bool,

    /// Substitutes for removed servers, as one address or a list
    #[serde(deserialize_with = "one_or_many")]
    pub failover_servers: Vec<String>,

    /// Hash keys longer than `max_key_size` instead of rejecting them
    pub key_compression: bool,

    /// Idle timeout for pooled connections (milliseconds)
    pub idle_ms: u64,

    /// Give up probing a dead server after this many failed attempts (None = never)
    pub reconnect_attempts: Option<u32>,

    /// Capacity of the event and command broadcast channels
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_key_size: 250,
            max_expiration: 2_592_000,
            max_value: 1_048_576,
            pool_size: 10,
            algorithm: HashAlgorithm::default(),
            reconnect_ms: 18_000_000,
            timeout_ms: 5000,
            retries: 5,
            failures: 5,
            retry_ms: 30_000,
            remove: false,
            failover_servers: Vec::new(),
            key_compression: true,
            idle_ms: 5000,
            reconnect_attempts: None,
            event_capacity: 1024,
        }
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }

    pub fn retry(&self) -> Duration {
        Duration::from_millis(self.retry_ms)
    }

    pub fn reconnect(&self) -> Duration {
        Duration::from_millis(self.reconnect_ms)
    }

    /// Check option combinations that can never work
    pub fn validate(&self) -> crate::Result<()> {
        if self.pool_size == 0 {
            return Err(crate::MemringError::Config(
                "pool_size must be at least 1".to_string(),
            ));
        }
        if self.failures == 0 {
            return Err(crate::MemringError::Config(
                "failures must be at least 1".to_string(),
            ));
        }
        if self.max_key_size == 0 {
            return Err(crate::MemringError::Config(
                "max_key_size must be at least 1".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(crate::MemringError::Config(
                "timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.idle_ms == 0 || self.reconnect_ms == 0 {
            return Err(crate::MemringError::Config(
                "idle_ms and reconnect_ms must be greater than 0".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(crate::MemringError::Config(
                "event_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            crate::MemringError::Config(format!("Failed to read config file: {e}"))
        })?;

        toml::from_str(&contents)
            .map_err(|e| crate::MemringError::Config(format!("Failed to parse config: {e}")))
    }

    /// Load configuration from environment variables or use defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(servers) = std::env::var("MEMRING_SERVERS")
            && let Some(parsed) = parse_server_list(&servers)
        {
            config.servers = parsed;
        }

        if let Ok(pool_size) = std::env::var("MEMRING_POOL_SIZE")
            && let Ok(n) = pool_size.parse()
        {
            config.client.pool_size = n;
        }

        if let Ok(timeout) = std::env::var("MEMRING_TIMEOUT_MS")
            && let Ok(n) = timeout.parse()
        {
            config.client.timeout_ms = n;
        }

        if let Ok(retries) = std::env::var("MEMRING_RETRIES")
            && let Ok(n) = retries.parse()
        {
            config.client.retries = n;
        }

        if let Ok(failures) = std::env::var("MEMRING_FAILURES")
            && let Ok(n) = failures.parse()
        {
            config.client.failures = n;
        }

        if let Ok(remove) = std::env::var("MEMRING_REMOVE") {
            config.client.remove = remove.to_lowercase() == "true" || remove == "1";
        }

        config
    }
}

/// Parse `a:1,b:2=3` style lists; an `=weight` suffix switches to weighted form
pub fn parse_server_list(raw: &str) -> Option<Servers> {
    let parts: Vec<&str> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    if parts.is_empty() {
        return None;
    }

    if parts.iter().any(|p| p.contains('=')) {
        let mut map = BTreeMap::new();
        for part in parts {
            let (addr, weight) = match part.split_once('=') {
                Some((addr, weight)) => (addr, weight.parse().ok()?),
                None => (part, 1),
            };
            map.insert(addr.to_string(), weight);
        }
        return Some(Servers::Weighted(map));
    }

    if parts.len() == 1 {
        Some(Servers::Single(parts[0].to_string()))
    } else {
        Some(Servers::List(parts.into_iter().map(str::to_string).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.max_key_size, 250);
        assert_eq!(config.max_expiration, 2_592_000);
        assert_eq!(config.max_value, 1_048_576);
        assert_eq!(config.pool_size, 10);
        assert_eq!(config.algorithm, HashAlgorithm::Md5);
        assert_eq!(config.reconnect(), Duration::from_millis(18_000_000));
        assert_eq!(config.timeout(), Duration::from_secs(5));
        assert_eq!(config.retries, 5);
        assert_eq!(config.failures, 5);
        assert_eq!(config.retry(), Duration::from_secs(30));
        assert!(!config.remove);
        assert!(config.failover_servers.is_empty());
        assert!(config.key_compression);
        assert_eq!(config.idle(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_shapes_from_toml() {
        let config: Config = toml::from_str(r#"servers = "10.0.0.1:11211""#).unwrap();
        assert_eq!(config.servers.entries(), vec![("10.0.0.1:11211".to_string(), 1)]);

        let config: Config =
            toml::from_str(r#"servers = ["10.0.0.1:11211", "10.0.0.2:11211"]"#).unwrap();
        assert_eq!(config.servers.entries().len(), 2);

        let config: Config = toml::from_str(
            r#"
            [servers]
            "10.0.0.1:11211" = 1
            "10.0.0.2:11211" = 3
            "#,
        )
        .unwrap();
        assert_eq!(
            config.servers.entries(),
            vec![
                ("10.0.0.1:11211".to_string(), 1),
                ("10.0.0.2:11211".to_string(), 3)
            ]
        );
    }

    #[test]
    fn test_failover_servers_one_or_many() {
        let config: ClientConfig =
            toml::from_str(r#"failover_servers = "10.0.0.9:11211""#).unwrap();
        assert_eq!(config.failover_servers, vec!["10.0.0.9:11211"]);

        let config: ClientConfig =
            toml::from_str(r#"failover_servers = ["10.0.0.8:11211", "10.0.0.9:11211"]"#)
                .unwrap();
        assert_eq!(
            config.failover_servers,
            vec!["10.0.0.8:11211", "10.0.0.9:11211"]
        );

        let config: ClientConfig = serde_json::from_str(r#"{"failover_servers": "a:1"}"#).unwrap();
        assert_eq!(config.failover_servers, vec!["a:1"]);

        assert!(toml::from_str::<ClientConfig>("failover_servers = 3").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            servers = ["127.0.0.1:11211"]

            [client]
            pool_size = 4
            algorithm = "crc32"
            remove = true
            failover_servers = ["127.0.0.1:11311"]
            reconnect_attempts = 3
            "#
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.client.pool_size, 4);
        assert_eq!(config.client.algorithm, HashAlgorithm::Crc32);
        assert!(config.client.remove);
        assert_eq!(config.client.failover_servers, vec!["127.0.0.1:11311"]);
        assert_eq!(config.client.reconnect_attempts, Some(3));
        // Untouched fields keep their defaults
        assert_eq!(config.client.retries, 5);
    }

    #[test]
    fn test_from_file_missing() {
        assert!(Config::from_file("/nonexistent/memring.toml").is_err());
    }

    #[test]
    fn test_parse_server_list() {
        assert_eq!(
            parse_server_list("a:1"),
            Some(Servers::Single("a:1".to_string()))
        );
        assert_eq!(
            parse_server_list("a:1, b:2"),
            Some(Servers::List(vec!["a:1".to_string(), "b:2".to_string()]))
        );

        let weighted = parse_server_list("a:1=2,b:2").unwrap();
        assert_eq!(
            weighted.entries(),
            vec![("a:1".to_string(), 2), ("b:2".to_string(), 1)]
        );

        assert_eq!(parse_server_list(" , "), None);
        assert_eq!(parse_server_list("a:1=x"), None);
    }

    #[test]
    fn test_validate_rejects_zero_pool() {
        let config = ClientConfig {
            pool_size: 0,
            ..ClientConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
