//! Datasource configuration
//!
//! A datasource descriptor carries the driver locator, the connection
//! URL, credentials and the pool tuning knobs. It can be built in code,
//! parsed from a string property bag (`from_props`) or loaded from a
//! TOML file (`from_file`). Timeouts are written in whole seconds in
//! both external forms; in code they are [`Duration`]s.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Hard upper bound on live connections, unless configured.
pub const DEFAULT_POOL_SIZE: u32 = 10;
/// Idle lifespan, unless configured.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(1800);
/// Maximum borrow wait, unless configured.
pub const DEFAULT_BORROW_TIMEOUT: Duration = Duration::from_secs(3);
/// "Driver default" sentinel for the lock timeout session setting.
pub const DEFAULT_LOCK_TIMEOUT: i64 = -1;

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Errors raised while building or parsing a descriptor.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required key is absent.
    #[error("missing required key '{0}'")]
    Missing(&'static str),

    /// A key holds a value that does not parse or is out of range.
    #[error("invalid value for '{key}': {value}")]
    Invalid {
        /// Offending key.
        key: &'static str,
        /// Offending value.
        value: String,
    },

    /// The descriptor file cannot be read.
    #[error("cannot read config file '{path}': {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The descriptor file cannot be parsed.
    #[error("cannot parse config file '{path}': {source}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// Underlying TOML failure.
        #[source]
        source: toml::de::Error,
    },
}

/// Datasource descriptor.
///
/// # Example
///
/// ```toml
/// driver = "memory"
/// url = "memory:orders"
/// user = "app"
/// password = "secret"
/// # seconds
/// keep-alive = 1800
/// borrow-timeout = 3
/// # driver-native units; -1 keeps the driver default
/// lock-timeout = -1
/// pool-size = 10
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Driver locator; informational, the driver instance is passed to
    /// the datasource constructor.
    #[serde(default)]
    pub driver: Option<String>,

    /// Connection URL handed to the driver.
    pub url: String,

    /// User name for the driver, if any.
    #[serde(default)]
    pub user: Option<String>,

    /// Password for the driver, if any.
    #[serde(default)]
    pub password: Option<String>,

    /// Idle lifespan; connections unused longer than this are destroyed
    /// by the idle sweep.
    #[serde(
        rename = "keep-alive",
        default = "default_keep_alive",
        with = "duration_secs"
    )]
    pub keep_alive: Duration,

    /// Maximum time a borrower waits for a free connection.
    #[serde(
        rename = "borrow-timeout",
        default = "default_borrow_timeout",
        with = "duration_secs"
    )]
    pub borrow_timeout: Duration,

    /// When non-negative, executed as `SET LOCK_TIMEOUT <n>` on each
    /// newly opened connection. Failure is logged and swallowed.
    #[serde(rename = "lock-timeout", default = "default_lock_timeout")]
    pub lock_timeout: i64,

    /// Hard upper bound on live connections.
    #[serde(rename = "pool-size", default = "default_pool_size")]
    pub pool_size: u32,
}

fn default_keep_alive() -> Duration {
    DEFAULT_KEEP_ALIVE
}

fn default_borrow_timeout() -> Duration {
    DEFAULT_BORROW_TIMEOUT
}

fn default_lock_timeout() -> i64 {
    DEFAULT_LOCK_TIMEOUT
}

fn default_pool_size() -> u32 {
    DEFAULT_POOL_SIZE
}

impl PoolConfig {
    /// Descriptor for the given URL with every knob at its default.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            driver: None,
            url: url.into(),
            user: None,
            password: None,
            keep_alive: DEFAULT_KEEP_ALIVE,
            borrow_timeout: DEFAULT_BORROW_TIMEOUT,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            pool_size: DEFAULT_POOL_SIZE,
        }
    }

    /// Set the pool size.
    pub fn with_pool_size(mut self, pool_size: u32) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Set the borrow timeout.
    pub fn with_borrow_timeout(mut self, timeout: Duration) -> Self {
        self.borrow_timeout = timeout;
        self
    }

    /// Set the idle lifespan.
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Set the lock-timeout session setting.
    pub fn with_lock_timeout(mut self, lock_timeout: i64) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Set the credentials.
    pub fn with_credentials(
        mut self,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    /// Build a descriptor from a string property bag.
    ///
    /// Unknown keys are ignored; missing keys fall back to the defaults
    /// above. Only `url` is required.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Missing`] without a `url`;
    /// [`ConfigError::Invalid`] when a numeric value does not parse.
    pub fn from_props(props: &HashMap<String, String>) -> Result<Self, ConfigError> {
        fn parse<T: std::str::FromStr>(
            props: &HashMap<String, String>,
            key: &'static str,
        ) -> Result<Option<T>, ConfigError> {
            props
                .get(key)
                .map(|v| {
                    v.parse::<T>().map_err(|_| ConfigError::Invalid {
                        key,
                        value: v.clone(),
                    })
                })
                .transpose()
        }

        let url = props
            .get("url")
            .cloned()
            .ok_or(ConfigError::Missing("url"))?;

        let config = Self {
            driver: props.get("driver").cloned(),
            url,
            user: props.get("user").cloned(),
            password: props.get("password").cloned(),
            keep_alive: parse::<u64>(props, "keep-alive")?
                .map_or(DEFAULT_KEEP_ALIVE, Duration::from_secs),
            borrow_timeout: parse::<u64>(props, "borrow-timeout")?
                .map_or(DEFAULT_BORROW_TIMEOUT, Duration::from_secs),
            lock_timeout: parse::<i64>(props, "lock-timeout")?.unwrap_or(DEFAULT_LOCK_TIMEOUT),
            pool_size: parse::<u32>(props, "pool-size")?.unwrap_or(DEFAULT_POOL_SIZE),
        };
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a descriptor from a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] when the file cannot be read,
    /// [`ConfigError::Parse`] when it does not parse, or a validation
    /// error as for [`PoolConfig::from_props`].
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: PoolConfig = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Default descriptor file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Datasource descriptor
#
# driver  = locator of the driver, informational
# url     = connection URL handed to the driver (required)
url = ""

# Credentials, both optional.
# user = "app"
# password = "secret"

# Idle lifespan in seconds. Connections unused longer than this are
# destroyed by the idle sweep.
keep-alive = 1800

# Maximum time in seconds a borrower waits for a free connection.
borrow-timeout = 3

# Executed as `SET LOCK_TIMEOUT <n>` on every new connection when >= 0.
# -1 keeps the driver default.
lock-timeout = -1

# Hard upper bound on live connections.
pool-size = 10
"#
    }

    /// Check the descriptor for values the pool cannot run with.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] for a zero pool size,
    /// [`ConfigError::Missing`] for an empty URL.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::Missing("url"));
        }
        if self.pool_size == 0 {
            return Err(ConfigError::Invalid {
                key: "pool-size",
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn new_applies_defaults() {
        let config = PoolConfig::new("memory:test");
        assert_eq!(config.pool_size, 10);
        assert_eq!(config.keep_alive, Duration::from_secs(1800));
        assert_eq!(config.borrow_timeout, Duration::from_secs(3));
        assert_eq!(config.lock_timeout, -1);
    }

    #[test]
    fn from_props_parses_all_keys() {
        let config = PoolConfig::from_props(&props(&[
            ("driver", "memory"),
            ("url", "memory:test"),
            ("user", "app"),
            ("password", "secret"),
            ("keep-alive", "60"),
            ("borrow-timeout", "5"),
            ("lock-timeout", "2000"),
            ("pool-size", "4"),
        ]))
        .unwrap();

        assert_eq!(config.driver.as_deref(), Some("memory"));
        assert_eq!(config.user.as_deref(), Some("app"));
        assert_eq!(config.keep_alive, Duration::from_secs(60));
        assert_eq!(config.borrow_timeout, Duration::from_secs(5));
        assert_eq!(config.lock_timeout, 2000);
        assert_eq!(config.pool_size, 4);
    }

    #[test]
    fn from_props_requires_url() {
        assert!(matches!(
            PoolConfig::from_props(&props(&[("pool-size", "4")])),
            Err(ConfigError::Missing("url"))
        ));
    }

    #[test]
    fn from_props_rejects_bad_numbers() {
        let result = PoolConfig::from_props(&props(&[
            ("url", "memory:test"),
            ("pool-size", "many"),
        ]));
        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                key: "pool-size",
                ..
            })
        ));
    }

    #[test]
    fn zero_pool_size_is_invalid() {
        let result =
            PoolConfig::from_props(&props(&[("url", "memory:test"), ("pool-size", "0")]));
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn toml_round_trip_uses_hyphenated_keys_and_seconds() {
        let config = PoolConfig::new("memory:test")
            .with_pool_size(3)
            .with_keep_alive(Duration::from_secs(120));

        let text = toml::to_string_pretty(&config).unwrap();
        assert!(text.contains("keep-alive = 120"));
        assert!(text.contains("pool-size = 3"));

        let parsed: PoolConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.keep_alive, Duration::from_secs(120));
        assert_eq!(parsed.pool_size, 3);
    }

    #[test]
    fn minimal_toml_uses_defaults() {
        let parsed: PoolConfig = toml::from_str("url = \"memory:test\"").unwrap();
        assert_eq!(parsed.pool_size, DEFAULT_POOL_SIZE);
        assert_eq!(parsed.borrow_timeout, DEFAULT_BORROW_TIMEOUT);
    }

    #[test]
    fn from_file_reads_descriptor() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("orders.toml");
        std::fs::write(&path, "url = \"memory:orders\"\npool-size = 2\n").unwrap();

        let config = PoolConfig::from_file(&path).unwrap();
        assert_eq!(config.url, "memory:orders");
        assert_eq!(config.pool_size, 2);
    }

    #[test]
    fn from_file_reports_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = PoolConfig::from_file(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn default_toml_template_parses() {
        let parsed: PoolConfig = toml::from_str(PoolConfig::default_toml()).unwrap();
        // The template leaves the URL for the operator to fill in.
        assert!(parsed.url.is_empty());
        assert_eq!(parsed.pool_size, DEFAULT_POOL_SIZE);
    }
}
