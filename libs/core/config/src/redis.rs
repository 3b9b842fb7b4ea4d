use crate::{env_or_default, env_segment, ConfigError, FromEnv};
use std::collections::BTreeMap;
use std::env;

/// Name of the connection used when a stream group does not ask for one.
pub const DEFAULT_CONNECTION: &str = "default";

/// Redis configuration
///
/// `REDIS_URL` configures the default connection. Additional named connections
/// are read from `REDIS_URL_<NAME>` (e.g. `REDIS_URL_EVENTS` becomes `events`).
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub url: String,
    pub named: BTreeMap<String, String>,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            named: BTreeMap::new(),
        }
    }

    /// Add a named connection.
    pub fn with_connection(mut self, name: impl Into<String>, url: impl Into<String>) -> Self {
        self.named.insert(name.into(), url.into());
        self
    }

    /// Resolve the URL for a connection name, falling back to the default URL.
    pub fn url_for(&self, name: &str) -> &str {
        self.named
            .get(name)
            .or_else(|| self.named.get(&env_segment(name).to_ascii_lowercase()))
            .map(String::as_str)
            .unwrap_or(&self.url)
    }

    /// All connection names, the default one included.
    pub fn connection_names(&self) -> Vec<String> {
        let mut names = vec![DEFAULT_CONNECTION.to_string()];
        names.extend(self.named.keys().filter(|k| *k != DEFAULT_CONNECTION).cloned());
        names
    }
}

impl FromEnv for RedisConfig {
    /// Reads `REDIS_URL` (default `redis://127.0.0.1:6379`) and every `REDIS_URL_<NAME>`.
    fn from_env() -> Result<Self, ConfigError> {
        let url = env_or_default("REDIS_URL", "redis://127.0.0.1:6379");
        let named = env::vars()
            .filter_map(|(key, value)| {
                key.strip_prefix("REDIS_URL_")
                    .filter(|name| !name.is_empty())
                    .map(|name| (name.to_ascii_lowercase(), value))
            })
            .collect();

        Ok(Self { url, named })
    }
}
