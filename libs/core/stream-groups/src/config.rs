//! Stream group configuration
//!
//! `StreamGroupConfig` is resolved once per registered handler from a
//! [`GroupConfigSource`] and never changes while its workers run.

use core_config::redis::DEFAULT_CONNECTION;
use core_config::{env_or_default, env_parse, env_segment};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::error::StreamError;

const STREAM_KEY_SUFFIX: &str = "Stream";

/// Stream key for a group: the group name followed by `Stream`.
///
/// Publisher and consumers both derive the key this way.
pub fn stream_key(group: &str) -> String {
    format!("{group}{STREAM_KEY_SUFFIX}")
}

/// Resolved configuration for one stream group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamGroupConfig {
    /// Key the configuration was resolved from.
    pub config_key: String,

    /// Consumer group name (also the stream key prefix).
    pub group: String,

    /// Connection used when no explicit pool is configured.
    pub connection_key: String,

    /// Disabled groups get no workers.
    pub enabled: bool,

    /// Blocking read timeout in milliseconds.
    pub read_timeout_ms: u64,

    /// Redeliveries allowed after the first failed attempt.
    pub retry_count: u32,

    /// Worker count override; the handler default applies when unset.
    pub consumer_threads: Option<usize>,

    /// Pool used by the publisher (blank = `connection_key`).
    pub producer_pool: String,

    /// Key expiry applied after each publish.
    pub producer_ttl_secs: Option<u64>,

    /// Approximate trimming bound requested on each publish.
    pub producer_max_len: Option<u64>,

    /// Pool used by the workers (blank = `connection_key`).
    pub consumer_pool: String,

    /// Entries requested per read.
    pub batch_size: usize,

    /// Minimum wait before a failed entry is re-read.
    pub retry_delay_ms: u64,

    /// Idle time after which another consumer's pending entries are taken
    /// over (0 disables claiming).
    pub claim_idle_ms: u64,

    /// Prefix of the consumer names (`<prefix>-<group>-<slot>`).
    pub consumer_prefix: String,
}

impl StreamGroupConfig {
    pub const DEFAULT_READ_TIMEOUT_MS: u64 = 2000;
    pub const DEFAULT_RETRY_COUNT: u32 = 3;
    pub const DEFAULT_BATCH_SIZE: usize = 10;
    pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
    pub const DEFAULT_CLAIM_IDLE_MS: u64 = 30_000;

    /// Create a configuration with defaults for every optional setting.
    pub fn new(config_key: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            config_key: config_key.into(),
            group: group.into(),
            connection_key: DEFAULT_CONNECTION.to_string(),
            enabled: true,
            read_timeout_ms: Self::DEFAULT_READ_TIMEOUT_MS,
            retry_count: Self::DEFAULT_RETRY_COUNT,
            consumer_threads: None,
            producer_pool: String::new(),
            producer_ttl_secs: None,
            producer_max_len: None,
            consumer_pool: String::new(),
            batch_size: Self::DEFAULT_BATCH_SIZE,
            retry_delay_ms: Self::DEFAULT_RETRY_DELAY_MS,
            claim_idle_ms: Self::DEFAULT_CLAIM_IDLE_MS,
            consumer_prefix: default_consumer_prefix(),
        }
    }

    /// Load the configuration for `config_key` from `STREAM_<KEY>_*` variables.
    pub fn from_env(config_key: &str, group: &str) -> Result<Self, StreamError> {
        let prefix = format!("STREAM_{}_", env_segment(config_key));
        let var = |name: &str| format!("{prefix}{name}");
        let defaults = Self::new(config_key, group);

        Ok(Self {
            config_key: config_key.to_string(),
            group: group.to_string(),
            connection_key: env_or_default(&var("CONNECTION_KEY"), &defaults.connection_key),
            enabled: env_parse(&var("ENABLED"))?.unwrap_or(defaults.enabled),
            read_timeout_ms: env_parse(&var("READ_TIMEOUT_MILLIS"))?
                .unwrap_or(defaults.read_timeout_ms),
            retry_count: env_parse(&var("RETRY_COUNT"))?.unwrap_or(defaults.retry_count),
            consumer_threads: env_parse(&var("CONSUMER_THREADS"))?,
            producer_pool: env_or_default(&var("PRODUCER_POOL"), ""),
            producer_ttl_secs: env_parse(&var("PRODUCER_TTL_SECONDS"))?,
            producer_max_len: env_parse(&var("PRODUCER_MAX_LEN"))?,
            consumer_pool: env_or_default(&var("CONSUMER_POOL"), ""),
            batch_size: env_parse(&var("BATCH_SIZE"))?.unwrap_or(defaults.batch_size),
            retry_delay_ms: env_parse(&var("RETRY_DELAY_MILLIS"))?
                .unwrap_or(defaults.retry_delay_ms),
            claim_idle_ms: env_parse(&var("CLAIM_IDLE_MILLIS"))?
                .unwrap_or(defaults.claim_idle_ms),
            consumer_prefix: env_or_default(&var("CONSUMER_PREFIX"), &defaults.consumer_prefix),
        })
    }

    pub fn with_connection_key(mut self, key: impl Into<String>) -> Self {
        self.connection_key = key.into();
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_read_timeout_ms(mut self, timeout: u64) -> Self {
        self.read_timeout_ms = timeout;
        self
    }

    pub fn with_retry_count(mut self, retries: u32) -> Self {
        self.retry_count = retries;
        self
    }

    pub fn with_consumer_threads(mut self, threads: usize) -> Self {
        self.consumer_threads = Some(threads);
        self
    }

    pub fn with_producer_pool(mut self, pool: impl Into<String>) -> Self {
        self.producer_pool = pool.into();
        self
    }

    pub fn with_producer_ttl_secs(mut self, ttl: u64) -> Self {
        self.producer_ttl_secs = Some(ttl);
        self
    }

    pub fn with_producer_max_len(mut self, max_len: u64) -> Self {
        self.producer_max_len = Some(max_len);
        self
    }

    pub fn with_consumer_pool(mut self, pool: impl Into<String>) -> Self {
        self.consumer_pool = pool.into();
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_retry_delay_ms(mut self, delay: u64) -> Self {
        self.retry_delay_ms = delay;
        self
    }

    pub fn with_claim_idle_ms(mut self, idle: u64) -> Self {
        self.claim_idle_ms = idle;
        self
    }

    pub fn with_consumer_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.consumer_prefix = prefix.into();
        self
    }

    /// The stream this group reads from and publishes to.
    pub fn stream_key(&self) -> String {
        stream_key(&self.group)
    }

    /// Worker count: the configured override, else the handler default.
    pub fn effective_threads(&self, default_threads: usize) -> usize {
        self.consumer_threads.unwrap_or(default_threads)
    }

    pub fn consumer_pool_name(&self) -> &str {
        non_blank_or(&self.consumer_pool, &self.connection_key)
    }

    pub fn producer_pool_name(&self) -> &str {
        non_blank_or(&self.producer_pool, &self.connection_key)
    }

    /// Stable consumer identity for a worker slot, so a restarted slot picks
    /// up the entries it left pending.
    ///
    /// `<prefix>-<group>-<slot>`, with the config key inserted before the slot
    /// when it differs from the group: handlers sharing a group must never
    /// share a pending list.
    pub fn consumer_name(&self, slot: usize) -> String {
        if self.config_key == self.group {
            format!("{}-{}-{}", self.consumer_prefix, self.group, slot)
        } else {
            format!(
                "{}-{}-{}-{}",
                self.consumer_prefix, self.group, self.config_key, slot
            )
        }
    }
}

fn non_blank_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() {
        fallback
    } else {
        value
    }
}

fn default_consumer_prefix() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4().simple()))
}

/// Where stream group configurations come from.
pub trait GroupConfigSource: Send + Sync {
    /// Resolve the configuration for a handler's config key and group.
    fn resolve(&self, config_key: &str, group: &str) -> Result<StreamGroupConfig, StreamError>;
}

/// Reads `STREAM_<KEY>_*` environment variables at resolution time.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvGroupConfigs;

impl GroupConfigSource for EnvGroupConfigs {
    fn resolve(&self, config_key: &str, group: &str) -> Result<StreamGroupConfig, StreamError> {
        StreamGroupConfig::from_env(config_key, group)
    }
}

/// In-memory configurations keyed by config key.
#[derive(Debug, Clone, Default)]
pub struct StaticGroupConfigs {
    configs: HashMap<String, StreamGroupConfig>,
}

impl StaticGroupConfigs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a configuration under its own `config_key`.
    pub fn with(mut self, config: StreamGroupConfig) -> Self {
        self.configs.insert(config.config_key.clone(), config);
        self
    }
}

impl GroupConfigSource for StaticGroupConfigs {
    fn resolve(&self, config_key: &str, group: &str) -> Result<StreamGroupConfig, StreamError> {
        let mut config = self
            .configs
            .get(config_key)
            .cloned()
            .ok_or_else(|| StreamError::config(format!("no stream config for key '{config_key}'")))?;
        config.group = group.to_string();
        Ok(config)
    }
}

/// Stream clients by pool name.
#[derive(Clone)]
pub struct ClientPools<C> {
    pools: BTreeMap<String, C>,
}

impl<C> Default for ClientPools<C> {
    fn default() -> Self {
        Self {
            pools: BTreeMap::new(),
        }
    }
}

impl<C: Clone> ClientPools<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single client registered as the default connection.
    pub fn single(client: C) -> Self {
        Self::new().with_pool(DEFAULT_CONNECTION, client)
    }

    pub fn with_pool(mut self, name: impl Into<String>, client: C) -> Self {
        self.pools.insert(name.into(), client);
        self
    }

    /// Look up a pool by name.
    pub fn get(&self, name: &str) -> Result<C, StreamError> {
        self.pools
            .get(name)
            .cloned()
            .ok_or_else(|| StreamError::config(format!("unknown connection pool '{name}'")))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pools.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_key() {
        assert_eq!(stream_key("orders"), "ordersStream");
        assert_eq!(stream_key("a"), "aStream");
        assert_eq!(
            StreamGroupConfig::new("orders", "orders").stream_key(),
            "ordersStream"
        );
    }

    #[test]
    fn test_builder_pattern() {
        let config = StreamGroupConfig::new("orders", "orders")
            .with_connection_key("bus")
            .with_retry_count(2)
            .with_consumer_threads(4)
            .with_producer_max_len(1000)
            .with_producer_ttl_secs(60)
            .with_batch_size(0)
            .with_consumer_prefix("host-a");

        assert_eq!(config.retry_count, 2);
        assert_eq!(config.effective_threads(1), 4);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.producer_max_len, Some(1000));
        assert_eq!(config.producer_ttl_secs, Some(60));
        assert_eq!(config.consumer_pool_name(), "bus");
        assert_eq!(config.producer_pool_name(), "bus");
        assert_eq!(config.consumer_name(2), "host-a-orders-2");
    }

    #[test]
    fn test_consumer_names_differ_per_config_key() {
        let a = StreamGroupConfig::new("orders-a", "orders").with_consumer_prefix("pod");
        let b = StreamGroupConfig::new("orders-b", "orders").with_consumer_prefix("pod");

        assert_eq!(a.consumer_name(0), "pod-orders-orders-a-0");
        assert_ne!(a.consumer_name(0), b.consumer_name(0));
    }

    #[test]
    fn test_effective_threads_default() {
        let config = StreamGroupConfig::new("orders", "orders");
        assert_eq!(config.effective_threads(3), 3);
    }

    #[test]
    fn test_from_env() {
        temp_env::with_vars(
            [
                ("STREAM_ORDERS_V2_ENABLED", Some("false")),
                ("STREAM_ORDERS_V2_READ_TIMEOUT_MILLIS", Some("500")),
                ("STREAM_ORDERS_V2_CLAIM_IDLE_MILLIS", Some("60000")),
                ("STREAM_ORDERS_V2_RETRY_COUNT", Some("5")),
                ("STREAM_ORDERS_V2_CONSUMER_THREADS", Some("3")),
                ("STREAM_ORDERS_V2_PRODUCER_TTL_SECONDS", Some("3600")),
                ("STREAM_ORDERS_V2_CONSUMER_POOL", Some("readers")),
                ("STREAM_ORDERS_V2_CONSUMER_PREFIX", Some("pod-1")),
                ("STREAM_ORDERS_V2_PRODUCER_MAX_LEN", None),
            ],
            || {
                let config = StreamGroupConfig::from_env("orders.v2", "orders").unwrap();
                assert!(!config.enabled);
                assert_eq!(config.read_timeout_ms, 500);
                assert_eq!(config.claim_idle_ms, 60_000);
                assert_eq!(config.retry_count, 5);
                assert_eq!(config.consumer_threads, Some(3));
                assert_eq!(config.producer_ttl_secs, Some(3600));
                assert_eq!(config.producer_max_len, None);
                assert_eq!(config.consumer_pool_name(), "readers");
                assert_eq!(config.producer_pool_name(), DEFAULT_CONNECTION);
                assert_eq!(config.consumer_name(0), "pod-1-orders-orders.v2-0");
            },
        );
    }

    #[test]
    fn test_from_env_rejects_garbage() {
        temp_env::with_var("STREAM_BILLING_RETRY_COUNT", Some("lots"), || {
            let err = EnvGroupConfigs.resolve("billing", "billing").unwrap_err();
            assert!(err.to_string().contains("STREAM_BILLING_RETRY_COUNT"));
        });
    }

    #[test]
    fn test_static_configs() {
        let source = StaticGroupConfigs::new()
            .with(StreamGroupConfig::new("orders", "placeholder").with_retry_count(1));

        let resolved = source.resolve("orders", "orders-eu").unwrap();
        assert_eq!(resolved.group, "orders-eu");
        assert_eq!(resolved.retry_count, 1);
        assert!(source.resolve("missing", "x").is_err());
    }

    #[test]
    fn test_client_pools() {
        let pools = ClientPools::single("main").with_pool("readers", "replica");

        assert_eq!(pools.get(DEFAULT_CONNECTION).unwrap(), "main");
        assert_eq!(pools.get("readers").unwrap(), "replica");
        assert!(matches!(pools.get("nope"), Err(StreamError::Config(_))));
        assert_eq!(pools.names().count(), 2);
    }
}
