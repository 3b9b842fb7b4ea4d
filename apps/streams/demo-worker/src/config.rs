//! Configuration for the demo worker

use core_config::redis::RedisConfig;
use core_config::{ConfigError, FromEnv, env_parse};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub redis: RedisConfig,

    /// Workers for the orders group unless `STREAM_ORDERS_CONSUMER_THREADS` overrides it
    pub orders_threads: usize,

    /// Workers for the audit group unless `STREAM_AUDIT_CONSUMER_THREADS` overrides it
    pub audit_threads: usize,

    /// How long shutdown waits for in-flight dispatches
    pub shutdown_timeout: Duration,
}

const DEFAULT_ORDERS_THREADS: usize = 2;
const DEFAULT_AUDIT_THREADS: usize = 1;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

impl FromEnv for Config {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            redis: RedisConfig::from_env()?,
            orders_threads: env_parse("DEMO_ORDERS_THREADS")?.unwrap_or(DEFAULT_ORDERS_THREADS),
            audit_threads: env_parse("DEMO_AUDIT_THREADS")?.unwrap_or(DEFAULT_AUDIT_THREADS),
            shutdown_timeout: Duration::from_secs(
                env_parse("DEMO_SHUTDOWN_TIMEOUT_SECS")?.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            ),
        })
    }
}
