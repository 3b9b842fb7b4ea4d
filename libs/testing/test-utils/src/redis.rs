//! Redis test infrastructure
//!
//! Provides a `TestRedis` helper that starts a Redis container and a few
//! stream inspection queries for assertions.

use redis::Client;
use redis::aio::MultiplexedConnection;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

/// Test Redis wrapper that ensures proper cleanup
///
/// The container is automatically stopped and removed when this struct is dropped.
pub struct TestRedis {
    #[allow(dead_code)]
    container: ContainerAsync<Redis>,
    connection: MultiplexedConnection,
    pub connection_string: String,
}

impl TestRedis {
    /// Create a new test Redis instance (Redis 8 Alpine).
    pub async fn new() -> Self {
        let container = Redis::default()
            .with_tag("8-alpine")
            .start()
            .await
            .expect("Failed to start Redis container");

        let host_port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");

        let connection_string = format!("redis://127.0.0.1:{}", host_port);

        let client =
            Client::open(connection_string.clone()).expect("Failed to create Redis client");

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .expect("Failed to connect to Redis");

        tracing::info!(port = host_port, "Test Redis ready (Redis 8-alpine)");

        Self {
            container,
            connection,
            connection_string,
        }
    }

    /// Get a cloned connection for raw commands
    pub fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    /// Get the connection string for manual client creation
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Number of entries in a stream (`XLEN`).
    pub async fn stream_len(&self, key: &str) -> usize {
        redis::cmd("XLEN")
            .arg(key)
            .query_async(&mut self.connection())
            .await
            .expect("XLEN failed")
    }

    /// Entries delivered to `group` and not yet acknowledged.
    pub async fn pending_count(&self, key: &str, group: &str) -> usize {
        let (count, _, _, _): (usize, Option<String>, Option<String>, redis::Value) =
            redis::cmd("XPENDING")
                .arg(key)
                .arg(group)
                .query_async(&mut self.connection())
                .await
                .expect("XPENDING failed");
        count
    }

    /// Remaining time-to-live of a key in seconds (`-1` without expiry).
    pub async fn ttl(&self, key: &str) -> i64 {
        redis::cmd("TTL")
            .arg(key)
            .query_async(&mut self.connection())
            .await
            .expect("TTL failed")
    }
}

// Container is automatically cleaned up when TestRedis is dropped
impl Drop for TestRedis {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test Redis container");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_stream_inspection() {
        let redis = TestRedis::new().await;
        let mut conn = redis.connection();

        let _: () = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg("smokeStream")
            .arg("smoke")
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await
            .unwrap();
        let _: String = redis::cmd("XADD")
            .arg("smokeStream")
            .arg("*")
            .arg("message")
            .arg("hello")
            .query_async(&mut conn)
            .await
            .unwrap();

        assert_eq!(redis.stream_len("smokeStream").await, 1);
        assert_eq!(redis.pending_count("smokeStream", "smoke").await, 0);
        assert_eq!(redis.ttl("smokeStream").await, -1);
    }
}
