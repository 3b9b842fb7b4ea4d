//! Streams Demo Worker
//!
//! Hosts two consumer groups on Redis Streams and can publish test messages
//! to them.
//!
//! ## Architecture
//!
//! ```text
//! publish ──► ordersStream ──(group: orders, N workers)──► OrderHandler
//!        └──► auditStream  ──(group: audit,  M workers)──► AuditHandler
//! ```
//!
//! Group settings come from `STREAM_<KEY>_*` variables, Redis connections
//! from `REDIS_URL` and `REDIS_URL_<NAME>`.

pub mod config;
pub mod handlers;

use eyre::{Result, WrapErr};
use std::sync::Arc;
use stream_groups::{
    Bootstrap, ClientPools, FanoutSink, HandlerDescriptor, HandlerRegistry, MetricsSink,
    Publisher, RedisStreamClient, StreamClient, StreamGroupConfig, TracingSink, flow,
};
use tokio::signal;
use tracing::{info, warn};

use config::Config;
use handlers::{AUDIT_GROUP, AuditHandler, ORDERS_GROUP, OrderHandler};

/// Handlers served by this process.
pub fn registry(config: &Config) -> Result<HandlerRegistry> {
    let registry = HandlerRegistry::new()
        .with(HandlerDescriptor::new(
            ORDERS_GROUP,
            ORDERS_GROUP,
            config.orders_threads,
            Arc::new(OrderHandler),
        ))?
        .with(HandlerDescriptor::new(
            AUDIT_GROUP,
            AUDIT_GROUP,
            config.audit_threads,
            Arc::new(AuditHandler),
        ))?;
    Ok(registry)
}

/// Consume until SIGINT or SIGTERM, then drain.
pub async fn consume(config: Config) -> Result<()> {
    info!("Connecting to Redis...");
    let pools = RedisStreamClient::connect_pools(&config.redis)
        .await
        .wrap_err("Failed to connect to Redis")?;
    info!(pools = ?pools.names().collect::<Vec<_>>(), "Connected to Redis successfully");

    consume_with(pools, &config, shutdown_signal()).await
}

/// Run the registered groups on `pools` until `shutdown` resolves.
pub async fn consume_with<C: StreamClient>(
    pools: ClientPools<C>,
    config: &Config,
    shutdown: impl Future<Output = Result<()>>,
) -> Result<()> {
    let events = FanoutSink::new()
        .with(Arc::new(MetricsSink))
        .with(Arc::new(TracingSink));

    let running = Bootstrap::new(pools, registry(config)?)
        .with_events(Arc::new(events))
        .start()
        .wrap_err("Failed to start stream consumers")?;

    shutdown.await?;

    if !running.shutdown_timeout(config.shutdown_timeout).await {
        warn!(
            timeout_secs = config.shutdown_timeout.as_secs(),
            "Shutdown timed out, in-flight entries stay pending"
        );
    }
    info!("Streams demo worker stopped");
    Ok(())
}

/// Publish `count` copies of `message` to `group`, all under one flow id.
pub async fn publish(
    config: Config,
    group: &str,
    message: &str,
    count: usize,
    params: &[(String, String)],
) -> Result<()> {
    let group_config = StreamGroupConfig::from_env(group, group)?;
    let pools = RedisStreamClient::connect_pools(&config.redis)
        .await
        .wrap_err("Failed to connect to Redis")?;
    let publisher = Publisher::from_config(&pools, &group_config)?;

    let params: Vec<(&str, &str)> = params
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();

    let flow_id = format!("demo-{}", std::process::id());
    flow::with_flow_id(&flow_id, async {
        for _ in 0..count {
            let id = publisher
                .publish(group, message, &params)
                .await
                .wrap_err_with(|| format!("Failed to publish to '{group}'"))?;
            info!(group = %group, entry_id = %id, "Published");
        }
        Ok::<_, eyre::Report>(())
    })
    .await?;

    info!(group = %group, count, flow_id = %flow_id, "Publishing done");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
pub async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async { signal::ctrl_c().await.wrap_err("Failed to listen for Ctrl+C") };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install SIGTERM handler")?
            .recv()
            .await;
        Ok::<_, eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_config::redis::RedisConfig;
    use std::time::Duration;
    use stream_groups::InMemoryStreamClient;

    fn config() -> Config {
        Config {
            redis: RedisConfig::new("redis://unused:6379"),
            orders_threads: 2,
            audit_threads: 1,
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_registry_contains_both_groups() {
        let registry = registry(&config()).unwrap();
        let groups: Vec<_> = registry.descriptors().iter().map(|d| d.group.as_str()).collect();
        assert_eq!(groups, vec!["orders", "audit"]);
    }

    #[tokio::test]
    async fn test_consume_with_drains_on_shutdown() {
        let client = InMemoryStreamClient::new();
        let publisher = Publisher::new(client.clone(), Default::default());
        publisher
            .publish(ORDERS_GROUP, r#"{"id":1,"amount_cents":500}"#, &[])
            .await
            .unwrap();

        let observer = client.clone();
        let shutdown = async move {
            // The group is created on startup, so the pre-published entry is read from `0`.
            while observer.ack_count("ordersStream", ORDERS_GROUP) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Ok::<_, eyre::Report>(())
        };

        consume_with(ClientPools::single(client.clone()), &config(), shutdown)
            .await
            .unwrap();

        assert_eq!(client.ack_count("ordersStream", ORDERS_GROUP), 1);
        assert_eq!(client.pending_count("ordersStream", ORDERS_GROUP), 0);
    }
}
