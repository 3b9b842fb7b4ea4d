//! Stream Consumer Groups
//!
//! Consumer-group orchestration and publish/consume over Redis Streams.
//!
//! ## Features
//!
//! - **Publisher**: appends messages with flow id, optional trimming and TTL
//! - **Consumer workers**: `threads` workers per group, each running a
//!   read → dispatch → ack/retry loop with startup recovery of its own pending entries
//! - **Bounded redelivery**: failed entries are retried up to `retry_count` times,
//!   then handed to an exhaustion policy
//! - **Graceful shutdown**: the lifecycle coordinator waits for every worker to
//!   finish its current dispatch, and releases its completion signal exactly once
//! - **Events**: typed stream events, forwarded to the `metrics` facade by default
//!
//! ## Example
//!
//! ```ignore
//! use stream_groups::{
//!     Bootstrap, HandlerDescriptor, HandlerRegistry, Publisher, RedisStreamClient,
//!     StreamGroupConfig, handler_fn,
//! };
//!
//! let pools = RedisStreamClient::connect_pools(&redis_config).await?;
//!
//! let registry = HandlerRegistry::new().with(HandlerDescriptor::new(
//!     "orders",
//!     "orders",
//!     2,
//!     Arc::new(handler_fn("orders", |entry| async move {
//!         tracing::info!(message = ?entry.message(), "Got order");
//!         Ok(())
//!     })),
//! ))?;
//!
//! let running = Bootstrap::new(pools.clone(), registry).start()?;
//!
//! let publisher = Publisher::from_config(&pools, &StreamGroupConfig::from_env("orders", "orders")?)?;
//! publisher.publish("orders", r#"{"id":1}"#, &[]).await?;
//!
//! running.shutdown().await;
//! ```

mod bootstrap;
mod client;
mod config;
mod dispatcher;
mod entry;
mod error;
mod events;
pub mod flow;
mod lifecycle;
pub mod memory;
mod publisher;
mod registry;
mod worker;

// Re-export main types
pub use bootstrap::{Bootstrap, GroupPlan, RunningGroups};
pub use client::{ClaimIdle, ReadFrom, ReadGroup, RedisStreamClient, StreamClient};
pub use config::{
    ClientPools, EnvGroupConfigs, GroupConfigSource, StaticGroupConfigs, StreamGroupConfig,
    stream_key,
};
pub use dispatcher::{
    AcknowledgeAndLog, Dispatcher, Disposition, ExhaustionDecision, ExhaustionPolicy, FnHandler,
    LeavePending, RetryTracker, StreamHandler, handler_fn,
};
pub use entry::{EntryId, MessageKey, StreamEntry};
pub use error::{ErrorCategory, HandlerError, StreamError};
pub use events::{EventSink, FanoutSink, MetricsSink, NoopSink, StreamEvent, TracingSink};
pub use lifecycle::{LifecycleCoordinator, WorkerSlot};
pub use memory::InMemoryStreamClient;
pub use publisher::{ProducerSettings, Publisher};
pub use registry::{HandlerDescriptor, HandlerRegistry};
pub use worker::{ConsumerWorker, WorkerState};
