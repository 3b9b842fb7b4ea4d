//! Bootstrap and shutdown of the worker sets
//!
//! [`Bootstrap::start`] resolves the configuration of every registered
//! handler, starts `threads` workers per enabled group and hands back a
//! [`RunningGroups`] that owns them until shutdown.
//!
//! # Example
//!
//! ```rust,ignore
//! let running = Bootstrap::new(pools, registry)
//!     .with_config_source(Arc::new(EnvGroupConfigs))
//!     .start()?;
//!
//! tokio::signal::ctrl_c().await?;
//! running.shutdown().await;
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span};

use crate::client::StreamClient;
use crate::config::{ClientPools, EnvGroupConfigs, GroupConfigSource, StreamGroupConfig};
use crate::dispatcher::{AcknowledgeAndLog, ExhaustionPolicy};
use crate::error::StreamError;
use crate::events::{EventSink, MetricsSink};
use crate::lifecycle::LifecycleCoordinator;
use crate::registry::{HandlerDescriptor, HandlerRegistry};
use crate::worker::ConsumerWorker;

/// A group that will get workers, with its resolved settings.
#[derive(Debug, Clone)]
pub struct GroupPlan {
    pub descriptor: HandlerDescriptor,
    pub config: Arc<StreamGroupConfig>,
    pub threads: usize,
}

/// Starts consumer workers for registered handlers.
pub struct Bootstrap<C> {
    pools: ClientPools<C>,
    registry: HandlerRegistry,
    configs: Arc<dyn GroupConfigSource>,
    events: Arc<dyn EventSink>,
    policy: Arc<dyn ExhaustionPolicy>,
}

impl<C: StreamClient> Bootstrap<C> {
    /// Bootstrap with configuration read from the environment.
    pub fn new(pools: ClientPools<C>, registry: HandlerRegistry) -> Self {
        Self {
            pools,
            registry,
            configs: Arc::new(EnvGroupConfigs),
            events: Arc::new(MetricsSink),
            policy: Arc::new(AcknowledgeAndLog),
        }
    }

    pub fn with_config_source(mut self, configs: Arc<dyn GroupConfigSource>) -> Self {
        self.configs = configs;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_exhaustion_policy(mut self, policy: Arc<dyn ExhaustionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Resolve every descriptor's configuration. Disabled groups are left out.
    ///
    /// Fails on the first unresolvable configuration or unknown pool, so
    /// nothing starts half-configured.
    pub fn plan(&self) -> Result<Vec<GroupPlan>, StreamError> {
        let mut plans = Vec::with_capacity(self.registry.len());

        for descriptor in self.registry.descriptors() {
            let config = self
                .configs
                .resolve(&descriptor.config_key, &descriptor.group)?;

            if !config.enabled {
                info!(
                    group = %descriptor.group,
                    config_key = %descriptor.config_key,
                    "Stream group disabled, no workers started"
                );
                continue;
            }

            self.pools.get(config.consumer_pool_name())?;

            let threads = config.effective_threads(descriptor.default_threads);
            plans.push(GroupPlan {
                descriptor: descriptor.clone(),
                config: Arc::new(config),
                threads,
            });
        }

        Ok(plans)
    }

    /// Start the workers. Must be called inside a Tokio runtime.
    pub fn start(self) -> Result<RunningGroups, StreamError> {
        let plans = self.plan()?;
        let coordinator = Arc::new(LifecycleCoordinator::new().with_events(self.events.clone()));

        // Every slot is taken before the first worker runs, so an early exit
        // cannot drain the coordinator while others are still starting.
        let mut pending = Vec::new();
        for plan in &plans {
            let client = self.pools.get(plan.config.consumer_pool_name())?;
            for slot_index in 0..plan.threads {
                let worker = ConsumerWorker::new(
                    client.clone(),
                    Arc::clone(&plan.config),
                    slot_index,
                    Arc::clone(&plan.descriptor.handler),
                )
                .with_events(self.events.clone())
                .with_exhaustion_policy(self.policy.clone());
                let slot = coordinator.register()?;
                pending.push((plan.config.group.clone(), worker, slot));
            }
        }

        let mut workers = Vec::with_capacity(pending.len());
        for (group, worker, slot) in pending {
            let span = info_span!("stream_worker", group = %group, consumer = %worker.consumer_name());
            let handle = tokio::spawn(worker.run(slot).instrument(span));
            workers.push(RunningWorker { group, handle });
        }

        for plan in &plans {
            info!(
                group = %plan.config.group,
                stream = %plan.config.stream_key(),
                threads = plan.threads,
                pool = %plan.config.consumer_pool_name(),
                "Stream group started"
            );
        }
        info!(
            groups = plans.len(),
            workers = coordinator.active_workers(),
            "Stream consumers running"
        );

        Ok(RunningGroups {
            coordinator,
            workers,
        })
    }
}

struct RunningWorker {
    group: String,
    handle: JoinHandle<()>,
}

/// Workers started by [`Bootstrap::start`].
pub struct RunningGroups {
    coordinator: Arc<LifecycleCoordinator>,
    workers: Vec<RunningWorker>,
}

impl RunningGroups {
    /// Workers that have not terminated yet, across all groups.
    pub fn active_workers(&self) -> usize {
        self.coordinator.active_workers()
    }

    /// Workers of `group` whose task is still running.
    pub fn active_workers_for(&self, group: &str) -> usize {
        self.workers
            .iter()
            .filter(|w| w.group == group && !w.handle.is_finished())
            .count()
    }

    pub fn coordinator(&self) -> &Arc<LifecycleCoordinator> {
        &self.coordinator
    }

    /// Stop every worker and wait for all of them to finish their current dispatch.
    pub async fn shutdown(self) {
        info!(active = self.active_workers(), "Shutting down stream consumers");
        self.coordinator.stop().await;
        join_all(self.workers).await;
    }

    /// Like [`shutdown`](Self::shutdown), giving up after `timeout`.
    ///
    /// Returns `false` when workers were still busy; their tasks keep running
    /// detached.
    pub async fn shutdown_timeout(self, timeout: Duration) -> bool {
        info!(active = self.active_workers(), timeout_ms = timeout.as_millis() as u64, "Shutting down stream consumers");
        if !self.coordinator.stop_timeout(timeout).await {
            error!(
                active = self.active_workers(),
                "Stream consumers did not stop in time"
            );
            return false;
        }
        join_all(self.workers).await;
        true
    }
}

async fn join_all(workers: Vec<RunningWorker>) {
    for worker in workers {
        if let Err(e) = worker.handle.await
            && e.is_panic()
        {
            error!(group = %worker.group, "Consumer worker panicked");
        }
    }
}
