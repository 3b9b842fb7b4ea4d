//! Consumer worker
//!
//! One worker per consumer slot. Each runs the read → dispatch → ack/retry
//! loop for its group until the coordinator asks it to stop:
//!
//! ```text
//! Init ─► EnsureGroup ─► Read ─► Dispatch ─► AckOrRetry ─┐
//!              ▲          ▲ │                             │
//!              └─NOGROUP──┘ └─────────────◄───────────────┘
//!                     (any state) ─► Stopping ─► Stopped
//! ```
//!
//! Reads alternate between a scan of this consumer's own pending entries
//! (at startup and when a failed entry is due for another attempt) and a
//! blocking read of new entries. Every `claim_idle_ms` the worker also takes
//! over entries left pending by consumers that went away.

use std::sync::Arc;
use std::time::Duration;
use strum::{AsRefStr, Display};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::client::{ClaimIdle, ReadFrom, ReadGroup, StreamClient};
use crate::config::StreamGroupConfig;
use crate::dispatcher::{Dispatcher, Disposition, ExhaustionPolicy, StreamHandler};
use crate::entry::{EntryId, StreamEntry};
use crate::error::StreamError;
use crate::events::{EventSink, MetricsSink, StreamEvent};
use crate::lifecycle::{LifecycleCoordinator, WorkerSlot};

/// How often an idle worker rescans its pending list for deliveries it never saw.
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Shortest wait after a store failure.
const MIN_PAUSE: Duration = Duration::from_millis(100);

/// Where a worker is in its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum WorkerState {
    Init,
    EnsureGroup,
    Read,
    Dispatch,
    AckOrRetry,
    Stopping,
    Stopped,
}

#[derive(Debug, Default)]
struct PendingScan {
    cursor: Option<EntryId>,
    seen: Vec<EntryId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    New,
    Pending,
    Claimed,
}

/// One read: entries to dispatch, and pending entries that only await an ack.
struct Batch {
    source: Source,
    dispatch: Vec<StreamEntry>,
    unacked: Vec<EntryId>,
}

/// A single consumer of a stream group.
pub struct ConsumerWorker<C> {
    client: C,
    config: Arc<StreamGroupConfig>,
    key: String,
    consumer: String,
    dispatcher: Dispatcher,
    events: Arc<dyn EventSink>,
    state: WorkerState,
    scan: PendingScan,
    last_sweep: Instant,
    last_claim: Option<Instant>,
}

impl<C: StreamClient> ConsumerWorker<C> {
    /// A worker for slot `slot` of the group described by `config`.
    pub fn new(
        client: C,
        config: Arc<StreamGroupConfig>,
        slot: usize,
        handler: Arc<dyn StreamHandler>,
    ) -> Self {
        let dispatcher = Dispatcher::new(
            config.group.clone(),
            handler,
            config.retry_count,
            Duration::from_millis(config.retry_delay_ms),
        );

        Self {
            client,
            key: config.stream_key(),
            consumer: config.consumer_name(slot),
            config,
            dispatcher,
            events: Arc::new(MetricsSink),
            state: WorkerState::Init,
            scan: PendingScan::default(),
            last_sweep: Instant::now(),
            last_claim: None,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_exhaustion_policy(mut self, policy: Arc<dyn ExhaustionPolicy>) -> Self {
        self.dispatcher = self.dispatcher.with_policy(policy);
        self
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Run until a stop is requested or an unrecoverable error occurs.
    ///
    /// The slot is released when this returns, and also if the task panics.
    pub async fn run(mut self, slot: WorkerSlot) {
        let coordinator = Arc::clone(slot.coordinator());

        info!(
            group = %self.config.group,
            stream = %self.key,
            consumer = %self.consumer,
            handler = self.dispatcher.handler_name(),
            retry_count = self.config.retry_count,
            "Starting consumer worker"
        );
        self.events.emit(&StreamEvent::WorkerStarted {
            group: self.config.group.clone(),
            consumer: self.consumer.clone(),
        });

        match self.run_loop(&coordinator).await {
            Ok(()) => {
                info!(group = %self.config.group, consumer = %self.consumer, "Consumer worker stopped");
                self.events.emit(&StreamEvent::WorkerStopped {
                    group: self.config.group.clone(),
                    consumer: self.consumer.clone(),
                });
            }
            Err(e) => {
                error!(
                    group = %self.config.group,
                    consumer = %self.consumer,
                    state = %self.state,
                    error = %e,
                    "Consumer worker died, slot will not be replaced"
                );
                self.events.emit(&StreamEvent::WorkerDied {
                    group: self.config.group.clone(),
                    consumer: self.consumer.clone(),
                    error: e.to_string(),
                });
            }
        }

        self.transition(WorkerState::Stopped);
        drop(slot);
    }

    async fn run_loop(&mut self, coordinator: &LifecycleCoordinator) -> Result<(), StreamError> {
        loop {
            if coordinator.is_stop_requested() {
                self.transition(WorkerState::Stopping);
                return Ok(());
            }

            match self.state {
                WorkerState::Init => match self.client.pinned().await {
                    Ok(client) => {
                        self.client = client;
                        self.transition(WorkerState::EnsureGroup);
                    }
                    Err(e) if e.is_connection_error() => {
                        warn!(consumer = %self.consumer, error = %e, "Could not open worker connection, retrying");
                        self.pause(coordinator).await;
                    }
                    Err(e) => return Err(e),
                },
                WorkerState::EnsureGroup => self.ensure_group(coordinator).await?,
                _ => self.read_and_dispatch(coordinator).await,
            }
        }
    }

    async fn ensure_group(&mut self, coordinator: &LifecycleCoordinator) -> Result<(), StreamError> {
        match self.client.create_group(&self.key, &self.config.group).await {
            Ok(created) => {
                if created {
                    info!(stream = %self.key, group = %self.config.group, "Created consumer group");
                } else {
                    debug!(stream = %self.key, group = %self.config.group, "Consumer group already exists");
                }
                self.begin_pending_scan();
                self.transition(WorkerState::Read);
                Ok(())
            }
            Err(e) if e.is_connection_error() => {
                warn!(stream = %self.key, group = %self.config.group, error = %e, "Failed to create consumer group, retrying");
                self.pause(coordinator).await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn read_and_dispatch(&mut self, coordinator: &LifecycleCoordinator) {
        self.transition(WorkerState::Read);

        let batch = match self.read_batch().await {
            Ok(batch) => batch,
            Err(e) if e.is_nogroup_error() => {
                warn!(stream = %self.key, group = %self.config.group, "Consumer group missing, recreating");
                self.transition(WorkerState::EnsureGroup);
                return;
            }
            Err(e) => {
                if e.is_connection_error() {
                    warn!(stream = %self.key, consumer = %self.consumer, error = %e, "Read failed, store unreachable");
                } else {
                    error!(stream = %self.key, consumer = %self.consumer, error = %e, "Read failed");
                }
                self.events.emit(&StreamEvent::ReadFailed {
                    group: self.config.group.clone(),
                    error: e.to_string(),
                });
                self.pause(coordinator).await;
                return;
            }
        };

        for id in batch.unacked {
            if self.acknowledge(id).await {
                debug!(entry_id = %id, "Outstanding acknowledgement went through");
                self.dispatcher.acknowledged(id);
            }
        }

        if batch.dispatch.is_empty() {
            if batch.source == Source::New && self.last_sweep.elapsed() >= IDLE_SWEEP_INTERVAL {
                trace!(consumer = %self.consumer, "Idle, sweeping pending entries");
                self.begin_pending_scan();
            }
            return;
        }

        debug!(consumer = %self.consumer, count = batch.dispatch.len(), source = ?batch.source, "Read entries");
        self.dispatch_batch(batch.dispatch, coordinator).await;
    }

    /// Next page of the pending scan if one is running (or a retry is due),
    /// then abandoned entries if a claim is due, otherwise a blocking read of
    /// new entries.
    async fn read_batch(&mut self) -> Result<Batch, StreamError> {
        let now = Instant::now();
        if self.scan.cursor.is_none() && self.dispatcher.tracker().has_due(now) {
            self.begin_pending_scan();
        }

        let count = self.config.batch_size.max(1);
        if let Some(cursor) = self.scan.cursor {
            let entries = self
                .client
                .read_group(self.read(ReadFrom::PendingAfter(cursor), 0, count))
                .await?;

            self.scan.seen.extend(entries.iter().map(|e| e.id));
            match entries.last() {
                Some(last) if entries.len() == count => self.scan.cursor = Some(last.id),
                _ => self.finish_pending_scan(),
            }

            let tracker = self.dispatcher.tracker();
            let (settled, unsettled): (Vec<_>, Vec<_>) =
                entries.into_iter().partition(|e| tracker.is_settled(e.id));
            return Ok(Batch {
                source: Source::Pending,
                dispatch: unsettled
                    .into_iter()
                    .filter(|e| tracker.is_due(e.id, now))
                    .collect(),
                unacked: settled.into_iter().map(|e| e.id).collect(),
            });
        }

        if self.claim_due(now) {
            // Stamped first so a failing claim cannot starve the regular reads.
            self.last_claim = Some(now);
            let claimed = self
                .client
                .claim_idle(ClaimIdle {
                    key: &self.key,
                    group: &self.config.group,
                    consumer: &self.consumer,
                    min_idle_ms: self.config.claim_idle_ms,
                    count,
                })
                .await?;
            if claimed.len() == count {
                self.last_claim = None;
            }
            if !claimed.is_empty() {
                return Ok(Batch {
                    source: Source::Claimed,
                    dispatch: claimed,
                    unacked: Vec::new(),
                });
            }
        }

        let block_ms = self.block_ms(now);
        let entries = self
            .client
            .read_group(self.read(ReadFrom::New, block_ms, count))
            .await?;
        Ok(Batch {
            source: Source::New,
            dispatch: entries,
            unacked: Vec::new(),
        })
    }

    fn claim_due(&self, now: Instant) -> bool {
        let interval = Duration::from_millis(self.config.claim_idle_ms);
        self.config.claim_idle_ms > 0
            && self
                .last_claim
                .is_none_or(|at| now.saturating_duration_since(at) >= interval)
    }

    fn read(&self, from: ReadFrom, block_ms: u64, count: usize) -> ReadGroup<'_> {
        ReadGroup {
            key: &self.key,
            group: &self.config.group,
            consumer: &self.consumer,
            from,
            block_ms,
            count,
        }
    }

    /// Read timeout, shortened so a due retry is not held back by an idle stream.
    fn block_ms(&self, now: Instant) -> u64 {
        let timeout = self.config.read_timeout_ms.max(1);
        match self.dispatcher.tracker().next_due() {
            Some(due) => {
                let until_due = due.saturating_duration_since(now).as_millis();
                u64::try_from(until_due).unwrap_or(u64::MAX).clamp(1, timeout)
            }
            None => timeout,
        }
    }

    fn begin_pending_scan(&mut self) {
        self.scan.cursor = Some(EntryId::MIN);
        self.scan.seen.clear();
        self.last_sweep = Instant::now();
    }

    fn finish_pending_scan(&mut self) {
        let seen = std::mem::take(&mut self.scan.seen);
        self.dispatcher.tracker_mut().retain_pending(&seen);
        self.scan.cursor = None;
    }

    async fn dispatch_batch(&mut self, entries: Vec<StreamEntry>, coordinator: &LifecycleCoordinator) {
        let total = entries.len();

        for (done, entry) in entries.into_iter().enumerate() {
            if coordinator.is_stop_requested() {
                info!(
                    consumer = %self.consumer,
                    left_pending = total - done,
                    "Stop requested, leaving rest of batch pending"
                );
                return;
            }

            if entry.fields.is_empty() {
                warn!(stream = %self.key, entry_id = %entry.id, "Pending entry was trimmed from the stream, acknowledging");
                self.acknowledge(entry.id).await;
                continue;
            }

            self.transition(WorkerState::Dispatch);
            let disposition = self.dispatcher.dispatch(&entry).await;

            self.transition(WorkerState::AckOrRetry);
            self.settle(&entry, disposition).await;
        }
    }

    async fn settle(&mut self, entry: &StreamEntry, disposition: Disposition) {
        let group = self.config.group.clone();

        match disposition {
            Disposition::Acknowledge { attempts } => {
                if self.acknowledge(entry.id).await {
                    self.dispatcher.acknowledged(entry.id);
                    debug!(entry_id = %entry.id, attempts, "Entry processed");
                    self.events.emit(&StreamEvent::Acknowledged {
                        group,
                        entry_id: entry.id,
                        attempts,
                    });
                }
            }
            Disposition::Retry { attempt } => {
                self.events.emit(&StreamEvent::RetryScheduled {
                    group,
                    entry_id: entry.id,
                    attempt,
                });
            }
            Disposition::Exhausted {
                attempts,
                acknowledge,
            } => {
                if acknowledge && self.acknowledge(entry.id).await {
                    self.dispatcher.acknowledged(entry.id);
                }
                self.events.emit(&StreamEvent::RetriesExhausted {
                    group,
                    entry_id: entry.id,
                    attempts,
                    acknowledged: acknowledge,
                });
            }
        }
    }

    /// Acknowledge an entry. After a failure the entry stays pending and the
    /// tracker keeps it settled, so only the ack is retried.
    async fn acknowledge(&self, id: EntryId) -> bool {
        match self.client.ack(&self.key, &self.config.group, id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    stream = %self.key,
                    group = %self.config.group,
                    entry_id = %id,
                    error = %e,
                    "Failed to acknowledge entry, it stays pending"
                );
                false
            }
        }
    }

    /// Wait one read timeout, or less if a stop is requested meanwhile.
    async fn pause(&self, coordinator: &LifecycleCoordinator) {
        let wait = Duration::from_millis(self.config.read_timeout_ms).max(MIN_PAUSE);
        tokio::select! {
            _ = coordinator.stop_requested() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }

    fn transition(&mut self, next: WorkerState) {
        if self.state != next {
            trace!(consumer = %self.consumer, from = %self.state, to = %next, "Worker state");
            self.state = next;
        }
    }
}
