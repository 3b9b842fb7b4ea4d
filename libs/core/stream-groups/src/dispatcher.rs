//! Handler dispatch and retry policy
//!
//! The dispatcher runs the registered handler for one entry, counts failures
//! per entry id and decides what the worker does with the entry next:
//! acknowledge it, leave it pending for redelivery, or hand it to the
//! [`ExhaustionPolicy`] once the retry budget is spent.

use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, warn};

use crate::entry::{EntryId, StreamEntry};
use crate::error::HandlerError;
use crate::flow;

/// A consumption capability bound to a group.
///
/// # Example
///
/// ```rust,ignore
/// struct OrderHandler;
///
/// #[async_trait]
/// impl StreamHandler for OrderHandler {
///     async fn consume(&self, entry: &StreamEntry) -> Result<(), HandlerError> {
///         let order: Order = entry.message_as().map_err(|e| HandlerError::permanent(e.to_string()))?;
///         ship(order).await.map_err(|e| HandlerError::transient("shipping failed").with_source(e))
///     }
///
///     fn name(&self) -> &'static str {
///         "OrderHandler"
///     }
/// }
/// ```
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StreamHandler: Send + Sync {
    /// Process one entry. `Ok` acknowledges it.
    async fn consume(&self, entry: &StreamEntry) -> Result<(), HandlerError>;

    /// Handler name for logging.
    fn name(&self) -> &'static str;
}

/// Adapts an async closure into a [`StreamHandler`].
pub struct FnHandler<F> {
    name: &'static str,
    f: F,
}

/// Build a handler from a closure taking an owned entry.
pub fn handler_fn<F, Fut>(name: &'static str, f: F) -> FnHandler<F>
where
    F: Fn(StreamEntry) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler { name, f }
}

#[async_trait]
impl<F, Fut> StreamHandler for FnHandler<F>
where
    F: Fn(StreamEntry) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn consume(&self, entry: &StreamEntry) -> Result<(), HandlerError> {
        (self.f)(entry.clone()).await
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// What happens to an entry whose retry budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustionDecision {
    /// Acknowledge (drop) the entry.
    Acknowledge,
    /// Keep it in the pending list; this worker will not dispatch it again.
    LeavePending,
}

/// Decision point for entries that keep failing.
pub trait ExhaustionPolicy: Send + Sync {
    fn on_exhausted(
        &self,
        group: &str,
        entry: &StreamEntry,
        attempts: u32,
        error: &HandlerError,
    ) -> ExhaustionDecision;
}

/// Acknowledge the entry and log the failure. Keeps the pending list bounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcknowledgeAndLog;

impl ExhaustionPolicy for AcknowledgeAndLog {
    fn on_exhausted(
        &self,
        group: &str,
        entry: &StreamEntry,
        attempts: u32,
        error: &HandlerError,
    ) -> ExhaustionDecision {
        error!(
            group = %group,
            entry_id = %entry.id,
            flow_id = %entry.flow_id(),
            attempts,
            error = %error,
            message = entry.message().unwrap_or_default(),
            "Retries exhausted, dropping entry"
        );
        ExhaustionDecision::Acknowledge
    }
}

/// Leave the entry unacknowledged for an operator or another tool to handle.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeavePending;

impl ExhaustionPolicy for LeavePending {
    fn on_exhausted(
        &self,
        group: &str,
        entry: &StreamEntry,
        attempts: u32,
        error: &HandlerError,
    ) -> ExhaustionDecision {
        warn!(
            group = %group,
            entry_id = %entry.id,
            attempts,
            error = %error,
            "Retries exhausted, leaving entry pending"
        );
        ExhaustionDecision::LeavePending
    }
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The handler succeeded on attempt `attempts`.
    Acknowledge { attempts: u32 },
    /// The handler failed; the entry stays pending for another attempt.
    Retry { attempt: u32 },
    /// No attempts left; `acknowledge` carries the policy's decision.
    Exhausted { attempts: u32, acknowledge: bool },
}

impl Disposition {
    /// Whether the worker must acknowledge the entry.
    pub fn acknowledges(&self) -> bool {
        matches!(
            self,
            Disposition::Acknowledge { .. } | Disposition::Exhausted { acknowledge: true, .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    /// Failed within budget, waiting for `not_before`.
    Retrying,
    /// Exhausted and left pending; never dispatched again by this worker.
    Parked,
    /// Outcome decided, waiting for the acknowledgement to go through.
    Settled,
}

#[derive(Debug, Clone, Copy)]
struct Attempts {
    failures: u32,
    not_before: Instant,
    status: Status,
}

/// Failure counts per entry id, with the earliest time each may be retried.
///
/// An entry stays tracked until the worker confirms its acknowledgement, so
/// a failed ack is retried on its own instead of re-running the handler.
#[derive(Debug)]
pub struct RetryTracker {
    entries: HashMap<EntryId, Attempts>,
    delay: Duration,
}

impl RetryTracker {
    pub fn new(delay: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            delay,
        }
    }

    /// Failures recorded so far for the entry.
    pub fn failures(&self, id: EntryId) -> u32 {
        self.entries.get(&id).map_or(0, |a| a.failures)
    }

    fn record_failure(&mut self, id: EntryId) -> u32 {
        let attempts = self.track(id, Status::Retrying);
        attempts.failures += 1;
        attempts.failures
    }

    fn park(&mut self, id: EntryId) {
        self.track(id, Status::Parked);
    }

    fn settle(&mut self, id: EntryId) {
        self.track(id, Status::Settled);
    }

    fn track(&mut self, id: EntryId, status: Status) -> &mut Attempts {
        let not_before = Instant::now() + self.delay;
        let attempts = self.entries.entry(id).or_insert(Attempts {
            failures: 0,
            not_before,
            status,
        });
        attempts.not_before = not_before;
        attempts.status = status;
        attempts
    }

    /// Drop the entry once it has been acknowledged.
    pub fn clear(&mut self, id: EntryId) {
        self.entries.remove(&id);
    }

    pub fn is_parked(&self, id: EntryId) -> bool {
        self.status(id) == Some(Status::Parked)
    }

    /// Whether the entry only needs its acknowledgement.
    pub fn is_settled(&self, id: EntryId) -> bool {
        self.status(id) == Some(Status::Settled)
    }

    fn status(&self, id: EntryId) -> Option<Status> {
        self.entries.get(&id).map(|a| a.status)
    }

    /// Whether the entry may be dispatched now. Unknown entries always may.
    pub fn is_due(&self, id: EntryId, now: Instant) -> bool {
        self.entries
            .get(&id)
            .is_none_or(|a| a.status == Status::Retrying && a.not_before <= now)
    }

    /// Earliest time an entry needs another look: a retry or an outstanding ack.
    pub fn next_due(&self) -> Option<Instant> {
        self.entries
            .values()
            .filter(|a| a.status != Status::Parked)
            .map(|a| a.not_before)
            .min()
    }

    pub fn has_due(&self, now: Instant) -> bool {
        self.next_due().is_some_and(|due| due <= now)
    }

    /// Forget entries that are no longer pending.
    pub fn retain_pending(&mut self, pending: &[EntryId]) {
        self.entries.retain(|id, _| pending.contains(id));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Runs a handler and applies the retry budget and exhaustion policy.
pub struct Dispatcher {
    group: String,
    handler: Arc<dyn StreamHandler>,
    retry_count: u32,
    policy: Arc<dyn ExhaustionPolicy>,
    tracker: RetryTracker,
}

impl Dispatcher {
    pub fn new(
        group: impl Into<String>,
        handler: Arc<dyn StreamHandler>,
        retry_count: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            group: group.into(),
            handler,
            retry_count,
            policy: Arc::new(AcknowledgeAndLog),
            tracker: RetryTracker::new(retry_delay),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn ExhaustionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn handler_name(&self) -> &'static str {
        self.handler.name()
    }

    pub fn tracker(&self) -> &RetryTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut RetryTracker {
        &mut self.tracker
    }

    /// Record that the entry's acknowledgement went through.
    pub fn acknowledged(&mut self, id: EntryId) {
        self.tracker.clear(id);
    }

    /// Run the handler for `entry` inside the entry's flow id.
    ///
    /// Handler panics count as transient failures.
    pub async fn dispatch(&mut self, entry: &StreamEntry) -> Disposition {
        let attempt = self.tracker.failures(entry.id) + 1;
        let consume = flow::with_flow_id(entry.flow_id(), self.handler.consume(entry));

        let result = match AssertUnwindSafe(consume).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(HandlerError::transient(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };

        let error = match result {
            Ok(()) => {
                self.tracker.settle(entry.id);
                return Disposition::Acknowledge { attempts: attempt };
            }
            Err(error) => error,
        };

        let failures = self.tracker.record_failure(entry.id);
        if !error.is_permanent() && failures <= self.retry_count {
            warn!(
                group = %self.group,
                handler = self.handler.name(),
                entry_id = %entry.id,
                attempt = failures,
                retry_count = self.retry_count,
                error = %error,
                "Handler failed, entry left pending for redelivery"
            );
            return Disposition::Retry { attempt: failures };
        }

        let decision = self
            .policy
            .on_exhausted(&self.group, entry, failures, &error);
        match decision {
            ExhaustionDecision::Acknowledge => self.tracker.settle(entry.id),
            ExhaustionDecision::LeavePending => self.tracker.park(entry.id),
        }
        Disposition::Exhausted {
            attempts: failures,
            acknowledge: decision == ExhaustionDecision::Acknowledge,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
