//! In-memory stream client
//!
//! Emulates the consumer-group semantics the workers rely on (last-delivered
//! cursor, per-consumer pending lists, blocking reads, approximate trimming
//! done exactly) without a Redis server. Used by tests and local demos.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::client::{ClaimIdle, ReadFrom, ReadGroup, StreamClient};
use crate::entry::{EntryId, StreamEntry};
use crate::error::StreamError;

#[derive(Default)]
struct Stream {
    entries: BTreeMap<EntryId, BTreeMap<String, String>>,
    last_id: EntryId,
    groups: HashMap<String, Group>,
    ttl_secs: Option<u64>,
}

#[derive(Default)]
struct Group {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, Pending>,
    /// Last time each consumer read from or claimed into the group.
    consumers: HashMap<String, Instant>,
    acked: u64,
}

struct Pending {
    consumer: String,
    deliveries: u32,
    delivered_at: Instant,
}

#[derive(Default)]
struct Inner {
    streams: Mutex<HashMap<String, Stream>>,
    appended: Notify,
    offline: AtomicBool,
}

/// [`StreamClient`] backed by process memory. Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryStreamClient {
    inner: Arc<Inner>,
}

impl InMemoryStreamClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with a connection error until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of entries in the stream.
    pub fn len(&self, key: &str) -> usize {
        self.streams().get(key).map_or(0, |s| s.entries.len())
    }

    pub fn is_empty(&self, key: &str) -> bool {
        self.len(key) == 0
    }

    /// All entries currently in the stream, oldest first.
    pub fn entries(&self, key: &str) -> Vec<StreamEntry> {
        self.streams()
            .get(key)
            .map(|s| {
                s.entries
                    .iter()
                    .map(|(id, fields)| StreamEntry::new(*id, fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Entries delivered to the group but not acknowledged.
    pub fn pending_count(&self, key: &str, group: &str) -> usize {
        self.with_group(key, group, |g| g.pending.len()).unwrap_or(0)
    }

    /// Acknowledgements received by the group.
    pub fn ack_count(&self, key: &str, group: &str) -> u64 {
        self.with_group(key, group, |g| g.acked).unwrap_or(0)
    }

    /// Consumer currently owning a pending entry.
    pub fn pending_owner(&self, key: &str, group: &str, id: EntryId) -> Option<String> {
        self.with_group(key, group, |g| g.pending.get(&id).map(|p| p.consumer.clone()))
            .flatten()
    }

    /// How many times a pending entry has been delivered.
    pub fn delivery_count(&self, key: &str, group: &str, id: EntryId) -> Option<u32> {
        self.with_group(key, group, |g| g.pending.get(&id).map(|p| p.deliveries))
            .flatten()
    }

    pub fn has_group(&self, key: &str, group: &str) -> bool {
        self.with_group(key, group, |_| ()).is_some()
    }

    /// Time-to-live last set on the key.
    pub fn ttl(&self, key: &str) -> Option<u64> {
        self.streams().get(key).and_then(|s| s.ttl_secs)
    }

    /// Delete the key with its groups, as an expiry would.
    pub fn remove_stream(&self, key: &str) -> bool {
        self.streams().remove(key).is_some()
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<String, Stream>> {
        // A panicking test thread must not wedge every other user.
        self.inner
            .streams
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_group<T>(&self, key: &str, group: &str, f: impl FnOnce(&Group) -> T) -> Option<T> {
        self.streams()
            .get(key)
            .and_then(|s| s.groups.get(group))
            .map(f)
    }

    fn ensure_online(&self) -> Result<(), StreamError> {
        if self.inner.offline.load(Ordering::SeqCst) {
            Err(StreamError::Connection("in-memory store is offline".into()))
        } else {
            Ok(())
        }
    }

    fn next_id(last: EntryId) -> EntryId {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        if now > last.millis {
            EntryId::new(now, 0)
        } else {
            EntryId::new(last.millis, last.seq + 1)
        }
    }

    fn nogroup(key: &str, group: &str) -> StreamError {
        StreamError::Internal(format!(
            "NOGROUP No such key '{key}' or consumer group '{group}'"
        ))
    }

    /// One non-blocking read attempt.
    fn try_read(&self, read: &ReadGroup<'_>) -> Result<Vec<StreamEntry>, StreamError> {
        let mut streams = self.streams();
        let stream = streams
            .get_mut(read.key)
            .ok_or_else(|| Self::nogroup(read.key, read.group))?;
        let Stream { entries, groups, .. } = stream;
        let group = groups
            .get_mut(read.group)
            .ok_or_else(|| Self::nogroup(read.key, read.group))?;
        let count = read.count.max(1);
        let now = Instant::now();
        group.consumers.insert(read.consumer.to_string(), now);

        match read.from {
            ReadFrom::New => {
                let delivered: Vec<StreamEntry> = entries
                    .range(group.last_delivered..)
                    .filter(|(id, _)| **id > group.last_delivered)
                    .take(count)
                    .map(|(id, fields)| StreamEntry::new(*id, fields.clone()))
                    .collect();

                for entry in &delivered {
                    group.last_delivered = entry.id;
                    group.pending.insert(
                        entry.id,
                        Pending {
                            consumer: read.consumer.to_string(),
                            deliveries: 1,
                            delivered_at: now,
                        },
                    );
                }
                Ok(delivered)
            }
            ReadFrom::PendingAfter(cursor) => {
                let mut delivered = Vec::new();
                for (id, pending) in group.pending.range_mut(cursor..) {
                    if *id <= cursor || pending.consumer != read.consumer {
                        continue;
                    }
                    pending.deliveries += 1;
                    pending.delivered_at = now;
                    let fields = entries.get(id).cloned().unwrap_or_default();
                    delivered.push(StreamEntry::new(*id, fields));
                    if delivered.len() == count {
                        break;
                    }
                }
                Ok(delivered)
            }
        }
    }
}

#[async_trait]
impl StreamClient for InMemoryStreamClient {
    async fn append(
        &self,
        key: &str,
        fields: &[(String, String)],
        max_len: Option<u64>,
    ) -> Result<EntryId, StreamError> {
        self.ensure_online()?;
        let id = {
            let mut streams = self.streams();
            let stream = streams.entry(key.to_string()).or_default();
            let id = Self::next_id(stream.last_id);
            stream.last_id = id;
            stream.entries.insert(id, fields.iter().cloned().collect());

            if let Some(max_len) = max_len {
                while stream.entries.len() as u64 > max_len {
                    stream.entries.pop_first();
                }
            }
            id
        };
        self.inner.appended.notify_waiters();
        Ok(id)
    }

    async fn create_group(&self, key: &str, group: &str) -> Result<bool, StreamError> {
        self.ensure_online()?;
        let mut streams = self.streams();
        let stream = streams.entry(key.to_string()).or_default();
        if stream.groups.contains_key(group) {
            return Ok(false);
        }
        stream.groups.insert(group.to_string(), Group::default());
        Ok(true)
    }

    async fn read_group(&self, read: ReadGroup<'_>) -> Result<Vec<StreamEntry>, StreamError> {
        let deadline = Instant::now() + Duration::from_millis(read.block_ms);

        loop {
            self.ensure_online()?;
            // Register interest before looking, so an append racing with the
            // read below still wakes us.
            let appended = self.inner.appended.notified();

            let entries = self.try_read(&read)?;
            let blocking = read.from == ReadFrom::New && read.block_ms > 0;
            if !entries.is_empty() || !blocking || Instant::now() >= deadline {
                return Ok(entries);
            }

            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(vec![]);
            }
        }
    }

    async fn claim_idle(&self, claim: ClaimIdle<'_>) -> Result<Vec<StreamEntry>, StreamError> {
        self.ensure_online()?;
        let mut streams = self.streams();
        let stream = streams
            .get_mut(claim.key)
            .ok_or_else(|| Self::nogroup(claim.key, claim.group))?;
        let Stream { entries, groups, .. } = stream;
        let group = groups
            .get_mut(claim.group)
            .ok_or_else(|| Self::nogroup(claim.key, claim.group))?;

        let now = Instant::now();
        let min_idle = Duration::from_millis(claim.min_idle_ms);
        let abandoned: HashSet<&String> = group
            .consumers
            .iter()
            .filter(|(name, seen)| *name != claim.consumer && now.duration_since(**seen) >= min_idle)
            .map(|(name, _)| name)
            .collect();

        let candidates: Vec<EntryId> = group
            .pending
            .iter()
            .filter(|(_, p)| {
                abandoned.contains(&p.consumer) && now.duration_since(p.delivered_at) >= min_idle
            })
            .map(|(id, _)| *id)
            .take(claim.count.max(1))
            .collect();

        let mut claimed = Vec::new();
        for id in candidates {
            let Some(fields) = entries.get(&id) else {
                group.pending.remove(&id);
                continue;
            };
            if let Some(pending) = group.pending.get_mut(&id) {
                pending.consumer = claim.consumer.to_string();
                pending.deliveries += 1;
                pending.delivered_at = now;
            }
            claimed.push(StreamEntry::new(id, fields.clone()));
        }
        group.consumers.insert(claim.consumer.to_string(), now);
        Ok(claimed)
    }

    async fn ack(&self, key: &str, group: &str, id: EntryId) -> Result<(), StreamError> {
        self.ensure_online()?;
        let mut streams = self.streams();
        let group = streams
            .get_mut(key)
            .and_then(|s| s.groups.get_mut(group))
            .ok_or_else(|| Self::nogroup(key, group))?;
        if group.pending.remove(&id).is_some() {
            group.acked += 1;
        }
        Ok(())
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<(), StreamError> {
        self.ensure_online()?;
        if let Some(stream) = self.streams().get_mut(key) {
            stream.ttl_secs = Some(seconds);
        }
        Ok(())
    }

    async fn pinned(&self) -> Result<Self, StreamError> {
        self.ensure_online()?;
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(message: &str) -> Vec<(String, String)> {
        vec![("message".to_string(), message.to_string())]
    }

    fn read<'a>(consumer: &'a str, from: ReadFrom, block_ms: u64) -> ReadGroup<'a> {
        ReadGroup {
            key: "ordersStream",
            group: "orders",
            consumer,
            from,
            block_ms,
            count: 10,
        }
    }

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let client = InMemoryStreamClient::new();
        let a = client.append("s", &fields("a"), None).await.unwrap();
        let b = client.append("s", &fields("b"), None).await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_group_delivery_and_pending() {
        let client = InMemoryStreamClient::new();
        assert!(client.create_group("ordersStream", "orders").await.unwrap());
        assert!(!client.create_group("ordersStream", "orders").await.unwrap());

        let id = client
            .append("ordersStream", &fields("m1"), None)
            .await
            .unwrap();

        let first = client.read_group(read("c1", ReadFrom::New, 0)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].message(), Some("m1"));

        // Delivered entries are not handed out again as new.
        let again = client.read_group(read("c2", ReadFrom::New, 0)).await.unwrap();
        assert!(again.is_empty());

        // Only the owning consumer sees it in its pending list.
        let other = client
            .read_group(read("c2", ReadFrom::PendingAfter(EntryId::MIN), 0))
            .await
            .unwrap();
        assert!(other.is_empty());
        let own = client
            .read_group(read("c1", ReadFrom::PendingAfter(EntryId::MIN), 0))
            .await
            .unwrap();
        assert_eq!(own[0].id, id);
        assert_eq!(client.delivery_count("ordersStream", "orders", id), Some(2));

        client.ack("ordersStream", "orders", id).await.unwrap();
        assert_eq!(client.pending_count("ordersStream", "orders"), 0);
        assert_eq!(client.ack_count("ordersStream", "orders"), 1);
    }

    fn claim(consumer: &str, min_idle_ms: u64) -> ClaimIdle<'_> {
        ClaimIdle {
            key: "ordersStream",
            group: "orders",
            consumer,
            min_idle_ms,
            count: 10,
        }
    }

    #[tokio::test]
    async fn test_claim_takes_only_from_silent_consumers() {
        let client = InMemoryStreamClient::new();
        client.create_group("ordersStream", "orders").await.unwrap();
        let gone = client.append("ordersStream", &fields("a"), None).await.unwrap();
        client.read_group(read("gone", ReadFrom::New, 0)).await.unwrap();
        let live = client.append("ordersStream", &fields("b"), None).await.unwrap();
        client.read_group(read("live", ReadFrom::New, 0)).await.unwrap();

        // Nothing has been idle long enough yet.
        assert!(client.claim_idle(claim("new", 30)).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(40)).await;
        // "live" keeps polling; its entry is not delivered again by this read.
        client.read_group(read("live", ReadFrom::New, 0)).await.unwrap();

        let claimed = client.claim_idle(claim("new", 30)).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, gone);
        assert_eq!(claimed[0].message(), Some("a"));
        assert_eq!(client.pending_owner("ordersStream", "orders", gone).as_deref(), Some("new"));
        assert_eq!(client.pending_owner("ordersStream", "orders", live).as_deref(), Some("live"));
        assert_eq!(client.delivery_count("ordersStream", "orders", gone), Some(2));

        // Freshly claimed entries are not idle any more.
        assert!(client.claim_idle(claim("other", 30)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_drops_trimmed_entries() {
        let client = InMemoryStreamClient::new();
        client.create_group("ordersStream", "orders").await.unwrap();
        client.append("ordersStream", &fields("old"), None).await.unwrap();
        client.read_group(read("gone", ReadFrom::New, 0)).await.unwrap();
        client.append("ordersStream", &fields("new"), Some(1)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(client.claim_idle(claim("c1", 10)).await.unwrap().is_empty());
        assert_eq!(client.pending_count("ordersStream", "orders"), 0);
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_append() {
        let client = InMemoryStreamClient::new();
        client.create_group("ordersStream", "orders").await.unwrap();

        let producer = client.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer
                .append("ordersStream", &fields("late"), None)
                .await
                .unwrap();
        });

        let entries = client
            .read_group(read("c1", ReadFrom::New, 5_000))
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_blocking_read_times_out_empty() {
        let client = InMemoryStreamClient::new();
        client.create_group("ordersStream", "orders").await.unwrap();

        let entries = client
            .read_group(read("c1", ReadFrom::New, 30))
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_missing_group_is_nogroup() {
        let client = InMemoryStreamClient::new();
        let err = client
            .read_group(read("c1", ReadFrom::New, 0))
            .await
            .unwrap_err();
        assert!(err.is_nogroup_error());
    }

    #[tokio::test]
    async fn test_trimming_and_ttl() {
        let client = InMemoryStreamClient::new();
        for i in 0..5 {
            client
                .append("s", &fields(&i.to_string()), Some(3))
                .await
                .unwrap();
        }
        assert_eq!(client.len("s"), 3);
        assert_eq!(client.entries("s")[0].message(), Some("2"));

        client.expire("s", 60).await.unwrap();
        assert_eq!(client.ttl("s"), Some(60));
    }

    #[tokio::test]
    async fn test_offline_client_fails_with_connection_error() {
        let client = InMemoryStreamClient::new();
        client.set_offline(true);
        let err = client.append("s", &fields("x"), None).await.unwrap_err();
        assert!(err.is_connection_error());

        client.set_offline(false);
        assert!(client.append("s", &fields("x"), None).await.is_ok());
    }
}
