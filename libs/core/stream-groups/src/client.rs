//! Stream client: the primitive command set the core needs from the store
//!
//! `RedisStreamClient` maps each operation onto Redis commands
//! (`XADD`, `XGROUP CREATE`, `XREADGROUP`, `XACK`, `EXPIRE`, and
//! `XINFO CONSUMERS` + `XPENDING` + `XCLAIM` for idle claims).

use async_trait::async_trait;
use core_config::redis::RedisConfig;
use redis::aio::ConnectionManager;
use redis::streams::{StreamInfoConsumersReply, StreamPendingCountReply};
use redis::{Client, RedisResult};
use tracing::{debug, info};

use crate::config::ClientPools;
use crate::entry::{EntryId, StreamEntry};
use crate::error::StreamError;

/// Where a group read starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFrom {
    /// Entries never delivered to any consumer of the group (`>`).
    New,
    /// This consumer's own pending entries with ids greater than the cursor.
    PendingAfter(EntryId),
}

/// Arguments of a consumer-group read.
#[derive(Debug, Clone, Copy)]
pub struct ReadGroup<'a> {
    pub key: &'a str,
    pub group: &'a str,
    pub consumer: &'a str,
    pub from: ReadFrom,
    /// How long a read of new entries may block. Pending reads never block.
    pub block_ms: u64,
    pub count: usize,
}

/// Arguments of an idle claim.
#[derive(Debug, Clone, Copy)]
pub struct ClaimIdle<'a> {
    pub key: &'a str,
    pub group: &'a str,
    /// The consumer taking ownership.
    pub consumer: &'a str,
    /// How long both the entry and its current owner must have been idle.
    pub min_idle_ms: u64,
    pub count: usize,
}

/// Primitive stream operations.
///
/// Clones share the underlying connection; [`StreamClient::pinned`] returns a
/// client on a dedicated connection for long blocking reads.
#[async_trait]
pub trait StreamClient: Clone + Send + Sync + 'static {
    /// Append an entry, optionally trimming the stream to about `max_len` entries.
    async fn append(
        &self,
        key: &str,
        fields: &[(String, String)],
        max_len: Option<u64>,
    ) -> Result<EntryId, StreamError>;

    /// Create the consumer group (and the stream). Returns `false` when the
    /// group already existed.
    async fn create_group(&self, key: &str, group: &str) -> Result<bool, StreamError>;

    /// Read entries for a consumer. Pending entries whose data was trimmed
    /// away come back with an empty field map.
    async fn read_group(&self, read: ReadGroup<'_>) -> Result<Vec<StreamEntry>, StreamError>;

    /// Take over pending entries abandoned by other consumers.
    ///
    /// Only entries idle for at least `min_idle_ms` whose owner has not
    /// touched the group for as long are moved; a live consumer's pending
    /// list is left alone. Entries whose data was trimmed away are dropped
    /// from the pending list instead of being returned.
    async fn claim_idle(&self, claim: ClaimIdle<'_>) -> Result<Vec<StreamEntry>, StreamError>;

    /// Acknowledge an entry, removing it from the group's pending list.
    async fn ack(&self, key: &str, group: &str, id: EntryId) -> Result<(), StreamError>;

    /// Set a time-to-live on the stream key.
    async fn expire(&self, key: &str, seconds: u64) -> Result<(), StreamError>;

    /// A client bound to its own connection.
    async fn pinned(&self) -> Result<Self, StreamError>;
}

type ReadReply = Vec<(String, Vec<(String, Option<Vec<(String, String)>>)>)>;

type ClaimReply = Vec<Option<(String, Option<Vec<(String, String)>>)>>;

/// Redis-backed [`StreamClient`].
#[derive(Clone)]
pub struct RedisStreamClient {
    client: Client,
    conn: ConnectionManager,
}

impl RedisStreamClient {
    /// Connect to Redis and verify the connection with `PING`.
    pub async fn connect(url: &str) -> Result<Self, StreamError> {
        let client = Client::open(url)?;
        let conn = open_manager(&client).await?;
        info!(url = %redact(url), "Connected stream client");
        Ok(Self { client, conn })
    }

    /// Connect every connection named in the Redis configuration.
    pub async fn connect_pools(config: &RedisConfig) -> Result<ClientPools<Self>, StreamError> {
        let mut pools = ClientPools::new();
        for name in config.connection_names() {
            let client = Self::connect(config.url_for(&name)).await?;
            pools = pools.with_pool(name, client);
        }
        Ok(pools)
    }

    /// The shared connection manager.
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

async fn open_manager(client: &Client) -> Result<ConnectionManager, StreamError> {
    let mut conn = ConnectionManager::new(client.clone())
        .await
        .map_err(|e| StreamError::Connection(e.to_string()))?;
    let _: String = redis::cmd("PING")
        .query_async(&mut conn)
        .await
        .map_err(|e| StreamError::Connection(e.to_string()))?;
    Ok(conn)
}

fn redact(url: &str) -> String {
    match url.split_once('@') {
        Some((_, host)) => format!("redis://***@{host}"),
        None => url.to_string(),
    }
}

#[async_trait]
impl StreamClient for RedisStreamClient {
    async fn append(
        &self,
        key: &str,
        fields: &[(String, String)],
        max_len: Option<u64>,
    ) -> Result<EntryId, StreamError> {
        let mut conn = self.conn.clone();

        let mut cmd = redis::cmd("XADD");
        cmd.arg(key);
        if let Some(max_len) = max_len {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        cmd.arg("*");
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }

        let id: String = cmd.query_async(&mut conn).await?;
        id.parse()
    }

    async fn create_group(&self, key: &str, group: &str) -> Result<bool, StreamError> {
        let mut conn = self.conn.clone();

        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(key)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => Ok(true),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(false),
            Err(e) => Err(StreamError::Redis(e)),
        }
    }

    async fn read_group(&self, read: ReadGroup<'_>) -> Result<Vec<StreamEntry>, StreamError> {
        let mut conn = self.conn.clone();

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(read.group).arg(read.consumer);
        if read.from == ReadFrom::New && read.block_ms > 0 {
            cmd.arg("BLOCK").arg(read.block_ms);
        }
        cmd.arg("COUNT").arg(read.count.max(1)).arg("STREAMS").arg(read.key);
        match read.from {
            ReadFrom::New => cmd.arg(">"),
            ReadFrom::PendingAfter(cursor) => cmd.arg(cursor.to_string()),
        };

        let reply: RedisResult<Option<ReadReply>> = cmd.query_async(&mut conn).await;

        let streams = match reply {
            Ok(Some(streams)) => streams,
            Ok(None) => return Ok(vec![]),
            // The server may still answer a BLOCK after the client gave up
            // waiting; such deliveries land in our pending list.
            Err(e) if e.is_timeout() && read.from == ReadFrom::New => {
                debug!(stream = %read.key, "Blocking read timed out client-side");
                return Ok(vec![]);
            }
            Err(e) => return Err(StreamError::Redis(e)),
        };

        let mut entries = Vec::new();
        for (_stream, items) in streams {
            for (id, fields) in items {
                entries.push(StreamEntry::from_pairs(
                    id.parse()?,
                    fields.unwrap_or_default(),
                ));
            }
        }
        Ok(entries)
    }

    async fn claim_idle(&self, claim: ClaimIdle<'_>) -> Result<Vec<StreamEntry>, StreamError> {
        let mut conn = self.conn.clone();
        let count = claim.count.max(1);

        let info: StreamInfoConsumersReply = redis::cmd("XINFO")
            .arg("CONSUMERS")
            .arg(claim.key)
            .arg(claim.group)
            .query_async(&mut conn)
            .await?;

        let abandoned = info.consumers.iter().filter(|c| {
            c.name != claim.consumer && c.pending > 0 && c.idle as u64 >= claim.min_idle_ms
        });

        let mut ids = Vec::new();
        for owner in abandoned {
            let pending: StreamPendingCountReply = redis::cmd("XPENDING")
                .arg(claim.key)
                .arg(claim.group)
                .arg("-")
                .arg("+")
                .arg(count - ids.len())
                .arg(&owner.name)
                .query_async(&mut conn)
                .await?;

            ids.extend(
                pending
                    .ids
                    .into_iter()
                    .filter(|p| p.last_delivered_ms as u64 >= claim.min_idle_ms)
                    .map(|p| p.id),
            );
            if ids.len() >= count {
                break;
            }
        }

        if ids.is_empty() {
            return Ok(vec![]);
        }

        // XCLAIM re-checks the idle time, so an entry another worker got to
        // first is skipped.
        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(claim.key)
            .arg(claim.group)
            .arg(claim.consumer)
            .arg(claim.min_idle_ms);
        for id in &ids {
            cmd.arg(id);
        }
        let claimed: ClaimReply = cmd.query_async(&mut conn).await?;

        let mut entries = Vec::new();
        for (id, fields) in claimed.into_iter().flatten() {
            let Some(fields) = fields else { continue };
            entries.push(StreamEntry::from_pairs(id.parse()?, fields));
        }
        if !entries.is_empty() {
            info!(
                stream = %claim.key,
                consumer = %claim.consumer,
                count = entries.len(),
                "Claimed abandoned entries"
            );
        }
        Ok(entries)
    }

    async fn ack(&self, key: &str, group: &str, id: EntryId) -> Result<(), StreamError> {
        let mut conn = self.conn.clone();

        let _: i64 = redis::cmd("XACK")
            .arg(key)
            .arg(group)
            .arg(id.to_string())
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<(), StreamError> {
        let mut conn = self.conn.clone();

        let _: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(seconds)
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn pinned(&self) -> Result<Self, StreamError> {
        let conn = open_manager(&self.client).await?;
        Ok(Self {
            client: self.client.clone(),
            conn,
        })
    }
}
