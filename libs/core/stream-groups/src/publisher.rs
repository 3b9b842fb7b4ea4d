//! Stream publisher
//!
//! Appends messages to `<group>Stream`, stamping the ambient flow id, and
//! applies the group's trimming and expiry settings.
//!
//! # Example
//!
//! ```rust,ignore
//! use stream_groups::{Publisher, StreamGroupConfig};
//!
//! let config = StreamGroupConfig::new("orders", "orders").with_producer_max_len(10_000);
//! let publisher = Publisher::from_config(&pools, &config)?;
//!
//! let id = publisher.publish("orders", r#"{"id":1}"#, &[("tenant", "acme")]).await?;
//! ```

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::client::StreamClient;
use crate::config::{stream_key, ClientPools, StreamGroupConfig};
use crate::entry::{EntryId, MessageKey};
use crate::error::StreamError;
use crate::events::{EventSink, MetricsSink, StreamEvent};
use crate::flow;

/// Trimming and expiry applied to every publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerSettings {
    /// Approximate upper bound on the stream length.
    pub max_len: Option<u64>,
    /// Expiry set on the stream key after each append.
    pub ttl_secs: Option<u64>,
}

impl From<&StreamGroupConfig> for ProducerSettings {
    fn from(config: &StreamGroupConfig) -> Self {
        Self {
            max_len: config.producer_max_len,
            ttl_secs: config.producer_ttl_secs,
        }
    }
}

/// Publishes messages to group streams.
#[derive(Clone)]
pub struct Publisher<C> {
    client: C,
    settings: ProducerSettings,
    events: Arc<dyn EventSink>,
}

impl<C: StreamClient> Publisher<C> {
    pub fn new(client: C, settings: ProducerSettings) -> Self {
        Self {
            client,
            settings,
            events: Arc::new(MetricsSink),
        }
    }

    /// Build a publisher on the group's producer pool with its settings.
    pub fn from_config(
        pools: &ClientPools<C>,
        config: &StreamGroupConfig,
    ) -> Result<Self, StreamError> {
        let client = pools.get(config.producer_pool_name())?;
        Ok(Self::new(client, ProducerSettings::from(config)))
    }

    /// Report publishes to a different event sink.
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn settings(&self) -> ProducerSettings {
        self.settings
    }

    /// Append `message` to the group's stream.
    ///
    /// `params` are stored next to the reserved `flowId` and `message`
    /// fields and may not reuse those names.
    pub async fn publish(
        &self,
        group: &str,
        message: &str,
        params: &[(&str, &str)],
    ) -> Result<EntryId, StreamError> {
        validate_group(group)?;
        let fields = build_fields(message, params)?;
        self.append(group, &fields).await
    }

    /// Serialize `payload` as JSON and publish it.
    pub async fn publish_json<T: Serialize>(
        &self,
        group: &str,
        payload: &T,
        params: &[(&str, &str)],
    ) -> Result<EntryId, StreamError> {
        validate_group(group)?;
        let message = serde_json::to_string(payload)?;
        self.publish(group, &message, params).await
    }

    /// Publish the same message to several groups.
    ///
    /// Every group is validated before anything is written.
    pub async fn publish_many(
        &self,
        groups: &[&str],
        message: &str,
        params: &[(&str, &str)],
    ) -> Result<Vec<EntryId>, StreamError> {
        if groups.is_empty() {
            return Err(StreamError::validation("at least one group is required"));
        }
        for group in groups {
            validate_group(group)?;
        }
        let fields = build_fields(message, params)?;

        let mut ids = Vec::with_capacity(groups.len());
        for group in groups {
            ids.push(self.append(group, &fields).await?);
        }
        Ok(ids)
    }

    async fn append(&self, group: &str, fields: &[(String, String)]) -> Result<EntryId, StreamError> {
        let key = stream_key(group);
        let id = self
            .client
            .append(&key, fields, self.settings.max_len)
            .await?;

        // Not atomic with the append: a crash in between leaves the key without a TTL.
        if let Some(ttl) = self.settings.ttl_secs
            && let Err(e) = self.client.expire(&key, ttl).await
        {
            warn!(stream = %key, ttl_secs = ttl, error = %e, "Failed to set stream expiry");
        }

        debug!(stream = %key, entry_id = %id, "Published message");
        self.events.emit(&StreamEvent::Published {
            group: group.to_string(),
            entry_id: id,
        });
        Ok(id)
    }
}

fn validate_group(group: &str) -> Result<(), StreamError> {
    if group.trim().is_empty() {
        return Err(StreamError::validation("group must not be blank"));
    }
    Ok(())
}

fn build_fields(message: &str, params: &[(&str, &str)]) -> Result<Vec<(String, String)>, StreamError> {
    let mut fields = Vec::with_capacity(params.len() + 2);
    fields.push((
        MessageKey::FlowId.to_string(),
        flow::current_flow_id().unwrap_or_default(),
    ));
    fields.push((MessageKey::Message.to_string(), message.to_string()));

    for (key, value) in params {
        if MessageKey::is_reserved(key) {
            return Err(StreamError::validation(format!(
                "parameter '{key}' collides with a reserved field"
            )));
        }
        fields.push((key.to_string(), value.to_string()));
    }
    Ok(fields)
}
