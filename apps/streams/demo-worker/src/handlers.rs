//! Demo stream handlers

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stream_groups::{HandlerError, StreamEntry, StreamHandler};
use tracing::info;

pub const ORDERS_GROUP: &str = "orders";
pub const AUDIT_GROUP: &str = "audit";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    #[serde(default)]
    pub amount_cents: u64,
}

/// Logs each order. Malformed payloads are permanent failures.
pub struct OrderHandler;

#[async_trait]
impl StreamHandler for OrderHandler {
    async fn consume(&self, entry: &StreamEntry) -> Result<(), HandlerError> {
        let raw = entry
            .message()
            .ok_or_else(|| HandlerError::permanent("order entry has no message"))?;
        let order: Order = serde_json::from_str(raw)?;

        if order.amount_cents == 0 {
            return Err(HandlerError::permanent(format!("order {} has no amount", order.id)));
        }

        info!(
            order_id = order.id,
            amount_cents = order.amount_cents,
            entry_id = %entry.id,
            published_at = %entry.timestamp(),
            "Order received"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "OrderHandler"
    }
}

/// Records every entry it sees along with its parameters.
pub struct AuditHandler;

#[async_trait]
impl StreamHandler for AuditHandler {
    async fn consume(&self, entry: &StreamEntry) -> Result<(), HandlerError> {
        let params: Vec<String> = entry.params().map(|(k, v)| format!("{k}={v}")).collect();
        info!(
            entry_id = %entry.id,
            flow_id = entry.flow_id(),
            params = %params.join(","),
            message = entry.message().unwrap_or_default(),
            "Audit record"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "AuditHandler"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use stream_groups::EntryId;

    fn entry(message: &str) -> StreamEntry {
        let mut fields = BTreeMap::new();
        fields.insert("flowId".to_string(), "flow-1".to_string());
        fields.insert("message".to_string(), message.to_string());
        StreamEntry::new(EntryId::new(1_700_000_000_000, 0), fields)
    }

    #[tokio::test]
    async fn test_order_handler_accepts_valid_order() {
        let result = OrderHandler
            .consume(&entry(r#"{"id":1,"amount_cents":1299}"#))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_order_handler_rejects_garbage_permanently() {
        let err = OrderHandler.consume(&entry("{not json")).await.unwrap_err();
        assert!(err.is_permanent());

        let err = OrderHandler.consume(&entry(r#"{"id":2}"#)).await.unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn test_audit_handler_accepts_anything() {
        assert!(AuditHandler.consume(&entry("free text")).await.is_ok());
    }
}
