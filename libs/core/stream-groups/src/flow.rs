//! Ambient flow id
//!
//! The publisher stamps the current flow id onto every entry, and the
//! dispatcher runs each handler inside the flow id of the entry it consumes,
//! so correlation survives the hop through the stream.

use std::future::Future;

tokio::task_local! {
    static FLOW_ID: String;
}

/// Run `fut` with `flow_id` as the ambient flow id.
pub async fn with_flow_id<F>(flow_id: impl Into<String>, fut: F) -> F::Output
where
    F: Future,
{
    FLOW_ID.scope(flow_id.into(), fut).await
}

/// The ambient flow id, if any. Blank ids count as absent.
pub fn current_flow_id() -> Option<String> {
    FLOW_ID
        .try_with(|id| id.clone())
        .ok()
        .filter(|id| !id.is_empty())
}
