//! End-to-end consumer group behavior against the in-memory stream client.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stream_groups::{
    Bootstrap, ClientPools, HandlerDescriptor, HandlerError, HandlerRegistry,
    InMemoryStreamClient, LeavePending, LifecycleCoordinator, ProducerSettings, Publisher,
    ReadFrom, ReadGroup, RunningGroups, StaticGroupConfigs, StreamClient, StreamEntry,
    StreamGroupConfig, StreamHandler, flow, handler_fn, stream_key,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("stream_groups=debug")
        .try_init();
}

fn group_config(group: &str) -> StreamGroupConfig {
    StreamGroupConfig::new(group, group)
        .with_read_timeout_ms(25)
        .with_retry_delay_ms(0)
        .with_consumer_prefix("it")
}

/// Records every delivery and fails the first `failures` attempts.
struct RecordingHandler {
    failures: u32,
    attempts: AtomicU32,
    seen: Mutex<Vec<(String, Option<String>, Option<String>)>>,
}

impl RecordingHandler {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            attempts: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// `(message, flow id seen by the handler, flowId field)` per delivery.
    fn seen(&self) -> Vec<(String, Option<String>, Option<String>)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl StreamHandler for RecordingHandler {
    async fn consume(&self, entry: &StreamEntry) -> Result<(), HandlerError> {
        self.seen.lock().unwrap().push((
            entry.message().unwrap_or_default().to_string(),
            flow::current_flow_id(),
            entry.param("flowId").map(str::to_string),
        ));

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            return Err(HandlerError::transient(format!("attempt {attempt} failed")));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "RecordingHandler"
    }
}

type Registration = (StreamGroupConfig, usize, Arc<dyn StreamHandler>);

fn reg(config: StreamGroupConfig, threads: usize, handler: Arc<dyn StreamHandler>) -> Registration {
    (config, threads, handler)
}

fn start(client: &InMemoryStreamClient, registrations: Vec<Registration>) -> RunningGroups {
    let mut registry = HandlerRegistry::new();
    let mut configs = StaticGroupConfigs::new();
    for (config, threads, handler) in registrations {
        registry
            .register(HandlerDescriptor::new(
                config.config_key.clone(),
                config.group.clone(),
                threads,
                handler,
            ))
            .unwrap();
        configs = configs.with(config);
    }

    Bootstrap::new(ClientPools::single(client.clone()), registry)
        .with_config_source(Arc::new(configs))
        .start()
        .unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_exactly_n_workers_per_group() {
    init_tracing();
    let client = InMemoryStreamClient::new();
    let running = start(
        &client,
        vec![
            reg(group_config("orders"), 3, RecordingHandler::new(0)),
            reg(group_config("audit"), 1, RecordingHandler::new(0)),
            reg(group_config("billing").with_consumer_threads(2), 5, RecordingHandler::new(0)),
        ],
    );

    assert_eq!(running.active_workers_for("orders"), 3);
    assert_eq!(running.active_workers_for("audit"), 1);
    assert_eq!(running.active_workers_for("billing"), 2);
    assert_eq!(running.active_workers(), 6);

    let coordinator = Arc::clone(running.coordinator());
    running.shutdown().await;
    assert_eq!(coordinator.active_workers(), 0);
    assert_eq!(coordinator.release_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_published_message_reaches_handler_with_flow_id() {
    init_tracing();
    let client = InMemoryStreamClient::new();
    let handler = RecordingHandler::new(0);
    let running = start(&client, vec![reg(group_config("orders"), 1, handler.clone())]);

    let publisher = Publisher::new(client.clone(), ProducerSettings::default());
    flow::with_flow_id("flow-123", publisher.publish("orders", "{\"id\":1}", &[]))
        .await
        .unwrap();

    wait_until(|| client.ack_count("ordersStream", "orders") == 1).await;
    running.shutdown().await;

    assert_eq!(
        handler.seen(),
        vec![(
            "{\"id\":1}".to_string(),
            Some("flow-123".to_string()),
            Some("flow-123".to_string())
        )]
    );
}

#[tokio::test]
async fn test_orders_succeed_on_third_delivery() {
    init_tracing();
    let client = InMemoryStreamClient::new();
    let handler = RecordingHandler::new(2);
    let running = start(
        &client,
        vec![reg(group_config("orders").with_retry_count(2), 1, handler.clone())],
    );

    Publisher::new(client.clone(), ProducerSettings::default())
        .publish("orders", "{\"id\":1}", &[])
        .await
        .unwrap();

    wait_until(|| client.ack_count("ordersStream", "orders") == 1).await;
    running.shutdown().await;

    assert_eq!(handler.attempts(), 3);
    assert_eq!(client.pending_count("ordersStream", "orders"), 0);

    // Nothing is left for the group.
    let consumer = group_config("orders").consumer_name(0);
    let next = client
        .read_group(ReadGroup {
            key: &stream_key("orders"),
            group: "orders",
            consumer: &consumer,
            from: ReadFrom::New,
            block_ms: 0,
            count: 10,
        })
        .await
        .unwrap();
    assert!(next.is_empty());
}

#[tokio::test]
async fn test_always_failing_entry_is_dropped_after_budget() {
    init_tracing();
    let client = InMemoryStreamClient::new();
    let handler = RecordingHandler::new(u32::MAX);
    let running = start(
        &client,
        vec![reg(group_config("orders").with_retry_count(2), 1, handler.clone())],
    );

    Publisher::new(client.clone(), ProducerSettings::default())
        .publish("orders", "poison", &[])
        .await
        .unwrap();

    wait_until(|| client.ack_count("ordersStream", "orders") == 1).await;
    // Give the worker a few more cycles to prove nothing is redelivered.
    tokio::time::sleep(Duration::from_millis(100)).await;
    running.shutdown().await;

    assert_eq!(handler.attempts(), 3);
    assert_eq!(client.pending_count("ordersStream", "orders"), 0);
}

#[tokio::test]
async fn test_leave_pending_policy_keeps_entry_unacknowledged() {
    init_tracing();
    let client = InMemoryStreamClient::new();
    let handler = RecordingHandler::new(u32::MAX);

    let registry = HandlerRegistry::new()
        .with(HandlerDescriptor::new("orders", "orders", 1, handler.clone()))
        .unwrap();
    let running = Bootstrap::new(ClientPools::single(client.clone()), registry)
        .with_config_source(Arc::new(
            StaticGroupConfigs::new().with(group_config("orders").with_retry_count(1)),
        ))
        .with_exhaustion_policy(Arc::new(LeavePending))
        .start()
        .unwrap();

    Publisher::new(client.clone(), ProducerSettings::default())
        .publish("orders", "poison", &[])
        .await
        .unwrap();

    wait_until(|| handler.attempts() == 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    running.shutdown().await;

    assert_eq!(handler.attempts(), 2);
    assert_eq!(client.ack_count("ordersStream", "orders"), 0);
    assert_eq!(client.pending_count("ordersStream", "orders"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_workers_share_the_group_without_duplicates() {
    init_tracing();
    let client = InMemoryStreamClient::new();
    let handler = RecordingHandler::new(0);
    let running = start(
        &client,
        vec![reg(group_config("orders").with_batch_size(3), 3, handler.clone())],
    );

    let publisher = Publisher::new(client.clone(), ProducerSettings::default());
    for i in 0..30 {
        publisher
            .publish("orders", &format!("{{\"id\":{i}}}"), &[])
            .await
            .unwrap();
    }

    wait_until(|| client.ack_count("ordersStream", "orders") == 30).await;
    running.shutdown().await;

    let mut messages: Vec<_> = handler.seen().into_iter().map(|(m, _, _)| m).collect();
    messages.sort();
    messages.dedup();
    assert_eq!(messages.len(), 30);
    assert_eq!(handler.attempts(), 30);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handlers_sharing_a_group_keep_their_own_pending_entries() {
    init_tracing();
    let client = InMemoryStreamClient::new();
    let failing = RecordingHandler::new(u32::MAX);
    let succeeding = RecordingHandler::new(0);
    let shared = |key: &str| {
        StreamGroupConfig::new(key, "orders")
            .with_read_timeout_ms(25)
            .with_retry_count(5)
            .with_retry_delay_ms(0)
            .with_consumer_prefix("it")
    };
    assert_ne!(shared("orders-a").consumer_name(0), shared("orders-b").consumer_name(0));

    let running = start(
        &client,
        vec![
            reg(shared("orders-a"), 1, failing.clone()),
            reg(shared("orders-b"), 1, succeeding.clone()),
        ],
    );

    let publisher = Publisher::new(client.clone(), ProducerSettings::default());
    for i in 0..20 {
        publisher
            .publish("orders", &format!("{{\"id\":{i}}}"), &[])
            .await
            .unwrap();
    }

    wait_until(|| client.ack_count("ordersStream", "orders") == 20).await;
    running.shutdown().await;

    // Every entry the failing handler received spent its whole budget there.
    let (a_calls, b_calls) = (failing.attempts(), succeeding.attempts());
    assert_eq!(a_calls % 6, 0, "a_calls={a_calls} b_calls={b_calls}");
    assert_eq!(b_calls + a_calls / 6, 20, "a_calls={a_calls} b_calls={b_calls}");
}

#[tokio::test]
async fn test_restart_recovers_entries_left_pending() {
    init_tracing();
    let client = InMemoryStreamClient::new();
    client.create_group("ordersStream", "orders").await.unwrap();

    // The first run stops right after its first dispatch.
    let first_run = Arc::new(Mutex::new(None::<Arc<LifecycleCoordinator>>));
    let stopper = Arc::clone(&first_run);
    let handler = Arc::new(handler_fn("stops", move |_entry| {
        let stopper = Arc::clone(&stopper);
        async move {
            loop {
                let coordinator = stopper.lock().unwrap().clone();
                if let Some(coordinator) = coordinator {
                    coordinator.request_stop();
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
    }));

    let publisher = Publisher::new(client.clone(), ProducerSettings::default());
    for i in 0..3 {
        publisher.publish("orders", &i.to_string(), &[]).await.unwrap();
    }

    let running = start(&client, vec![reg(group_config("orders"), 1, handler)]);
    *first_run.lock().unwrap() = Some(Arc::clone(running.coordinator()));
    running.coordinator().stop_requested().await;
    running.shutdown().await;

    assert_eq!(client.ack_count("ordersStream", "orders"), 1);
    assert_eq!(client.pending_count("ordersStream", "orders"), 2);

    // A second run under the same consumer names picks up the rest.
    let recovering = RecordingHandler::new(0);
    let running = start(&client, vec![reg(group_config("orders"), 1, recovering.clone())]);
    wait_until(|| client.ack_count("ordersStream", "orders") == 3).await;
    running.shutdown().await;

    assert_eq!(recovering.attempts(), 2);
    assert_eq!(client.pending_count("ordersStream", "orders"), 0);
}

#[tokio::test]
async fn test_ttl_and_max_len_only_when_configured() {
    let client = InMemoryStreamClient::new();
    let pools = ClientPools::single(client.clone());

    let plain = Publisher::from_config(&pools, &group_config("plain")).unwrap();
    let bounded = Publisher::from_config(
        &pools,
        &group_config("bounded")
            .with_producer_max_len(2)
            .with_producer_ttl_secs(120),
    )
    .unwrap();

    for i in 0..5 {
        plain.publish("plain", &i.to_string(), &[]).await.unwrap();
        bounded.publish("bounded", &i.to_string(), &[]).await.unwrap();
    }

    assert_eq!(client.len("plainStream"), 5);
    assert_eq!(client.ttl("plainStream"), None);
    assert_eq!(client.len("boundedStream"), 2);
    assert_eq!(client.ttl("boundedStream"), Some(120));
}
