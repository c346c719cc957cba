//! NATS JetStream integration tests using testcontainers.
//!
//! Run with: cargo test --test jetstream_nats --features integration -- --nocapture
//!
//! These tests spin up NATS with JetStream in a container using testcontainers-rs.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use jetbus::envelope::Envelope;
use jetbus::{
    BoxError, ConnectOptions, ConsumerAction, ConsumerSpec, HandlerError, Identity,
    JetStreamManager, MessageContext, PulledMessage, RetentionPolicy, StreamAction, StreamSpec,
    SubscribeOptions, TraceFormat,
};
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};
use tokio::sync::mpsc;

const USER: &str = "svc";
const PASSWORD: &str = "secret";

/// Start NATS container with JetStream and user/password auth enabled.
async fn start_nats() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let image = GenericImage::new("nats", "2.10")
        .with_exposed_port(4222.tcp())
        .with_wait_for(WaitFor::message_on_stderr(
            "Listening for client connections",
        ))
        .with_cmd(vec!["-js", "--user", USER, "--pass", PASSWORD]);

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start NATS container");

    let host_port = container
        .get_host_port_ipv4(4222)
        .await
        .expect("Failed to get mapped port");

    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let url = format!("nats://{}:{}", host, host_port);
    println!("NATS available at: {}", url);

    (container, url)
}

async fn manager(url: &str) -> JetStreamManager {
    let options = ConnectOptions::new(url, USER, PASSWORD)
        .with_local(true)
        .with_name("jetbus-it");
    JetStreamManager::connect(options, TraceFormat::B3)
        .await
        .expect("Failed to connect")
}

fn test_prefix() -> String {
    format!(
        "T{}",
        uuid::Uuid::new_v4().simple().to_string()[..8].to_uppercase()
    )
}

#[tokio::test]
async fn test_stream_reconciliation_converges() {
    println!("=== test_stream_reconciliation_converges ===");
    let (_container, url) = start_nats().await;
    let bus = manager(&url).await;
    let name = test_prefix();
    let spec = StreamSpec::new(&name, [format!("{}.>", name.to_lowercase())]);

    assert_eq!(bus.upsert_stream(&spec).await.unwrap(), StreamAction::Create);
    assert_eq!(bus.upsert_stream(&spec).await.unwrap(), StreamAction::Unchanged);

    let widened = StreamSpec::new(
        &name,
        [
            format!("{}.>", name.to_lowercase()),
            format!("{}_audit.>", name.to_lowercase()),
        ],
    );
    assert_eq!(bus.upsert_stream(&widened).await.unwrap(), StreamAction::Update);

    let work_queue = widened.clone().with_retention(RetentionPolicy::WorkQueue);
    assert_eq!(
        bus.upsert_stream(&work_queue).await.unwrap(),
        StreamAction::Recreate
    );

    bus.close().await;
    println!("  PASSED");
}

#[tokio::test]
async fn test_consumer_reconciliation_converges() {
    println!("=== test_consumer_reconciliation_converges ===");
    let (_container, url) = start_nats().await;
    let bus = manager(&url).await;
    let name = test_prefix();
    let subject = format!("{}.created", name.to_lowercase());
    bus.upsert_stream(&StreamSpec::new(&name, [format!("{}.>", name.to_lowercase())]))
        .await
        .unwrap();

    let spec = ConsumerSpec::builder()
        .durable("projector")
        .filter_subject(&subject)
        .deliver_subject(format!("_deliver.{}.projector", name))
        .max_deliver(5)
        .build()
        .unwrap();
    assert_eq!(
        bus.upsert_consumer(&name, &spec).await.unwrap(),
        ConsumerAction::Create
    );
    assert_eq!(
        bus.upsert_consumer(&name, &spec).await.unwrap(),
        ConsumerAction::Unchanged
    );

    let changed = ConsumerSpec::builder()
        .durable("projector")
        .filter_subject(&subject)
        .deliver_subject(format!("_deliver.{}.projector", name))
        .max_deliver(10)
        .build()
        .unwrap();
    let ConsumerAction::Recreate { changed } = bus.upsert_consumer(&name, &changed).await.unwrap()
    else {
        panic!("expected recreate");
    };
    assert_eq!(changed, vec!["max_deliver"]);

    bus.close().await;
    println!("  PASSED");
}

#[tokio::test]
async fn test_queue_subscribe_restores_identity() {
    println!("=== test_queue_subscribe_restores_identity ===");
    let (_container, url) = start_nats().await;
    let bus = manager(&url).await;
    let name = test_prefix();
    let subject = format!("{}.created", name.to_lowercase());
    bus.upsert_stream(&StreamSpec::new(&name, [format!("{}.>", name.to_lowercase())]))
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::channel(10);
    bus.queue_subscribe(
        &subject,
        "lesson-sync",
        SubscribeOptions::default(),
        move |ctx: MessageContext, payload: Bytes| {
            let tx = tx.clone();
            async move {
                tx.send((ctx, payload, Identity::current()))
                    .await
                    .map_err(HandlerError::retryable)
            }
        },
    )
    .await
    .expect("Failed to subscribe");

    let identity = Identity::new("org-1", "teacher-9");
    let ack = identity
        .clone()
        .scope(bus.publish(&subject, b"lesson-1".to_vec()))
        .await
        .expect("Failed to publish");
    assert_eq!(ack.stream, name);
    assert!(!ack.duplicate);

    let (ctx, payload, ambient) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("Timeout waiting for message")
        .expect("Channel closed");

    assert_eq!(payload.as_ref(), b"lesson-1");
    assert_eq!(ctx.identity, identity);
    assert_eq!(ambient, identity);
    assert_eq!(ctx.sequence, Some(ack.sequence));
    assert_eq!(bus.connection().subscription_count().await, 1);

    bus.close().await;
    assert_eq!(bus.connection().subscription_count().await, 0);
    println!("  PASSED");
}

#[tokio::test]
async fn test_retryable_error_redelivers() {
    println!("=== test_retryable_error_redelivers ===");
    let (_container, url) = start_nats().await;
    let bus = manager(&url).await;
    let name = test_prefix();
    let subject = format!("{}.created", name.to_lowercase());
    bus.upsert_stream(&StreamSpec::new(&name, [format!("{}.>", name.to_lowercase())]))
        .await
        .unwrap();

    let attempts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::channel(10);
    let counter = Arc::clone(&attempts);
    bus.queue_subscribe(
        &subject,
        "flaky",
        SubscribeOptions::default(),
        move |_ctx: MessageContext, _payload: Bytes| {
            let counter = Arc::clone(&counter);
            let tx = tx.clone();
            async move {
                let attempt = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                if attempt == 1 {
                    return Err(HandlerError::retryable("not yet"));
                }
                tx.send(attempt).await.map_err(HandlerError::permanent)
            }
        },
    )
    .await
    .expect("Failed to subscribe");

    bus.publish(&subject, b"x".to_vec()).await.unwrap();

    // Local mode ack wait for queue consumers is 4s.
    let attempt = tokio::time::timeout(Duration::from_secs(15), rx.recv())
        .await
        .expect("Timeout waiting for redelivery")
        .expect("Channel closed");
    assert_eq!(attempt, 2);

    bus.close().await;
    println!("  PASSED");
}

#[tokio::test]
async fn test_pull_subscribe_acks_batches() {
    println!("=== test_pull_subscribe_acks_batches ===");
    let (_container, url) = start_nats().await;
    let bus = manager(&url).await;
    let name = test_prefix();
    let subject = format!("{}.created", name.to_lowercase());
    bus.upsert_stream(&StreamSpec::new(&name, [format!("{}.>", name.to_lowercase())]))
        .await
        .unwrap();

    for i in 0..5u8 {
        bus.publish(&subject, vec![i]).await.unwrap();
    }

    let (tx, mut rx) = mpsc::channel(10);
    bus.pull_subscribe(
        &subject,
        "batcher",
        SubscribeOptions::default(),
        move |batch: Vec<PulledMessage>| {
            let tx = tx.clone();
            async move {
                let payloads = batch
                    .iter()
                    .map(|m| Envelope::decode(&m.payload).map(|e| e.payload))
                    .collect::<Result<Vec<_>, _>>()?;
                tx.send(payloads).await?;
                Ok::<(), BoxError>(())
            }
        },
    )
    .await
    .expect("Failed to pull subscribe");

    let mut received = Vec::new();
    while received.len() < 5 {
        let batch = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("Timeout waiting for batch")
            .expect("Channel closed");
        received.extend(batch);
    }

    let expected: Vec<Bytes> = (0..5u8).map(|i| Bytes::from(vec![i])).collect();
    assert_eq!(received, expected);

    bus.close().await;
    println!("  PASSED");
}

#[tokio::test]
async fn test_async_publish_completes() {
    println!("=== test_async_publish_completes ===");
    let (_container, url) = start_nats().await;
    let bus = manager(&url).await;
    let name = test_prefix();
    let subject = format!("{}.created", name.to_lowercase());
    bus.upsert_stream(&StreamSpec::new(&name, [format!("{}.>", name.to_lowercase())]))
        .await
        .unwrap();

    let first = bus.publish_async(&subject, b"a".to_vec()).await.unwrap();
    let second = bus
        .traced_publish_async("CreateLesson", &subject, b"b".to_vec())
        .await
        .unwrap();
    assert_ne!(first.msg_id(), second.msg_id());

    assert_eq!(first.wait().await.unwrap().sequence, 1);
    assert_eq!(second.wait().await.unwrap().sequence, 2);

    let unknown = bus.publish("nowhere.created", b"x".to_vec()).await;
    assert!(unknown.is_err());

    bus.close().await;
    println!("  PASSED");
}

#[tokio::test]
async fn test_publish_after_close_fails() {
    println!("=== test_publish_after_close_fails ===");
    let (_container, url) = start_nats().await;
    let bus = manager(&url).await;
    let name = test_prefix();
    let subject = format!("{}.created", name.to_lowercase());
    bus.upsert_stream(&StreamSpec::new(&name, [format!("{}.>", name.to_lowercase())]))
        .await
        .unwrap();
    bus.publish(&subject, b"before".to_vec()).await.unwrap();

    bus.close().await;

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        bus.publish(&subject, b"after".to_vec()),
    )
    .await
    .expect("Publish after close hung");
    assert!(result.is_err());
    assert!(!bus.connection().is_connected().await);
    println!("  PASSED");
}
