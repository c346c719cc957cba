use std::sync::atomic::{AtomicUsize, Ordering};

use super::mock::MockDelivery;
use super::*;
use crate::envelope::{B3Context, TraceInfo};

fn route() -> Route {
    Route::new("lesson.created", "", &SubscribeOptions::default())
}

fn counting_handler(
    calls: Arc<AtomicUsize>,
    outcome: fn() -> std::result::Result<(), HandlerError>,
) -> impl MessageHandler {
    move |_ctx: MessageContext, _payload: Bytes| {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            outcome()
        }
    }
}

fn succeed() -> std::result::Result<(), HandlerError> {
    Ok(())
}

fn fail_retryable() -> std::result::Result<(), HandlerError> {
    Err(HandlerError::retryable("database unavailable"))
}

fn fail_permanent() -> std::result::Result<(), HandlerError> {
    Err(HandlerError::permanent("invalid lesson"))
}

// ============================================================================
// Outcomes
// ============================================================================

#[tokio::test]
async fn test_success_acks_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = counting_handler(calls.clone(), succeed);
    let delivery = MockDelivery::enveloped("lesson.created", b"x", Identity::default());

    let status = handle_message(&route(), &handler, &delivery).await;

    assert_eq!(status, MessageStatus::Ok);
    assert_eq!(delivery.acks(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_retryable_error_leaves_unacked() {
    let handler = counting_handler(Arc::new(AtomicUsize::new(0)), fail_retryable);
    let delivery = MockDelivery::enveloped("lesson.created", b"x", Identity::default());

    let status = handle_message(&route(), &handler, &delivery).await;

    assert_eq!(status, MessageStatus::HandlerError);
    assert_eq!(delivery.acks(), 0);
}

#[tokio::test]
async fn test_permanent_error_acks_once() {
    let handler = counting_handler(Arc::new(AtomicUsize::new(0)), fail_permanent);
    let delivery = MockDelivery::enveloped("lesson.created", b"x", Identity::default());

    let status = handle_message(&route(), &handler, &delivery).await;

    assert_eq!(status, MessageStatus::HandlerError);
    assert_eq!(delivery.acks(), 1);
}

#[tokio::test]
async fn test_malformed_envelope_acked_without_handler() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = counting_handler(calls.clone(), succeed);
    let delivery = MockDelivery::raw("lesson.created", vec![0xff, 0xff, 0xff]);

    let status = handle_message(&route(), &handler, &delivery).await;

    assert_eq!(status, MessageStatus::ProtoUnmarshalError);
    assert_eq!(delivery.acks(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_stale_message_acked_and_dropped() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = counting_handler(calls.clone(), succeed);
    let options = SubscribeOptions::default().skip_older_than(Duration::from_secs(60));
    let route = Route::new("lesson.created", "", &options);
    let delivery = MockDelivery::enveloped("lesson.created", b"x", Identity::default())
        .published_at(Utc::now() - chrono::Duration::minutes(10));

    let status = handle_message(&route, &handler, &delivery).await;

    assert_eq!(status, MessageStatus::Stale);
    assert_eq!(delivery.acks(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_fresh_message_within_limit_is_handled() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = counting_handler(calls.clone(), succeed);
    let options = SubscribeOptions::default().skip_older_than(Duration::from_secs(60));
    let route = Route::new("lesson.created", "", &options);
    let delivery = MockDelivery::enveloped("lesson.created", b"x", Identity::default());

    let status = handle_message(&route, &handler, &delivery).await;

    assert_eq!(status, MessageStatus::Ok);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_ack_failure_reported() {
    let handler = counting_handler(Arc::new(AtomicUsize::new(0)), succeed);
    let delivery =
        MockDelivery::enveloped("lesson.created", b"x", Identity::default()).failing_ack();

    let status = handle_message(&route(), &handler, &delivery).await;

    assert_eq!(status, MessageStatus::AckError);
}

#[tokio::test]
async fn test_handler_timeout_is_retryable() {
    let handler = |_ctx: MessageContext, _payload: Bytes| async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok::<(), HandlerError>(())
    };
    let options = SubscribeOptions::default().with_handler_timeout(Duration::from_millis(50));
    let route = Route::new("lesson.created", "", &options);
    let delivery = MockDelivery::enveloped("lesson.created", b"x", Identity::default());

    let status = handle_message(&route, &handler, &delivery).await;

    assert_eq!(status, MessageStatus::HandlerError);
    assert_eq!(delivery.acks(), 0);
}

// ============================================================================
// Context restoration
// ============================================================================

#[tokio::test]
async fn test_handler_sees_identity_and_payload() {
    let seen = Arc::new(tokio::sync::Mutex::new(None));
    let sink = Arc::clone(&seen);
    let handler = move |ctx: MessageContext, payload: Bytes| {
        let sink = Arc::clone(&sink);
        async move {
            *sink.lock().await = Some((ctx, payload, Identity::current()));
            Ok::<(), HandlerError>(())
        }
    };
    let identity = Identity::new("org-7", "teacher-3");
    let delivery =
        MockDelivery::enveloped("lesson.created", b"payload", identity.clone()).with_sequence(42);

    handle_message(&route(), &handler, &delivery).await;

    let (ctx, payload, ambient) = seen.lock().await.take().expect("handler ran");
    assert_eq!(payload.as_ref(), b"payload");
    assert_eq!(ctx.identity, identity);
    assert_eq!(ctx.sequence, Some(42));
    assert_eq!(ctx.msg_id.as_deref(), Some("msg-1"));
    assert_eq!(ambient, identity);
}

#[tokio::test]
async fn test_traced_message_is_handled() {
    let handler = counting_handler(Arc::new(AtomicUsize::new(0)), succeed);
    let envelope = Envelope::new(Bytes::from_static(b"x"), Identity::default()).with_trace(Some(
        TraceInfo::B3(B3Context {
            trace_id: "4bf92f3577b34da6a3ce929d0e0e4736".to_string(),
            span_id: "00f067aa0ba902b7".to_string(),
            sampled: true,
            ..Default::default()
        }),
    ));
    let delivery = MockDelivery::from_envelope("lesson.created", &envelope);

    let status = handle_message(&route(), &handler, &delivery).await;

    assert_eq!(status, MessageStatus::Ok);
}

// ============================================================================
// Misc
// ============================================================================

#[test]
fn test_status_labels() {
    assert_eq!(MessageStatus::Ok.as_str(), "OK");
    assert_eq!(MessageStatus::AckError.as_str(), "ACK_ERROR");
    assert_eq!(MessageStatus::ProtoUnmarshalError.as_str(), "PROTO_UNMARSHAL_ERROR");
    assert_eq!(MessageStatus::HandlerError.as_str(), "HANDLER_ERROR");
    assert_eq!(MessageStatus::Stale.as_str(), "STALE");
}

#[test]
fn test_route_span_name_defaults_to_subject() {
    assert_eq!(route().span_name, "lesson.created");
    let named = Route::new(
        "lesson.created",
        "q",
        &SubscribeOptions::default().with_span_name("SyncLesson"),
    );
    assert_eq!(named.span_name, "SyncLesson");
    assert_eq!(named.queue, "q");
}

#[test]
fn test_handle_push_failure_returns_error() {
    let err = handle_push_failure(BusError::Publish("boom".to_string()));
    assert!(matches!(err, BusError::Publish(_)));
}

#[tokio::test]
async fn test_drain_stops_task_and_is_idempotent() {
    let subscription = Subscription::spawn("sync", "lesson.created", |mut shutdown| async move {
        let _ = shutdown.changed().await;
    });
    assert!(subscription.is_active().await);

    subscription.drain().await.unwrap();
    subscription.clone().drain().await.unwrap();

    assert!(!subscription.is_active().await);
    assert_eq!(subscription.consumer(), "sync");
}
