//! Delivery pump: push, queue and pull subscriptions.
//!
//! Every delivered message goes through [`handle_message`]:
//! stale check, envelope decode, identity and trace restoration, bounded
//! handler invocation, then acknowledgment according to the outcome.
//!
//! Handlers signal redelivery through [`HandlerError::is_retryable`]: a
//! retryable failure leaves the message unacknowledged so the broker
//! redelivers it after the ack wait; any other failure acknowledges it.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn, Instrument};

use crate::broker::nats::to_chrono;
use crate::broker::MSG_ID_HEADER;
use crate::envelope::Envelope;
use crate::error::{BoxError, BusError, Result};
use crate::identity::Identity;
use crate::metrics::record_processed;
use crate::propagation::{consumer_span, record_error};
use crate::topology::ConsumerSpec;

pub mod pull;
pub mod subscribe;

#[cfg(test)]
pub(crate) mod mock;

pub use pull::{pull_subscribe, BatchHandler, PulledMessage};
pub use subscribe::{queue_subscribe, subscribe};

/// Default bound on a single handler invocation.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// Ack wait applied to push subscriptions in local mode.
pub const LOCAL_PUSH_ACK_WAIT: Duration = Duration::from_secs(2);

/// Ack wait applied to queue and pull subscriptions in local mode.
pub const LOCAL_SHARED_ACK_WAIT: Duration = Duration::from_secs(4);

// ============================================================================
// Handler contract
// ============================================================================

/// Failure reported by a message handler.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct HandlerError {
    retryable: bool,
    #[source]
    source: BoxError,
}

impl HandlerError {
    /// The message should be redelivered.
    pub fn retryable(source: impl Into<BoxError>) -> Self {
        Self {
            retryable: true,
            source: source.into(),
        }
    }

    /// The message should be acknowledged and dropped.
    pub fn permanent(source: impl Into<BoxError>) -> Self {
        Self {
            retryable: false,
            source: source.into(),
        }
    }

    pub(crate) fn timeout(limit: Duration) -> Self {
        Self::retryable(format!("handler timed out after {:?}", limit))
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

/// Metadata of the message being handled.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub subject: String,
    pub msg_id: Option<String>,
    pub sequence: Option<u64>,
    pub identity: Identity,
}

/// Handles decoded message payloads.
///
/// Closures `Fn(MessageContext, Bytes) -> impl Future<Output = Result<(), HandlerError>>`
/// implement this trait.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(
        &self,
        ctx: MessageContext,
        payload: Bytes,
    ) -> BoxFuture<'static, std::result::Result<(), HandlerError>>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(MessageContext, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    fn handle(
        &self,
        ctx: MessageContext,
        payload: Bytes,
    ) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        Box::pin(self(ctx, payload))
    }
}

/// Log a failure of a handler that republishes and return it unchanged.
pub fn handle_push_failure<E: std::fmt::Display>(err: E) -> E {
    error!(error = %err, "Failed to publish from message handler");
    err
}

// ============================================================================
// Delivered messages
// ============================================================================

/// A message delivered by the broker that can be acknowledged.
#[async_trait]
pub trait Delivery: Send + Sync {
    fn subject(&self) -> &str;

    fn payload(&self) -> &[u8];

    fn msg_id(&self) -> Option<String>;

    fn stream_sequence(&self) -> Option<u64>;

    /// When the broker stored the message.
    fn published(&self) -> Option<DateTime<Utc>>;

    async fn ack(&self) -> Result<()>;
}

#[async_trait]
impl Delivery for async_nats::jetstream::Message {
    fn subject(&self) -> &str {
        self.message.subject.as_str()
    }

    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    fn msg_id(&self) -> Option<String> {
        self.message
            .headers
            .as_ref()
            .and_then(|headers| headers.get(MSG_ID_HEADER))
            .map(|value| value.as_str().to_string())
    }

    fn stream_sequence(&self) -> Option<u64> {
        self.info().ok().map(|info| info.stream_sequence)
    }

    fn published(&self) -> Option<DateTime<Utc>> {
        self.info().ok().and_then(|info| to_chrono(info.published))
    }

    async fn ack(&self) -> Result<()> {
        async_nats::jetstream::Message::ack(self)
            .await
            .map_err(|e| BusError::Ack(e.to_string()))
    }
}

/// Outcome of processing one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Ok,
    AckError,
    ProtoUnmarshalError,
    HandlerError,
    Stale,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Ok => "OK",
            MessageStatus::AckError => "ACK_ERROR",
            MessageStatus::ProtoUnmarshalError => "PROTO_UNMARSHAL_ERROR",
            MessageStatus::HandlerError => "HANDLER_ERROR",
            MessageStatus::Stale => "STALE",
        }
    }
}

// ============================================================================
// Options
// ============================================================================

/// Pull subscription sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullOptions {
    /// Messages requested per fetch.
    pub fetch_size: usize,
    /// Messages handed to the batch handler at once; acked together.
    pub batch_size: usize,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            fetch_size: 10,
            batch_size: 10,
        }
    }
}

/// Options shared by every subscription kind.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub consumer: ConsumerSpec,
    /// Bind to this stream instead of looking it up by subject.
    pub stream: Option<String>,
    /// Name of the consumer span opened for traced messages.
    pub span_name: String,
    /// Acknowledge and drop messages stored longer ago than this.
    pub skip_older_than: Option<Duration>,
    pub handler_timeout: Duration,
    pub pull: PullOptions,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            consumer: ConsumerSpec::default(),
            stream: None,
            span_name: String::new(),
            skip_older_than: None,
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            pull: PullOptions::default(),
        }
    }
}

impl SubscribeOptions {
    pub fn new(consumer: ConsumerSpec) -> Self {
        Self {
            consumer,
            ..Default::default()
        }
    }

    pub fn bind(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    pub fn with_span_name(mut self, span_name: impl Into<String>) -> Self {
        self.span_name = span_name.into();
        self
    }

    pub fn skip_older_than(mut self, age: Duration) -> Self {
        self.skip_older_than = Some(age);
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_pull(mut self, pull: PullOptions) -> Self {
        self.pull = pull;
        self
    }
}

/// Where a message was received, for logs, metrics and spans.
#[derive(Debug, Clone)]
pub struct Route {
    pub subject: String,
    pub queue: String,
    pub span_name: String,
    pub skip_older_than: Option<Duration>,
    pub handler_timeout: Duration,
}

impl Route {
    pub fn new(subject: &str, queue: &str, options: &SubscribeOptions) -> Self {
        let span_name = if options.span_name.is_empty() {
            subject.to_string()
        } else {
            options.span_name.clone()
        };
        Self {
            subject: subject.to_string(),
            queue: queue.to_string(),
            span_name,
            skip_older_than: options.skip_older_than,
            handler_timeout: options.handler_timeout,
        }
    }
}

// ============================================================================
// Message handling
// ============================================================================

async fn ack_logged<D: Delivery + ?Sized>(delivery: &D) {
    if let Err(e) = delivery.ack().await {
        error!(error = %e, "Failed to ack message");
    }
}

fn is_stale(published: Option<DateTime<Utc>>, limit: Option<Duration>) -> bool {
    let (Some(published), Some(limit)) = (published, limit) else {
        return false;
    };
    (Utc::now() - published)
        .abs()
        .to_std()
        .is_ok_and(|age| age > limit)
}

/// Process one delivered message and record its outcome.
pub async fn handle_message<D>(
    route: &Route,
    handler: &dyn MessageHandler,
    delivery: &D,
) -> MessageStatus
where
    D: Delivery + ?Sized,
{
    let started = Instant::now();
    let msg_id = delivery.msg_id();
    let sequence = delivery.stream_sequence();

    let status = process(route, handler, delivery, msg_id.clone(), sequence).await;

    match status {
        MessageStatus::Ok => debug!(
            subject = %route.subject,
            queue = %route.queue,
            message_id = ?msg_id,
            sequence = ?sequence,
            "Message processed"
        ),
        MessageStatus::Stale => {}
        other => error!(
            subject = %route.subject,
            queue = %route.queue,
            message_id = ?msg_id,
            sequence = ?sequence,
            status = other.as_str(),
            "Failed to process message"
        ),
    }

    let latency = (status == MessageStatus::Ok).then(|| started.elapsed());
    record_processed(&route.subject, &route.queue, status.as_str(), latency);
    status
}

async fn process<D>(
    route: &Route,
    handler: &dyn MessageHandler,
    delivery: &D,
    msg_id: Option<String>,
    sequence: Option<u64>,
) -> MessageStatus
where
    D: Delivery + ?Sized,
{
    let published = delivery.published();
    if is_stale(published, route.skip_older_than) {
        warn!(
            subject = %route.subject,
            message_id = ?msg_id,
            sequence = ?sequence,
            time_receive_message = ?published,
            "DENY_CONSUME_OLD_MESSAGE"
        );
        ack_logged(delivery).await;
        return MessageStatus::Stale;
    }

    let envelope = match Envelope::decode(delivery.payload()) {
        Ok(envelope) => envelope,
        Err(e) => {
            ack_logged(delivery).await;
            error!(
                subject = %route.subject,
                message_id = ?msg_id,
                error = %e,
                "Failed to decode message envelope"
            );
            return MessageStatus::ProtoUnmarshalError;
        }
    };

    let span = match &envelope.trace {
        Some(info) => consumer_span(&route.span_name, &route.subject, &route.queue, info),
        None => tracing::Span::none(),
    };

    let ctx = MessageContext {
        subject: delivery.subject().to_string(),
        msg_id,
        sequence,
        identity: envelope.identity.clone(),
    };
    let limit = route.handler_timeout;
    let invocation = handler.handle(ctx, envelope.payload);
    let result = envelope
        .identity
        .scope(async move {
            match tokio::time::timeout(limit, invocation).await {
                Ok(result) => result,
                Err(_) => Err(HandlerError::timeout(limit)),
            }
        })
        .instrument(span.clone())
        .await;

    if let Err(e) = result {
        record_error(&span, &e);
        if !e.is_retryable() {
            ack_logged(delivery).await;
        }
        error!(
            subject = %route.subject,
            retryable = e.is_retryable(),
            error = %e,
            "Message handler failed"
        );
        return MessageStatus::HandlerError;
    }

    match delivery.ack().await {
        Ok(()) => MessageStatus::Ok,
        Err(e) => {
            error!(subject = %route.subject, error = %e, "Failed to ack message");
            MessageStatus::AckError
        }
    }
}

// ============================================================================
// Subscription handle
// ============================================================================

struct SubscriptionInner {
    consumer: String,
    subject: String,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running subscription task.
///
/// Clones refer to the same task. [`drain`](Self::drain) signals shutdown
/// and waits until the in-flight message, if any, has been handled.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("consumer", &self.inner.consumer)
            .field("subject", &self.inner.subject)
            .finish()
    }
}

impl Subscription {
    /// Spawn `run` with a receiver that flips to `true` on shutdown.
    pub(crate) fn spawn<F, Fut>(
        consumer: impl Into<String>,
        subject: impl Into<String>,
        run: F,
    ) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, receiver) = watch::channel(false);
        let task = tokio::spawn(run(receiver));
        Self {
            inner: Arc::new(SubscriptionInner {
                consumer: consumer.into(),
                subject: subject.into(),
                shutdown,
                task: Mutex::new(Some(task)),
            }),
        }
    }

    pub fn consumer(&self) -> &str {
        &self.inner.consumer
    }

    pub fn subject(&self) -> &str {
        &self.inner.subject
    }

    pub async fn is_active(&self) -> bool {
        self.inner
            .task
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stop receiving and wait for the task to finish. Idempotent.
    pub async fn drain(&self) -> Result<()> {
        let _ = self.inner.shutdown.send(true);
        let task = self.inner.task.lock().await.take();
        if let Some(task) = task {
            task.await
                .map_err(|e| BusError::Subscribe(format!("subscription task failed: {}", e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
