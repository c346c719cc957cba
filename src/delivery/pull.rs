//! Pull subscriptions with batch acknowledgment.
//!
//! A pull subscription polls its durable consumer: it fetches up to
//! `fetch_size` messages, sleeps briefly when nothing is pending, and hands
//! non-empty fetches to the batch handler in slices of `batch_size`. A slice
//! whose handler succeeds is acknowledged message by message; a failed slice
//! is left for redelivery.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_nats::jetstream::consumer::PullConsumer;
use backon::BackoffBuilder;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{Delivery, SubscribeOptions, Subscription, LOCAL_SHARED_ACK_WAIT};
use crate::connection::Connection;
use crate::error::{BoxError, BusError, Result};
use crate::metrics::record_processed;
use crate::reconcile::Reconciler;
use crate::retry::fetch_backoff;
use crate::topology::{check_durable_name, ConsumerSpec};

/// Wait before polling again after an empty fetch.
pub const IDLE_SLEEP: Duration = Duration::from_millis(500);

/// Raw message handed to a [`BatchHandler`].
///
/// `payload` is the message body as published; decode it with
/// [`crate::envelope::Envelope::decode`] or
/// [`crate::envelope::decode_ignore_metadata`].
#[derive(Debug, Clone)]
pub struct PulledMessage {
    pub subject: String,
    pub payload: Bytes,
    pub msg_id: Option<String>,
    pub sequence: Option<u64>,
    pub published: Option<DateTime<Utc>>,
}

impl PulledMessage {
    fn from_delivery<D: Delivery + ?Sized>(delivery: &D) -> Self {
        Self {
            subject: delivery.subject().to_string(),
            payload: Bytes::copy_from_slice(delivery.payload()),
            msg_id: delivery.msg_id(),
            sequence: delivery.stream_sequence(),
            published: delivery.published(),
        }
    }
}

/// Handles a batch of pulled messages as a unit.
pub trait BatchHandler: Send + Sync + 'static {
    fn handle(
        &self,
        batch: Vec<PulledMessage>,
    ) -> BoxFuture<'static, std::result::Result<(), BoxError>>;
}

impl<F, Fut> BatchHandler for F
where
    F: Fn(Vec<PulledMessage>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
{
    fn handle(
        &self,
        batch: Vec<PulledMessage>,
    ) -> BoxFuture<'static, std::result::Result<(), BoxError>> {
        Box::pin(self(batch))
    }
}

/// Hand `batch` to `handler` in slices of `batch_size`, acking each
/// successful slice. A slice whose handler exceeds `handler_timeout` counts
/// as failed.
pub async fn process_batch<D: Delivery>(
    subject: &str,
    handler: &dyn BatchHandler,
    batch: &[D],
    batch_size: usize,
    handler_timeout: Duration,
) {
    let batch_size = if batch_size == 0 { batch.len().max(1) } else { batch_size };

    for slice in batch.chunks(batch_size) {
        let started = Instant::now();
        let pulled = slice.iter().map(PulledMessage::from_delivery).collect();

        let outcome = match tokio::time::timeout(handler_timeout, handler.handle(pulled)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(format!("batch handler timed out after {:?}", handler_timeout).into()),
        };

        match outcome {
            Ok(()) => {
                let latency = started.elapsed();
                for message in slice {
                    match message.ack().await {
                        Ok(()) => record_processed(subject, "", "OK", Some(latency)),
                        Err(e) => {
                            error!(subject = %subject, error = %e, "Failed to ack message");
                            record_processed(subject, "", "ACK_ERROR", None);
                        }
                    }
                }
            }
            Err(e) => {
                error!(
                    subject = %subject,
                    count = slice.len(),
                    error = %e,
                    "Failed to process message batch"
                );
                for _ in slice {
                    record_processed(subject, "", "HANDLER_ERROR", None);
                }
            }
        }
    }
}

/// Effective spec of a pull consumer.
pub(crate) fn pull_spec(
    options: &SubscribeOptions,
    subject: &str,
    durable: &str,
    is_local: bool,
) -> Result<ConsumerSpec> {
    if durable.is_empty() {
        return Err(BusError::InvalidOptions(
            "pull subscription requires a durable name".to_string(),
        ));
    }
    check_durable_name(durable)?;

    let spec = options
        .consumer
        .for_subscription(subject, None, is_local.then_some(LOCAL_SHARED_ACK_WAIT))
        .with_durable(durable);
    if spec.deliver_subject().is_some() {
        return Err(BusError::InvalidOptions(
            "pull consumers cannot have a deliver subject".to_string(),
        ));
    }
    Ok(spec)
}

async fn fetch(
    consumer: &PullConsumer,
    fetch_size: usize,
) -> Result<Vec<async_nats::jetstream::Message>> {
    let mut batch = consumer
        .fetch()
        .max_messages(fetch_size)
        .messages()
        .await
        .map_err(|e| BusError::Subscribe(format!("fetch: {}", e)))?;

    let mut messages = Vec::with_capacity(fetch_size);
    while let Some(message) = batch.next().await {
        messages.push(message.map_err(|e| BusError::Subscribe(format!("fetch: {}", e)))?);
    }
    Ok(messages)
}

/// Sleep for `delay` unless shutdown is signalled first. Returns `false` on shutdown.
async fn pause(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.changed() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Pull subscription on durable consumer `durable`.
///
/// The consumer is reconciled with retry first; in local mode the ack wait
/// is shortened to [`LOCAL_SHARED_ACK_WAIT`].
pub async fn pull_subscribe<H: BatchHandler>(
    connection: &Connection,
    reconciler: &Reconciler,
    subject: &str,
    durable: &str,
    options: SubscribeOptions,
    handler: H,
) -> Result<Subscription> {
    let spec = pull_spec(&options, subject, durable, connection.is_local())?;
    let broker = connection.broker().await?;
    let stream = match &options.stream {
        Some(stream) => stream.clone(),
        None => broker.stream_for_subject(subject).await?,
    };
    reconciler.upsert_consumer_with_retry(&stream, &spec).await?;

    let context = connection.jetstream_context().await?;
    let consumer: PullConsumer = context
        .get_stream(&stream)
        .await
        .map_err(|e| BusError::Subscribe(format!("stream {}: {}", stream, e)))?
        .get_consumer(durable)
        .await
        .map_err(|e| BusError::Subscribe(format!("consumer {}: {}", durable, e)))?;

    let handler: Arc<dyn BatchHandler> = Arc::new(handler);
    let pull = options.pull;
    let handler_timeout = options.handler_timeout;
    let route_subject = subject.to_string();
    let subscription = Subscription::spawn(durable, subject, move |mut shutdown| async move {
        let mut backoff = fetch_backoff().build();
        loop {
            if *shutdown.borrow() {
                break;
            }
            let fetched = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                fetched = fetch(&consumer, pull.fetch_size) => fetched,
            };

            match fetched {
                Ok(messages) if messages.is_empty() => {
                    if !pause(&mut shutdown, IDLE_SLEEP).await {
                        break;
                    }
                }
                Ok(messages) => {
                    backoff = fetch_backoff().build();
                    process_batch(
                        &route_subject,
                        handler.as_ref(),
                        &messages,
                        pull.batch_size,
                        handler_timeout,
                    )
                    .await;
                }
                Err(e) => {
                    let delay = backoff.next().unwrap_or(Duration::from_secs(30));
                    warn!(
                        subject = %route_subject,
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        "Fetch failed, retrying after backoff"
                    );
                    if !pause(&mut shutdown, delay).await {
                        break;
                    }
                }
            }
        }
        debug!(subject = %route_subject, "Pull subscription stopped");
    });
    connection.track(subscription.clone()).await;

    info!(stream = %stream, subject = %subject, consumer = %durable, "Pull subscribed");
    Ok(subscription)
}
