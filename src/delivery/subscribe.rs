//! Push and queue subscriptions.

use std::sync::Arc;

use async_nats::jetstream::consumer::{push, PushConsumer};
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::{
    handle_message, MessageHandler, Route, SubscribeOptions, Subscription, LOCAL_PUSH_ACK_WAIT,
    LOCAL_SHARED_ACK_WAIT,
};
use crate::broker::nats::push_config;
use crate::connection::Connection;
use crate::error::{BusError, Result};
use crate::reconcile::Reconciler;
use crate::topology::{check_durable_name, ConsumerSpec};

/// Deliver subject of a durable push consumer that did not declare one.
pub fn deliver_subject_for(stream: &str, durable: &str) -> String {
    format!("_deliver.{}.{}", stream, durable)
}

/// Resolve the stream and the effective consumer spec of a push subscription,
/// reconciling durable consumers on the broker.
pub(crate) async fn prepare_push(
    connection: &Connection,
    reconciler: &Reconciler,
    subject: &str,
    queue: Option<&str>,
    options: &SubscribeOptions,
) -> Result<(String, ConsumerSpec)> {
    let broker = connection.broker().await?;
    let stream = match &options.stream {
        Some(stream) => stream.clone(),
        None => broker.stream_for_subject(subject).await?,
    };

    let local_ack_wait = connection.is_local().then_some(match queue {
        Some(_) => LOCAL_SHARED_ACK_WAIT,
        None => LOCAL_PUSH_ACK_WAIT,
    });
    let mut spec = options.consumer.for_subscription(subject, queue, local_ack_wait);

    if let Some(queue) = queue {
        if queue.is_empty() {
            return Err(BusError::InvalidOptions("queue name is empty".to_string()));
        }
        if spec.durable_name().is_none() {
            check_durable_name(queue)?;
            spec = spec.with_durable(queue);
        }
    }

    if let Some(durable) = spec.durable_name().map(str::to_string) {
        if spec.deliver_subject().is_none() {
            spec = spec.with_deliver_subject(deliver_subject_for(&stream, &durable));
        }
        reconciler.upsert_consumer_with_retry(&stream, &spec).await?;
    }

    Ok((stream, spec))
}

async fn open_push(
    connection: &Connection,
    stream: &str,
    spec: ConsumerSpec,
) -> Result<(String, push::Messages)> {
    let context = connection.jetstream_context().await?;
    let handle = context
        .get_stream(stream)
        .await
        .map_err(|e| BusError::Subscribe(format!("stream {}: {}", stream, e)))?;

    let consumer: PushConsumer = match spec.durable_name() {
        Some(durable) => handle
            .get_consumer(durable)
            .await
            .map_err(|e| BusError::Subscribe(format!("consumer {}: {}", durable, e)))?,
        None => {
            let spec = match spec.deliver_subject() {
                Some(_) => spec.clone(),
                None => spec.with_deliver_subject(connection.client().await?.new_inbox()),
            };
            handle
                .create_consumer(push_config(&spec)?)
                .await
                .map_err(|e| BusError::Subscribe(format!("ephemeral consumer: {}", e)))?
        }
    };

    let name = spec
        .durable_name()
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}-ephemeral", stream));
    let messages = consumer
        .messages()
        .await
        .map_err(|e| BusError::Subscribe(format!("consumer {}: {}", name, e)))?;
    Ok((name, messages))
}

fn spawn_push(
    route: Route,
    consumer: String,
    messages: push::Messages,
    handler: Arc<dyn MessageHandler>,
) -> Subscription {
    let subject = route.subject.clone();
    Subscription::spawn(consumer, subject, move |mut shutdown| async move {
        let messages = messages;
        tokio::pin!(messages);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                next = messages.next() => match next {
                    Some(Ok(message)) => {
                        handle_message(&route, handler.as_ref(), &message).await;
                    }
                    Some(Err(e)) => {
                        warn!(
                            subject = %route.subject,
                            queue = %route.queue,
                            error = %e,
                            "Push consumer error"
                        );
                    }
                    None => break,
                },
            }
        }
        debug!(subject = %route.subject, queue = %route.queue, "Subscription stopped");
    })
}

async fn start(
    connection: &Connection,
    reconciler: &Reconciler,
    subject: &str,
    queue: Option<&str>,
    options: SubscribeOptions,
    handler: Arc<dyn MessageHandler>,
) -> Result<Subscription> {
    let (stream, spec) = prepare_push(connection, reconciler, subject, queue, &options).await?;
    let (consumer, messages) = open_push(connection, &stream, spec).await?;

    let route = Route::new(subject, queue.unwrap_or_default(), &options);
    let subscription = spawn_push(route, consumer, messages, handler);
    connection.track(subscription.clone()).await;

    info!(
        stream = %stream,
        subject = %subject,
        queue = ?queue,
        consumer = %subscription.consumer(),
        "Subscribed"
    );
    Ok(subscription)
}

/// Push subscription processing messages in order.
///
/// Acknowledgment is explicit unless the consumer spec says otherwise; in
/// local mode the ack wait is shortened to [`LOCAL_PUSH_ACK_WAIT`].
pub async fn subscribe<H: MessageHandler>(
    connection: &Connection,
    reconciler: &Reconciler,
    subject: &str,
    options: SubscribeOptions,
    handler: H,
) -> Result<Subscription> {
    start(connection, reconciler, subject, None, options, Arc::new(handler)).await
}

/// Push subscription sharing deliveries with every subscriber of `queue`.
///
/// The durable name defaults to the queue name. The consumer is reconciled
/// with retry before subscribing; in local mode the ack wait is shortened to
/// [`LOCAL_SHARED_ACK_WAIT`].
pub async fn queue_subscribe<H: MessageHandler>(
    connection: &Connection,
    reconciler: &Reconciler,
    subject: &str,
    queue: &str,
    options: SubscribeOptions,
    handler: H,
) -> Result<Subscription> {
    start(
        connection,
        reconciler,
        subject,
        Some(queue),
        options,
        Arc::new(handler),
    )
    .await
}
