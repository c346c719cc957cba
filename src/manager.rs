//! Single entry point bundling connection, reconciliation, publishing and
//! subscriptions.

use std::sync::Arc;

use async_nats::jetstream;
use bytes::Bytes;
use tracing::info;

use crate::broker::PubAck;
use crate::config::BusConfig;
use crate::connection::{ConnectOptions, Connection};
use crate::delivery::pull::{pull_subscribe, BatchHandler};
use crate::delivery::subscribe::{queue_subscribe, subscribe};
use crate::delivery::{MessageHandler, SubscribeOptions, Subscription};
use crate::error::Result;
use crate::propagation::TraceFormat;
use crate::publish::{PublishHandle, Publisher};
use crate::reconcile::{ConsumerAction, Reconciler, StreamAction};
use crate::topology::{ConsumerSpec, StreamSpec};

/// JetStream client facade.
///
/// Owns the [`Connection`]; every clone of the inner `Arc` observes the same
/// session and subscriptions.
pub struct JetStreamManager {
    connection: Arc<Connection>,
    reconciler: Reconciler,
    publisher: Publisher,
}

impl JetStreamManager {
    /// Connect to the broker and build the manager.
    pub async fn connect(options: ConnectOptions, trace_format: TraceFormat) -> Result<Self> {
        let connection = Connection::new(options)?;
        connection.connect().await?;
        Self::with_connection(Arc::new(connection), trace_format).await
    }

    /// Connect using a loaded [`BusConfig`].
    pub async fn from_config(config: &BusConfig) -> Result<Self> {
        let options = ConnectOptions::try_from(config)?;
        Self::connect(options, config.trace_format).await
    }

    /// Build the manager over an already connected `connection`.
    pub async fn with_connection(
        connection: Arc<Connection>,
        trace_format: TraceFormat,
    ) -> Result<Self> {
        let broker = connection.broker().await?;
        let reconciler = Reconciler::new(broker.clone(), connection.is_local());
        let publisher = Publisher::new(broker, trace_format);
        info!(
            url = %connection.options().url,
            is_local = connection.is_local(),
            "JetStream manager ready"
        );
        Ok(Self {
            connection,
            reconciler,
            publisher,
        })
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// Raw JetStream context, for operations the manager does not wrap.
    pub async fn jetstream_context(&self) -> Result<jetstream::Context> {
        self.connection.jetstream_context().await
    }

    pub async fn upsert_stream(&self, spec: &StreamSpec) -> Result<StreamAction> {
        self.reconciler.upsert_stream(spec).await
    }

    pub async fn upsert_consumer(
        &self,
        stream: &str,
        spec: &ConsumerSpec,
    ) -> Result<ConsumerAction> {
        self.reconciler.upsert_consumer(stream, spec).await
    }

    pub async fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> Result<PubAck> {
        self.publisher.publish(subject, payload).await
    }

    pub async fn publish_async(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
    ) -> Result<PublishHandle> {
        self.publisher.publish_async(subject, payload).await
    }

    pub async fn traced_publish(
        &self,
        span_name: &str,
        subject: &str,
        payload: impl Into<Bytes>,
    ) -> Result<PubAck> {
        self.publisher.traced_publish(span_name, subject, payload).await
    }

    pub async fn traced_publish_async(
        &self,
        span_name: &str,
        subject: &str,
        payload: impl Into<Bytes>,
    ) -> Result<PublishHandle> {
        self.publisher
            .traced_publish_async(span_name, subject, payload)
            .await
    }

    pub async fn subscribe<H: MessageHandler>(
        &self,
        subject: &str,
        options: SubscribeOptions,
        handler: H,
    ) -> Result<Subscription> {
        subscribe(&self.connection, &self.reconciler, subject, options, handler).await
    }

    pub async fn queue_subscribe<H: MessageHandler>(
        &self,
        subject: &str,
        queue: &str,
        options: SubscribeOptions,
        handler: H,
    ) -> Result<Subscription> {
        queue_subscribe(
            &self.connection,
            &self.reconciler,
            subject,
            queue,
            options,
            handler,
        )
        .await
    }

    pub async fn pull_subscribe<H: BatchHandler>(
        &self,
        subject: &str,
        durable: &str,
        options: SubscribeOptions,
        handler: H,
    ) -> Result<Subscription> {
        pull_subscribe(
            &self.connection,
            &self.reconciler,
            subject,
            durable,
            options,
            handler,
        )
        .await
    }

    pub async fn on_disconnect<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.connection.on_disconnect(hook).await;
    }

    pub async fn on_reconnect<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.connection.on_reconnect(hook).await;
    }

    /// Drain every subscription, then close the transport.
    pub async fn close(&self) {
        self.connection.close().await;
    }
}
