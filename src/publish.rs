//! Publishing enveloped messages.
//!
//! Every variant wraps the payload in an [`Envelope`] stamped with the ambient
//! [`Identity`], attaches a fresh deduplication id and hands the bytes to the
//! broker. Traced variants additionally open a producer span and embed its
//! context in the envelope.

use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, error, Instrument};
use uuid::Uuid;

use crate::broker::{AckFuture, Broker, OutboundMessage, PubAck};
use crate::envelope::{Envelope, TraceInfo};
use crate::error::{BusError, Result};
use crate::identity::Identity;
use crate::metrics::record_publish;
use crate::propagation::{record_error, trace_info_for, TraceFormat};

/// In-flight asynchronous publish.
///
/// The message id is known as soon as the message is handed to the broker;
/// the completion task ends exactly once, when the broker acknowledgment or
/// error arrives.
#[derive(Debug)]
pub struct PublishHandle {
    msg_id: String,
    completion: JoinHandle<Result<PubAck>>,
}

impl PublishHandle {
    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    pub fn is_finished(&self) -> bool {
        self.completion.is_finished()
    }

    /// Wait for the broker acknowledgment.
    pub async fn wait(self) -> Result<PubAck> {
        self.completion
            .await
            .map_err(|e| BusError::Publish(format!("publish completion task failed: {}", e)))?
    }
}

/// Publishes enveloped messages through a [`Broker`].
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
    trace_format: TraceFormat,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>, trace_format: TraceFormat) -> Self {
        Self {
            broker,
            trace_format,
        }
    }

    fn outbound(subject: &str, payload: Bytes, trace: Option<TraceInfo>) -> OutboundMessage {
        let envelope = Envelope::new(payload, Identity::current()).with_trace(trace);
        OutboundMessage {
            subject: subject.to_string(),
            msg_id: Uuid::new_v4().to_string(),
            payload: Bytes::from(envelope.encode()),
        }
    }

    async fn hand_off(&self, message: OutboundMessage) -> Result<AckFuture> {
        let subject = message.subject.clone();
        self.broker.publish(message).await.inspect_err(|e| {
            error!(subject = %subject, error = %e, "Failed to publish message");
            record_publish(&subject, "error");
        })
    }

    fn observe(subject: &str, msg_id: &str, result: &Result<PubAck>) {
        match result {
            Ok(ack) => {
                debug!(
                    subject = %subject,
                    msg_id = %msg_id,
                    stream = %ack.stream,
                    sequence = ack.sequence,
                    duplicate = ack.duplicate,
                    "Published message"
                );
                record_publish(subject, "success");
            }
            Err(e) => {
                error!(
                    subject = %subject,
                    msg_id = %msg_id,
                    error = %e,
                    "Failed to publish message"
                );
                record_publish(subject, "error");
            }
        }
    }

    fn producer_span(span_name: &str, subject: &str) -> tracing::Span {
        tracing::info_span!(
            "bus.publish",
            otel.name = %span_name,
            otel.kind = "producer",
            otel.status_code = tracing::field::Empty,
            subject = %subject,
            msg_id = tracing::field::Empty,
            error = tracing::field::Empty,
        )
    }

    /// Publish and wait for the broker acknowledgment.
    pub async fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> Result<PubAck> {
        let message = Self::outbound(subject, payload.into(), None);
        let msg_id = message.msg_id.clone();
        let result = match self.hand_off(message).await {
            Ok(ack) => ack.await,
            Err(e) => return Err(e),
        };
        Self::observe(subject, &msg_id, &result);
        result
    }

    /// Publish without waiting for the acknowledgment.
    ///
    /// Returns once the message is handed to the broker; failures observed
    /// later are logged by the completion task and surfaced by
    /// [`PublishHandle::wait`].
    pub async fn publish_async(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
    ) -> Result<PublishHandle> {
        let message = Self::outbound(subject, payload.into(), None);
        let msg_id = message.msg_id.clone();
        let ack = self.hand_off(message).await?;

        let subject = subject.to_string();
        let task_msg_id = msg_id.clone();
        let completion = tokio::spawn(async move {
            let result = ack.await;
            Self::observe(&subject, &task_msg_id, &result);
            result
        });

        Ok(PublishHandle { msg_id, completion })
    }

    /// [`publish`](Self::publish) inside a producer span named `span_name`.
    pub async fn traced_publish(
        &self,
        span_name: &str,
        subject: &str,
        payload: impl Into<Bytes>,
    ) -> Result<PubAck> {
        let parent = tracing::Span::current();
        let span = Self::producer_span(span_name, subject);
        let trace = trace_info_for(&span, &parent, self.trace_format);
        let message = Self::outbound(subject, payload.into(), trace);
        let msg_id = message.msg_id.clone();
        span.record("msg_id", msg_id.as_str());

        let result = async {
            let ack = self.hand_off(message).await?;
            ack.await
        }
        .instrument(span.clone())
        .await;

        Self::observe(subject, &msg_id, &result);
        if let Err(e) = &result {
            record_error(&span, e);
        }
        result
    }

    /// [`publish_async`](Self::publish_async) inside a producer span named
    /// `span_name`. The span ends in the completion task.
    pub async fn traced_publish_async(
        &self,
        span_name: &str,
        subject: &str,
        payload: impl Into<Bytes>,
    ) -> Result<PublishHandle> {
        let parent = tracing::Span::current();
        let span = Self::producer_span(span_name, subject);
        let trace = trace_info_for(&span, &parent, self.trace_format);
        let message = Self::outbound(subject, payload.into(), trace);
        let msg_id = message.msg_id.clone();
        span.record("msg_id", msg_id.as_str());

        let ack = match self.hand_off(message).instrument(span.clone()).await {
            Ok(ack) => ack,
            Err(e) => {
                record_error(&span, &e);
                return Err(e);
            }
        };

        let subject = subject.to_string();
        let task_msg_id = msg_id.clone();
        let completion = tokio::spawn(
            async move {
                let result = ack.await;
                Self::observe(&subject, &task_msg_id, &result);
                if let Err(e) = &result {
                    record_error(&tracing::Span::current(), e);
                }
                result
            }
            .instrument(span),
        );

        Ok(PublishHandle { msg_id, completion })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MockBroker, MSG_ID_HEADER};
    use crate::topology::StreamSpec;
    use opentelemetry::trace::TracerProvider as _;
    use tracing_subscriber::layer::SubscriberExt;

    async fn setup() -> (Arc<MockBroker>, Publisher) {
        let broker = Arc::new(
            MockBroker::new()
                .with_stream(StreamSpec::new("LESSON", ["lesson.>"]))
                .await,
        );
        let publisher = Publisher::new(broker.clone(), TraceFormat::B3);
        (broker, publisher)
    }

    async fn last_envelope(broker: &MockBroker) -> (OutboundMessage, Envelope) {
        let message = broker.published().await.pop().expect("a published message");
        let envelope = Envelope::decode(&message.payload).unwrap();
        (message, envelope)
    }

    #[test]
    fn test_msg_id_header_name() {
        assert_eq!(MSG_ID_HEADER, "Nats-Msg-Id");
    }

    #[tokio::test]
    async fn test_publish_wraps_payload_with_identity() {
        let (broker, publisher) = setup().await;

        let ack = Identity::new("org-1", "user-1")
            .scope(publisher.publish("lesson.created", b"hello".to_vec()))
            .await
            .unwrap();

        assert_eq!(ack.stream, "LESSON");
        assert_eq!(ack.sequence, 1);
        let (message, envelope) = last_envelope(&broker).await;
        assert!(Uuid::parse_str(&message.msg_id).is_ok());
        assert_eq!(envelope.payload.as_ref(), b"hello");
        assert_eq!(envelope.identity, Identity::new("org-1", "user-1"));
        assert!(envelope.trace.is_none());
    }

    #[tokio::test]
    async fn test_publish_uses_fresh_msg_ids() {
        let (broker, publisher) = setup().await;

        publisher.publish("lesson.created", Bytes::from_static(b"a")).await.unwrap();
        publisher.publish("lesson.created", Bytes::from_static(b"a")).await.unwrap();

        let published = broker.published().await;
        assert_ne!(published[0].msg_id, published[1].msg_id);
    }

    #[tokio::test]
    async fn test_publish_failure_returned() {
        let (broker, publisher) = setup().await;
        broker.set_fail_on_publish(true).await;

        let result = publisher.publish("lesson.created", Bytes::new()).await;

        assert!(matches!(result, Err(BusError::Publish(_))));
    }

    #[tokio::test]
    async fn test_publish_async_resolves_ack() {
        let (broker, publisher) = setup().await;

        let handle = publisher
            .publish_async("lesson.created", Bytes::from_static(b"x"))
            .await
            .unwrap();

        let (message, _) = last_envelope(&broker).await;
        assert_eq!(handle.msg_id(), message.msg_id);
        let ack = handle.wait().await.unwrap();
        assert_eq!(ack.sequence, 1);
    }

    #[tokio::test]
    async fn test_publish_async_ack_failure_surfaces_on_wait() {
        let (broker, publisher) = setup().await;
        broker.set_fail_on_ack(true).await;

        let handle = publisher
            .publish_async("lesson.created", Bytes::new())
            .await
            .unwrap();

        assert!(handle.wait().await.is_err());
    }

    #[tokio::test]
    async fn test_traced_publish_without_otel_has_no_trace() {
        let (broker, publisher) = setup().await;

        publisher
            .traced_publish("CreateLesson", "lesson.created", Bytes::new())
            .await
            .unwrap();

        let (_, envelope) = last_envelope(&broker).await;
        assert!(envelope.trace.is_none());
    }

    #[tokio::test]
    async fn test_traced_publish_embeds_trace() {
        let provider = opentelemetry_sdk::trace::TracerProvider::builder().build();
        let subscriber = tracing_subscriber::registry()
            .with(tracing_opentelemetry::layer().with_tracer(provider.tracer("jetbus-test")));
        let _guard = tracing::subscriber::set_default(subscriber);
        let (broker, publisher) = setup().await;

        publisher
            .traced_publish("CreateLesson", "lesson.created", Bytes::new())
            .await
            .unwrap();
        let (_, envelope) = last_envelope(&broker).await;
        assert!(matches!(envelope.trace, Some(TraceInfo::B3(_))));

        let handle = publisher
            .traced_publish_async("CreateLesson", "lesson.created", Bytes::new())
            .await
            .unwrap();
        handle.wait().await.unwrap();
        let (_, envelope) = last_envelope(&broker).await;
        assert!(matches!(envelope.trace, Some(TraceInfo::B3(_))));
    }
}
