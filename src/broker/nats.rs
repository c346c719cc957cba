//! NATS JetStream implementation of [`Broker`].

use async_nats::jetstream::{
    self,
    consumer::{self, AckPolicy as NatsAckPolicy, DeliverPolicy as NatsDeliverPolicy},
    stream::{self, RetentionPolicy as NatsRetention, StorageType},
    Context,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use time::OffsetDateTime;
use tracing::debug;

use super::{AckFuture, Broker, OutboundMessage, PubAck, MSG_ID_HEADER};
use crate::error::{BusError, Result};
use crate::topology::{AckPolicy, ConsumerSpec, DeliverPolicy, RetentionPolicy, StreamSpec};

/// Broker backed by a JetStream context.
#[derive(Clone)]
pub struct NatsBroker {
    context: Context,
}

impl NatsBroker {
    pub fn new(client: async_nats::Client) -> Self {
        Self {
            context: jetstream::new(client),
        }
    }

    pub fn from_context(context: Context) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    async fn get_stream(&self, name: &str) -> Result<stream::Stream> {
        self.context
            .get_stream(name)
            .await
            .map_err(|e| BusError::reconciliation(format!("stream {}", name), e))
    }
}

/// Whether a remote error message reports a missing object.
///
/// JetStream API errors render as `"<description> (code 404, error code N)"`.
fn reports(message: &str, description: &str) -> bool {
    message.to_lowercase().contains(description)
}

fn is_already_exists(message: &str) -> bool {
    reports(message, "already exists") || reports(message, "name already in use")
}

pub(crate) fn to_offset(dt: DateTime<Utc>) -> Result<OffsetDateTime> {
    let nanos =
        i128::from(dt.timestamp()) * 1_000_000_000 + i128::from(dt.timestamp_subsec_nanos());
    OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .map_err(|e| BusError::InvalidOptions(format!("start time out of range: {}", e)))
}

pub(crate) fn to_chrono(t: OffsetDateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(t.unix_timestamp(), t.nanosecond())
}

fn stream_config(spec: &StreamSpec) -> stream::Config {
    stream::Config {
        name: spec.name.clone(),
        subjects: spec.subjects.clone(),
        retention: match spec.retention {
            RetentionPolicy::Limits => NatsRetention::Limits,
            RetentionPolicy::Interest => NatsRetention::Interest,
            RetentionPolicy::WorkQueue => NatsRetention::WorkQueue,
        },
        num_replicas: spec.replicas,
        max_age: spec.max_age,
        max_bytes: spec.max_bytes,
        storage: StorageType::File,
        ..Default::default()
    }
}

fn stream_spec(config: &stream::Config) -> StreamSpec {
    StreamSpec {
        name: config.name.clone(),
        subjects: config.subjects.clone(),
        retention: match config.retention {
            NatsRetention::Limits => RetentionPolicy::Limits,
            NatsRetention::Interest => RetentionPolicy::Interest,
            NatsRetention::WorkQueue => RetentionPolicy::WorkQueue,
        },
        replicas: config.num_replicas,
        max_age: config.max_age,
        max_bytes: config.max_bytes,
    }
}

fn deliver_policy(policy: DeliverPolicy) -> Result<NatsDeliverPolicy> {
    Ok(match policy {
        DeliverPolicy::All => NatsDeliverPolicy::All,
        DeliverPolicy::New => NatsDeliverPolicy::New,
        DeliverPolicy::Last => NatsDeliverPolicy::Last,
        DeliverPolicy::ByStartTime(start) => NatsDeliverPolicy::ByStartTime {
            start_time: to_offset(start)?,
        },
        DeliverPolicy::ByStartSequence(start_sequence) => {
            NatsDeliverPolicy::ByStartSequence { start_sequence }
        }
    })
}

fn ack_policy(policy: AckPolicy) -> NatsAckPolicy {
    match policy {
        AckPolicy::Explicit => NatsAckPolicy::Explicit,
        AckPolicy::All => NatsAckPolicy::All,
        AckPolicy::None => NatsAckPolicy::None,
    }
}

fn consumer_config(spec: &ConsumerSpec) -> Result<consumer::Config> {
    Ok(consumer::Config {
        durable_name: spec.durable_name.clone(),
        filter_subject: spec.filter_subject.clone(),
        deliver_subject: spec.deliver_subject.clone(),
        deliver_group: spec.deliver_group.clone(),
        ack_policy: ack_policy(spec.ack_policy),
        ack_wait: spec.ack_wait,
        max_deliver: spec.max_deliver,
        deliver_policy: deliver_policy(spec.deliver_policy)?,
        ..Default::default()
    })
}

/// Push consumer config; push consumers always carry a deliver subject.
pub(crate) fn push_config(spec: &ConsumerSpec) -> Result<consumer::push::Config> {
    let deliver_subject = spec.deliver_subject.clone().ok_or_else(|| {
        BusError::InvalidOptions("push consumer requires a deliver subject".to_string())
    })?;
    Ok(consumer::push::Config {
        deliver_subject,
        durable_name: spec.durable_name.clone(),
        deliver_group: spec.deliver_group.clone(),
        filter_subject: spec.filter_subject.clone(),
        ack_policy: ack_policy(spec.ack_policy),
        ack_wait: spec.ack_wait,
        max_deliver: spec.max_deliver,
        deliver_policy: deliver_policy(spec.deliver_policy)?,
        ..Default::default()
    })
}

fn consumer_spec(config: &consumer::Config) -> ConsumerSpec {
    let deliver_policy = match config.deliver_policy {
        NatsDeliverPolicy::All => DeliverPolicy::All,
        NatsDeliverPolicy::New => DeliverPolicy::New,
        NatsDeliverPolicy::Last | NatsDeliverPolicy::LastPerSubject => DeliverPolicy::Last,
        NatsDeliverPolicy::ByStartTime { start_time } => match to_chrono(start_time) {
            Some(start) => DeliverPolicy::ByStartTime(start),
            None => DeliverPolicy::All,
        },
        NatsDeliverPolicy::ByStartSequence { start_sequence } => {
            DeliverPolicy::ByStartSequence(start_sequence)
        }
    };

    ConsumerSpec {
        durable_name: config.durable_name.clone(),
        filter_subject: config.filter_subject.clone(),
        deliver_subject: config.deliver_subject.clone().filter(|s| !s.is_empty()),
        deliver_group: config.deliver_group.clone().filter(|s| !s.is_empty()),
        ack_policy: match config.ack_policy {
            NatsAckPolicy::Explicit => AckPolicy::Explicit,
            NatsAckPolicy::All => AckPolicy::All,
            NatsAckPolicy::None => AckPolicy::None,
        },
        ack_wait: config.ack_wait,
        max_deliver: config.max_deliver,
        deliver_policy,
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn stream_info(&self, name: &str) -> Result<Option<StreamSpec>> {
        match self.context.get_stream(name).await {
            Ok(stream) => Ok(Some(stream_spec(&stream.cached_info().config))),
            Err(e) => {
                let message = e.to_string();
                if reports(&message, "stream not found") {
                    Ok(None)
                } else {
                    Err(BusError::reconciliation(
                        format!("stream {}", name),
                        format!("error getting stream info: {}", message),
                    ))
                }
            }
        }
    }

    async fn create_stream(&self, spec: &StreamSpec) -> Result<()> {
        self.context
            .create_stream(stream_config(spec))
            .await
            .map_err(|e| {
                BusError::reconciliation(
                    format!("stream {}", spec.name),
                    format!("failed to add new stream: {}", e),
                )
            })?;
        debug!(stream = %spec.name, "Created stream");
        Ok(())
    }

    async fn update_stream(&self, spec: &StreamSpec) -> Result<()> {
        self.context
            .update_stream(&stream_config(spec))
            .await
            .map_err(|e| {
                BusError::reconciliation(
                    format!("stream {}", spec.name),
                    format!("failed to update stream: {}", e),
                )
            })?;
        debug!(stream = %spec.name, "Updated stream");
        Ok(())
    }

    async fn delete_stream(&self, name: &str) -> Result<()> {
        self.context.delete_stream(name).await.map_err(|e| {
            BusError::reconciliation(
                format!("stream {}", name),
                format!("failed to delete stream: {}", e),
            )
        })?;
        debug!(stream = %name, "Deleted stream");
        Ok(())
    }

    async fn consumer_info(&self, stream: &str, durable: &str) -> Result<Option<ConsumerSpec>> {
        let handle = self.get_stream(stream).await?;
        match handle.consumer_info(durable).await {
            Ok(info) => Ok(Some(consumer_spec(&info.config))),
            Err(e) => {
                let message = e.to_string();
                if reports(&message, "consumer not found") {
                    Ok(None)
                } else {
                    Err(BusError::reconciliation(
                        format!("consumer {}", durable),
                        format!("error getting consumer info: {}", message),
                    ))
                }
            }
        }
    }

    async fn create_consumer(&self, stream: &str, spec: &ConsumerSpec) -> Result<()> {
        let durable = spec.durable_name().unwrap_or_default().to_string();
        let handle = self.get_stream(stream).await?;
        match handle.create_consumer(consumer_config(spec)?).await {
            Ok(_) => {
                debug!(stream = %stream, consumer = %durable, "Created consumer");
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                if is_already_exists(&message) {
                    Err(BusError::ConsumerAlreadyExists(durable))
                } else {
                    Err(BusError::reconciliation(
                        format!("consumer {}", durable),
                        format!("failed to add consumer: {}", message),
                    ))
                }
            }
        }
    }

    async fn delete_consumer(&self, stream: &str, durable: &str) -> Result<()> {
        let handle = self.get_stream(stream).await?;
        handle.delete_consumer(durable).await.map_err(|e| {
            BusError::reconciliation(
                format!("consumer {}", durable),
                format!("failed to delete consumer: {}", e),
            )
        })?;
        debug!(stream = %stream, consumer = %durable, "Deleted consumer");
        Ok(())
    }

    async fn stream_for_subject(&self, subject: &str) -> Result<String> {
        self.context
            .stream_by_subject(subject)
            .await
            .map_err(|e| {
                BusError::Subscribe(format!("no stream matches subject {}: {}", subject, e))
            })
    }

    async fn publish(&self, message: OutboundMessage) -> Result<AckFuture> {
        let mut headers = async_nats::HeaderMap::new();
        headers.insert(MSG_ID_HEADER, message.msg_id.as_str());

        let pending = self
            .context
            .publish_with_headers(message.subject, headers, message.payload)
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?;

        Ok(Box::pin(async move {
            let ack = pending
                .await
                .map_err(|e| BusError::Publish(format!("Publish ack failed: {}", e)))?;
            Ok(PubAck {
                stream: ack.stream,
                sequence: ack.sequence,
                duplicate: ack.duplicate,
            })
        }))
    }
}
