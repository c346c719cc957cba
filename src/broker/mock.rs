//! Mock broker implementation for testing.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{AckFuture, Broker, OutboundMessage, PubAck};
use crate::error::{BusError, Result};
use crate::topology::{ConsumerSpec, StreamSpec};

/// A recorded broker call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    StreamInfo(String),
    CreateStream(String),
    UpdateStream(String),
    DeleteStream(String),
    ConsumerInfo { stream: String, durable: String },
    CreateConsumer { stream: String, durable: String },
    DeleteConsumer { stream: String, durable: String },
    Publish { subject: String, msg_id: String },
}

impl BrokerCall {
    /// Calls that change stream or consumer state.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            BrokerCall::CreateStream(_)
                | BrokerCall::UpdateStream(_)
                | BrokerCall::DeleteStream(_)
                | BrokerCall::CreateConsumer { .. }
                | BrokerCall::DeleteConsumer { .. }
        )
    }
}

#[derive(Default)]
struct StreamState {
    spec: Option<StreamSpec>,
    last_sequence: u64,
    seen_ids: HashSet<String>,
}

/// In-memory broker for testing.
///
/// Streams and consumers live in maps; every call is recorded so tests can
/// assert on what the reconciler and publisher asked for.
#[derive(Default)]
pub struct MockBroker {
    streams: RwLock<HashMap<String, StreamState>>,
    consumers: RwLock<HashMap<(String, String), ConsumerSpec>>,
    calls: RwLock<Vec<BrokerCall>>,
    published: RwLock<Vec<OutboundMessage>>,
    fail_on_publish: RwLock<bool>,
    fail_on_ack: RwLock<bool>,
    create_consumer_failures: RwLock<usize>,
    consumer_create_race: RwLock<bool>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a stream without recording a call.
    pub async fn with_stream(self, spec: StreamSpec) -> Self {
        self.streams.write().await.insert(
            spec.name.clone(),
            StreamState {
                spec: Some(spec),
                ..Default::default()
            },
        );
        self
    }

    /// Seed a consumer without recording a call.
    pub async fn with_consumer(self, stream: &str, spec: ConsumerSpec) -> Self {
        let durable = spec.durable_name().unwrap_or_default().to_string();
        self.consumers
            .write()
            .await
            .insert((stream.to_string(), durable), spec);
        self
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    pub async fn set_fail_on_ack(&self, fail: bool) {
        *self.fail_on_ack.write().await = fail;
    }

    /// Fail the next `n` consumer creations with a transient error.
    pub async fn fail_next_consumer_creates(&self, n: usize) {
        *self.create_consumer_failures.write().await = n;
    }

    /// Report every consumer creation as racing with another creator.
    pub async fn set_consumer_create_race(&self, race: bool) {
        *self.consumer_create_race.write().await = race;
    }

    pub async fn calls(&self) -> Vec<BrokerCall> {
        self.calls.read().await.clone()
    }

    pub async fn mutating_calls(&self) -> Vec<BrokerCall> {
        self.calls
            .read()
            .await
            .iter()
            .filter(|call| call.is_mutating())
            .cloned()
            .collect()
    }

    pub async fn clear_calls(&self) {
        self.calls.write().await.clear();
    }

    pub async fn stream(&self, name: &str) -> Option<StreamSpec> {
        self.streams
            .read()
            .await
            .get(name)
            .and_then(|state| state.spec.clone())
    }

    pub async fn consumer(&self, stream: &str, durable: &str) -> Option<ConsumerSpec> {
        self.consumers
            .read()
            .await
            .get(&(stream.to_string(), durable.to_string()))
            .cloned()
    }

    pub async fn published(&self) -> Vec<OutboundMessage> {
        self.published.read().await.clone()
    }

    async fn record(&self, call: BrokerCall) {
        self.calls.write().await.push(call);
    }

    async fn stream_capturing(&self, subject: &str) -> Option<String> {
        self.streams
            .read()
            .await
            .iter()
            .find(|(_, state)| {
                state
                    .spec
                    .as_ref()
                    .is_some_and(|spec| spec.subjects.iter().any(|p| subject_matches(p, subject)))
            })
            .map(|(name, _)| name.clone())
    }
}

/// Match `subject` against a pattern with `*` (one token) and `>` (tail) wildcards.
pub(crate) fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn stream_info(&self, name: &str) -> Result<Option<StreamSpec>> {
        self.record(BrokerCall::StreamInfo(name.to_string())).await;
        Ok(self.stream(name).await)
    }

    async fn create_stream(&self, spec: &StreamSpec) -> Result<()> {
        self.record(BrokerCall::CreateStream(spec.name.clone())).await;
        let mut streams = self.streams.write().await;
        if streams.get(&spec.name).is_some_and(|s| s.spec.is_some()) {
            return Err(BusError::reconciliation(
                format!("stream {}", spec.name),
                "stream name already in use",
            ));
        }
        streams.insert(
            spec.name.clone(),
            StreamState {
                spec: Some(spec.clone()),
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn update_stream(&self, spec: &StreamSpec) -> Result<()> {
        self.record(BrokerCall::UpdateStream(spec.name.clone())).await;
        let mut streams = self.streams.write().await;
        match streams.get_mut(&spec.name) {
            Some(state) if state.spec.is_some() => {
                state.spec = Some(spec.clone());
                Ok(())
            }
            _ => Err(BusError::reconciliation(
                format!("stream {}", spec.name),
                "stream not found",
            )),
        }
    }

    async fn delete_stream(&self, name: &str) -> Result<()> {
        self.record(BrokerCall::DeleteStream(name.to_string())).await;
        self.streams.write().await.remove(name);
        self.consumers.write().await.retain(|(stream, _), _| stream != name);
        Ok(())
    }

    async fn consumer_info(&self, stream: &str, durable: &str) -> Result<Option<ConsumerSpec>> {
        self.record(BrokerCall::ConsumerInfo {
            stream: stream.to_string(),
            durable: durable.to_string(),
        })
        .await;
        if self.stream(stream).await.is_none() {
            return Err(BusError::reconciliation(
                format!("stream {}", stream),
                "stream not found",
            ));
        }
        Ok(self.consumer(stream, durable).await)
    }

    async fn create_consumer(&self, stream: &str, spec: &ConsumerSpec) -> Result<()> {
        let durable = spec.durable_name().unwrap_or_default().to_string();
        self.record(BrokerCall::CreateConsumer {
            stream: stream.to_string(),
            durable: durable.clone(),
        })
        .await;

        {
            let mut failures = self.create_consumer_failures.write().await;
            if *failures > 0 {
                *failures -= 1;
                return Err(BusError::reconciliation(
                    format!("consumer {}", durable),
                    "mock transient failure",
                ));
            }
        }
        if *self.consumer_create_race.read().await {
            return Err(BusError::ConsumerAlreadyExists(durable));
        }

        let key = (stream.to_string(), durable.clone());
        let mut consumers = self.consumers.write().await;
        match consumers.get(&key) {
            Some(existing) if existing != spec => Err(BusError::ConsumerAlreadyExists(durable)),
            _ => {
                consumers.insert(key, spec.clone());
                Ok(())
            }
        }
    }

    async fn delete_consumer(&self, stream: &str, durable: &str) -> Result<()> {
        self.record(BrokerCall::DeleteConsumer {
            stream: stream.to_string(),
            durable: durable.to_string(),
        })
        .await;
        self.consumers
            .write()
            .await
            .remove(&(stream.to_string(), durable.to_string()))
            .map(|_| ())
            .ok_or_else(|| {
                BusError::reconciliation(format!("consumer {}", durable), "consumer not found")
            })
    }

    async fn stream_for_subject(&self, subject: &str) -> Result<String> {
        self.stream_capturing(subject)
            .await
            .ok_or_else(|| BusError::Subscribe(format!("no stream matches subject {}", subject)))
    }

    async fn publish(&self, message: OutboundMessage) -> Result<AckFuture> {
        self.record(BrokerCall::Publish {
            subject: message.subject.clone(),
            msg_id: message.msg_id.clone(),
        })
        .await;

        if *self.fail_on_publish.read().await {
            return Err(BusError::Publish("Mock publish failure".to_string()));
        }

        self.published.write().await.push(message.clone());

        let outcome = if *self.fail_on_ack.read().await {
            Err(BusError::Publish("Mock ack failure".to_string()))
        } else {
            match self.stream_capturing(&message.subject).await {
                Some(name) => {
                    let mut streams = self.streams.write().await;
                    let state = streams.entry(name.clone()).or_default();
                    let duplicate = !state.seen_ids.insert(message.msg_id.clone());
                    if !duplicate {
                        state.last_sequence += 1;
                    }
                    Ok(PubAck {
                        stream: name,
                        sequence: state.last_sequence,
                        duplicate,
                    })
                }
                None => Err(BusError::Publish(format!(
                    "no stream matches subject {}",
                    message.subject
                ))),
            }
        };

        Ok(Box::pin(async move { outcome }))
    }
}
