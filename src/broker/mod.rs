//! Broker seam.
//!
//! This module contains:
//! - `Broker` trait: the JetStream management and publish calls the bus needs
//! - `NatsBroker`: implementation over an `async_nats` JetStream context
//! - `MockBroker`: in-memory implementation for tests

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;

use crate::error::Result;
use crate::topology::{ConsumerSpec, StreamSpec};

pub mod mock;
pub mod nats;

pub use mock::{BrokerCall, MockBroker};
pub use nats::NatsBroker;

/// Header carrying the publisher-generated deduplication id.
pub const MSG_ID_HEADER: &str = "Nats-Msg-Id";

/// Broker acknowledgment of a persisted publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubAck {
    pub stream: String,
    pub sequence: u64,
    /// The broker recognised the dedup id and did not store the message again.
    pub duplicate: bool,
}

/// Message ready to hand to the broker.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub subject: String,
    pub msg_id: String,
    pub payload: Bytes,
}

/// Pending broker acknowledgment.
pub type AckFuture = BoxFuture<'static, Result<PubAck>>;

/// JetStream operations used by the reconciler and publisher.
///
/// Lookups return `Ok(None)` when the remote object does not exist; any other
/// remote failure is an error.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn stream_info(&self, name: &str) -> Result<Option<StreamSpec>>;

    async fn create_stream(&self, spec: &StreamSpec) -> Result<()>;

    async fn update_stream(&self, spec: &StreamSpec) -> Result<()>;

    async fn delete_stream(&self, name: &str) -> Result<()>;

    async fn consumer_info(&self, stream: &str, durable: &str) -> Result<Option<ConsumerSpec>>;

    async fn create_consumer(&self, stream: &str, spec: &ConsumerSpec) -> Result<()>;

    async fn delete_consumer(&self, stream: &str, durable: &str) -> Result<()>;

    /// Name of the stream capturing `subject`.
    async fn stream_for_subject(&self, subject: &str) -> Result<String>;

    /// Hand a message to the broker.
    ///
    /// Resolves once the message is written to the connection; the returned
    /// future resolves once the broker has persisted it.
    async fn publish(&self, message: OutboundMessage) -> Result<AckFuture>;
}
