//! In-memory delivered message for testing the delivery pump.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::Delivery;
use crate::envelope::Envelope;
use crate::error::{BusError, Result};
use crate::identity::Identity;

pub(crate) struct MockDelivery {
    subject: String,
    payload: Bytes,
    msg_id: Option<String>,
    sequence: Option<u64>,
    published: Option<DateTime<Utc>>,
    fail_ack: bool,
    acks: AtomicUsize,
}

impl MockDelivery {
    pub fn raw(subject: &str, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.to_string(),
            payload: payload.into(),
            msg_id: Some("msg-1".to_string()),
            sequence: Some(1),
            published: Some(Utc::now()),
            fail_ack: false,
            acks: AtomicUsize::new(0),
        }
    }

    pub fn enveloped(subject: &str, payload: &[u8], identity: Identity) -> Self {
        let envelope = Envelope::new(Bytes::copy_from_slice(payload), identity);
        Self::raw(subject, envelope.encode())
    }

    pub fn from_envelope(subject: &str, envelope: &Envelope) -> Self {
        Self::raw(subject, envelope.encode())
    }

    pub fn published_at(mut self, published: DateTime<Utc>) -> Self {
        self.published = Some(published);
        self
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn failing_ack(mut self) -> Self {
        self.fail_ack = true;
        self
    }

    pub fn acks(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Delivery for MockDelivery {
    fn subject(&self) -> &str {
        &self.subject
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn msg_id(&self) -> Option<String> {
        self.msg_id.clone()
    }

    fn stream_sequence(&self) -> Option<u64> {
        self.sequence
    }

    fn published(&self) -> Option<DateTime<Utc>> {
        self.published
    }

    async fn ack(&self) -> Result<()> {
        if self.fail_ack {
            return Err(BusError::Ack("Mock ack failure".to_string()));
        }
        self.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
