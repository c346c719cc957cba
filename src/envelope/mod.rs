//! Wire envelope carrying a business payload plus identity and trace metadata.
//!
//! Every message published through the bus is wrapped in an [`Envelope`] and
//! encoded as protobuf (see [`wire`]). Consumers decode the envelope, restore
//! the caller identity and, when present, continue the producer's trace.

pub mod wire;

use bytes::Bytes;
use prost::Message;

use crate::identity::Identity;

/// Errors produced while decoding envelopes.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] prost::DecodeError),
}

/// Trace context carried inside an envelope.
///
/// Exactly one representation is populated: either an opaque propagation
/// string (W3C `traceparent`) or the structured B3 fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceInfo {
    /// Opaque propagation header value.
    Propagation(String),
    /// Structured B3 identifiers.
    B3(B3Context),
}

/// B3 trace identifiers, hex encoded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct B3Context {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: String,
    pub sampled: bool,
    pub debug: bool,
}

impl From<TraceInfo> for wire::TraceInfo {
    fn from(info: TraceInfo) -> Self {
        let context = match info {
            TraceInfo::Propagation(value) => wire::trace_info::Context::Propagation(value),
            TraceInfo::B3(b3) => wire::trace_info::Context::B3(wire::B3 {
                trace_id: b3.trace_id,
                span_id: b3.span_id,
                parent_span_id: b3.parent_span_id,
                sampled: b3.sampled,
                debug: b3.debug,
            }),
        };
        wire::TraceInfo {
            context: Some(context),
        }
    }
}

impl TraceInfo {
    fn from_wire(info: wire::TraceInfo) -> Option<Self> {
        match info.context? {
            wire::trace_info::Context::Propagation(value) => Some(TraceInfo::Propagation(value)),
            wire::trace_info::Context::B3(b3) => Some(TraceInfo::B3(B3Context {
                trace_id: b3.trace_id,
                span_id: b3.span_id,
                parent_span_id: b3.parent_span_id,
                sampled: b3.sampled,
                debug: b3.debug,
            })),
        }
    }
}

/// Decoded envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub payload: Bytes,
    pub identity: Identity,
    pub trace: Option<TraceInfo>,
}

impl Envelope {
    pub fn new(payload: impl Into<Bytes>, identity: Identity) -> Self {
        Self {
            payload: payload.into(),
            identity,
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: Option<TraceInfo>) -> Self {
        self.trace = trace;
        self
    }

    /// Serialize into protobuf bytes.
    pub fn encode(&self) -> Vec<u8> {
        wire::DataInMessage {
            payload: self.payload.clone(),
            resource_path: self.identity.resource_path.clone(),
            user_id: self.identity.user_id.clone(),
            trace_info: self.trace.clone().map(Into::into),
        }
        .encode_to_vec()
    }

    /// Parse protobuf bytes produced by [`Envelope::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let msg = wire::DataInMessage::decode(bytes)?;
        Ok(Self {
            payload: msg.payload,
            identity: Identity::new(msg.resource_path, msg.user_id),
            trace: msg.trace_info.and_then(TraceInfo::from_wire),
        })
    }
}

/// Decode a protobuf message that may or may not be wrapped in an envelope.
///
/// Producers that predate the envelope publish bare payloads. The envelope is
/// tried first; if the bytes are not an envelope, or its payload is not an
/// `M`, the raw bytes are decoded as `M` directly. An envelope with an empty
/// payload yields `M::default()`.
pub fn decode_ignore_metadata<M>(bytes: &[u8]) -> Result<M, EnvelopeError>
where
    M: Message + Default,
{
    if let Ok(envelope) = wire::DataInMessage::decode(bytes) {
        if let Ok(inner) = M::decode(envelope.payload) {
            return Ok(inner);
        }
    }
    Ok(M::decode(bytes)?)
}

#[cfg(test)]
mod tests;
