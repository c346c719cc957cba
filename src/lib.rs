//! jetbus - durable event exchange over NATS JetStream
//!
//! Services publish enveloped events carrying the caller's identity and
//! trace context, and consume them through push, queue or pull consumers
//! with explicit acknowledgment. Streams and consumers are declared in code
//! and reconciled against the broker on startup.

pub mod broker;
pub mod chunk;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod manager;
pub mod metrics;
pub mod propagation;
pub mod publish;
pub mod reconcile;
pub mod retry;
pub mod telemetry;
pub mod topology;

pub use broker::{Broker, PubAck};
pub use chunk::{chunk_handler, ChunkError, MultiError};
pub use config::BusConfig;
pub use connection::{ConnectOptions, Connection};
pub use delivery::pull::{BatchHandler, PulledMessage};
pub use delivery::{
    handle_push_failure, HandlerError, MessageContext, MessageHandler, PullOptions,
    SubscribeOptions, Subscription,
};
pub use envelope::{decode_ignore_metadata, Envelope, TraceInfo};
pub use error::{BoxError, BusError, Result};
pub use identity::Identity;
pub use manager::JetStreamManager;
pub use propagation::TraceFormat;
pub use publish::{PublishHandle, Publisher};
pub use reconcile::{ConsumerAction, Reconciler, StreamAction};
pub use topology::{AckPolicy, ConsumerSpec, DeliverPolicy, RetentionPolicy, StreamSpec};
