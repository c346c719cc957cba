//! OTel-native metrics instruments.
//!
//! All instruments are lazily initialized from the global meter provider;
//! without an installed provider they are no-ops.
//!
//! Naming follows OTel semantic conventions (dot-separated).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::{global, KeyValue};

use crate::connection::Connection;

static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("jetbus"));

// ============================================================================
// Delivery
// ============================================================================

/// Messages processed by subscriptions, by outcome.
pub static PROCESSED_MESSAGES: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("jetbus.processed_messages")
        .with_description("Messages processed by subscription handlers")
        .build()
});

/// Handler latency of successfully processed messages.
pub static PROCESSED_LATENCY: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("jetbus.processed_messages.latency")
        .with_description("Message handling latency")
        .with_unit("ms")
        .build()
});

// ============================================================================
// Publish
// ============================================================================

/// Total publish operations.
pub static PUBLISH_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("jetbus.publish.total")
        .with_description("Total publish operations")
        .build()
});

// ============================================================================
// Connection
// ============================================================================

/// Disconnects since the last successful reconnect.
pub static DISCONNECTED_RECENTLY: LazyLock<Gauge<u64>> = LazyLock::new(|| {
    METER
        .u64_gauge("jetbus.connection.disconnected_recently")
        .with_description("Disconnects since the last reconnect")
        .build()
});

// ============================================================================
// Helpers
// ============================================================================

pub fn subject_attr(subject: &str) -> KeyValue {
    KeyValue::new("subject", subject.to_string())
}

pub fn queue_attr(queue: &str) -> KeyValue {
    KeyValue::new("queue", queue.to_string())
}

pub fn status_attr(status: &str) -> KeyValue {
    KeyValue::new("status", status.to_string())
}

pub fn outcome_attr(outcome: &str) -> KeyValue {
    KeyValue::new("outcome", outcome.to_string())
}

pub fn app_attr(app: &str) -> KeyValue {
    KeyValue::new("app", app.to_string())
}

/// Record one processed message. `latency` is given for successful messages only.
pub fn record_processed(subject: &str, queue: &str, status: &str, latency: Option<Duration>) {
    PROCESSED_MESSAGES.add(
        1,
        &[subject_attr(subject), queue_attr(queue), status_attr(status)],
    );
    if let Some(latency) = latency {
        PROCESSED_LATENCY.record(
            latency.as_secs_f64() * 1000.0,
            &[subject_attr(subject), queue_attr(queue)],
        );
    }
}

pub fn record_publish(subject: &str, outcome: &str) {
    PUBLISH_TOTAL.add(1, &[subject_attr(subject), outcome_attr(outcome)]);
}

/// Tracks disconnects since the last reconnect for one application.
///
/// The current value is readable in-process and mirrored to
/// [`DISCONNECTED_RECENTLY`] on every change.
#[derive(Debug)]
pub struct DisconnectGauge {
    app: String,
    value: AtomicU64,
}

impl DisconnectGauge {
    pub fn new(app: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            app: app.into(),
            value: AtomicU64::new(0),
        })
    }

    pub fn on_disconnect(&self) {
        let value = self.value.fetch_add(1, Ordering::SeqCst) + 1;
        DISCONNECTED_RECENTLY.record(value, &[app_attr(&self.app)]);
    }

    pub fn on_reconnect(&self) {
        self.value.store(0, Ordering::SeqCst);
        DISCONNECTED_RECENTLY.record(0, &[app_attr(&self.app)]);
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Register this gauge as disconnect and reconnect hooks of `connection`.
    pub async fn register(self: &Arc<Self>, connection: &Connection) {
        let gauge = Arc::clone(self);
        connection
            .on_disconnect(move || gauge.on_disconnect())
            .await;
        let gauge = Arc::clone(self);
        connection.on_reconnect(move || gauge.on_reconnect()).await;
    }
}
