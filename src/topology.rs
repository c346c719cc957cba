//! Declarative stream and consumer specifications.
//!
//! Services declare the streams and durable consumers they need as plain
//! values; the reconciler converges the broker to them.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{BusError, Result};

/// Delimiter of hierarchical subjects; reserved in durable names.
pub const SUBJECT_DELIMITER: char = '.';

/// Server default for how long a delivered message may stay unacknowledged.
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);

/// Server default for unlimited redelivery.
pub const UNLIMITED_DELIVER: i64 = -1;

/// Message retention policy of a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Keep messages until a limit (age, size, count) is reached.
    #[default]
    Limits,
    /// Keep messages while any consumer has not acknowledged them.
    Interest,
    /// Remove messages once acknowledged by one consumer.
    WorkQueue,
}

/// Desired state of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    pub name: String,
    pub subjects: Vec<String>,
    pub retention: RetentionPolicy,
    pub replicas: usize,
    /// Zero means unlimited.
    pub max_age: Duration,
    /// `-1` means unlimited.
    pub max_bytes: i64,
}

impl StreamSpec {
    pub fn new(
        name: impl Into<String>,
        subjects: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            subjects: subjects.into_iter().map(Into::into).collect(),
            retention: RetentionPolicy::Limits,
            replicas: 1,
            max_age: Duration::ZERO,
            max_bytes: -1,
        }
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: i64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Subjects compared as a set; declaration order is irrelevant.
    pub fn subject_set(&self) -> BTreeSet<&str> {
        self.subjects.iter().map(String::as_str).collect()
    }
}

/// Whether acknowledging one message acknowledges earlier ones too.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckPolicy {
    /// Every message must be acknowledged individually.
    #[default]
    Explicit,
    /// Acknowledging sequence N acknowledges every lower sequence.
    All,
    /// No acknowledgment required.
    None,
}

/// Where a new consumer starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliverPolicy {
    #[default]
    All,
    New,
    Last,
    ByStartTime(DateTime<Utc>),
    ByStartSequence(u64),
}

impl DeliverPolicy {
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        match self {
            DeliverPolicy::ByStartTime(t) => Some(*t),
            _ => None,
        }
    }

    pub fn start_sequence(&self) -> Option<u64> {
        match self {
            DeliverPolicy::ByStartSequence(seq) => Some(*seq),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            DeliverPolicy::All => "all",
            DeliverPolicy::New => "new",
            DeliverPolicy::Last => "last",
            DeliverPolicy::ByStartTime(_) => "by_start_time",
            DeliverPolicy::ByStartSequence(_) => "by_start_sequence",
        }
    }
}

/// Desired state of a durable consumer.
///
/// Construct with [`ConsumerSpec::builder`]; values are immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub(crate) durable_name: Option<String>,
    pub(crate) filter_subject: String,
    pub(crate) deliver_subject: Option<String>,
    pub(crate) deliver_group: Option<String>,
    pub(crate) ack_policy: AckPolicy,
    pub(crate) ack_wait: Duration,
    pub(crate) max_deliver: i64,
    pub(crate) deliver_policy: DeliverPolicy,
}

impl Default for ConsumerSpec {
    fn default() -> Self {
        Self {
            durable_name: None,
            filter_subject: String::new(),
            deliver_subject: None,
            deliver_group: None,
            ack_policy: AckPolicy::Explicit,
            ack_wait: DEFAULT_ACK_WAIT,
            max_deliver: UNLIMITED_DELIVER,
            deliver_policy: DeliverPolicy::All,
        }
    }
}

impl ConsumerSpec {
    pub fn builder() -> ConsumerSpecBuilder {
        ConsumerSpecBuilder::default()
    }

    pub fn durable_name(&self) -> Option<&str> {
        self.durable_name.as_deref()
    }

    pub fn filter_subject(&self) -> &str {
        &self.filter_subject
    }

    pub fn deliver_subject(&self) -> Option<&str> {
        self.deliver_subject.as_deref()
    }

    pub fn deliver_group(&self) -> Option<&str> {
        self.deliver_group.as_deref()
    }

    pub fn ack_policy(&self) -> AckPolicy {
        self.ack_policy
    }

    pub fn ack_wait(&self) -> Duration {
        self.ack_wait
    }

    pub fn max_deliver(&self) -> i64 {
        self.max_deliver
    }

    pub fn deliver_policy(&self) -> DeliverPolicy {
        self.deliver_policy
    }

    /// Names of the tracked fields in which `self` and `other` differ.
    ///
    /// Consumer configuration is immutable on the broker, so any difference
    /// here requires deleting and recreating the consumer.
    pub fn diff(&self, other: &ConsumerSpec) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.max_deliver != other.max_deliver {
            changed.push("max_deliver");
        }
        if self.ack_wait != other.ack_wait {
            changed.push("ack_wait");
        }
        if self.deliver_group != other.deliver_group {
            changed.push("deliver_group");
        }
        if self.deliver_policy.start_time() != other.deliver_policy.start_time() {
            changed.push("start_time");
        }
        if self.ack_policy != other.ack_policy {
            changed.push("ack_policy");
        }
        if self.deliver_subject != other.deliver_subject {
            changed.push("deliver_subject");
        }
        if self.filter_subject != other.filter_subject {
            changed.push("filter_subject");
        }
        if self.deliver_policy.kind() != other.deliver_policy.kind() {
            changed.push("deliver_policy");
        }
        if self.deliver_policy.start_sequence() != other.deliver_policy.start_sequence() {
            changed.push("start_sequence");
        }
        changed
    }

    /// Derive the spec used for a concrete subscription.
    pub(crate) fn for_subscription(
        &self,
        filter_subject: &str,
        deliver_group: Option<&str>,
        ack_wait: Option<Duration>,
    ) -> ConsumerSpec {
        let mut spec = self.clone();
        if spec.filter_subject.is_empty() {
            spec.filter_subject = filter_subject.to_string();
        }
        if let Some(group) = deliver_group {
            spec.deliver_group = Some(group.to_string());
        }
        if let Some(ack_wait) = ack_wait {
            spec.ack_wait = ack_wait;
        }
        spec
    }

    pub(crate) fn with_durable(&self, durable: &str) -> ConsumerSpec {
        let mut spec = self.clone();
        spec.durable_name = Some(durable.to_string());
        spec
    }

    pub(crate) fn with_deliver_subject(&self, deliver_subject: String) -> ConsumerSpec {
        let mut spec = self.clone();
        spec.deliver_subject = Some(deliver_subject);
        spec
    }
}

/// Reject durable names containing the subject delimiter.
pub fn check_durable_name(name: &str) -> Result<()> {
    if name.contains(SUBJECT_DELIMITER) {
        return Err(BusError::InvalidDurableName(name.to_string()));
    }
    Ok(())
}

/// Builder for [`ConsumerSpec`]. Validation happens in [`build`](Self::build).
#[derive(Debug, Clone, Default)]
pub struct ConsumerSpecBuilder {
    spec: ConsumerSpec,
    durable_set: usize,
}

impl ConsumerSpecBuilder {
    /// Durable consumer name. Setting it more than once is an error.
    pub fn durable(mut self, name: impl Into<String>) -> Self {
        self.spec.durable_name = Some(name.into());
        self.durable_set += 1;
        self
    }

    pub fn filter_subject(mut self, subject: impl Into<String>) -> Self {
        self.spec.filter_subject = subject.into();
        self
    }

    /// Push delivery subject.
    pub fn deliver_subject(mut self, subject: impl Into<String>) -> Self {
        self.spec.deliver_subject = Some(subject.into());
        self
    }

    /// Queue group sharing deliveries among competing subscribers.
    pub fn deliver_group(mut self, group: impl Into<String>) -> Self {
        self.spec.deliver_group = Some(group.into());
        self
    }

    pub fn ack_explicit(mut self) -> Self {
        self.spec.ack_policy = AckPolicy::Explicit;
        self
    }

    /// Acking a sequence implicitly acks all lower sequences.
    pub fn ack_all(mut self) -> Self {
        self.spec.ack_policy = AckPolicy::All;
        self
    }

    pub fn ack_none(mut self) -> Self {
        self.spec.ack_policy = AckPolicy::None;
        self
    }

    pub fn ack_wait(mut self, ack_wait: Duration) -> Self {
        self.spec.ack_wait = ack_wait;
        self
    }

    pub fn max_deliver(mut self, max_deliver: i64) -> Self {
        self.spec.max_deliver = max_deliver;
        self
    }

    pub fn deliver_all(mut self) -> Self {
        self.spec.deliver_policy = DeliverPolicy::All;
        self
    }

    pub fn deliver_new(mut self) -> Self {
        self.spec.deliver_policy = DeliverPolicy::New;
        self
    }

    pub fn deliver_last(mut self) -> Self {
        self.spec.deliver_policy = DeliverPolicy::Last;
        self
    }

    pub fn start_time(mut self, start: DateTime<Utc>) -> Self {
        self.spec.deliver_policy = DeliverPolicy::ByStartTime(start);
        self
    }

    pub fn start_sequence(mut self, seq: u64) -> Self {
        self.spec.deliver_policy = DeliverPolicy::ByStartSequence(seq);
        self
    }

    pub fn build(self) -> Result<ConsumerSpec> {
        if self.durable_set > 1 {
            return Err(BusError::InvalidOptions(
                "durable name set more than once".to_string(),
            ));
        }
        if let Some(name) = &self.spec.durable_name {
            if name.is_empty() {
                return Err(BusError::InvalidOptions("durable name is empty".to_string()));
            }
            check_durable_name(name)?;
        }
        if self.spec.max_deliver == 0 || self.spec.max_deliver < UNLIMITED_DELIVER {
            return Err(BusError::InvalidOptions(format!(
                "max_deliver must be positive or -1, got {}",
                self.spec.max_deliver
            )));
        }
        if self.spec.deliver_group.as_deref() == Some("") {
            return Err(BusError::InvalidOptions("deliver group is empty".to_string()));
        }
        Ok(self.spec)
    }
}
