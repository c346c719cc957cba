//! Stream and consumer reconciliation.
//!
//! Converges broker state to declared [`StreamSpec`]s and [`ConsumerSpec`]s.
//! The decision for each object is computed by a pure planning function;
//! [`Reconciler`] then applies it through the [`Broker`] seam. Applying the
//! same spec twice makes no mutating calls the second time.

use std::sync::Arc;

use backon::{BackoffBuilder, ExponentialBuilder};
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::error::{BusError, Result};
use crate::retry::{consumer_backoff, CONSUMER_ATTEMPTS};
use crate::topology::{ConsumerSpec, StreamSpec};

/// What reconciling a stream requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamAction {
    Create,
    /// Retention cannot be changed in place: delete, then create.
    Recreate,
    Update,
    Unchanged,
}

/// What reconciling a consumer requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerAction {
    Create,
    /// Delete, then create. `changed` names the differing fields.
    Recreate { changed: Vec<&'static str> },
    Unchanged,
}

/// Decide how to converge `current` to `desired`.
pub fn plan_stream(desired: &StreamSpec, current: Option<&StreamSpec>) -> StreamAction {
    let Some(current) = current else {
        return StreamAction::Create;
    };
    if current.retention != desired.retention {
        return StreamAction::Recreate;
    }
    if current.subject_set() != desired.subject_set()
        || current.replicas != desired.replicas
        || current.max_age != desired.max_age
        || current.max_bytes != desired.max_bytes
    {
        return StreamAction::Update;
    }
    StreamAction::Unchanged
}

/// Decide how to converge `current` to `desired`.
pub fn plan_consumer(desired: &ConsumerSpec, current: Option<&ConsumerSpec>) -> ConsumerAction {
    match current {
        None => ConsumerAction::Create,
        Some(current) => {
            let changed = current.diff(desired);
            if changed.is_empty() {
                ConsumerAction::Unchanged
            } else {
                ConsumerAction::Recreate { changed }
            }
        }
    }
}

/// Applies stream and consumer plans against a broker.
#[derive(Clone)]
pub struct Reconciler {
    broker: Arc<dyn Broker>,
    is_local: bool,
    backoff: ExponentialBuilder,
}

impl Reconciler {
    /// `is_local` forces single-replica streams.
    pub fn new(broker: Arc<dyn Broker>, is_local: bool) -> Self {
        Self {
            broker,
            is_local,
            backoff: consumer_backoff(),
        }
    }

    /// Override the backoff used by
    /// [`upsert_consumer_with_retry`](Self::upsert_consumer_with_retry).
    pub fn with_backoff(mut self, backoff: ExponentialBuilder) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn upsert_stream(&self, spec: &StreamSpec) -> Result<StreamAction> {
        let mut desired = spec.clone();
        if self.is_local {
            desired.replicas = 1;
        }

        let current = self.broker.stream_info(&desired.name).await?;
        let action = plan_stream(&desired, current.as_ref());

        match action {
            StreamAction::Create => {
                self.broker.create_stream(&desired).await?;
                info!(stream = %desired.name, subjects = ?desired.subjects, "Stream created");
            }
            StreamAction::Recreate => {
                warn!(
                    stream = %desired.name,
                    retention = ?desired.retention,
                    "Stream retention changed, deleting and recreating stream"
                );
                self.broker.delete_stream(&desired.name).await?;
                self.broker.create_stream(&desired).await?;
            }
            StreamAction::Update => {
                self.broker.update_stream(&desired).await?;
                info!(stream = %desired.name, "Stream updated");
            }
            StreamAction::Unchanged => {
                debug!(stream = %desired.name, "Stream up to date");
            }
        }

        Ok(action)
    }

    pub async fn upsert_consumer(
        &self,
        stream: &str,
        spec: &ConsumerSpec,
    ) -> Result<ConsumerAction> {
        let durable = spec.durable_name().ok_or_else(|| {
            BusError::InvalidOptions("consumer reconciliation requires a durable name".to_string())
        })?;

        let current = self.broker.consumer_info(stream, durable).await?;
        let action = plan_consumer(spec, current.as_ref());

        match &action {
            ConsumerAction::Create => {
                self.broker.create_consumer(stream, spec).await?;
                info!(stream = %stream, consumer = %durable, "Consumer created");
            }
            ConsumerAction::Recreate { changed } => {
                info!(
                    stream = %stream,
                    consumer = %durable,
                    changed = ?changed,
                    "Consumer config changed, recreating consumer"
                );
                self.broker.delete_consumer(stream, durable).await?;
                self.broker.create_consumer(stream, spec).await?;
            }
            ConsumerAction::Unchanged => {
                debug!(stream = %stream, consumer = %durable, "Consumer up to date");
            }
        }

        Ok(action)
    }

    /// [`upsert_consumer`](Self::upsert_consumer) with bounded exponential
    /// backoff. Losing a creation race to another instance counts as success.
    pub async fn upsert_consumer_with_retry(
        &self,
        stream: &str,
        spec: &ConsumerSpec,
    ) -> Result<()> {
        let backoff = self.backoff.build();
        let mut last_error = None;

        for (attempt, delay) in std::iter::once(std::time::Duration::ZERO)
            .chain(backoff)
            .enumerate()
        {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            match self.upsert_consumer(stream, spec).await {
                Ok(_) => return Ok(()),
                Err(BusError::ConsumerAlreadyExists(name)) => {
                    debug!(stream = %stream, consumer = %name, "Consumer created concurrently");
                    return Ok(());
                }
                Err(e @ (BusError::InvalidOptions(_) | BusError::InvalidDurableName(_))) => {
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        stream = %stream,
                        consumer = ?spec.durable_name(),
                        attempt = attempt + 1,
                        max_attempts = CONSUMER_ATTEMPTS,
                        error = %e,
                        "Consumer reconciliation failed, retrying after backoff"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            BusError::reconciliation(
                format!("consumer {}", spec.durable_name().unwrap_or_default()),
                "no attempts made",
            )
        }))
    }
}
