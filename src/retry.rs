//! Backoff builders for broker operations.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Total attempts made by [`crate::reconcile::Reconciler::upsert_consumer_with_retry`].
pub const CONSUMER_ATTEMPTS: usize = 5;

/// Backoff for consumer reconciliation while subscribing.
///
/// - Min delay: 1s
/// - Max delay: 8s
/// - Max retries: 4 (5 attempts total)
/// - Jitter enabled
pub fn consumer_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_secs(1))
        .with_max_delay(Duration::from_secs(8))
        .with_max_times(CONSUMER_ATTEMPTS - 1)
        .with_jitter()
}

/// Backoff for a pull loop whose fetch keeps failing.
///
/// - Min delay: 500ms
/// - Max delay: 30s
/// - Unbounded; the loop resets it after a successful fetch
/// - Jitter enabled
pub fn fetch_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(500))
        .with_max_delay(Duration::from_secs(30))
        .without_max_times()
        .with_jitter()
}
