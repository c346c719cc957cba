//! Bounded-concurrency chunk processing.
//!
//! [`chunk_handler`] splits `[0, total)` into contiguous half-open ranges,
//! queues them on a bounded channel and runs them on a fixed pool of
//! workers. Every chunk runs; failures are collected into a [`MultiError`].

use std::fmt;
use std::future::Future;

use futures::future::join_all;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::error::BoxError;

/// Number of chunks processed concurrently.
pub const WORKERS: usize = 3;

/// Half-open range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChunkTask {
    pub start: usize,
    pub end: usize,
}

impl fmt::Display for ChunkTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Errors of every failed chunk, ordered by range start.
#[derive(Debug)]
pub struct MultiError {
    errors: Vec<(ChunkTask, BoxError)>,
}

impl MultiError {
    pub fn errors(&self) -> &[(ChunkTask, BoxError)] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (task, err)) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "chunk {}: {}", task, err)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("batch size must be greater than zero")]
    InvalidBatchSize,

    #[error(transparent)]
    Failed(#[from] MultiError),
}

/// Split `[0, total)` into ranges of `batch_size`; the last may be shorter.
pub fn chunk_ranges(total: usize, batch_size: usize) -> Result<Vec<ChunkTask>, ChunkError> {
    if batch_size == 0 {
        return Err(ChunkError::InvalidBatchSize);
    }
    Ok((0..total)
        .step_by(batch_size)
        .map(|start| ChunkTask {
            start,
            end: start.saturating_add(batch_size).min(total),
        })
        .collect())
}

async fn worker<F, Fut>(
    queue: &Mutex<mpsc::Receiver<ChunkTask>>,
    errors: &Mutex<Vec<(ChunkTask, BoxError)>>,
    f: &F,
) where
    F: Fn(usize, usize) -> Fut,
    Fut: Future<Output = Result<(), BoxError>>,
{
    loop {
        let next = queue.lock().await.recv().await;
        let Some(task) = next else {
            break;
        };
        if let Err(e) = f(task.start, task.end).await {
            debug!(chunk = %task, error = %e, "Chunk failed");
            errors.lock().await.push((task, e));
        }
    }
}

/// Run `f(start, end)` for every chunk of `[0, total)` on [`WORKERS`] workers.
///
/// Returns `Ok(())` only if every chunk succeeded.
pub async fn chunk_handler<F, Fut>(total: usize, batch_size: usize, f: F) -> Result<(), ChunkError>
where
    F: Fn(usize, usize) -> Fut,
    Fut: Future<Output = Result<(), BoxError>>,
{
    let tasks = chunk_ranges(total, batch_size)?;

    let (sender, receiver) = mpsc::channel(WORKERS);
    let queue = Mutex::new(receiver);
    let errors = Mutex::new(Vec::new());

    let producer = async move {
        for task in tasks {
            if sender.send(task).await.is_err() {
                break;
            }
        }
    };

    let (queue, errors_ref, f) = (&queue, &errors, &f);
    let workers = join_all((0..WORKERS).map(move |_| worker(queue, errors_ref, f)));
    futures::join!(producer, workers);

    let mut errors = errors.into_inner();
    if errors.is_empty() {
        return Ok(());
    }
    errors.sort_by_key(|(task, _)| *task);
    Err(MultiError { errors }.into())
}
