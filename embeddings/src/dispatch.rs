//! Dispatch loop that runs generation batches and publishes their results.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{Delivery, Shared};
use crate::error::EmbeddingError;
use crate::generator::Generator;

/// Receive batches until `shutdown` is cancelled or every sender is gone,
/// running each batch as its own task.
///
/// On exit, batches still queued are failed with [`EmbeddingError::Shutdown`]
/// and running batches are awaited so none of their waiters is left behind.
pub(crate) async fn run<G: Generator>(
    shared: Arc<Shared<G>>,
    mut batches: mpsc::UnboundedReceiver<Vec<G::Key>>,
    shutdown: CancellationToken,
) {
    let mut running = JoinSet::new();
    debug!("Dispatch loop started for {}", shared.generator.name());

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("Dispatch loop for {} shutting down", shared.generator.name());
                break;
            }
            Some(joined) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = joined {
                    error!("Generation task failed: {e}");
                }
            }
            batch = batches.recv() => match batch {
                Some(keys) => {
                    running.spawn(generate_batch(Arc::clone(&shared), keys, shutdown.clone()));
                }
                None => break,
            },
        }
    }

    batches.close();
    while let Some(keys) = batches.recv().await {
        debug!("Failing {} queued keys on shutdown", keys.len());
        shared
            .lock()
            .complete(keys, Err(Arc::new(EmbeddingError::Shutdown)));
    }

    while let Some(joined) = running.join_next().await {
        if let Err(e) = joined {
            error!("Generation task failed: {e}");
        }
    }
    debug!("Dispatch loop for {} stopped", shared.generator.name());
}

/// Run one batch against the generator and publish the outcome.
async fn generate_batch<G: Generator>(
    shared: Arc<Shared<G>>,
    keys: Vec<G::Key>,
    shutdown: CancellationToken,
) {
    let batch = PendingBatch::new(Arc::clone(&shared), keys);
    let expected = batch.len();
    let started = Instant::now();

    let generated = tokio::select! {
        biased;
        _ = shutdown.cancelled() => Err(EmbeddingError::Shutdown),
        result = shared.generator.generate(batch.keys()) => result,
    };

    let outcome = match generated {
        Ok(outputs) if outputs.len() == expected => Ok(outputs),
        Ok(outputs) => Err(EmbeddingError::BatchSizeMismatch {
            expected,
            actual: outputs.len(),
        }),
        Err(e) => Err(e),
    };

    match &outcome {
        Ok(_) => debug!(
            "Generated {expected} outputs with {} in {:?}",
            shared.generator.name(),
            started.elapsed()
        ),
        Err(e) => warn!(
            "Generation of {expected} keys with {} failed: {e}",
            shared.generator.name()
        ),
    }

    batch.finish(outcome.map_err(Arc::new));
}

/// Keys of a batch whose waiters have not been notified yet.
///
/// Dropping an unfinished batch (the generator panicked or the task was
/// aborted) fails its waiters with [`EmbeddingError::Interrupted`].
struct PendingBatch<G: Generator> {
    shared: Arc<Shared<G>>,
    keys: Option<Vec<G::Key>>,
}

impl<G: Generator> PendingBatch<G> {
    fn new(shared: Arc<Shared<G>>, keys: Vec<G::Key>) -> Self {
        Self {
            shared,
            keys: Some(keys),
        }
    }

    fn keys(&self) -> &[G::Key] {
        self.keys.as_deref().unwrap_or_default()
    }

    fn len(&self) -> usize {
        self.keys().len()
    }

    fn finish(mut self, outcome: Delivery<Vec<G::Output>>) {
        if let Some(keys) = self.keys.take() {
            self.shared.lock().complete(keys, outcome);
        }
    }
}

impl<G: Generator> Drop for PendingBatch<G> {
    fn drop(&mut self) {
        if let Some(keys) = self.keys.take() {
            warn!("Generation of {} keys was interrupted", keys.len());
            self.shared
                .lock()
                .complete(keys, Err(Arc::new(EmbeddingError::Interrupted)));
        }
    }
}
