//! Bounded parallel executor for pure crypto jobs.
//!
//! Jobs are spawned onto tokio's blocking pool, each holding a semaphore
//! permit, and collected through a `JoinSet` barrier. Results come back in
//! submission order regardless of completion order. Small batches run inline
//! on the caller's thread.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::{PermsError, Result};
use crate::provider::CryptoProvider;

/// Crypto pool configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum jobs running at once.
    pub workers: usize,

    /// Batches this size or smaller skip the pool.
    pub inline_threshold: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            inline_threshold: 2,
        }
    }
}

/// A provider plus a bounded worker pool.
pub struct CryptoPool<P: CryptoProvider> {
    provider: Arc<P>,
    permits: Arc<Semaphore>,
    config: PoolConfig,
}

impl<P: CryptoProvider> Clone for CryptoPool<P> {
    fn clone(&self) -> Self {
        Self {
            provider: self.provider.clone(),
            permits: self.permits.clone(),
            config: self.config,
        }
    }
}

impl<P: CryptoProvider> CryptoPool<P> {
    pub fn new(provider: P, config: PoolConfig) -> Self {
        Self {
            provider: Arc::new(provider),
            permits: Arc::new(Semaphore::new(config.workers.max(1))),
            config,
        }
    }

    /// The underlying provider, for one-off calls.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Run `job` over every input and return outputs in input order.
    ///
    /// Jobs must not share mutable state. There is no cancellation; dropping
    /// the returned future lets running jobs finish and discards results.
    pub async fn run_all<T, R, F>(&self, inputs: Vec<T>, job: F) -> Result<Vec<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(&P, T) -> R + Send + Sync + 'static,
    {
        let total = inputs.len();
        if total <= self.config.inline_threshold {
            return Ok(inputs.into_iter().map(|input| job(&*self.provider, input)).collect());
        }

        tracing::debug!(jobs = total, workers = self.config.workers, "dispatching crypto batch");

        let job = Arc::new(job);
        let mut set = JoinSet::new();
        for (index, input) in inputs.into_iter().enumerate() {
            let permit = self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| PermsError::WorkerPool("crypto pool closed".to_string()))?;
            let provider = self.provider.clone();
            let job = job.clone();
            set.spawn_blocking(move || {
                let _permit = permit;
                (index, job(&*provider, input))
            });
        }

        let mut slots: Vec<Option<R>> = (0..total).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            let (index, output) = joined.map_err(|e| PermsError::WorkerPool(e.to_string()))?;
            slots[index] = Some(output);
        }

        slots
            .into_iter()
            .map(|slot| slot.ok_or_else(|| PermsError::WorkerPool("missing job result".into())))
            .collect()
    }
}
