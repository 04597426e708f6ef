use crate::cluster::ClusteringEngine;
use crate::config::PipelineConfig;
use crate::store::{ChangeBatch, DocumentStore};
use crate::types::{PipelineError, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const BATCH_SIZE: usize = 100;
const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(10);
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// One clustering worker: walks the change-feed partitions, claims leases,
/// drains batches into the clustering engine, checkpoints, and releases on
/// shutdown. Losing a lease mid-batch aborts without checkpointing; the
/// events are redelivered to whichever worker holds the lease next, and the
/// engine's idempotent writes absorb the replay.
pub struct ChangeFeedWorker {
    store: Arc<dyn DocumentStore>,
    engine: Arc<ClusteringEngine>,
    config: PipelineConfig,
    owner: String,
}

impl ChangeFeedWorker {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        engine: Arc<ClusteringEngine>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            engine,
            config,
            owner: format!("worker-{}", Uuid::new_v4()),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(owner = %self.owner, "Clustering worker started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let partitions = match self.store.article_partitions().await {
                Ok(partitions) => partitions,
                Err(e) => {
                    warn!("Failed to list change-feed partitions: {}", e);
                    if wait_or_cancel(&shutdown, IDLE_POLL_INTERVAL).await {
                        break;
                    }
                    continue;
                }
            };

            for partition in partitions {
                if shutdown.is_cancelled() {
                    break;
                }
                let lease = match self
                    .store
                    .acquire_lease(&partition, &self.owner, self.config.lease_ttl_seconds)
                    .await
                {
                    Ok(Some(lease)) => lease,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("Lease acquisition failed on {}: {}", partition, e);
                        continue;
                    }
                };

                match self
                    .drain_partition(&partition, lease.continuation, &shutdown)
                    .await
                {
                    Ok(()) => {}
                    Err(PipelineError::LeaseLost { partition }) => {
                        warn!(owner = %self.owner, %partition, "Lease lost mid-batch, abandoning");
                        continue;
                    }
                    Err(e) => warn!("Partition {} aborted, will redeliver: {}", partition, e),
                }

                if let Err(e) = self.store.release_lease(&partition, &self.owner).await {
                    warn!("Failed to release lease on {}: {}", partition, e);
                }
            }

            if wait_or_cancel(&shutdown, IDLE_POLL_INTERVAL).await {
                break;
            }
        }
        info!(owner = %self.owner, "Clustering worker stopped");
    }

    /// Read and process batches until the partition is drained. Checkpoints
    /// only after a batch is fully processed; renews the lease every ten
    /// seconds while working.
    async fn drain_partition(
        &self,
        partition: &str,
        mut continuation: u64,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let mut last_renewal = Instant::now();
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            let batch = self.read_batch(partition, continuation, shutdown).await?;
            if batch.articles.is_empty() {
                return Ok(());
            }
            debug!(
                owner = %self.owner,
                partition,
                batch = batch.articles.len(),
                "Processing change-feed batch"
            );

            self.engine.process_batch(&batch.articles).await?;

            if !self
                .store
                .checkpoint_lease(partition, &self.owner, batch.continuation)
                .await?
            {
                return Err(PipelineError::LeaseLost {
                    partition: partition.to_string(),
                });
            }
            continuation = batch.continuation;

            if last_renewal.elapsed() >= LEASE_RENEW_INTERVAL {
                if !self
                    .store
                    .renew_lease(partition, &self.owner, self.config.lease_ttl_seconds)
                    .await?
                {
                    return Err(PipelineError::LeaseLost {
                        partition: partition.to_string(),
                    });
                }
                last_renewal = Instant::now();
            }
        }
    }

    /// A change-feed read that outlasts store unavailability: exponential
    /// backoff, retried until the store answers or shutdown is signalled.
    /// Events are never dropped because the store is down.
    async fn read_batch(
        &self,
        partition: &str,
        continuation: u64,
        shutdown: &CancellationToken,
    ) -> Result<ChangeBatch> {
        let mut policy = ExponentialBackoff {
            max_elapsed_time: None,
            ..Default::default()
        };
        loop {
            match self
                .store
                .read_article_changes(partition, continuation, BATCH_SIZE)
                .await
            {
                Ok(batch) => return Ok(batch),
                Err(e) => {
                    let delay = policy.next_backoff().unwrap_or(Duration::from_secs(60));
                    warn!(
                        "Change-feed read failed on {} ({}), retrying in {:?}",
                        partition, e, delay
                    );
                    if wait_or_cancel(shutdown, delay).await {
                        return Err(PipelineError::General("shutdown during read".to_string()));
                    }
                }
            }
        }
    }
}

/// Sleep for `duration`, returning true if shutdown fired first.
async fn wait_or_cancel(shutdown: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
