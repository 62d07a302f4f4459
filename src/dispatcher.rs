//! Background provisioning dispatch.
//!
//! The HTTP handler inserts the record and hands it over here so the request
//! returns promptly; a bounded pool of workers drives the coordinator.
//! Delivery is at-least-once: the coordinator re-reads the record and skips
//! any job that is no longer `created`, so a redelivered or replayed message
//! is harmless. Durability comes from the database rather than a broker --
//! records still in `created` are re-enqueued at startup, and the reconciler
//! sweeps records whose provisioning never reached the cluster.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::lifecycle::Coordinator;
use crate::models::BatchJobStatus;
use crate::repository::JobStore;

/// One unit of provisioning work. The input payload travels in memory only;
/// it is never persisted.
#[derive(Debug)]
pub struct ProvisionTask {
    pub id: Uuid,
    pub input: Option<Vec<u8>>,
}

/// Handle used by the API facade to enqueue provisioning work.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<ProvisionTask>,
}

impl Dispatcher {
    /// Spawn the dispatch loop with `workers` concurrent provisioning slots.
    pub fn start(coordinator: Arc<Coordinator>, workers: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(256);
        let handle = tokio::spawn(dispatch_loop(rx, coordinator, workers));
        (Self { tx }, handle)
    }

    /// Enqueue provisioning for a freshly inserted record.
    pub async fn enqueue(&self, task: ProvisionTask) -> Result<()> {
        self.tx.send(task).await.map_err(|_| Error::Cluster {
            message: "provisioning queue is closed".to_string(),
            response: None,
        })
    }

    /// Re-enqueue every record still waiting for provisioning. Called once at
    /// startup so a restart does not strand records in `created`. Records
    /// whose input payload died with the previous process fail provisioning
    /// and are compensated by the coordinator.
    pub async fn requeue_pending(&self, store: &dyn JobStore) -> Result<usize> {
        let pending = store.list_by_status(BatchJobStatus::Created).await?;
        let count = pending.len();
        for job in pending {
            // the input payload (if any) died with the previous process; the
            // coordinator fails and compensates such records
            if let Err(e) = self
                .enqueue(ProvisionTask {
                    id: job.id,
                    input: None,
                })
                .await
            {
                warn!(job = %job.name, error = %e, "Failed to requeue pending record");
            }
        }
        if count > 0 {
            info!(count, "Requeued records pending provisioning");
        }
        Ok(count)
    }
}

async fn dispatch_loop(
    mut rx: mpsc::Receiver<ProvisionTask>,
    coordinator: Arc<Coordinator>,
    workers: usize,
) {
    info!(workers, "Provisioning dispatcher started");
    let semaphore = Arc::new(Semaphore::new(workers));

    while let Some(task) = rx.recv().await {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            if let Err(e) = coordinator.provision(task.id, task.input).await {
                error!(id = %task.id, error = %e, "Provisioning failed");
            }
            drop(permit);
        });
    }

    // wait for in-flight provisioning before returning
    let _ = semaphore.acquire_many(workers as u32).await;
    info!("Provisioning dispatcher shutting down");
}
