//! Lifecycle coordination: provisioning, teardown and cancellation of the
//! cluster resource graph for one batch job.
//!
//! Provisioning and cancellation race against each other and against the
//! reconciler; every status change goes through the repository's
//! compare-and-set so exactly one writer wins and the rest abandon their
//! remaining steps.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cluster::BatchCluster;
use crate::error::{Error, Result};
use crate::models::{BatchJob, BatchJobStatus};
use crate::repository::JobStore;
use crate::storage::ObjectStorage;

/// Resources created during provisioning, tracked for compensation.
enum Provisioned {
    OutputPvc,
    InputPvc,
    InputObject,
}

pub struct Coordinator {
    store: Arc<dyn JobStore>,
    cluster: Arc<dyn BatchCluster>,
    storage: Arc<dyn ObjectStorage>,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn JobStore>,
        cluster: Arc<dyn BatchCluster>,
        storage: Arc<dyn ObjectStorage>,
    ) -> Self {
        Self {
            store,
            cluster,
            storage,
        }
    }

    /// Stage the cluster resource graph for a freshly created record and
    /// submit the primary Job.
    ///
    /// Safe to deliver more than once: the record is re-read and the work is
    /// skipped unless the status is still `created`. On any step failure the
    /// resources created so far are deleted in reverse order and the record
    /// is moved to `failed` with the underlying error attached.
    pub async fn provision(&self, id: Uuid, input: Option<Vec<u8>>) -> Result<()> {
        let Some(job) = self.store.get(id).await? else {
            warn!(%id, "Provisioning requested for unknown record");
            return Ok(());
        };
        if job.status != BatchJobStatus::Created {
            debug!(%id, status = %job.status, "Record no longer pending, skipping provisioning");
            return Ok(());
        }

        info!(job = %job.name, "Provisioning batch job");
        match self.stage_resources(&job, input).await {
            Ok(()) => {
                info!(job = %job.name, "Batch job submitted to the cluster");
                Ok(())
            }
            Err((created, err)) => {
                error!(job = %job.name, error = %err, "Provisioning failed, compensating");
                self.compensate(&job, created).await;

                if self
                    .store
                    .transition(job.id, BatchJobStatus::Created, BatchJobStatus::Failed)
                    .await?
                {
                    if let Some(diagnostic) = err.diagnostic() {
                        self.store.set_last_pod_response(job.id, diagnostic).await?;
                    }
                }
                Err(err)
            }
        }
    }

    async fn stage_resources(
        &self,
        job: &BatchJob,
        input: Option<Vec<u8>>,
    ) -> std::result::Result<(), (Vec<Provisioned>, Error)> {
        let mut created = Vec::new();

        macro_rules! step {
            ($expr:expr) => {
                match $expr {
                    Ok(value) => value,
                    Err(err) => return Err((created, err)),
                }
            };
        }

        step!(self.cluster.ensure_secret().await);

        step!(self.cluster.create_pvc(&job.output_pvc_claim_name()).await);
        created.push(Provisioned::OutputPvc);

        if job.has_input_file {
            step!(self.cluster.create_pvc(&job.input_pvc_claim_name()).await);
            created.push(Provisioned::InputPvc);

            let bytes = step!(input.ok_or_else(|| Error::Storage(
                "input payload is no longer available".to_string()
            )));
            step!(self.storage.upload(&job.input_object_key(), bytes).await);
            created.push(Provisioned::InputObject);
        }

        step!(self.cluster.create_job(job).await);
        Ok(())
    }

    /// Delete everything a partial provisioning attempt left behind, newest
    /// first. Best effort; failures are logged and do not stop the rest.
    async fn compensate(&self, job: &BatchJob, created: Vec<Provisioned>) {
        for resource in created.into_iter().rev() {
            let outcome = match resource {
                Provisioned::InputObject => self.storage.delete(&job.input_object_key()).await,
                Provisioned::InputPvc => {
                    self.cluster.delete_pvc(&job.input_pvc_claim_name()).await
                }
                Provisioned::OutputPvc => {
                    self.cluster.delete_pvc(&job.output_pvc_claim_name()).await
                }
            };
            if let Err(e) = outcome {
                warn!(job = %job.name, error = %e, "Compensating delete failed");
            }
        }
    }

    /// Remove every cluster artifact belonging to a record. All steps run
    /// unconditionally; missing resources are success, other failures are
    /// logged and do not abort subsequent steps. Running teardown twice
    /// leaves identical cluster state.
    pub async fn teardown(&self, job: &BatchJob) {
        info!(job = %job.name, "Tearing down batch job resources");

        if let Err(e) = self.cluster.delete_job(&job.name).await {
            warn!(job = %job.name, error = %e, "Failed to delete primary job");
        }
        if let Err(e) = self.cluster.delete_job(&job.cleanup_job_name()).await {
            warn!(job = %job.name, error = %e, "Failed to delete cleanup job");
        }
        if job.has_input_file {
            if let Err(e) = self.cluster.delete_pvc(&job.input_pvc_claim_name()).await {
                warn!(job = %job.name, error = %e, "Failed to delete input PVC");
            }
        }
        if let Err(e) = self.cluster.delete_pvc(&job.output_pvc_claim_name()).await {
            warn!(job = %job.name, error = %e, "Failed to delete output PVC");
        }
    }

    /// Prematurely stop a job. Only records in `running` or `cleaning` can
    /// be cancelled; the compare-and-set to `killed` decides the race with a
    /// concurrent reconciler transition.
    pub async fn cancel(&self, id: Uuid) -> Result<BatchJob> {
        let Some(job) = self.store.get(id).await? else {
            return Err(Error::NotFound(format!("Batch job {id}")));
        };

        if !matches!(
            job.status,
            BatchJobStatus::Running | BatchJobStatus::Cleaning
        ) {
            return Err(Error::InvalidState(format!(
                "Can't stop batch job {id}. Status is: {}.",
                job.status
            )));
        }

        if !self
            .store
            .transition(job.id, job.status, BatchJobStatus::Killed)
            .await?
        {
            // the reconciler moved the record first; report the fresh status
            let status = self
                .store
                .get(id)
                .await?
                .map(|j| j.status.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(Error::InvalidState(format!(
                "Can't stop batch job {id}. Status is: {status}."
            )));
        }

        info!(job = %job.name, "Batch job killed, deleting cluster resources");
        self.cluster.delete_job(&job.name).await?;
        self.cluster.delete_job(&job.cleanup_job_name()).await?;
        self.store.set_stop_time(job.id, Utc::now()).await?;

        self.teardown(&job).await;

        self.store
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Batch job {id}")))
    }
}
