//! Cluster adapter: translation of batch job records into Kubernetes objects
//! and CRUD against the cluster.
//!
//! The adapter is stateless; the cluster itself is the authoritative record
//! of what is actually running. API failures other than the documented
//! `NotFound`/`AlreadyExists` cases surface as `Error::Cluster` with the raw
//! response attached for diagnostics.

pub mod manifests;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret};
use kube::api::{Api, DeleteParams, ListParams, PostParams, PropagationPolicy};
use secrecy::SecretString;
use tracing::{debug, info};

use crate::config::{GoogleCloudSettings, KubernetesSettings};
use crate::error::{Error, Result};
use crate::models::BatchJob;
use manifests::{ManifestSettings, JOB_TYPE_BATCH, JOB_TYPE_CLEANUP, JOB_TYPE_KEY, RELATED_JOB_KEY};

/// Coarse state of a cluster Job, derived from its status conditions and
/// completion counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterJobState {
    Active,
    Succeeded,
    Failed,
}

/// Status snapshot of one cluster Job.
#[derive(Debug, Clone)]
pub struct JobObservation {
    pub state: ClusterJobState,
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
}

/// Whether an observed Job is a primary or a cleanup job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Batch,
    Cleanup,
}

/// One Job returned by [`BatchCluster::list_jobs`], with the batch job name
/// it belongs to resolved from its markers.
#[derive(Debug, Clone)]
pub struct ObservedJob {
    /// Name of the owning batch job record (not the cluster object name).
    pub batch_job_name: String,
    pub kind: JobKind,
    pub observation: JobObservation,
}

/// Capability surface the lifecycle coordinator and the reconciler need from
/// the cluster.
#[async_trait]
pub trait BatchCluster: Send + Sync {
    /// Create the credentials Secret if absent; succeeds whether it existed
    /// or was just created.
    async fn ensure_secret(&self) -> Result<()>;

    /// Create a `ReadWriteOnce` claim; fails if it already exists.
    async fn create_pvc(&self, name: &str) -> Result<()>;

    /// Best-effort delete; a missing claim is success.
    async fn delete_pvc(&self, name: &str) -> Result<()>;

    /// Render and submit the primary Job manifest.
    async fn create_job(&self, job: &BatchJob) -> Result<()>;

    /// Render and submit the cleanup Job manifest.
    async fn create_cleanup_job(&self, job: &BatchJob) -> Result<()>;

    /// Delete a Job with background propagation so pods are reaped; a
    /// missing Job is success.
    async fn delete_job(&self, name: &str) -> Result<()>;

    /// Observed status of every Job this orchestrator manages in the
    /// namespace.
    async fn list_jobs(&self) -> Result<Vec<ObservedJob>>;
}

/// kube-rs implementation of [`BatchCluster`].
pub struct KubeCluster {
    jobs: Api<Job>,
    pvcs: Api<PersistentVolumeClaim>,
    secrets: Api<Secret>,
    namespace: String,
    settings: ManifestSettings,
    credentials_file_path: String,
}

impl KubeCluster {
    /// Connect to the API server. An explicit `KUBERNETES_API_URL` wins;
    /// otherwise the client configuration is inferred from the kubeconfig or
    /// the in-cluster environment.
    pub async fn connect(
        kubernetes: &KubernetesSettings,
        google_cloud: &GoogleCloudSettings,
        backoff_limit: i32,
    ) -> Result<Self> {
        let mut config = match &kubernetes.api_url {
            Some(url) => {
                let cluster_url = url
                    .parse()
                    .map_err(|e| Error::Config(format!("invalid KUBERNETES_API_URL: {e}")))?;
                kube::Config::new(cluster_url)
            }
            None => kube::Config::infer()
                .await
                .map_err(|e| Error::Config(format!("failed to infer cluster config: {e}")))?,
        };
        config.default_namespace = kubernetes.namespace.clone();
        config.connect_timeout = Some(kubernetes.request_timeout);
        config.read_timeout = Some(kubernetes.request_timeout);
        if let Some(api_key) = &kubernetes.api_key {
            config.auth_info.token = Some(SecretString::from(api_key.clone()));
        }

        let client = kube::Client::try_from(config)
            .map_err(|e| Error::Config(format!("failed to build cluster client: {e}")))?;

        let namespace = kubernetes.namespace.clone();
        Ok(Self {
            jobs: Api::namespaced(client.clone(), &namespace),
            pvcs: Api::namespaced(client.clone(), &namespace),
            secrets: Api::namespaced(client, &namespace),
            namespace,
            settings: ManifestSettings {
                backoff_limit,
                bucket_name: google_cloud.bucket_name.clone(),
                initializer_image: kubernetes.initializer_image.clone(),
                gcsfuse_image: kubernetes.gcsfuse_image.clone(),
            },
            credentials_file_path: google_cloud.credentials_file_path.clone(),
        })
    }

    fn delete_params() -> DeleteParams {
        // Background propagation reaps the pods; zero grace deletes right away.
        DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            grace_period_seconds: Some(0),
            ..Default::default()
        }
    }
}

#[async_trait]
impl BatchCluster for KubeCluster {
    async fn ensure_secret(&self) -> Result<()> {
        match self.secrets.get(manifests::GCS_SECRET_NAME).await {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(Error::cluster("failed to read credentials secret", &e)),
        }

        info!(secret = manifests::GCS_SECRET_NAME, "Creating secret on the cluster");
        let credentials = tokio::fs::read_to_string(&self.credentials_file_path)
            .await
            .map_err(|e| {
                Error::Config(format!(
                    "failed to read credentials file {}: {e}",
                    self.credentials_file_path
                ))
            })?;
        let secret = manifests::render_secret(&self.namespace, credentials);

        match self.secrets.create(&PostParams::default(), &secret).await {
            Ok(_) => Ok(()),
            // created concurrently
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(Error::cluster("failed to create credentials secret", &e)),
        }
    }

    async fn create_pvc(&self, name: &str) -> Result<()> {
        info!(pvc = name, "Creating PVC on the cluster");
        let pvc = manifests::render_pvc(name, &self.namespace);
        self.pvcs
            .create(&PostParams::default(), &pvc)
            .await
            .map_err(|e| Error::cluster(format!("failed to create PVC {name}"), &e))?;
        Ok(())
    }

    async fn delete_pvc(&self, name: &str) -> Result<()> {
        info!(pvc = name, "Deleting PVC from the cluster");
        match self.pvcs.delete(name, &Self::delete_params()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::cluster(format!("failed to delete PVC {name}"), &e)),
        }
    }

    async fn create_job(&self, job: &BatchJob) -> Result<()> {
        info!(job = %job.name, "Creating job on the cluster");
        let manifest = manifests::render_batch_job(job, &self.settings)?;
        self.jobs
            .create(&PostParams::default(), &manifest)
            .await
            .map_err(|e| {
                Error::cluster(
                    format!("API request failed while creating job {}", job.name),
                    &e,
                )
            })?;
        Ok(())
    }

    async fn create_cleanup_job(&self, job: &BatchJob) -> Result<()> {
        info!(job = %job.cleanup_job_name(), "Creating cleanup job on the cluster");
        let manifest = manifests::render_cleanup_job(job, &self.settings)?;
        self.jobs
            .create(&PostParams::default(), &manifest)
            .await
            .map_err(|e| {
                Error::cluster(
                    format!(
                        "API request failed while creating cleanup job {}",
                        job.cleanup_job_name()
                    ),
                    &e,
                )
            })?;
        Ok(())
    }

    async fn delete_job(&self, name: &str) -> Result<()> {
        info!(job = name, "Deleting job from the cluster");
        match self.jobs.delete(name, &Self::delete_params()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::cluster(format!("failed to delete job {name}"), &e)),
        }
    }

    async fn list_jobs(&self) -> Result<Vec<ObservedJob>> {
        let params = ListParams::default().labels(&format!("app=job-runner,{JOB_TYPE_KEY}"));
        let jobs = self
            .jobs
            .list(&params)
            .await
            .map_err(|e| Error::cluster("failed to list jobs", &e))?;

        let mut observed = Vec::with_capacity(jobs.items.len());
        for job in jobs.items {
            match parse_observed_job(&job) {
                Some(parsed) => observed.push(parsed),
                None => debug!(
                    job = job.metadata.name.as_deref().unwrap_or("<unnamed>"),
                    "Skipping job without recognizable markers"
                ),
            }
        }
        Ok(observed)
    }
}

/// Resolve a listed Job into the batch job it belongs to.
fn parse_observed_job(job: &Job) -> Option<ObservedJob> {
    let labels = job.metadata.labels.as_ref()?;
    let kind = match labels.get(JOB_TYPE_KEY).map(String::as_str) {
        Some(JOB_TYPE_BATCH) => JobKind::Batch,
        Some(JOB_TYPE_CLEANUP) => JobKind::Cleanup,
        _ => return None,
    };
    let batch_job_name = labels.get(RELATED_JOB_KEY)?.clone();
    let observation = observe(job.status.as_ref());

    Some(ObservedJob {
        batch_job_name,
        kind,
        observation,
    })
}

/// Classify a Job's status the way the cluster reports it: completion
/// conditions first, then the legacy counter fields. A Job without status is
/// treated as active (just created, controller has not caught up).
pub fn observe(status: Option<&JobStatus>) -> JobObservation {
    let Some(status) = status else {
        return JobObservation {
            state: ClusterJobState::Active,
            start_time: None,
            completion_time: None,
        };
    };

    let mut state = ClusterJobState::Active;
    if let Some(conditions) = &status.conditions {
        for condition in conditions {
            if condition.type_ == "Complete" && condition.status == "True" {
                state = ClusterJobState::Succeeded;
            }
            if condition.type_ == "Failed" && condition.status == "True" {
                state = ClusterJobState::Failed;
            }
        }
    }
    if state == ClusterJobState::Active {
        if status.succeeded.unwrap_or(0) > 0 {
            state = ClusterJobState::Succeeded;
        } else if status.failed.unwrap_or(0) > 0 {
            state = ClusterJobState::Failed;
        }
    }

    JobObservation {
        state,
        start_time: status.start_time.as_ref().map(|t| t.0),
        completion_time: status.completion_time.as_ref().map(|t| t.0),
    }
}

// =========================================================================
// Mock cluster for tests
// =========================================================================
