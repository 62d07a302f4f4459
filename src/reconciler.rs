//! Periodic status synchronization between the cluster and the repository.
//!
//! Each tick takes a snapshot of both sides and applies the lifecycle
//! transition table. Reconciliation is one-way (cluster to database): the
//! cluster is ground truth for running workloads, the database only records
//! what was observed. Ticks never overlap; a tick that outlives the interval
//! simply delays the next one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cluster::{BatchCluster, ClusterJobState, JobKind, JobObservation};
use crate::error::Result;
use crate::lifecycle::Coordinator;
use crate::models::{BatchJob, BatchJobStatus};
use crate::repository::JobStore;
use crate::storage::ObjectStorage;

/// Number of consecutive ticks a job may be unobservable on the cluster
/// before the record is marked failed. Absorbs eventual consistency in the
/// Kubernetes API.
pub const MISSING_TICK_GRACE: u32 = 2;

/// What one tick decided to do with one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Wait,
    MarkRunning,
    BeginCleanup,
    MarkSucceeded,
    MarkFailed,
}

/// The transition table. `missing_ticks` is the number of consecutive ticks
/// (including the current one) the relevant Job has been missing from the
/// cluster listing.
fn plan(
    status: BatchJobStatus,
    observation: Option<&JobObservation>,
    missing_ticks: u32,
) -> Step {
    match (status, observation) {
        (BatchJobStatus::Created, Some(obs)) => match obs.state {
            ClusterJobState::Failed => Step::MarkFailed,
            // a job that finished before we ever saw it run still walks the
            // normal path; the next tick advances it to cleaning
            ClusterJobState::Active | ClusterJobState::Succeeded => Step::MarkRunning,
        },
        (BatchJobStatus::Running, Some(obs)) => match obs.state {
            ClusterJobState::Active => Step::Wait,
            ClusterJobState::Succeeded => Step::BeginCleanup,
            ClusterJobState::Failed => Step::MarkFailed,
        },
        (BatchJobStatus::Cleaning, Some(obs)) => match obs.state {
            ClusterJobState::Active => Step::Wait,
            ClusterJobState::Succeeded => Step::MarkSucceeded,
            ClusterJobState::Failed => Step::MarkFailed,
        },
        (
            BatchJobStatus::Created | BatchJobStatus::Running | BatchJobStatus::Cleaning,
            None,
        ) => {
            if missing_ticks > MISSING_TICK_GRACE {
                Step::MarkFailed
            } else {
                Step::Wait
            }
        }
        // terminal records admit no further transitions
        _ => Step::Wait,
    }
}

pub struct Reconciler {
    store: Arc<dyn JobStore>,
    cluster: Arc<dyn BatchCluster>,
    storage: Arc<dyn ObjectStorage>,
    coordinator: Arc<Coordinator>,
    interval: Duration,
    /// Consecutive-miss counters keyed by record id.
    missing: HashMap<Uuid, u32>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn JobStore>,
        cluster: Arc<dyn BatchCluster>,
        storage: Arc<dyn ObjectStorage>,
        coordinator: Arc<Coordinator>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            cluster,
            storage,
            coordinator,
            interval,
            missing: HashMap::new(),
        }
    }

    /// Tick forever. One execution per tick; a slow tick delays rather than
    /// stacks the next one.
    pub async fn run(mut self) {
        info!(interval = ?self.interval, "Starting batch job synchronization");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Err(e) = self.run_once().await {
                error!(error = %e, "Synchronization tick failed");
            }
        }
    }

    /// A single synchronization pass.
    pub async fn run_once(&mut self) -> Result<()> {
        let records = self.store.list_unfinished().await?;
        let observed = self.cluster.list_jobs().await?;

        let mut primary: HashMap<String, JobObservation> = HashMap::new();
        let mut cleanup: HashMap<String, JobObservation> = HashMap::new();
        for job in observed {
            match job.kind {
                JobKind::Batch => primary.insert(job.batch_job_name, job.observation),
                JobKind::Cleanup => cleanup.insert(job.batch_job_name, job.observation),
            };
        }

        let known: std::collections::HashSet<&str> =
            records.iter().map(|r| r.name.as_str()).collect();
        for name in primary.keys().chain(cleanup.keys()) {
            if !known.contains(name.as_str()) {
                debug!(job = %name, "Found an unmanaged job in the cluster. Ignoring");
            }
        }

        debug!(records = records.len(), "Synchronizing batch jobs");
        for record in records {
            let name = record.name.clone();
            let id = record.id;
            if let Err(e) = self.synchronize(record, &primary, &cleanup).await {
                error!(job = %name, %id, error = %e, "Failed to synchronize record");
            }
        }
        Ok(())
    }

    async fn synchronize(
        &mut self,
        job: BatchJob,
        primary: &HashMap<String, JobObservation>,
        cleanup: &HashMap<String, JobObservation>,
    ) -> Result<()> {
        // the record's current phase decides which cluster Job matters
        let observation = match job.status {
            BatchJobStatus::Created | BatchJobStatus::Running => primary.get(&job.name),
            BatchJobStatus::Cleaning => cleanup.get(&job.name),
            _ => None,
        };

        let missing_ticks = if observation.is_none() {
            let count = self.missing.entry(job.id).or_insert(0);
            *count += 1;
            *count
        } else {
            self.missing.remove(&job.id);
            0
        };

        let step = plan(job.status, observation, missing_ticks);
        match step {
            Step::Wait => {}
            Step::MarkRunning => {
                if self
                    .store
                    .transition(job.id, BatchJobStatus::Created, BatchJobStatus::Running)
                    .await?
                {
                    let started = observation
                        .and_then(|o| o.start_time)
                        .unwrap_or_else(Utc::now);
                    self.store.set_start_time(job.id, started).await?;
                    info!(job = %job.name, "Batch job started on the cluster");
                }
            }
            Step::BeginCleanup => {
                // winning this compare-and-set is the exactly-once guard for
                // the cleanup job launch
                if self
                    .store
                    .transition(job.id, BatchJobStatus::Running, BatchJobStatus::Cleaning)
                    .await?
                {
                    let stopped = observation
                        .and_then(|o| o.completion_time)
                        .unwrap_or_else(Utc::now);
                    self.store.set_stop_time(job.id, stopped).await?;
                    info!(job = %job.name, "Batch job succeeded, launching cleanup job");
                    self.cluster.create_cleanup_job(&job).await?;
                }
            }
            Step::MarkSucceeded => {
                if self
                    .store
                    .transition(job.id, BatchJobStatus::Cleaning, BatchJobStatus::Succeeded)
                    .await?
                {
                    let url = self.storage.url_for(&job.output_object_key());
                    self.store.set_output_file_url(job.id, &url).await?;
                    info!(job = %job.name, "Cleanup job succeeded, output uploaded");
                    self.missing.remove(&job.id);
                    self.coordinator.teardown(&job).await;
                }
            }
            Step::MarkFailed => {
                if self.store.transition(job.id, job.status, BatchJobStatus::Failed).await? {
                    if let Some(obs) = observation {
                        let stopped = obs.completion_time.unwrap_or_else(Utc::now);
                        self.store.set_stop_time(job.id, stopped).await?;
                    }
                    warn!(job = %job.name, previous = %job.status, "Batch job failed");
                    self.missing.remove(&job.id);
                    self.coordinator.teardown(&job).await;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::mock::MockCluster;
    use crate::models::BatchJobParameters;
    use crate::repository::memory::MemoryJobStore;
    use crate::storage::memory::MemoryStorage;

    fn observation(state: ClusterJobState) -> JobObservation {
        JobObservation {
            state,
            start_time: Some(Utc::now()),
            completion_time: match state {
                ClusterJobState::Active => None,
                _ => Some(Utc::now()),
            },
        }
    }

    // =====================================================================
    // Decision table
    // =====================================================================

    #[test]
    fn created_with_present_job_starts_running() {
        let obs = observation(ClusterJobState::Active);
        assert_eq!(plan(BatchJobStatus::Created, Some(&obs), 0), Step::MarkRunning);
    }

    #[test]
    fn created_with_failed_job_fails() {
        let obs = observation(ClusterJobState::Failed);
        assert_eq!(plan(BatchJobStatus::Created, Some(&obs), 0), Step::MarkFailed);
    }

    #[test]
    fn created_missing_fails_only_after_grace() {
        assert_eq!(plan(BatchJobStatus::Created, None, 1), Step::Wait);
        assert_eq!(plan(BatchJobStatus::Created, None, 2), Step::Wait);
        assert_eq!(plan(BatchJobStatus::Created, None, 3), Step::MarkFailed);
    }

    #[test]
    fn running_job_transitions() {
        let active = observation(ClusterJobState::Active);
        let done = observation(ClusterJobState::Succeeded);
        let failed = observation(ClusterJobState::Failed);
        assert_eq!(plan(BatchJobStatus::Running, Some(&active), 0), Step::Wait);
        assert_eq!(plan(BatchJobStatus::Running, Some(&done), 0), Step::BeginCleanup);
        assert_eq!(plan(BatchJobStatus::Running, Some(&failed), 0), Step::MarkFailed);
    }

    #[test]
    fn cleaning_job_transitions() {
        let active = observation(ClusterJobState::Active);
        let done = observation(ClusterJobState::Succeeded);
        let failed = observation(ClusterJobState::Failed);
        assert_eq!(plan(BatchJobStatus::Cleaning, Some(&active), 0), Step::Wait);
        assert_eq!(plan(BatchJobStatus::Cleaning, Some(&done), 0), Step::MarkSucceeded);
        assert_eq!(plan(BatchJobStatus::Cleaning, Some(&failed), 0), Step::MarkFailed);
        assert_eq!(plan(BatchJobStatus::Cleaning, None, 3), Step::MarkFailed);
    }

    #[test]
    fn terminal_records_never_move() {
        let obs = observation(ClusterJobState::Succeeded);
        for status in [
            BatchJobStatus::Failed,
            BatchJobStatus::Killed,
            BatchJobStatus::Succeeded,
        ] {
            assert_eq!(plan(status, Some(&obs), 0), Step::Wait);
            assert_eq!(plan(status, None, 99), Step::Wait);
        }
    }

    // =====================================================================
    // Tick behavior
    // =====================================================================

    struct Harness {
        store: Arc<MemoryJobStore>,
        cluster: Arc<MockCluster>,
        reconciler: Reconciler,
    }

    fn harness(job: BatchJob) -> Harness {
        let store = Arc::new(MemoryJobStore::with_job(job));
        let cluster = Arc::new(MockCluster::default());
        let storage = Arc::new(MemoryStorage::default());
        let coordinator = Arc::new(Coordinator::new(
            store.clone(),
            cluster.clone(),
            storage.clone(),
        ));
        let reconciler = Reconciler::new(
            store.clone(),
            cluster.clone(),
            storage,
            coordinator,
            Duration::from_secs(30),
        );
        Harness {
            store,
            cluster,
            reconciler,
        }
    }

    fn record(name: &str, status: BatchJobStatus) -> BatchJob {
        let mut job = BatchJob::new(
            Some(name.into()),
            "acct".into(),
            BatchJobParameters {
                docker_image: "alpine".into(),
                ..Default::default()
            },
            Utc::now(),
        );
        job.status = status;
        job
    }

    #[tokio::test]
    async fn created_record_becomes_running_when_job_appears() {
        let job = record("demo", BatchJobStatus::Created);
        let id = job.id;
        let mut h = harness(job);
        h.cluster
            .observe_job("demo", JobKind::Batch, ClusterJobState::Active);

        h.reconciler.run_once().await.unwrap();

        let stored = h.store.snapshot(id).unwrap();
        assert_eq!(stored.status, BatchJobStatus::Running);
        assert!(stored.start_time.is_some());
    }

    #[tokio::test]
    async fn succeeded_primary_launches_cleanup_exactly_once() {
        let job = record("demo", BatchJobStatus::Running);
        let id = job.id;
        let mut h = harness(job);
        h.cluster
            .observe_job("demo", JobKind::Batch, ClusterJobState::Succeeded);

        h.reconciler.run_once().await.unwrap();

        let stored = h.store.snapshot(id).unwrap();
        assert_eq!(stored.status, BatchJobStatus::Cleaning);
        assert!(stored.stop_time.is_some());
        let launches = h
            .cluster
            .calls()
            .iter()
            .filter(|c| c.starts_with("create_cleanup_job"))
            .count();
        assert_eq!(launches, 1);

        // next tick: record is cleaning, primary still listed as succeeded,
        // cleanup job not yet visible -- nothing must be launched again
        h.reconciler.run_once().await.unwrap();
        let launches = h
            .cluster
            .calls()
            .iter()
            .filter(|c| c.starts_with("create_cleanup_job"))
            .count();
        assert_eq!(launches, 1);
        assert_eq!(
            h.store.snapshot(id).unwrap().status,
            BatchJobStatus::Cleaning
        );
    }

    #[tokio::test]
    async fn succeeded_cleanup_completes_record_and_tears_down() {
        let job = record("demo", BatchJobStatus::Cleaning);
        let id = job.id;
        let mut h = harness(job);
        h.cluster
            .observe_job("demo", JobKind::Cleanup, ClusterJobState::Succeeded);

        h.reconciler.run_once().await.unwrap();

        let stored = h.store.snapshot(id).unwrap();
        assert_eq!(stored.status, BatchJobStatus::Succeeded);
        assert_eq!(
            stored.output_file_url.as_deref(),
            Some("https://storage.googleapis.com/test-bucket/demo-output.zip")
        );
        let calls = h.cluster.calls();
        assert!(calls.contains(&"delete_job:demo".to_string()));
        assert!(calls.contains(&"delete_job:demo-cleanup".to_string()));
        assert!(calls.contains(&"delete_pvc:job-demo-output".to_string()));
    }

    #[tokio::test]
    async fn failed_primary_fails_record_with_teardown() {
        let job = record("demo", BatchJobStatus::Running);
        let id = job.id;
        let mut h = harness(job);
        h.cluster
            .observe_job("demo", JobKind::Batch, ClusterJobState::Failed);

        h.reconciler.run_once().await.unwrap();

        let stored = h.store.snapshot(id).unwrap();
        assert_eq!(stored.status, BatchJobStatus::Failed);
        assert!(stored.stop_time.is_some());
        assert!(stored.output_file_url.is_none());
        assert!(h.cluster.calls().contains(&"delete_job:demo".to_string()));
    }

    #[tokio::test]
    async fn failed_cleanup_fails_record() {
        let job = record("demo", BatchJobStatus::Cleaning);
        let id = job.id;
        let mut h = harness(job);
        h.cluster
            .observe_job("demo", JobKind::Cleanup, ClusterJobState::Failed);

        h.reconciler.run_once().await.unwrap();

        let stored = h.store.snapshot(id).unwrap();
        assert_eq!(stored.status, BatchJobStatus::Failed);
        assert!(stored.output_file_url.is_none());
    }

    #[tokio::test]
    async fn created_record_swept_after_grace_window() {
        let job = record("ghost", BatchJobStatus::Created);
        let id = job.id;
        let mut h = harness(job);

        h.reconciler.run_once().await.unwrap();
        h.reconciler.run_once().await.unwrap();
        assert_eq!(
            h.store.snapshot(id).unwrap().status,
            BatchJobStatus::Created
        );

        h.reconciler.run_once().await.unwrap();
        assert_eq!(h.store.snapshot(id).unwrap().status, BatchJobStatus::Failed);
    }

    #[tokio::test]
    async fn reappearing_job_resets_the_miss_counter() {
        let job = record("flaky", BatchJobStatus::Created);
        let id = job.id;
        let mut h = harness(job);

        h.reconciler.run_once().await.unwrap();
        h.reconciler.run_once().await.unwrap();

        h.cluster
            .observe_job("flaky", JobKind::Batch, ClusterJobState::Active);
        h.reconciler.run_once().await.unwrap();
        assert_eq!(
            h.store.snapshot(id).unwrap().status,
            BatchJobStatus::Running
        );
    }

    #[tokio::test]
    async fn unmanaged_cluster_jobs_are_ignored() {
        let job = record("mine", BatchJobStatus::Running);
        let id = job.id;
        let mut h = harness(job);
        h.cluster
            .observe_job("mine", JobKind::Batch, ClusterJobState::Active);
        h.cluster
            .observe_job("intruder", JobKind::Batch, ClusterJobState::Failed);

        h.reconciler.run_once().await.unwrap();

        assert_eq!(
            h.store.snapshot(id).unwrap().status,
            BatchJobStatus::Running
        );
        // nothing was deleted or launched for the unmanaged job
        assert!(h.cluster.calls().is_empty());
    }

    #[tokio::test]
    async fn full_lifecycle_happy_path() {
        let mut job = record("e2e", BatchJobStatus::Created);
        job.job_parameters.input_zip = Some(b"hello".to_vec());
        job.has_input_file = true;
        let id = job.id;
        let mut h = harness(job);

        let storage = Arc::new(MemoryStorage::default());
        let coordinator = Coordinator::new(h.store.clone(), h.cluster.clone(), storage.clone());
        coordinator
            .provision(id, Some(b"hello".to_vec()))
            .await
            .unwrap();
        assert_eq!(storage.objects.lock().unwrap()["e2e-input.zip"], b"hello");

        // tick 1: job shows up on the cluster
        h.cluster
            .observe_job("e2e", JobKind::Batch, ClusterJobState::Active);
        h.reconciler.run_once().await.unwrap();
        assert_eq!(h.store.snapshot(id).unwrap().status, BatchJobStatus::Running);

        // tick 2: primary succeeded, cleanup gets launched
        h.cluster.clear_observations();
        h.cluster
            .observe_job("e2e", JobKind::Batch, ClusterJobState::Succeeded);
        h.reconciler.run_once().await.unwrap();
        assert_eq!(
            h.store.snapshot(id).unwrap().status,
            BatchJobStatus::Cleaning
        );

        // tick 3: cleanup succeeded, record completes and everything is torn down
        h.cluster
            .observe_job("e2e", JobKind::Cleanup, ClusterJobState::Succeeded);
        h.reconciler.run_once().await.unwrap();

        let stored = h.store.snapshot(id).unwrap();
        assert_eq!(stored.status, BatchJobStatus::Succeeded);
        assert!(stored.start_time.is_some());
        assert!(stored.stop_time.is_some());
        assert!(stored.output_file_url.is_some());

        let calls = h.cluster.calls();
        assert!(calls.contains(&"delete_job:e2e".to_string()));
        assert!(calls.contains(&"delete_job:e2e-cleanup".to_string()));
        assert!(calls.contains(&"delete_pvc:job-e2e-input".to_string()));
        assert!(calls.contains(&"delete_pvc:job-e2e-output".to_string()));
    }

    #[tokio::test]
    async fn cancelled_record_is_untouched_by_next_tick() {
        let job = record("gone", BatchJobStatus::Killed);
        let id = job.id;
        let mut h = harness(job);
        h.cluster
            .observe_job("gone", JobKind::Batch, ClusterJobState::Failed);

        h.reconciler.run_once().await.unwrap();

        assert_eq!(h.store.snapshot(id).unwrap().status, BatchJobStatus::Killed);
        assert!(h.cluster.calls().is_empty());
    }
}
