//! Batch job records and their lifecycle statuses.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Suffix appended to a job's name to form its cleanup Job name.
pub const CLEANUP_JOB_SUFFIX: &str = "-cleanup";

/// Lifecycle status of a batch job.
///
/// Progression is monotonic along one of two paths:
/// `created -> running -> cleaning -> succeeded`, or
/// `created -> {failed | killed}` possibly via `running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchJobStatus {
    Created,
    Running,
    Failed,
    Killed,
    Cleaning,
    Succeeded,
}

impl BatchJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchJobStatus::Created => "created",
            BatchJobStatus::Running => "running",
            BatchJobStatus::Failed => "failed",
            BatchJobStatus::Killed => "killed",
            BatchJobStatus::Cleaning => "cleaning",
            BatchJobStatus::Succeeded => "succeeded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(BatchJobStatus::Created),
            "running" => Some(BatchJobStatus::Running),
            "failed" => Some(BatchJobStatus::Failed),
            "killed" => Some(BatchJobStatus::Killed),
            "cleaning" => Some(BatchJobStatus::Cleaning),
            "succeeded" => Some(BatchJobStatus::Succeeded),
            _ => None,
        }
    }

    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchJobStatus::Failed | BatchJobStatus::Killed | BatchJobStatus::Succeeded
        )
    }
}

impl std::fmt::Display for BatchJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPU/memory quantities for one side of a resource requirement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

impl ResourceSpec {
    pub fn is_empty(&self) -> bool {
        self.cpu.is_none() && self.memory.is_none()
    }
}

/// Container resource requirements; only keys that are present are emitted
/// into the Job manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceSpec>,
}

impl ResourceRequirements {
    pub fn is_empty(&self) -> bool {
        self.limits.as_ref().is_none_or(ResourceSpec::is_empty)
            && self.requests.as_ref().is_none_or(ResourceSpec::is_empty)
    }
}

/// User-supplied workload parameters.
///
/// `input_zip` only ever exists in the request body and the provisioning
/// hand-off; it is stripped before the record is persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchJobParameters {
    pub docker_image: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment_variables: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "ResourceRequirements::is_empty")]
    pub resources: ResourceRequirements,

    #[serde(default, skip_serializing, skip_deserializing)]
    pub input_zip: Option<Vec<u8>>,
}

/// The orchestrator's record of a one-shot workload request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: Uuid,
    pub name: String,
    pub account_id: String,
    pub job_parameters: BatchJobParameters,
    pub has_input_file: bool,
    pub status: BatchJobStatus,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub stop_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_file_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_pod_response: Option<serde_json::Value>,
}

impl BatchJob {
    /// Build a fresh record in `created` state. When `name` is not supplied
    /// it is derived from the image basename and the creation timestamp.
    pub fn new(
        name: Option<String>,
        account_id: String,
        parameters: BatchJobParameters,
        created: DateTime<Utc>,
    ) -> Self {
        let has_input_file = parameters.input_zip.is_some();
        let name = name
            .unwrap_or_else(|| derive_name(&parameters.docker_image, created.timestamp_millis()));
        BatchJob {
            id: Uuid::new_v4(),
            name,
            account_id,
            job_parameters: parameters,
            has_input_file,
            status: BatchJobStatus::Created,
            created,
            start_time: None,
            stop_time: None,
            output_file_url: None,
            last_pod_response: None,
        }
    }

    pub fn cleanup_job_name(&self) -> String {
        format!("{}{CLEANUP_JOB_SUFFIX}", self.name)
    }

    pub fn input_pvc_claim_name(&self) -> String {
        format!("job-{}-input", self.name)
    }

    pub fn output_pvc_claim_name(&self) -> String {
        format!("job-{}-output", self.name)
    }

    pub fn input_object_key(&self) -> String {
        format!("{}-input.zip", self.name)
    }

    pub fn output_object_key(&self) -> String {
        format!("{}-output.zip", self.name)
    }
}

/// Derive a cluster-unique job name as `<image-basename-slug>-<epoch-ms>`.
pub fn derive_name(docker_image: &str, epoch_ms: i64) -> String {
    let slug = slugify_image(docker_image);
    format!("{slug}-{epoch_ms}")
}

/// Slug of a docker image reference suitable for a DNS-1123 label: the path
/// basename with any tag or digest removed, lowercased, with runs of
/// non-alphanumeric characters collapsed to single dashes.
fn slugify_image(image: &str) -> String {
    let basename = image.rsplit('/').next().unwrap_or(image);
    let basename = basename.split_once('@').map_or(basename, |(head, _)| head);
    let basename = basename.split_once(':').map_or(basename, |(head, _)| head);

    let mut slug = String::with_capacity(basename.len());
    let mut last_dash = true;
    for c in basename.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    slug.trim_end_matches('-').to_string()
}

/// The name is used for the cluster Job object and must be a valid DNS-1123
/// label: lower case alphanumerics or '-', starting and ending with an
/// alphanumeric. Room is reserved for the longest derived name
/// (`job-<name>-output`, 11 extra characters).
pub fn is_valid_job_name(name: &str) -> bool {
    const MAX_LEN: usize = 63 - 11;
    if name.is_empty() || name.len() > MAX_LEN {
        return false;
    }
    let bytes = name.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return false;
    }
    bytes.iter().all(|&b| alnum(b) || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parameters(image: &str) -> BatchJobParameters {
        BatchJobParameters {
            docker_image: image.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn derives_name_from_image_basename() {
        assert_eq!(derive_name("alpine", 1500000000000), "alpine-1500000000000");
        assert_eq!(
            derive_name("gcr.io/project/worker:3.19", 42),
            "worker-42"
        );
        assert_eq!(
            derive_name("registry.example.com/team/My_App@sha256:abcd", 7),
            "my-app-7"
        );
    }

    #[test]
    fn new_uses_supplied_name() {
        let created = Utc::now();
        let job = BatchJob::new(
            Some("custom-name".into()),
            "acct-1".into(),
            parameters("alpine"),
            created,
        );
        assert_eq!(job.name, "custom-name");
        assert_eq!(job.status, BatchJobStatus::Created);
        assert!(!job.has_input_file);
    }

    #[test]
    fn derived_resource_names() {
        let job = BatchJob::new(
            Some("demo".into()),
            "acct".into(),
            parameters("python"),
            Utc::now(),
        );
        assert_eq!(job.cleanup_job_name(), "demo-cleanup");
        assert_eq!(job.input_pvc_claim_name(), "job-demo-input");
        assert_eq!(job.output_pvc_claim_name(), "job-demo-output");
        assert_eq!(job.input_object_key(), "demo-input.zip");
        assert_eq!(job.output_object_key(), "demo-output.zip");
    }

    #[test]
    fn input_zip_presence_sets_has_input_file() {
        let mut params = parameters("alpine");
        params.input_zip = Some(b"hello".to_vec());
        let job = BatchJob::new(None, "acct".into(), params, Utc::now());
        assert!(job.has_input_file);
    }

    #[test]
    fn input_zip_never_serialized() {
        let mut params = parameters("alpine");
        params.input_zip = Some(b"secret payload".to_vec());
        let json = serde_json::to_string(&params).unwrap();
        assert!(!json.contains("input_zip"));
    }

    #[test]
    fn job_name_validation() {
        assert!(is_valid_job_name("alpine-1500000000000"));
        assert!(is_valid_job_name("a"));
        assert!(is_valid_job_name("123-abc"));
        assert!(!is_valid_job_name(""));
        assert!(!is_valid_job_name("-leading-dash"));
        assert!(!is_valid_job_name("trailing-dash-"));
        assert!(!is_valid_job_name("Upper-Case"));
        assert!(!is_valid_job_name("has_underscore"));
        assert!(!is_valid_job_name(&"x".repeat(53)));
        assert!(is_valid_job_name(&"x".repeat(52)));
    }

    #[test]
    fn terminal_statuses() {
        assert!(BatchJobStatus::Failed.is_terminal());
        assert!(BatchJobStatus::Killed.is_terminal());
        assert!(BatchJobStatus::Succeeded.is_terminal());
        assert!(!BatchJobStatus::Created.is_terminal());
        assert!(!BatchJobStatus::Running.is_terminal());
        assert!(!BatchJobStatus::Cleaning.is_terminal());
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            BatchJobStatus::Created,
            BatchJobStatus::Running,
            BatchJobStatus::Failed,
            BatchJobStatus::Killed,
            BatchJobStatus::Cleaning,
            BatchJobStatus::Succeeded,
        ] {
            assert_eq!(BatchJobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BatchJobStatus::parse("queued"), None);
    }

    #[test]
    fn timestamps_serialize_as_epoch_millis() {
        let created = DateTime::from_timestamp_millis(1_500_000_000_123).unwrap();
        let job = BatchJob::new(Some("demo".into()), "acct".into(), parameters("alpine"), created);
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["created"], serde_json::json!(1_500_000_000_123i64));
        assert_eq!(value["start_time"], serde_json::Value::Null);
    }
}
