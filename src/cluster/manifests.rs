//! Manifest rendering for cluster objects.
//!
//! Manifests are built as typed `k8s-openapi` values (via `serde_json`
//! structures, never string templates), and every user-supplied string is
//! additionally reduced to a safe character set before it lands in a name,
//! label, image reference, environment key or resource quantity.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::models::{BatchJob, ResourceRequirements, ResourceSpec};

/// Name of the Secret holding the object-store credentials.
pub const GCS_SECRET_NAME: &str = "gcs-api-key";
/// Data key (and mounted filename) of the credentials inside the Secret.
pub const GCS_KEY_FILENAME: &str = "gcs-api-key.json";
/// Mount point of the credentials Secret inside job containers.
const GCS_KEY_MOUNT_PATH: &str = "/etc/gcs";

/// Label/annotation key distinguishing primary from cleanup jobs.
pub const JOB_TYPE_KEY: &str = "job_runner_job_type";
/// Label/annotation key carrying the owning batch job name on cleanup jobs.
pub const RELATED_JOB_KEY: &str = "job_runner_related_job";
/// Job type value for primary jobs.
pub const JOB_TYPE_BATCH: &str = "batch";
/// Job type value for cleanup jobs.
pub const JOB_TYPE_CLEANUP: &str = "cleanup";

/// Default PVC capacity for input and output volumes.
const PVC_STORAGE_SIZE: &str = "100Gi";

/// Static rendering inputs taken from configuration.
#[derive(Debug, Clone)]
pub struct ManifestSettings {
    pub backoff_limit: i32,
    pub bucket_name: String,
    pub initializer_image: String,
    pub gcsfuse_image: String,
}

/// Render the primary Job manifest for a batch job record.
///
/// Rendering is deterministic: the same record always yields a byte-identical
/// manifest (environment variables are stored in a `BTreeMap`).
pub fn render_batch_job(job: &BatchJob, settings: &ManifestSettings) -> Result<Job> {
    let name = sanitize_name(&job.name);
    let image = sanitize_image(&job.job_parameters.docker_image);
    let markers = job_markers(JOB_TYPE_BATCH, &name);

    let env: Vec<Value> = job
        .job_parameters
        .environment_variables
        .iter()
        .map(|(key, value)| {
            json!({
                "name": sanitize_env_key(key),
                "value": sanitize_env_value(value),
            })
        })
        .collect();

    let mut task_mounts = vec![json!({
        "name": "output",
        "mountPath": "/output/",
    })];
    let mut volumes = vec![json!({
        "name": "output",
        "persistentVolumeClaim": { "claimName": job.output_pvc_claim_name() },
    })];
    let mut init_containers: Vec<Value> = vec![];

    if job.has_input_file {
        task_mounts.push(json!({
            "name": "input",
            "mountPath": "/input/",
            "readOnly": true,
        }));
        volumes.push(json!({
            "name": "input",
            "persistentVolumeClaim": { "claimName": job.input_pvc_claim_name() },
        }));
        volumes.push(json!({
            "name": "gcs-credentials",
            "secret": { "secretName": GCS_SECRET_NAME },
        }));

        let bucket = sanitize_name(&settings.bucket_name);
        let fetch_input = format!(
            "mkdir -p /mnt/bucket && \
             gcsfuse --key-file={GCS_KEY_MOUNT_PATH}/{GCS_KEY_FILENAME} {bucket} /mnt/bucket && \
             unzip -o /mnt/bucket/{key} -d /input/ && \
             fusermount -u /mnt/bucket",
            key = job.input_object_key(),
        );
        init_containers.push(json!({
            "name": "initializer",
            "image": settings.initializer_image,
            "command": ["/bin/sh", "-c", fetch_input],
            "securityContext": { "privileged": true },
            "volumeMounts": [
                { "name": "input", "mountPath": "/input/" },
                { "name": "gcs-credentials", "mountPath": GCS_KEY_MOUNT_PATH, "readOnly": true },
            ],
        }));
    }

    let mut task = json!({
        "name": "task",
        "image": image,
        "env": env,
        "volumeMounts": task_mounts,
    });
    if let Some(resources) = resources_json(&job.job_parameters.resources) {
        task["resources"] = resources;
    }

    let mut pod_spec = json!({
        "restartPolicy": "Never",
        "containers": [task],
        "volumes": volumes,
    });
    if !init_containers.is_empty() {
        pod_spec["initContainers"] = Value::Array(init_containers);
    }

    let manifest = json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": name,
            "labels": markers.clone(),
            "annotations": markers,
        },
        "spec": {
            "backoffLimit": settings.backoff_limit,
            "template": {
                "spec": pod_spec,
            },
        },
    });

    serde_json::from_value(manifest)
        .map_err(|e| Error::InvalidState(format!("invalid job manifest: {e}")))
}

/// Render the cleanup Job manifest: a single container that mounts the output
/// PVC read-only, mounts the bucket through gcsfuse lifecycle hooks, waits
/// for the mountpoint and zips the output directory into the bucket.
pub fn render_cleanup_job(job: &BatchJob, settings: &ManifestSettings) -> Result<Job> {
    let name = sanitize_name(&job.name);
    let cleanup_name = sanitize_name(&job.cleanup_job_name());
    let bucket = sanitize_name(&settings.bucket_name);
    let markers = job_markers(JOB_TYPE_CLEANUP, &name);

    let archive_output = format!(
        "while ! mountpoint -q /mnt; do sleep 1; done; \
         zip -r /mnt/{key} /process-output/",
        key = job.output_object_key(),
    );
    let mount_bucket = format!(
        "mkdir -p /mnt && gcsfuse --key-file={GCS_KEY_MOUNT_PATH}/{GCS_KEY_FILENAME} {bucket} /mnt"
    );

    let manifest = json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": cleanup_name,
            "labels": markers.clone(),
            "annotations": markers,
        },
        "spec": {
            "backoffLimit": 0,
            "template": {
                "spec": {
                    "restartPolicy": "Never",
                    "containers": [{
                        "name": "cleanup",
                        "image": settings.gcsfuse_image,
                        "command": ["/bin/sh", "-c", archive_output],
                        "securityContext": { "privileged": true },
                        "lifecycle": {
                            "postStart": {
                                "exec": { "command": ["/bin/sh", "-c", mount_bucket] },
                            },
                            "preStop": {
                                "exec": { "command": ["fusermount", "-u", "/mnt"] },
                            },
                        },
                        "volumeMounts": [
                            {
                                "name": "process-output",
                                "mountPath": "/process-output/",
                                "readOnly": true,
                            },
                            {
                                "name": "gcs-credentials",
                                "mountPath": GCS_KEY_MOUNT_PATH,
                                "readOnly": true,
                            },
                        ],
                    }],
                    "volumes": [
                        {
                            "name": "process-output",
                            "persistentVolumeClaim": { "claimName": job.output_pvc_claim_name() },
                        },
                        {
                            "name": "gcs-credentials",
                            "secret": { "secretName": GCS_SECRET_NAME },
                        },
                    ],
                },
            },
        },
    });

    serde_json::from_value(manifest)
        .map_err(|e| Error::InvalidState(format!("invalid cleanup manifest: {e}")))
}

/// A `ReadWriteOnce` claim of the default capacity.
pub fn render_pvc(name: &str, namespace: &str) -> PersistentVolumeClaim {
    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), Quantity(PVC_STORAGE_SIZE.to_string()));

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(sanitize_name(name)),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                "app".to_string(),
                "job-runner".to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(k8s_openapi::api::core::v1::PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(k8s_openapi::api::core::v1::VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The `gcs-api-key` Secret, with the credentials file contents as its only
/// entry.
pub fn render_secret(namespace: &str, credentials: String) -> Secret {
    let mut string_data = BTreeMap::new();
    string_data.insert(GCS_KEY_FILENAME.to_string(), credentials);

    Secret {
        metadata: ObjectMeta {
            name: Some(GCS_SECRET_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        string_data: Some(string_data),
        ..Default::default()
    }
}

fn job_markers(job_type: &str, related: &str) -> Value {
    json!({
        "app": "job-runner",
        (JOB_TYPE_KEY): job_type,
        (RELATED_JOB_KEY): related,
    })
}

fn resources_json(resources: &ResourceRequirements) -> Option<Value> {
    fn side(spec: &ResourceSpec) -> Option<Value> {
        let mut out = serde_json::Map::new();
        if let Some(cpu) = &spec.cpu {
            out.insert("cpu".into(), Value::String(sanitize_quantity(cpu)));
        }
        if let Some(memory) = &spec.memory {
            out.insert("memory".into(), Value::String(sanitize_quantity(memory)));
        }
        (!out.is_empty()).then_some(Value::Object(out))
    }

    let mut out = serde_json::Map::new();
    if let Some(limits) = resources.limits.as_ref().and_then(side) {
        out.insert("limits".into(), limits);
    }
    if let Some(requests) = resources.requests.as_ref().and_then(side) {
        out.insert("requests".into(), requests);
    }
    (!out.is_empty()).then_some(Value::Object(out))
}

// =========================================================================
// Sanitizers
// =========================================================================

/// Reduce to a DNS-1123-safe label: lowercase alphanumerics and dashes,
/// trimmed to start/end on an alphanumeric, at most 63 characters.
pub fn sanitize_name(input: &str) -> String {
    let mut out: String = input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    out = out.trim_matches('-').to_string();
    if out.len() > 63 {
        out.truncate(63);
        out = out.trim_end_matches('-').to_string();
    }
    out
}

/// Environment variable names: `[A-Za-z_][A-Za-z0-9_]*`.
pub fn sanitize_env_key(input: &str) -> String {
    let mut out: String = input
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.is_empty() || out.as_bytes()[0].is_ascii_digit() {
        out.insert(0, '_');
    }
    out
}

/// Environment variable values carry arbitrary data; only control characters
/// are stripped.
pub fn sanitize_env_value(input: &str) -> String {
    input.chars().filter(|c| !c.is_control()).collect()
}

/// Docker image references: registry/path, tag, digest characters.
pub fn sanitize_image(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | ':' | '@' | '-'))
        .collect()
}

/// Kubernetes quantity strings: digits, decimal point, unit suffix.
pub fn sanitize_quantity(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '.')
        .collect()
}

/// Light validation for client-supplied quantity strings
/// (`500m`, `128Mi`, `2`, `1.5Gi`).
pub fn is_valid_quantity(input: &str) -> bool {
    if input.is_empty() || !input.as_bytes()[0].is_ascii_digit() {
        return false;
    }
    let digits: String = input
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let suffix = &input[digits.len()..];
    if digits.parse::<f64>().is_err() {
        return false;
    }
    matches!(
        suffix,
        "" | "m" | "k" | "M" | "G" | "T" | "P" | "E" | "Ki" | "Mi" | "Gi" | "Ti" | "Pi" | "Ei"
    )
}
