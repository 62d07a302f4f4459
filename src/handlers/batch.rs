//! `/batch` endpoints: list, fetch, create, cancel.

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::Json;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use super::{envelope, ApiError, ApiResult};
use crate::cluster::manifests::is_valid_quantity;
use crate::dispatcher::ProvisionTask;
use crate::error::Error;
use crate::models::{
    is_valid_job_name, BatchJob, BatchJobParameters, BatchJobStatus, ResourceRequirements,
};
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    status: Option<String>,
}

/// GET /batch/ -- list records, filtered by status (default `running`).
pub async fn list_batch_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Value>> {
    let raw = query.status.as_deref().unwrap_or("running");
    let status = BatchJobStatus::parse(raw).ok_or_else(|| ApiError::InvalidParameters {
        msg: format!("Unknown status '{raw}'."),
        data: json!(""),
    })?;

    let jobs = state.store.list_by_status(status).await.map_err(ApiError::from)?;
    Ok(Json(envelope(true, "", "", json!(jobs))))
}

/// GET /batch/{id} -- fetch one record.
pub async fn get_batch_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let job = lookup(&state, &job_id).await?;
    Ok(Json(envelope(true, "", "", json!(job))))
}

/// POST /batch/ -- create a record and schedule provisioning.
pub async fn create_batch_job(
    State(state): State<AppState>,
    Json(body): Json<CreateBatchJobRequest>,
) -> ApiResult<Json<Value>> {
    let (job, input) = validate(body)?;

    state.store.insert(&job).await.map_err(ApiError::from)?;
    info!(job = %job.name, id = %job.id, "Batch job record created");

    state
        .dispatcher
        .enqueue(ProvisionTask { id: job.id, input })
        .await
        .map_err(ApiError::from)?;

    let message = format!("New batch_job {} accepted for provisioning.", job.id);
    Ok(Json(envelope(true, &message, "", json!(job))))
}

/// DELETE /batch/{id} -- cancel a running or cleaning job.
pub async fn stop_batch_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Value>> {
    // resolve first so an unknown id is 404, not an invalid-state 400
    let job = lookup(&state, &job_id).await?;

    let cancelled = state
        .coordinator
        .cancel(job.id)
        .await
        .map_err(ApiError::from)?;

    let message = format!("Instance {} was successfully deleted from the cluster.", job.id);
    Ok(Json(envelope(true, &message, "", json!(cancelled))))
}

async fn lookup(state: &AppState, job_id: &str) -> ApiResult<BatchJob> {
    let not_found = || ApiError::NotFound(format!("Batch job {job_id} not found."));
    let id: Uuid = job_id.parse().map_err(|_| not_found())?;
    state
        .store
        .get(id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(not_found)
}

// =========================================================================
// Request validation
// =========================================================================

#[derive(Debug, Default, Deserialize)]
pub struct CreateBatchJobRequest {
    pub account_id: Option<String>,
    pub name: Option<String>,
    pub job_parameters: Option<JobParametersRequest>,
}

#[derive(Debug, Default, Deserialize)]
pub struct JobParametersRequest {
    pub docker_image: Option<String>,
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: ResourceRequirements,
    pub input_zip: Option<String>,
}

/// Validate a create request into a fresh record plus the decoded input
/// payload. All field problems are collected into one response.
fn validate(body: CreateBatchJobRequest) -> ApiResult<(BatchJob, Option<Vec<u8>>)> {
    let mut fields: BTreeMap<String, String> = BTreeMap::new();

    let account_id = match body.account_id.filter(|s| !s.is_empty()) {
        Some(account_id) => account_id,
        None => {
            fields.insert("account_id".into(), "Field is required".into());
            String::new()
        }
    };

    if let Some(name) = body.name.as_deref() {
        if !is_valid_job_name(name) {
            fields.insert(
                "name".into(),
                "Must be a valid DNS-1123 label (lower case alphanumerics and '-').".into(),
            );
        }
    }

    let parameters = body.job_parameters.unwrap_or_else(|| {
        fields.insert("job_parameters".into(), "Field is required".into());
        JobParametersRequest::default()
    });

    let docker_image = match parameters.docker_image.filter(|s| !s.is_empty()) {
        Some(image) => image,
        None => {
            fields.insert("docker_image".into(), "Field is required".into());
            String::new()
        }
    };

    for side in [&parameters.resources.limits, &parameters.resources.requests] {
        if let Some(spec) = side {
            for quantity in [&spec.cpu, &spec.memory].into_iter().flatten() {
                if !is_valid_quantity(quantity) {
                    fields.insert(
                        "resources".into(),
                        format!("'{quantity}' is not a valid Kubernetes quantity."),
                    );
                }
            }
        }
    }

    let input = match parameters.input_zip.as_deref() {
        Some(encoded) => match BASE64.decode(encoded.trim()) {
            Ok(bytes) => Some(bytes),
            Err(_) => {
                fields.insert(
                    "input_zip".into(),
                    "must be a base64 encoded zip file.".into(),
                );
                None
            }
        },
        None => None,
    };

    if !fields.is_empty() {
        return Err(Error::InvalidParameters { fields }.into());
    }

    let job_parameters = BatchJobParameters {
        docker_image,
        environment_variables: parameters.environment_variables,
        resources: parameters.resources,
        input_zip: input.clone(),
    };
    let mut job = BatchJob::new(body.name, account_id, job_parameters, Utc::now());
    // the payload travels to the provisioner only; the record never holds it
    job.job_parameters.input_zip = None;

    Ok((job, input))
}
