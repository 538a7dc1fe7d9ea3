//! Request handlers for the provisioning API.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use trialhost_common::{DeprovisionRequest, ProvisionError, ProvisioningRequest};

use crate::auth::verify_token;
use crate::response::ApiFailure;
use crate::state::AppState;

/// Submit a provisioning job.
///
/// The request is validated before the job is accepted; the workflow itself
/// runs in the background and is followed through `GET /api/provisions/:id`.
///
/// # Response
///
/// `202 Accepted`
///
/// ```json
/// { "id": "5f0c…", "status_url": "/api/provisions/5f0c…" }
/// ```
#[instrument(skip(state, headers, request), fields(subdomain = %request.subdomain))]
pub async fn submit_provision(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ProvisioningRequest>,
) -> Result<impl IntoResponse, ApiFailure> {
    verify_token(&headers, state.api_token())?;

    request.validate()?;
    if state.provisioner().config().app(&request.oss_type).is_none() {
        return Err(ProvisionError::UnknownApp {
            oss_type: request.oss_type,
        }
        .into());
    }

    if state.is_shutting_down() {
        return Err(ApiFailure::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "Server is shutting down",
        ));
    }

    let Some(id) = state.submit(request) else {
        warn!("Provisioning already running for subdomain");
        return Err(ApiFailure::new(
            StatusCode::CONFLICT,
            "A provisioning job for this subdomain is already running",
        ));
    };

    info!(job_id = %id, "Provisioning job accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "id": id,
            "status_url": format!("/api/provisions/{id}"),
        })),
    ))
}

/// Get a provisioning job: `{id, stage, status, result | failure}`.
pub async fn get_provision(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiFailure> {
    state
        .job(&id)
        .map(Json)
        .ok_or_else(|| ApiFailure::not_found(format!("Job not found: {id}")))
}

/// List provisioning jobs, oldest first.
pub async fn list_provisions(State(state): State<AppState>) -> impl IntoResponse {
    let jobs = state.jobs();
    Json(serde_json::json!({
        "count": jobs.len(),
        "jobs": jobs,
    }))
}

/// Tear down a provisioned trial.
///
/// Every teardown is attempted; failed ones are listed under `warnings`.
#[instrument(skip(state, headers, request), fields(vmid = %request.identifier))]
pub async fn deprovision(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<DeprovisionRequest>,
) -> Result<impl IntoResponse, ApiFailure> {
    verify_token(&headers, state.api_token())?;

    let report = state.provisioner().deprovision(&request).await?;
    Ok(Json(report))
}

/// Report whether a subdomain can be provisioned.
#[instrument(skip(state))]
pub async fn check_subdomain(
    State(state): State<AppState>,
    Path(subdomain): Path<String>,
) -> Result<impl IntoResponse, ApiFailure> {
    let available = state.provisioner().check_subdomain(&subdomain).await?;
    let hostname = state.provisioner().config().public_hostname(&subdomain);

    Ok(Json(serde_json::json!({
        "subdomain": subdomain,
        "hostname": hostname,
        "available": available,
    })))
}

/// Health check handler.
///
/// Returns 200 OK if the server is running.
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Readiness check handler.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let body = serde_json::json!({
        "status": "ready",
        "domain": state.provisioner().config().domain,
        "running_jobs": state.running_jobs(),
    });

    (StatusCode::OK, Json(body))
}
