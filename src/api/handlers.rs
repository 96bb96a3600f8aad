//! Control-plane request handlers.
//!
//! Handlers validate input, apply defaults, and hand off to the instance
//! manager inside `spawn_blocking`: engine operations hold a blocking mutex
//! and run subprocesses (image builds can take minutes), so they must not
//! run on the async executor.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::types::{
    ApiErrorResponse, CreateInstanceRequest, CreateInstanceResponse, DeleteInstanceResponse,
    HealthResponse, ManageInstanceRequest, ManageInstanceResponse,
};
use crate::manager::{InstanceConfig, Manager};

/// Agent liveness probe.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "Agent is serving", body = HealthResponse)
    )
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: crate::VERSION.to_string(),
    })
}

/// Create a new instance.
#[utoipa::path(
    post,
    path = "/instances/create",
    tag = "Instances",
    request_body = CreateInstanceRequest,
    responses(
        (status = 201, description = "Instance created", body = CreateInstanceResponse),
        (status = 400, description = "Missing public_key or invalid JSON", body = ApiErrorResponse),
        (status = 500, description = "Engine failure", body = ApiErrorResponse)
    )
)]
pub async fn create_instance(
    State(manager): State<Arc<Manager>>,
    Json(req): Json<CreateInstanceRequest>,
) -> Result<(StatusCode, Json<CreateInstanceResponse>), ApiError> {
    let public_key = match req.public_key.as_deref() {
        Some(key) if !key.trim().is_empty() => key.to_string(),
        _ => return Err(ApiError::BadRequest("public_key is required".into())),
    };

    let config = InstanceConfig {
        cpu: req.effective_cpu(),
        memory: req.effective_memory(),
        image: req.effective_image(),
        public_key,
    };

    let (id, ssh_command) =
        tokio::task::spawn_blocking(move || manager.create_instance(config)).await??;

    Ok((
        StatusCode::CREATED,
        Json(CreateInstanceResponse { id, ssh_command }),
    ))
}

/// Delete an instance and release its host resources.
#[utoipa::path(
    delete,
    path = "/instances/{id}",
    tag = "Instances",
    params(
        ("id" = String, Path, description = "Instance id")
    ),
    responses(
        (status = 200, description = "Instance deleted", body = DeleteInstanceResponse),
        (status = 500, description = "Not found or teardown failed", body = ApiErrorResponse)
    )
)]
pub async fn delete_instance(
    State(manager): State<Arc<Manager>>,
    Path(id): Path<String>,
) -> Result<Json<DeleteInstanceResponse>, ApiError> {
    let deleted = id.clone();
    tokio::task::spawn_blocking(move || manager.delete_instance(&id)).await??;
    Ok(Json(DeleteInstanceResponse { deleted }))
}

/// Start, stop, or reboot an instance.
#[utoipa::path(
    patch,
    path = "/instances/{id}",
    tag = "Instances",
    params(
        ("id" = String, Path, description = "Instance id")
    ),
    request_body = ManageInstanceRequest,
    responses(
        (status = 200, description = "Action applied", body = ManageInstanceResponse),
        (status = 400, description = "Missing action or invalid JSON", body = ApiErrorResponse),
        (status = 500, description = "Engine failure", body = ApiErrorResponse)
    )
)]
pub async fn manage_instance(
    State(manager): State<Arc<Manager>>,
    Path(id): Path<String>,
    Json(req): Json<ManageInstanceRequest>,
) -> Result<Json<ManageInstanceResponse>, ApiError> {
    let action = match req.action.as_deref() {
        Some(action) if !action.is_empty() => action.to_string(),
        _ => {
            return Err(ApiError::BadRequest(
                "action is required (start, stop, reboot)".into(),
            ))
        }
    };

    let response = ManageInstanceResponse {
        id: id.clone(),
        action: action.clone(),
    };
    tokio::task::spawn_blocking(move || manager.manage_instance(&id, &action)).await??;
    Ok(Json(response))
}
