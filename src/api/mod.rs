//! HTTP control plane.
//!
//! A small axum router over the instance manager:
//!
//! ```bash
//! # Create an instance
//! curl -X POST http://localhost:8080/instances/create \
//!   -H "Content-Type: application/json" \
//!   -d '{"image": "ubuntu:22.04", "cpu": 2, "public_key": "ssh-ed25519 AAAA..."}'
//!
//! # Reboot it
//! curl -X PATCH http://localhost:8080/instances/{id} \
//!   -H "Content-Type: application/json" \
//!   -d '{"action": "reboot"}'
//! ```

pub mod error;
pub mod handlers;
pub mod types;

use crate::manager::Manager;
use axum::{
    routing::{delete, get, patch, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// OpenAPI documentation for the control plane.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "microvmd API",
        version = "0.1.0",
        description = "Single-host microVM orchestration agent.",
        license(name = "Apache-2.0", url = "https://www.apache.org/licenses/LICENSE-2.0")
    ),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Instances", description = "Instance lifecycle management")
    ),
    paths(
        handlers::health,
        handlers::create_instance,
        handlers::delete_instance,
        handlers::manage_instance,
    ),
    components(schemas(
        types::CreateInstanceRequest,
        types::CreateInstanceResponse,
        types::ManageInstanceRequest,
        types::ManageInstanceResponse,
        types::DeleteInstanceResponse,
        types::HealthResponse,
        types::ApiErrorResponse,
    ))
)]
pub struct ApiDoc;

/// Request timeout. Generous because create serialises behind the global
/// lock and a cold image build can run for minutes.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(1800);

/// Build the control-plane router.
pub fn create_router(manager: Arc<Manager>) -> Router {
    let instance_routes = Router::new()
        .route("/instances/create", post(handlers::create_instance))
        .route("/instances/:id", delete(handlers::delete_instance))
        .route("/instances/:id", patch(handlers::manage_instance))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(instance_routes)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}
