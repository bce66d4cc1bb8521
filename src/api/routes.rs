//! Route definitions for the API.

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::api::handlers;
use crate::AppState;

/// OpenAPI documentation.
#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::check_text,
        handlers::check_image,
        handlers::list_audit_records,
        handlers::get_audit_record,
        handlers::get_registry,
        handlers::health_check,
        handlers::health_details,
    ),
    components(schemas(
        crate::api::types::CheckTextRequest,
        crate::api::types::CheckImageRequest,
        crate::api::types::CheckResponse,
        crate::api::types::ListAuditResponse,
        crate::api::types::RegistryResponse,
        crate::api::types::RegistryRule,
        crate::api::types::HealthResponse,
        crate::api::types::HealthDetails,
        crate::domain::AuditRecord,
        crate::domain::CheckSpec,
        crate::domain::ContentKind,
        crate::domain::Decision,
        crate::domain::Finding,
        crate::domain::Fingerprint,
        crate::domain::Outcome,
        crate::domain::RequesterContext,
        crate::domain::RuleDescriptor,
        crate::domain::Verdict,
        crate::error::ErrorResponse,
    )),
    tags(
        (name = "checks", description = "Guideline compliance checks"),
        (name = "audit", description = "Audit record lookup"),
        (name = "registry", description = "Active rule set"),
        (name = "health", description = "Health and status endpoints")
    ),
    info(
        title = "Guideline Core API",
        version = "0.1.0",
        description = "Guideline compliance decision engine - evaluates generated text and images before publication",
        license(name = "MIT")
    )
)]
pub struct ApiDoc;

/// Build the API router.
///
/// `body_limit` bounds request bodies; it must leave room for a base64
/// encoded image of the largest accepted size.
pub fn build_router(state: AppState, body_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Checks
        .route("/check/text", post(handlers::check_text))
        .route("/check/image", post(handlers::check_image))
        // Audit lookup
        .route("/audit", get(handlers::list_audit_records))
        .route("/audit/:id", get(handlers::get_audit_record))
        // Registry
        .route("/registry", get(handlers::get_registry))
        // Health
        .route("/health", get(handlers::health_check))
        .route("/health/details", get(handlers::health_details))
        .with_state(state)
        // OpenAPI docs
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        // Middleware
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
