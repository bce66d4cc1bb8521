//! HTTP request handlers.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    Json,
};
use base64::Engine as _;
use uuid::Uuid;

use crate::api::types::*;
use crate::domain::{AuditFilter, Decision};
use crate::error::{EngineError, EngineResult};
use crate::AppState;

/// Unwrap a JSON body, mapping extractor rejections onto the error taxonomy.
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> EngineResult<T> {
    match payload {
        Ok(Json(body)) => Ok(body),
        Err(rejection) => Err(match rejection.status() {
            StatusCode::PAYLOAD_TOO_LARGE => EngineError::ContentTooLarge(rejection.body_text()),
            StatusCode::UNSUPPORTED_MEDIA_TYPE => {
                EngineError::UnsupportedMediaType(rejection.body_text())
            }
            _ => EngineError::InvalidInput(rejection.body_text()),
        }),
    }
}

/// Check generated text against the current guideline rules.
///
/// POST /check/text
#[utoipa::path(
    post,
    path = "/check/text",
    request_body = CheckTextRequest,
    responses(
        (status = 200, description = "Check complete", body = CheckResponse),
        (status = 400, description = "Invalid request"),
        (status = 413, description = "Text too long"),
        (status = 503, description = "No rule set loaded")
    ),
    tag = "checks"
)]
pub async fn check_text(
    State(state): State<AppState>,
    payload: Result<Json<CheckTextRequest>, JsonRejection>,
) -> EngineResult<Json<CheckResponse>> {
    let request = json_body(payload)?;

    let outcome = state
        .service
        .check_text(request.text, request.prompt, request.requester_context)
        .await?;

    Ok(Json(CheckResponse {
        verdict: outcome.verdict,
        audit_record_id: outcome.audit_record_id,
        cache_hit: outcome.cache_hit,
    }))
}

/// Check a generated image against the current guideline rules.
///
/// POST /check/image
#[utoipa::path(
    post,
    path = "/check/image",
    request_body = CheckImageRequest,
    responses(
        (status = 200, description = "Check complete", body = CheckResponse),
        (status = 400, description = "Invalid request"),
        (status = 413, description = "Image too large"),
        (status = 415, description = "Unsupported image format"),
        (status = 503, description = "No rule set loaded")
    ),
    tag = "checks"
)]
pub async fn check_image(
    State(state): State<AppState>,
    payload: Result<Json<CheckImageRequest>, JsonRejection>,
) -> EngineResult<Json<CheckResponse>> {
    let request = json_body(payload)?;

    if request.image_ref.is_some() {
        return Err(EngineError::InvalidInput(
            "image_ref is not supported; send the image as image_base64".to_string(),
        ));
    }

    let encoded = request
        .image_base64
        .ok_or_else(|| EngineError::InvalidInput("image_base64 is required".to_string()))?;

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| EngineError::InvalidInput(format!("image_base64 is not valid base64: {}", e)))?;

    let outcome = state
        .service
        .check_image(
            bytes,
            request.media_type,
            request.prompt,
            request.requester_context,
        )
        .await?;

    Ok(Json(CheckResponse {
        verdict: outcome.verdict,
        audit_record_id: outcome.audit_record_id,
        cache_hit: outcome.cache_hit,
    }))
}

/// List audit records, newest first.
///
/// GET /audit
#[utoipa::path(
    get,
    path = "/audit",
    params(ListAuditQuery),
    responses(
        (status = 200, description = "Audit records", body = ListAuditResponse),
        (status = 400, description = "Invalid filter"),
        (status = 500, description = "Internal error")
    ),
    tag = "audit"
)]
pub async fn list_audit_records(
    State(state): State<AppState>,
    Query(query): Query<ListAuditQuery>,
) -> EngineResult<Json<ListAuditResponse>> {
    let decision = query
        .decision
        .as_ref()
        .map(|d| d.parse::<Decision>().map_err(EngineError::InvalidInput))
        .transpose()?;

    let filter = AuditFilter {
        requester_id: query.requester_id,
        decision,
    };
    let limit = query.limit.clamp(1, 100);
    let offset = query.offset.max(0);

    let (records, total) = state
        .repository
        .list_audit_records(&filter, limit, offset)
        .await?;

    Ok(Json(ListAuditResponse {
        records,
        total,
        limit,
        offset,
    }))
}

/// Get one audit record.
///
/// GET /audit/{id}
#[utoipa::path(
    get,
    path = "/audit/{id}",
    params(
        ("id" = Uuid, Path, description = "Audit record ID")
    ),
    responses(
        (status = 200, description = "Audit record", body = crate::domain::AuditRecord),
        (status = 404, description = "Record not found"),
        (status = 500, description = "Internal error")
    ),
    tag = "audit"
)]
pub async fn get_audit_record(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> EngineResult<Json<crate::domain::AuditRecord>> {
    let record = state.repository.get_audit_record(id).await?;
    Ok(Json(record))
}

/// Current rule set.
///
/// GET /registry
#[utoipa::path(
    get,
    path = "/registry",
    responses(
        (status = 200, description = "Current rule set", body = RegistryResponse),
        (status = 503, description = "No rule set loaded")
    ),
    tag = "registry"
)]
pub async fn get_registry(State(state): State<AppState>) -> EngineResult<Json<RegistryResponse>> {
    let snapshot = state.registry.current()?;

    let rules = snapshot
        .rules()
        .iter()
        .map(|rule| RegistryRule {
            descriptor: rule.descriptor.clone(),
            effective_threshold: rule.threshold,
        })
        .collect();

    Ok(Json(RegistryResponse {
        version: snapshot.version().to_string(),
        loaded_at: snapshot.loaded_at(),
        rules,
    }))
}

/// Liveness probe.
///
/// GET /health
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    ),
    tag = "health"
)]
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {})
}

/// Detailed health for operators.
///
/// GET /health/details
#[utoipa::path(
    get,
    path = "/health/details",
    responses(
        (status = 200, description = "Component status", body = HealthDetails)
    ),
    tag = "health"
)]
pub async fn health_details(State(state): State<AppState>) -> Json<HealthDetails> {
    let (database, db_ok) = match state.repository.ping().await {
        Ok(()) => ("connected".to_string(), true),
        Err(e) => (format!("error: {}", e), false),
    };
    let registry_version = state.registry.version();

    let status = if db_ok && registry_version.is_some() {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthDetails {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database,
        registry_version,
        audit_dropped: state.recorder.dropped(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}
