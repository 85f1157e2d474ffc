use axum::{
    Json,
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::{Value as JsonValue, json};

use crate::engine::EngineError;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorObject,
}

#[derive(Debug, Serialize)]
pub struct ErrorObject {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(&'static str, String),
    Forbidden(&'static str, String),
    BadRequest(&'static str, String),
    NotFound(&'static str, String),
    Engine(EngineError),
}

impl ApiError {
    pub fn missing_identity() -> Self {
        ApiError::Unauthorized(
            "UNAUTHENTICATED",
            "X-Staff-Id and X-Staff-Role headers are required".into(),
        )
    }

    fn to_error_response(
        code: &str,
        message: &str,
        details: Option<JsonValue>,
    ) -> Json<ErrorResponse> {
        Json(ErrorResponse {
            error: ErrorObject {
                code: code.to_string(),
                message: message.to_string(),
                details,
            },
        })
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::BadRequest("VALIDATION_ERROR", e.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        ApiError::BadRequest("VALIDATION_ERROR", e.body_text())
    }
}

fn engine_status(e: &EngineError) -> StatusCode {
    match e {
        EngineError::SchedulingConflict { .. }
        | EngineError::InvalidStateTransition { .. }
        | EngineError::AlreadyInvoiced { .. }
        | EngineError::VisitChanged { .. } => StatusCode::CONFLICT,
        EngineError::MissingReference { .. } => StatusCode::NOT_FOUND,
        EngineError::OverPayment { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::Validation { .. } => StatusCode::BAD_REQUEST,
        EngineError::DataIntegrity(_)
        | EngineError::DuplicateInvoiceNumber(_)
        | EngineError::Store(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn engine_details(e: &EngineError) -> Option<JsonValue> {
    match e {
        EngineError::SchedulingConflict {
            doctor_id,
            conflicting_id,
            start,
        } => Some(json!({
            "doctor_id": doctor_id,
            "conflicting_appointment_id": conflicting_id,
            "conflicting_start_at": start,
        })),
        EngineError::InvalidStateTransition { entity, from, action } => Some(json!({
            "entity": entity,
            "current_status": from,
            "action": action,
        })),
        EngineError::AlreadyInvoiced { visit_id, invoice_id } => Some(json!({
            "visit_id": visit_id,
            "invoice_id": invoice_id,
        })),
        EngineError::VisitChanged { visit_id } => Some(json!({ "visit_id": visit_id })),
        EngineError::MissingReference { entity, id } => Some(json!({ "entity": entity, "id": id })),
        EngineError::OverPayment {
            invoice_id,
            attempted,
            remaining,
        } => Some(json!({
            "invoice_id": invoice_id,
            "attempted": attempted,
            "remaining_balance": remaining,
        })),
        EngineError::Validation { field, .. } => Some(json!({ "field": field })),
        EngineError::DataIntegrity(_)
        | EngineError::DuplicateInvoiceNumber(_)
        | EngineError::Store(_) => None,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized(code, msg) => {
                let body = ApiError::to_error_response(code, &msg, None);
                (StatusCode::UNAUTHORIZED, body).into_response()
            }
            ApiError::Forbidden(code, msg) => {
                let body = ApiError::to_error_response(code, &msg, None);
                (StatusCode::FORBIDDEN, body).into_response()
            }
            ApiError::BadRequest(code, msg) => {
                let body = ApiError::to_error_response(code, &msg, None);
                (StatusCode::BAD_REQUEST, body).into_response()
            }
            ApiError::NotFound(code, msg) => {
                let body = ApiError::to_error_response(code, &msg, None);
                (StatusCode::NOT_FOUND, body).into_response()
            }
            ApiError::Engine(e) => {
                let status = engine_status(&e);
                if status == StatusCode::INTERNAL_SERVER_ERROR {
                    // internals stay in the log
                    tracing::error!(error = %e, code = e.code(), "request failed");
                    return (
                        status,
                        ApiError::to_error_response(e.code(), "internal error", None),
                    )
                        .into_response();
                }
                (
                    status,
                    ApiError::to_error_response(e.code(), &e.to_string(), engine_details(&e)),
                )
                    .into_response()
            }
        }
    }
}
