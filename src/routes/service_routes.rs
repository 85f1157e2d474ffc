// src/routes/service_routes.rs

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use axum_extra::extract::WithRejection;
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use super::SUPERVISORS;
use crate::{
    engine::totals::parse_money,
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState, Service},
};

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(list_services).post(create_service))
}

pub async fn list_services(
    State(state): State<AppState>,
    _auth: AuthContext,
) -> Result<Json<ApiOk<Vec<Service>>>, ApiError> {
    let rows = state.store.list_services().await?;
    Ok(Json(ApiOk { data: rows }))
}

#[derive(Debug, Deserialize)]
pub struct CreateServiceRequest {
    pub name: String,
    pub price: Decimal,
    pub default_duration_min: Option<i32>,
}

pub async fn create_service(
    State(state): State<AppState>,
    auth: AuthContext,
    WithRejection(Json(req), _): WithRejection<Json<CreateServiceRequest>, ApiError>,
) -> Result<(StatusCode, Json<ApiOk<Service>>), ApiError> {
    auth.require(SUPERVISORS, "edit the service catalog")?;

    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("VALIDATION_ERROR", "name is required".into()));
    }
    if name.len() > 128 {
        return Err(ApiError::BadRequest("VALIDATION_ERROR", "name is too long (max 128)".into()));
    }
    if req.default_duration_min.is_some_and(|d| d <= 0) {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "default_duration_min must be > 0".into(),
        ));
    }

    let service = Service {
        service_id: Uuid::new_v4(),
        name: name.to_string(),
        price: parse_money("price", req.price)?,
        default_duration_min: req.default_duration_min,
        is_active: true,
    };
    state.store.insert_service(&service).await?;

    tracing::info!(service_id = %service.service_id, name = %service.name, "service added");
    Ok((StatusCode::CREATED, Json(ApiOk { data: service })))
}
