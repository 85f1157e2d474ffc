// src/routes/clinic_routes.rs

use axum::{Json, Router, extract::State, routing::get};

use crate::{
    engine::calendar::CalendarPolicyDto,
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState},
};

pub fn router() -> Router<AppState> {
    Router::new().route("/clinic", get(get_clinic))
}

/// Business hours and slot settings the front end needs to draw a calendar.
pub async fn get_clinic(
    State(state): State<AppState>,
    _auth: AuthContext,
) -> Result<Json<ApiOk<CalendarPolicyDto>>, ApiError> {
    Ok(Json(ApiOk {
        data: state.policy.to_dto(),
    }))
}
