// src/routes/visit_routes.rs

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use axum_extra::extract::WithRejection;
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use uuid::Uuid;

use super::{CLINICAL, FRONT_DESK, deserialize_double_option};
use crate::{
    engine::{
        invoicing,
        visits::{self, NewVisit, VisitChanges},
    },
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState, Invoice, Procedure, Visit, VisitStatus},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_visit))
        .route("/{id}", get(get_visit).patch(patch_visit))
        .route("/{id}/complete", post(complete_visit))
        .route("/{id}/cancel", post(cancel_visit))
        .route("/{id}/invoice", post(generate_invoice))
}

/* ============================================================
   POST /visits  (walk-in, no appointment)
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct CreateVisitRequest {
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    /// Defaults to today in clinic time.
    pub visit_date: Option<NaiveDate>,
    pub chief_complaint: Option<String>,
    pub diagnosis: Option<String>,
    pub notes: Option<String>,
    #[serde(default)]
    pub procedures: Vec<Procedure>,
}

pub async fn create_visit(
    State(state): State<AppState>,
    auth: AuthContext,
    WithRejection(Json(req), _): WithRejection<Json<CreateVisitRequest>, ApiError>,
) -> Result<(StatusCode, Json<ApiOk<Visit>>), ApiError> {
    auth.require(CLINICAL, "open visits")?;

    let now = Utc::now();
    let visit = visits::open_visit(
        state.store.as_ref(),
        NewVisit {
            patient_id: req.patient_id,
            doctor_id: req.doctor_id,
            visit_date: req.visit_date.unwrap_or_else(|| state.policy.local_date(now)),
            chief_complaint: req.chief_complaint,
            diagnosis: req.diagnosis,
            notes: req.notes,
            procedures: req.procedures,
        },
        now,
    )
    .await?;

    Ok((StatusCode::CREATED, Json(ApiOk { data: visit })))
}

/* ============================================================
   GET /visits/{id}
   ============================================================ */

pub async fn get_visit(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(visit_id): Path<Uuid>,
) -> Result<Json<ApiOk<Visit>>, ApiError> {
    let visit = state
        .store
        .get_visit(visit_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("NOT_FOUND", "Visit not found".into()))?;
    Ok(Json(ApiOk { data: visit }))
}

/* ============================================================
   PATCH /visits/{id}
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct PatchVisitRequest {
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub chief_complaint: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub diagnosis: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub notes: Option<Option<String>>,
    /// Replaces the whole list; the visit total is recomputed.
    pub procedures: Option<Vec<Procedure>>,
}

pub async fn patch_visit(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(visit_id): Path<Uuid>,
    WithRejection(Json(req), _): WithRejection<Json<PatchVisitRequest>, ApiError>,
) -> Result<Json<ApiOk<Visit>>, ApiError> {
    auth.require(CLINICAL, "edit visits")?;

    let visit = visits::revise_visit(
        state.store.as_ref(),
        visit_id,
        VisitChanges {
            chief_complaint: req.chief_complaint,
            diagnosis: req.diagnosis,
            notes: req.notes,
            procedures: req.procedures,
        },
        Utc::now(),
    )
    .await?;

    Ok(Json(ApiOk { data: visit }))
}

/* ============================================================
   POST /visits/{id}/complete | /cancel
   ============================================================ */

pub async fn complete_visit(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(visit_id): Path<Uuid>,
) -> Result<Json<ApiOk<Visit>>, ApiError> {
    auth.require(CLINICAL, "complete visits")?;
    let visit = visits::close_visit(
        state.store.as_ref(),
        visit_id,
        VisitStatus::Completed,
        Utc::now(),
    )
    .await?;
    Ok(Json(ApiOk { data: visit }))
}

pub async fn cancel_visit(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(visit_id): Path<Uuid>,
) -> Result<Json<ApiOk<Visit>>, ApiError> {
    auth.require(CLINICAL, "cancel visits")?;
    let visit = visits::close_visit(
        state.store.as_ref(),
        visit_id,
        VisitStatus::Cancelled,
        Utc::now(),
    )
    .await?;
    Ok(Json(ApiOk { data: visit }))
}

/* ============================================================
   POST /visits/{id}/invoice
   ============================================================ */

pub async fn generate_invoice(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(visit_id): Path<Uuid>,
) -> Result<(StatusCode, Json<ApiOk<Invoice>>), ApiError> {
    auth.require(FRONT_DESK, "issue invoices")?;

    let now = Utc::now();
    let invoice = invoicing::generate_invoice(
        state.store.as_ref(),
        visit_id,
        state.policy.local_date(now),
        now,
        state.invoice_number_attempts,
    )
    .await?;

    Ok((StatusCode::CREATED, Json(ApiOk { data: invoice })))
}
