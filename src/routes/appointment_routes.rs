// src/routes/appointment_routes.rs

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use axum_extra::extract::WithRejection;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{CLINICAL, FRONT_DESK, deserialize_double_option};
use crate::{
    engine::{
        conflict,
        lifecycle::{self, AppointmentChanges, NewAppointment},
        slots,
    },
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState, Appointment, Visit},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_appointments).post(create_appointment))
        .route("/slots", get(available_slots))
        .route("/conflicts", get(check_conflict))
        .route("/{id}", get(get_appointment).patch(patch_appointment))
        .route("/{id}/confirm", post(confirm_appointment))
        .route("/{id}/cancel", post(cancel_appointment))
        .route("/{id}/no_show", post(mark_no_show))
        .route("/{id}/complete", post(complete_appointment))
}

/* ============================================================
   Query params
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct DayQuery {
    pub date: NaiveDate,
    pub doctor_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct SlotsQuery {
    pub date: NaiveDate,
    pub doctor_id: Option<Uuid>,
    pub exclude_appointment_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ConflictQuery {
    pub doctor_id: Option<Uuid>,
    pub start_at: DateTime<Utc>,
    pub duration_min: i32,
    pub exclude_appointment_id: Option<Uuid>,
}

/* ============================================================
   GET /appointments?date=&doctor_id=
   ============================================================ */

pub async fn list_appointments(
    State(state): State<AppState>,
    _auth: AuthContext,
    WithRejection(Query(q), _): WithRejection<Query<DayQuery>, ApiError>,
) -> Result<Json<ApiOk<Vec<Appointment>>>, ApiError> {
    let (from, to) = state.policy.day_bounds(q.date);
    let rows = state.store.list_appointments(q.doctor_id, from, to).await?;
    Ok(Json(ApiOk { data: rows }))
}

/* ============================================================
   GET /appointments/slots
   ============================================================ */

#[derive(Debug, Serialize)]
pub struct SlotsData {
    pub date: NaiveDate,
    pub doctor_id: Option<Uuid>,
    pub slot_minutes: u32,
    pub slots: Vec<DateTime<Utc>>,
}

pub async fn available_slots(
    State(state): State<AppState>,
    _auth: AuthContext,
    WithRejection(Query(q), _): WithRejection<Query<SlotsQuery>, ApiError>,
) -> Result<Json<ApiOk<SlotsData>>, ApiError> {
    let slots = slots::available_slots(
        state.store.as_ref(),
        &state.policy,
        q.date,
        q.doctor_id,
        q.exclude_appointment_id,
    )
    .await?;

    Ok(Json(ApiOk {
        data: SlotsData {
            date: q.date,
            doctor_id: q.doctor_id,
            slot_minutes: state.policy.slot_minutes,
            slots,
        },
    }))
}

/* ============================================================
   GET /appointments/conflicts
   ============================================================ */

#[derive(Debug, Serialize)]
pub struct ConflictData {
    pub conflict: bool,
}

pub async fn check_conflict(
    State(state): State<AppState>,
    _auth: AuthContext,
    WithRejection(Query(q), _): WithRejection<Query<ConflictQuery>, ApiError>,
) -> Result<Json<ApiOk<ConflictData>>, ApiError> {
    let conflict = conflict::has_conflict(
        state.store.as_ref(),
        q.doctor_id,
        q.start_at,
        q.duration_min,
        q.exclude_appointment_id,
    )
    .await?;
    Ok(Json(ApiOk {
        data: ConflictData { conflict },
    }))
}

/* ============================================================
   GET /appointments/{id}
   ============================================================ */

pub async fn get_appointment(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<Appointment>>, ApiError> {
    let appointment = state
        .store
        .get_appointment(appointment_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("NOT_FOUND", "Appointment not found".into()))?;
    Ok(Json(ApiOk { data: appointment }))
}

/* ============================================================
   POST /appointments
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct CreateAppointmentRequest {
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    pub service_id: Option<Uuid>,
    pub start_at: DateTime<Utc>,
    /// Falls back to the service's default duration, then to one slot.
    pub duration_min: Option<i32>,
    pub notes: Option<String>,
}

pub async fn create_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    WithRejection(Json(req), _): WithRejection<Json<CreateAppointmentRequest>, ApiError>,
) -> Result<(StatusCode, Json<ApiOk<Appointment>>), ApiError> {
    auth.require(FRONT_DESK, "book appointments")?;

    let service_default = match req.service_id {
        Some(id) => {
            let service = state
                .store
                .get_service(id)
                .await?
                .ok_or_else(|| {
                    ApiError::BadRequest("VALIDATION_ERROR", "service_id does not exist".into())
                })?;
            service.default_duration_min
        }
        None => None,
    };
    let duration_min = req
        .duration_min
        .or(service_default)
        .unwrap_or(state.policy.slot_minutes as i32);

    let appointment = lifecycle::create_appointment(
        state.store.as_ref(),
        NewAppointment {
            patient_id: req.patient_id,
            doctor_id: req.doctor_id,
            service_id: req.service_id,
            start_at: req.start_at,
            duration_min,
            notes: req.notes,
        },
        auth.staff_id,
        Utc::now(),
    )
    .await?;

    Ok((StatusCode::CREATED, Json(ApiOk { data: appointment })))
}

/* ============================================================
   PATCH /appointments/{id}
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct PatchAppointmentRequest {
    pub doctor_id: Option<Uuid>,
    pub start_at: Option<DateTime<Utc>>,
    pub duration_min: Option<i32>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub service_id: Option<Option<Uuid>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub notes: Option<Option<String>>,
}

pub async fn patch_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
    WithRejection(Json(req), _): WithRejection<Json<PatchAppointmentRequest>, ApiError>,
) -> Result<Json<ApiOk<Appointment>>, ApiError> {
    auth.require(FRONT_DESK, "reschedule appointments")?;

    let appointment = lifecycle::update_appointment(
        state.store.as_ref(),
        appointment_id,
        AppointmentChanges {
            doctor_id: req.doctor_id,
            start_at: req.start_at,
            duration_min: req.duration_min,
            service_id: req.service_id,
            notes: req.notes,
        },
        Utc::now(),
    )
    .await?;

    Ok(Json(ApiOk { data: appointment }))
}

/* ============================================================
   Status transitions
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct ReasonRequest {
    pub reason: Option<String>,
}

pub async fn confirm_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<Appointment>>, ApiError> {
    auth.require(FRONT_DESK, "confirm appointments")?;
    let appointment =
        lifecycle::confirm_appointment(state.store.as_ref(), appointment_id, Utc::now()).await?;
    Ok(Json(ApiOk { data: appointment }))
}

pub async fn cancel_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
    req: Option<Json<ReasonRequest>>,
) -> Result<Json<ApiOk<Appointment>>, ApiError> {
    auth.require(FRONT_DESK, "cancel appointments")?;
    let reason = req.and_then(|Json(r)| r.reason);
    let appointment = lifecycle::cancel_appointment(
        state.store.as_ref(),
        appointment_id,
        reason.as_deref(),
        Utc::now(),
    )
    .await?;
    Ok(Json(ApiOk { data: appointment }))
}

pub async fn mark_no_show(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
    req: Option<Json<ReasonRequest>>,
) -> Result<Json<ApiOk<Appointment>>, ApiError> {
    auth.require(FRONT_DESK, "mark no-shows")?;
    let reason = req.and_then(|Json(r)| r.reason);
    let appointment = lifecycle::mark_no_show(
        state.store.as_ref(),
        appointment_id,
        reason.as_deref(),
        Utc::now(),
    )
    .await?;
    Ok(Json(ApiOk { data: appointment }))
}

#[derive(Debug, Serialize)]
pub struct CompletedData {
    pub appointment: Appointment,
    pub visit: Visit,
}

pub async fn complete_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<CompletedData>>, ApiError> {
    auth.require(CLINICAL, "complete appointments")?;
    let (appointment, visit) = lifecycle::complete_appointment(
        state.store.as_ref(),
        &state.policy,
        appointment_id,
        Utc::now(),
    )
    .await?;
    Ok(Json(ApiOk {
        data: CompletedData { appointment, visit },
    }))
}
