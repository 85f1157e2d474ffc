// src/engine/lifecycle.rs
//
// Appointment state machine:
//   SCHEDULED -> CONFIRMED | CANCELLED | NO_SHOW | COMPLETED
//   CONFIRMED -> CANCELLED | NO_SHOW | COMPLETED
// CANCELLED, NO_SHOW and COMPLETED are terminal.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::calendar::CalendarPolicy;
use super::visits::visit_from_appointment;
use super::{EngineError, EngineResult};
use crate::models::{Appointment, AppointmentStatus, Visit};
use crate::store::Store;

const MAX_DURATION_MIN: i32 = 24 * 60;

#[derive(Debug, Clone)]
pub struct NewAppointment {
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    pub service_id: Option<Uuid>,
    pub start_at: DateTime<Utc>,
    pub duration_min: i32,
    pub notes: Option<String>,
}

/// Partial update. `None` leaves a field untouched; `Some(None)` clears a nullable one.
#[derive(Debug, Clone, Default)]
pub struct AppointmentChanges {
    pub doctor_id: Option<Uuid>,
    pub start_at: Option<DateTime<Utc>>,
    pub duration_min: Option<i32>,
    pub service_id: Option<Option<Uuid>>,
    pub notes: Option<Option<String>>,
}

impl AppointmentChanges {
    fn moves_interval(&self) -> bool {
        self.doctor_id.is_some() || self.start_at.is_some() || self.duration_min.is_some()
    }
}

pub(crate) fn validate_duration(duration_min: i32) -> EngineResult<()> {
    if duration_min <= 0 {
        return Err(EngineError::validation("duration_min", "duration must be > 0 minutes"));
    }
    if duration_min > MAX_DURATION_MIN {
        return Err(EngineError::validation("duration_min", "duration must not exceed 24 hours"));
    }
    Ok(())
}

/// Compare-and-swap guard shared by the stores.
pub fn ensure_status(
    stored: AppointmentStatus,
    expected: AppointmentStatus,
    action: &'static str,
) -> EngineResult<()> {
    if stored == expected {
        Ok(())
    } else {
        Err(EngineError::InvalidStateTransition {
            entity: "appointment",
            from: stored.as_str().to_string(),
            action,
        })
    }
}

fn invalid(appointment: &Appointment, action: &'static str) -> EngineError {
    EngineError::InvalidStateTransition {
        entity: "appointment",
        from: appointment.status.as_str().to_string(),
        action,
    }
}

fn append_note(notes: Option<String>, tag: &str, reason: Option<&str>) -> Option<String> {
    let reason = reason.map(str::trim).filter(|r| !r.is_empty());
    let Some(reason) = reason else {
        return notes;
    };
    let line = format!("[{tag}] {reason}");
    match notes {
        Some(existing) if !existing.trim().is_empty() => Some(format!("{existing}\n{line}")),
        _ => Some(line),
    }
}

async fn load(store: &dyn Store, appointment_id: Uuid) -> EngineResult<Appointment> {
    store
        .get_appointment(appointment_id)
        .await?
        .ok_or_else(|| EngineError::missing("appointment", appointment_id))
}

pub async fn create_appointment(
    store: &dyn Store,
    req: NewAppointment,
    created_by: Uuid,
    now: DateTime<Utc>,
) -> EngineResult<Appointment> {
    validate_duration(req.duration_min)?;

    let appointment = Appointment {
        appointment_id: Uuid::new_v4(),
        patient_id: req.patient_id,
        doctor_id: req.doctor_id,
        service_id: req.service_id,
        start_at: req.start_at,
        duration_min: req.duration_min,
        status: AppointmentStatus::Scheduled,
        notes: req.notes.filter(|n| !n.trim().is_empty()),
        created_by,
        created_at: now,
        updated_at: now,
    };

    store.insert_appointment(&appointment).await?;

    tracing::info!(
        appointment_id = %appointment.appointment_id,
        doctor_id = %appointment.doctor_id,
        start_at = %appointment.start_at,
        "appointment created"
    );
    Ok(appointment)
}

/// Reschedule / resize / reassign and edit notes. A conflicting move leaves
/// the stored appointment untouched.
pub async fn update_appointment(
    store: &dyn Store,
    appointment_id: Uuid,
    changes: AppointmentChanges,
    now: DateTime<Utc>,
) -> EngineResult<Appointment> {
    let current = load(store, appointment_id).await?;
    if current.status.is_terminal() {
        return Err(invalid(&current, "modify"));
    }

    let moves = changes.moves_interval();
    let mut next = current.clone();
    if let Some(doctor_id) = changes.doctor_id {
        next.doctor_id = doctor_id;
    }
    if let Some(start_at) = changes.start_at {
        next.start_at = start_at;
    }
    if let Some(duration_min) = changes.duration_min {
        validate_duration(duration_min)?;
        next.duration_min = duration_min;
    }
    if let Some(service_id) = changes.service_id {
        next.service_id = service_id;
    }
    if let Some(notes) = changes.notes {
        next.notes = notes.filter(|n| !n.trim().is_empty());
    }
    next.updated_at = now;

    store.update_appointment(&next, current.status).await?;

    if moves {
        tracing::info!(
            appointment_id = %next.appointment_id,
            doctor_id = %next.doctor_id,
            start_at = %next.start_at,
            duration_min = next.duration_min,
            "appointment rescheduled"
        );
    }
    Ok(next)
}

async fn transition(
    store: &dyn Store,
    appointment_id: Uuid,
    target: AppointmentStatus,
    action: &'static str,
    note: Option<(&str, Option<&str>)>,
    now: DateTime<Utc>,
) -> EngineResult<Appointment> {
    let current = load(store, appointment_id).await?;
    if !current.status.can_transition_to(target) {
        return Err(invalid(&current, action));
    }

    let mut next = current.clone();
    next.status = target;
    if let Some((tag, reason)) = note {
        next.notes = append_note(next.notes, tag, reason);
    }
    next.updated_at = now;

    store.update_appointment(&next, current.status).await?;

    tracing::info!(
        appointment_id = %appointment_id,
        from = current.status.as_str(),
        to = target.as_str(),
        "appointment status changed"
    );
    Ok(next)
}

pub async fn confirm_appointment(
    store: &dyn Store,
    appointment_id: Uuid,
    now: DateTime<Utc>,
) -> EngineResult<Appointment> {
    transition(store, appointment_id, AppointmentStatus::Confirmed, "confirm", None, now).await
}

pub async fn cancel_appointment(
    store: &dyn Store,
    appointment_id: Uuid,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> EngineResult<Appointment> {
    transition(
        store,
        appointment_id,
        AppointmentStatus::Cancelled,
        "cancel",
        Some(("Cancelled", reason)),
        now,
    )
    .await
}

pub async fn mark_no_show(
    store: &dyn Store,
    appointment_id: Uuid,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> EngineResult<Appointment> {
    transition(
        store,
        appointment_id,
        AppointmentStatus::NoShow,
        "mark no-show",
        Some(("No-show", reason)),
        now,
    )
    .await
}

/// Complete the appointment and open its visit, exactly once.
pub async fn complete_appointment(
    store: &dyn Store,
    policy: &CalendarPolicy,
    appointment_id: Uuid,
    now: DateTime<Utc>,
) -> EngineResult<(Appointment, Visit)> {
    let current = load(store, appointment_id).await?;
    if !current.status.can_transition_to(AppointmentStatus::Completed) {
        return Err(invalid(&current, "complete"));
    }
    if store.visit_for_appointment(appointment_id).await?.is_some() {
        return Err(EngineError::InvalidStateTransition {
            entity: "appointment",
            from: "HAS_VISIT".into(),
            action: "complete",
        });
    }

    let mut next = current.clone();
    next.status = AppointmentStatus::Completed;
    next.updated_at = now;

    let visit = visit_from_appointment(&next, policy.local_date(next.start_at), now);
    store.complete_appointment(&next, current.status, &visit).await?;

    tracing::info!(
        appointment_id = %appointment_id,
        visit_id = %visit.visit_id,
        "appointment completed"
    );
    Ok((next, visit))
}
