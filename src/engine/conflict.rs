// src/engine/conflict.rs

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::{EngineError, EngineResult};
use crate::models::Appointment;
use crate::store::Store;

/// Half-open overlap: `[s1, e1)` and `[s2, e2)` touching at an endpoint do not conflict.
pub fn overlaps(
    s1: DateTime<Utc>,
    e1: DateTime<Utc>,
    s2: DateTime<Utc>,
    e2: DateTime<Utc>,
) -> bool {
    s1 < e2 && s2 < e1
}

/// First booking in `existing` that blocks the proposed interval.
///
/// `doctor_id = None` checks against every doctor's bookings.
pub fn find_conflict<'a>(
    existing: &'a [Appointment],
    doctor_id: Option<Uuid>,
    start: DateTime<Utc>,
    duration_min: i32,
    exclude: Option<Uuid>,
) -> Option<&'a Appointment> {
    let end = start + Duration::minutes(i64::from(duration_min));
    existing.iter().find(|a| {
        a.status.blocks_calendar()
            && doctor_id.is_none_or(|d| a.doctor_id == d)
            && Some(a.appointment_id) != exclude
            && overlaps(start, end, a.start_at, a.end_at())
    })
}

/// Check used by stores inside their write lock, just before persisting `candidate`.
pub fn ensure_free(existing: &[Appointment], candidate: &Appointment) -> EngineResult<()> {
    if !candidate.status.blocks_calendar() {
        return Ok(());
    }
    match find_conflict(
        existing,
        Some(candidate.doctor_id),
        candidate.start_at,
        candidate.duration_min,
        Some(candidate.appointment_id),
    ) {
        Some(other) => {
            tracing::warn!(
                doctor_id = %candidate.doctor_id,
                appointment_id = %candidate.appointment_id,
                conflicting_id = %other.appointment_id,
                "scheduling conflict"
            );
            Err(EngineError::SchedulingConflict {
                doctor_id: candidate.doctor_id,
                conflicting_id: other.appointment_id,
                start: other.start_at,
            })
        }
        None => Ok(()),
    }
}

/// `hasConflict(doctorId, proposedStart, durationMinutes, excludeAppointmentId?)`.
pub async fn has_conflict(
    store: &dyn Store,
    doctor_id: Option<Uuid>,
    start: DateTime<Utc>,
    duration_min: i32,
    exclude: Option<Uuid>,
) -> EngineResult<bool> {
    super::lifecycle::validate_duration(duration_min)?;
    let end = start + Duration::minutes(i64::from(duration_min));
    let existing = store.blocking_appointments(doctor_id, start, end).await?;
    Ok(find_conflict(&existing, doctor_id, start, duration_min, exclude).is_some())
}
