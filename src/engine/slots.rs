// src/engine/slots.rs

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use super::EngineResult;
use super::calendar::CalendarPolicy;
use super::conflict::find_conflict;
use crate::store::Store;

/// `availableSlots(date, doctorId?, excludeAppointmentId?)`.
///
/// Recomputed from stored bookings on every call. Without a doctor, a slot is
/// offered only when no booking of any doctor overlaps it.
pub async fn available_slots(
    store: &dyn Store,
    policy: &CalendarPolicy,
    date: NaiveDate,
    doctor_id: Option<Uuid>,
    exclude: Option<Uuid>,
) -> EngineResult<Vec<DateTime<Utc>>> {
    let Some((open, close)) = policy.business_window(date) else {
        return Ok(vec![]);
    };

    let booked = store.blocking_appointments(doctor_id, open, close).await?;
    let granularity = policy.slot_minutes as i32;

    Ok(policy
        .candidate_slots(date)
        .into_iter()
        .filter(|slot| find_conflict(&booked, doctor_id, *slot, granularity, exclude).is_none())
        .collect())
}
