// src/engine/visits.rs

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::totals::{bounded, money};
use super::{EngineError, EngineResult};
use crate::models::{Appointment, Procedure, Service, Visit, VisitStatus};
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct NewVisit {
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    pub visit_date: NaiveDate,
    pub chief_complaint: Option<String>,
    pub diagnosis: Option<String>,
    pub notes: Option<String>,
    pub procedures: Vec<Procedure>,
}

#[derive(Debug, Clone, Default)]
pub struct VisitChanges {
    pub chief_complaint: Option<Option<String>>,
    pub diagnosis: Option<Option<String>>,
    pub notes: Option<Option<String>>,
    pub procedures: Option<Vec<Procedure>>,
}

/// Fresh IN_PROGRESS visit for a completed appointment.
pub fn visit_from_appointment(
    appointment: &Appointment,
    visit_date: NaiveDate,
    now: DateTime<Utc>,
) -> Visit {
    Visit {
        visit_id: Uuid::new_v4(),
        appointment_id: Some(appointment.appointment_id),
        patient_id: appointment.patient_id,
        doctor_id: appointment.doctor_id,
        visit_date,
        chief_complaint: None,
        diagnosis: None,
        notes: appointment.notes.clone(),
        procedures: vec![],
        status: VisitStatus::InProgress,
        total_amount: money(Decimal::ZERO),
        created_at: now,
        updated_at: now,
    }
}

/// Stores call this under their lock before overwriting a visit.
pub fn ensure_editable(
    stored: VisitStatus,
    expected: VisitStatus,
    invoiced: bool,
) -> EngineResult<()> {
    if invoiced {
        return Err(EngineError::InvalidStateTransition {
            entity: "visit",
            from: "INVOICED".into(),
            action: "modify",
        });
    }
    if stored != expected || stored == VisitStatus::Cancelled {
        return Err(EngineError::InvalidStateTransition {
            entity: "visit",
            from: stored.as_str().to_string(),
            action: "modify",
        });
    }
    Ok(())
}

/// Resolve every procedure's service; one missing service fails the lot.
pub async fn resolve_services(
    store: &dyn Store,
    procedures: &[Procedure],
) -> EngineResult<Vec<Service>> {
    let mut services = Vec::with_capacity(procedures.len());
    for p in procedures {
        let service = store
            .get_service(p.service_id)
            .await?
            .ok_or_else(|| EngineError::missing("service", p.service_id))?;
        services.push(service);
    }
    Ok(services)
}

pub async fn price_procedures(
    store: &dyn Store,
    procedures: &[Procedure],
) -> EngineResult<Decimal> {
    let services = resolve_services(store, procedures).await?;
    let sum = services
        .iter()
        .try_fold(Decimal::ZERO, |acc, s| acc.checked_add(s.price));
    bounded("total_amount", sum)
}

fn clean(text: Option<String>) -> Option<String> {
    text.map(|t| t.trim().to_string()).filter(|t| !t.is_empty())
}

async fn load(store: &dyn Store, visit_id: Uuid) -> EngineResult<Visit> {
    store
        .get_visit(visit_id)
        .await?
        .ok_or_else(|| EngineError::missing("visit", visit_id))
}

pub async fn open_visit(
    store: &dyn Store,
    req: NewVisit,
    now: DateTime<Utc>,
) -> EngineResult<Visit> {
    let total_amount = price_procedures(store, &req.procedures).await?;

    let visit = Visit {
        visit_id: Uuid::new_v4(),
        appointment_id: None,
        patient_id: req.patient_id,
        doctor_id: req.doctor_id,
        visit_date: req.visit_date,
        chief_complaint: clean(req.chief_complaint),
        diagnosis: clean(req.diagnosis),
        notes: clean(req.notes),
        procedures: req.procedures,
        status: VisitStatus::InProgress,
        total_amount,
        created_at: now,
        updated_at: now,
    };
    store.insert_visit(&visit).await?;

    tracing::info!(visit_id = %visit.visit_id, patient_id = %visit.patient_id, "visit opened");
    Ok(visit)
}

pub async fn revise_visit(
    store: &dyn Store,
    visit_id: Uuid,
    changes: VisitChanges,
    now: DateTime<Utc>,
) -> EngineResult<Visit> {
    let current = load(store, visit_id).await?;
    let invoiced = store.invoice_for_visit(visit_id).await?.is_some();
    ensure_editable(current.status, current.status, invoiced)?;

    let mut next = current.clone();
    if let Some(v) = changes.chief_complaint {
        next.chief_complaint = clean(v);
    }
    if let Some(v) = changes.diagnosis {
        next.diagnosis = clean(v);
    }
    if let Some(v) = changes.notes {
        next.notes = clean(v);
    }
    if let Some(procedures) = changes.procedures {
        next.total_amount = price_procedures(store, &procedures).await?;
        next.procedures = procedures;
    }
    next.updated_at = now;

    store.update_visit(&next, current.status).await?;
    Ok(next)
}

/// IN_PROGRESS -> COMPLETED | CANCELLED.
pub async fn close_visit(
    store: &dyn Store,
    visit_id: Uuid,
    target: VisitStatus,
    now: DateTime<Utc>,
) -> EngineResult<Visit> {
    let current = load(store, visit_id).await?;
    let action = match target {
        VisitStatus::Completed => "complete",
        VisitStatus::Cancelled => "cancel",
        VisitStatus::InProgress => "reopen",
    };
    if current.status != VisitStatus::InProgress || target == VisitStatus::InProgress {
        return Err(EngineError::InvalidStateTransition {
            entity: "visit",
            from: current.status.as_str().to_string(),
            action,
        });
    }

    let mut next = current.clone();
    next.status = target;
    next.updated_at = now;
    store.update_visit(&next, current.status).await?;

    tracing::info!(visit_id = %visit_id, status = target.as_str(), "visit closed");
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 12, 10, 0, 0).unwrap()
    }

    async fn service(store: &MemoryStore, name: &str, price: &str) -> Uuid {
        let s = Service {
            service_id: Uuid::new_v4(),
            name: name.into(),
            price: price.parse().unwrap(),
            default_duration_min: Some(30),
            is_active: true,
        };
        store.insert_service(&s).await.unwrap();
        s.service_id
    }

    fn procedure(service_id: Uuid) -> Procedure {
        Procedure {
            service_id,
            tooth: None,
            surfaces: None,
            notes: None,
        }
    }

    fn new_visit(procedures: Vec<Procedure>) -> NewVisit {
        NewVisit {
            patient_id: Uuid::new_v4(),
            doctor_id: Uuid::new_v4(),
            visit_date: now().date_naive(),
            chief_complaint: Some("toothache".into()),
            diagnosis: None,
            notes: Some("   ".into()),
            procedures,
        }
    }

    #[tokio::test]
    async fn total_follows_procedure_prices() {
        let store = MemoryStore::new();
        let filling = service(&store, "Filling", "15.000").await;
        let crown = service(&store, "Crown", "90.000").await;

        let visit = open_visit(&store, new_visit(vec![procedure(filling)]), now()).await.unwrap();
        assert_eq!(visit.total_amount, "15".parse::<Decimal>().unwrap());
        assert_eq!(visit.notes, None);

        let revised = revise_visit(
            &store,
            visit.visit_id,
            VisitChanges {
                procedures: Some(vec![procedure(filling), procedure(crown)]),
                ..Default::default()
            },
            now(),
        )
        .await
        .unwrap();
        assert_eq!(revised.total_amount.to_string(), "105.000");
    }

    #[tokio::test]
    async fn unknown_service_fails_without_persisting() {
        let store = MemoryStore::new();
        let missing = Uuid::new_v4();
        let err = open_visit(&store, new_visit(vec![procedure(missing)]), now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::MissingReference { entity: "service", id } if id == missing
        ));
    }

    #[tokio::test]
    async fn cancelled_visit_is_frozen() {
        let store = MemoryStore::new();
        let visit = open_visit(&store, new_visit(vec![]), now()).await.unwrap();

        let cancelled = close_visit(&store, visit.visit_id, VisitStatus::Cancelled, now())
            .await
            .unwrap();
        assert_eq!(cancelled.status, VisitStatus::Cancelled);

        assert!(close_visit(&store, visit.visit_id, VisitStatus::Completed, now()).await.is_err());
        let err = revise_visit(
            &store,
            visit.visit_id,
            VisitChanges {
                diagnosis: Some(Some("caries".into())),
                ..Default::default()
            },
            now(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidStateTransition { entity: "visit", .. }));
    }

    #[test]
    fn editable_guard() {
        let appt = Appointment {
            appointment_id: Uuid::new_v4(),
            patient_id: Uuid::new_v4(),
            doctor_id: Uuid::new_v4(),
            service_id: None,
            start_at: now(),
            duration_min: 30,
            status: crate::models::AppointmentStatus::Completed,
            notes: None,
            created_by: Uuid::new_v4(),
            created_at: now(),
            updated_at: now(),
        };
        let visit = visit_from_appointment(&appt, now().date_naive(), now());
        assert!(ensure_editable(visit.status, VisitStatus::InProgress, false).is_ok());
        assert!(ensure_editable(visit.status, VisitStatus::InProgress, true).is_err());
        assert!(ensure_editable(visit.status, VisitStatus::Completed, false).is_err());
        assert!(ensure_editable(VisitStatus::Cancelled, VisitStatus::Cancelled, false).is_err());
    }

    #[tokio::test]
    async fn total_beyond_money_range_is_a_validation_error() {
        let store = MemoryStore::new();
        let implant = service(&store, "Implant", "99999999999").await;

        let err = open_visit(&store, new_visit(vec![procedure(implant), procedure(implant)]), now())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation { field: "total_amount", .. }));
    }
}
