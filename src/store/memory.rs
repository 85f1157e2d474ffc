// src/store/memory.rs
//
// Single-mutex store: every trait method holds the lock for its whole
// check + write, so operations are serialized like SERIALIZABLE transactions.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::Store;
use crate::engine::invoicing::{InvoiceRevision, apply_revision, sequence_of};
use crate::engine::ledger::{RefundHandling, settle};
use crate::engine::{EngineError, EngineResult, conflict, lifecycle, visits};
use crate::models::{
    Appointment, AppointmentStatus, Invoice, Payment, PaymentStatus, Service, Visit, VisitStatus,
};

#[derive(Default)]
struct Tables {
    appointments: HashMap<Uuid, Appointment>,
    services: HashMap<Uuid, Service>,
    visits: HashMap<Uuid, Visit>,
    invoices: HashMap<Uuid, Invoice>,
    invoice_numbers: HashSet<String>,
    payments: HashMap<Uuid, Payment>,
}

impl Tables {
    fn doctor_bookings(&self, doctor_id: Uuid) -> Vec<Appointment> {
        self.appointments
            .values()
            .filter(|a| a.doctor_id == doctor_id && a.status.blocks_calendar())
            .cloned()
            .collect()
    }

    fn invoice_for_visit(&self, visit_id: Uuid) -> Option<&Invoice> {
        self.invoices.values().find(|i| i.visit_id == Some(visit_id))
    }

    fn invoice_mut(&mut self, invoice_id: Uuid) -> EngineResult<&mut Invoice> {
        self.invoices
            .get_mut(&invoice_id)
            .ok_or_else(|| EngineError::missing("invoice", invoice_id))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl MemoryStore {
    pub async fn invoice_count_for_visit(&self, visit_id: Uuid) -> usize {
        let t = self.tables.lock().await;
        t.invoices.values().filter(|i| i.visit_id == Some(visit_id)).count()
    }

    pub async fn delete_service(&self, service_id: Uuid) {
        self.tables.lock().await.services.remove(&service_id);
    }

    /// Simulates a number taken by a concurrent writer the sequence scan has not seen.
    pub async fn reserve_invoice_number(&self, number: &str) {
        self.tables.lock().await.invoice_numbers.insert(number.to_string());
    }
}

fn sorted(mut list: Vec<Appointment>) -> Vec<Appointment> {
    list.sort_by_key(|a| (a.start_at, a.appointment_id));
    list
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_appointment(&self, appointment_id: Uuid) -> EngineResult<Option<Appointment>> {
        Ok(self.tables.lock().await.appointments.get(&appointment_id).cloned())
    }

    async fn list_appointments(
        &self,
        doctor_id: Option<Uuid>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> EngineResult<Vec<Appointment>> {
        let t = self.tables.lock().await;
        Ok(sorted(
            t.appointments
                .values()
                .filter(|a| doctor_id.is_none_or(|d| a.doctor_id == d))
                .filter(|a| a.start_at >= from && a.start_at < to)
                .cloned()
                .collect(),
        ))
    }

    async fn blocking_appointments(
        &self,
        doctor_id: Option<Uuid>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> EngineResult<Vec<Appointment>> {
        let t = self.tables.lock().await;
        Ok(sorted(
            t.appointments
                .values()
                .filter(|a| a.status.blocks_calendar())
                .filter(|a| doctor_id.is_none_or(|d| a.doctor_id == d))
                .filter(|a| conflict::overlaps(a.start_at, a.end_at(), from, to))
                .cloned()
                .collect(),
        ))
    }

    async fn insert_appointment(&self, appointment: &Appointment) -> EngineResult<()> {
        let mut t = self.tables.lock().await;
        conflict::ensure_free(&t.doctor_bookings(appointment.doctor_id), appointment)?;
        t.appointments.insert(appointment.appointment_id, appointment.clone());
        Ok(())
    }

    async fn update_appointment(
        &self,
        appointment: &Appointment,
        expected: AppointmentStatus,
    ) -> EngineResult<()> {
        let mut t = self.tables.lock().await;
        let stored = t
            .appointments
            .get(&appointment.appointment_id)
            .ok_or_else(|| EngineError::missing("appointment", appointment.appointment_id))?;
        lifecycle::ensure_status(stored.status, expected, "update")?;
        conflict::ensure_free(&t.doctor_bookings(appointment.doctor_id), appointment)?;
        t.appointments.insert(appointment.appointment_id, appointment.clone());
        Ok(())
    }

    async fn complete_appointment(
        &self,
        appointment: &Appointment,
        expected: AppointmentStatus,
        visit: &Visit,
    ) -> EngineResult<()> {
        let mut t = self.tables.lock().await;
        let stored = t
            .appointments
            .get(&appointment.appointment_id)
            .ok_or_else(|| EngineError::missing("appointment", appointment.appointment_id))?;
        lifecycle::ensure_status(stored.status, expected, "complete")?;
        if t
            .visits
            .values()
            .any(|v| v.appointment_id == Some(appointment.appointment_id))
        {
            return Err(EngineError::InvalidStateTransition {
                entity: "appointment",
                from: "HAS_VISIT".into(),
                action: "complete",
            });
        }
        conflict::ensure_free(&t.doctor_bookings(appointment.doctor_id), appointment)?;
        t.appointments.insert(appointment.appointment_id, appointment.clone());
        t.visits.insert(visit.visit_id, visit.clone());
        Ok(())
    }

    async fn get_service(&self, service_id: Uuid) -> EngineResult<Option<Service>> {
        Ok(self.tables.lock().await.services.get(&service_id).cloned())
    }

    async fn list_services(&self) -> EngineResult<Vec<Service>> {
        let t = self.tables.lock().await;
        let mut list: Vec<Service> = t.services.values().filter(|s| s.is_active).cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    async fn insert_service(&self, service: &Service) -> EngineResult<()> {
        self.tables
            .lock()
            .await
            .services
            .insert(service.service_id, service.clone());
        Ok(())
    }

    async fn get_visit(&self, visit_id: Uuid) -> EngineResult<Option<Visit>> {
        Ok(self.tables.lock().await.visits.get(&visit_id).cloned())
    }

    async fn visit_for_appointment(&self, appointment_id: Uuid) -> EngineResult<Option<Visit>> {
        let t = self.tables.lock().await;
        Ok(t.visits
            .values()
            .find(|v| v.appointment_id == Some(appointment_id))
            .cloned())
    }

    async fn insert_visit(&self, visit: &Visit) -> EngineResult<()> {
        let mut t = self.tables.lock().await;
        if let Some(appointment_id) = visit.appointment_id {
            if t.visits.values().any(|v| v.appointment_id == Some(appointment_id)) {
                return Err(EngineError::InvalidStateTransition {
                    entity: "appointment",
                    from: "HAS_VISIT".into(),
                    action: "open visit for",
                });
            }
        }
        t.visits.insert(visit.visit_id, visit.clone());
        Ok(())
    }

    async fn update_visit(&self, visit: &Visit, expected: VisitStatus) -> EngineResult<()> {
        let mut t = self.tables.lock().await;
        let stored = t
            .visits
            .get(&visit.visit_id)
            .ok_or_else(|| EngineError::missing("visit", visit.visit_id))?;
        let invoiced = t.invoice_for_visit(visit.visit_id).is_some();
        visits::ensure_editable(stored.status, expected, invoiced)?;
        t.visits.insert(visit.visit_id, visit.clone());
        Ok(())
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> EngineResult<Option<Invoice>> {
        Ok(self.tables.lock().await.invoices.get(&invoice_id).cloned())
    }

    async fn invoice_for_visit(&self, visit_id: Uuid) -> EngineResult<Option<Invoice>> {
        Ok(self.tables.lock().await.invoice_for_visit(visit_id).cloned())
    }

    async fn max_invoice_sequence(&self, prefix: &str) -> EngineResult<u32> {
        let t = self.tables.lock().await;
        Ok(t.invoices
            .values()
            .filter_map(|i| sequence_of(&i.invoice_number, prefix))
            .max()
            .unwrap_or(0))
    }

    async fn insert_invoice(
        &self,
        invoice: &Invoice,
        billed_visit: Option<&Visit>,
    ) -> EngineResult<()> {
        let mut t = self.tables.lock().await;
        if let Some(visit_id) = invoice.visit_id {
            if let Some(existing) = t.invoice_for_visit(visit_id) {
                return Err(EngineError::AlreadyInvoiced {
                    visit_id,
                    invoice_id: existing.invoice_id,
                });
            }
            let stored = t
                .visits
                .get(&visit_id)
                .ok_or_else(|| EngineError::missing("visit", visit_id))?;
            if billed_visit.is_some_and(|seen| seen != stored) {
                return Err(EngineError::VisitChanged { visit_id });
            }
        }
        if t.invoice_numbers.contains(&invoice.invoice_number) {
            return Err(EngineError::DuplicateInvoiceNumber(invoice.invoice_number.clone()));
        }
        t.invoice_numbers.insert(invoice.invoice_number.clone());
        t.invoices.insert(invoice.invoice_id, invoice.clone());
        Ok(())
    }

    async fn revise_invoice(
        &self,
        invoice_id: Uuid,
        revision: &InvoiceRevision,
        now: DateTime<Utc>,
    ) -> EngineResult<Invoice> {
        let mut t = self.tables.lock().await;
        let stored = t.invoice_mut(invoice_id)?;
        let mut next = stored.clone();
        apply_revision(&mut next, revision, now)?;
        *stored = next.clone();
        Ok(next)
    }

    async fn get_payment(&self, payment_id: Uuid) -> EngineResult<Option<Payment>> {
        Ok(self.tables.lock().await.payments.get(&payment_id).cloned())
    }

    async fn list_payments(&self, invoice_id: Uuid) -> EngineResult<Vec<Payment>> {
        let t = self.tables.lock().await;
        let mut list: Vec<Payment> = t
            .payments
            .values()
            .filter(|p| p.invoice_id == invoice_id)
            .cloned()
            .collect();
        list.sort_by_key(|p| (p.paid_at, p.payment_id));
        Ok(list)
    }

    async fn record_payment(&self, payment: &Payment, now: DateTime<Utc>) -> EngineResult<Invoice> {
        let mut t = self.tables.lock().await;
        let stored = t.invoice_mut(payment.invoice_id)?;
        let mut next = stored.clone();
        settle(&mut next, payment.amount, RefundHandling::Reset, now)?;
        *stored = next.clone();
        t.payments.insert(payment.payment_id, payment.clone());
        Ok(next)
    }

    async fn amend_payment(&self, payment: &Payment, now: DateTime<Utc>) -> EngineResult<Invoice> {
        let mut t = self.tables.lock().await;
        let previous = t
            .payments
            .get(&payment.payment_id)
            .cloned()
            .ok_or_else(|| EngineError::missing("payment", payment.payment_id))?;
        if previous.invoice_id != payment.invoice_id {
            return Err(EngineError::DataIntegrity(format!(
                "payment {} cannot move between invoices",
                payment.payment_id
            )));
        }
        let stored = t.invoice_mut(payment.invoice_id)?;
        let mut next = stored.clone();
        settle(&mut next, payment.amount - previous.amount, RefundHandling::Keep, now)?;
        *stored = next.clone();
        t.payments.insert(payment.payment_id, payment.clone());
        Ok(next)
    }

    async fn remove_payment(
        &self,
        payment_id: Uuid,
        now: DateTime<Utc>,
    ) -> EngineResult<(Payment, Invoice)> {
        let mut t = self.tables.lock().await;
        let payment = t
            .payments
            .get(&payment_id)
            .cloned()
            .ok_or_else(|| EngineError::missing("payment", payment_id))?;
        let stored = t.invoice_mut(payment.invoice_id)?;
        let mut next = stored.clone();
        settle(&mut next, -payment.amount, RefundHandling::Keep, now)?;
        *stored = next.clone();
        t.payments.remove(&payment_id);
        Ok((payment, next))
    }

    async fn mark_refunded(&self, invoice_id: Uuid, now: DateTime<Utc>) -> EngineResult<Invoice> {
        let mut t = self.tables.lock().await;
        let stored = t.invoice_mut(invoice_id)?;
        if stored.payment_status == PaymentStatus::Refunded {
            return Err(EngineError::InvalidStateTransition {
                entity: "invoice",
                from: stored.payment_status.as_str().to_string(),
                action: "refund",
            });
        }
        stored.payment_status = PaymentStatus::Refunded;
        stored.updated_at = now;
        Ok(stored.clone())
    }
}
