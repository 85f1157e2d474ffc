// src/store/mod.rs
//
// Data-access seam. Plain reads are per-entity; every write that depends on
// a check (overlap, invoice uniqueness, ledger arithmetic) is a single trait
// method so the implementation can run check + write under one lock or
// transaction.

pub mod memory;
pub mod pg;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::engine::EngineResult;
use crate::engine::invoicing::InvoiceRevision;
use crate::models::{Appointment, AppointmentStatus, Invoice, Payment, Service, Visit, VisitStatus};

pub use memory::MemoryStore;
pub use pg::PgStore;

#[async_trait]
pub trait Store: Send + Sync {
    /* ---------- appointments ---------- */

    async fn get_appointment(&self, appointment_id: Uuid) -> EngineResult<Option<Appointment>>;

    /// Appointments (any status) starting in `[from, to)`, ascending by start.
    async fn list_appointments(
        &self,
        doctor_id: Option<Uuid>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> EngineResult<Vec<Appointment>>;

    /// Calendar-blocking appointments whose interval overlaps `[from, to)`.
    async fn blocking_appointments(
        &self,
        doctor_id: Option<Uuid>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> EngineResult<Vec<Appointment>>;

    /// Persist a new appointment; fails with `SchedulingConflict` if it
    /// overlaps a blocking booking of the same doctor.
    async fn insert_appointment(&self, appointment: &Appointment) -> EngineResult<()>;

    /// Overwrite an appointment whose stored status is still `expected`,
    /// re-checking the overlap invariant (excluding itself).
    async fn update_appointment(
        &self,
        appointment: &Appointment,
        expected: AppointmentStatus,
    ) -> EngineResult<()>;

    /// Mark COMPLETED and create its visit in one unit. At most one visit per appointment.
    async fn complete_appointment(
        &self,
        appointment: &Appointment,
        expected: AppointmentStatus,
        visit: &Visit,
    ) -> EngineResult<()>;

    /* ---------- service catalog ---------- */

    async fn get_service(&self, service_id: Uuid) -> EngineResult<Option<Service>>;
    async fn list_services(&self) -> EngineResult<Vec<Service>>;
    async fn insert_service(&self, service: &Service) -> EngineResult<()>;

    /* ---------- visits ---------- */

    async fn get_visit(&self, visit_id: Uuid) -> EngineResult<Option<Visit>>;
    async fn visit_for_appointment(&self, appointment_id: Uuid) -> EngineResult<Option<Visit>>;
    async fn insert_visit(&self, visit: &Visit) -> EngineResult<()>;

    /// Overwrite a visit whose stored status is still `expected`; rejected
    /// once an invoice references it.
    async fn update_visit(&self, visit: &Visit, expected: VisitStatus) -> EngineResult<()>;

    /* ---------- invoices ---------- */

    async fn get_invoice(&self, invoice_id: Uuid) -> EngineResult<Option<Invoice>>;
    async fn invoice_for_visit(&self, visit_id: Uuid) -> EngineResult<Option<Invoice>>;

    /// Highest sequence already used by invoice numbers starting with `prefix`.
    async fn max_invoice_sequence(&self, prefix: &str) -> EngineResult<u32>;

    /// Persist invoice + items. `AlreadyInvoiced` when the visit has an
    /// invoice, `DuplicateInvoiceNumber` when the number is taken.
    /// `billed_visit` is the visit snapshot the items were derived from;
    /// `VisitChanged` when the stored visit no longer matches it.
    async fn insert_invoice(
        &self,
        invoice: &Invoice,
        billed_visit: Option<&Visit>,
    ) -> EngineResult<()>;

    async fn revise_invoice(
        &self,
        invoice_id: Uuid,
        revision: &InvoiceRevision,
        now: DateTime<Utc>,
    ) -> EngineResult<Invoice>;

    /* ---------- payments (serialized per invoice) ---------- */

    async fn get_payment(&self, payment_id: Uuid) -> EngineResult<Option<Payment>>;
    async fn list_payments(&self, invoice_id: Uuid) -> EngineResult<Vec<Payment>>;
    async fn record_payment(&self, payment: &Payment, now: DateTime<Utc>) -> EngineResult<Invoice>;
    async fn amend_payment(&self, payment: &Payment, now: DateTime<Utc>) -> EngineResult<Invoice>;
    async fn remove_payment(
        &self,
        payment_id: Uuid,
        now: DateTime<Utc>,
    ) -> EngineResult<(Payment, Invoice)>;
    async fn mark_refunded(&self, invoice_id: Uuid, now: DateTime<Utc>) -> EngineResult<Invoice>;
}
