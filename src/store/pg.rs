// src/store/pg.rs
//
// Postgres store. Overlap checks run under a per-doctor advisory lock held
// until commit; ledger and revision writes lock the invoice row FOR UPDATE.
// The exclusion and unique constraints in migrations/ catch anything that
// slips past either.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::Store;
use crate::engine::invoicing::{InvoiceRevision, apply_revision, sequence_of};
use crate::engine::ledger::{RefundHandling, settle};
use crate::engine::{EngineError, EngineResult, conflict, lifecycle, visits};
use crate::models::{
    Appointment, AppointmentStatus, Invoice, InvoiceItem, Payment, PaymentStatus, Procedure,
    Service, Visit,
    VisitStatus,
};

const APPOINTMENT_COLUMNS: &str = "appointment_id, patient_id, doctor_id, service_id, start_at, duration_min, \
     status, notes, created_by, created_at, updated_at";

const VISIT_COLUMNS: &str = "visit_id, appointment_id, patient_id, doctor_id, visit_date, chief_complaint, \
     diagnosis, notes, status, total_amount, created_at, updated_at";

const INVOICE_COLUMNS: &str = "invoice_id, invoice_number, patient_id, visit_id, issue_date, due_date, \
     discount_type, discount_value, tax_percentage, subtotal, discount_amount, tax_amount, total_amount, \
     paid_amount, payment_status, created_at, updated_at";

const PAYMENT_COLUMNS: &str =
    "payment_id, invoice_id, amount, method, transaction_ref, notes, received_by, paid_at";

const EXCLUSION_VIOLATION: &str = "23P01";
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/* ============================================================
   Error mapping
   ============================================================ */

fn violation<'e>(e: &'e sqlx::Error, code: &str) -> Option<&'e str> {
    let db = e.as_database_error()?;
    if db.code().as_deref() != Some(code) {
        return None;
    }
    Some(db.constraint().unwrap_or_default())
}

fn appointment_write_error(e: sqlx::Error, appointment: &Appointment) -> EngineError {
    if violation(&e, EXCLUSION_VIOLATION).is_some() {
        tracing::warn!(
            doctor_id = %appointment.doctor_id,
            appointment_id = %appointment.appointment_id,
            "overlap rejected by exclusion constraint"
        );
        // the constraint does not name the other row
        return EngineError::SchedulingConflict {
            doctor_id: appointment.doctor_id,
            conflicting_id: Uuid::nil(),
            start: appointment.start_at,
        };
    }
    e.into()
}

fn has_visit_error(action: &'static str) -> EngineError {
    EngineError::InvalidStateTransition {
        entity: "appointment",
        from: "HAS_VISIT".into(),
        action,
    }
}

/* ============================================================
   Row helpers (shared by pool reads and transactions)
   ============================================================ */

async fn lock_doctor(conn: &mut PgConnection, doctor_id: Uuid) -> EngineResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, 0))")
        .bind(doctor_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn doctor_bookings(
    conn: &mut PgConnection,
    doctor_id: Uuid,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> EngineResult<Vec<Appointment>> {
    let sql = format!(
        "SELECT {APPOINTMENT_COLUMNS} FROM appointment \
         WHERE doctor_id = $1 AND status IN (0, 1, 2) AND start_at < $3 AND end_at > $2"
    );
    Ok(sqlx::query_as::<_, Appointment>(&sql)
        .bind(doctor_id)
        .bind(from)
        .bind(to)
        .fetch_all(&mut *conn)
        .await?)
}

async fn locked_appointment_status(
    conn: &mut PgConnection,
    appointment_id: Uuid,
) -> EngineResult<AppointmentStatus> {
    sqlx::query_scalar::<_, AppointmentStatus>(
        "SELECT status FROM appointment WHERE appointment_id = $1 FOR UPDATE",
    )
    .bind(appointment_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| EngineError::missing("appointment", appointment_id))
}

/// Lock the doctor's calendar and re-run the overlap check for `appointment`.
async fn ensure_calendar_free(
    conn: &mut PgConnection,
    appointment: &Appointment,
) -> EngineResult<()> {
    if !appointment.status.blocks_calendar() {
        return Ok(());
    }
    lock_doctor(conn, appointment.doctor_id).await?;
    let existing = doctor_bookings(
        conn,
        appointment.doctor_id,
        appointment.start_at,
        appointment.end_at(),
    )
    .await?;
    conflict::ensure_free(&existing, appointment)
}

async fn write_appointment(conn: &mut PgConnection, a: &Appointment) -> EngineResult<()> {
    sqlx::query(
        r#"
        UPDATE appointment
        SET doctor_id = $2,
            service_id = $3,
            start_at = $4,
            end_at = $5,
            duration_min = $6,
            status = $7,
            notes = $8,
            updated_at = $9
        WHERE appointment_id = $1
        "#,
    )
    .bind(a.appointment_id)
    .bind(a.doctor_id)
    .bind(a.service_id)
    .bind(a.start_at)
    .bind(a.end_at())
    .bind(a.duration_min)
    .bind(a.status)
    .bind(&a.notes)
    .bind(a.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| appointment_write_error(e, a))?;
    Ok(())
}

async fn load_visit(conn: &mut PgConnection, visit_id: Uuid) -> EngineResult<Option<Visit>> {
    let sql = format!("SELECT {VISIT_COLUMNS} FROM visit WHERE visit_id = $1");
    let Some(mut visit) = sqlx::query_as::<_, Visit>(&sql)
        .bind(visit_id)
        .fetch_optional(&mut *conn)
        .await?
    else {
        return Ok(None);
    };
    visit.procedures = sqlx::query_as::<_, Procedure>(
        "SELECT service_id, tooth, surfaces, notes FROM visit_procedure WHERE visit_id = $1 ORDER BY position",
    )
    .bind(visit_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(Some(visit))
}

async fn write_procedures(conn: &mut PgConnection, visit: &Visit) -> EngineResult<()> {
    sqlx::query("DELETE FROM visit_procedure WHERE visit_id = $1")
        .bind(visit.visit_id)
        .execute(&mut *conn)
        .await?;
    for (position, p) in visit.procedures.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO visit_procedure (visit_id, position, service_id, tooth, surfaces, notes)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(visit.visit_id)
        .bind(position as i32)
        .bind(p.service_id)
        .bind(&p.tooth)
        .bind(&p.surfaces)
        .bind(&p.notes)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn insert_visit_row(conn: &mut PgConnection, v: &Visit) -> EngineResult<()> {
    sqlx::query(
        r#"
        INSERT INTO visit (
          visit_id, appointment_id, patient_id, doctor_id, visit_date,
          chief_complaint, diagnosis, notes, status, total_amount, created_at, updated_at
        )
        VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)
        "#,
    )
    .bind(v.visit_id)
    .bind(v.appointment_id)
    .bind(v.patient_id)
    .bind(v.doctor_id)
    .bind(v.visit_date)
    .bind(&v.chief_complaint)
    .bind(&v.diagnosis)
    .bind(&v.notes)
    .bind(v.status)
    .bind(v.total_amount)
    .bind(v.created_at)
    .bind(v.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| match violation(&e, UNIQUE_VIOLATION) {
        Some("visit_appointment_key") => has_visit_error("open visit for"),
        _ => e.into(),
    })?;
    write_procedures(conn, v).await
}

async fn load_invoice(
    conn: &mut PgConnection,
    invoice_id: Uuid,
    for_update: bool,
) -> EngineResult<Option<Invoice>> {
    let sql = format!(
        "SELECT {INVOICE_COLUMNS} FROM invoice WHERE invoice_id = $1{}",
        if for_update { " FOR UPDATE" } else { "" }
    );
    let Some(mut invoice) = sqlx::query_as::<_, Invoice>(&sql)
        .bind(invoice_id)
        .fetch_optional(&mut *conn)
        .await?
    else {
        return Ok(None);
    };
    invoice.items = sqlx::query_as::<_, InvoiceItem>(
        r#"
        SELECT service_id, description, quantity, unit_price, total_price
        FROM invoice_item
        WHERE invoice_id = $1
        ORDER BY position
        "#,
    )
    .bind(invoice_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(Some(invoice))
}

async fn locked_invoice(conn: &mut PgConnection, invoice_id: Uuid) -> EngineResult<Invoice> {
    load_invoice(conn, invoice_id, true)
        .await?
        .ok_or_else(|| EngineError::missing("invoice", invoice_id))
}

async fn invoice_id_for_visit(
    conn: &mut PgConnection,
    visit_id: Uuid,
) -> EngineResult<Option<Uuid>> {
    Ok(
        sqlx::query_scalar::<_, Uuid>("SELECT invoice_id FROM invoice WHERE visit_id = $1")
            .bind(visit_id)
            .fetch_optional(&mut *conn)
            .await?,
    )
}

async fn write_items(conn: &mut PgConnection, invoice: &Invoice) -> EngineResult<()> {
    sqlx::query("DELETE FROM invoice_item WHERE invoice_id = $1")
        .bind(invoice.invoice_id)
        .execute(&mut *conn)
        .await?;
    for (position, item) in invoice.items.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO invoice_item (invoice_id, position, service_id, description, quantity, unit_price, total_price)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(invoice.invoice_id)
        .bind(position as i32)
        .bind(item.service_id)
        .bind(&item.description)
        .bind(item.quantity)
        .bind(item.unit_price)
        .bind(item.total_price)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Persist everything an invoice revision or ledger entry may change.
async fn write_invoice_figures(conn: &mut PgConnection, i: &Invoice) -> EngineResult<()> {
    sqlx::query(
        r#"
        UPDATE invoice
        SET due_date = $2,
            discount_type = $3,
            discount_value = $4,
            tax_percentage = $5,
            subtotal = $6,
            discount_amount = $7,
            tax_amount = $8,
            total_amount = $9,
            paid_amount = $10,
            payment_status = $11,
            updated_at = $12
        WHERE invoice_id = $1
        "#,
    )
    .bind(i.invoice_id)
    .bind(i.due_date)
    .bind(i.discount_type)
    .bind(i.discount_value)
    .bind(i.tax_percentage)
    .bind(i.subtotal)
    .bind(i.discount_amount)
    .bind(i.tax_amount)
    .bind(i.total_amount)
    .bind(i.paid_amount)
    .bind(i.payment_status)
    .bind(i.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn load_payment(
    conn: &mut PgConnection,
    payment_id: Uuid,
    for_update: bool,
) -> EngineResult<Option<Payment>> {
    let sql = format!(
        "SELECT {PAYMENT_COLUMNS} FROM payment WHERE payment_id = $1{}",
        if for_update { " FOR UPDATE" } else { "" }
    );
    Ok(sqlx::query_as::<_, Payment>(&sql)
        .bind(payment_id)
        .fetch_optional(&mut *conn)
        .await?)
}

/// Lock the owning invoice first, then the payment row. Every ledger write
/// takes the invoice lock first so concurrent writers queue on it.
async fn lock_payment_and_invoice(
    conn: &mut PgConnection,
    payment_id: Uuid,
) -> EngineResult<(Payment, Invoice)> {
    let invoice_id =
        sqlx::query_scalar::<_, Uuid>("SELECT invoice_id FROM payment WHERE payment_id = $1")
            .bind(payment_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| EngineError::missing("payment", payment_id))?;
    let invoice = locked_invoice(conn, invoice_id).await?;
    let payment = load_payment(conn, payment_id, true)
        .await?
        .ok_or_else(|| EngineError::missing("payment", payment_id))?;
    Ok((payment, invoice))
}

/* ============================================================
   Store impl
   ============================================================ */

#[async_trait]
impl Store for PgStore {
    async fn get_appointment(&self, appointment_id: Uuid) -> EngineResult<Option<Appointment>> {
        let sql = format!("SELECT {APPOINTMENT_COLUMNS} FROM appointment WHERE appointment_id = $1");
        Ok(sqlx::query_as::<_, Appointment>(&sql)
            .bind(appointment_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_appointments(
        &self,
        doctor_id: Option<Uuid>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> EngineResult<Vec<Appointment>> {
        let sql = format!(
            "SELECT {APPOINTMENT_COLUMNS} FROM appointment \
             WHERE ($1::uuid IS NULL OR doctor_id = $1) AND start_at >= $2 AND start_at < $3 \
             ORDER BY start_at, appointment_id"
        );
        Ok(sqlx::query_as::<_, Appointment>(&sql)
            .bind(doctor_id)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn blocking_appointments(
        &self,
        doctor_id: Option<Uuid>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> EngineResult<Vec<Appointment>> {
        let sql = format!(
            "SELECT {APPOINTMENT_COLUMNS} FROM appointment \
             WHERE ($1::uuid IS NULL OR doctor_id = $1) AND status IN (0, 1, 2) \
               AND start_at < $3 AND end_at > $2 \
             ORDER BY start_at, appointment_id"
        );
        Ok(sqlx::query_as::<_, Appointment>(&sql)
            .bind(doctor_id)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn insert_appointment(&self, a: &Appointment) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        ensure_calendar_free(&mut tx, a).await?;

        sqlx::query(
            r#"
            INSERT INTO appointment (
              appointment_id, patient_id, doctor_id, service_id, start_at, end_at,
              duration_min, status, notes, created_by, created_at, updated_at
            )
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)
            "#,
        )
        .bind(a.appointment_id)
        .bind(a.patient_id)
        .bind(a.doctor_id)
        .bind(a.service_id)
        .bind(a.start_at)
        .bind(a.end_at())
        .bind(a.duration_min)
        .bind(a.status)
        .bind(&a.notes)
        .bind(a.created_by)
        .bind(a.created_at)
        .bind(a.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| appointment_write_error(e, a))?;

        tx.commit().await?;
        Ok(())
    }

    async fn update_appointment(
        &self,
        a: &Appointment,
        expected: AppointmentStatus,
    ) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        let stored = locked_appointment_status(&mut tx, a.appointment_id).await?;
        lifecycle::ensure_status(stored, expected, "update")?;
        ensure_calendar_free(&mut tx, a).await?;
        write_appointment(&mut tx, a).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn complete_appointment(
        &self,
        a: &Appointment,
        expected: AppointmentStatus,
        visit: &Visit,
    ) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        let stored = locked_appointment_status(&mut tx, a.appointment_id).await?;
        lifecycle::ensure_status(stored, expected, "complete")?;

        let has_visit: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM visit WHERE appointment_id = $1)")
                .bind(a.appointment_id)
                .fetch_one(&mut *tx)
                .await?;
        if has_visit {
            return Err(has_visit_error("complete"));
        }

        ensure_calendar_free(&mut tx, a).await?;
        write_appointment(&mut tx, a).await?;
        insert_visit_row(&mut tx, visit).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_service(&self, service_id: Uuid) -> EngineResult<Option<Service>> {
        Ok(sqlx::query_as::<_, Service>(
            "SELECT service_id, name, price, default_duration_min, is_active FROM service WHERE service_id = $1",
        )
        .bind(service_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn list_services(&self) -> EngineResult<Vec<Service>> {
        Ok(sqlx::query_as::<_, Service>(
            r#"
            SELECT service_id, name, price, default_duration_min, is_active
            FROM service
            WHERE is_active
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await?)
    }

    async fn insert_service(&self, s: &Service) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO service (service_id, name, price, default_duration_min, is_active)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(s.service_id)
        .bind(&s.name)
        .bind(s.price)
        .bind(s.default_duration_min)
        .bind(s.is_active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_visit(&self, visit_id: Uuid) -> EngineResult<Option<Visit>> {
        let mut conn = self.pool.acquire().await?;
        load_visit(&mut conn, visit_id).await
    }

    async fn visit_for_appointment(&self, appointment_id: Uuid) -> EngineResult<Option<Visit>> {
        let mut conn = self.pool.acquire().await?;
        let visit_id =
            sqlx::query_scalar::<_, Uuid>("SELECT visit_id FROM visit WHERE appointment_id = $1")
                .bind(appointment_id)
                .fetch_optional(&mut *conn)
                .await?;
        match visit_id {
            Some(id) => load_visit(&mut conn, id).await,
            None => Ok(None),
        }
    }

    async fn insert_visit(&self, visit: &Visit) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_visit_row(&mut tx, visit).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_visit(&self, v: &Visit, expected: VisitStatus) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        let stored = sqlx::query_scalar::<_, VisitStatus>(
            "SELECT status FROM visit WHERE visit_id = $1 FOR UPDATE",
        )
        .bind(v.visit_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| EngineError::missing("visit", v.visit_id))?;
        let invoiced = invoice_id_for_visit(&mut tx, v.visit_id).await?.is_some();
        visits::ensure_editable(stored, expected, invoiced)?;

        sqlx::query(
            r#"
            UPDATE visit
            SET chief_complaint = $2,
                diagnosis = $3,
                notes = $4,
                status = $5,
                total_amount = $6,
                updated_at = $7
            WHERE visit_id = $1
            "#,
        )
        .bind(v.visit_id)
        .bind(&v.chief_complaint)
        .bind(&v.diagnosis)
        .bind(&v.notes)
        .bind(v.status)
        .bind(v.total_amount)
        .bind(v.updated_at)
        .execute(&mut *tx)
        .await?;
        write_procedures(&mut tx, v).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> EngineResult<Option<Invoice>> {
        let mut conn = self.pool.acquire().await?;
        load_invoice(&mut conn, invoice_id, false).await
    }

    async fn invoice_for_visit(&self, visit_id: Uuid) -> EngineResult<Option<Invoice>> {
        let mut conn = self.pool.acquire().await?;
        match invoice_id_for_visit(&mut conn, visit_id).await? {
            Some(id) => load_invoice(&mut conn, id, false).await,
            None => Ok(None),
        }
    }

    async fn max_invoice_sequence(&self, prefix: &str) -> EngineResult<u32> {
        let numbers = sqlx::query_scalar::<_, String>(
            "SELECT invoice_number FROM invoice WHERE starts_with(invoice_number, $1)",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(numbers
            .iter()
            .filter_map(|n| sequence_of(n, prefix))
            .max()
            .unwrap_or(0))
    }

    async fn insert_invoice(&self, i: &Invoice, billed_visit: Option<&Visit>) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;

        if let Some(visit_id) = i.visit_id {
            // serializes generation per visit and against concurrent visit edits
            sqlx::query("SELECT visit_id FROM visit WHERE visit_id = $1 FOR UPDATE")
                .bind(visit_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| EngineError::missing("visit", visit_id))?;
            if let Some(invoice_id) = invoice_id_for_visit(&mut tx, visit_id).await? {
                return Err(EngineError::AlreadyInvoiced { visit_id, invoice_id });
            }
            if let Some(seen) = billed_visit {
                let stored = load_visit(&mut tx, visit_id).await?;
                if stored.as_ref() != Some(seen) {
                    return Err(EngineError::VisitChanged { visit_id });
                }
            }
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO invoice (
              invoice_id, invoice_number, patient_id, visit_id, issue_date, due_date,
              discount_type, discount_value, tax_percentage, subtotal, discount_amount,
              tax_amount, total_amount, paid_amount, payment_status, created_at, updated_at
            )
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17)
            "#,
        )
        .bind(i.invoice_id)
        .bind(&i.invoice_number)
        .bind(i.patient_id)
        .bind(i.visit_id)
        .bind(i.issue_date)
        .bind(i.due_date)
        .bind(i.discount_type)
        .bind(i.discount_value)
        .bind(i.tax_percentage)
        .bind(i.subtotal)
        .bind(i.discount_amount)
        .bind(i.tax_amount)
        .bind(i.total_amount)
        .bind(i.paid_amount)
        .bind(i.payment_status)
        .bind(i.created_at)
        .bind(i.updated_at)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            return Err(match violation(&e, UNIQUE_VIOLATION) {
                Some("invoice_number_key") => {
                    EngineError::DuplicateInvoiceNumber(i.invoice_number.clone())
                }
                Some("invoice_visit_key") => {
                    drop(tx);
                    let visit_id = i.visit_id.unwrap_or_default();
                    let mut conn = self.pool.acquire().await?;
                    match invoice_id_for_visit(&mut conn, visit_id).await? {
                        Some(invoice_id) => EngineError::AlreadyInvoiced { visit_id, invoice_id },
                        None => e.into(),
                    }
                }
                _ => e.into(),
            });
        }

        write_items(&mut tx, i).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn revise_invoice(
        &self,
        invoice_id: Uuid,
        revision: &InvoiceRevision,
        now: DateTime<Utc>,
    ) -> EngineResult<Invoice> {
        let mut tx = self.pool.begin().await?;
        let mut invoice = locked_invoice(&mut tx, invoice_id).await?;
        apply_revision(&mut invoice, revision, now)?;
        write_invoice_figures(&mut tx, &invoice).await?;
        if revision.items.is_some() {
            write_items(&mut tx, &invoice).await?;
        }
        tx.commit().await?;
        Ok(invoice)
    }

    async fn get_payment(&self, payment_id: Uuid) -> EngineResult<Option<Payment>> {
        let mut conn = self.pool.acquire().await?;
        load_payment(&mut conn, payment_id, false).await
    }

    async fn list_payments(&self, invoice_id: Uuid) -> EngineResult<Vec<Payment>> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payment WHERE invoice_id = $1 ORDER BY paid_at, payment_id");
        Ok(sqlx::query_as::<_, Payment>(&sql)
            .bind(invoice_id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn record_payment(&self, p: &Payment, now: DateTime<Utc>) -> EngineResult<Invoice> {
        let mut tx = self.pool.begin().await?;
        let mut invoice = locked_invoice(&mut tx, p.invoice_id).await?;
        settle(&mut invoice, p.amount, RefundHandling::Reset, now)?;

        sqlx::query(
            r#"
            INSERT INTO payment (payment_id, invoice_id, amount, method, transaction_ref, notes, received_by, paid_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(p.payment_id)
        .bind(p.invoice_id)
        .bind(p.amount)
        .bind(p.method)
        .bind(&p.transaction_ref)
        .bind(&p.notes)
        .bind(p.received_by)
        .bind(p.paid_at)
        .execute(&mut *tx)
        .await?;
        write_invoice_figures(&mut tx, &invoice).await?;

        tx.commit().await?;
        Ok(invoice)
    }

    async fn amend_payment(&self, p: &Payment, now: DateTime<Utc>) -> EngineResult<Invoice> {
        let mut tx = self.pool.begin().await?;
        let (previous, mut invoice) = lock_payment_and_invoice(&mut tx, p.payment_id).await?;
        if previous.invoice_id != p.invoice_id {
            return Err(EngineError::DataIntegrity(format!(
                "payment {} cannot move between invoices",
                p.payment_id
            )));
        }
        settle(&mut invoice, p.amount - previous.amount, RefundHandling::Keep, now)?;

        sqlx::query(
            r#"
            UPDATE payment
            SET amount = $2, method = $3, transaction_ref = $4, notes = $5
            WHERE payment_id = $1
            "#,
        )
        .bind(p.payment_id)
        .bind(p.amount)
        .bind(p.method)
        .bind(&p.transaction_ref)
        .bind(&p.notes)
        .execute(&mut *tx)
        .await?;
        write_invoice_figures(&mut tx, &invoice).await?;

        tx.commit().await?;
        Ok(invoice)
    }

    async fn remove_payment(
        &self,
        payment_id: Uuid,
        now: DateTime<Utc>,
    ) -> EngineResult<(Payment, Invoice)> {
        let mut tx = self.pool.begin().await?;
        let (payment, mut invoice) = lock_payment_and_invoice(&mut tx, payment_id).await?;
        settle(&mut invoice, -payment.amount, RefundHandling::Keep, now)?;

        sqlx::query("DELETE FROM payment WHERE payment_id = $1")
            .bind(payment_id)
            .execute(&mut *tx)
            .await?;
        write_invoice_figures(&mut tx, &invoice).await?;

        tx.commit().await?;
        Ok((payment, invoice))
    }

    async fn mark_refunded(&self, invoice_id: Uuid, now: DateTime<Utc>) -> EngineResult<Invoice> {
        let mut tx = self.pool.begin().await?;
        let mut invoice = locked_invoice(&mut tx, invoice_id).await?;
        if invoice.payment_status == PaymentStatus::Refunded {
            return Err(EngineError::InvalidStateTransition {
                entity: "invoice",
                from: invoice.payment_status.as_str().to_string(),
                action: "refund",
            });
        }
        invoice.payment_status = PaymentStatus::Refunded;
        invoice.updated_at = now;
        write_invoice_figures(&mut tx, &invoice).await?;
        tx.commit().await?;
        Ok(invoice)
    }
}
