// src/engine/invoicing.rs

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::totals::{self, Discount, line_item, money, parse_money};
use super::visits::resolve_services;
use super::{EngineError, EngineResult};
use crate::models::{Invoice, InvoiceItem, PaymentStatus, Procedure, Service, Visit, VisitStatus};
use crate::store::Store;

/// Line item as entered by staff. With a `service_id` and no price, the
/// catalog price (and name) are used.
#[derive(Debug, Clone)]
pub struct ItemDraft {
    pub service_id: Option<Uuid>,
    pub description: Option<String>,
    pub quantity: i32,
    pub unit_price: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct ManualInvoice {
    pub patient_id: Uuid,
    pub due_date: Option<NaiveDate>,
    pub items: Vec<ItemDraft>,
    pub discount: Discount,
    pub tax_percentage: Decimal,
}

/// Before any payment: replace items, discount, tax or due date.
#[derive(Debug, Clone, Default)]
pub struct InvoiceRevision {
    pub items: Option<Vec<InvoiceItem>>,
    pub discount: Option<Discount>,
    pub tax_percentage: Option<Decimal>,
    pub due_date: Option<Option<NaiveDate>>,
}

pub fn invoice_prefix(issue_date: NaiveDate) -> String {
    format!("INV-{:04}{:02}-", issue_date.year(), issue_date.month())
}

pub fn invoice_number(issue_date: NaiveDate, sequence: u32) -> String {
    format!("{}{:04}", invoice_prefix(issue_date), sequence)
}

/// Sequence part of a number carrying `prefix`, if it parses.
pub fn sequence_of(number: &str, prefix: &str) -> Option<u32> {
    number.strip_prefix(prefix)?.parse().ok()
}

pub fn describe_procedure(service: &Service, procedure: &Procedure) -> String {
    let mut out = service.name.clone();
    let tooth = procedure.tooth.as_deref().map(str::trim).filter(|t| !t.is_empty());
    let surfaces = procedure.surfaces.as_deref().map(str::trim).filter(|s| !s.is_empty());
    match (tooth, surfaces) {
        (Some(t), Some(s)) => out.push_str(&format!(" (tooth {t}, {s})")),
        (Some(t), None) => out.push_str(&format!(" (tooth {t})")),
        (None, Some(s)) => out.push_str(&format!(" ({s})")),
        (None, None) => {}
    }
    if let Some(notes) = procedure.notes.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        out.push_str(" - ");
        out.push_str(notes);
    }
    out
}

fn apply_totals(invoice: &mut Invoice) -> EngineResult<()> {
    let t = totals::compute_totals(
        &invoice.items,
        Discount {
            kind: invoice.discount_type,
            value: invoice.discount_value,
        },
        invoice.tax_percentage,
    )?;
    invoice.subtotal = t.subtotal;
    invoice.discount_amount = t.discount_amount;
    invoice.tax_amount = t.tax_amount;
    invoice.total_amount = t.total_amount;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn draft_invoice(
    patient_id: Uuid,
    visit_id: Option<Uuid>,
    issue_date: NaiveDate,
    due_date: Option<NaiveDate>,
    items: Vec<InvoiceItem>,
    discount: Discount,
    tax_percentage: Decimal,
    now: DateTime<Utc>,
) -> EngineResult<Invoice> {
    let mut invoice = Invoice {
        invoice_id: Uuid::new_v4(),
        invoice_number: String::new(),
        patient_id,
        visit_id,
        issue_date,
        due_date,
        discount_type: discount.kind,
        discount_value: parse_money("discount_value", discount.value)?,
        tax_percentage,
        subtotal: Decimal::ZERO,
        discount_amount: Decimal::ZERO,
        tax_amount: Decimal::ZERO,
        total_amount: Decimal::ZERO,
        paid_amount: money(Decimal::ZERO),
        payment_status: PaymentStatus::Pending,
        items,
        created_at: now,
        updated_at: now,
    };
    apply_totals(&mut invoice)?;
    Ok(invoice)
}

/// Used by stores under the invoice lock.
pub fn apply_revision(
    invoice: &mut Invoice,
    revision: &InvoiceRevision,
    now: DateTime<Utc>,
) -> EngineResult<()> {
    if invoice.payment_status == PaymentStatus::Refunded || !invoice.paid_amount.is_zero() {
        return Err(EngineError::InvalidStateTransition {
            entity: "invoice",
            from: invoice.payment_status.as_str().to_string(),
            action: "revise",
        });
    }
    if let Some(items) = &revision.items {
        invoice.items = items.clone();
    }
    if let Some(discount) = revision.discount {
        invoice.discount_type = discount.kind;
        invoice.discount_value = parse_money("discount_value", discount.value)?;
    }
    if let Some(tax) = revision.tax_percentage {
        invoice.tax_percentage = tax;
    }
    if let Some(due) = revision.due_date {
        invoice.due_date = due;
    }
    apply_totals(invoice)?;
    invoice.updated_at = now;
    Ok(())
}

/// Allocate `INV-YYYYMM-NNNN` and persist, moving to the next sequence on collision.
async fn persist_numbered(
    store: &dyn Store,
    mut invoice: Invoice,
    billed_visit: Option<&Visit>,
    attempts: u32,
) -> EngineResult<Invoice> {
    let prefix = invoice_prefix(invoice.issue_date);
    let mut sequence = store.max_invoice_sequence(&prefix).await? + 1;

    for _ in 0..attempts.max(1) {
        invoice.invoice_number = invoice_number(invoice.issue_date, sequence);
        match store.insert_invoice(&invoice, billed_visit).await {
            Ok(()) => return Ok(invoice),
            Err(EngineError::DuplicateInvoiceNumber(number)) => {
                tracing::warn!(invoice_number = %number, "invoice number taken, retrying");
                sequence += 1;
            }
            Err(e) => return Err(e),
        }
    }
    Err(EngineError::Store(format!(
        "could not allocate an invoice number with prefix {prefix} after {attempts} attempts"
    )))
}

/// `generateInvoice(visitId)`: one invoice per visit, all-or-nothing.
///
/// The store persists only if the visit still matches the snapshot the items
/// were built from; an edit that lands in between makes us rebuild.
pub async fn generate_invoice(
    store: &dyn Store,
    visit_id: Uuid,
    issue_date: NaiveDate,
    now: DateTime<Utc>,
    attempts: u32,
) -> EngineResult<Invoice> {
    let mut rebuilds = attempts.max(1);
    loop {
        let visit = store
            .get_visit(visit_id)
            .await?
            .ok_or_else(|| EngineError::missing("visit", visit_id))?;
        let invoice = draft_from_visit(store, &visit, issue_date, now).await?;

        match persist_numbered(store, invoice, Some(&visit), attempts).await {
            Ok(invoice) => {
                tracing::info!(
                    invoice_id = %invoice.invoice_id,
                    invoice_number = %invoice.invoice_number,
                    visit_id = %visit_id,
                    total = %invoice.total_amount,
                    "invoice generated from visit"
                );
                return Ok(invoice);
            }
            Err(EngineError::VisitChanged { .. }) if rebuilds > 1 => {
                tracing::warn!(visit_id = %visit_id, "visit changed during invoicing, rebuilding");
                rebuilds -= 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn draft_from_visit(
    store: &dyn Store,
    visit: &Visit,
    issue_date: NaiveDate,
    now: DateTime<Utc>,
) -> EngineResult<Invoice> {
    if let Some(existing) = store.invoice_for_visit(visit.visit_id).await? {
        return Err(EngineError::AlreadyInvoiced {
            visit_id: visit.visit_id,
            invoice_id: existing.invoice_id,
        });
    }
    if visit.status != VisitStatus::Completed {
        return Err(EngineError::InvalidStateTransition {
            entity: "visit",
            from: visit.status.as_str().to_string(),
            action: "invoice",
        });
    }
    if visit.procedures.is_empty() {
        return Err(EngineError::validation("procedures", "visit has no procedures to bill"));
    }

    let services = resolve_services(store, &visit.procedures).await?;
    let items = visit
        .procedures
        .iter()
        .zip(&services)
        .map(|(p, s)| line_item(Some(s.service_id), describe_procedure(s, p), 1, s.price))
        .collect::<EngineResult<Vec<_>>>()?;

    draft_invoice(
        visit.patient_id,
        Some(visit.visit_id),
        issue_date,
        None,
        items,
        Discount::none(),
        Decimal::ZERO,
        now,
    )
}

pub async fn resolve_items(
    store: &dyn Store,
    drafts: Vec<ItemDraft>,
) -> EngineResult<Vec<InvoiceItem>> {
    let mut items = Vec::with_capacity(drafts.len());
    for draft in drafts {
        let service = match draft.service_id {
            Some(id) => Some(
                store
                    .get_service(id)
                    .await?
                    .ok_or_else(|| EngineError::missing("service", id))?,
            ),
            None => None,
        };
        let unit_price = match (draft.unit_price, &service) {
            (Some(price), _) => price,
            (None, Some(s)) => s.price,
            (None, None) => {
                return Err(EngineError::validation(
                    "unit_price",
                    "required for items without a service",
                ));
            }
        };
        let description = draft
            .description
            .filter(|d| !d.trim().is_empty())
            .or_else(|| service.as_ref().map(|s| s.name.clone()))
            .unwrap_or_default();
        items.push(line_item(draft.service_id, description, draft.quantity, unit_price)?);
    }
    Ok(items)
}

pub async fn create_manual_invoice(
    store: &dyn Store,
    req: ManualInvoice,
    issue_date: NaiveDate,
    now: DateTime<Utc>,
    attempts: u32,
) -> EngineResult<Invoice> {
    if req.items.is_empty() {
        return Err(EngineError::validation("items", "an invoice needs at least one line item"));
    }
    let items = resolve_items(store, req.items).await?;
    let invoice = draft_invoice(
        req.patient_id,
        None,
        issue_date,
        req.due_date,
        items,
        req.discount,
        req.tax_percentage,
        now,
    )?;
    let invoice = persist_numbered(store, invoice, None, attempts).await?;

    tracing::info!(
        invoice_id = %invoice.invoice_id,
        invoice_number = %invoice.invoice_number,
        total = %invoice.total_amount,
        "manual invoice created"
    );
    Ok(invoice)
}

pub async fn revise_invoice(
    store: &dyn Store,
    invoice_id: Uuid,
    revision: InvoiceRevision,
    now: DateTime<Utc>,
) -> EngineResult<Invoice> {
    if let Some(items) = &revision.items {
        if items.is_empty() {
            return Err(EngineError::validation("items", "an invoice needs at least one line item"));
        }
    }
    store.revise_invoice(invoice_id, &revision, now).await
}
