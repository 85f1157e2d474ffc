// src/engine/ledger.rs
//
// Payment reconciliation. The arithmetic below is pure and is executed by the
// stores while they hold the invoice lock; the async functions validate input
// and hand the unit of work to the store.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::totals::{derive_payment_status, money, parse_money};
use super::{EngineError, EngineResult};
use crate::models::{Invoice, Payment, PaymentMethod, PaymentStatus};
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub transaction_ref: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PaymentChanges {
    pub amount: Option<Decimal>,
    pub method: Option<PaymentMethod>,
    pub transaction_ref: Option<Option<String>>,
    pub notes: Option<Option<String>>,
}

/// How a ledger change treats an operator-set REFUNDED status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundHandling {
    /// A new payment is the explicit reset: status is derived again.
    Reset,
    /// Corrections keep REFUNDED in place.
    Keep,
}

/// Move `paid_amount` by `delta` and re-derive the status.
pub fn settle(
    invoice: &mut Invoice,
    delta: Decimal,
    refund: RefundHandling,
    now: DateTime<Utc>,
) -> EngineResult<()> {
    let paid = invoice.paid_amount + delta;

    if paid < Decimal::ZERO {
        tracing::error!(
            invoice_id = %invoice.invoice_id,
            paid_amount = %invoice.paid_amount,
            delta = %delta,
            "ledger adjustment would make paid amount negative"
        );
        return Err(EngineError::DataIntegrity(format!(
            "invoice {} paid amount would become {paid}",
            invoice.invoice_id
        )));
    }
    if delta > Decimal::ZERO && paid > invoice.total_amount {
        tracing::warn!(
            invoice_id = %invoice.invoice_id,
            attempted = %delta,
            remaining = %invoice.balance_due(),
            "over-payment rejected"
        );
        return Err(EngineError::OverPayment {
            invoice_id: invoice.invoice_id,
            attempted: delta,
            remaining: money(invoice.balance_due()),
        });
    }

    invoice.paid_amount = money(paid);
    if !(invoice.payment_status == PaymentStatus::Refunded && refund == RefundHandling::Keep) {
        invoice.payment_status = derive_payment_status(invoice.paid_amount, invoice.total_amount);
    }
    invoice.updated_at = now;
    Ok(())
}

/// `paidAmount` must equal the sum of the invoice's payments.
pub fn verify_reconciled(invoice: &Invoice, payments: &[Payment]) -> EngineResult<()> {
    let sum: Decimal = payments
        .iter()
        .filter(|p| p.invoice_id == invoice.invoice_id)
        .map(|p| p.amount)
        .sum();
    if sum != invoice.paid_amount {
        return Err(EngineError::DataIntegrity(format!(
            "invoice {} records paid {} but payments sum to {sum}",
            invoice.invoice_id, invoice.paid_amount
        )));
    }
    if invoice.payment_status != PaymentStatus::Refunded
        && invoice.payment_status
            != derive_payment_status(invoice.paid_amount, invoice.total_amount)
    {
        return Err(EngineError::DataIntegrity(format!(
            "invoice {} status {} does not match its balance",
            invoice.invoice_id,
            invoice.payment_status.as_str()
        )));
    }
    Ok(())
}

fn positive_amount(amount: Decimal) -> EngineResult<Decimal> {
    let amount = parse_money("amount", amount)?;
    if amount <= Decimal::ZERO {
        return Err(EngineError::validation("amount", "payment amount must be > 0"));
    }
    Ok(amount)
}

fn clean(text: Option<String>) -> Option<String> {
    text.map(|t| t.trim().to_string()).filter(|t| !t.is_empty())
}

/// `recordPayment(invoiceId, amount, method, ref?, notes?)`.
pub async fn record_payment(
    store: &dyn Store,
    invoice_id: Uuid,
    req: NewPayment,
    received_by: Uuid,
    now: DateTime<Utc>,
) -> EngineResult<(Payment, Invoice)> {
    let payment = Payment {
        payment_id: Uuid::new_v4(),
        invoice_id,
        amount: positive_amount(req.amount)?,
        method: req.method,
        transaction_ref: clean(req.transaction_ref),
        notes: clean(req.notes),
        received_by,
        paid_at: now,
    };

    let invoice = store.record_payment(&payment, now).await?;

    tracing::info!(
        invoice_id = %invoice_id,
        payment_id = %payment.payment_id,
        amount = %payment.amount,
        paid_amount = %invoice.paid_amount,
        status = invoice.payment_status.as_str(),
        "payment recorded"
    );
    Ok((payment, invoice))
}

pub async fn update_payment(
    store: &dyn Store,
    payment_id: Uuid,
    changes: PaymentChanges,
    now: DateTime<Utc>,
) -> EngineResult<(Payment, Invoice)> {
    let mut payment = store
        .get_payment(payment_id)
        .await?
        .ok_or_else(|| EngineError::missing("payment", payment_id))?;

    if let Some(amount) = changes.amount {
        payment.amount = positive_amount(amount)?;
    }
    if let Some(method) = changes.method {
        payment.method = method;
    }
    if let Some(r) = changes.transaction_ref {
        payment.transaction_ref = clean(r);
    }
    if let Some(n) = changes.notes {
        payment.notes = clean(n);
    }

    let invoice = store.amend_payment(&payment, now).await?;

    tracing::info!(
        payment_id = %payment_id,
        invoice_id = %invoice.invoice_id,
        paid_amount = %invoice.paid_amount,
        "payment amended"
    );
    Ok((payment, invoice))
}

pub async fn delete_payment(
    store: &dyn Store,
    payment_id: Uuid,
    now: DateTime<Utc>,
) -> EngineResult<(Payment, Invoice)> {
    let (payment, invoice) = store.remove_payment(payment_id, now).await?;
    tracing::info!(
        payment_id = %payment_id,
        invoice_id = %invoice.invoice_id,
        paid_amount = %invoice.paid_amount,
        "payment deleted"
    );
    Ok((payment, invoice))
}

/// Operator override; stays REFUNDED until a new payment is recorded.
pub async fn mark_refunded(
    store: &dyn Store,
    invoice_id: Uuid,
    now: DateTime<Utc>,
) -> EngineResult<Invoice> {
    let invoice = store.mark_refunded(invoice_id, now).await?;
    tracing::info!(invoice_id = %invoice_id, "invoice marked refunded");
    Ok(invoice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::invoicing::{self, ItemDraft, ManualInvoice};
    use crate::engine::totals::Discount;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 12, 12, 0, 0).unwrap()
    }

    fn cash(amount: &str) -> NewPayment {
        NewPayment {
            amount: d(amount),
            method: PaymentMethod::Cash,
            transaction_ref: None,
            notes: None,
        }
    }

    async fn invoice_of(store: &MemoryStore, total: &str) -> Invoice {
        invoicing::create_manual_invoice(
            store,
            ManualInvoice {
                patient_id: Uuid::new_v4(),
                due_date: None,
                items: vec![ItemDraft {
                    service_id: None,
                    description: Some("Treatment".into()),
                    quantity: 1,
                    unit_price: Some(d(total)),
                }],
                discount: Discount::none(),
                tax_percentage: Decimal::ZERO,
            },
            now().date_naive(),
            now(),
            3,
        )
        .await
        .unwrap()
    }

    async fn assert_reconciled(store: &MemoryStore, invoice_id: Uuid) {
        let invoice = store.get_invoice(invoice_id).await.unwrap().unwrap();
        let payments = store.list_payments(invoice_id).await.unwrap();
        verify_reconciled(&invoice, &payments).unwrap();
    }

    #[tokio::test]
    async fn partial_then_paid() {
        let store = MemoryStore::new();
        let invoice = invoice_of(&store, "105.000").await;
        let staff = Uuid::new_v4();

        let (_, inv) = record_payment(&store, invoice.invoice_id, cash("50.000"), staff, now())
            .await
            .unwrap();
        assert_eq!(inv.payment_status, PaymentStatus::Partial);
        assert_eq!(inv.paid_amount.to_string(), "50.000");

        let (_, inv) = record_payment(&store, invoice.invoice_id, cash("55.000"), staff, now())
            .await
            .unwrap();
        assert_eq!(inv.payment_status, PaymentStatus::Paid);
        assert_eq!(inv.paid_amount, d("105"));
        assert_reconciled(&store, invoice.invoice_id).await;
    }

    #[tokio::test]
    async fn over_payment_is_rejected_without_side_effects() {
        let store = MemoryStore::new();
        let invoice = invoice_of(&store, "100.000").await;
        let staff = Uuid::new_v4();

        record_payment(&store, invoice.invoice_id, cash("60"), staff, now()).await.unwrap();
        let err = record_payment(&store, invoice.invoice_id, cash("40.001"), staff, now())
            .await
            .unwrap_err();
        match err {
            EngineError::OverPayment { remaining, .. } => assert_eq!(remaining, d("40")),
            other => panic!("expected OverPayment, got {other:?}"),
        }

        let stored = store.get_invoice(invoice.invoice_id).await.unwrap().unwrap();
        assert_eq!(stored.paid_amount, d("60"));
        assert_eq!(store.list_payments(invoice.invoice_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejects_non_positive_and_fractional_cent_amounts() {
        let store = MemoryStore::new();
        let invoice = invoice_of(&store, "10").await;
        let staff = Uuid::new_v4();
        for bad in ["0", "-1", "0.0001"] {
            let err = record_payment(&store, invoice.invoice_id, cash(bad), staff, now())
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::Validation { field: "amount", .. }), "{bad}");
        }
    }

    #[tokio::test]
    async fn unknown_invoice() {
        let store = MemoryStore::new();
        let err = record_payment(&store, Uuid::new_v4(), cash("1"), Uuid::new_v4(), now())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingReference { entity: "invoice", .. }));
    }

    #[tokio::test]
    async fn amend_and_delete_keep_the_ledger_reconciled() {
        let store = MemoryStore::new();
        let invoice = invoice_of(&store, "90").await;
        let staff = Uuid::new_v4();

        let (first, _) = record_payment(&store, invoice.invoice_id, cash("30"), staff, now())
            .await
            .unwrap();
        let (second, _) = record_payment(&store, invoice.invoice_id, cash("30"), staff, now())
            .await
            .unwrap();

        let (_, inv) = update_payment(
            &store,
            first.payment_id,
            PaymentChanges {
                amount: Some(d("60")),
                method: Some(PaymentMethod::Knet),
                transaction_ref: Some(Some("KNET-123".into())),
                ..Default::default()
            },
            now(),
        )
        .await
        .unwrap();
        assert_eq!(inv.paid_amount, d("90"));
        assert_eq!(inv.payment_status, PaymentStatus::Paid);
        assert_reconciled(&store, invoice.invoice_id).await;

        // raising it further would overpay
        let err = update_payment(
            &store,
            second.payment_id,
            PaymentChanges {
                amount: Some(d("31")),
                ..Default::default()
            },
            now(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::OverPayment { .. }));

        let (_, inv) = delete_payment(&store, second.payment_id, now()).await.unwrap();
        assert_eq!(inv.paid_amount, d("60"));
        assert_eq!(inv.payment_status, PaymentStatus::Partial);
        assert_reconciled(&store, invoice.invoice_id).await;

        let (_, inv) = delete_payment(&store, first.payment_id, now()).await.unwrap();
        assert_eq!(inv.paid_amount, Decimal::ZERO);
        assert_eq!(inv.payment_status, PaymentStatus::Pending);
        assert_reconciled(&store, invoice.invoice_id).await;

        let err = delete_payment(&store, first.payment_id, now()).await.unwrap_err();
        assert!(matches!(err, EngineError::MissingReference { entity: "payment", .. }));
    }

    #[tokio::test]
    async fn refunded_sticks_until_a_new_payment() {
        let store = MemoryStore::new();
        let invoice = invoice_of(&store, "50").await;
        let staff = Uuid::new_v4();
        let (payment, _) = record_payment(&store, invoice.invoice_id, cash("50"), staff, now())
            .await
            .unwrap();

        let refunded = mark_refunded(&store, invoice.invoice_id, now()).await.unwrap();
        assert_eq!(refunded.payment_status, PaymentStatus::Refunded);

        // partial refund: the operator lowers the recorded payment, status stays REFUNDED
        let (_, inv) = update_payment(
            &store,
            payment.payment_id,
            PaymentChanges {
                amount: Some(d("20")),
                ..Default::default()
            },
            now(),
        )
        .await
        .unwrap();
        assert_eq!(inv.payment_status, PaymentStatus::Refunded);
        assert_eq!(inv.paid_amount, d("20"));

        let (_, inv) = record_payment(&store, invoice.invoice_id, cash("10"), staff, now())
            .await
            .unwrap();
        assert_eq!(inv.payment_status, PaymentStatus::Partial);
        assert_reconciled(&store, invoice.invoice_id).await;
    }

    #[test]
    fn negative_paid_amount_is_a_data_integrity_error() {
        let mut invoice = Invoice {
            invoice_id: Uuid::new_v4(),
            invoice_number: "INV-202610-0001".into(),
            patient_id: Uuid::new_v4(),
            visit_id: None,
            issue_date: now().date_naive(),
            due_date: None,
            discount_type: Default::default(),
            discount_value: Decimal::ZERO,
            tax_percentage: Decimal::ZERO,
            subtotal: d("10"),
            discount_amount: Decimal::ZERO,
            tax_amount: Decimal::ZERO,
            total_amount: d("10"),
            paid_amount: d("5"),
            payment_status: PaymentStatus::Partial,
            items: vec![],
            created_at: now(),
            updated_at: now(),
        };
        let err = settle(&mut invoice, d("-6"), RefundHandling::Keep, now()).unwrap_err();
        assert!(matches!(err, EngineError::DataIntegrity(_)));
        assert_eq!(invoice.paid_amount, d("5"));

        settle(&mut invoice, d("-5"), RefundHandling::Keep, now()).unwrap();
        assert_eq!(invoice.payment_status, PaymentStatus::Pending);
    }
}
