// src/engine/totals.rs
//
// Pure money arithmetic. All amounts are fixed-point, 3 fractional digits.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use super::{EngineError, EngineResult};
use crate::models::{DiscountType, InvoiceItem, PaymentStatus};

pub const MONEY_SCALE: u32 = 3;

/// Round to the currency's minor unit and pin the scale so amounts always
/// serialize with exactly three fractional digits.
pub fn money(value: Decimal) -> Decimal {
    let mut rounded =
        value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(MONEY_SCALE);
    rounded
}

/// Amounts must fit `numeric(14,3)`: strictly below 10^11.
pub const MONEY_LIMIT: Decimal = Decimal::from_parts(1_215_752_192, 23, 0, false, 0);

fn fits_scale(value: Decimal) -> bool {
    value.normalize().scale() <= MONEY_SCALE
}

/// Reject results that overflowed or left the storable money range.
pub fn bounded(field: &'static str, value: Option<Decimal>) -> EngineResult<Decimal> {
    match value {
        Some(v) if v.abs() < MONEY_LIMIT => Ok(money(v)),
        _ => Err(EngineError::validation(field, "amount is out of range")),
    }
}

/// Validate a caller-supplied amount: non-negative, no more than 3 decimals.
pub fn parse_money(field: &'static str, value: Decimal) -> EngineResult<Decimal> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(EngineError::validation(field, "must not be negative"));
    }
    if !fits_scale(value) {
        return Err(EngineError::validation(
            field,
            format!("at most {MONEY_SCALE} fractional digits are allowed"),
        ));
    }
    bounded(field, Some(value))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Discount {
    pub kind: DiscountType,
    pub value: Decimal,
}

impl Discount {
    pub fn none() -> Self {
        Self {
            kind: DiscountType::Flat,
            value: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct InvoiceTotals {
    pub subtotal: Decimal,
    pub discount_amount: Decimal,
    pub taxable_base: Decimal,
    pub tax_amount: Decimal,
    pub total_amount: Decimal,
}

pub fn line_item(
    service_id: Option<uuid::Uuid>,
    description: impl Into<String>,
    quantity: i32,
    unit_price: Decimal,
) -> EngineResult<InvoiceItem> {
    let description = description.into();
    if description.trim().is_empty() {
        return Err(EngineError::validation("description", "line item description is required"));
    }
    if quantity < 1 {
        return Err(EngineError::validation("quantity", "quantity must be >= 1"));
    }
    let unit_price = parse_money("unit_price", unit_price)?;
    Ok(InvoiceItem {
        service_id,
        description,
        quantity,
        unit_price,
        total_price: bounded("total_price", Decimal::from(quantity).checked_mul(unit_price))?,
    })
}

pub fn compute_totals(
    items: &[InvoiceItem],
    discount: Discount,
    tax_percentage: Decimal,
) -> EngineResult<InvoiceTotals> {
    if discount.value.is_sign_negative() && !discount.value.is_zero() {
        return Err(EngineError::validation("discount_value", "must not be negative"));
    }
    if discount.kind == DiscountType::Percentage && discount.value > Decimal::ONE_HUNDRED {
        return Err(EngineError::validation("discount_value", "percentage must be within 0..=100"));
    }
    if !fits_scale(discount.value) {
        return Err(EngineError::validation(
            "discount_value",
            format!("at most {MONEY_SCALE} fractional digits are allowed"),
        ));
    }
    if tax_percentage < Decimal::ZERO || tax_percentage > Decimal::ONE_HUNDRED {
        return Err(EngineError::validation("tax_percentage", "must be within 0..=100"));
    }
    if !fits_scale(tax_percentage) {
        return Err(EngineError::validation(
            "tax_percentage",
            format!("at most {MONEY_SCALE} fractional digits are allowed"),
        ));
    }

    let mut sum = Some(Decimal::ZERO);
    for it in items {
        sum = sum
            .zip(Decimal::from(it.quantity).checked_mul(it.unit_price))
            .and_then(|(acc, line)| acc.checked_add(line));
    }
    let subtotal = bounded("subtotal", sum)?;

    let requested = match discount.kind {
        DiscountType::Percentage => money(subtotal * discount.value / Decimal::ONE_HUNDRED),
        DiscountType::Flat => money(discount.value),
    };
    // never let the discount push the total below zero
    let discount_amount = requested.min(subtotal);

    let taxable_base = money(subtotal - discount_amount);
    let tax_amount = money(taxable_base * tax_percentage / Decimal::ONE_HUNDRED);

    Ok(InvoiceTotals {
        subtotal,
        discount_amount,
        taxable_base,
        tax_amount,
        total_amount: bounded("total_amount", taxable_base.checked_add(tax_amount))?,
    })
}

/// Single source of truth for PENDING / PARTIAL / PAID.
/// REFUNDED is never derived; it is only set by an operator.
pub fn derive_payment_status(paid_amount: Decimal, total_amount: Decimal) -> PaymentStatus {
    if paid_amount <= Decimal::ZERO {
        PaymentStatus::Pending
    } else if paid_amount < total_amount {
        PaymentStatus::Partial
    } else {
        PaymentStatus::Paid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn flat_discount_then_tax() {
        let items = vec![line_item(None, "Cleaning", 2, d("10.000")).unwrap()];
        let t = compute_totals(
            &items,
            Discount {
                kind: DiscountType::Flat,
                value: d("5"),
            },
            d("10"),
        )
        .unwrap();

        assert_eq!(t.subtotal, d("20.000"));
        assert_eq!(t.discount_amount, d("5.000"));
        assert_eq!(t.taxable_base, d("15.000"));
        assert_eq!(t.tax_amount, d("1.500"));
        assert_eq!(t.total_amount, d("16.500"));
        assert_eq!(t.total_amount.to_string(), "16.500");
    }

    #[test]
    fn percentage_discount() {
        let items = vec![
            line_item(None, "Filling", 1, d("15.000")).unwrap(),
            line_item(None, "Crown", 1, d("90.000")).unwrap(),
        ];
        let t = compute_totals(
            &items,
            Discount {
                kind: DiscountType::Percentage,
                value: d("10"),
            },
            Decimal::ZERO,
        )
        .unwrap();
        assert_eq!(t.subtotal, d("105"));
        assert_eq!(t.discount_amount, d("10.5"));
        assert_eq!(t.total_amount, d("94.5"));
    }

    #[test]
    fn discount_larger_than_subtotal_is_clamped() {
        let items = vec![line_item(None, "Consultation", 1, d("8.000")).unwrap()];
        let t = compute_totals(
            &items,
            Discount {
                kind: DiscountType::Flat,
                value: d("12.000"),
            },
            d("5"),
        )
        .unwrap();
        assert_eq!(t.discount_amount, d("8"));
        assert_eq!(t.tax_amount, Decimal::ZERO);
        assert_eq!(t.total_amount, Decimal::ZERO);
        assert_eq!(t.subtotal - t.discount_amount + t.tax_amount, t.total_amount);
    }

    #[test]
    fn thirds_round_half_away_from_zero() {
        let items = vec![line_item(None, "X-Ray", 1, d("10.000")).unwrap()];
        let t = compute_totals(&items, Discount::none(), d("33.335")).unwrap();
        // 10 * 33.335% = 3.3335 -> 3.334
        assert_eq!(t.tax_amount, d("3.334"));
        assert_eq!(t.total_amount, d("13.334"));
    }

    #[test]
    fn rejects_out_of_range_parameters() {
        let items = vec![line_item(None, "X-Ray", 1, d("1")).unwrap()];
        assert!(matches!(
            compute_totals(&items, Discount::none(), d("101")),
            Err(EngineError::Validation { field: "tax_percentage", .. })
        ));
        assert!(matches!(
            compute_totals(
                &items,
                Discount {
                    kind: DiscountType::Flat,
                    value: d("-1")
                },
                Decimal::ZERO
            ),
            Err(EngineError::Validation { field: "discount_value", .. })
        ));
    }

    #[test]
    fn line_item_validation() {
        assert!(line_item(None, "Scaling", 0, d("1")).is_err());
        assert!(line_item(None, "Scaling", 1, d("-1")).is_err());
        assert!(line_item(None, "Scaling", 1, d("1.0005")).is_err());
        assert!(line_item(None, "  ", 1, d("1")).is_err());
        let it = line_item(None, "Scaling", 3, d("2.125")).unwrap();
        assert_eq!(it.total_price.to_string(), "6.375");
    }

    #[test]
    fn status_derivation() {
        let total = d("105.000");
        assert_eq!(derive_payment_status(Decimal::ZERO, total), PaymentStatus::Pending);
        assert_eq!(derive_payment_status(d("50"), total), PaymentStatus::Partial);
        assert_eq!(derive_payment_status(d("105"), total), PaymentStatus::Paid);
        assert_eq!(derive_payment_status(d("110"), total), PaymentStatus::Paid);
    }

    #[test]
    fn money_limit_is_ten_to_the_eleventh() {
        assert_eq!(MONEY_LIMIT, d("100000000000"));
        assert!(parse_money("price", d("99999999999.999")).is_ok());
        assert!(matches!(
            parse_money("price", d("100000000000")),
            Err(EngineError::Validation { field: "price", .. })
        ));
    }

    #[test]
    fn huge_amounts_are_rejected_not_panicking() {
        assert!(matches!(
            line_item(None, "Implant", 2, d("50000000000000000000000000000")),
            Err(EngineError::Validation { field: "unit_price", .. })
        ));
        assert!(matches!(
            line_item(None, "Implant", i32::MAX, d("99999999999")),
            Err(EngineError::Validation { field: "total_price", .. })
        ));

        // items built directly, bypassing line_item
        let huge = InvoiceItem {
            service_id: None,
            description: "Implant".into(),
            quantity: 1,
            unit_price: d("1000000000000000000000000000"),
            total_price: Decimal::ZERO,
        };
        let discount = Discount {
            kind: DiscountType::Percentage,
            value: d("100"),
        };
        assert!(matches!(
            compute_totals(&[huge.clone()], discount, Decimal::ZERO),
            Err(EngineError::Validation { field: "subtotal", .. })
        ));
        let many = vec![
            InvoiceItem {
                quantity: i32::MAX,
                unit_price: Decimal::MAX,
                ..huge.clone()
            },
            huge,
        ];
        assert!(compute_totals(&many, Discount::none(), Decimal::ZERO).is_err());
    }

    #[test]
    fn tax_and_discount_scale_is_checked() {
        let items = vec![line_item(None, "X-Ray", 1, d("10")).unwrap()];
        assert!(matches!(
            compute_totals(&items, Discount::none(), d("7.1234")),
            Err(EngineError::Validation { field: "tax_percentage", .. })
        ));
        assert!(matches!(
            compute_totals(
                &items,
                Discount {
                    kind: DiscountType::Flat,
                    value: d("1.0005")
                },
                Decimal::ZERO
            ),
            Err(EngineError::Validation { field: "discount_value", .. })
        ));
        assert!(compute_totals(&items, Discount::none(), d("7.125")).is_ok());
    }
}
