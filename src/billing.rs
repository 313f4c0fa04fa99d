//! Pure arithmetic for the per-appointment billing ledger: item
//! normalization, derived totals and the payment-status table. All money is
//! integer cents (same convention as `service_catalog.price_cents`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;

pub const DEFAULT_PAYMENT_METHOD: &str = "CASH";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BillingError {
    #[error("the billing is already paid and cannot be modified")]
    AlreadyPaid,
    #[error("amount exceeds the supported range")]
    AmountOverflow,
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::AlreadyPaid => ApiError::conflict(e.to_string()),
            BillingError::AmountOverflow => ApiError::validation(e.to_string()),
        }
    }
}

/// Derived from (total, paid) only; never stored independently of that
/// recomputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Partial,
    Paid,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Partial => "PARTIAL",
            PaymentStatus::Paid => "PAID",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(PaymentStatus::Pending),
            "PARTIAL" => Some(PaymentStatus::Partial),
            "PAID" => Some(PaymentStatus::Paid),
            _ => None,
        }
    }
}

/// A charged service line. Serialized into the ledger's `items` jsonb column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeItem {
    pub service_id: Option<Uuid>,
    pub name: Option<String>,
    pub quantity: i32,
    pub unit_price_cents: i64,
    pub subtotal_cents: i64,
}

/// Client-submitted line. Any `subtotal_cents` the client sends is an unknown
/// field and is dropped; subtotals are always recomputed server-side.
#[derive(Debug, Clone, Deserialize)]
pub struct ChargeItemInput {
    pub service_id: Option<Uuid>,
    pub name: Option<String>,
    pub quantity: Option<i32>,
    pub unit_price_cents: Option<i64>,
}

/// One recorded payment. Serialized into the `payments` jsonb column;
/// entries are append-only and never edited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentEntry {
    pub paid_at: DateTime<Utc>,
    pub amount_cents: i64,
    pub method: String,
    pub reference: Option<String>,
}

/// Status table:
/// total <= 0            -> PENDING
/// paid  <= 0            -> PENDING
/// 0 < paid < total      -> PARTIAL
/// paid >= total         -> PAID
pub fn derive_status(total_cents: i64, paid_cents: i64) -> PaymentStatus {
    if total_cents <= 0 {
        return PaymentStatus::Pending;
    }
    if paid_cents <= 0 {
        return PaymentStatus::Pending;
    }
    if paid_cents >= total_cents {
        PaymentStatus::Paid
    } else {
        PaymentStatus::Partial
    }
}

/// Outstanding amount; never negative even when overpaid.
pub fn balance_cents(total_cents: i64, paid_cents: i64) -> i64 {
    (total_cents - paid_cents).max(0)
}

/// A PAID ledger is immutable: items and payments both reject.
pub fn ensure_mutable(status: PaymentStatus) -> Result<(), BillingError> {
    if status == PaymentStatus::Paid {
        Err(BillingError::AlreadyPaid)
    } else {
        Ok(())
    }
}

/// Clamps quantity to >= 1 (defaulting to 1), unit price to >= 0
/// (defaulting to 0), and recomputes every subtotal. Subtotals that do not
/// fit in i64 cents reject rather than wrap.
pub fn normalize_items(inputs: &[ChargeItemInput]) -> Result<Vec<ChargeItem>, BillingError> {
    inputs
        .iter()
        .map(|i| {
            let quantity = match i.quantity {
                Some(q) if q > 0 => q,
                _ => 1,
            };
            let unit_price_cents = i.unit_price_cents.unwrap_or(0).max(0);
            let subtotal_cents = unit_price_cents
                .checked_mul(quantity as i64)
                .ok_or(BillingError::AmountOverflow)?;
            Ok(ChargeItem {
                service_id: i.service_id,
                name: i.name.clone(),
                quantity,
                unit_price_cents,
                subtotal_cents,
            })
        })
        .collect()
}

pub fn items_total_cents(items: &[ChargeItem]) -> Result<i64, BillingError> {
    items.iter().try_fold(0i64, |acc, i| {
        acc.checked_add(i.subtotal_cents)
            .ok_or(BillingError::AmountOverflow)
    })
}

/// New running paid total after a payment is recorded.
pub fn accumulate_paid(paid_cents: i64, amount_cents: i64) -> Result<i64, BillingError> {
    paid_cents
        .checked_add(amount_cents)
        .ok_or(BillingError::AmountOverflow)
}

/// Upper-cases the method, falling back to CASH when absent or blank.
pub fn normalize_method(method: Option<&str>) -> String {
    match method {
        Some(m) if !m.trim().is_empty() => m.trim().to_uppercase(),
        _ => DEFAULT_PAYMENT_METHOD.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(quantity: Option<i32>, unit_price_cents: Option<i64>) -> ChargeItemInput {
        ChargeItemInput {
            service_id: None,
            name: Some("Consultation".into()),
            quantity,
            unit_price_cents,
        }
    }

    #[test]
    fn status_table() {
        assert_eq!(derive_status(0, 0), PaymentStatus::Pending);
        assert_eq!(derive_status(0, 5000), PaymentStatus::Pending);
        assert_eq!(derive_status(-100, 50), PaymentStatus::Pending);
        assert_eq!(derive_status(10000, 0), PaymentStatus::Pending);
        assert_eq!(derive_status(10000, -1), PaymentStatus::Pending);
        assert_eq!(derive_status(10000, 1), PaymentStatus::Partial);
        assert_eq!(derive_status(10000, 9999), PaymentStatus::Partial);
        assert_eq!(derive_status(10000, 10000), PaymentStatus::Paid);
        assert_eq!(derive_status(10000, 15000), PaymentStatus::Paid);
    }

    #[test]
    fn balance_never_negative() {
        assert_eq!(balance_cents(10000, 2500), 7500);
        assert_eq!(balance_cents(10000, 10000), 0);
        assert_eq!(balance_cents(10000, 12000), 0);
        assert_eq!(balance_cents(0, 500), 0);
    }

    #[test]
    fn items_are_renormalized() {
        let out = normalize_items(&[
            item(Some(2), Some(5000)),
            item(Some(0), Some(300)),  // quantity clamps to 1
            item(None, Some(300)),     // missing quantity defaults to 1
            item(Some(3), None),       // missing price defaults to 0
            item(Some(1), Some(-250)), // negative price clamps to 0
        ])
        .unwrap();
        assert_eq!(out[0].subtotal_cents, 10000);
        assert_eq!(out[1].quantity, 1);
        assert_eq!(out[1].subtotal_cents, 300);
        assert_eq!(out[2].subtotal_cents, 300);
        assert_eq!(out[3].subtotal_cents, 0);
        assert_eq!(out[4].unit_price_cents, 0);
        assert_eq!(items_total_cents(&out).unwrap(), 10600);
    }

    #[test]
    fn client_subtotal_is_discarded() {
        // Unknown fields are ignored on deserialization, so a forged
        // subtotal never reaches the ledger.
        let input: ChargeItemInput = serde_json::from_value(serde_json::json!({
            "service_id": null,
            "name": "X-Ray",
            "quantity": 2,
            "unit_price_cents": 1500,
            "subtotal_cents": 1
        }))
        .unwrap();
        let out = normalize_items(&[input]).unwrap();
        assert_eq!(out[0].subtotal_cents, 3000);
    }

    #[test]
    fn instalment_scenario() {
        // Two items: qty 2 @ 50.00 and qty 1 @ 25.00 -> total 125.00.
        let items =
            normalize_items(&[item(Some(2), Some(5000)), item(Some(1), Some(2500))]).unwrap();
        let total = items_total_cents(&items).unwrap();
        assert_eq!(total, 12500);

        let paid = accumulate_paid(0, 5000).unwrap();
        assert_eq!(balance_cents(total, paid), 7500);
        assert_eq!(derive_status(total, paid), PaymentStatus::Partial);

        let paid = accumulate_paid(paid, 7500).unwrap();
        assert_eq!(balance_cents(total, paid), 0);
        assert_eq!(derive_status(total, paid), PaymentStatus::Paid);

        // Fully paid: neither an item rewrite nor another payment may touch
        // the ledger now.
        assert_eq!(
            ensure_mutable(derive_status(total, paid)),
            Err(BillingError::AlreadyPaid)
        );
    }

    #[test]
    fn paid_ledger_rejects_mutation() {
        assert_eq!(ensure_mutable(PaymentStatus::Pending), Ok(()));
        assert_eq!(ensure_mutable(PaymentStatus::Partial), Ok(()));
        assert_eq!(
            ensure_mutable(PaymentStatus::Paid),
            Err(BillingError::AlreadyPaid)
        );
    }

    #[test]
    fn oversized_amounts_reject_instead_of_wrapping() {
        assert_eq!(
            normalize_items(&[item(Some(i32::MAX), Some(i64::MAX))]),
            Err(BillingError::AmountOverflow)
        );

        let big = normalize_items(&[item(Some(1), Some(i64::MAX))]).unwrap();
        let two = [big[0].clone(), big[0].clone()];
        assert_eq!(items_total_cents(&two), Err(BillingError::AmountOverflow));

        assert_eq!(
            accumulate_paid(i64::MAX, 1),
            Err(BillingError::AmountOverflow)
        );
        assert_eq!(accumulate_paid(12000, 500), Ok(12500));
    }

    #[test]
    fn method_normalization() {
        assert_eq!(normalize_method(Some("card")), "CARD");
        assert_eq!(normalize_method(Some("  transfer ")), "TRANSFER");
        assert_eq!(normalize_method(Some("   ")), "CASH");
        assert_eq!(normalize_method(None), "CASH");
    }

    #[test]
    fn payment_entry_roundtrips_through_json() {
        let e = PaymentEntry {
            paid_at: chrono::Utc::now(),
            amount_cents: 5000,
            method: "CARD".into(),
            reference: Some("voucher-17".into()),
        };
        let v = serde_json::to_value(&e).unwrap();
        let back: PaymentEntry = serde_json::from_value(v).unwrap();
        assert_eq!(back, e);
    }
}
