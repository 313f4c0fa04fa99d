// src/routes/billing_routes.rs
//
// Cash desk: one billing ledger per appointment, created lazily on first
// access. Items are replaced wholesale; payments are append-only. A ledger
// whose status reached PAID is immutable.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json as SqlJson;
use uuid::Uuid;

use crate::{
    billing::{
        accumulate_paid, balance_cents, derive_status, ensure_mutable, items_total_cents,
        normalize_items, normalize_method, ChargeItem, ChargeItemInput, PaymentEntry,
        PaymentStatus,
    },
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{AppState, BillingRow},
};

fn can_use_cash_desk(auth: &AuthContext) -> bool {
    // super_admin, admin, secretary, cashier
    matches!(auth.role, 0 | 1 | 3 | 4)
}

fn ensure_cash_desk(auth: &AuthContext) -> Result<(), ApiError> {
    if can_use_cash_desk(auth) {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Only admin/secretary/cashier can use the cash desk".into(),
        ))
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/appointments/{appointment_id}/billing",
            get(get_or_create_billing).put(upsert_billing_items),
        )
        .route(
            "/appointments/{appointment_id}/billing/payments",
            post(record_payment),
        )
}

/* ============================================================
   DTOs
   ============================================================ */

#[derive(Debug, Serialize)]
pub struct ApiOk<T> {
    pub data: T,
}

#[derive(Debug, Serialize)]
pub struct BillingDto {
    pub billing_id: Uuid,
    pub appointment_id: Uuid,
    pub currency: String,
    pub items: Vec<ChargeItem>,
    pub payments: Vec<PaymentEntry>,
    pub total_cents: i64,
    pub paid_cents: i64,
    pub balance_cents: i64,
    pub status: PaymentStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct UpsertItemsRequest {
    pub currency: Option<String>,
    pub items: Option<Vec<ChargeItemInput>>,
}

#[derive(Debug, Deserialize)]
pub struct RecordPaymentRequest {
    pub amount_cents: Option<i64>,
    pub method: Option<String>,
    pub reference: Option<String>,
}

fn to_dto(row: BillingRow) -> Result<BillingDto, ApiError> {
    let status = PaymentStatus::parse(&row.status)
        .ok_or_else(|| ApiError::Internal(format!("unknown payment status: {}", row.status)))?;
    Ok(BillingDto {
        billing_id: row.billing_id,
        appointment_id: row.appointment_id,
        currency: row.currency,
        items: row.items.0,
        payments: row.payments.0,
        total_cents: row.total_cents,
        paid_cents: row.paid_cents,
        balance_cents: row.balance_cents,
        status,
        updated_at: row.updated_at,
    })
}

const SELECT_BILLING: &str = r#"
    SELECT billing_id, appointment_id, currency, items, payments,
           total_cents, paid_cents, balance_cents, status,
           updated_by, updated_at
    FROM appointment_billing
"#;

/* ============================================================
   GET /appointments/{id}/billing (get-or-create)
   ============================================================ */

pub async fn get_or_create_billing(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<BillingDto>>, ApiError> {
    ensure_cash_desk(&auth)?;

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;
    let row = load_billing_for_update(&mut tx, appointment_id, &auth, &state.default_currency).await?;
    tx.commit().await.map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: to_dto(row)? }))
}

/* ============================================================
   PUT /appointments/{id}/billing (replace items, recompute)
   ============================================================ */

pub async fn upsert_billing_items(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
    Json(req): Json<UpsertItemsRequest>,
) -> Result<Json<ApiOk<BillingDto>>, ApiError> {
    ensure_cash_desk(&auth)?;

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;
    let row = load_billing_for_update(&mut tx, appointment_id, &auth, &state.default_currency).await?;

    let status = PaymentStatus::parse(&row.status)
        .ok_or_else(|| ApiError::Internal(format!("unknown payment status: {}", row.status)))?;
    ensure_mutable(status)?;

    let items = normalize_items(&req.items.unwrap_or_default())?;
    let total = items_total_cents(&items)?;
    let balance = balance_cents(total, row.paid_cents);
    let new_status = derive_status(total, row.paid_cents);

    let currency = match req.currency.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        Some(c) => c.to_uppercase(),
        None => row.currency.clone(),
    };

    let row: BillingRow = sqlx::query_as::<_, BillingRow>(
        r#"
        UPDATE appointment_billing
        SET currency = $2,
            items = $3,
            total_cents = $4,
            balance_cents = $5,
            status = $6,
            updated_by = $7,
            updated_at = now()
        WHERE billing_id = $1
        RETURNING billing_id, appointment_id, currency, items, payments,
                  total_cents, paid_cents, balance_cents, status,
                  updated_by, updated_at
        "#,
    )
    .bind(row.billing_id)
    .bind(currency)
    .bind(SqlJson(&items))
    .bind(total)
    .bind(balance)
    .bind(new_status.as_str())
    .bind(auth.user_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: to_dto(row)? }))
}

/* ============================================================
   POST /appointments/{id}/billing/payments (record a payment)
   ============================================================ */

pub async fn record_payment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
    Json(req): Json<RecordPaymentRequest>,
) -> Result<Json<ApiOk<BillingDto>>, ApiError> {
    ensure_cash_desk(&auth)?;

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;
    let row = load_billing_for_update(&mut tx, appointment_id, &auth, &state.default_currency).await?;

    let status = PaymentStatus::parse(&row.status)
        .ok_or_else(|| ApiError::Internal(format!("unknown payment status: {}", row.status)))?;
    ensure_mutable(status)?;

    let amount = match req.amount_cents {
        Some(a) if a > 0 => a,
        _ => return Err(ApiError::validation("amount_cents must be greater than 0")),
    };

    let mut payments = row.payments.0.clone();
    payments.push(PaymentEntry {
        paid_at: Utc::now(),
        amount_cents: amount,
        method: normalize_method(req.method.as_deref()),
        reference: req.reference.clone(),
    });

    let paid = accumulate_paid(row.paid_cents, amount)?;
    let balance = balance_cents(row.total_cents, paid);
    let new_status = derive_status(row.total_cents, paid);

    let row: BillingRow = sqlx::query_as::<_, BillingRow>(
        r#"
        UPDATE appointment_billing
        SET payments = $2,
            paid_cents = $3,
            balance_cents = $4,
            status = $5,
            updated_by = $6,
            updated_at = now()
        WHERE billing_id = $1
        RETURNING billing_id, appointment_id, currency, items, payments,
                  total_cents, paid_cents, balance_cents, status,
                  updated_by, updated_at
        "#,
    )
    .bind(row.billing_id)
    .bind(SqlJson(&payments))
    .bind(paid)
    .bind(balance)
    .bind(new_status.as_str())
    .bind(auth.user_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: to_dto(row)? }))
}

/* ============================================================
   Helpers
   ============================================================ */

/// Loads the appointment's ledger with a row lock, creating an empty one on
/// first access. Appointment existence is checked once, only on the creation
/// path; the insert is `ON CONFLICT DO NOTHING` so two concurrent first
/// accesses converge on the same row.
async fn load_billing_for_update(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    appointment_id: Uuid,
    auth: &AuthContext,
    default_currency: &str,
) -> Result<BillingRow, ApiError> {
    let existing: Option<BillingRow> = sqlx::query_as::<_, BillingRow>(&format!(
        "{SELECT_BILLING} WHERE appointment_id = $1 FOR UPDATE"
    ))
    .bind(appointment_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(ApiError::db)?;

    if let Some(row) = existing {
        return Ok(row);
    }

    let appointment_exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM appointment WHERE appointment_id = $1)",
    )
    .bind(appointment_id)
    .fetch_one(&mut **tx)
    .await
    .map_err(ApiError::db)?;

    if !appointment_exists {
        return Err(ApiError::not_found("appointment not found"));
    }

    let inserted: Option<BillingRow> = sqlx::query_as::<_, BillingRow>(
        r#"
        INSERT INTO appointment_billing (appointment_id, currency, created_by, updated_by)
        VALUES ($1, $2, $3, $3)
        ON CONFLICT (appointment_id) DO NOTHING
        RETURNING billing_id, appointment_id, currency, items, payments,
                  total_cents, paid_cents, balance_cents, status,
                  updated_by, updated_at
        "#,
    )
    .bind(appointment_id)
    .bind(default_currency)
    .bind(auth.user_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(ApiError::db)?;

    if let Some(row) = inserted {
        return Ok(row);
    }

    // Lost the creation race to a concurrent request; the row exists now.
    sqlx::query_as::<_, BillingRow>(&format!(
        "{SELECT_BILLING} WHERE appointment_id = $1 FOR UPDATE"
    ))
    .bind(appointment_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::Internal("billing row missing after creation race".into()))
}
