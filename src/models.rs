use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::billing::{ChargeItem, PaymentEntry};

#[derive(Clone)]
pub struct AppState {
    pub db: sqlx::PgPool,
    pub session_ttl_hours: i64,
    pub default_currency: String,
}

/* -------------------------
   Auth DTOs
--------------------------*/

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    pub device_name: Option<String>,
    pub remember_me: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub data: LoginResponseData,
}

#[derive(Debug, Serialize)]
pub struct LoginResponseData {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub user: UserProfile,
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub data: MeResponseData,
}

#[derive(Debug, Serialize)]
pub struct MeResponseData {
    pub user: UserProfile,
    pub session: SessionInfo,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub data: OkData,
}

#[derive(Debug, Serialize)]
pub struct OkData {
    pub ok: bool,
}

#[derive(Debug, Serialize)]
pub struct UserProfile {
    pub user_id: Uuid,
    pub username: String,
    pub display_name: String,
    pub role: String,
}

#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub session_token_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/* -------------------------
   Appointment lifecycle
--------------------------*/

/// Stored as TEXT in `appointment.state`. Any state may currently move to any
/// other via an explicit request; that matches the observed product behavior
/// and is deliberately not guarded here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppointmentState {
    Pending,
    Confirmed,
    Rescheduled,
    Completed,
    Cancelled,
    NoShow,
}

impl AppointmentState {
    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentState::Pending => "PENDING",
            AppointmentState::Confirmed => "CONFIRMED",
            AppointmentState::Rescheduled => "RESCHEDULED",
            AppointmentState::Completed => "COMPLETED",
            AppointmentState::Cancelled => "CANCELLED",
            AppointmentState::NoShow => "NO_SHOW",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(AppointmentState::Pending),
            "CONFIRMED" => Some(AppointmentState::Confirmed),
            "RESCHEDULED" => Some(AppointmentState::Rescheduled),
            "COMPLETED" => Some(AppointmentState::Completed),
            "CANCELLED" => Some(AppointmentState::Cancelled),
            "NO_SHOW" => Some(AppointmentState::NoShow),
            _ => None,
        }
    }
}

/* -------------------------
   DB Row Models
--------------------------*/

#[derive(Debug, sqlx::FromRow)]
pub struct UserRow {
    pub user_id: Uuid,
    pub username: String,
    pub display_name: String,
    pub password_hash: String,
    pub role: i16,
    pub is_active: bool,
}

#[derive(Debug, sqlx::FromRow)]
pub struct SessionTokenRow {
    pub session_token_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// `state` is kept raw here; handlers convert through
/// [`AppointmentState::parse`] when building responses.
#[derive(Debug, Clone, FromRow)]
pub struct AppointmentRow {
    pub appointment_id: Uuid,
    pub branch_id: Uuid,
    pub patient_id: Uuid,
    pub service_id: Uuid,
    pub specialist_id: Option<Uuid>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub duration_min: i32,
    pub state: String,
    pub channel: Option<String>,
    pub reason: Option<String>,
    pub notes: Option<String>,
    pub created_by: Option<Uuid>,
    pub updated_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One billing ledger per appointment (`appointment_id` is UNIQUE).
/// Items and payments are ordered jsonb arrays; payments are append-only.
#[derive(Debug, FromRow)]
pub struct BillingRow {
    pub billing_id: Uuid,
    pub appointment_id: Uuid,
    pub currency: String,
    pub items: sqlx::types::Json<Vec<ChargeItem>>,
    pub payments: sqlx::types::Json<Vec<PaymentEntry>>,
    pub total_cents: i64,
    pub paid_cents: i64,
    pub balance_cents: i64,
    pub status: String,
    pub updated_by: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BranchRow {
    pub branch_id: Uuid,
    pub display_name: String,
    pub address: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ServiceCatalogRow {
    pub service_id: Uuid,
    pub display_name: String,
    pub default_duration_min: Option<i32>,
    pub price_cents: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/* -------------------------
   Helpers
--------------------------*/

/// Role mapping (clinic_user.role):
/// 0 super_admin, 1 admin, 2 specialist, 3 secretary, 4 cashier
pub fn role_to_string(role: i16) -> String {
    match role {
        0 => "super_admin",
        1 => "admin",
        2 => "specialist",
        3 => "secretary",
        4 => "cashier",
        _ => "unknown",
    }
    .to_string()
}
