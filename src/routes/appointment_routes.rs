// src/routes/appointment_routes.rs

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, patch},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{AppState, AppointmentRow, AppointmentState},
    scheduling::normalize_range,
};

/*
Roles (clinic_user.role):
0 super_admin
1 admin
2 specialist
3 secretary
4 cashier
*/

fn can_manage_agenda(auth: &AuthContext) -> bool {
    matches!(auth.role, 0 | 1 | 2 | 3)
}

fn ensure_agenda(auth: &AuthContext) -> Result<(), ApiError> {
    if can_manage_agenda(auth) {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Only admin/specialist/secretary can manage the agenda".into(),
        ))
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/appointments", get(list_appointments).post(create_appointment))
        .route(
            "/appointments/{appointment_id}",
            get(get_appointment).put(edit_appointment),
        )
        .route("/appointments/{appointment_id}/state", patch(change_state))
}

/* ============================================================
   DTOs
   ============================================================ */

#[derive(Debug, Serialize)]
pub struct ApiOk<T> {
    pub data: T,
}

#[derive(Debug, Serialize)]
pub struct AppointmentDto {
    pub appointment_id: Uuid,
    pub branch_id: Uuid,
    pub patient_id: Uuid,
    pub service_id: Uuid,
    pub specialist_id: Option<Uuid>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub duration_min: i32,
    pub state: AppointmentState,
    pub channel: Option<String>,
    pub reason: Option<String>,
    pub notes: Option<String>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_by: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

fn to_dto(row: AppointmentRow) -> Result<AppointmentDto, ApiError> {
    let state = AppointmentState::parse(&row.state)
        .ok_or_else(|| ApiError::Internal(format!("unknown appointment state: {}", row.state)))?;
    Ok(AppointmentDto {
        appointment_id: row.appointment_id,
        branch_id: row.branch_id,
        patient_id: row.patient_id,
        service_id: row.service_id,
        specialist_id: row.specialist_id,
        start_at: row.start_at,
        end_at: row.end_at,
        duration_min: row.duration_min,
        state,
        channel: row.channel,
        reason: row.reason,
        notes: row.notes,
        created_by: row.created_by,
        created_at: row.created_at,
        updated_by: row.updated_by,
        updated_at: row.updated_at,
    })
}

/// Shared request body for create and edit.
///
/// Per-field partial-update semantics on edit:
/// - `specialist_id` is double-optional: omitted = keep, `null` = remove,
///   value = assign.
/// - every other field: omitted or `null` = keep the stored value.
/// - supplying any of `start_at` / `end_at` / `duration_min` recomputes the
///   whole window (a positive `duration_min` wins over `end_at`).
#[derive(Debug, Deserialize)]
pub struct AppointmentRequest {
    pub branch_id: Option<Uuid>,
    pub patient_id: Option<Uuid>,
    pub service_id: Option<Uuid>,
    #[serde(default, deserialize_with = "double_option")]
    pub specialist_id: Option<Option<Uuid>>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub duration_min: Option<i32>,
    pub channel: Option<String>,
    pub reason: Option<String>,
    pub notes: Option<String>,
    pub state: Option<AppointmentState>,
}

#[derive(Debug, Deserialize)]
pub struct ChangeStateRequest {
    pub state: Option<AppointmentState>,
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub branch_id: Option<Uuid>,
}

/// Distinguishes an omitted field from an explicit `null`:
/// missing -> `None` (via serde default), `null` -> `Some(None)`,
/// value -> `Some(Some(v))`.
fn double_option<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

const SELECT_APPOINTMENT: &str = r#"
    SELECT appointment_id, branch_id, patient_id, service_id, specialist_id,
           start_at, end_at, duration_min, state, channel, reason, notes,
           created_by, updated_by, created_at, updated_at
    FROM appointment
"#;

/* ============================================================
   GET /appointments?from&to&branch_id
   ============================================================ */

pub async fn list_appointments(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<ListQuery>,
) -> Result<Json<ApiOk<Vec<AppointmentDto>>>, ApiError> {
    ensure_agenda(&auth)?;

    let (Some(from), Some(to)) = (q.from, q.to) else {
        return Err(ApiError::validation("from and to are required"));
    };

    let rows: Vec<AppointmentRow> = sqlx::query_as::<_, AppointmentRow>(&format!(
        r#"{SELECT_APPOINTMENT}
        WHERE start_at >= $1
          AND start_at <= $2
          AND ($3::uuid IS NULL OR branch_id = $3)
        ORDER BY start_at ASC
        "#
    ))
    .bind(from)
    .bind(to)
    .bind(q.branch_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    let data = rows.into_iter().map(to_dto).collect::<Result<_, _>>()?;
    Ok(Json(ApiOk { data }))
}

/* ============================================================
   GET /appointments/{id}
   ============================================================ */

pub async fn get_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<AppointmentDto>>, ApiError> {
    ensure_agenda(&auth)?;

    let row: AppointmentRow = sqlx::query_as::<_, AppointmentRow>(&format!(
        "{SELECT_APPOINTMENT} WHERE appointment_id = $1"
    ))
    .bind(appointment_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("appointment not found"))?;

    Ok(Json(ApiOk { data: to_dto(row)? }))
}

/* ============================================================
   POST /appointments (create)
   ============================================================ */

pub async fn create_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<AppointmentRequest>,
) -> Result<(StatusCode, Json<ApiOk<AppointmentDto>>), ApiError> {
    ensure_agenda(&auth)?;

    let branch_id = req
        .branch_id
        .ok_or_else(|| ApiError::validation("branch_id is required"))?;
    let patient_id = req
        .patient_id
        .ok_or_else(|| ApiError::validation("patient_id is required"))?;
    let service_id = req
        .service_id
        .ok_or_else(|| ApiError::validation("service_id is required"))?;

    let range = normalize_range(req.start_at, req.end_at, req.duration_min)?;
    let specialist_id = req.specialist_id.flatten();
    let appt_state = req.state.unwrap_or(AppointmentState::Pending);

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    if let Some(sp) = specialist_id {
        if specialist_has_overlap(&mut *tx, sp, range.start_at, range.end_at, None).await? {
            return Err(overlap_conflict());
        }
    }

    let row: AppointmentRow = sqlx::query_as::<_, AppointmentRow>(
        r#"
        INSERT INTO appointment (
          branch_id, patient_id, service_id, specialist_id,
          start_at, end_at, duration_min, state,
          channel, reason, notes,
          created_by, updated_by
        )
        VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$12)
        RETURNING appointment_id, branch_id, patient_id, service_id, specialist_id,
                  start_at, end_at, duration_min, state, channel, reason, notes,
                  created_by, updated_by, created_at, updated_at
        "#,
    )
    .bind(branch_id)
    .bind(patient_id)
    .bind(service_id)
    .bind(specialist_id)
    .bind(range.start_at)
    .bind(range.end_at)
    .bind(range.duration_min)
    .bind(appt_state.as_str())
    .bind(req.channel.as_deref().and_then(norm))
    .bind(req.reason.as_deref().and_then(norm))
    .bind(req.notes.as_deref().and_then(norm))
    .bind(auth.user_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(map_write_err)?;

    tx.commit().await.map_err(map_write_err)?;

    Ok((StatusCode::CREATED, Json(ApiOk { data: to_dto(row)? })))
}

/* ============================================================
   PUT /appointments/{id} (edit, partial-update semantics)
   ============================================================ */

pub async fn edit_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
    Json(req): Json<AppointmentRequest>,
) -> Result<Json<ApiOk<AppointmentDto>>, ApiError> {
    ensure_agenda(&auth)?;

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    // Row lock for the whole read-modify-write; a concurrent editor waits
    // here instead of silently losing its update.
    let old: AppointmentRow = sqlx::query_as::<_, AppointmentRow>(&format!(
        "{SELECT_APPOINTMENT} WHERE appointment_id = $1 FOR UPDATE"
    ))
    .bind(appointment_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("appointment not found"))?;

    let old_state = AppointmentState::parse(&old.state)
        .ok_or_else(|| ApiError::Internal(format!("unknown appointment state: {}", old.state)))?;

    let branch_id = req.branch_id.unwrap_or(old.branch_id);
    let patient_id = req.patient_id.unwrap_or(old.patient_id);
    let service_id = req.service_id.unwrap_or(old.service_id);
    let specialist_id = match req.specialist_id {
        None => old.specialist_id, // field omitted: keep
        Some(v) => v,              // explicit null removes, value assigns
    };

    let channel = match req.channel.as_deref() {
        Some(s) => norm(s),
        None => old.channel.clone(),
    };
    let reason = match req.reason.as_deref() {
        Some(s) => norm(s),
        None => old.reason.clone(),
    };
    let notes = match req.notes.as_deref() {
        Some(s) => norm(s),
        None => old.notes.clone(),
    };

    let touches_window =
        req.start_at.is_some() || req.end_at.is_some() || req.duration_min.is_some();

    let (new_start, new_end, new_dur) = if touches_window {
        let start = req.start_at.unwrap_or(old.start_at);
        let r = normalize_range(Some(start), req.end_at, req.duration_min)?;
        (r.start_at, r.end_at, r.duration_min)
    } else {
        (old.start_at, old.end_at, old.duration_min)
    };

    let window_changed =
        touches_window && (new_start != old.start_at || new_end != old.end_at);
    let specialist_changed = specialist_id != old.specialist_id;

    // RESCHEDULED only makes sense together with an actual time change.
    if req.state == Some(AppointmentState::Rescheduled) && !window_changed {
        return Err(ApiError::validation(
            "state RESCHEDULED requires changing the date, time or duration",
        ));
    }

    if let Some(sp) = specialist_id {
        if window_changed || specialist_changed {
            if specialist_has_overlap(&mut *tx, sp, new_start, new_end, Some(appointment_id))
                .await?
            {
                return Err(overlap_conflict());
            }
        }
    }

    let final_state = resolve_final_state(req.state, old_state, window_changed);

    let row: AppointmentRow = sqlx::query_as::<_, AppointmentRow>(
        r#"
        UPDATE appointment
        SET branch_id = $2,
            patient_id = $3,
            service_id = $4,
            specialist_id = $5,
            start_at = $6,
            end_at = $7,
            duration_min = $8,
            state = $9,
            channel = $10,
            reason = $11,
            notes = $12,
            updated_by = $13,
            updated_at = now()
        WHERE appointment_id = $1
        RETURNING appointment_id, branch_id, patient_id, service_id, specialist_id,
                  start_at, end_at, duration_min, state, channel, reason, notes,
                  created_by, updated_by, created_at, updated_at
        "#,
    )
    .bind(appointment_id)
    .bind(branch_id)
    .bind(patient_id)
    .bind(service_id)
    .bind(specialist_id)
    .bind(new_start)
    .bind(new_end)
    .bind(new_dur)
    .bind(final_state.as_str())
    .bind(channel)
    .bind(reason)
    .bind(notes)
    .bind(auth.user_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(map_write_err)?;

    tx.commit().await.map_err(map_write_err)?;

    Ok(Json(ApiOk { data: to_dto(row)? }))
}

/* ============================================================
   PATCH /appointments/{id}/state
   ============================================================ */

pub async fn change_state(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
    Json(req): Json<ChangeStateRequest>,
) -> Result<Json<ApiOk<AppointmentDto>>, ApiError> {
    ensure_agenda(&auth)?;

    let new_state = req
        .state
        .ok_or_else(|| ApiError::validation("state is required"))?;

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let old: AppointmentRow = sqlx::query_as::<_, AppointmentRow>(&format!(
        "{SELECT_APPOINTMENT} WHERE appointment_id = $1 FOR UPDATE"
    ))
    .bind(appointment_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("appointment not found"))?;

    // A non-blank note is appended to the history, never overwriting it.
    let notes = match req.note.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        Some(n) => Some(append_note(old.notes.as_deref(), n)),
        None => old.notes.clone(),
    };

    let row: AppointmentRow = sqlx::query_as::<_, AppointmentRow>(
        r#"
        UPDATE appointment
        SET state = $2,
            notes = $3,
            updated_by = $4,
            updated_at = now()
        WHERE appointment_id = $1
        RETURNING appointment_id, branch_id, patient_id, service_id, specialist_id,
                  start_at, end_at, duration_min, state, channel, reason, notes,
                  created_by, updated_by, created_at, updated_at
        "#,
    )
    .bind(appointment_id)
    .bind(new_state.as_str())
    .bind(notes)
    .bind(auth.user_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(map_write_err)?;

    // Leaving CANCELLED re-enters the window into the exclusion index, so
    // this commit can collide like create/edit do.
    tx.commit().await.map_err(map_write_err)?;

    Ok(Json(ApiOk { data: to_dto(row)? }))
}

/* ============================================================
   Helpers
   ============================================================ */

/// True when the specialist already holds a non-CANCELLED appointment whose
/// half-open window intersects [start_at, end_at). Runs on the caller's
/// transaction so the check stays atomic with the subsequent write.
async fn specialist_has_overlap<'e, E>(
    exec: E,
    specialist_id: Uuid,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    exclude_appointment_id: Option<Uuid>,
) -> Result<bool, ApiError>
where
    E: sqlx::PgExecutor<'e>,
{
    let exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
          SELECT 1
          FROM appointment
          WHERE specialist_id = $1
            AND state <> 'CANCELLED'
            AND start_at < $3
            AND end_at > $2
            AND ($4::uuid IS NULL OR appointment_id <> $4)
        )
        "#,
    )
    .bind(specialist_id)
    .bind(start_at)
    .bind(end_at)
    .bind(exclude_appointment_id)
    .fetch_one(exec)
    .await
    .map_err(ApiError::db)?;

    Ok(exists)
}

fn overlap_conflict() -> ApiError {
    ApiError::conflict("The specialist already has an appointment in that time window")
}

/// SQLSTATEs Postgres raises when the specialist-window exclusion
/// constraint (or a unique index) rejects a write.
fn is_window_collision(code: Option<&str>) -> bool {
    matches!(code, Some("23P01") | Some("23505"))
}

/// The exclusion constraint on (specialist_id, window) backstops the overlap
/// check; a violation means another writer won the race, not a server bug.
fn map_write_err(e: sqlx::Error) -> ApiError {
    if let Some(db) = e.as_database_error() {
        if is_window_collision(db.code().as_deref()) {
            return overlap_conflict();
        }
    }
    ApiError::db(e)
}

/// Explicit request state wins; otherwise a window change auto-marks the
/// appointment RESCHEDULED, and an untouched window keeps the stored state.
fn resolve_final_state(
    requested: Option<AppointmentState>,
    current: AppointmentState,
    window_changed: bool,
) -> AppointmentState {
    match requested {
        Some(s) => s,
        None if window_changed => AppointmentState::Rescheduled,
        None => current,
    }
}

fn append_note(existing: Option<&str>, note: &str) -> String {
    match existing.map(str::trim).filter(|s| !s.is_empty()) {
        Some(prev) => format!("{prev}\n{note}"),
        None => note.to_string(),
    }
}

/// Trims and collapses internal whitespace; blank input becomes NULL.
fn norm(v: &str) -> Option<String> {
    let s = v.split_whitespace().collect::<Vec<_>>().join(" ");
    if s.is_empty() { None } else { Some(s) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn explicit_state_wins_over_auto_reschedule() {
        assert_eq!(
            resolve_final_state(Some(AppointmentState::Confirmed), AppointmentState::Pending, true),
            AppointmentState::Confirmed
        );
    }

    #[test]
    fn window_change_auto_reschedules() {
        assert_eq!(
            resolve_final_state(None, AppointmentState::Confirmed, true),
            AppointmentState::Rescheduled
        );
    }

    #[test]
    fn untouched_window_keeps_state() {
        assert_eq!(
            resolve_final_state(None, AppointmentState::Confirmed, false),
            AppointmentState::Confirmed
        );
    }

    #[test]
    fn notes_accumulate_with_newlines() {
        assert_eq!(append_note(None, "patient called"), "patient called");
        assert_eq!(append_note(Some(""), "first"), "first");
        assert_eq!(
            append_note(Some("first"), "second"),
            "first\nsecond"
        );
    }

    #[test]
    fn norm_collapses_whitespace_and_drops_blanks() {
        assert_eq!(norm("  walk  in "), Some("walk in".to_string()));
        assert_eq!(norm("   "), None);
        assert_eq!(norm(""), None);
    }

    #[test]
    fn specialist_field_distinguishes_omitted_from_null() {
        let omitted: AppointmentRequest = serde_json::from_value(json!({})).unwrap();
        assert_eq!(omitted.specialist_id, None);

        let removed: AppointmentRequest =
            serde_json::from_value(json!({ "specialist_id": null })).unwrap();
        assert_eq!(removed.specialist_id, Some(None));

        let id = Uuid::new_v4();
        let assigned: AppointmentRequest =
            serde_json::from_value(json!({ "specialist_id": id })).unwrap();
        assert_eq!(assigned.specialist_id, Some(Some(id)));
    }

    #[test]
    fn constraint_violations_map_to_conflict() {
        // Exclusion (23P01) and unique (23505) violations are scheduling
        // races, not server bugs; anything else stays internal.
        assert!(is_window_collision(Some("23P01")));
        assert!(is_window_collision(Some("23505")));
        assert!(!is_window_collision(Some("23503")));
        assert!(!is_window_collision(Some("40001")));
        assert!(!is_window_collision(None));
    }

    #[test]
    fn state_values_use_wire_names() {
        let req: AppointmentRequest =
            serde_json::from_value(json!({ "state": "NO_SHOW" })).unwrap();
        assert_eq!(req.state, Some(AppointmentState::NoShow));
        assert!(serde_json::from_value::<AppointmentRequest>(json!({ "state": "DONE" })).is_err());
    }
}
