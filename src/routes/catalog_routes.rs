// src/routes/catalog_routes.rs
//
// Read-only lookups backing the agenda form and the cash desk. Branch and
// service maintenance happens in an external admin tool.

use axum::{extract::State, routing::get, Json, Router};

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{AppState, BranchRow, ServiceCatalogRow},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/branches", get(list_branches))
        .route("/services", get(list_services))
}

pub async fn list_branches(
    State(state): State<AppState>,
    _auth: AuthContext,
) -> Result<Json<Vec<BranchRow>>, ApiError> {
    let rows: Vec<BranchRow> = sqlx::query_as::<_, BranchRow>(
        r#"
        SELECT branch_id, display_name, address, is_active, created_at, updated_at
        FROM branch
        WHERE is_active = true
        ORDER BY display_name ASC
        "#,
    )
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(rows))
}

pub async fn list_services(
    State(state): State<AppState>,
    _auth: AuthContext,
) -> Result<Json<Vec<ServiceCatalogRow>>, ApiError> {
    let rows: Vec<ServiceCatalogRow> = sqlx::query_as::<_, ServiceCatalogRow>(
        r#"
        SELECT service_id, display_name, default_duration_min, price_cents,
               is_active, created_at, updated_at
        FROM service_catalog
        WHERE is_active = true
        ORDER BY display_name ASC
        "#,
    )
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(rows))
}
