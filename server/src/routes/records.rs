//! Per-record write routes.

use axum::{
    extract::{Path, Query, State},
    routing::{post, put},
    Json, Router,
};
use custody_engine::Record;

use crate::auth::AuthUser;
use crate::error::Result;
use crate::handlers::{create_record, delete_record, update_record, DeleteQuery};
use crate::AppState;

/// Create record routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/tables/{table}", post(create_handler))
        .route("/tables/{table}/{id}", put(update_handler).delete(delete_handler))
}

/// POST /tables/{table} - create a record.
async fn create_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(table): Path<String>,
    Json(record): Json<Record>,
) -> Result<Json<Record>> {
    let stored = create_record(&state.pool, &table, record).await?;
    Ok(Json(stored))
}

/// PUT /tables/{table}/{id} - replace a record.
async fn update_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path((table, id)): Path<(String, String)>,
    Json(record): Json<Record>,
) -> Result<Json<Record>> {
    let stored = update_record(&state.pool, &table, &id, record).await?;
    Ok(Json(stored))
}

/// DELETE /tables/{table}/{id}?updatedAt= - tombstone a record.
async fn delete_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path((table, id)): Path<(String, String)>,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<Record>> {
    let tombstone = delete_record(&state.pool, &table, &id, query).await?;
    Ok(Json(tombstone))
}
