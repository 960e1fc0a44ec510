//! Change feed route.

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use custody_engine::PullResponse;

use crate::auth::AuthUser;
use crate::error::Result;
use crate::handlers::{handle_changes, ChangesQuery};
use crate::AppState;

/// Create change feed routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/changes", get(changes_handler))
}

/// GET /changes?since= - records changed since the cursor.
async fn changes_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Query(query): Query<ChangesQuery>,
) -> Result<Json<PullResponse>> {
    let response = handle_changes(&state.pool, query).await?;
    Ok(Json(response))
}
