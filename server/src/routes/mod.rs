//! HTTP route definitions.

mod changes;
mod health;
mod records;

use crate::AppState;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create all application routes.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(records::routes())
        .merge(changes::routes())
}

/// The complete application with middleware and state.
pub fn app(state: AppState) -> Router {
    create_routes()
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
