//! HTTP routing

pub mod assistants;
pub mod chatkit;
pub mod store;
pub mod threads;
pub mod runs;

use crate::auth::require_auth;
use crate::state::AppState;
use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::{middleware, Router};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

/// Build the application router
pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state);

    Router::new()
        .route("/threads", post(threads::create_thread))
        .route("/threads/search", post(threads::search_threads))
        .route(
            "/threads/:id",
            get(threads::get_thread).delete(threads::delete_thread),
        )
        .route("/threads/:id/state", get(threads::thread_state))
        .route("/threads/:id/runs", post(runs::create_run))
        .route("/threads/:id/runs/stream", post(runs::stream_run))
        .route("/threads/:id/runs/wait", post(runs::wait_run))
        .route("/threads/:id/runs/:run_id", get(runs::get_run))
        .route("/assistants/search", post(assistants::search_assistants))
        .route("/assistants/:id", get(assistants::get_assistant))
        .route("/chatkit/sessions", post(chatkit::create_session))
        .route(
            "/store/items",
            post(store::put_item).get(store::get_item).delete(store::delete_item),
        )
        .route("/store/items/search", post(store::search_items))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(state: &AppState) -> CorsLayer {
    let origins = &state.config.cors_allow_origins;
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(parsed))
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
