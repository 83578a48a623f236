//! ChatKit session endpoint: issues short-lived client secrets

use crate::auth::ClientSecret;
use crate::state::AppState;
use axum::extract::State;
use axum::Json;

/// POST /chatkit/sessions
pub async fn create_session(State(state): State<AppState>) -> Json<ClientSecret> {
    Json(state.secrets.issue())
}
