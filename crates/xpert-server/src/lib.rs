//! # xpert-server — HTTP surface for the agent graph runtime
//!
//! Exposes threads, runs (background / SSE stream / wait), assistants, the
//! memory KV store and client-secret sessions over axum, wired to the
//! runtime in `xpert-core` and the persistence layer in `xpert-checkpoint`.

pub mod auth;
pub mod config;
pub mod entities;
pub mod error;
pub mod plugins;
pub mod routes;
pub mod runs;
pub mod state;

pub use config::ServerConfig;
pub use error::ServerError;
pub use routes::router;
pub use state::AppState;
