//! HTTP surface for subject reads and consent updates.
//!
//! Writes go straight to the consent store; the relay pipeline picks them
//! up from the change feed like any other mutation.

pub mod error;
pub mod handlers;

use std::sync::Arc;

use axum::{
    http::{header, HeaderName, Method},
    routing::get,
    Router,
};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::session::SessionSigner;
use crate::storage::{ApplicationCatalog, ConsentStore, PolicyCatalog};

pub use error::{ApiError, ApiResult, ErrorResponse};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Subject store.
    pub subjects: Arc<dyn ConsentStore>,
    /// Policy catalog.
    pub policies: Arc<dyn PolicyCatalog>,
    /// Application catalog.
    pub applications: Arc<dyn ApplicationCatalog>,
    /// Verifies bearer session tokens.
    pub sessions: Arc<SessionSigner>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::PUT, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::CONTENT_LENGTH,
            HeaderName::from_static("x-requested-with"),
            HeaderName::from_static(handlers::APPLICATION_ID_HEADER),
        ])
}

/// Builds the router; at most `max_connections` requests are served at once.
pub fn router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/policies", get(handlers::list_policies))
        .route("/users/:id", get(handlers::get_user).put(handlers::put_user))
        .route("/users/:id/policies", get(handlers::get_user_policies))
        .layer(GlobalConcurrencyLimitLayer::new(max_connections.max(1)))
        .layer(TraceLayer::new_for_http())
        .layer(cors())
        .with_state(state)
}
