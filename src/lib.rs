//! Codecheck intake service
//!
//! Accepts student submissions over HTTP, hands them to a grading engine and
//! returns the report. Structured checks also get a signed archive of the
//! submission and report, and can be relayed to a score callback.

pub mod archive;
pub mod callback;
pub mod check;
pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod invoker;
pub mod pool;
pub mod submission;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use config::Config;
pub use engine::{CommandEngine, GradingEngine};
pub use error::AppError;
pub use handlers::AppState;

/// Create the application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/check", post(handlers::check_html_handler))
        .route(
            "/checkNJS",
            get(handlers::check_structured_handler).post(handlers::check_structured_handler),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
