//! Request-level errors and their HTTP rendering

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

/// Body returned by both endpoints on failure
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Request body or fields could not be turned into a submission
    #[error("malformed input: {0}")]
    MalformedInput(String),
    /// The grading engine could not be launched or failed mid-run
    #[error("grading engine failed")]
    Engine(#[source] anyhow::Error),
    /// The engine answered, but not with a usable structured report
    #[error("grading engine returned an invalid report")]
    EngineOutput(#[source] anyhow::Error),
    /// Report archive could not be built
    #[error("report archive could not be built")]
    Archive(#[source] anyhow::Error),
    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::MalformedInput(_) => StatusCode::BAD_REQUEST,
            AppError::Engine(_) | AppError::EngineOutput(_) => StatusCode::BAD_GATEWAY,
            AppError::Archive(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::MalformedInput(_) => "MALFORMED_INPUT",
            AppError::Engine(_) => "ENGINE_ERROR",
            AppError::EngineOutput(_) => "ENGINE_OUTPUT_INVALID",
            AppError::Archive(_) => "ARCHIVE_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn detail(&self) -> Option<&anyhow::Error> {
        match self {
            AppError::MalformedInput(_) => None,
            AppError::Engine(e)
            | AppError::EngineOutput(e)
            | AppError::Archive(e)
            | AppError::Internal(e) => Some(e),
        }
    }

    /// Render the error, optionally carrying the full cause chain in the body.
    ///
    /// The chain is always logged; it only reaches the client when the
    /// deployment is trusted (`EXPOSE_ERROR_DETAIL`).
    pub fn into_response_with_detail(self, expose_detail: bool) -> Response {
        let status = self.status();
        let code = self.code();

        let message = match self.detail() {
            Some(cause) => {
                error!("Request failed ({}): {}: {:?}", code, self, cause);
                if expose_detail {
                    format!("{}: {:?}", self, cause)
                } else {
                    self.to_string()
                }
            }
            None => {
                tracing::info!("Rejected request ({}): {}", code, self);
                self.to_string()
            }
        };

        (status, Json(ErrorBody { code, message })).into_response()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.into_response_with_detail(false)
    }
}
