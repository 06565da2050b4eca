use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Request failure, split by who has to fix it.
#[derive(Error, Debug)]
pub enum Failure {
    #[error("No image provided")]
    InvalidInput,

    #[error("{0}")]
    Processing(String),
}

impl Failure {
    pub fn processing(err: impl std::fmt::Display) -> Self {
        Failure::Processing(err.to_string())
    }
}

impl IntoResponse for Failure {
    fn into_response(self) -> Response {
        match self {
            Failure::InvalidInput => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "No image provided" })),
            )
                .into_response(),
            Failure::Processing(details) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Internal Server Error", "details": details })),
            )
                .into_response(),
        }
    }
}
