use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::generator::GenerateError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("person_image is required")]
    MissingPersonImage,

    #[error("{0}")]
    InvalidBody(#[from] serde_json::Error),

    #[error("Request body must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error(transparent)]
    Generation(#[from] GenerateError),

    #[error("{0}")]
    Encoding(#[from] image::ImageError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingPersonImage => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Error generating image: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
