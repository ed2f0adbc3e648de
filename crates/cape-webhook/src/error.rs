//! Webhook error type

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// Error type for webhook operations
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The admission review was malformed
    #[error("invalid admission review: {0}")]
    InvalidReview(String),

    /// The management cluster API failed
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The serving certificate could not be loaded
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// The HTTPS server stopped with an error
    #[error("server error: {0}")]
    Server(String),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::InvalidReview(_) => StatusCode::BAD_REQUEST,
            WebhookError::Kube(_) | WebhookError::Tls(_) | WebhookError::Server(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(serde_json::json!({"error": self.to_string()}))).into_response()
    }
}
