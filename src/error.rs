//! Error taxonomy for the control plane.
//!
//! Every control or per-model entry point converts errors into a
//! structured `{code, message}` failure reply on the bus; nothing is
//! allowed to propagate out of a handler uncaught. Boundary codes:
//! `400` malformed request or local
//! backend failure, `404` not found (including remote backend
//! rejections), `405` unsupported action, `503` model not yet ready.

use thiserror::Error;

/// Domain errors raised while routing requests or managing model
/// lifecycles.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// Malformed payload or any exception raised during handling.
    #[error("{0}")]
    BadRequest(String),

    /// Unknown model address, sequence or artifact.
    #[error("{0}")]
    NotFound(String),

    /// Action outside the supported vocabulary; carries the literal
    /// offending value (or `null`).
    #[error("Unsupported action: {0}")]
    UnsupportedAction(String),

    /// No provider registered for the requested format.
    #[error("No provider available for format: {0}")]
    UnsupportedFormat(String),

    /// Known format, but the requested inference type does not match it.
    #[error("Unsupported inference type '{ty}' for format {format}")]
    UnsupportedType { ty: String, format: String },

    /// The backend capability has not finished loading; retryable.
    #[error("Model is not ready")]
    NotReady,

    /// A remote backend rejected the inference call.
    #[error("{0}")]
    Remote(String),

    /// A local backend capability or fetcher failed.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl InferenceError {
    /// Boundary failure code carried on the bus reply.
    pub fn code(&self) -> u16 {
        match self {
            InferenceError::UnsupportedAction(_) => 405,
            InferenceError::NotFound(_) | InferenceError::Remote(_) => 404,
            InferenceError::NotReady => 503,
            InferenceError::BadRequest(_)
            | InferenceError::UnsupportedFormat(_)
            | InferenceError::UnsupportedType { .. }
            | InferenceError::Backend(_) => 400,
        }
    }
}

impl From<serde_json::Error> for InferenceError {
    fn from(err: serde_json::Error) -> Self {
        InferenceError::BadRequest(err.to_string())
    }
}

pub type Result<T, E = InferenceError> = std::result::Result<T, E>;
