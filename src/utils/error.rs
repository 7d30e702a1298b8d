//! Error types and handling
//!
//! Common error types used across the crate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that abort `start` on a capture session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// The platform denied or lacks the requested device
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// None of the preferred or fallback encodings is usable
    #[error("No supported codec among: {0}")]
    UnsupportedCodec(String),

    /// The encoder could not be started on the acquired source
    #[error("Encoder error: {0}")]
    Encoder(String),
}

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),
}

/// Error response for the UI layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<&CaptureError> for ErrorResponse {
    fn from(error: &CaptureError) -> Self {
        let code = match error {
            CaptureError::SourceUnavailable(_) => "SOURCE_UNAVAILABLE",
            CaptureError::UnsupportedCodec(_) => "UNSUPPORTED_CODEC",
            CaptureError::Encoder(_) => "ENCODER_ERROR",
        };

        ErrorResponse {
            code: code.to_string(),
            message: error.to_string(),
        }
    }
}

impl From<AppError> for ErrorResponse {
    fn from(error: AppError) -> Self {
        let code = match &error {
            AppError::Io(_) => "IO_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Http(_) => "HTTP_ERROR",
            AppError::Capture(inner) => return ErrorResponse::from(inner),
        };

        ErrorResponse {
            code: code.to_string(),
            message: error.to_string(),
        }
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
