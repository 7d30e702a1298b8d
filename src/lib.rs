//! Proctor Capture - continuous proctoring capture with chunked upload.
//!
//! Records a candidate's screen or camera for the length of an assessment
//! and delivers it to the ingest service as time-bounded segments, keeping
//! every unacknowledged byte buffered across upload failures.

pub mod capture;
pub mod config;
pub mod controller;
pub mod ingest;
pub mod recorder;
pub mod utils;

pub use config::ProctorSettings;
pub use controller::{ControllerStatus, SessionController};
pub use ingest::{IngestClient, UploadOutcome};
pub use recorder::{CaptureConfig, CaptureSession, Credential, SessionStatus, SourceKind};
pub use utils::error::{AppError, AppResult, CaptureError};

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the default tracing subscriber.
///
/// `RUST_LOG` overrides the default filter. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "proctor_capture=debug,reqwest=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Controller wired to FFmpeg capture and the HTTP ingest client
pub fn controller_from_settings(settings: &ProctorSettings) -> AppResult<SessionController> {
    let client = IngestClient::new(&settings.ingest)?;

    tracing::info!(
        "Proctor Capture v{} uploading to {}",
        env!("CARGO_PKG_VERSION"),
        client.url()
    );

    Ok(SessionController::new(
        Arc::new(capture::FfmpegBackend::new()),
        Arc::new(client),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_from_default_settings() {
        let controller = controller_from_settings(&ProctorSettings::default()).unwrap();
        assert!(!controller.is_recording());
        assert_eq!(controller.recording_time_seconds(), 0);
    }
}
