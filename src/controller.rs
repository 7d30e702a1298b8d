//! Session controller
//!
//! Binding between a consuming UI and the capture engine. Holds at most one
//! live [`CaptureSession`], creating a fresh one for every start, and
//! republishes its state once per second.

use crate::capture::traits::CaptureBackend;
use crate::ingest::client::SegmentUploader;
use crate::recorder::session::{CaptureSession, StatusProbe};
use crate::recorder::state::{CaptureConfig, SessionStatus};
use crate::utils::error::{CaptureError, ErrorResponse};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const PUBLISH_PERIOD: Duration = Duration::from_secs(1);

/// State exposed to the UI
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerStatus {
    pub is_recording: bool,
    pub recording_time_seconds: u64,
    pub status: SessionStatus,
    pub bytes_captured: u64,
    pub segments_uploaded: u64,
    /// Why the last start failed
    pub error: Option<ErrorResponse>,
}

impl ControllerStatus {
    fn from_probe(probe: &StatusProbe, error: Option<ErrorResponse>) -> Self {
        let snapshot = probe.snapshot();
        Self {
            is_recording: snapshot.is_recording(),
            recording_time_seconds: probe.elapsed().as_secs(),
            status: snapshot.status,
            bytes_captured: snapshot.bytes_captured,
            segments_uploaded: snapshot.segments_uploaded,
            error,
        }
    }
}

pub struct SessionController {
    backend: Arc<dyn CaptureBackend>,
    uploader: Arc<dyn SegmentUploader>,
    active: Option<CaptureSession>,
    last_error: Option<ErrorResponse>,
    status_tx: Arc<watch::Sender<ControllerStatus>>,
    publisher: Option<JoinHandle<()>>,
}

impl SessionController {
    pub fn new(backend: Arc<dyn CaptureBackend>, uploader: Arc<dyn SegmentUploader>) -> Self {
        let (status_tx, _) = watch::channel(ControllerStatus::default());
        Self {
            backend,
            uploader,
            active: None,
            last_error: None,
            status_tx: Arc::new(status_tx),
            publisher: None,
        }
    }

    /// Start a recording with a fresh capture session.
    ///
    /// No-op while a recording is live.
    pub async fn start(&mut self, config: CaptureConfig) -> Result<(), CaptureError> {
        if self.is_recording() {
            tracing::debug!("Already recording; start ignored");
            return Ok(());
        }

        if let Some(mut previous) = self.active.take() {
            // a device-ended session may still be delivering its final segment
            previous.join_driver().await;
        }
        self.stop_publisher();

        let mut session = CaptureSession::new(self.backend.clone(), self.uploader.clone());
        match session.start(config).await {
            Ok(()) => {
                self.last_error = None;
                self.spawn_publisher(session.probe());
                self.active = Some(session);
                self.publish();
                Ok(())
            }
            Err(e) => {
                self.last_error = Some(ErrorResponse::from(&e));
                self.publish();
                Err(e)
            }
        }
    }

    /// Stop the live recording, if any
    pub async fn stop(&mut self) -> Result<(), CaptureError> {
        let result = match self.active.as_mut() {
            Some(session) => session.stop().await,
            None => Ok(()),
        };
        self.stop_publisher();
        self.publish();
        result
    }

    pub fn is_recording(&self) -> bool {
        self.active
            .as_ref()
            .map(|session| session.status().is_recording())
            .unwrap_or(false)
    }

    /// Whole seconds since the current (or last) recording started
    pub fn recording_time_seconds(&self) -> u64 {
        self.active
            .as_ref()
            .map(|session| session.probe().elapsed().as_secs())
            .unwrap_or(0)
    }

    pub fn status(&self) -> ControllerStatus {
        match &self.active {
            Some(session) => {
                ControllerStatus::from_probe(&session.probe(), self.last_error.clone())
            }
            None => ControllerStatus {
                error: self.last_error.clone(),
                ..Default::default()
            },
        }
    }

    /// Status updates, published every second while recording
    pub fn subscribe(&self) -> watch::Receiver<ControllerStatus> {
        self.status_tx.subscribe()
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.status());
    }

    fn spawn_publisher(&mut self, probe: StatusProbe) {
        let status_tx = self.status_tx.clone();
        self.publisher = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PUBLISH_PERIOD);
            loop {
                ticker.tick().await;
                let status = ControllerStatus::from_probe(&probe, None);
                let done = status.status.is_terminal();
                status_tx.send_replace(status);
                if done {
                    break;
                }
            }
        }));
    }

    fn stop_publisher(&mut self) {
        if let Some(publisher) = self.publisher.take() {
            publisher.abort();
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.stop_publisher();
        if self.is_recording() {
            // dropping the session handle runs its stop sequence
            tracing::info!("Controller dropped while recording; stopping capture");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::state::{Credential, SourceKind};
    use crate::recorder::testing::{FakeBackend, FakeUploader};
    use tokio::time::sleep;

    fn config() -> CaptureConfig {
        CaptureConfig {
            session_id: "olymp-3".to_string(),
            credential: Credential::new("tok"),
            source_kind: SourceKind::Camera,
            segment_interval_ms: 30_000,
            target_bitrate_bps: 1_000_000,
            preferred_codecs: Vec::new(),
            capture_audio: false,
            device_id: None,
        }
    }

    fn controller(backend: &Arc<FakeBackend>, uploader: &Arc<FakeUploader>) -> SessionController {
        SessionController::new(backend.clone(), uploader.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_lifecycle() {
        let backend = FakeBackend::new();
        let uploader = FakeUploader::open();
        let mut controller = controller(&backend, &uploader);

        assert!(!controller.is_recording());
        controller.start(config()).await.unwrap();
        assert!(controller.is_recording());

        sleep(Duration::from_secs(5)).await;
        backend.emit_data(64);
        assert_eq!(controller.recording_time_seconds(), 5);

        controller.stop().await.unwrap();
        let status = controller.status();
        assert!(!status.is_recording);
        assert_eq!(status.status, SessionStatus::Stopped);
        assert_eq!(status.segments_uploaded, 1);
        assert_eq!(status.bytes_captured, 64);
        assert_eq!(backend.released(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_while_recording_keeps_one_session() {
        let backend = FakeBackend::new();
        let uploader = FakeUploader::open();
        let mut controller = controller(&backend, &uploader);

        controller.start(config()).await.unwrap();
        controller.start(config()).await.unwrap();
        assert_eq!(backend.acquired(), 1);

        controller.stop().await.unwrap();
        controller.start(config()).await.unwrap();
        assert_eq!(backend.acquired(), 2);
        assert!(controller.is_recording());
        // restart begins a new clock
        assert_eq!(controller.recording_time_seconds(), 0);

        controller.stop().await.unwrap();
        assert_eq!(backend.released(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_start_is_reported_and_retryable() {
        let backend = FakeBackend::supporting(&[]);
        let uploader = FakeUploader::open();
        let mut controller = controller(&backend, &uploader);

        let err = controller.start(config()).await.unwrap_err();
        assert!(matches!(err, CaptureError::UnsupportedCodec(_)));
        let status = controller.status();
        assert!(!status.is_recording);
        assert_eq!(status.error.unwrap().code, "UNSUPPORTED_CODEC");

        backend.set_supported(&["video/webm"]);
        controller.start(config()).await.unwrap();
        assert!(controller.is_recording());
        assert!(controller.status().error.is_none());
        controller.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_without_session_is_noop() {
        let backend = FakeBackend::new();
        let uploader = FakeUploader::open();
        let mut controller = controller(&backend, &uploader);

        controller.stop().await.unwrap();
        assert_eq!(backend.released(), 0);
        assert!(uploader.uploads().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_publisher_ticks_every_second() {
        let backend = FakeBackend::new();
        let uploader = FakeUploader::open();
        let mut controller = controller(&backend, &uploader);
        let updates = controller.subscribe();

        controller.start(config()).await.unwrap();
        sleep(Duration::from_millis(3_500)).await;

        let latest = updates.borrow().clone();
        assert!(latest.is_recording);
        assert_eq!(latest.recording_time_seconds, 3);

        controller.stop().await.unwrap();
        assert!(!updates.borrow().is_recording);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_end_visible_to_subscribers() {
        let backend = FakeBackend::new();
        let uploader = FakeUploader::open();
        let mut controller = controller(&backend, &uploader);
        let updates = controller.subscribe();

        controller.start(config()).await.unwrap();
        backend.emit_data(10);
        backend.emit(crate::capture::traits::MediaEvent::Ended);
        sleep(Duration::from_millis(1_500)).await;

        assert!(!controller.is_recording());
        let latest = updates.borrow().clone();
        assert_eq!(latest.status, SessionStatus::Stopped);
        assert_eq!(backend.released(), 1);

        // a new start replaces the ended session
        controller.start(config()).await.unwrap();
        assert_eq!(backend.acquired(), 2);
        controller.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_while_recording_releases_device() {
        let backend = FakeBackend::new();
        let uploader = FakeUploader::open();
        let mut controller = controller(&backend, &uploader);

        controller.start(config()).await.unwrap();
        backend.emit_data(10);
        drop(controller);
        sleep(Duration::from_millis(10)).await;

        assert_eq!(backend.released(), 1);
        assert_eq!(uploader.uploads().len(), 1);
        assert!(uploader.uploads()[0].is_final);
    }
}
