//! Capture trait definitions
//!
//! Platform-agnostic traits for capture sources. A backend hands out a
//! [`MediaSource`] for a device; the source drives an encoder that pushes
//! [`MediaEvent`]s into the session's event channel.

use crate::recorder::state::SourceKind;
use crate::utils::error::CaptureError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Both the ideal and the hard cap for captured frames
pub const MAX_RESOLUTION: Resolution = Resolution {
    width: 1280,
    height: 720,
};

/// What the session asks the platform for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRequest {
    pub kind: SourceKind,
    pub ideal: Resolution,
    pub max: Resolution,
    /// Capture audio when the platform offers it
    pub audio: bool,
    pub device_id: Option<String>,
}

impl SourceRequest {
    pub fn new(kind: SourceKind, audio: bool, device_id: Option<String>) -> Self {
        Self {
            kind,
            ideal: MAX_RESOLUTION,
            max: MAX_RESOLUTION,
            audio,
            device_id,
        }
    }
}

/// Encoder parameters chosen at start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSettings {
    pub mime_type: String,
    pub bitrate_bps: u64,
}

/// Events a live source reports to its session
#[derive(Debug, Clone)]
pub enum MediaEvent {
    /// An encoded data unit
    Data(Bytes),
    /// The platform ended the source (device unplugged, sharing revoked)
    Ended,
    /// The encoder failed while recording
    EncoderError(String),
}

pub type MediaEventSender = mpsc::UnboundedSender<MediaEvent>;
pub type MediaEventReceiver = mpsc::UnboundedReceiver<MediaEvent>;

/// Platform capture capability
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Whether the platform encoder can produce `mime_type`
    async fn supports_codec(&self, mime_type: &str) -> bool;

    /// Acquire the device described by `request`.
    ///
    /// Fails with [`CaptureError::SourceUnavailable`] on denial or absence.
    async fn acquire(&self, request: &SourceRequest) -> Result<Box<dyn MediaSource>, CaptureError>;
}

/// An acquired device plus its encoder
#[async_trait]
pub trait MediaSource: Send {
    /// Start encoding; data units and lifecycle events go to `events`.
    ///
    /// A device the platform refuses once encoding begins is reported here
    /// as [`CaptureError::SourceUnavailable`], not as an `Ended` event.
    async fn start_encoder(
        &mut self,
        settings: &EncoderSettings,
        events: MediaEventSender,
    ) -> Result<(), CaptureError>;

    /// Flush and finalize the encoder.
    ///
    /// Every trailing data unit is sent on the event channel before this
    /// resolves. No `Ended` event is reported for a requested finalize.
    async fn finalize(&mut self);

    /// Stop all device tracks. Must be safe to call more than once.
    fn release(&mut self);
}
