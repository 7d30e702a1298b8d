//! Recording state management
//!
//! Defines the capture state machine, session configuration and the
//! snapshot exposed to pollers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of media source a session captures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Screen,
    Camera,
}

impl SourceKind {
    /// Wire name used by the ingest service
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Screen => "screen",
            SourceKind::Camera => "camera",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bearer credential attached to every upload.
///
/// `Debug` never prints the token.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Configuration for one recording, fixed at start
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureConfig {
    /// External assessment session identifier
    pub session_id: String,

    /// Bearer token for the ingest service
    pub credential: Credential,

    /// Screen or camera
    pub source_kind: SourceKind,

    /// Segmentation period; 0 disables chunking so only a final segment is sent
    pub segment_interval_ms: u64,

    /// Target encoder bitrate
    pub target_bitrate_bps: u64,

    /// Candidate MIME encodings, most preferred first
    #[serde(default)]
    pub preferred_codecs: Vec<String>,

    /// Whether to capture audio alongside video when available
    #[serde(default = "default_capture_audio")]
    pub capture_audio: bool,

    /// Platform device selector (display name, camera index, ...)
    #[serde(default)]
    pub device_id: Option<String>,
}

fn default_capture_audio() -> bool {
    true
}

/// Current state of a capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Nothing acquired yet
    #[default]
    Idle,
    /// Negotiating codec and requesting the device
    Acquiring,
    /// Device live, data flowing
    Recording,
    /// Stop sequence running
    Stopping,
    /// Stop sequence finished
    Stopped,
    /// Encoder reported an error
    Failed,
}

impl SessionStatus {
    /// Whether the session has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Stopped | SessionStatus::Failed)
    }
}

/// Summary of the last upload outcome, kept for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum UploadSummary {
    Accepted { capture_id: Option<String>, is_final: bool },
    Rejected { reason: String, is_final: bool },
    TransientFailure { cause: String, is_final: bool },
}

/// Point-in-time view of a capture session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureSnapshot {
    pub status: SessionStatus,

    /// Set on transition to Recording
    pub started_at: Option<DateTime<Utc>>,

    pub bytes_captured: u64,

    pub segments_uploaded: u64,

    /// Data units waiting to be packaged, including the continuity anchor
    pub pending_units: usize,

    /// Negotiated container/codec
    pub mime_type: Option<String>,

    pub last_upload: Option<UploadSummary>,

    /// Encoder failure message when status is Failed
    pub failure: Option<String>,
}

impl CaptureSnapshot {
    pub fn is_recording(&self) -> bool {
        self.status == SessionStatus::Recording
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_debug_is_redacted() {
        let credential = Credential::new("secret-token");
        let printed = format!("{:?}", credential);
        assert!(!printed.contains("secret-token"));
        assert_eq!(credential.expose(), "secret-token");
    }

    #[test]
    fn test_config_from_json() {
        let config: CaptureConfig = serde_json::from_str(
            r#"{
                "sessionId": "olymp-7",
                "credential": "tok",
                "sourceKind": "camera",
                "segmentIntervalMs": 30000,
                "targetBitrateBps": 2500000
            }"#,
        )
        .unwrap();

        assert_eq!(config.source_kind, SourceKind::Camera);
        assert!(config.capture_audio);
        assert!(config.preferred_codecs.is_empty());
        assert!(!format!("{:?}", config).contains("tok\""));
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let snapshot = CaptureSnapshot {
            status: SessionStatus::Recording,
            bytes_captured: 42,
            ..Default::default()
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["status"], "recording");
        assert_eq!(json["bytesCaptured"], 42);
        assert!(snapshot.is_recording());
    }
}
