//! Settings file
//!
//! TOML settings with defaults for every field, so an empty file (or no file)
//! yields a working configuration.

use crate::capture::codec::FALLBACK_CODECS;
use crate::recorder::state::{CaptureConfig, Credential, SourceKind};
use crate::utils::error::AppResult;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Path of the segment ingest endpoint, relative to the base URL
pub const DEFAULT_INGEST_PATH: &str = "/olympiads/camera-capture";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProctorSettings {
    pub ingest: IngestSettings,
    pub capture: CaptureDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    /// Scheme and host of the ingest service
    pub base_url: String,
    pub endpoint_path: String,
    /// Per-request timeout; none means the transport default
    pub request_timeout_secs: Option<u64>,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            endpoint_path: DEFAULT_INGEST_PATH.to_string(),
            request_timeout_secs: None,
        }
    }
}

impl IngestSettings {
    /// Full upload URL
    pub fn upload_url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.endpoint_path.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureDefaults {
    pub segment_interval_ms: u64,
    pub target_bitrate_bps: u64,
    pub preferred_codecs: Vec<String>,
    pub capture_audio: bool,
}

impl Default for CaptureDefaults {
    fn default() -> Self {
        Self {
            segment_interval_ms: 30_000,
            target_bitrate_bps: 2_500_000,
            preferred_codecs: FALLBACK_CODECS.iter().map(|c| c.to_string()).collect(),
            capture_audio: true,
        }
    }
}

impl CaptureDefaults {
    /// Build a session configuration from these defaults
    pub fn config_for(
        &self,
        session_id: impl Into<String>,
        credential: Credential,
        source_kind: SourceKind,
    ) -> CaptureConfig {
        CaptureConfig {
            session_id: session_id.into(),
            credential,
            source_kind,
            segment_interval_ms: self.segment_interval_ms,
            target_bitrate_bps: self.target_bitrate_bps,
            preferred_codecs: self.preferred_codecs.clone(),
            capture_audio: self.capture_audio,
            device_id: None,
        }
    }
}

impl ProctorSettings {
    pub fn from_toml_str(content: &str) -> AppResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Read settings from `path`; a missing file yields defaults
    pub fn load(path: &Path) -> AppResult<Self> {
        if !path.exists() {
            tracing::info!("No settings at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let settings = Self::from_toml_str(&content)?;
        tracing::info!("Loaded settings from {:?}", path);
        Ok(settings)
    }
}
