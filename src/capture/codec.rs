//! Codec negotiation
//!
//! Picks the first encoding the backend supports from the caller's
//! preferences followed by a fixed fallback list, and maps MIME types onto
//! FFmpeg muxer/encoder names.

use super::traits::CaptureBackend;
use crate::utils::error::CaptureError;

/// Tried after the caller's preferences, in order
pub const FALLBACK_CODECS: &[&str] = &[
    "video/webm;codecs=vp9,opus",
    "video/webm;codecs=vp8,opus",
    "video/webm",
    "video/mp4",
];

/// Choose the encoding for a session
pub async fn negotiate(
    preferred: &[String],
    backend: &dyn CaptureBackend,
) -> Result<String, CaptureError> {
    let candidates = preferred
        .iter()
        .map(String::as_str)
        .chain(FALLBACK_CODECS.iter().copied());

    let mut tried = Vec::new();
    for candidate in candidates {
        if backend.supports_codec(candidate).await {
            tracing::debug!("Negotiated codec {} on {}", candidate, backend.name());
            return Ok(candidate.to_string());
        }
        tried.push(candidate);
    }

    Err(CaptureError::UnsupportedCodec(tried.join(", ")))
}

/// Container and encoders behind a MIME type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecProfile {
    /// FFmpeg muxer name
    pub container: &'static str,
    /// FFmpeg video encoder
    pub video_encoder: &'static str,
    /// FFmpeg audio encoder
    pub audio_encoder: &'static str,
}

impl CodecProfile {
    /// Parse `video/<container>[;codecs=<v>[,<a>]]`
    pub fn from_mime(mime_type: &str) -> Option<Self> {
        let mut parts = mime_type.split(';');
        let essence = parts.next()?.trim().to_ascii_lowercase();

        let codecs: Vec<String> = parts
            .filter_map(|param| {
                let (key, value) = param.split_once('=')?;
                (key.trim().eq_ignore_ascii_case("codecs"))
                    .then(|| value.trim().trim_matches('"').to_string())
            })
            .flat_map(|value| {
                value
                    .split(',')
                    .map(|c| c.trim().to_ascii_lowercase())
                    .collect::<Vec<_>>()
            })
            .collect();

        let is_audio = |c: &&String| matches!(c.as_str(), "opus" | "vorbis" | "aac" | "mp4a");
        let video = codecs.iter().find(|c| !is_audio(c));
        let audio = codecs.iter().find(is_audio);

        match essence.as_str() {
            "video/webm" => {
                let video_encoder = match video.map(String::as_str) {
                    None | Some("vp9") | Some("vp09") => "libvpx-vp9",
                    Some("vp8") => "libvpx",
                    _ => return None,
                };
                let audio_encoder = match audio.map(String::as_str) {
                    None | Some("opus") => "libopus",
                    Some("vorbis") => "libvorbis",
                    _ => return None,
                };
                Some(Self {
                    container: "webm",
                    video_encoder,
                    audio_encoder,
                })
            }
            "video/mp4" => {
                let video_encoder = match video.map(String::as_str) {
                    None | Some("h264") | Some("avc1") => "libx264",
                    Some(c) if c.starts_with("avc1.") => "libx264",
                    _ => return None,
                };
                Some(Self {
                    container: "mp4",
                    video_encoder,
                    audio_encoder: "aac",
                })
            }
            _ => None,
        }
    }
}
