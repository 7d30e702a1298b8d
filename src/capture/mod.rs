//! Platform capture
//!
//! Trait seam between the recording engine and the platform, codec
//! negotiation, and the FFmpeg-backed implementation.

pub mod codec;
pub mod ffmpeg;
pub mod traits;

pub use codec::{negotiate, CodecProfile, FALLBACK_CODECS};
pub use ffmpeg::FfmpegBackend;
pub use traits::{
    CaptureBackend, EncoderSettings, MediaEvent, MediaSource, Resolution, SourceRequest,
    MAX_RESOLUTION,
};
