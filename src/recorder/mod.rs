//! Recording system module
//!
//! This module implements the capture-and-upload engine:
//! - SegmentBuffer accumulating encoded data units
//! - CaptureSession driving one recording and its chunked uploads
//! - State machine and snapshot types

pub mod buffer;
pub mod session;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use buffer::{Segment, SegmentBuffer};
pub use session::{CaptureSession, StatusProbe};
pub use state::{CaptureConfig, CaptureSnapshot, Credential, SessionStatus, SourceKind};
