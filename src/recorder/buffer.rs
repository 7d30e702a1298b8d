//! Segment buffer
//!
//! Accumulates encoded data units between uploads and packages them into
//! segments. After an accepted upload the newest unit of that segment stays
//! at the head of the buffer as the continuity anchor.

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};

/// A packaged unit for upload
#[derive(Debug, Clone)]
pub struct Segment {
    pub payload: Bytes,
    pub mime_type: String,
    pub is_final: bool,
    pub created_at: DateTime<Utc>,
}

impl Segment {
    /// File extension matching the container in `mime_type`
    pub fn extension(&self) -> &'static str {
        if self.mime_type.starts_with("video/mp4") {
            "mp4"
        } else {
            "webm"
        }
    }
}

/// Ordered data units not yet acknowledged by the ingest service
#[derive(Debug, Default)]
pub struct SegmentBuffer {
    units: Vec<Bytes>,
    /// Whether `units[0]` is an anchor that was already delivered
    anchored: bool,
}

impl SegmentBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, unit: Bytes) {
        self.units.push(unit);
    }

    /// Number of buffered units, anchor included
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Total buffered bytes, anchor included
    pub fn byte_len(&self) -> usize {
        self.units.iter().map(Bytes::len).sum()
    }

    /// Whether anything beyond the anchor is waiting
    pub fn has_fresh(&self) -> bool {
        self.units.len() > usize::from(self.anchored)
    }

    /// Package every buffered unit into a segment.
    ///
    /// Returns the segment and the number of units it covers, or `None` when
    /// nothing beyond the anchor is buffered. The buffer is left untouched;
    /// call [`acknowledge`](Self::acknowledge) once the upload is accepted.
    pub fn package(&self, mime_type: &str, is_final: bool) -> Option<(Segment, usize)> {
        if !self.has_fresh() {
            return None;
        }

        let mut payload = BytesMut::with_capacity(self.byte_len());
        for unit in &self.units {
            payload.extend_from_slice(unit);
        }

        let segment = Segment {
            payload: payload.freeze(),
            mime_type: mime_type.to_string(),
            is_final,
            created_at: Utc::now(),
        };
        Some((segment, self.units.len()))
    }

    /// Drop the first `count` units except the last of them, which becomes
    /// the new anchor. Units pushed after packaging are kept.
    pub fn acknowledge(&mut self, count: usize) {
        let count = count.min(self.units.len());
        if count == 0 {
            return;
        }
        self.units.drain(..count - 1);
        self.anchored = true;
    }
}
