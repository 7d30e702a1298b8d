//! Segment delivery to the ingest service

pub mod client;

pub use client::{IngestClient, SegmentUploader, SessionMeta, UploadOutcome};
