//! Capture session
//!
//! Owns one live recording. A single driver task processes every event of the
//! session (data units, device end, encoder errors, segmentation ticks, upload
//! completions, stop requests) in sequence, so state transitions never
//! interleave. Uploads run in their own tasks and report back to the driver.

use super::buffer::SegmentBuffer;
use super::state::{CaptureConfig, CaptureSnapshot, SessionStatus, UploadSummary};
use crate::capture::codec::negotiate;
use crate::capture::traits::{
    CaptureBackend, EncoderSettings, MediaEvent, MediaEventReceiver, MediaSource, SourceRequest,
};
use crate::ingest::client::{SegmentUploader, SessionMeta, UploadOutcome};
use crate::utils::error::CaptureError;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::Instrument;
use uuid::Uuid;

enum Command {
    Stop(oneshot::Sender<()>),
}

/// Result of a spawned chunk upload
struct Completion {
    outcome: UploadOutcome,
    /// Buffered units the uploaded segment covered
    units: usize,
}

#[derive(Debug, Default)]
struct Shared {
    snapshot: CaptureSnapshot,
    started: Option<Instant>,
    ended: Option<Instant>,
}

/// Cloneable read-only view of a session's state
#[derive(Debug, Clone)]
pub struct StatusProbe {
    shared: Arc<RwLock<Shared>>,
}

impl StatusProbe {
    pub fn snapshot(&self) -> CaptureSnapshot {
        self.shared.read().snapshot.clone()
    }

    /// Time spent recording; frozen once the session stops or fails
    pub fn elapsed(&self) -> Duration {
        let shared = self.shared.read();
        match (shared.started, shared.ended) {
            (Some(started), Some(ended)) => ended.saturating_duration_since(started),
            (Some(started), None) => started.elapsed(),
            _ => Duration::ZERO,
        }
    }
}

/// Handle to one recording.
///
/// Dropping the handle while recording runs the stop sequence in the
/// background, so the device is never left captured.
pub struct CaptureSession {
    backend: Arc<dyn CaptureBackend>,
    uploader: Arc<dyn SegmentUploader>,
    shared: Arc<RwLock<Shared>>,
    commands: Option<mpsc::UnboundedSender<Command>>,
    driver: Option<JoinHandle<()>>,
}

impl CaptureSession {
    pub fn new(backend: Arc<dyn CaptureBackend>, uploader: Arc<dyn SegmentUploader>) -> Self {
        Self {
            backend,
            uploader,
            shared: Arc::new(RwLock::new(Shared::default())),
            commands: None,
            driver: None,
        }
    }

    /// Current state; never blocks on the driver
    pub fn status(&self) -> CaptureSnapshot {
        self.shared.read().snapshot.clone()
    }

    pub fn probe(&self) -> StatusProbe {
        StatusProbe {
            shared: self.shared.clone(),
        }
    }

    /// Acquire the source and begin recording.
    ///
    /// Resolves `Ok` without doing anything unless the session is Idle. On
    /// error the session returns to Idle and may be started again.
    pub async fn start(&mut self, config: CaptureConfig) -> Result<(), CaptureError> {
        {
            let mut shared = self.shared.write();
            if shared.snapshot.status != SessionStatus::Idle {
                tracing::debug!("Start ignored in state {:?}", shared.snapshot.status);
                return Ok(());
            }
            shared.snapshot.status = SessionStatus::Acquiring;
        }

        if let Err(e) = self.launch(config).await {
            tracing::warn!("Failed to start capture: {}", e);
            let mut shared = self.shared.write();
            shared.snapshot.status = SessionStatus::Idle;
            shared.snapshot.mime_type = None;
            return Err(e);
        }
        Ok(())
    }

    async fn launch(&mut self, config: CaptureConfig) -> Result<(), CaptureError> {
        let mime_type = negotiate(&config.preferred_codecs, self.backend.as_ref()).await?;

        let request = SourceRequest::new(
            config.source_kind,
            config.capture_audio,
            config.device_id.clone(),
        );
        let mut source = self.backend.acquire(&request).await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let settings = EncoderSettings {
            mime_type: mime_type.clone(),
            bitrate_bps: config.target_bitrate_bps,
        };
        if let Err(e) = source.start_encoder(&settings, events_tx).await {
            source.release();
            return Err(e);
        }

        let run_id = Uuid::new_v4();
        {
            let mut shared = self.shared.write();
            shared.snapshot.status = SessionStatus::Recording;
            shared.snapshot.started_at = Some(Utc::now());
            shared.snapshot.mime_type = Some(mime_type.clone());
            shared.started = Some(Instant::now());
        }

        let interval = match config.segment_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        tracing::info!(
            "Recording {} for session {} as {} (run {}, segments every {:?})",
            config.source_kind,
            config.session_id,
            mime_type,
            run_id,
            interval
        );

        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            mime_type,
            meta: SessionMeta {
                session_id: config.session_id.clone(),
                source_kind: config.source_kind,
                credential: config.credential,
            },
            source,
            released: false,
            buffer: SegmentBuffer::new(),
            shared: self.shared.clone(),
            uploader: self.uploader.clone(),
            completions: completions_tx,
            in_flight: None,
            deferred: false,
        };

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let span = tracing::info_span!("capture", run = %run_id, session = %config.session_id);
        self.commands = Some(commands_tx);
        self.driver = Some(tokio::spawn(
            driver
                .run(interval, commands_rx, events_rx, completions_rx)
                .instrument(span),
        ));
        Ok(())
    }

    /// Stop recording and deliver the final segment.
    ///
    /// No-op unless Recording. Resolves once the session is Stopped; the
    /// final upload outcome is reported in [`status`](Self::status).
    pub async fn stop(&mut self) -> Result<(), CaptureError> {
        if self.shared.read().snapshot.status != SessionStatus::Recording {
            return Ok(());
        }

        if let Some(commands) = self.commands.take() {
            let (reply_tx, reply_rx) = oneshot::channel();
            if commands.send(Command::Stop(reply_tx)).is_ok() {
                // dropped reply means the driver already shut down on its own
                let _ = reply_rx.await;
            }
        }

        self.join_driver().await;
        Ok(())
    }

    /// Wait for a stop sequence already under way (device end, dropped handle)
    pub(crate) async fn join_driver(&mut self) {
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.await {
                tracing::error!("Capture driver task failed: {}", e);
            }
        }
    }
}

/// Event loop state for one recording
struct Driver {
    mime_type: String,
    meta: SessionMeta,
    source: Box<dyn MediaSource>,
    released: bool,
    buffer: SegmentBuffer,
    shared: Arc<RwLock<Shared>>,
    uploader: Arc<dyn SegmentUploader>,
    completions: mpsc::UnboundedSender<Completion>,
    /// Units covered by the chunk upload in flight
    in_flight: Option<usize>,
    /// A tick fired while a chunk upload was in flight
    deferred: bool,
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

impl Driver {
    async fn run(
        mut self,
        interval: Option<Duration>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: MediaEventReceiver,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        let mut ticker = interval.map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            tokio::select! {
                biased;

                Some(event) = events.recv() => match event {
                    MediaEvent::Data(unit) => self.on_data(unit),
                    MediaEvent::Ended => {
                        tracing::info!("Capture source ended by the platform");
                        ticker = None;
                        self.shutdown(&mut events, &mut completions).await;
                        break;
                    }
                    MediaEvent::EncoderError(message) => {
                        ticker = None;
                        self.fail(message, &mut completions).await;
                        break;
                    }
                },

                Some(done) = completions.recv() => {
                    self.settle(done);
                    if self.deferred {
                        self.deferred = false;
                        self.dispatch_chunk();
                    }
                }

                _ = next_tick(&mut ticker) => self.on_tick(),

                command = commands.recv() => {
                    let reply = command.map(|Command::Stop(reply)| reply);
                    if reply.is_none() {
                        tracing::info!("Capture handle dropped while recording; stopping");
                    }
                    ticker = None;
                    self.shutdown(&mut events, &mut completions).await;
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                    break;
                }
            }
        }

        drop(ticker);
    }

    fn on_data(&mut self, unit: Bytes) {
        let len = unit.len() as u64;
        self.buffer.push(unit);

        let mut shared = self.shared.write();
        shared.snapshot.bytes_captured += len;
        shared.snapshot.pending_units = self.buffer.len();
    }

    fn on_tick(&mut self) {
        if self.in_flight.is_some() {
            tracing::debug!("Segment tick while a chunk upload is in flight; deferring");
            self.deferred = true;
            return;
        }
        self.dispatch_chunk();
    }

    fn dispatch_chunk(&mut self) {
        let Some((segment, units)) = self.buffer.package(&self.mime_type, false) else {
            tracing::debug!("Segment tick with no new data");
            return;
        };

        tracing::debug!(
            "Dispatching chunk of {} bytes ({} units)",
            segment.payload.len(),
            units
        );

        self.in_flight = Some(units);
        let uploader = self.uploader.clone();
        let meta = self.meta.clone();
        let completions = self.completions.clone();
        tokio::spawn(
            async move {
                let outcome = uploader.upload(segment, &meta).await;
                // driver may be gone after a failure
                let _ = completions.send(Completion { outcome, units });
            }
            .in_current_span(),
        );
    }

    fn settle(&mut self, done: Completion) {
        self.in_flight = None;
        self.record(done.outcome, done.units, false);
    }

    /// Apply an upload outcome. Only an accepted upload trims the buffer.
    fn record(&mut self, outcome: UploadOutcome, units: usize, is_final: bool) {
        let summary = match outcome {
            UploadOutcome::Accepted(capture_id) => {
                self.buffer.acknowledge(units);
                UploadSummary::Accepted {
                    capture_id,
                    is_final,
                }
            }
            UploadOutcome::Rejected(reason) => {
                tracing::warn!(
                    "Segment rejected, keeping {} buffered units: {}",
                    self.buffer.len(),
                    reason
                );
                UploadSummary::Rejected { reason, is_final }
            }
            UploadOutcome::TransientFailure(cause) => {
                tracing::warn!(
                    "Segment upload failed, keeping {} buffered units: {}",
                    self.buffer.len(),
                    cause
                );
                UploadSummary::TransientFailure { cause, is_final }
            }
        };

        let mut shared = self.shared.write();
        if matches!(summary, UploadSummary::Accepted { .. }) {
            shared.snapshot.segments_uploaded += 1;
        }
        shared.snapshot.last_upload = Some(summary);
        shared.snapshot.pending_units = self.buffer.len();
    }

    fn set_status(&self, status: SessionStatus) {
        let mut shared = self.shared.write();
        shared.snapshot.status = status;
        if status.is_terminal() {
            shared.ended = Some(Instant::now());
        }
    }

    fn release_source(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.source.release();
    }

    /// Stop sequence shared by `stop()`, device end and a dropped handle
    async fn shutdown(
        &mut self,
        events: &mut MediaEventReceiver,
        completions: &mut mpsc::UnboundedReceiver<Completion>,
    ) {
        self.set_status(SessionStatus::Stopping);

        self.source.finalize().await;
        self.release_source();

        while let Ok(event) = events.try_recv() {
            if let MediaEvent::Data(unit) = event {
                self.on_data(unit);
            }
        }

        if self.in_flight.is_some() {
            tracing::debug!("Waiting for in-flight chunk upload before the final segment");
            if let Some(done) = completions.recv().await {
                self.settle(done);
            }
        }
        self.deferred = false;

        match self.buffer.package(&self.mime_type, true) {
            Some((segment, units)) => {
                tracing::info!("Uploading final segment of {} bytes", segment.payload.len());
                let outcome = self.uploader.upload(segment, &self.meta).await;
                self.record(outcome, units, true);
            }
            None => tracing::debug!("No data left for a final segment"),
        }

        self.set_status(SessionStatus::Stopped);
        let snapshot = self.shared.read().snapshot.clone();
        tracing::info!(
            "Recording stopped: {} bytes captured, {} segments uploaded",
            snapshot.bytes_captured,
            snapshot.segments_uploaded
        );
    }

    /// Encoder failure: release the device and settle the chunk in flight.
    /// Nothing new is uploaded.
    async fn fail(
        &mut self,
        message: String,
        completions: &mut mpsc::UnboundedReceiver<Completion>,
    ) {
        tracing::error!("Encoder error, recording failed: {}", message);
        self.release_source();

        if self.in_flight.is_some() {
            tracing::debug!("Waiting for in-flight chunk upload before failing");
            if let Some(done) = completions.recv().await {
                self.settle(done);
            }
        }
        self.deferred = false;

        {
            let mut shared = self.shared.write();
            shared.snapshot.failure = Some(message);
        }
        self.set_status(SessionStatus::Failed);
    }
}
