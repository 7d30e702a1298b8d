//! In-memory capture backend and uploader for tests

use crate::capture::traits::{
    CaptureBackend, EncoderSettings, MediaEvent, MediaEventSender, MediaSource, SourceRequest,
};
use crate::ingest::client::{SegmentUploader, SessionMeta, UploadOutcome};
use crate::recorder::buffer::Segment;
use crate::utils::error::CaptureError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

type EventSlot = Arc<Mutex<Option<MediaEventSender>>>;

/// Backend whose source is fed by the test
pub(crate) struct FakeBackend {
    supported: Mutex<Vec<String>>,
    deny: AtomicBool,
    acquired: AtomicUsize,
    released: Arc<AtomicUsize>,
    events: EventSlot,
    trailing: Mutex<Vec<Bytes>>,
}

impl FakeBackend {
    pub(crate) fn new() -> Arc<Self> {
        Self::supporting(&["video/webm;codecs=vp9,opus"])
    }

    pub(crate) fn supporting(codecs: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            supported: Mutex::new(codecs.iter().map(|c| c.to_string()).collect()),
            deny: AtomicBool::new(false),
            acquired: AtomicUsize::new(0),
            released: Arc::new(AtomicUsize::new(0)),
            events: Arc::new(Mutex::new(None)),
            trailing: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn set_supported(&self, codecs: &[&str]) {
        *self.supported.lock() = codecs.iter().map(|c| c.to_string()).collect();
    }

    /// Make the next acquisitions fail as if permission was denied
    pub(crate) fn deny(&self) {
        self.deny.store(true, Ordering::SeqCst);
    }

    /// Units the encoder flushes on finalize
    pub(crate) fn set_trailing(&self, units: Vec<Bytes>) {
        *self.trailing.lock() = units;
    }

    pub(crate) fn emit(&self, event: MediaEvent) -> bool {
        match self.events.lock().as_ref() {
            Some(events) => events.send(event).is_ok(),
            None => false,
        }
    }

    pub(crate) fn emit_unit(&self, unit: Vec<u8>) -> bool {
        self.emit(MediaEvent::Data(Bytes::from(unit)))
    }

    pub(crate) fn emit_data(&self, len: usize) -> bool {
        self.emit_unit(vec![0xAB; len])
    }

    pub(crate) fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Every call to `release`, repeated calls included
    pub(crate) fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureBackend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    async fn supports_codec(&self, mime_type: &str) -> bool {
        self.supported.lock().iter().any(|c| c == mime_type)
    }

    async fn acquire(
        &self,
        _request: &SourceRequest,
    ) -> Result<Box<dyn MediaSource>, CaptureError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(CaptureError::SourceUnavailable("permission denied".to_string()));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSource {
            events: self.events.clone(),
            released: self.released.clone(),
            trailing: self.trailing.lock().clone(),
        }))
    }
}

struct FakeSource {
    events: EventSlot,
    released: Arc<AtomicUsize>,
    trailing: Vec<Bytes>,
}

#[async_trait]
impl MediaSource for FakeSource {
    async fn start_encoder(
        &mut self,
        _settings: &EncoderSettings,
        events: MediaEventSender,
    ) -> Result<(), CaptureError> {
        *self.events.lock() = Some(events);
        Ok(())
    }

    async fn finalize(&mut self) {
        let events = self.events.lock().take();
        if let Some(events) = events {
            for unit in self.trailing.drain(..) {
                let _ = events.send(MediaEvent::Data(unit));
            }
        }
    }

    fn release(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
        self.events.lock().take();
    }
}

/// Uploader recording every segment it is handed
pub(crate) struct FakeUploader {
    script: Mutex<VecDeque<UploadOutcome>>,
    fallback: UploadOutcome,
    gate: Semaphore,
    calls: Mutex<Vec<Segment>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeUploader {
    fn build(fallback: UploadOutcome, permits: usize) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            gate: Semaphore::new(permits),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    /// Accepts everything immediately
    pub(crate) fn open() -> Arc<Self> {
        Self::build(UploadOutcome::Accepted(Some("cap".to_string())), Semaphore::MAX_PERMITS)
    }

    /// Accepts, but each upload waits for [`release`](Self::release)
    pub(crate) fn gated() -> Arc<Self> {
        Self::build(UploadOutcome::Accepted(Some("cap".to_string())), 0)
    }

    /// Answers every upload with `outcome`
    pub(crate) fn always(outcome: UploadOutcome) -> Arc<Self> {
        Self::build(outcome, Semaphore::MAX_PERMITS)
    }

    /// Outcomes for the next uploads, before falling back
    pub(crate) fn script(&self, outcomes: Vec<UploadOutcome>) {
        self.script.lock().extend(outcomes);
    }

    pub(crate) fn release(&self, uploads: usize) {
        self.gate.add_permits(uploads);
    }

    pub(crate) fn uploads(&self) -> Vec<Segment> {
        self.calls.lock().clone()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SegmentUploader for FakeUploader {
    async fn upload(&self, segment: Segment, _meta: &SessionMeta) -> UploadOutcome {
        self.calls.lock().push(segment);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or_else(|| self.fallback.clone())
    }
}
