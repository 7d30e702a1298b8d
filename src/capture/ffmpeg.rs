//! FFmpeg capture backend
//!
//! Captures the screen or a camera by spawning FFmpeg with the platform grab
//! device and streaming the encoded container from stdout. Each stdout read
//! becomes one data unit.

use super::codec::CodecProfile;
use super::traits::{
    CaptureBackend, EncoderSettings, MediaEvent, MediaEventSender, MediaSource, SourceRequest,
};
use crate::recorder::state::SourceKind;
use crate::utils::error::CaptureError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{oneshot, OnceCell};
use tokio::task::JoinHandle;

const READ_CHUNK_SIZE: usize = 64 * 1024;
const STDERR_TAIL_LINES: usize = 20;
const FINALIZE_TIMEOUT: Duration = Duration::from_secs(10);
/// How long FFmpeg may run without output before the device counts as open
const STARTUP_WINDOW: Duration = Duration::from_secs(5);
const DEFAULT_FRAMERATE: u32 = 30;
const AUDIO_BITRATE: &str = "96k";

/// Host platform, selects the FFmpeg grab devices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
}

impl Platform {
    pub fn current() -> Option<Self> {
        if cfg!(target_os = "linux") {
            Some(Platform::Linux)
        } else if cfg!(target_os = "macos") {
            Some(Platform::MacOs)
        } else if cfg!(target_os = "windows") {
            Some(Platform::Windows)
        } else {
            None
        }
    }
}

/// Capture backend driving an `ffmpeg` child process
pub struct FfmpegBackend {
    binary: PathBuf,
    framerate: u32,
    encoders: OnceCell<HashSet<String>>,
}

impl FfmpegBackend {
    /// Use `ffmpeg` from `PATH`
    pub fn new() -> Self {
        Self::with_binary("ffmpeg")
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            framerate: DEFAULT_FRAMERATE,
            encoders: OnceCell::new(),
        }
    }

    pub fn framerate(mut self, framerate: u32) -> Self {
        self.framerate = framerate.max(1);
        self
    }

    /// Encoders compiled into the FFmpeg binary, probed once
    async fn available_encoders(&self) -> &HashSet<String> {
        self.encoders
            .get_or_init(|| async {
                let output = Command::new(&self.binary)
                    .args(["-hide_banner", "-encoders"])
                    .stdin(Stdio::null())
                    .output()
                    .await;
                match output {
                    Ok(output) if output.status.success() => {
                        parse_encoder_list(&String::from_utf8_lossy(&output.stdout))
                    }
                    Ok(output) => {
                        tracing::warn!(
                            "ffmpeg -encoders failed with {}: {}",
                            output.status,
                            String::from_utf8_lossy(&output.stderr)
                        );
                        HashSet::new()
                    }
                    Err(e) => {
                        tracing::warn!("Failed to run {:?}: {}", self.binary, e);
                        HashSet::new()
                    }
                }
            })
            .await
    }
}

impl Default for FfmpegBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaptureBackend for FfmpegBackend {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn supports_codec(&self, mime_type: &str) -> bool {
        match CodecProfile::from_mime(mime_type) {
            Some(profile) => self
                .available_encoders()
                .await
                .contains(profile.video_encoder),
            None => false,
        }
    }

    async fn acquire(
        &self,
        request: &SourceRequest,
    ) -> Result<Box<dyn MediaSource>, CaptureError> {
        let probe = Command::new(&self.binary)
            .arg("-version")
            .stdin(Stdio::null())
            .output()
            .await;
        if !matches!(probe, Ok(ref output) if output.status.success()) {
            return Err(CaptureError::SourceUnavailable(format!(
                "FFmpeg not found at {:?}",
                self.binary
            )));
        }

        let platform = Platform::current().ok_or_else(|| {
            CaptureError::SourceUnavailable("No capture devices on this platform".to_string())
        })?;

        if platform == Platform::Linux && request.kind == SourceKind::Camera {
            let device = request.device_id.as_deref().unwrap_or(LINUX_DEFAULT_CAMERA);
            if tokio::fs::metadata(device).await.is_err() {
                return Err(CaptureError::SourceUnavailable(format!(
                    "Camera {} not found",
                    device
                )));
            }
        }

        let display = std::env::var("DISPLAY").ok();
        let input = input_args(platform, request, self.framerate, display.as_deref())?;

        tracing::info!(
            "Acquired {} source via ffmpeg ({} input args, audio: {})",
            request.kind,
            input.args.len(),
            input.has_audio
        );

        Ok(Box::new(FfmpegSource {
            binary: self.binary.clone(),
            input,
            audio_encoders: self.available_encoders().await.clone(),
            stdin: None,
            kill_tx: None,
            monitor: None,
            stopping: Arc::new(AtomicBool::new(false)),
            released: false,
        }))
    }
}

const LINUX_DEFAULT_CAMERA: &str = "/dev/video0";

/// Input side of the FFmpeg command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputArgs {
    pub args: Vec<String>,
    pub has_audio: bool,
}

/// Build the grab-device arguments for `request` on `platform`
pub fn input_args(
    platform: Platform,
    request: &SourceRequest,
    framerate: u32,
    display: Option<&str>,
) -> Result<InputArgs, CaptureError> {
    let fps = framerate.to_string();
    let size = format!("{}x{}", request.ideal.width, request.ideal.height);
    let mut args: Vec<String> = Vec::new();
    let mut has_audio = false;

    match (platform, request.kind) {
        (Platform::Linux, SourceKind::Screen) => {
            let display = request
                .device_id
                .as_deref()
                .or(display)
                .ok_or_else(|| {
                    CaptureError::SourceUnavailable("DISPLAY is not set".to_string())
                })?;
            args.extend(
                ["-f", "x11grab", "-framerate", fps.as_str(), "-i", display].map(String::from),
            );
        }
        (Platform::Linux, SourceKind::Camera) => {
            let device = request.device_id.as_deref().unwrap_or(LINUX_DEFAULT_CAMERA);
            args.extend(
                [
                    "-f",
                    "v4l2",
                    "-framerate",
                    fps.as_str(),
                    "-video_size",
                    size.as_str(),
                    "-i",
                    device,
                ]
                .map(String::from),
            );
        }
        (Platform::MacOs, kind) => {
            // avfoundation takes "<video>:<audio>"
            let video = request.device_id.clone().unwrap_or_else(|| match kind {
                SourceKind::Screen => "1".to_string(),
                SourceKind::Camera => "0".to_string(),
            });
            let audio = if request.audio { "0" } else { "none" };
            has_audio = request.audio;
            let mut device_args = vec!["-f", "avfoundation", "-framerate", fps.as_str()];
            if kind == SourceKind::Screen {
                device_args.extend(["-capture_cursor", "1"]);
            } else {
                device_args.extend(["-video_size", size.as_str()]);
            }
            args.extend(device_args.into_iter().map(String::from));
            args.extend(["-i".to_string(), format!("{}:{}", video, audio)]);
        }
        (Platform::Windows, SourceKind::Screen) => {
            let target = request.device_id.as_deref().unwrap_or("desktop");
            args.extend(
                ["-f", "gdigrab", "-framerate", fps.as_str(), "-i", target].map(String::from),
            );
        }
        (Platform::Windows, SourceKind::Camera) => {
            let device = request.device_id.as_deref().ok_or_else(|| {
                CaptureError::SourceUnavailable("dshow capture needs a camera name".to_string())
            })?;
            args.extend(
                [
                    "-f",
                    "dshow",
                    "-framerate",
                    fps.as_str(),
                    "-video_size",
                    size.as_str(),
                ]
                .map(String::from),
            );
            args.extend(["-i".to_string(), format!("video={}", device)]);
        }
    }

    if request.audio && platform == Platform::Linux {
        args.extend(["-f", "pulse", "-i", "default"].map(String::from));
        has_audio = true;
    } else if request.audio && platform == Platform::Windows {
        tracing::warn!("Audio capture is not wired for dshow; recording video only");
    }

    Ok(InputArgs { args, has_audio })
}

/// Encoders reject odd frame sizes
const EVEN_DIMENSIONS: &str = "scale=trunc(iw/2)*2:trunc(ih/2)*2";

/// Build the encoder/muxer arguments writing to stdout
pub fn output_args(
    profile: &CodecProfile,
    settings: &EncoderSettings,
    request_max: (u32, u32),
    with_audio: bool,
) -> Vec<String> {
    let (max_w, max_h) = request_max;
    let mut args = vec![
        "-vf".to_string(),
        format!(
            "scale='min({},iw)':'min({},ih)':force_original_aspect_ratio=decrease,{}",
            max_w, max_h, EVEN_DIMENSIONS
        ),
        "-c:v".to_string(),
        profile.video_encoder.to_string(),
        "-b:v".to_string(),
        settings.bitrate_bps.to_string(),
    ];

    match profile.video_encoder {
        "libvpx-vp9" => args.extend(
            ["-deadline", "realtime", "-cpu-used", "8", "-row-mt", "1"].map(String::from),
        ),
        "libvpx" => args.extend(["-deadline", "realtime", "-cpu-used", "8"].map(String::from)),
        _ => args.extend(
            [
                "-preset",
                "veryfast",
                "-tune",
                "zerolatency",
                "-pix_fmt",
                "yuv420p",
            ]
            .map(String::from),
        ),
    }

    if with_audio {
        args.extend(["-c:a", profile.audio_encoder, "-b:a", AUDIO_BITRATE].map(String::from));
    } else {
        args.push("-an".to_string());
    }

    match profile.container {
        "mp4" => args.extend(
            ["-movflags", "frag_keyframe+empty_moov+default_base_moof", "-f", "mp4"]
                .map(String::from),
        ),
        _ => args.extend(["-cluster_time_limit", "1000", "-f", "webm"].map(String::from)),
    }

    args.push("pipe:1".to_string());
    args
}

/// Parse `ffmpeg -encoders` output into encoder names
pub fn parse_encoder_list(output: &str) -> HashSet<String> {
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("------"))
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let flags = fields.next()?;
            // flags column is six characters such as "V....D"
            if flags.len() != 6 {
                return None;
            }
            fields.next().map(String::from)
        })
        .collect()
}

/// Whether a non-zero FFmpeg exit came from the encoder rather than the input
fn is_encoder_failure(stderr_tail: &str) -> bool {
    let lower = stderr_tail.to_ascii_lowercase();
    lower.contains("error while opening encoder")
        || lower.contains("conversion failed")
        || lower.contains("error initializing output stream")
}

/// Why FFmpeg exited before writing any output
fn startup_error(status: &std::io::Result<ExitStatus>, stderr_tail: &str) -> CaptureError {
    match status {
        Ok(status) if is_encoder_failure(stderr_tail) => {
            CaptureError::Encoder(format!("FFmpeg exited with {}: {}", status, stderr_tail))
        }
        Ok(status) => CaptureError::SourceUnavailable(format!(
            "FFmpeg exited with {} before producing data: {}",
            status, stderr_tail
        )),
        Err(e) => CaptureError::Encoder(format!("Failed to wait for FFmpeg: {}", e)),
    }
}

/// A running (or ready) FFmpeg capture
struct FfmpegSource {
    binary: PathBuf,
    input: InputArgs,
    audio_encoders: HashSet<String>,
    stdin: Option<ChildStdin>,
    kill_tx: Option<oneshot::Sender<()>>,
    monitor: Option<JoinHandle<()>>,
    /// Set once a stop was requested, suppresses the `Ended` event
    stopping: Arc<AtomicBool>,
    released: bool,
}

#[async_trait]
impl MediaSource for FfmpegSource {
    async fn start_encoder(
        &mut self,
        settings: &EncoderSettings,
        events: MediaEventSender,
    ) -> Result<(), CaptureError> {
        let profile = CodecProfile::from_mime(&settings.mime_type).ok_or_else(|| {
            CaptureError::Encoder(format!(
                "Cannot map {} to an FFmpeg encoder",
                settings.mime_type
            ))
        })?;

        let with_audio =
            self.input.has_audio && self.audio_encoders.contains(profile.audio_encoder);
        if self.input.has_audio && !with_audio {
            tracing::warn!(
                "Audio encoder {} unavailable; recording video only",
                profile.audio_encoder
            );
        }

        let mut args: Vec<String> = ["-hide_banner", "-nostats", "-loglevel", "error"]
            .map(String::from)
            .to_vec();
        args.extend(self.input.args.iter().cloned());
        args.extend(output_args(
            &profile,
            settings,
            (
                super::traits::MAX_RESOLUTION.width,
                super::traits::MAX_RESOLUTION.height,
            ),
            with_audio,
        ));

        tracing::info!("Starting FFmpeg capture: {:?}", args);

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CaptureError::Encoder(format!("Failed to start FFmpeg: {}", e)))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Encoder("Failed to capture FFmpeg stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CaptureError::Encoder("Failed to capture FFmpeg stderr".to_string()))?;
        self.stdin = child.stdin.take();

        // resolved by the first data unit or by an exit without output
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), CaptureError>>();
        let ready_tx = Arc::new(Mutex::new(Some(ready_tx)));

        let data_events = events.clone();
        let reader_ready = ready_tx.clone();
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK_SIZE];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        let first = reader_ready.lock().take();
                        if let Some(ready) = first {
                            let _ = ready.send(Ok(()));
                        }
                        if data_events
                            .send(MediaEvent::Data(Bytes::copy_from_slice(&buf[..n])))
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("FFmpeg stdout read failed: {}", e);
                        break;
                    }
                }
            }
        });

        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let stderr_tail = tail.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!("ffmpeg: {}", line);
                let mut tail = stderr_tail.lock();
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        });

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let stopping = self.stopping.clone();
        let monitor = tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            // all data units go out before any lifecycle event
            let _ = reader.await;
            let _ = stderr_task.await;

            if stopping.load(Ordering::SeqCst) {
                return;
            }

            let tail_text = tail.lock().iter().cloned().collect::<Vec<_>>().join("\n");

            // still starting: fail start() instead of reporting an event
            let pending = ready_tx.lock().take();
            if let Some(ready) = pending {
                if ready.send(Err(startup_error(&status, &tail_text))).is_ok() {
                    return;
                }
            }

            let event = match status {
                Ok(status) if status.success() => MediaEvent::Ended,
                Ok(status) if is_encoder_failure(&tail_text) => MediaEvent::EncoderError(
                    format!("FFmpeg exited with {}: {}", status, tail_text),
                ),
                Ok(status) => {
                    tracing::info!("FFmpeg input ended with {}: {}", status, tail_text);
                    MediaEvent::Ended
                }
                Err(e) => MediaEvent::EncoderError(format!("Failed to wait for FFmpeg: {}", e)),
            };
            let _ = events.send(event);
        });

        self.kill_tx = Some(kill_tx);
        self.monitor = Some(monitor);

        match tokio::time::timeout(STARTUP_WINDOW, ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CaptureError::Encoder(
                "FFmpeg monitor stopped during startup".to_string(),
            )),
            Err(_) => {
                tracing::debug!(
                    "No FFmpeg output within {:?}; treating the device as open",
                    STARTUP_WINDOW
                );
                Ok(())
            }
        }
    }

    async fn finalize(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);

        // 'q' on stdin makes FFmpeg flush and write the trailer
        if let Some(mut stdin) = self.stdin.take() {
            if let Err(e) = stdin.write_all(b"q").await {
                tracing::debug!("FFmpeg stdin closed before finalize: {}", e);
            }
            drop(stdin);
        }

        let Some(mut monitor) = self.monitor.take() else {
            return;
        };

        if tokio::time::timeout(FINALIZE_TIMEOUT, &mut monitor).await.is_err() {
            tracing::warn!("FFmpeg did not finish within {:?}; killing", FINALIZE_TIMEOUT);
            if let Some(kill_tx) = self.kill_tx.take() {
                let _ = kill_tx.send(());
            }
            let _ = monitor.await;
        }
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.stopping.store(true, Ordering::SeqCst);
        self.stdin = None;
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        tracing::info!("FFmpeg capture released");
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.release();
    }
}
