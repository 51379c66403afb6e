//! Media backend that shells out to the system `ffmpeg` and `ffprobe`.

use std::collections::{HashMap, VecDeque};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use image::RgbaImage;
use serde::Deserialize;

use overlaykit_common::config::ExportQuality;
use overlaykit_common::error::{OverlayKitError, OverlayKitResult};
use overlaykit_overlay_model::{PixelSize, TrackTransform};

use crate::media::{
    check_pts, FrameReader, FrameWriter, MediaBackend, ProbeInfo, VisualAsset, WriterConfig,
};

/// Frames buffered between `append` and the encoder's stdin.
const DEFAULT_MAX_IN_FLIGHT: usize = 4;

/// ffmpeg subprocess backend.
#[derive(Debug, Clone)]
pub struct FfmpegBackend {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    max_in_flight: usize,
}

impl Default for FfmpegBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegBackend {
    /// Use `ffmpeg` and `ffprobe` from `PATH`.
    pub fn new() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }

    /// Use explicit binaries.
    pub fn with_binaries(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            ..Self::new()
        }
    }

    /// Limit on frames queued ahead of the encoder (minimum 1).
    pub fn with_max_in_flight(mut self, frames: usize) -> Self {
        self.max_in_flight = frames.max(1);
        self
    }
}

impl MediaBackend for FfmpegBackend {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn is_available(&self) -> bool {
        command_exists(&self.ffmpeg) && command_exists(&self.ffprobe)
    }

    fn probe(&self, path: &Path) -> OverlayKitResult<ProbeInfo> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_streams",
                "-show_format",
                "-print_format",
                "json",
            ])
            .arg(path)
            .output()
            .map_err(|e| OverlayKitError::extract_video(format!("failed to run ffprobe: {e}")))?;

        if !output.status.success() {
            return Err(OverlayKitError::extract_video(format!(
                "ffprobe failed for '{}': {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let json = String::from_utf8_lossy(&output.stdout);
        let info = parse_probe_json(&json)?;
        tracing::debug!(
            path = %path.display(),
            size = %info.natural_size,
            duration_secs = info.duration_secs,
            transform = ?info.transform,
            "Probed video"
        );
        Ok(info)
    }

    fn open_writer(&self, config: WriterConfig) -> OverlayKitResult<Box<dyn FrameWriter>> {
        let writer = FfmpegWriter::spawn(&self.ffmpeg, config, self.max_in_flight)?;
        Ok(Box::new(writer))
    }

    fn open_reader(&self, asset: &VisualAsset, fps: u32) -> OverlayKitResult<Box<dyn FrameReader>> {
        let reader = FfmpegReader::spawn(&self.ffmpeg, asset, fps)?;
        Ok(Box::new(reader))
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    duration: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
    #[serde(default)]
    side_data_list: Vec<ProbeSideData>,
}

#[derive(Debug, Deserialize)]
struct ProbeSideData {
    rotation: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Extract size, display transform and duration from `ffprobe -print_format json`.
fn parse_probe_json(json: &str) -> OverlayKitResult<ProbeInfo> {
    let probe: ProbeOutput = serde_json::from_str(json)
        .map_err(|e| OverlayKitError::extract_video(format!("ffprobe json parse failed: {e}")))?;

    let stream = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref().map_or(true, |t| t == "video"))
        .ok_or_else(|| OverlayKitError::extract_video("no video stream"))?;

    let width = stream.width.unwrap_or(0);
    let height = stream.height.unwrap_or(0);
    if width == 0 || height == 0 {
        return Err(OverlayKitError::extract_video(format!(
            "invalid video dimensions {width}x{height}"
        )));
    }

    // Display matrix rotation is counter-clockwise; the legacy tag is clockwise.
    let rotation = stream
        .side_data_list
        .iter()
        .find_map(|sd| sd.rotation)
        .or_else(|| {
            stream
                .tags
                .get("rotate")
                .and_then(|r| r.trim().parse::<f64>().ok())
                .map(|r| -r)
        })
        .unwrap_or(0.0);

    let duration_secs = stream
        .duration
        .as_deref()
        .or_else(|| probe.format.as_ref().and_then(|f| f.duration.as_deref()))
        .and_then(|d| d.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
        .ok_or_else(|| OverlayKitError::extract_video("missing video duration"))?;

    Ok(ProbeInfo {
        natural_size: PixelSize::new(width, height),
        transform: TrackTransform::from_rotation_degrees(rotation),
        duration_secs,
    })
}

fn quality_args(quality: ExportQuality) -> [&'static str; 4] {
    match quality {
        ExportQuality::Low => ["-preset", "veryfast", "-crf", "28"],
        ExportQuality::Medium => ["-preset", "medium", "-crf", "23"],
        ExportQuality::Highest => ["-preset", "slow", "-crf", "17"],
    }
}

/// Arguments for an encoder reading raw RGBA frames from stdin.
fn writer_args(config: &WriterConfig) -> Vec<String> {
    let mut args: Vec<String> = [
        "-y",
        "-loglevel",
        "error",
        "-f",
        "rawvideo",
        "-pix_fmt",
        "rgba",
        "-s",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(config.size.to_string());
    args.push("-framerate".to_string());
    args.push(format!("{}", config.frame_rate));
    args.extend(
        [
            "-i",
            "pipe:0",
            "-an",
            "-vf",
            "pad=ceil(iw/2)*2:ceil(ih/2)*2",
            "-c:v",
            "libx264",
            "-pix_fmt",
            "yuv420p",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    args.extend(quality_args(config.quality).iter().map(|s| s.to_string()));
    if config.optimize_for_network {
        args.push("-movflags".to_string());
        args.push("+faststart".to_string());
    }
    args.push(config.path.to_string_lossy().into_owned());
    args
}

/// Arguments for a decoder writing raw RGBA frames to stdout.
fn reader_args(path: &Path, fps: u32) -> Vec<String> {
    vec![
        "-v".to_string(),
        "error".to_string(),
        "-noautorotate".to_string(),
        "-i".to_string(),
        path.to_string_lossy().into_owned(),
        "-an".to_string(),
        "-vf".to_string(),
        format!("fps={}", fps.max(1)),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "rgba".to_string(),
        "pipe:1".to_string(),
    ]
}

struct FeedState {
    queue: VecDeque<Vec<u8>>,
    closed: bool,
    failure: Option<String>,
}

struct FeedShared {
    state: Mutex<FeedState>,
    changed: Condvar,
}

impl FeedShared {
    fn lock(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Encoder fed through a bounded queue drained by a dedicated thread.
///
/// Readiness is signalled through a condition variable as the feeder
/// thread hands frames to ffmpeg.
pub struct FfmpegWriter {
    path: PathBuf,
    size: PixelSize,
    max_in_flight: usize,
    shared: Arc<FeedShared>,
    feeder: Option<JoinHandle<()>>,
    child: Option<Child>,
    stderr_drain: Option<JoinHandle<String>>,
    last_pts: Option<f64>,
    frames_written: u64,
}

impl FfmpegWriter {
    fn spawn(ffmpeg: &Path, config: WriterConfig, max_in_flight: usize) -> OverlayKitResult<Self> {
        if config.size.is_empty() {
            return Err(OverlayKitError::rendering_failed(
                "writer size must be non-zero",
            ));
        }
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let args = writer_args(&config);
        tracing::debug!(args = ?args, "Spawning ffmpeg encoder");
        let mut child = Command::new(ffmpeg)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| OverlayKitError::rendering_failed(format!("Failed to start ffmpeg: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| OverlayKitError::rendering_failed("Failed to capture ffmpeg stdin"))?;
        let stderr_drain = child.stderr.take().map(spawn_stderr_drain);

        let shared = Arc::new(FeedShared {
            state: Mutex::new(FeedState {
                queue: VecDeque::new(),
                closed: false,
                failure: None,
            }),
            changed: Condvar::new(),
        });

        let feeder_shared = Arc::clone(&shared);
        let feeder = std::thread::Builder::new()
            .name("overlaykit-encoder-feed".to_string())
            .spawn(move || feed_stdin(stdin, feeder_shared))
            .map_err(|e| {
                OverlayKitError::rendering_failed(format!("Failed to spawn encoder feed thread: {e}"))
            })?;

        tracing::info!(
            pid = child.id(),
            output = %config.path.display(),
            size = %config.size,
            frame_rate = config.frame_rate,
            "ffmpeg encoder started"
        );

        Ok(Self {
            path: config.path,
            size: config.size,
            max_in_flight: max_in_flight.max(1),
            shared,
            feeder: Some(feeder),
            child: Some(child),
            stderr_drain,
            last_pts: None,
            frames_written: 0,
        })
    }

    fn close_feed(&mut self) {
        self.shared.lock().closed = true;
        self.shared.changed.notify_all();
        if let Some(feeder) = self.feeder.take() {
            if feeder.join().is_err() {
                tracing::warn!("Encoder feed thread panicked");
            }
        }
    }
}

fn feed_stdin(mut stdin: ChildStdin, shared: Arc<FeedShared>) {
    loop {
        let next = {
            let mut state = shared.lock();
            loop {
                if let Some(frame) = state.queue.pop_front() {
                    break Some(frame);
                }
                if state.closed {
                    break None;
                }
                state = shared
                    .changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        shared.changed.notify_all();

        let Some(frame) = next else {
            break;
        };
        if let Err(e) = stdin.write_all(&frame) {
            let mut state = shared.lock();
            state.failure = Some(format!("failed writing frame to ffmpeg: {e}"));
            state.queue.clear();
            drop(state);
            shared.changed.notify_all();
            break;
        }
    }
}

impl FrameWriter for FfmpegWriter {
    fn is_ready_for_more_data(&self) -> bool {
        let state = self.shared.lock();
        state.failure.is_some() || state.queue.len() < self.max_in_flight
    }

    fn wait_until_ready(&mut self, timeout: Duration) -> OverlayKitResult<()> {
        let start = Instant::now();
        let max = self.max_in_flight;
        let state = self.shared.lock();
        let (state, _) = self
            .shared
            .changed
            .wait_timeout_while(state, timeout, |s| {
                s.failure.is_none() && s.queue.len() >= max
            })
            .unwrap_or_else(PoisonError::into_inner);
        if state.failure.is_none() && state.queue.len() >= max {
            return Err(OverlayKitError::WriterTimedOut {
                waited_ms: start.elapsed().as_millis() as u64,
            });
        }
        Ok(())
    }

    fn append(&mut self, frame: &RgbaImage, pts_secs: f64) -> OverlayKitResult<()> {
        check_pts(self.last_pts, pts_secs)?;
        if frame.dimensions() != (self.size.width, self.size.height) {
            return Err(OverlayKitError::rendering_failed(format!(
                "frame size {}x{} does not match encoder size {}",
                frame.width(),
                frame.height(),
                self.size
            )));
        }

        {
            let mut state = self.shared.lock();
            if let Some(failure) = &state.failure {
                return Err(OverlayKitError::rendering_failed(failure.clone()));
            }
            state.queue.push_back(frame.as_raw().clone());
        }
        self.shared.changed.notify_all();
        self.last_pts = Some(pts_secs);
        self.frames_written += 1;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> OverlayKitResult<()> {
        self.close_feed();

        let status = match self.child.take() {
            Some(mut child) => child
                .wait()
                .map_err(|e| OverlayKitError::rendering_failed(format!("Failed to wait on ffmpeg: {e}")))?,
            None => return Err(OverlayKitError::rendering_failed("ffmpeg already finished")),
        };
        let stderr_output = self
            .stderr_drain
            .take()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| "<failed to join stderr reader>".to_string())
            })
            .unwrap_or_default();

        if let Some(failure) = self.shared.lock().failure.take() {
            return Err(OverlayKitError::rendering_failed(format!(
                "{failure}: {}",
                stderr_output.trim()
            )));
        }
        if !status.success() {
            return Err(OverlayKitError::rendering_failed(format!(
                "ffmpeg encode failed (status {}): {}",
                status,
                stderr_output.trim()
            )));
        }

        tracing::info!(
            output = %self.path.display(),
            frames = self.frames_written,
            "ffmpeg encoder finished"
        );
        Ok(())
    }
}

impl Drop for FfmpegWriter {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            self.close_feed();
            let _ = child.wait();
        }
    }
}

/// Decoder producing raw RGBA frames in natural orientation.
pub struct FfmpegReader {
    child: Option<Child>,
    stdout: BufReader<ChildStdout>,
    stderr_drain: Option<JoinHandle<String>>,
    size: PixelSize,
    done: bool,
}

impl FfmpegReader {
    fn spawn(ffmpeg: &Path, asset: &VisualAsset, fps: u32) -> OverlayKitResult<Self> {
        let args = reader_args(&asset.path, fps);
        tracing::debug!(args = ?args, "Spawning ffmpeg decoder");
        let mut child = Command::new(ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| OverlayKitError::rendering_failed(format!("Failed to start ffmpeg: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OverlayKitError::rendering_failed("Failed to capture ffmpeg stdout"))?;
        let stderr_drain = child.stderr.take().map(spawn_stderr_drain);

        Ok(Self {
            child: Some(child),
            stdout: BufReader::new(stdout),
            stderr_drain,
            size: asset.track.natural_size,
            done: false,
        })
    }

    fn finish_process(&mut self) -> OverlayKitResult<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child
            .wait()
            .map_err(|e| OverlayKitError::rendering_failed(format!("Failed to wait on ffmpeg: {e}")))?;
        let stderr_output = self
            .stderr_drain
            .take()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| "<failed to join stderr reader>".to_string())
            })
            .unwrap_or_default();
        if !status.success() {
            return Err(OverlayKitError::rendering_failed(format!(
                "ffmpeg decode failed (status {}): {}",
                status,
                stderr_output.trim()
            )));
        }
        Ok(())
    }
}

impl FrameReader for FfmpegReader {
    fn next_frame(&mut self) -> OverlayKitResult<Option<RgbaImage>> {
        if self.done {
            return Ok(None);
        }

        let mut buf = vec![0u8; self.size.rgba_len()];
        let filled = read_full(&mut self.stdout, &mut buf)
            .map_err(|e| OverlayKitError::rendering_failed(format!("Failed reading ffmpeg output: {e}")))?;

        if filled < buf.len() {
            self.done = true;
            if filled > 0 {
                tracing::warn!(bytes = filled, "Discarding partial trailing frame from decoder");
            }
            self.finish_process()?;
            return Ok(None);
        }

        let frame = RgbaImage::from_raw(self.size.width, self.size.height, buf)
            .ok_or_else(|| OverlayKitError::rendering_failed("decoded frame buffer has wrong length"))?;
        Ok(Some(frame))
    }
}

impl Drop for FfmpegReader {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// Drained concurrently so ffmpeg never blocks on a full stderr pipe.
fn spawn_stderr_drain(stderr: impl Read + Send + 'static) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut reader = BufReader::new(stderr);
        let mut output = String::new();
        match reader.read_to_string(&mut output) {
            Ok(_) => output,
            Err(err) => format!("<failed to read ffmpeg stderr: {err}>"),
        }
    })
}

fn command_exists(binary: &Path) -> bool {
    Command::new(binary)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}
