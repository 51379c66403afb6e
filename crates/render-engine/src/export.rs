//! Export orchestration: normalize, compose, encode, report.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use image::RgbaImage;
use uuid::Uuid;

use overlaykit_common::clock::{is_valid_duration, FrameTiming, ProgressClock};
use overlaykit_common::config::RendererConfig;
use overlaykit_common::error::{OverlayKitError, OverlayKitResult};
use overlaykit_overlay_model::{Overlay, PixelSize};
use overlaykit_platform::{DirectoryMediaStore, MediaStore};

use crate::compositor::FrameCompositor;
use crate::main_context::MainContext;
use crate::media::{AssetOrigin, MediaBackend, SourceMedia, VisualAsset, WriterConfig};
use crate::normalize::{self, remove_scratch_file, NormalizeOptions};
use crate::orientation::{self, RenderCanvas};

/// Stages of one export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportState {
    Idle,
    Normalizing,
    Composing,
    Exporting,
    Succeeded,
    Failed,
}

impl ExportState {
    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(self, next: ExportState) -> bool {
        use ExportState::*;
        matches!(
            (self, next),
            (Idle, Normalizing)
                | (Normalizing, Composing)
                | (Composing, Exporting)
                | (Exporting, Succeeded)
                | (Idle | Normalizing | Composing | Exporting, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ExportState::Succeeded | ExportState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExportState::Idle => "idle",
            ExportState::Normalizing => "normalizing",
            ExportState::Composing => "composing",
            ExportState::Exporting => "exporting",
            ExportState::Succeeded => "succeeded",
            ExportState::Failed => "failed",
        }
    }
}

/// Progress callback for export rendering. Invoked on a worker thread.
pub type ProgressCallback = Box<dyn Fn(ExportProgress) + Send + Sync>;

/// Export progress report.
#[derive(Debug, Clone)]
pub struct ExportProgress {
    /// Current progress [0.0, 1.0].
    pub progress: f64,

    /// Frames rendered so far.
    pub frames_rendered: u64,

    /// Total frames to render.
    pub total_frames: u64,

    /// Estimated time remaining in seconds.
    pub eta_secs: f64,

    /// Current stage.
    pub state: ExportState,
}

/// One export call's inputs.
pub struct ExportRequest {
    pub source: SourceMedia,

    /// Requested length in seconds, within (0.1, 60].
    pub duration_secs: f64,

    /// Target size for still-image sources.
    pub resolution: PixelSize,

    /// Overlays in paint order, later entries on top.
    pub overlays: Vec<Box<dyn Overlay>>,

    pub progress: Option<ProgressCallback>,
}

impl ExportRequest {
    pub fn new(source: SourceMedia, duration_secs: f64, resolution: PixelSize) -> Self {
        Self {
            source,
            duration_secs,
            resolution,
            overlays: Vec::new(),
            progress: None,
        }
    }

    pub fn with_overlay(mut self, overlay: impl Overlay + 'static) -> Self {
        self.overlays.push(Box::new(overlay));
        self
    }

    pub fn with_progress(mut self, callback: impl Fn(ExportProgress) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }
}

/// Tracks one pass through the export state machine.
struct ExportJob {
    id: Uuid,
    state: ExportState,
    started: Instant,
    total_frames: u64,
    progress: Option<ProgressCallback>,
}

impl ExportJob {
    fn new(progress: Option<ProgressCallback>) -> Self {
        Self::with_id(Uuid::new_v4(), progress)
    }

    fn with_id(id: Uuid, progress: Option<ProgressCallback>) -> Self {
        Self {
            id,
            state: ExportState::Idle,
            started: Instant::now(),
            total_frames: 0,
            progress,
        }
    }

    fn transition(&mut self, next: ExportState) {
        if !self.state.can_transition_to(next) {
            tracing::error!(
                job = %self.id,
                from = self.state.as_str(),
                to = next.as_str(),
                "Ignoring invalid export state transition"
            );
            return;
        }
        tracing::info!(
            job = %self.id,
            from = self.state.as_str(),
            to = next.as_str(),
            "Export state changed"
        );
        self.state = next;

        let frames = match next {
            ExportState::Succeeded => self.total_frames,
            _ => 0,
        };
        self.report(frames);
    }

    fn report(&self, frames_rendered: u64) {
        if let Some(cb) = &self.progress {
            cb(progress_report(
                frames_rendered,
                self.total_frames,
                self.started.elapsed().as_secs_f64(),
                self.state,
            ));
        }
    }
}

fn progress_report(
    frames_rendered: u64,
    total_frames: u64,
    elapsed_secs: f64,
    state: ExportState,
) -> ExportProgress {
    let progress = match state {
        ExportState::Succeeded => 1.0,
        _ if total_frames == 0 => 0.0,
        _ => (frames_rendered as f64 / total_frames as f64).clamp(0.0, 1.0),
    };
    let eta_secs = if progress > 0.0 && state == ExportState::Exporting {
        (elapsed_secs / progress) - elapsed_secs
    } else {
        0.0
    }
    .max(0.0);

    ExportProgress {
        progress,
        frames_rendered,
        total_frames,
        eta_secs,
        state,
    }
}

type ExportCompletion = Box<dyn FnOnce(OverlayKitResult<PathBuf>) + Send + 'static>;

/// Completions of exports that have not reached a terminal state yet.
///
/// Whoever takes a completion out first delivers it.
#[derive(Clone, Default)]
struct PendingExports {
    slots: Arc<Mutex<HashMap<Uuid, ExportCompletion>>>,
}

impl PendingExports {
    fn insert(&self, id: Uuid, completion: ExportCompletion) {
        self.lock().insert(id, completion);
    }

    fn take(&self, id: Uuid) -> Option<ExportCompletion> {
        self.lock().remove(&id)
    }

    fn drain(&self) -> Vec<(Uuid, ExportCompletion)> {
        self.lock().drain().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, ExportCompletion>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Everything a background export needs, detached from the renderer.
#[derive(Clone)]
struct ExportEnv {
    backend: Arc<dyn MediaBackend>,
    config: RendererConfig,
    main: MainContext,
}

/// Composites overlays onto images and videos and exports the result.
///
/// Owns a background worker pool for decoding, synthesis and encoding, and
/// a [`MainContext`] that runs all drawing and delivers every completion.
///
/// Dropping the renderer abandons exports still in flight and completes
/// each of them with `renderingFailed`. Pending media store saves that have
/// not started are discarded without running their completion.
pub struct VideoRenderer {
    env: ExportEnv,
    pending: PendingExports,
    media_store: Arc<dyn MediaStore>,
    handle: tokio::runtime::Handle,
    runtime: Option<tokio::runtime::Runtime>,
}

impl VideoRenderer {
    pub fn new(backend: Arc<dyn MediaBackend>, config: RendererConfig) -> OverlayKitResult<Self> {
        config.validate()?;
        if !backend.is_available() {
            tracing::warn!(backend = backend.name(), "Media backend is not available on this system");
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name("overlaykit-worker")
            .enable_all()
            .build()?;
        let main = MainContext::spawn("overlaykit-main")?;
        let media_store: Arc<dyn MediaStore> =
            Arc::new(DirectoryMediaStore::new(config.media_library_dir.clone()));

        tracing::info!(
            backend = backend.name(),
            scratch_dir = %config.scratch_dir.display(),
            fps = config.export.fps,
            "Video renderer ready"
        );

        Ok(Self {
            env: ExportEnv {
                backend,
                config,
                main,
            },
            pending: PendingExports::default(),
            media_store,
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
        })
    }

    /// Replace the default directory media store.
    pub fn with_media_store(mut self, store: Arc<dyn MediaStore>) -> Self {
        self.media_store = store;
        self
    }

    pub fn config(&self) -> &RendererConfig {
        &self.env.config
    }

    /// The lane that runs drawing and completion callbacks.
    pub fn main_context(&self) -> &MainContext {
        &self.env.main
    }

    /// Start an export.
    ///
    /// `completion` runs exactly once. An invalid duration is reported
    /// synchronously on the calling thread before any work starts; every
    /// other outcome is delivered on the main context.
    pub fn export_video_asset(
        &self,
        request: ExportRequest,
        completion: impl FnOnce(OverlayKitResult<PathBuf>) + Send + 'static,
    ) {
        let ExportRequest {
            source,
            duration_secs,
            resolution,
            overlays,
            progress,
        } = request;
        let mut job = ExportJob::new(progress);

        if !is_valid_duration(duration_secs) {
            tracing::warn!(job = %job.id, duration_secs, "Rejecting export with invalid duration");
            job.transition(ExportState::Failed);
            completion(Err(OverlayKitError::invalid_duration(duration_secs)));
            return;
        }

        tracing::info!(
            job = %job.id,
            duration_secs,
            resolution = %resolution,
            overlays = overlays.len(),
            "Starting export"
        );

        let id = job.id;
        self.pending.insert(id, Box::new(completion));
        let env = self.env.clone();
        let pending = self.pending.clone();
        self.handle.spawn(async move {
            job.transition(ExportState::Normalizing);
            let (mut job, result) =
                run_export(&env, job, source, duration_secs, resolution, overlays).await;
            match &result {
                Ok(path) => {
                    job.transition(ExportState::Succeeded);
                    tracing::info!(
                        job = %job.id,
                        output = %path.display(),
                        elapsed_secs = job.started.elapsed().as_secs_f64(),
                        "Export finished"
                    );
                }
                Err(e) => {
                    job.transition(ExportState::Failed);
                    tracing::error!(job = %job.id, code = e.code(), error = %e, "Export failed");
                }
            }
            if let Some(completion) = pending.take(id) {
                deliver(&env.main, completion, result);
            }
        });
    }

    /// Async form of [`export_video_asset`](Self::export_video_asset).
    pub async fn export(&self, request: ExportRequest) -> OverlayKitResult<PathBuf> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.export_video_asset(request, move |result| {
            let _ = tx.send(result);
        });
        rx.await.map_err(|_| OverlayKitError::ContextClosed)?
    }

    /// Save a finished export to the media store, then delete it.
    ///
    /// The file is deleted whether or not the save succeeds. `completion`
    /// runs on the main context.
    pub fn save_to_media_store(&self, location: PathBuf, completion: impl FnOnce() + Send + 'static) {
        let store = Arc::clone(&self.media_store);
        let main = self.env.main.clone();
        self.handle.spawn_blocking(move || {
            match store.save(&location) {
                Ok(saved) => tracing::info!(
                    store = store.name(),
                    saved = %saved.display(),
                    "Export saved"
                ),
                Err(e) => tracing::warn!(
                    store = store.name(),
                    source = %location.display(),
                    error = %e,
                    "Failed to save export"
                ),
            }
            remove_scratch_file(&location);
            deliver(&main, |()| completion(), ());
        });
    }

    /// Async form of [`save_to_media_store`](Self::save_to_media_store).
    pub async fn save(&self, location: PathBuf) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.save_to_media_store(location, move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }
}

impl Drop for VideoRenderer {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        for (id, completion) in self.pending.drain() {
            tracing::warn!(job = %id, "Renderer dropped with export in flight");
            deliver(
                &self.env.main,
                completion,
                Err(OverlayKitError::rendering_failed(
                    "renderer dropped before the export finished",
                )),
            );
        }
    }
}

/// Run `completion(value)` on the main context exactly once, inline if the
/// context has already shut down.
fn deliver<T: Send + 'static>(
    main: &MainContext,
    completion: impl FnOnce(T) + Send + 'static,
    value: T,
) {
    let slot = Arc::new(Mutex::new(Some((completion, value))));
    let lane_slot = Arc::clone(&slot);
    let dispatched = main.dispatch(move || {
        if let Some((completion, value)) = take_slot(&lane_slot) {
            completion(value);
        }
    });
    if dispatched.is_err() {
        tracing::warn!("Main context closed; delivering completion on worker thread");
        if let Some((completion, value)) = take_slot(&slot) {
            completion(value);
        }
    }
}

fn take_slot<S>(slot: &Mutex<Option<S>>) -> Option<S> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

async fn run_export(
    env: &ExportEnv,
    mut job: ExportJob,
    source: SourceMedia,
    duration_secs: f64,
    resolution: PixelSize,
    overlays: Vec<Box<dyn Overlay>>,
) -> (ExportJob, OverlayKitResult<PathBuf>) {
    let asset = match normalize::normalize(
        Arc::clone(&env.backend),
        source,
        duration_secs,
        resolution,
        NormalizeOptions::from_config(&env.config),
    )
    .await
    {
        Ok(asset) => asset,
        Err(e) => return (job, Err(e)),
    };

    job.transition(ExportState::Composing);
    let (job, result) = compose_and_encode(env, job, &asset, overlays).await;

    if asset.origin == AssetOrigin::Synthesized {
        remove_scratch_file(&asset.path);
    }
    (job, result)
}

async fn compose_and_encode(
    env: &ExportEnv,
    mut job: ExportJob,
    asset: &VisualAsset,
    overlays: Vec<Box<dyn Overlay>>,
) -> (ExportJob, OverlayKitResult<PathBuf>) {
    let canvas = orientation::resolve(&asset.track);
    let timing = FrameTiming::new(env.config.export.fps);
    job.total_frames = timing.frame_count(asset.duration_secs);

    let compositor = FrameCompositor::new(overlays, ProgressClock::new(asset.duration_secs));
    let output = env.config.scratch_dir.join(format!(
        "{}.{}",
        Uuid::new_v4(),
        env.config.export.container.extension()
    ));

    let id = job.id;
    let env = env.clone();
    let asset = asset.clone();
    let task = tokio::task::spawn_blocking(move || {
        let result = encode_frames(&env, &mut job, &asset, canvas, timing, compositor, &output);
        if result.is_err() {
            remove_scratch_file(&output);
        }
        (job, result.map(|()| output))
    })
    .await;

    match task {
        Ok(outcome) => outcome,
        Err(e) => (
            ExportJob::with_id(id, None),
            Err(OverlayKitError::rendering_failed(format!("encode task failed: {e}"))),
        ),
    }
}

/// Prime the overlays on the main context, then decode, composite and
/// encode every output frame. Runs on the blocking pool.
fn encode_frames(
    env: &ExportEnv,
    job: &mut ExportJob,
    asset: &VisualAsset,
    canvas: RenderCanvas,
    timing: FrameTiming,
    compositor: FrameCompositor,
    output: &Path,
) -> OverlayKitResult<()> {
    let compositor = Arc::new(Mutex::new(compositor));
    {
        let compositor = Arc::clone(&compositor);
        env.main.run_sync(move || {
            compositor
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .prime(&canvas)
        })??;
    }
    tracing::info!(
        job = %job.id,
        output = %output.display(),
        render_size = %canvas.size,
        is_portrait = canvas.is_portrait,
        total_frames = job.total_frames,
        "Composition ready"
    );
    job.transition(ExportState::Exporting);

    let synthesis = &env.config.synthesis;
    let ready_timeout = Duration::from_millis(synthesis.writer_ready_timeout_ms);

    let mut reader = env
        .backend
        .open_reader(asset, timing.fps())
        .map_err(into_rendering_failure)?;
    let mut writer = env
        .backend
        .open_writer(WriterConfig {
            path: output.to_path_buf(),
            size: canvas.size,
            frame_rate: f64::from(timing.fps()),
            quality: env.config.export.quality,
            optimize_for_network: env.config.export.optimize_for_network,
            ready_poll_interval: Duration::from_millis(synthesis.ready_poll_interval_ms),
        })
        .map_err(into_rendering_failure)?;

    let mut held: Option<RgbaImage> = None;
    for index in 0..job.total_frames {
        let timestamp = timing.timestamp_of(index);
        let source = match reader.next_frame()? {
            Some(frame) => {
                let frame = canvas.orient(frame);
                held = Some(frame.clone());
                frame
            }
            None => held
                .clone()
                .ok_or_else(|| OverlayKitError::rendering_failed("decoder produced no frames"))?,
        };

        let compositor = Arc::clone(&compositor);
        let frame = env.main.run_sync(move || {
            compositor
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .composite(timestamp, source)
        })??;

        writer.wait_until_ready(ready_timeout)?;
        writer.append(&frame, timestamp)?;
        job.report(index + 1);
    }

    writer.finish()
}

/// Reader and writer setup touches the scratch directory; its I/O failures
/// surface as `renderingFailed`.
fn into_rendering_failure(e: OverlayKitError) -> OverlayKitError {
    match e {
        OverlayKitError::Io(e) => {
            OverlayKitError::rendering_failed(format!("cannot prepare export output: {e}"))
        }
        other => other,
    }
}
