use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::{Rgba, RgbaImage};

use overlaykit_common::config::RendererConfig;
use overlaykit_common::error::OverlayKitResult;
use overlaykit_overlay_model::{
    AnimatedOverlay, FillPlayer, Overlay, PixelSize, Rect, Size, TrackTransform,
};
use overlaykit_render_engine::{
    ExportRequest, ExportState, MainContext, MemoryBackend, MemoryClip, SourceMedia, TimedFrame,
    VideoRenderer,
};

const WAIT: Duration = Duration::from_secs(30);

struct Harness {
    renderer: VideoRenderer,
    backend: MemoryBackend,
    scratch: PathBuf,
    library: PathBuf,
}

impl Harness {
    fn new(tag: &str, fps: u32) -> Self {
        Self::build(tag, fps, |_, _| {})
    }

    /// Like `new`, with a hook to adjust the config. The hook gets the
    /// per-test root directory.
    fn build(tag: &str, fps: u32, customize: impl FnOnce(&Path, &mut RendererConfig)) -> Self {
        let (root, config) = test_config(tag, fps);
        let mut config = config;
        customize(&root, &mut config);

        let backend = MemoryBackend::new();
        let renderer = VideoRenderer::new(Arc::new(backend.clone()), config).unwrap();
        Self {
            renderer,
            backend,
            scratch: root.join("scratch"),
            library: root.join("library"),
        }
    }

    /// Run an export and wait for its completion.
    fn export(&self, request: ExportRequest) -> (OverlayKitResult<PathBuf>, bool) {
        let (tx, rx) = mpsc::channel();
        let main = self.renderer.main_context().clone();
        self.renderer.export_video_asset(request, move |result| {
            tx.send((result, main.is_current())).unwrap();
        });
        rx.recv_timeout(WAIT).expect("completion should fire")
    }

    fn scratch_files(&self) -> Vec<PathBuf> {
        list_files(&self.scratch)
    }
}

fn test_config(tag: &str, fps: u32) -> (PathBuf, RendererConfig) {
    let root = std::env::temp_dir().join(format!("overlaykit-it-{}-{tag}", std::process::id()));
    std::fs::remove_dir_all(&root).ok();

    let mut config = RendererConfig::default();
    config.scratch_dir = root.join("scratch");
    config.media_library_dir = root.join("library");
    config.export.fps = fps;
    config.synthesis.writer_ready_timeout_ms = 100;
    config.logging.level = "debug".to_string();
    overlaykit_common::logging::init_logging(&config.logging);
    (root, config)
}

impl Drop for Harness {
    fn drop(&mut self) {
        if let Some(root) = self.scratch.parent() {
            std::fs::remove_dir_all(root).ok();
        }
    }
}

fn list_files(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file())
                .collect()
        })
        .unwrap_or_default()
}

fn full_canvas_fill(color: [u8; 4], width: f64, height: f64) -> AnimatedOverlay<FillPlayer> {
    AnimatedOverlay::new(
        FillPlayer::new(color),
        Rect::new(0.0, 0.0, width, height),
        Size::new(width, height),
    )
}

#[test]
fn invalid_duration_fails_synchronously() {
    let harness = Harness::new("invalid", 5);
    for duration in [0.05, 0.1, 0.0, -3.0, 60.01, f64::NAN] {
        let delivered = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&delivered);
        harness.renderer.export_video_asset(
            ExportRequest::new(
                SourceMedia::pixels(RgbaImage::new(8, 8)),
                duration,
                PixelSize::new(800, 600),
            ),
            move |result| {
                *slot.lock().unwrap() = Some(result);
            },
        );

        let result = delivered.lock().unwrap().take().expect("delivered before return");
        assert_eq!(result.unwrap_err().code(), "invalidDuration");
    }
    assert_eq!(harness.backend.probes(), 0);
    assert_eq!(harness.backend.writers_opened(), 0);
}

#[test]
fn unsupported_source_reports_wrong_asset_type() {
    let harness = Harness::new("wrong-type", 5);
    let (result, on_main) = harness.export(ExportRequest::new(
        SourceMedia::from_path("/music/song.mp3"),
        3.0,
        PixelSize::new(800, 600),
    ));
    assert_eq!(result.unwrap_err().code(), "wrongAssetType");
    assert!(on_main);
    assert_eq!(harness.backend.writers_opened(), 0);
    assert!(harness.scratch_files().is_empty());
}

#[test]
fn still_image_exports_fitted_video() {
    let harness = Harness::new("still", 5);
    let image = RgbaImage::from_pixel(1600, 900, Rgba([20, 40, 60, 255]));
    let request = ExportRequest::new(SourceMedia::pixels(image), 3.0, PixelSize::new(800, 600))
        .with_overlay(full_canvas_fill([255, 255, 255, 128], 800.0, 450.0));

    let (result, on_main) = harness.export(request);
    let output = result.unwrap();
    assert!(on_main);

    let clip = harness.backend.clip(&output).unwrap();
    assert_eq!(clip.natural_size, PixelSize::new(800, 450));
    assert_eq!(clip.frames.len(), 15);
    assert!((clip.duration_secs - 3.0).abs() < 1e-6);

    // Only the output remains; the synthesized intermediate is gone.
    assert_eq!(harness.scratch_files(), vec![output]);
    // Synthesis wrote one writer, the export another.
    assert_eq!(harness.backend.writers_opened(), 2);
}

#[test]
fn landscape_video_with_full_canvas_overlay() {
    let harness = Harness::new("landscape", 2);
    harness.backend.insert_clip(
        "/virtual/landscape.mov",
        MemoryClip::solid(
            PixelSize::new(1920, 1080),
            TrackTransform::IDENTITY,
            3.0,
            [0, 0, 255, 255],
        ),
    );
    let request = ExportRequest::new(
        SourceMedia::Video(PathBuf::from("/virtual/landscape.mov")),
        3.0,
        PixelSize::new(1920, 1080),
    )
    .with_overlay(full_canvas_fill([255, 0, 0, 255], 1920.0, 1080.0));

    let (result, on_main) = harness.export(request);
    let output = result.unwrap();
    assert!(on_main);

    let clip = harness.backend.clip(&output).unwrap();
    assert_eq!(clip.natural_size, PixelSize::new(1920, 1080));
    assert!((clip.duration_secs - 3.0).abs() < 1e-6);
    assert_eq!(clip.frame_times(), vec![0.0, 0.5, 1.0, 1.5, 2.0, 2.5]);

    // Hidden at progress zero, covering the frame afterwards.
    assert_eq!(clip.frames[0].image.get_pixel(960, 540).0, [0, 0, 255, 255]);
    assert_eq!(clip.frames[1].image.get_pixel(960, 540).0, [255, 0, 0, 255]);
}

#[test]
fn portrait_video_swaps_render_size() {
    let harness = Harness::new("portrait", 5);
    harness.backend.insert_clip(
        "/virtual/portrait.mov",
        MemoryClip::solid(
            PixelSize::new(64, 36),
            TrackTransform::from_rotation_degrees(-90.0),
            1.0,
            [10, 10, 10, 255],
        ),
    );
    let (result, _) = harness.export(
        ExportRequest::new(
            SourceMedia::Video(PathBuf::from("/virtual/portrait.mov")),
            1.0,
            PixelSize::new(64, 36),
        )
        .with_overlay(full_canvas_fill([0, 255, 0, 255], 36.0, 64.0)),
    );
    let clip = harness.backend.clip(&result.unwrap()).unwrap();
    assert_eq!(clip.natural_size, PixelSize::new(36, 64));
    assert!(clip
        .frames
        .iter()
        .all(|f| f.image.dimensions() == (36, 64)));
}

#[test]
fn encoder_failure_reports_rendering_failed() {
    let harness = Harness::new("encoder-fail", 5);
    harness.backend.insert_clip(
        "/virtual/clip.mov",
        MemoryClip::solid(PixelSize::new(32, 18), TrackTransform::IDENTITY, 1.0, [0, 0, 0, 255]),
    );
    harness.backend.set_fail_encoding(true);

    let (result, on_main) = harness.export(ExportRequest::new(
        SourceMedia::Video(PathBuf::from("/virtual/clip.mov")),
        1.0,
        PixelSize::new(32, 18),
    ));
    assert_eq!(result.unwrap_err().code(), "renderingFailed");
    assert!(on_main);
    assert!(harness.scratch_files().is_empty());
}

#[test]
fn mismatched_source_frame_fails_output_image() {
    let harness = Harness::new("mismatch", 5);
    harness.backend.insert_clip(
        "/virtual/lying.mov",
        MemoryClip {
            natural_size: PixelSize::new(64, 36),
            transform: TrackTransform::IDENTITY,
            duration_secs: 1.0,
            frames: vec![TimedFrame {
                presentation_secs: 0.0,
                image: Arc::new(RgbaImage::new(32, 18)),
            }],
        },
    );
    let (result, _) = harness.export(ExportRequest::new(
        SourceMedia::Video(PathBuf::from("/virtual/lying.mov")),
        1.0,
        PixelSize::new(64, 36),
    ));
    assert_eq!(result.unwrap_err().code(), "failedToGetOutputImage");
    assert!(harness.scratch_files().is_empty());
}

#[test]
fn stalled_writer_times_out() {
    let harness = Harness::new("stall", 5);
    harness.backend.insert_clip(
        "/virtual/clip.mov",
        MemoryClip::solid(PixelSize::new(16, 16), TrackTransform::IDENTITY, 1.0, [0, 0, 0, 255]),
    );
    harness.backend.set_stall_writers(true);
    let (result, _) = harness.export(ExportRequest::new(
        SourceMedia::Video(PathBuf::from("/virtual/clip.mov")),
        1.0,
        PixelSize::new(16, 16),
    ));
    assert_eq!(result.unwrap_err().code(), "writerTimedOut");
}

#[test]
fn transparent_overlay_leaves_frames_unchanged() {
    let harness = Harness::new("transparent", 5);
    let source = RgbaImage::from_fn(24, 12, |x, y| Rgba([x as u8 * 10, y as u8 * 20, 99, 255]));
    harness.backend.insert_clip(
        "/virtual/gradient.mov",
        MemoryClip {
            natural_size: PixelSize::new(24, 12),
            transform: TrackTransform::IDENTITY,
            duration_secs: 1.0,
            frames: vec![TimedFrame {
                presentation_secs: 0.0,
                image: Arc::new(source.clone()),
            }],
        },
    );
    let (result, _) = harness.export(
        ExportRequest::new(
            SourceMedia::Video(PathBuf::from("/virtual/gradient.mov")),
            1.0,
            PixelSize::new(24, 12),
        )
        .with_overlay(full_canvas_fill([200, 0, 0, 0], 24.0, 12.0)),
    );
    let clip = harness.backend.clip(&result.unwrap()).unwrap();
    assert_eq!(clip.frames.len(), 5);
    assert!(clip.frames.iter().all(|f| *f.image == source));
}

/// Records whether any overlay call happened off the main context.
struct AffinityOverlay {
    main: MainContext,
    violated: Arc<AtomicBool>,
    frame: Rect,
}

impl AffinityOverlay {
    fn check(&self) {
        if !self.main.is_current() {
            self.violated.store(true, Ordering::SeqCst);
        }
    }
}

impl Overlay for AffinityOverlay {
    fn placement_in(&self, canvas: Size) -> Rect {
        self.check();
        Rect::from_size(canvas)
    }

    fn prepare_to_render(&mut self, rect: Rect) {
        self.check();
        self.frame = rect;
    }

    fn advance_to(&mut self, _progress: f64) {
        self.check();
    }

    fn rasterize(&mut self) -> Option<RgbaImage> {
        self.check();
        None
    }

    fn frame(&self) -> Rect {
        self.frame
    }

    fn is_hidden(&self) -> bool {
        false
    }
}

#[test]
fn overlays_only_run_on_main_context() {
    let harness = Harness::new("affinity", 10);
    harness.backend.insert_clip(
        "/virtual/clip.mov",
        MemoryClip::solid(PixelSize::new(16, 16), TrackTransform::IDENTITY, 1.0, [0, 0, 0, 255]),
    );
    let violated = Arc::new(AtomicBool::new(false));
    let overlay = AffinityOverlay {
        main: harness.renderer.main_context().clone(),
        violated: Arc::clone(&violated),
        frame: Rect::ZERO,
    };
    let (result, _) = harness.export(
        ExportRequest::new(
            SourceMedia::Video(PathBuf::from("/virtual/clip.mov")),
            1.0,
            PixelSize::new(16, 16),
        )
        .with_overlay(overlay),
    );
    assert!(result.is_ok());
    assert!(!violated.load(Ordering::SeqCst));
}

/// An overlay whose rasterizer panics once it becomes visible.
struct PanickingOverlay;

impl Overlay for PanickingOverlay {
    fn placement_in(&self, canvas: Size) -> Rect {
        Rect::from_size(canvas)
    }

    fn prepare_to_render(&mut self, _rect: Rect) {}

    fn advance_to(&mut self, _progress: f64) {}

    fn rasterize(&mut self) -> Option<RgbaImage> {
        panic!("animation engine crashed");
    }

    fn frame(&self) -> Rect {
        Rect::ZERO
    }

    fn is_hidden(&self) -> bool {
        false
    }
}

#[test]
fn panicking_overlay_fails_export_and_renderer_recovers() {
    let harness = Harness::new("overlay-panic", 5);
    harness.backend.insert_clip(
        "/virtual/clip.mov",
        MemoryClip::solid(PixelSize::new(16, 16), TrackTransform::IDENTITY, 1.0, [0, 0, 0, 255]),
    );
    let request = || {
        ExportRequest::new(
            SourceMedia::Video(PathBuf::from("/virtual/clip.mov")),
            1.0,
            PixelSize::new(16, 16),
        )
    };

    let (result, on_main) = harness.export(request().with_overlay(PanickingOverlay));
    assert_eq!(result.unwrap_err().code(), "failedToGetOutputImage");
    assert!(on_main);
    assert!(harness.scratch_files().is_empty());

    let (result, on_main) = harness.export(request());
    assert!(result.is_ok());
    assert!(on_main);

    let (result, on_main) = harness.export(
        request().with_overlay(full_canvas_fill([0, 255, 0, 255], 16.0, 16.0)),
    );
    let clip = harness.backend.clip(&result.unwrap()).unwrap();
    assert!(on_main);
    assert_eq!(clip.frames[1].image.get_pixel(8, 8).0, [0, 255, 0, 255]);
}

/// Point the scratch directory below a regular file so it cannot be created.
fn block_scratch_dir(root: &Path, config: &mut RendererConfig) {
    std::fs::create_dir_all(root).unwrap();
    let blocker = root.join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();
    config.scratch_dir = blocker.join("scratch");
}

#[test]
fn unwritable_scratch_dir_stays_in_error_taxonomy() {
    let harness = Harness::build("blocked-scratch", 5, block_scratch_dir);
    harness.backend.insert_clip(
        "/virtual/clip.mov",
        MemoryClip::solid(PixelSize::new(16, 16), TrackTransform::IDENTITY, 1.0, [0, 0, 0, 255]),
    );

    let (result, on_main) = harness.export(ExportRequest::new(
        SourceMedia::pixels(RgbaImage::new(16, 16)),
        2.0,
        PixelSize::new(16, 16),
    ));
    assert_eq!(result.unwrap_err().code(), "failedToExtractImage");
    assert!(on_main);

    let (result, on_main) = harness.export(ExportRequest::new(
        SourceMedia::Video(PathBuf::from("/virtual/clip.mov")),
        1.0,
        PixelSize::new(16, 16),
    ));
    assert_eq!(result.unwrap_err().code(), "renderingFailed");
    assert!(on_main);
}

#[test]
fn dropping_renderer_completes_exports_in_flight() {
    let (root, mut config) = test_config("drop-in-flight", 5);
    config.synthesis.writer_ready_timeout_ms = 5_000;

    let backend = MemoryBackend::new();
    backend.insert_clip(
        "/virtual/clip.mov",
        MemoryClip::solid(PixelSize::new(16, 16), TrackTransform::IDENTITY, 1.0, [0, 0, 0, 255]),
    );
    backend.set_stall_writers(true);
    let renderer = VideoRenderer::new(Arc::new(backend.clone()), config).unwrap();
    let main = renderer.main_context().clone();

    let (tx, rx) = mpsc::channel();
    renderer.export_video_asset(
        ExportRequest::new(
            SourceMedia::Video(PathBuf::from("/virtual/clip.mov")),
            1.0,
            PixelSize::new(16, 16),
        ),
        move |result| tx.send((result, main.is_current())).unwrap(),
    );

    // Wait until the encode loop is blocked on the stalled writer.
    let deadline = std::time::Instant::now() + WAIT;
    while backend.writers_opened() == 0 {
        assert!(std::time::Instant::now() < deadline, "writer never opened");
        std::thread::sleep(Duration::from_millis(5));
    }
    drop(renderer);

    let (result, on_main) = rx.recv_timeout(Duration::from_secs(2)).expect("completion should fire");
    assert_eq!(result.unwrap_err().code(), "renderingFailed");
    assert!(on_main);
    assert!(rx.recv_timeout(Duration::from_secs(6)).is_err());
    std::fs::remove_dir_all(root).ok();
}

#[test]
fn progress_reports_walk_the_state_machine() {
    let harness = Harness::new("progress", 5);
    harness.backend.insert_clip(
        "/virtual/clip.mov",
        MemoryClip::solid(PixelSize::new(16, 16), TrackTransform::IDENTITY, 2.0, [0, 0, 0, 255]),
    );
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    let request = ExportRequest::new(
        SourceMedia::Video(PathBuf::from("/virtual/clip.mov")),
        2.0,
        PixelSize::new(16, 16),
    )
    .with_progress(move |p| sink.lock().unwrap().push(p));

    let (result, _) = harness.export(request);
    assert!(result.is_ok());

    let reports = reports.lock().unwrap();
    let states: Vec<ExportState> = reports.iter().map(|r| r.state).collect();
    assert_eq!(states.first(), Some(&ExportState::Normalizing));
    assert_eq!(states.last(), Some(&ExportState::Succeeded));
    assert!(states.contains(&ExportState::Composing));

    let last = reports.last().unwrap();
    assert_eq!(last.progress, 1.0);
    assert_eq!(last.total_frames, 10);
    let frames: Vec<u64> = reports
        .iter()
        .filter(|r| r.state == ExportState::Exporting)
        .map(|r| r.frames_rendered)
        .collect();
    assert!(frames.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(frames.last(), Some(&10));
}

#[test]
fn save_to_media_store_always_deletes_temp_file() {
    let harness = Harness::new("save", 5);
    harness.backend.insert_clip(
        "/virtual/clip.mov",
        MemoryClip::solid(PixelSize::new(16, 16), TrackTransform::IDENTITY, 1.0, [0, 0, 0, 255]),
    );
    let (result, _) = harness.export(ExportRequest::new(
        SourceMedia::Video(PathBuf::from("/virtual/clip.mov")),
        1.0,
        PixelSize::new(16, 16),
    ));
    let output = result.unwrap();
    assert!(output.exists());

    let (tx, rx) = mpsc::channel();
    let main = harness.renderer.main_context().clone();
    harness
        .renderer
        .save_to_media_store(output.clone(), move || tx.send(main.is_current()).unwrap());
    assert!(rx.recv_timeout(WAIT).unwrap());

    assert!(!output.exists());
    assert_eq!(list_files(&harness.library).len(), 1);
}

#[tokio::test]
async fn export_future_resolves_with_location() {
    let harness = Harness::new("async", 5);
    harness.backend.insert_clip(
        "/virtual/clip.mov",
        MemoryClip::solid(PixelSize::new(16, 16), TrackTransform::IDENTITY, 1.0, [0, 0, 0, 255]),
    );
    let output = harness
        .renderer
        .export(ExportRequest::new(
            SourceMedia::Video(PathBuf::from("/virtual/clip.mov")),
            1.0,
            PixelSize::new(16, 16),
        ))
        .await
        .unwrap();
    assert_eq!(output.extension().unwrap(), "mov");

    harness.renderer.save(output.clone()).await;
    assert!(!output.exists());
}
