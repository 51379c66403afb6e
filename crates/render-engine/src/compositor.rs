//! Frame compositor: advances overlays to a frame's progress, flattens them
//! onto an offscreen canvas and blends the result atop the source frame.

use std::panic::{self, AssertUnwindSafe};

use image::imageops::{self, FilterType};
use image::RgbaImage;

use overlaykit_common::clock::ProgressClock;
use overlaykit_common::error::{OverlayKitError, OverlayKitResult};
use overlaykit_overlay_model::{Overlay, PixelSize, Rect};

use crate::blend;
use crate::main_context::panic_message;
use crate::orientation::RenderCanvas;

/// Transparent offscreen canvas the size of the render canvas.
#[derive(Debug, Clone)]
pub struct OverlayCanvas {
    image: RgbaImage,
}

impl OverlayCanvas {
    pub fn new(size: PixelSize) -> Self {
        Self {
            image: RgbaImage::new(size.width, size.height),
        }
    }

    /// Draw `raster` into `rect`, resampling when sizes differ. Pixels
    /// outside the canvas are clipped.
    pub fn draw(&mut self, raster: &RgbaImage, rect: Rect) {
        let target = rect.pixel_size();
        if target.is_empty() || raster.width() == 0 || raster.height() == 0 {
            return;
        }
        let (x, y) = rect.pixel_origin();
        if raster.dimensions() == (target.width, target.height) {
            imageops::overlay(&mut self.image, raster, x, y);
        } else {
            let scaled = imageops::resize(raster, target.width, target.height, FilterType::Triangle);
            imageops::overlay(&mut self.image, &scaled, x, y);
        }
    }

    /// Whether nothing has been drawn with any coverage.
    pub fn is_transparent(&self) -> bool {
        self.image.pixels().all(|p| p.0[3] == 0)
    }

    pub fn into_image(self) -> RgbaImage {
        self.image
    }
}

/// Per-frame compositing callback state for one export.
pub struct FrameCompositor {
    overlays: Vec<Box<dyn Overlay>>,
    clock: ProgressClock,
    render_size: PixelSize,
}

impl FrameCompositor {
    /// Overlays are composited in the given order, later on top.
    pub fn new(overlays: Vec<Box<dyn Overlay>>, clock: ProgressClock) -> Self {
        Self {
            overlays,
            clock,
            render_size: PixelSize::new(0, 0),
        }
    }

    pub fn overlay_count(&self) -> usize {
        self.overlays.len()
    }

    pub fn render_size(&self) -> PixelSize {
        self.render_size
    }

    /// Resolve every overlay's placement against the canvas.
    pub fn prime(&mut self, canvas: &RenderCanvas) -> OverlayKitResult<()> {
        self.render_size = canvas.size;
        let size = canvas.point_size();
        for (index, overlay) in self.overlays.iter_mut().enumerate() {
            let rect = guarded(index, "placement", || {
                let rect = overlay.placement_in(size);
                overlay.prepare_to_render(rect);
                rect
            })?;
            tracing::debug!(
                overlay = index,
                x = rect.x,
                y = rect.y,
                width = rect.width,
                height = rect.height,
                "Placed overlay"
            );
        }
        Ok(())
    }

    /// Composite the overlays at `timestamp_secs` atop `source`.
    pub fn composite(&mut self, timestamp_secs: f64, source: RgbaImage) -> OverlayKitResult<RgbaImage> {
        if source.dimensions() != (self.render_size.width, self.render_size.height) {
            return Err(OverlayKitError::output_image(format!(
                "source frame is {}x{} but render size is {}",
                source.width(),
                source.height(),
                self.render_size
            )));
        }

        let progress = self.clock.progress_at(timestamp_secs);
        for (index, overlay) in self.overlays.iter_mut().enumerate() {
            guarded(index, "advance", || overlay.advance_to(progress))?;
        }

        let mut canvas = OverlayCanvas::new(self.render_size);
        for (index, overlay) in self.overlays.iter_mut().enumerate() {
            let drawn = guarded(index, "rasterize", || {
                if overlay.is_hidden() {
                    return None;
                }
                overlay.rasterize().map(|raster| (raster, overlay.frame()))
            })?;
            if let Some((raster, rect)) = drawn {
                canvas.draw(&raster, rect);
            }
        }
        if canvas.is_transparent() {
            return Ok(source);
        }

        let mut output = source;
        blend::source_atop_in_place(&mut output, &canvas.into_image())?;
        Ok(output)
    }
}

/// Run one overlay call, reporting a panic as `failedToGetOutputImage`.
fn guarded<R>(index: usize, stage: &str, call: impl FnOnce() -> R) -> OverlayKitResult<R> {
    panic::catch_unwind(AssertUnwindSafe(call)).map_err(|payload| {
        let message = panic_message(payload.as_ref());
        tracing::error!(overlay = index, stage, panic = %message, "Overlay panicked");
        OverlayKitError::output_image(format!("overlay {index} panicked during {stage}: {message}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use overlaykit_overlay_model::{AnimatedOverlay, FillPlayer, Size, TrackTransform};

    fn canvas(width: u32, height: u32) -> RenderCanvas {
        RenderCanvas {
            size: PixelSize::new(width, height),
            transform: TrackTransform::IDENTITY,
            is_portrait: false,
        }
    }

    fn full_fill(color: [u8; 4], width: f64, height: f64) -> Box<dyn Overlay> {
        Box::new(AnimatedOverlay::new(
            FillPlayer::new(color),
            Rect::new(0.0, 0.0, width, height),
            Size::new(width, height),
        ))
    }

    #[test]
    fn test_canvas_draw_resamples_into_rect() {
        let mut canvas = OverlayCanvas::new(PixelSize::new(8, 8));
        let raster = RgbaImage::from_pixel(2, 2, Rgba([255, 0, 0, 255]));
        canvas.draw(&raster, Rect::new(4.0, 4.0, 4.0, 4.0));
        let image = canvas.into_image();
        assert_eq!(image.get_pixel(0, 0).0[3], 0);
        assert_eq!(image.get_pixel(5, 5).0, [255, 0, 0, 255]);
    }

    #[test]
    fn test_canvas_clips_offscreen() {
        let mut canvas = OverlayCanvas::new(PixelSize::new(4, 4));
        let raster = RgbaImage::from_pixel(4, 4, Rgba([0, 255, 0, 255]));
        canvas.draw(&raster, Rect::new(2.0, -2.0, 4.0, 4.0));
        let image = canvas.into_image();
        assert_eq!(image.get_pixel(3, 0).0, [0, 255, 0, 255]);
        assert_eq!(image.get_pixel(3, 3).0[3], 0);
    }

    #[test]
    fn test_overlay_hidden_at_zero_progress() {
        let mut compositor =
            FrameCompositor::new(vec![full_fill([255, 0, 0, 255], 4.0, 4.0)], ProgressClock::new(2.0));
        compositor.prime(&canvas(4, 4)).unwrap();
        let source = RgbaImage::from_pixel(4, 4, Rgba([0, 0, 255, 255]));

        let first = compositor.composite(0.0, source.clone()).unwrap();
        assert_eq!(first, source);

        let later = compositor.composite(1.0, source).unwrap();
        assert_eq!(later.get_pixel(2, 2).0, [255, 0, 0, 255]);
    }

    #[test]
    fn test_paint_order_later_on_top() {
        let mut compositor = FrameCompositor::new(
            vec![
                full_fill([255, 0, 0, 255], 4.0, 4.0),
                full_fill([0, 255, 0, 255], 4.0, 4.0),
            ],
            ProgressClock::new(1.0),
        );
        compositor.prime(&canvas(4, 4)).unwrap();
        let source = RgbaImage::from_pixel(4, 4, Rgba([0, 0, 0, 255]));
        let out = compositor.composite(0.5, source).unwrap();
        assert_eq!(out.get_pixel(1, 1).0, [0, 255, 0, 255]);
    }

    #[test]
    fn test_transparent_overlay_leaves_frame_unchanged() {
        let mut compositor =
            FrameCompositor::new(vec![full_fill([9, 9, 9, 0], 4.0, 4.0)], ProgressClock::new(1.0));
        compositor.prime(&canvas(4, 4)).unwrap();
        let source = RgbaImage::from_fn(4, 4, |x, y| Rgba([x as u8 * 40, y as u8 * 40, 7, 255]));
        let out = compositor.composite(0.7, source.clone()).unwrap();
        assert_eq!(out, source);
    }

    #[test]
    fn test_wrong_source_size_fails() {
        let mut compositor = FrameCompositor::new(Vec::new(), ProgressClock::new(1.0));
        compositor.prime(&canvas(4, 4)).unwrap();
        let err = compositor
            .composite(0.0, RgbaImage::new(3, 4))
            .unwrap_err();
        assert_eq!(err.code(), "failedToGetOutputImage");
    }

    struct Faulty {
        fail_in_placement: bool,
    }

    impl Overlay for Faulty {
        fn placement_in(&self, canvas: Size) -> Rect {
            if self.fail_in_placement {
                panic!("no layout");
            }
            Rect::from_size(canvas)
        }

        fn prepare_to_render(&mut self, _rect: Rect) {}

        fn advance_to(&mut self, _progress: f64) {}

        fn rasterize(&mut self) -> Option<RgbaImage> {
            panic!("raster backend gone");
        }

        fn frame(&self) -> Rect {
            Rect::ZERO
        }

        fn is_hidden(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_panicking_overlay_fails_output_image() {
        let mut compositor = FrameCompositor::new(
            vec![Box::new(Faulty { fail_in_placement: false })],
            ProgressClock::new(1.0),
        );
        compositor.prime(&canvas(4, 4)).unwrap();
        let err = compositor.composite(0.5, RgbaImage::new(4, 4)).unwrap_err();
        assert_eq!(err.code(), "failedToGetOutputImage");
        assert!(err.to_string().contains("raster backend gone"));

        let mut placement = FrameCompositor::new(
            vec![Box::new(Faulty { fail_in_placement: true })],
            ProgressClock::new(1.0),
        );
        let err = placement.prime(&canvas(4, 4)).unwrap_err();
        assert_eq!(err.code(), "failedToGetOutputImage");
    }
}
