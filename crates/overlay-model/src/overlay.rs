//! The overlay capability contract.
//!
//! An overlay is anything the renderer can place on the output canvas, move
//! to a playback progress, and rasterize. Overlays are exclusively owned by
//! one export and are only touched from the renderer's main context.

use image::RgbaImage;

use crate::geometry::{Rect, Size};

/// A renderable, time-varying overlay.
///
/// The renderer calls these in a fixed order: `placement_in` and
/// `prepare_to_render` once per export, then `advance_to` followed by
/// `rasterize` once per output frame.
pub trait Overlay: Send {
    /// Placement rectangle for a render canvas of the given size.
    fn placement_in(&self, canvas: Size) -> Rect;

    /// Adopt `rect` as the frame this overlay rasterizes into.
    fn prepare_to_render(&mut self, rect: Rect);

    /// Move the visual state to `progress` in `[0.0, 1.0]`.
    fn advance_to(&mut self, progress: f64);

    /// Rasterize the current visual state at the prepared frame size.
    ///
    /// Returns `None` when there is nothing to draw.
    fn rasterize(&mut self) -> Option<RgbaImage>;

    /// The frame adopted in `prepare_to_render`.
    fn frame(&self) -> Rect;

    /// Whether the overlay is excluded from the current frame.
    fn is_hidden(&self) -> bool;
}

/// Where an overlay sits inside the container it was laid out in.
///
/// Hosts lay overlays out over a preview of the asset (the container); the
/// layout maps that arrangement onto a render canvas of a different size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayLayout {
    /// Frame of the overlay in container coordinates.
    pub frame: Rect,

    /// Size of the container the frame is expressed in.
    pub container: Size,
}

impl OverlayLayout {
    pub fn new(frame: Rect, container: Size) -> Self {
        Self { frame, container }
    }

    /// Map the frame into a canvas of `canvas` size.
    ///
    /// The origin scales independently per axis; width and height both scale
    /// by the mean of the two axis factors, so the overlay keeps its aspect
    /// ratio when the canvas aspect differs from the container's. An empty
    /// container yields [`Rect::ZERO`].
    pub fn rect_in(&self, canvas: Size) -> Rect {
        if self.container.is_empty() {
            return Rect::ZERO;
        }

        let width_scale = canvas.width / self.container.width;
        let height_scale = canvas.height / self.container.height;
        let average_scale = (width_scale + height_scale) / 2.0;

        Rect::new(
            self.frame.x / self.container.width * canvas.width,
            self.frame.y / self.container.height * canvas.height,
            self.frame.width * average_scale,
            self.frame.height * average_scale,
        )
    }
}

/// Boundary to an external animation engine.
///
/// The renderer never lets a player run on its own clock: it is told which
/// progress to show and asked for pixels.
pub trait AnimationPlayer: Send {
    /// Seek to `progress` in `[0.0, 1.0]`.
    fn set_progress(&mut self, progress: f64);

    /// Render the current state at `width` x `height`.
    fn render(&mut self, width: u32, height: u32) -> Option<RgbaImage>;
}

/// An [`Overlay`] backed by an [`AnimationPlayer`].
///
/// The overlay hides itself at progress exactly `0.0` so a stopped player
/// never leaks its resting frame into the output.
#[derive(Debug)]
pub struct AnimatedOverlay<P> {
    player: P,
    layout: OverlayLayout,
    frame: Rect,
    progress: f64,
    hidden: bool,
}

impl<P: AnimationPlayer> AnimatedOverlay<P> {
    /// Create an overlay laid out at `frame` inside `container`.
    pub fn new(player: P, frame: Rect, container: Size) -> Self {
        Self {
            player,
            layout: OverlayLayout::new(frame, container),
            frame,
            progress: 0.0,
            hidden: true,
        }
    }

    /// Current progress.
    pub fn progress(&self) -> f64 {
        self.progress
    }

    /// Layout used to compute placements.
    pub fn layout(&self) -> &OverlayLayout {
        &self.layout
    }

    pub fn player(&self) -> &P {
        &self.player
    }
}

impl<P: AnimationPlayer> Overlay for AnimatedOverlay<P> {
    fn placement_in(&self, canvas: Size) -> Rect {
        self.layout.rect_in(canvas)
    }

    fn prepare_to_render(&mut self, rect: Rect) {
        self.frame = rect;
    }

    fn advance_to(&mut self, progress: f64) {
        let progress = if progress.is_finite() {
            progress.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.progress = progress;
        self.player.set_progress(progress);
        self.hidden = progress == 0.0;
    }

    fn rasterize(&mut self) -> Option<RgbaImage> {
        if self.hidden {
            return None;
        }
        let size = self.frame.pixel_size();
        if size.is_empty() {
            return None;
        }
        self.player.render(size.width, size.height)
    }

    fn frame(&self) -> Rect {
        self.frame
    }

    fn is_hidden(&self) -> bool {
        self.hidden
    }
}
