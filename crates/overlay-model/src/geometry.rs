//! Sizes, rectangles, and video track transforms.
//!
//! Overlay placement works in floating-point canvas units, while frames and
//! render canvases are measured in whole pixels.

use serde::{Deserialize, Serialize};

/// A floating-point size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub const ZERO: Size = Size {
        width: 0.0,
        height: 0.0,
    };

    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// True when either dimension is not strictly positive.
    pub fn is_empty(&self) -> bool {
        !(self.width > 0.0 && self.height > 0.0)
    }
}

/// A size in whole pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct PixelSize {
    pub width: u32,
    pub height: u32,
}

impl PixelSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// The same size with width and height exchanged.
    pub fn swapped(&self) -> Self {
        Self {
            width: self.height,
            height: self.width,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Number of bytes in a tightly packed RGBA8 frame of this size.
    pub fn rgba_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

impl From<PixelSize> for Size {
    fn from(size: PixelSize) -> Self {
        Size::new(size.width as f64, size.height as f64)
    }
}

impl std::fmt::Display for PixelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// An axis-aligned rectangle, origin at the top-left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub const ZERO: Rect = Rect {
        x: 0.0,
        y: 0.0,
        width: 0.0,
        height: 0.0,
    };

    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Rectangle at the origin covering `size`.
    pub fn from_size(size: Size) -> Self {
        Self::new(0.0, 0.0, size.width, size.height)
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    /// Right edge.
    pub fn max_x(&self) -> f64 {
        self.x + self.width
    }

    /// Bottom edge.
    pub fn max_y(&self) -> f64 {
        self.y + self.height
    }

    /// Pixel dimensions this rectangle rasterizes to (rounded, possibly zero).
    pub fn pixel_size(&self) -> PixelSize {
        PixelSize::new(round_dim(self.width), round_dim(self.height))
    }

    /// Pixel origin this rectangle rasterizes at.
    pub fn pixel_origin(&self) -> (i64, i64) {
        (self.x.round() as i64, self.y.round() as i64)
    }
}

fn round_dim(v: f64) -> u32 {
    if v.is_finite() && v > 0.0 {
        v.round().min(u32::MAX as f64) as u32
    } else {
        0
    }
}

/// The 2x2 linear part of a video track's preferred display transform.
///
/// A point `(x, y)` in natural pixel space maps to `(a*x + c*y, b*x + d*y)`
/// in display space (y axis pointing down).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackTransform {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
}

impl Default for TrackTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl TrackTransform {
    pub const IDENTITY: TrackTransform = TrackTransform {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 1.0,
    };

    pub fn new(a: f64, b: f64, c: f64, d: f64) -> Self {
        Self { a, b, c, d }
    }

    /// Build a transform from a container rotation tag.
    ///
    /// Uses the ffprobe display-matrix convention where the value is the
    /// counter-clockwise rotation, so a phone portrait clip tagged `-90`
    /// becomes `(0, 1, -1, 0)`.
    pub fn from_rotation_degrees(degrees: f64) -> Self {
        let theta = (-degrees).to_radians();
        let (sin, cos) = theta.sin_cos();
        Self {
            a: snap_unit(cos),
            b: snap_unit(sin),
            c: snap_unit(-sin),
            d: snap_unit(cos),
        }
    }

    /// Clockwise quarter turns this transform represents, if it is an exact
    /// multiple of 90 degrees.
    pub fn quarter_turns(&self) -> Option<u8> {
        let m = [self.a, self.b, self.c, self.d];
        if m == [1.0, 0.0, 0.0, 1.0] {
            Some(0)
        } else if m == [0.0, 1.0, -1.0, 0.0] {
            Some(1)
        } else if m == [-1.0, 0.0, 0.0, -1.0] {
            Some(2)
        } else if m == [0.0, -1.0, 1.0, 0.0] {
            Some(3)
        } else {
            None
        }
    }
}

/// Snap values within rounding noise of -1, 0, or 1 onto those values.
fn snap_unit(v: f64) -> f64 {
    const EPS: f64 = 1e-9;
    for target in [-1.0, 0.0, 1.0] {
        if (v - target).abs() < EPS {
            return target;
        }
    }
    v
}
