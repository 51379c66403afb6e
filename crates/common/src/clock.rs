//! Playback-progress clock and output frame timing.
//!
//! Every overlay is driven from a single progress value in `[0.0, 1.0]`
//! derived from a frame's timestamp. Overlays never advance on their own,
//! so this module is the only place where time becomes progress.

/// Exclusive lower bound for an export duration, in seconds.
pub const MIN_DURATION_SECS: f64 = 0.1;

/// Inclusive upper bound for an export duration, in seconds.
pub const MAX_DURATION_SECS: f64 = 60.0;

/// Whether `duration_secs` lies within `(0.1, 60]`.
pub fn is_valid_duration(duration_secs: f64) -> bool {
    duration_secs.is_finite()
        && duration_secs > MIN_DURATION_SECS
        && duration_secs <= MAX_DURATION_SECS
}

/// Maps composition timestamps to normalized playback progress.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressClock {
    /// Total duration of the composition in seconds.
    duration_secs: f64,
}

impl ProgressClock {
    /// Create a clock for a composition of the given duration.
    pub fn new(duration_secs: f64) -> Self {
        Self { duration_secs }
    }

    /// Total duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.duration_secs
    }

    /// Progress at `timestamp_secs`, clamped to `[0.0, 1.0]`.
    ///
    /// A non-positive duration maps every timestamp to `0.0`.
    pub fn progress_at(&self, timestamp_secs: f64) -> f64 {
        if self.duration_secs <= 0.0 || !timestamp_secs.is_finite() {
            return 0.0;
        }
        (timestamp_secs / self.duration_secs).clamp(0.0, 1.0)
    }
}

/// Fixed frame spacing for an output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTiming {
    fps: u32,
}

impl FrameTiming {
    /// Create a timing for the given rate. A zero rate is treated as 1 fps.
    pub fn new(fps: u32) -> Self {
        Self { fps: fps.max(1) }
    }

    /// Frames per second.
    pub fn fps(&self) -> u32 {
        self.fps
    }

    /// Seconds between consecutive frames.
    pub fn frame_duration_secs(&self) -> f64 {
        1.0 / self.fps as f64
    }

    /// Presentation time of frame `index`.
    pub fn timestamp_of(&self, index: u64) -> f64 {
        index as f64 / self.fps as f64
    }

    /// Number of frames needed to cover `duration_secs` (at least one).
    pub fn frame_count(&self, duration_secs: f64) -> u64 {
        if !duration_secs.is_finite() || duration_secs <= 0.0 {
            return 1;
        }
        ((duration_secs * self.fps as f64).round() as u64).max(1)
    }
}
