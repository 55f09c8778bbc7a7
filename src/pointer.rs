//! Pointer sampling shared by the parallax layer and speaker layout.
//!
//! The render loop owns the one [`PointerTracker`]; everything else reads the
//! smoothed [`PointerSample`] through a `watch` channel.

use tokio::sync::watch;

use crate::config::PointerConfig;

/// Smoothed pointer position in [-1, 1]², +y up, origin at the centre.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PointerSample {
    pub x: f32,
    pub y: f32,
}

impl PointerSample {
    pub const CENTER: Self = Self { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn clamped(self) -> Self {
        Self {
            x: self.x.clamp(-1.0, 1.0),
            y: self.y.clamp(-1.0, 1.0),
        }
    }

    fn lerp(self, target: Self, t: f32) -> Self {
        Self {
            x: self.x + (target.x - self.x) * t,
            y: self.y + (target.y - self.y) * t,
        }
    }

    fn scale(self, factor: f32) -> Self {
        Self {
            x: self.x * factor,
            y: self.y * factor,
        }
    }
}

/// Map a window position (physical pixels) to [-1, 1]².
///
/// Offsets are measured against a box of `reference_aspect` (width / height)
/// fitted inside the viewport, so the same physical distance moves both axes
/// equally. Positions outside the box saturate at ±1.
pub fn normalise(position: (f64, f64), viewport: (u32, u32), reference_aspect: f32) -> PointerSample {
    let (w, h) = (viewport.0.max(1) as f32, viewport.1.max(1) as f32);
    let aspect = w / h;
    let (box_w, box_h) = if aspect >= reference_aspect {
        (h * reference_aspect, h)
    } else {
        (w, w / reference_aspect)
    };
    let dx = position.0 as f32 - w * 0.5;
    let dy = h * 0.5 - position.1 as f32;
    PointerSample::new(dx / (box_w * 0.5), dy / (box_h * 0.5)).clamped()
}

pub struct PointerTracker {
    config: PointerConfig,
    viewport: (u32, u32),
    target: PointerSample,
    current: PointerSample,
    inside: bool,
    tx: watch::Sender<PointerSample>,
}

impl PointerTracker {
    pub fn new(config: PointerConfig) -> Self {
        let (tx, _) = watch::channel(PointerSample::CENTER);
        Self {
            config,
            viewport: (1, 1),
            target: PointerSample::CENTER,
            current: PointerSample::CENTER,
            inside: false,
            tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PointerSample> {
        self.tx.subscribe()
    }

    pub fn set_viewport(&mut self, width: u32, height: u32) {
        self.viewport = (width.max(1), height.max(1));
    }

    pub fn moved(&mut self, position: (f64, f64)) {
        self.target = normalise(position, self.viewport, self.config.reference_aspect);
        self.inside = true;
    }

    /// The pointer left the window; the target drifts back to centre.
    pub fn left(&mut self) {
        self.inside = false;
    }

    pub fn current(&self) -> PointerSample {
        self.current
    }

    /// Advance one frame and publish the smoothed sample.
    pub fn tick(&mut self) -> PointerSample {
        if !self.inside {
            self.target = self.target.scale(self.config.decay_factor);
        }
        self.current = self
            .current
            .lerp(self.target, self.config.lerp_factor)
            .clamped();
        let sample = self.current;
        self.tx.send_if_modified(|published| {
            if *published == sample {
                false
            } else {
                *published = sample;
                true
            }
        });
        sample
    }
}
