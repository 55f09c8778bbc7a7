//! Sizing helpers and speaker placement.
//!
//! Screen units follow the viewport: `x` in vw from the left edge, `bottom`
//! and `height` in vh from the bottom edge.

use crate::config::MotionProfile;
use crate::pointer::PointerSample;

/// Z-order of the active speaker, above every idle slot.
pub const SPEAKING_Z_INDEX: u32 = 100;

pub fn resize_to_contain(
    canvas_w: u32,
    canvas_h: u32,
    src_w: u32,
    src_h: u32,
    max_dim: u32,
) -> (u32, u32) {
    let iw = src_w.max(1) as f32;
    let ih = src_h.max(1) as f32;
    let cw = canvas_w.max(1) as f32;
    let ch = canvas_h.max(1) as f32;
    let scale = (cw / iw).min(ch / ih).max(0.0);
    let scale = if scale.is_finite() { scale } else { 1.0 };
    let w = (iw * scale).round().clamp(1.0, max_dim as f32);
    let h = (ih * scale).round().clamp(1.0, max_dim as f32);
    (w as u32, h as u32)
}

/// Shrink (never grow) so neither side exceeds `max_dim`, keeping aspect.
pub fn capped_size(src_w: u32, src_h: u32, max_dim: u32) -> (u32, u32) {
    if src_w <= max_dim && src_h <= max_dim {
        return (src_w.max(1), src_h.max(1));
    }
    resize_to_contain(max_dim, max_dim, src_w, src_h, max_dim)
}

/// Horizontal slot for the `index`-th (1-based) of `count` displayed speakers.
///
/// Odd indices fill the left half, even indices the right half, each half
/// spaced evenly; a lone speaker stands at the centre.
pub fn slot_x(index: usize, count: usize) -> f32 {
    if count <= 1 {
        return 50.0;
    }
    let i = index.max(1);
    if i % 2 == 1 {
        let left = count.div_ceil(2) as f32;
        i.div_ceil(2) as f32 * (50.0 / (left + 1.0))
    } else {
        let right = (count / 2) as f32;
        (i / 2) as f32 * (50.0 / (right + 1.0)) + 50.0
    }
}

/// Where one speaker is drawn this frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeakerPlacement {
    pub x_vw: f32,
    pub bottom_vh: f32,
    pub height_vh: f32,
    pub brightness: f32,
    pub z_index: u32,
    pub speaking: bool,
    /// Parallax pan in viewport fractions, +y up.
    pub pan: [f32; 2],
}

/// Placement for a speaker at slot `x`. Speakers farther from the centre sit
/// higher, smaller and further back; the active speaker is centred on top.
pub fn place_speaker(
    x: f32,
    speaking: bool,
    pointer: PointerSample,
    profile: &MotionProfile,
) -> SpeakerPlacement {
    let off_centre = (x - 50.0).abs();
    let lift = (off_centre / 5.0).ceil();
    let z = ((50.0 - off_centre) / 5.0).ceil().max(0.0) as u32;

    let base_x = if speaking { 50.0 } else { x };
    let base_y = if speaking { 0.0 } else { 2.0 + lift };
    let depth = (50.0 - base_y) / 50.0;
    let p = pointer.clamped();
    let pan = [
        p.x * depth * profile.pan_factor,
        p.y * depth * profile.pan_factor,
    ];

    if speaking {
        SpeakerPlacement {
            x_vw: base_x,
            bottom_vh: base_y,
            height_vh: profile.speaking_height_vh,
            brightness: 1.0,
            z_index: SPEAKING_Z_INDEX,
            speaking,
            pan,
        }
    } else {
        SpeakerPlacement {
            x_vw: base_x,
            bottom_vh: base_y,
            height_vh: (profile.idle_height_vh - lift * 2.0).max(0.0),
            brightness: profile.idle_brightness,
            z_index: z,
            speaking,
            pan,
        }
    }
}

/// Lay out `count` speakers in display order; `active` is a 0-based index.
pub fn arrange(
    count: usize,
    active: Option<usize>,
    pointer: PointerSample,
    profile: &MotionProfile,
) -> Vec<SpeakerPlacement> {
    (0..count)
        .map(|i| place_speaker(slot_x(i + 1, count), active == Some(i), pointer, profile))
        .collect()
}
