//! Depth-driven parallax for the background layer.
//!
//! The math here is CPU-side and pure; [`renderer::DepthPlane`] mirrors it in
//! WGSL. Texture coordinates are `[0, 1]²` with +v pointing down.

pub mod camera;
pub mod mesh;
pub mod renderer;

pub use camera::PlaneCamera;
pub use mesh::{PlaneMesh, PlaneVertex, subdivided_plane};
pub use renderer::{DepthPlane, PlaneUniforms};

use crate::config::DepthConvention;
use crate::pointer::PointerSample;

/// Fraction of the texture visible on each axis when it covers the viewport.
///
/// One axis is always 1.0; the other is < 1.0 and gets cropped evenly on both
/// sides. Degenerate sizes show the whole texture.
pub fn cover_extent(image: (u32, u32), viewport: (u32, u32)) -> [f32; 2] {
    let (iw, ih) = (image.0 as f32, image.1 as f32);
    let (vw, vh) = (viewport.0 as f32, viewport.1 as f32);
    if iw <= 0.0 || ih <= 0.0 || vw <= 0.0 || vh <= 0.0 {
        return [1.0, 1.0];
    }
    let image_ar = iw / ih;
    let view_ar = vw / vh;
    if image_ar > view_ar {
        [view_ar / image_ar, 1.0]
    } else {
        [1.0, image_ar / view_ar]
    }
}

/// Cover extent with an additional zoom that keeps displaced edges off screen.
pub fn cropped_extent(image: (u32, u32), viewport: (u32, u32), crop_factor: f32) -> [f32; 2] {
    let [x, y] = cover_extent(image, viewport);
    let crop = crop_factor.max(1.0);
    [x / crop, y / crop]
}

/// Texture-space shift for a texel with the given nearness (0 far, 1 near).
///
/// Each component is bounded by `strength` and is exactly zero when the
/// pointer is centred or the texel is infinitely far.
pub fn uv_offset(pointer: PointerSample, nearness: f32, strength: f32) -> [f32; 2] {
    let p = pointer.clamped();
    let k = nearness.clamp(0.0, 1.0) * strength;
    [p.x * k, -p.y * k]
}

/// Screen UV → texture UV for the offset strategy, never leaving [0, 1].
pub fn sample_uv(screen_uv: [f32; 2], extent: [f32; 2], offset: [f32; 2]) -> [f32; 2] {
    [
        (0.5 + (screen_uv[0] - 0.5) * extent[0] + offset[0]).clamp(0.0, 1.0),
        (0.5 + (screen_uv[1] - 0.5) * extent[1] + offset[1]).clamp(0.0, 1.0),
    ]
}

/// Nearness of an 8-bit depth sample under the configured convention.
pub fn nearness(sample: u8, convention: DepthConvention) -> f32 {
    convention.nearness(sample as f32 / 255.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cover_crops_the_longer_axis() {
        // 16:9 image on a 9:16 screen: only a narrow vertical strip is visible.
        let [x, y] = cover_extent((1600, 900), (900, 1600));
        assert!((x - (0.5625 / 1.7777778)).abs() < 1e-4);
        assert_eq!(y, 1.0);
        assert_eq!(cover_extent((100, 100), (100, 100)), [1.0, 1.0]);
        assert_eq!(cover_extent((0, 10), (100, 100)), [1.0, 1.0]);
    }

    #[test]
    fn crop_factor_zooms_in() {
        let [x, y] = cropped_extent((100, 100), (100, 100), 1.2);
        assert!((x - 1.0 / 1.2).abs() < 1e-6 && (y - 1.0 / 1.2).abs() < 1e-6);
        assert_eq!(cropped_extent((100, 100), (100, 100), 0.5), [1.0, 1.0]);
    }

    #[test]
    fn centred_pointer_means_no_offset() {
        for n in [0.0, 0.5, 1.0] {
            assert_eq!(uv_offset(PointerSample::CENTER, n, 0.03), [0.0, -0.0]);
        }
    }

    #[test]
    fn offset_is_bounded_by_strength() {
        let strength = 0.03;
        for &(x, y) in &[(1.0, 1.0), (-1.0, 0.3), (5.0, -7.0), (0.2, -1.0)] {
            let [ox, oy] = uv_offset(PointerSample::new(x, y), 1.0, strength);
            assert!(ox.abs() <= strength + f32::EPSILON);
            assert!(oy.abs() <= strength + f32::EPSILON);
        }
    }

    #[test]
    fn offset_is_continuous_in_pointer() {
        let strength = 0.05;
        let mut prev = uv_offset(PointerSample::new(-1.0, 0.0), 0.8, strength);
        for i in 1..=200 {
            let x = -1.0 + i as f32 * 0.01;
            let next = uv_offset(PointerSample::new(x, 0.0), 0.8, strength);
            assert!((next[0] - prev[0]).abs() <= 0.01 * strength + 1e-6);
            prev = next;
        }
    }

    #[test]
    fn sampling_never_escapes_the_texture() {
        let extent = [1.0, 1.0];
        for &uv in &[[0.0, 0.0], [1.0, 1.0], [0.0, 1.0], [0.5, 0.5]] {
            for &off in &[[0.3, -0.3], [-0.3, 0.3], [1.0, 1.0]] {
                let [u, v] = sample_uv(uv, extent, off);
                assert!((0.0..=1.0).contains(&u) && (0.0..=1.0).contains(&v));
            }
        }
        assert_eq!(sample_uv([0.5, 0.5], [0.5, 0.5], [0.0, 0.0]), [0.5, 0.5]);
    }

    #[test]
    fn depth_convention_flips_nearness() {
        assert_eq!(nearness(255, DepthConvention::NearIsBright), 1.0);
        assert_eq!(nearness(255, DepthConvention::NearIsDark), 0.0);
        assert_eq!(nearness(0, DepthConvention::NearIsDark), 1.0);
    }
}
