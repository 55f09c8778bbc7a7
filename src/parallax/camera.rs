use glam::{Mat4, Vec2, Vec3};

use crate::config::ParallaxConfig;
use crate::pointer::PointerSample;

const NEAR_PLANE: f32 = 0.05;

/// Perspective camera orbiting in front of the background plane.
///
/// The camera slides parallel to the plane with the pointer and always looks
/// at the plane centre, so displaced (near) vertices shift against the far
/// ones.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaneCamera {
    pub distance: f32,
    pub travel: f32,
    pub fov_y: f32,
}

impl PlaneCamera {
    pub fn from_config(cfg: &ParallaxConfig) -> Self {
        Self {
            distance: cfg.camera_distance,
            travel: cfg.camera_travel,
            fov_y: cfg.field_of_view_degrees.to_radians(),
        }
    }

    pub fn eye(&self, pointer: PointerSample) -> Vec3 {
        let p = pointer.clamped();
        Vec3::new(p.x * self.travel, p.y * self.travel, self.distance)
    }

    pub fn view_projection(&self, pointer: PointerSample, aspect: f32) -> Mat4 {
        let view = Mat4::look_at_rh(self.eye(pointer), Vec3::ZERO, Vec3::Y);
        let projection =
            Mat4::perspective_rh(self.fov_y, aspect.max(1e-3), NEAR_PLANE, self.distance * 4.0);
        projection * view
    }

    /// Half-size of a plane at the origin that fills the view from the rest
    /// position, enlarged by `crop_factor`.
    pub fn plane_half_extent(&self, aspect: f32, crop_factor: f32) -> Vec2 {
        let half_h = self.distance * (self.fov_y * 0.5).tan() * crop_factor.max(1.0);
        Vec2::new(half_h * aspect, half_h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    fn camera() -> PlaneCamera {
        PlaneCamera::from_config(&ParallaxConfig::default())
    }

    fn project(m: Mat4, p: Vec3) -> Vec3 {
        let clip = m * Vec4::new(p.x, p.y, p.z, 1.0);
        clip.truncate() / clip.w
    }

    #[test]
    fn rest_position_is_on_axis() {
        let cam = camera();
        assert_eq!(cam.eye(PointerSample::CENTER), Vec3::new(0.0, 0.0, cam.distance));
    }

    #[test]
    fn plane_centre_stays_centred() {
        let cam = camera();
        for pointer in [PointerSample::new(1.0, 0.0), PointerSample::new(-0.5, 0.7)] {
            let ndc = project(cam.view_projection(pointer, 9.0 / 16.0), Vec3::ZERO);
            assert!(ndc.x.abs() < 1e-5 && ndc.y.abs() < 1e-5);
        }
    }

    #[test]
    fn uncropped_plane_fills_the_view() {
        let cam = camera();
        let aspect = 9.0 / 16.0;
        let half = cam.plane_half_extent(aspect, 1.0);
        let ndc = project(
            cam.view_projection(PointerSample::CENTER, aspect),
            Vec3::new(half.x, half.y, 0.0),
        );
        assert!((ndc.x - 1.0).abs() < 1e-4 && (ndc.y - 1.0).abs() < 1e-4);
    }

    #[test]
    fn near_points_move_more_than_far_points() {
        let cam = camera();
        let m = cam.view_projection(PointerSample::new(1.0, 0.0), 1.0);
        let far = project(m, Vec3::new(0.5, 0.0, 0.0));
        let near = project(m, Vec3::new(0.5, 0.0, 0.5));
        let rest = cam.view_projection(PointerSample::CENTER, 1.0);
        let far_rest = project(rest, Vec3::new(0.5, 0.0, 0.0));
        let near_rest = project(rest, Vec3::new(0.5, 0.0, 0.5));
        assert!((near.x - near_rest.x).abs() > (far.x - far_rest.x).abs());
    }
}
