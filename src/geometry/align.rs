use glam::{Mat4, Vec3};

use super::{Primitive, SurfaceFit};

/// Fraction of the primitive-to-viewer vector the placement is pulled by. Scanned mesh
/// surfaces sit slightly behind the true surface as seen from the device.
pub const PULL_TOWARD_VIEWER_FRACTION: f32 = 0.10;

/// Orients the primitive's primary axis towards `viewer` and, when `align` is set,
/// pulls the placement and inliers towards the viewer. Safe to call repeatedly: the
/// pull is applied once per fit and a primitive already facing the viewer is kept.
pub fn normalize_for_viewer(fit: &mut SurfaceFit, viewer: Vec3, align: bool) {
    face_viewer(&mut fit.primitive, viewer);

    if align && !fit.aligned {
        let offset = PULL_TOWARD_VIEWER_FRACTION * (viewer - fit.primitive.position());
        let extrinsics = fit.primitive.extrinsics_mut();
        *extrinsics = Mat4::from_translation(offset) * *extrinsics;
        for point in &mut fit.inliers {
            *point += offset;
        }
        fit.aligned = true;
    }
}

fn face_viewer(primitive: &mut Primitive, viewer: Vec3) {
    match primitive {
        Primitive::Sphere(_) => {}
        Primitive::Plane(plane) => {
            flip_if_facing_away(&mut plane.extrinsics, viewer);
        }
        Primitive::Cylinder(cylinder) => {
            flip_if_facing_away(&mut cylinder.extrinsics, viewer);
        }
        Primitive::Torus(torus) => {
            flip_if_facing_away(&mut torus.extrinsics, viewer);
        }
        Primitive::Cone(cone) => {
            if flip_if_facing_away(&mut cone.extrinsics, viewer) {
                std::mem::swap(&mut cone.top_radius, &mut cone.bottom_radius);
            }
        }
    }
}

/// Rotates the placement by half a turn about its local X axis when its +Y axis points
/// away from `viewer`. Returns whether it flipped.
fn flip_if_facing_away(extrinsics: &mut Mat4, viewer: Vec3) -> bool {
    let position = extrinsics.w_axis.truncate();
    let axis = extrinsics.y_axis.truncate();
    if axis.dot(viewer - position) >= 0.0 {
        return false;
    }
    extrinsics.y_axis = -extrinsics.y_axis;
    extrinsics.z_axis = -extrinsics.z_axis;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Cone, Plane, Sphere, placement};

    fn plane_facing(axis: Vec3) -> SurfaceFit {
        SurfaceFit::new(
            Primitive::Plane(Plane {
                width: 1.0,
                height: 1.0,
                extrinsics: placement(Vec3::ZERO, axis),
            }),
            vec![Vec3::new(0.1, 0.0, 0.1)],
            0.003,
        )
    }

    #[test]
    fn plane_normal_is_flipped_towards_viewer() {
        let mut fit = plane_facing(Vec3::NEG_Y);
        normalize_for_viewer(&mut fit, Vec3::new(0.0, 2.0, 0.0), false);
        let axis = fit.primitive.extrinsics().y_axis.truncate();
        assert!(axis.dot(Vec3::Y) > 0.99);
        assert!(!fit.aligned);
    }

    #[test]
    fn flipped_placement_stays_right_handed() {
        let mut fit = plane_facing(Vec3::NEG_Y);
        normalize_for_viewer(&mut fit, Vec3::new(0.0, 2.0, 0.0), false);
        assert!(fit.primitive.extrinsics().determinant() > 0.0);
    }

    #[test]
    fn pull_moves_placement_and_inliers_towards_viewer() {
        let mut fit = plane_facing(Vec3::Y);
        let viewer = Vec3::new(0.0, 1.0, 0.0);
        normalize_for_viewer(&mut fit, viewer, true);
        assert!((fit.primitive.position() - Vec3::new(0.0, 0.1, 0.0)).length() < 1e-6);
        assert!((fit.inliers[0] - Vec3::new(0.1, 0.1, 0.1)).length() < 1e-6);
        assert!(fit.aligned);
    }

    #[test]
    fn normalizing_twice_does_not_drift() {
        let mut fit = plane_facing(Vec3::NEG_Y);
        let viewer = Vec3::new(0.3, 1.5, -0.2);
        normalize_for_viewer(&mut fit, viewer, true);
        let once = fit.clone();
        normalize_for_viewer(&mut fit, viewer, true);
        assert_eq!(fit, once);
    }

    #[test]
    fn flipped_cone_swaps_radii() {
        let mut fit = SurfaceFit::new(
            Primitive::Cone(Cone {
                top_radius: 0.1,
                bottom_radius: 0.3,
                height: 0.5,
                extrinsics: placement(Vec3::ZERO, Vec3::X),
            }),
            Vec::new(),
            0.01,
        );
        normalize_for_viewer(&mut fit, Vec3::new(-3.0, 0.0, 0.0), false);
        match fit.primitive {
            Primitive::Cone(cone) => {
                assert_eq!(cone.top_radius, 0.3);
                assert_eq!(cone.bottom_radius, 0.1);
                assert!(cone.extrinsics.y_axis.truncate().dot(Vec3::NEG_X) > 0.99);
            }
            other => panic!("expected cone, got {other:?}"),
        }
    }

    #[test]
    fn sphere_orientation_is_left_alone() {
        let extrinsics = placement(Vec3::ZERO, Vec3::NEG_Y);
        let mut fit = SurfaceFit::new(
            Primitive::Sphere(Sphere {
                radius: 0.2,
                extrinsics,
            }),
            Vec::new(),
            0.01,
        );
        normalize_for_viewer(&mut fit, Vec3::new(0.0, 5.0, 0.0), false);
        assert_eq!(fit.primitive.extrinsics(), extrinsics);
    }
}
