use std::f32::consts::{PI, TAU};

use glam::Vec3;
use serde::{Deserialize, Serialize};

use super::Torus;

/// Spans wider than this are stored as a full revolution; sparse angular sampling near
/// a closed ring otherwise leaves a visible seam.
pub const FULL_SPAN_THRESHOLD: f32 = 1.5 * PI;

/// Below this length the mean inlier direction is too ambiguous to anchor a span.
const MIN_MEAN_DIRECTION: f32 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AngleSpan {
    pub begin: f32,
    pub delta: f32,
}

impl AngleSpan {
    pub const FULL: Self = Self {
        begin: 0.0,
        delta: TAU,
    };

    pub fn collapsed(self) -> Self {
        if self.delta > FULL_SPAN_THRESHOLD {
            Self::FULL
        } else {
            self
        }
    }

    pub fn is_full(&self) -> bool {
        *self == Self::FULL
    }
}

impl Torus {
    /// Angular extent of `inliers` around the torus axis, measured in the torus' local
    /// frame from its +X axis towards +Z. Not collapsed.
    pub fn angle_span(&self, inliers: &[Vec3]) -> AngleSpan {
        let to_local = self.extrinsics.inverse();
        let projected = inliers
            .iter()
            .map(|point| {
                let local = to_local.transform_point3(*point);
                Vec3::new(local.x, 0.0, local.z).normalize_or_zero()
            })
            .filter(|direction| *direction != Vec3::ZERO)
            .collect::<Vec<_>>();
        if projected.is_empty() {
            return AngleSpan::FULL;
        }

        let mean = projected.iter().copied().sum::<Vec3>() / projected.len() as f32;
        if mean.length() < MIN_MEAN_DIRECTION {
            return AngleSpan::FULL;
        }
        let mean = mean.normalize();

        let base = signed_angle(Vec3::X, mean);
        let (min, max) = projected
            .iter()
            .map(|direction| signed_angle(mean, *direction))
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(min, max), angle| {
                (min.min(angle), max.max(angle))
            });

        AngleSpan {
            begin: min + base,
            delta: max - min,
        }
    }
}

fn signed_angle(from: Vec3, to: Vec3) -> f32 {
    let angle = from.dot(to).clamp(-1.0, 1.0).acos();
    if Vec3::NEG_Y.dot(from.cross(to)) < 0.0 {
        -angle
    } else {
        angle
    }
}
