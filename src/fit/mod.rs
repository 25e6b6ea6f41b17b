use glam::Vec3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geometry::{FeatureKind, FitResult};

pub const DEFAULT_MEASUREMENT_ACCURACY: f32 = 0.015;
pub const DEFAULT_MEAN_DISTANCE: f32 = 0.15;
pub const DEFAULT_SEED_RADIUS: f32 = 0.15;
pub const DEFAULT_LATERAL_EXTENSION: u8 = 10;
pub const DEFAULT_RADIAL_EXPANSION: u8 = 5;
pub const MAX_SEARCH_LEVEL: u8 = 10;

pub const MEASUREMENT_ACCURACY_RANGE: (f32, f32) = (0.003, 0.10);
pub const MEAN_DISTANCE_RANGE: (f32, f32) = (0.01, 0.50);
pub const SEED_RADIUS_RANGE: (f32, f32) = (0.05, 10.0);

#[derive(Debug, Error)]
pub enum FitError {
    #[error("fit failed: {0}")]
    Failed(String),
    #[error("fit input rejected: {0}")]
    InvalidInput(String),
}

/// What the fitter should look for. `Any` lets it classify on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetFeature {
    Any,
    Plane,
    Sphere,
    Cylinder,
    Cone,
    Torus,
}

impl TargetFeature {
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        if normalized == "any" {
            return Some(Self::Any);
        }
        FeatureKind::parse(&normalized).map(Self::from)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Plane => "plane",
            Self::Sphere => "sphere",
            Self::Cylinder => "cylinder",
            Self::Cone => "cone",
            Self::Torus => "torus",
        }
    }
}

impl From<FeatureKind> for TargetFeature {
    fn from(value: FeatureKind) -> Self {
        match value {
            FeatureKind::Plane => Self::Plane,
            FeatureKind::Sphere => Self::Sphere,
            FeatureKind::Cylinder => Self::Cylinder,
            FeatureKind::Cone => Self::Cone,
            FeatureKind::Torus => Self::Torus,
        }
    }
}

/// Tuning handed to the fitter alongside every request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitParams {
    pub target: TargetFeature,
    pub measurement_accuracy: f32,
    pub mean_distance: f32,
    pub seed_radius: f32,
    pub lateral_extension: u8,
    pub radial_expansion: u8,
    pub allow_cone_to_cylinder: bool,
    pub allow_torus_to_sphere: bool,
    pub allow_torus_to_cylinder: bool,
}

impl Default for FitParams {
    fn default() -> Self {
        Self {
            target: TargetFeature::Plane,
            measurement_accuracy: DEFAULT_MEASUREMENT_ACCURACY,
            mean_distance: DEFAULT_MEAN_DISTANCE,
            seed_radius: DEFAULT_SEED_RADIUS,
            lateral_extension: DEFAULT_LATERAL_EXTENSION,
            radial_expansion: DEFAULT_RADIAL_EXPANSION,
            allow_cone_to_cylinder: true,
            allow_torus_to_sphere: true,
            allow_torus_to_cylinder: true,
        }
    }
}

impl FitParams {
    /// Clamps every tunable into the range the fitter accepts.
    pub fn clamped(self) -> Self {
        Self {
            measurement_accuracy: clamp_range(self.measurement_accuracy, MEASUREMENT_ACCURACY_RANGE),
            mean_distance: clamp_range(self.mean_distance, MEAN_DISTANCE_RANGE),
            seed_radius: clamp_range(self.seed_radius, SEED_RADIUS_RANGE),
            lateral_extension: self.lateral_extension.min(MAX_SEARCH_LEVEL),
            radial_expansion: self.radial_expansion.min(MAX_SEARCH_LEVEL),
            ..self
        }
    }
}

impl FitParams {
    /// Whether a result of `kind` answers a request for `self.target`, counting the
    /// allowed conversions (a cone that degenerates to a cylinder, a torus to a sphere
    /// or cylinder).
    pub fn accepts(&self, kind: FeatureKind) -> bool {
        match (self.target, kind) {
            (TargetFeature::Any, _) => true,
            (TargetFeature::Cone, FeatureKind::Cylinder) => self.allow_cone_to_cylinder,
            (TargetFeature::Torus, FeatureKind::Sphere) => self.allow_torus_to_sphere,
            (TargetFeature::Torus, FeatureKind::Cylinder) => self.allow_torus_to_cylinder,
            (target, kind) => target == TargetFeature::from(kind),
        }
    }
}

fn clamp_range(value: f32, (low, high): (f32, f32)) -> f32 {
    if value.is_nan() { low } else { value.clamp(low, high) }
}

/// The geometry-fitting capability. Callers guarantee at most one `fit` runs at a time.
pub trait SurfaceFitter: Send {
    /// Fits a primitive to `points` around `points[seed_index]` under `params`. An
    /// `Err` is recoverable: the caller retries on a later iteration.
    fn fit(
        &mut self,
        points: &[Vec3],
        seed_index: usize,
        params: &FitParams,
    ) -> Result<FitResult, FitError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_clamp_into_accepted_ranges() {
        let params = FitParams {
            measurement_accuracy: 0.5,
            mean_distance: 0.001,
            seed_radius: f32::NAN,
            lateral_extension: 42,
            ..FitParams::default()
        }
        .clamped();
        assert_eq!(params.measurement_accuracy, 0.10);
        assert_eq!(params.mean_distance, 0.01);
        assert_eq!(params.seed_radius, 0.05);
        assert_eq!(params.lateral_extension, MAX_SEARCH_LEVEL);
        assert_eq!(params.radial_expansion, DEFAULT_RADIAL_EXPANSION);
    }

    #[test]
    fn target_accepts_matching_and_converted_kinds() {
        let cone = FitParams {
            target: TargetFeature::Cone,
            ..FitParams::default()
        };
        assert!(cone.accepts(FeatureKind::Cone));
        assert!(cone.accepts(FeatureKind::Cylinder));
        assert!(!cone.accepts(FeatureKind::Plane));

        let strict_torus = FitParams {
            target: TargetFeature::Torus,
            allow_torus_to_sphere: false,
            ..FitParams::default()
        };
        assert!(!strict_torus.accepts(FeatureKind::Sphere));
        assert!(strict_torus.accepts(FeatureKind::Cylinder));

        let any = FitParams {
            target: TargetFeature::Any,
            ..FitParams::default()
        };
        assert!(FeatureKind::ALL.iter().all(|kind| any.accepts(*kind)));
        assert!(!FitParams::default().accepts(FeatureKind::Sphere));
    }

    #[test]
    fn target_feature_parses_any_and_kinds() {
        assert_eq!(TargetFeature::parse("ANY"), Some(TargetFeature::Any));
        assert_eq!(TargetFeature::parse("cone"), Some(TargetFeature::Cone));
        assert_eq!(TargetFeature::parse("prism"), None);
        assert_eq!(TargetFeature::Torus.as_str(), "torus");
    }
}
