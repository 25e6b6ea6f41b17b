pub mod align;
pub mod torus;

use glam::{Mat4, Quat, Vec3};
use serde::{Deserialize, Serialize};

pub use align::{PULL_TOWARD_VIEWER_FRACTION, normalize_for_viewer};
pub use torus::{AngleSpan, FULL_SPAN_THRESHOLD};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureKind {
    Plane,
    Sphere,
    Cylinder,
    Cone,
    Torus,
}

impl FeatureKind {
    pub const ALL: [FeatureKind; 5] = [
        Self::Plane,
        Self::Sphere,
        Self::Cylinder,
        Self::Cone,
        Self::Torus,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plane => "plane",
            Self::Sphere => "sphere",
            Self::Cylinder => "cylinder",
            Self::Cone => "cone",
            Self::Torus => "torus",
        }
    }

    /// Prefix used for generated display names ("Plane3", "Torus0", ...).
    pub const fn label(self) -> &'static str {
        match self {
            Self::Plane => "Plane",
            Self::Sphere => "Sphere",
            Self::Cylinder => "Cylinder",
            Self::Cone => "Cone",
            Self::Torus => "Torus",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Plane {
    pub width: f32,
    pub height: f32,
    pub extrinsics: Mat4,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sphere {
    pub radius: f32,
    pub extrinsics: Mat4,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cylinder {
    pub radius: f32,
    pub height: f32,
    pub extrinsics: Mat4,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cone {
    pub top_radius: f32,
    pub bottom_radius: f32,
    pub height: f32,
    pub extrinsics: Mat4,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Torus {
    pub mean_radius: f32,
    pub tube_radius: f32,
    pub extrinsics: Mat4,
}

/// A fitted primitive. The placement's local +Y axis is the primary axis (plane
/// normal, cylinder/cone/torus axis) and its translation is the primitive's position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Primitive {
    Plane(Plane),
    Sphere(Sphere),
    Cylinder(Cylinder),
    Cone(Cone),
    Torus(Torus),
}

impl Primitive {
    pub fn kind(&self) -> FeatureKind {
        match self {
            Self::Plane(_) => FeatureKind::Plane,
            Self::Sphere(_) => FeatureKind::Sphere,
            Self::Cylinder(_) => FeatureKind::Cylinder,
            Self::Cone(_) => FeatureKind::Cone,
            Self::Torus(_) => FeatureKind::Torus,
        }
    }

    pub fn extrinsics(&self) -> Mat4 {
        match self {
            Self::Plane(plane) => plane.extrinsics,
            Self::Sphere(sphere) => sphere.extrinsics,
            Self::Cylinder(cylinder) => cylinder.extrinsics,
            Self::Cone(cone) => cone.extrinsics,
            Self::Torus(torus) => torus.extrinsics,
        }
    }

    pub fn extrinsics_mut(&mut self) -> &mut Mat4 {
        match self {
            Self::Plane(plane) => &mut plane.extrinsics,
            Self::Sphere(sphere) => &mut sphere.extrinsics,
            Self::Cylinder(cylinder) => &mut cylinder.extrinsics,
            Self::Cone(cone) => &mut cone.extrinsics,
            Self::Torus(torus) => &mut torus.extrinsics,
        }
    }

    pub fn position(&self) -> Vec3 {
        self.extrinsics().w_axis.truncate()
    }
}

/// A successful fit: the primitive, the points classified as inliers, and the RMS
/// error of those inliers against the primitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurfaceFit {
    pub primitive: Primitive,
    #[serde(default)]
    pub inliers: Vec<Vec3>,
    pub rms_error: f32,
    /// Set once the pull-toward-viewer nudge has been applied.
    #[serde(skip)]
    pub aligned: bool,
}

impl SurfaceFit {
    pub fn new(primitive: Primitive, inliers: Vec<Vec3>, rms_error: f32) -> Self {
        Self {
            primitive,
            inliers,
            rms_error,
            aligned: false,
        }
    }

    pub fn kind(&self) -> FeatureKind {
        self.primitive.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum FitResult {
    #[default]
    None,
    Found(SurfaceFit),
}

impl FitResult {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn fit(&self) -> Option<&SurfaceFit> {
        match self {
            Self::None => None,
            Self::Found(fit) => Some(fit),
        }
    }

    pub fn kind(&self) -> Option<FeatureKind> {
        self.fit().map(SurfaceFit::kind)
    }
}

impl From<Option<SurfaceFit>> for FitResult {
    fn from(value: Option<SurfaceFit>) -> Self {
        match value {
            Some(fit) => Self::Found(fit),
            None => Self::None,
        }
    }
}

/// Geometry as it is persisted: a torus also carries the angular span of its tube.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Geometry {
    Plane(Plane),
    Sphere(Sphere),
    Cylinder(Cylinder),
    Cone(Cone),
    Torus { torus: Torus, span: AngleSpan },
}

impl Geometry {
    pub fn from_fit(fit: &SurfaceFit) -> Self {
        match fit.primitive {
            Primitive::Plane(plane) => Self::Plane(plane),
            Primitive::Sphere(sphere) => Self::Sphere(sphere),
            Primitive::Cylinder(cylinder) => Self::Cylinder(cylinder),
            Primitive::Cone(cone) => Self::Cone(cone),
            Primitive::Torus(torus) => Self::Torus {
                torus,
                span: torus.angle_span(&fit.inliers).collapsed(),
            },
        }
    }

    pub fn kind(&self) -> FeatureKind {
        match self {
            Self::Plane(_) => FeatureKind::Plane,
            Self::Sphere(_) => FeatureKind::Sphere,
            Self::Cylinder(_) => FeatureKind::Cylinder,
            Self::Cone(_) => FeatureKind::Cone,
            Self::Torus { .. } => FeatureKind::Torus,
        }
    }

    pub fn extrinsics(&self) -> Mat4 {
        match self {
            Self::Plane(plane) => plane.extrinsics,
            Self::Sphere(sphere) => sphere.extrinsics,
            Self::Cylinder(cylinder) => cylinder.extrinsics,
            Self::Cone(cone) => cone.extrinsics,
            Self::Torus { torus, .. } => torus.extrinsics,
        }
    }

    pub fn set_extrinsics(&mut self, extrinsics: Mat4) {
        match self {
            Self::Plane(plane) => plane.extrinsics = extrinsics,
            Self::Sphere(sphere) => sphere.extrinsics = extrinsics,
            Self::Cylinder(cylinder) => cylinder.extrinsics = extrinsics,
            Self::Cone(cone) => cone.extrinsics = extrinsics,
            Self::Torus { torus, .. } => torus.extrinsics = extrinsics,
        }
    }
}

/// Builds a rigid placement at `position` whose local +Y axis points along `axis`.
pub fn placement(position: Vec3, axis: Vec3) -> Mat4 {
    let axis = axis.normalize_or_zero();
    let rotation = if axis == Vec3::ZERO {
        Quat::IDENTITY
    } else {
        Quat::from_rotation_arc(Vec3::Y, axis)
    };
    Mat4::from_rotation_translation(rotation, position)
}
