//! Contracts for the tracking subsystem: device pose sampling, world anchors and the
//! anchor event stream.

use std::fmt;
use std::str::FromStr;

use glam::{Mat4, Vec3};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnchorId(pub Uuid);

impl AnchorId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AnchorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AnchorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for AnchorId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Aim pose: where the device is and which way it looks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vec3,
    pub forward: Vec3,
}

impl Pose {
    pub fn new(position: Vec3, forward: Vec3) -> Self {
        Self { position, forward }
    }

    /// Device transforms look down their local -Z axis.
    pub fn from_transform(transform: Mat4) -> Self {
        Self {
            position: transform.w_axis.truncate(),
            forward: -transform.z_axis.truncate(),
        }
    }

    /// The point one meter ahead of the device.
    pub fn aim_point(&self) -> Vec3 {
        self.position + self.forward.normalize_or_zero()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldAnchor {
    pub id: AnchorId,
    pub transform: Mat4,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AnchorEvent {
    Added(WorldAnchor),
    Updated(WorldAnchor),
    Removed(AnchorId),
}

impl AnchorEvent {
    pub fn id(&self) -> AnchorId {
        match self {
            Self::Added(anchor) | Self::Updated(anchor) => anchor.id,
            Self::Removed(id) => *id,
        }
    }
}

#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("anchor {0} was rejected by the tracking session")]
    Rejected(AnchorId),
    #[error("anchor {0} is not registered")]
    UnknownAnchor(AnchorId),
    #[error("tracking session unavailable: {0}")]
    Unavailable(String),
}

pub trait PoseSource: Send + Sync {
    /// Latest device pose, if tracking currently has one.
    fn device_pose(&self) -> Option<Pose>;
}

/// The world-anchor half of the tracking session. Successful calls are confirmed
/// later through the [`AnchorEvent`] stream, not synchronously.
pub trait AnchorRegistry: Send + Sync {
    fn add_anchor(&self, anchor: &WorldAnchor) -> Result<(), TrackingError>;

    fn remove_anchor(&self, id: AnchorId) -> Result<(), TrackingError>;

    fn anchor_ids(&self) -> Vec<AnchorId>;
}
