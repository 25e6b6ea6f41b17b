use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::geometry::SurfaceFit;
use crate::mesh::{Face, FragmentKey, MeshEvent};
use crate::tracking::Pose;

use super::TapeError;

/// One line of a session tape: `t` is milliseconds since the session started and `k`
/// names the event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TapeEvent {
    pub t: u64,
    #[serde(flatten)]
    pub data: TapeEventData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "k")]
pub enum TapeEventData {
    #[serde(rename = "mesh.add")]
    MeshAdd {
        key: FragmentKey,
        vertices: Vec<Vec3>,
        #[serde(default)]
        faces: Vec<Face>,
    },
    #[serde(rename = "mesh.update")]
    MeshUpdate {
        key: FragmentKey,
        vertices: Vec<Vec3>,
        #[serde(default)]
        faces: Vec<Face>,
    },
    #[serde(rename = "mesh.remove")]
    MeshRemove { key: FragmentKey },
    #[serde(rename = "pose")]
    Pose { position: Vec3, forward: Vec3 },
    #[serde(rename = "pose.lost")]
    PoseLost,
    #[serde(rename = "arm")]
    Arm { armed: bool },
    #[serde(rename = "align")]
    Align { align: bool },
    #[serde(rename = "commit")]
    Commit,
    /// The next fit returns `result`; `null` scripts an empty fit.
    #[serde(rename = "fit")]
    Fit { result: Option<SurfaceFit> },
    #[serde(rename = "fit.error")]
    FitError { message: String },
    /// The next anchor registration is refused.
    #[serde(rename = "anchor.reject")]
    AnchorReject,
    #[serde(rename = "release_all")]
    ReleaseAll,
    #[serde(rename = "tick")]
    Tick {
        #[serde(default = "one")]
        count: u32,
    },
}

fn one() -> u32 {
    1
}

impl TapeEventData {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MeshAdd { .. } => "mesh.add",
            Self::MeshUpdate { .. } => "mesh.update",
            Self::MeshRemove { .. } => "mesh.remove",
            Self::Pose { .. } => "pose",
            Self::PoseLost => "pose.lost",
            Self::Arm { .. } => "arm",
            Self::Align { .. } => "align",
            Self::Commit => "commit",
            Self::Fit { .. } => "fit",
            Self::FitError { .. } => "fit.error",
            Self::AnchorReject => "anchor.reject",
            Self::ReleaseAll => "release_all",
            Self::Tick { .. } => "tick",
        }
    }

    pub fn mesh_event(&self) -> Option<MeshEvent> {
        match self {
            Self::MeshAdd {
                key,
                vertices,
                faces,
            } => Some(MeshEvent::Added {
                key: *key,
                vertices: vertices.clone(),
                faces: faces.clone(),
            }),
            Self::MeshUpdate {
                key,
                vertices,
                faces,
            } => Some(MeshEvent::Updated {
                key: *key,
                vertices: vertices.clone(),
                faces: faces.clone(),
            }),
            Self::MeshRemove { key } => Some(MeshEvent::Removed { key: *key }),
            _ => None,
        }
    }

    pub fn pose(&self) -> Option<Pose> {
        match self {
            Self::Pose { position, forward } => Some(Pose::new(*position, *forward)),
            _ => None,
        }
    }
}

/// An event with its zero-based line offset among the tape's non-blank lines.
#[derive(Debug, Clone, PartialEq)]
pub struct TapeEventAt {
    pub offset: u64,
    pub event: TapeEvent,
}

pub fn parse_jsonl_events(input: &str) -> Result<Vec<TapeEventAt>, TapeError> {
    let mut out = Vec::new();
    for (line_index, line) in input.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let event = serde_json::from_str::<TapeEvent>(line).map_err(|source| TapeError::Parse {
            line: line_index + 1,
            source,
        })?;
        out.push(TapeEventAt {
            offset: out.len() as u64,
            event,
        });
    }
    Ok(out)
}

pub fn to_jsonl(events: &[TapeEvent]) -> Result<String, serde_json::Error> {
    let mut out = String::new();
    for event in events {
        out.push_str(&serde_json::to_string(event)?);
        out.push('\n');
    }
    Ok(out)
}
