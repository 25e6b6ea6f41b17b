//! Rendering and user-feedback hooks. The pipeline only ever talks to these traits.

use glam::{Mat4, Vec3};
use parking_lot::Mutex;
use serde::Serialize;

use crate::geometry::{FeatureKind, FitResult, Geometry};
use crate::tracking::AnchorId;

pub trait SceneSink: Send + Sync {
    /// The triangle under the aim ray, nearest vertex first.
    fn highlight_triangle(&self, vertices: [Vec3; 3]);

    /// Moves the pointer. `on_surface` is false when the ray missed the mesh.
    fn point_at(&self, position: Vec3, on_surface: bool);
}

pub trait FeedbackSink: Send + Sync {
    /// Shows the current result; `FitResult::None` clears the preview.
    fn preview(&self, result: &FitResult);

    fn commit_succeeded(&self, id: AnchorId, name: &str);

    fn commit_failed(&self);
}

pub trait GeometrySink: Send + Sync {
    fn spawn(&self, id: AnchorId, name: &str, geometry: &Geometry);

    fn update(&self, id: AnchorId, transform: Mat4);

    fn despawn(&self, id: AnchorId);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl SceneSink for NullSink {
    fn highlight_triangle(&self, _vertices: [Vec3; 3]) {}

    fn point_at(&self, _position: Vec3, _on_surface: bool) {}
}

impl FeedbackSink for NullSink {
    fn preview(&self, _result: &FitResult) {}

    fn commit_succeeded(&self, _id: AnchorId, _name: &str) {}

    fn commit_failed(&self) {}
}

impl GeometrySink for NullSink {
    fn spawn(&self, _id: AnchorId, _name: &str, _geometry: &Geometry) {}

    fn update(&self, _id: AnchorId, _transform: Mat4) {}

    fn despawn(&self, _id: AnchorId) {}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FeedbackEvent {
    Highlight { vertices: [Vec3; 3] },
    Pointer { position: Vec3, on_surface: bool },
    Preview { kind: Option<FeatureKind> },
    CommitSucceeded { anchor_id: AnchorId, name: String },
    CommitFailed,
    Spawned { anchor_id: AnchorId, name: String, kind: FeatureKind },
    Moved { anchor_id: AnchorId, position: Vec3 },
    Despawned { anchor_id: AnchorId },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FeedbackSummary {
    pub highlights: usize,
    pub pointer_on_surface: usize,
    pub pointer_off_surface: usize,
    pub previews_found: usize,
    pub previews_cleared: usize,
    pub commits_succeeded: Vec<String>,
    pub commits_failed: usize,
    pub spawned: usize,
    pub moved: usize,
    pub despawned: usize,
}

/// Keeps every callback in arrival order; used by replay and tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<FeedbackEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FeedbackEvent> {
        self.events.lock().clone()
    }

    pub fn take(&self) -> Vec<FeedbackEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn summary(&self) -> FeedbackSummary {
        let mut summary = FeedbackSummary::default();
        for event in self.events.lock().iter() {
            match event {
                FeedbackEvent::Highlight { .. } => summary.highlights += 1,
                FeedbackEvent::Pointer { on_surface: true, .. } => summary.pointer_on_surface += 1,
                FeedbackEvent::Pointer { on_surface: false, .. } => summary.pointer_off_surface += 1,
                FeedbackEvent::Preview { kind: Some(_) } => summary.previews_found += 1,
                FeedbackEvent::Preview { kind: None } => summary.previews_cleared += 1,
                FeedbackEvent::CommitSucceeded { name, .. } => {
                    summary.commits_succeeded.push(name.clone());
                }
                FeedbackEvent::CommitFailed => summary.commits_failed += 1,
                FeedbackEvent::Spawned { .. } => summary.spawned += 1,
                FeedbackEvent::Moved { .. } => summary.moved += 1,
                FeedbackEvent::Despawned { .. } => summary.despawned += 1,
            }
        }
        summary
    }

    fn push(&self, event: FeedbackEvent) {
        self.events.lock().push(event);
    }
}

impl SceneSink for RecordingSink {
    fn highlight_triangle(&self, vertices: [Vec3; 3]) {
        self.push(FeedbackEvent::Highlight { vertices });
    }

    fn point_at(&self, position: Vec3, on_surface: bool) {
        self.push(FeedbackEvent::Pointer {
            position,
            on_surface,
        });
    }
}

impl FeedbackSink for RecordingSink {
    fn preview(&self, result: &FitResult) {
        self.push(FeedbackEvent::Preview {
            kind: result.kind(),
        });
    }

    fn commit_succeeded(&self, id: AnchorId, name: &str) {
        self.push(FeedbackEvent::CommitSucceeded {
            anchor_id: id,
            name: name.to_string(),
        });
    }

    fn commit_failed(&self) {
        self.push(FeedbackEvent::CommitFailed);
    }
}

impl GeometrySink for RecordingSink {
    fn spawn(&self, id: AnchorId, name: &str, geometry: &Geometry) {
        self.push(FeedbackEvent::Spawned {
            anchor_id: id,
            name: name.to_string(),
            kind: geometry.kind(),
        });
    }

    fn update(&self, id: AnchorId, transform: Mat4) {
        self.push(FeedbackEvent::Moved {
            anchor_id: id,
            position: transform.w_axis.truncate(),
        });
    }

    fn despawn(&self, id: AnchorId) {
        self.push(FeedbackEvent::Despawned { anchor_id: id });
    }
}
