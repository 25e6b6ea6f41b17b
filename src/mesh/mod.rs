pub mod raycast;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use glam::Vec3;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use raycast::{RayHit, SpatialIndex};

/// Stable identity of one scanned mesh region, issued by the tracking subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FragmentKey(pub Uuid);

impl FragmentKey {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FragmentKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FragmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub type Face = [u32; 3];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: Vec3,
    pub max: Vec3,
}

impl Bounds {
    fn enclosing(points: &[Vec3]) -> Option<Self> {
        let first = *points.first()?;
        let (min, max) = points
            .iter()
            .fold((first, first), |(min, max), point| (min.min(*point), max.max(*point)));
        Some(Self { min, max })
    }

    /// Slab test; true when the ray (t >= 0) passes through the box.
    pub fn hit_by(&self, origin: Vec3, direction: Vec3) -> bool {
        let inverse = direction.recip();
        let t0 = (self.min - origin) * inverse;
        let t1 = (self.max - origin) * inverse;
        let near = t0.min(t1);
        let far = t0.max(t1);
        let enter = nan_to(near.x, f32::NEG_INFINITY)
            .max(nan_to(near.y, f32::NEG_INFINITY))
            .max(nan_to(near.z, f32::NEG_INFINITY));
        let exit = nan_to(far.x, f32::INFINITY)
            .min(nan_to(far.y, f32::INFINITY))
            .min(nan_to(far.z, f32::INFINITY));
        exit >= enter.max(0.0)
    }
}

// 0 * inf along an axis the ray is parallel to and grazing.
fn nan_to(value: f32, fallback: f32) -> f32 {
    if value.is_nan() { fallback } else { value }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeshFragment {
    vertices: Vec<Vec3>,
    faces: Vec<Face>,
    bounds: Option<Bounds>,
}

impl MeshFragment {
    /// Faces referencing vertices outside this fragment are dropped so every stored
    /// face indexes its own vertex list.
    pub fn new(vertices: Vec<Vec3>, faces: Vec<Face>) -> Self {
        let vertex_count = vertices.len();
        let total_faces = faces.len();
        let faces = faces
            .into_iter()
            .filter(|face| face.iter().all(|index| (*index as usize) < vertex_count))
            .collect::<Vec<_>>();
        if faces.len() != total_faces {
            tracing::warn!(
                dropped = total_faces - faces.len(),
                vertex_count,
                "dropping faces with out-of-range vertex indices"
            );
        }
        let bounds = Bounds::enclosing(&vertices);
        Self {
            vertices,
            faces,
            bounds,
        }
    }

    pub fn vertices(&self) -> &[Vec3] {
        &self.vertices
    }

    pub fn faces(&self) -> &[Face] {
        &self.faces
    }

    pub fn bounds(&self) -> Option<Bounds> {
        self.bounds
    }

    pub fn triangle(&self, face_index: usize) -> Option<[Vec3; 3]> {
        let face = self.faces.get(face_index)?;
        Some([
            *self.vertices.get(face[0] as usize)?,
            *self.vertices.get(face[1] as usize)?,
            *self.vertices.get(face[2] as usize)?,
        ])
    }
}

/// A scan event from the tracking subsystem. Updates carry the full replacement
/// geometry for the fragment.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    Added {
        key: FragmentKey,
        vertices: Vec<Vec3>,
        faces: Vec<Face>,
    },
    Updated {
        key: FragmentKey,
        vertices: Vec<Vec3>,
        faces: Vec<Face>,
    },
    Removed {
        key: FragmentKey,
    },
}

/// All live mesh fragments keyed by source, with a running vertex total.
#[derive(Debug, Default)]
pub struct FragmentStore {
    fragments: HashMap<FragmentKey, Arc<MeshFragment>>,
    vertex_count: usize,
}

pub type SharedFragments = Arc<RwLock<FragmentStore>>;

impl FragmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedFragments {
        Arc::new(RwLock::new(Self::new()))
    }

    pub fn upsert(&mut self, key: FragmentKey, vertices: Vec<Vec3>, faces: Vec<Face>) {
        let fragment = Arc::new(MeshFragment::new(vertices, faces));
        let added = fragment.vertices.len();
        let replaced = self
            .fragments
            .insert(key, fragment)
            .map(|previous| previous.vertices.len())
            .unwrap_or(0);
        self.vertex_count = self.vertex_count + added - replaced;
    }

    pub fn remove(&mut self, key: &FragmentKey) -> bool {
        match self.fragments.remove(key) {
            Some(previous) => {
                self.vertex_count -= previous.vertices.len();
                true
            }
            None => false,
        }
    }

    pub fn apply(&mut self, event: MeshEvent) {
        match event {
            MeshEvent::Added {
                key,
                vertices,
                faces,
            }
            | MeshEvent::Updated {
                key,
                vertices,
                faces,
            } => self.upsert(key, vertices, faces),
            MeshEvent::Removed { key } => {
                self.remove(&key);
            }
        }
    }

    pub fn total_vertex_count(&self) -> usize {
        self.vertex_count
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn fragment(&self, key: &FragmentKey) -> Option<&Arc<MeshFragment>> {
        self.fragments.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &FragmentKey> {
        self.fragments.keys()
    }

    pub fn fragments(&self) -> impl Iterator<Item = (&FragmentKey, &Arc<MeshFragment>)> {
        self.fragments.iter()
    }

    /// Every vertex of every fragment. Fragment order is unspecified; order within a
    /// fragment is preserved. The iterator is `Clone`, so it can be restarted.
    pub fn all_vertices(&self) -> impl Iterator<Item = &Vec3> + Clone {
        self.fragments
            .values()
            .flat_map(|fragment| fragment.vertices.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle_at(z: f32) -> Vec<Vec3> {
        vec![
            Vec3::new(0.0, 0.0, z),
            Vec3::new(1.0, 0.0, z),
            Vec3::new(0.0, 1.0, z),
        ]
    }

    #[test]
    fn upsert_replaces_fragment_and_adjusts_count() {
        let mut store = FragmentStore::new();
        let key = FragmentKey::new();
        store.upsert(key, triangle_at(0.0), vec![[0, 1, 2]]);
        assert_eq!(store.total_vertex_count(), 3);

        let mut larger = triangle_at(1.0);
        larger.push(Vec3::new(1.0, 1.0, 1.0));
        store.upsert(key, larger.clone(), vec![[0, 1, 2], [1, 3, 2]]);
        assert_eq!(store.total_vertex_count(), 4);
        let fragment = store.fragment(&key).expect("fragment");
        assert_eq!(fragment.vertices(), larger.as_slice());
        assert_eq!(fragment.faces().len(), 2);
    }

    #[test]
    fn removing_missing_key_is_noop() {
        let mut store = FragmentStore::new();
        store.upsert(FragmentKey::new(), triangle_at(0.0), vec![[0, 1, 2]]);
        assert!(!store.remove(&FragmentKey::new()));
        assert_eq!(store.total_vertex_count(), 3);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn apply_dispatches_scan_events() {
        let mut store = FragmentStore::new();
        let key = FragmentKey::new();
        store.apply(MeshEvent::Added {
            key,
            vertices: triangle_at(0.0),
            faces: vec![[0, 1, 2]],
        });
        store.apply(MeshEvent::Updated {
            key,
            vertices: triangle_at(2.0)[..2].to_vec(),
            faces: Vec::new(),
        });
        assert_eq!(store.total_vertex_count(), 2);
        store.apply(MeshEvent::Removed { key });
        assert_eq!(store.total_vertex_count(), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn out_of_range_faces_are_dropped() {
        let fragment = MeshFragment::new(triangle_at(0.0), vec![[0, 1, 2], [0, 1, 7]]);
        assert_eq!(fragment.faces(), &[[0, 1, 2]]);
        assert!(fragment.triangle(1).is_none());
    }

    #[test]
    fn all_vertices_is_restartable() {
        let mut store = FragmentStore::new();
        store.upsert(FragmentKey::new(), triangle_at(0.0), vec![[0, 1, 2]]);
        store.upsert(FragmentKey::new(), triangle_at(1.0), vec![[0, 1, 2]]);
        let view = store.all_vertices();
        assert_eq!(view.clone().count(), 6);
        assert_eq!(view.count(), store.total_vertex_count());
    }

    #[test]
    fn bounds_reject_rays_pointing_away() {
        let bounds = Bounds::enclosing(&triangle_at(0.0)).expect("bounds");
        assert!(bounds.hit_by(Vec3::new(0.2, 0.2, 1.0), Vec3::NEG_Z));
        assert!(!bounds.hit_by(Vec3::new(0.2, 0.2, 1.0), Vec3::Z));
        assert!(!bounds.hit_by(Vec3::new(5.0, 5.0, 1.0), Vec3::NEG_Z));
    }
}
