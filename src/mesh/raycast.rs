use glam::Vec3;
use parking_lot::RwLockReadGuard;

use super::{FragmentKey, FragmentStore, MeshFragment, SharedFragments};

const PARALLEL_EPSILON: f32 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    pub origin: Vec3,
    pub direction: Vec3,
    pub position: Vec3,
    pub distance: f32,
    pub fragment: FragmentKey,
    pub face: usize,
}

/// Ray queries over the live fragments. Reads only; mutation goes through the shared
/// [`FragmentStore`].
#[derive(Debug, Clone)]
pub struct SpatialIndex {
    fragments: SharedFragments,
}

impl SpatialIndex {
    pub fn new(fragments: SharedFragments) -> Self {
        Self { fragments }
    }

    pub fn fragments(&self) -> &SharedFragments {
        &self.fragments
    }

    pub fn read(&self) -> RwLockReadGuard<'_, FragmentStore> {
        self.fragments.read()
    }

    pub fn total_vertex_count(&self) -> usize {
        self.fragments.read().total_vertex_count()
    }

    /// Nearest triangle hit along the ray, or `None` when nothing is hit.
    pub fn raycast(&self, origin: Vec3, direction: Vec3) -> Option<RayHit> {
        let direction = direction.try_normalize()?;
        let store = self.fragments.read();
        let mut nearest: Option<RayHit> = None;

        for (key, fragment) in store.fragments() {
            let Some(bounds) = fragment.bounds() else {
                continue;
            };
            if !bounds.hit_by(origin, direction) {
                continue;
            }
            let limit = nearest.map(|hit| hit.distance).unwrap_or(f32::INFINITY);
            if let Some((face, distance)) = nearest_face(fragment, origin, direction, limit) {
                nearest = Some(RayHit {
                    origin,
                    direction,
                    position: origin + direction * distance,
                    distance,
                    fragment: *key,
                    face,
                });
            }
        }

        nearest
    }

    /// The hit triangle's vertices, nearest to the hit position first. `None` when the
    /// fragment or face referenced by `hit` is gone.
    pub fn nearest_triangle_vertices(&self, hit: &RayHit) -> Option<[Vec3; 3]> {
        let store = self.fragments.read();
        let mut triangle = store.fragment(&hit.fragment)?.triangle(hit.face)?;
        triangle.sort_by(|a, b| {
            a.distance_squared(hit.position)
                .total_cmp(&b.distance_squared(hit.position))
        });
        Some(triangle)
    }

    /// The full current point set, materialized.
    pub fn snapshot_vertices(&self) -> Vec<Vec3> {
        self.fragments.read().all_vertices().copied().collect()
    }
}

fn nearest_face(
    fragment: &MeshFragment,
    origin: Vec3,
    direction: Vec3,
    limit: f32,
) -> Option<(usize, f32)> {
    let vertices = fragment.vertices();
    let mut best: Option<(usize, f32)> = None;
    for (index, face) in fragment.faces().iter().enumerate() {
        let a = vertices[face[0] as usize];
        let b = vertices[face[1] as usize];
        let c = vertices[face[2] as usize];
        let bound = best.map(|(_, distance)| distance).unwrap_or(limit);
        if let Some(distance) = intersect_triangle(origin, direction, a, b, c)
            && distance < bound
        {
            best = Some((index, distance));
        }
    }
    best
}

/// Möller–Trumbore, double sided. Returns the ray parameter of the hit.
fn intersect_triangle(origin: Vec3, direction: Vec3, a: Vec3, b: Vec3, c: Vec3) -> Option<f32> {
    let edge1 = b - a;
    let edge2 = c - a;
    let p = direction.cross(edge2);
    let det = edge1.dot(p);
    if det.abs() < PARALLEL_EPSILON {
        return None;
    }
    let inv_det = 1.0 / det;
    let s = origin - a;
    let u = s.dot(p) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(edge1);
    let v = direction.dot(q) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = edge2.dot(q) * inv_det;
    (t >= 0.0).then_some(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::FragmentStore;

    fn index_with(fragments: &[(FragmentKey, Vec<Vec3>)]) -> SpatialIndex {
        let shared = FragmentStore::shared();
        {
            let mut store = shared.write();
            for (key, vertices) in fragments {
                store.upsert(*key, vertices.clone(), vec![[0, 1, 2]]);
            }
        }
        SpatialIndex::new(shared)
    }

    fn triangle_at(z: f32) -> Vec<Vec3> {
        vec![
            Vec3::new(-1.0, -1.0, z),
            Vec3::new(1.0, -1.0, z),
            Vec3::new(0.0, 1.0, z),
        ]
    }

    #[test]
    fn raycast_hits_nearest_fragment() {
        let near = FragmentKey::new();
        let far = FragmentKey::new();
        let index = index_with(&[(far, triangle_at(-3.0)), (near, triangle_at(-1.0))]);

        let hit = index
            .raycast(Vec3::ZERO, Vec3::new(0.0, 0.0, -2.0))
            .expect("hit");
        assert_eq!(hit.fragment, near);
        assert_eq!(hit.face, 0);
        assert!((hit.distance - 1.0).abs() < 1e-6);
        assert!((hit.position - Vec3::new(0.0, 0.0, -1.0)).length() < 1e-6);
    }

    #[test]
    fn raycast_misses_behind_and_beside() {
        let index = index_with(&[(FragmentKey::new(), triangle_at(-1.0))]);
        assert!(index.raycast(Vec3::ZERO, Vec3::Z).is_none());
        assert!(index.raycast(Vec3::new(5.0, 0.0, 0.0), Vec3::NEG_Z).is_none());
        assert!(index.raycast(Vec3::ZERO, Vec3::ZERO).is_none());
    }

    #[test]
    fn triangle_vertices_are_sorted_by_distance_to_hit() {
        let index = index_with(&[(FragmentKey::new(), triangle_at(-1.0))]);
        let hit = index
            .raycast(Vec3::new(0.6, -0.7, 0.0), Vec3::NEG_Z)
            .expect("hit");
        let [first, second, third] = index.nearest_triangle_vertices(&hit).expect("vertices");
        assert_eq!(first, Vec3::new(1.0, -1.0, -1.0));
        assert!(first.distance_squared(hit.position) <= second.distance_squared(hit.position));
        assert!(second.distance_squared(hit.position) <= third.distance_squared(hit.position));
    }

    #[test]
    fn stale_hit_resolves_to_nothing() {
        let key = FragmentKey::new();
        let index = index_with(&[(key, triangle_at(-1.0))]);
        let hit = index.raycast(Vec3::ZERO, Vec3::NEG_Z).expect("hit");

        index
            .fragments()
            .write()
            .upsert(key, triangle_at(-1.0), Vec::new());
        assert!(index.nearest_triangle_vertices(&hit).is_none());

        index.fragments().write().remove(&key);
        assert!(index.nearest_triangle_vertices(&hit).is_none());
    }

    #[test]
    fn moller_trumbore_rejects_parallel_rays() {
        let hit = intersect_triangle(
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::X,
            Vec3::new(-1.0, -1.0, 0.0),
            Vec3::new(1.0, -1.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
        );
        assert!(hit.is_none());
    }
}
