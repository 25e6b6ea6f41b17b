//! Staging and reconciliation of committed objects against anchor lifecycle events.
//!
//! A commit stages a [`PendingObject`] under a fresh anchor id. The object is only
//! persisted once the tracking session confirms the anchor; a failed registration rolls
//! the staging entry back. Anchors confirmed after a restart are matched against the
//! [`ObjectStore`] instead.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use glam::{Mat4, Vec3};
use serde::Serialize;

use crate::feedback::GeometrySink;
use crate::geometry::{Geometry, SurfaceFit};
use crate::store::{ObjectStore, PersistedObject, StoreError};
use crate::tracking::{AnchorEvent, AnchorId, AnchorRegistry, WorldAnchor};

#[derive(Debug, Clone, PartialEq)]
pub struct PendingObject {
    pub name: String,
    pub geometry: Geometry,
    pub inliers: Vec<Vec3>,
    pub rms_error: f32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveObject {
    pub name: String,
    pub geometry: Geometry,
}

/// What a commit asks the tracking session to register.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedAnchor {
    pub id: AnchorId,
    pub transform: Mat4,
    pub name: String,
}

impl StagedAnchor {
    pub fn anchor(&self) -> WorldAnchor {
        WorldAnchor {
            id: self.id,
            transform: self.transform,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Promoted { name: String },
    Recovered { name: String },
    Unknown,
}

pub struct AnchorReconciler {
    store: ObjectStore,
    pending: HashMap<AnchorId, PendingObject>,
    live: HashMap<AnchorId, LiveObject>,
    geometry_sink: Arc<dyn GeometrySink>,
}

impl AnchorReconciler {
    pub fn new(store: ObjectStore, geometry_sink: Arc<dyn GeometrySink>) -> Self {
        Self {
            store,
            pending: HashMap::new(),
            live: HashMap::new(),
            geometry_sink,
        }
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self, id: AnchorId) -> Option<&PendingObject> {
        self.pending.get(&id)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn live(&self, id: AnchorId) -> Option<&LiveObject> {
        self.live.get(&id)
    }

    pub fn live_objects(&self) -> impl Iterator<Item = (&AnchorId, &LiveObject)> {
        self.live.iter()
    }

    /// Records a pending object for `fit` under a new anchor id.
    pub fn stage(&mut self, fit: &SurfaceFit) -> Result<StagedAnchor, StoreError> {
        let geometry = Geometry::from_fit(fit);
        let name = self.next_name(fit.kind().label())?;
        let id = AnchorId::new();
        let transform = geometry.extrinsics();

        self.pending.insert(
            id,
            PendingObject {
                name: name.clone(),
                geometry,
                inliers: fit.inliers.clone(),
                rms_error: fit.rms_error,
                created_at: Utc::now().trunc_subsecs(3),
            },
        );
        tracing::debug!(anchor = %id, name = %name, "staged pending object");
        Ok(StagedAnchor {
            id,
            transform,
            name,
        })
    }

    // Label plus the number of known objects, skipping forward past names already taken
    // (a deletion can free a lower count while a higher name is still in use).
    fn next_name(&self, label: &str) -> Result<String, StoreError> {
        let mut ordinal = self.pending.len() + self.store.count()?;
        loop {
            let candidate = format!("{label}{ordinal}");
            let staged = self.pending.values().any(|pending| pending.name == candidate);
            if !staged && !self.store.name_exists(&candidate)? {
                return Ok(candidate);
            }
            ordinal += 1;
        }
    }

    pub fn confirm_add(&mut self, anchor: &WorldAnchor) -> Result<AddOutcome, StoreError> {
        if let Some(pending) = self.pending.get(&anchor.id) {
            let mut geometry = pending.geometry;
            geometry.set_extrinsics(anchor.transform);
            let object = PersistedObject {
                anchor_id: anchor.id,
                name: pending.name.clone(),
                geometry,
                inliers: pending.inliers.clone(),
                rms_error: pending.rms_error,
                created_at: pending.created_at,
            };
            // Removed from pending only once the insert lands.
            self.store.insert(&object)?;
            self.pending.remove(&anchor.id);
            tracing::info!(anchor = %anchor.id, name = %object.name, "object persisted");
            self.show(anchor.id, object.name.clone(), object.geometry);
            return Ok(AddOutcome::Promoted { name: object.name });
        }

        if let Some(object) = self.store.find(anchor.id)? {
            let mut geometry = object.geometry;
            if geometry.extrinsics() != anchor.transform {
                geometry.set_extrinsics(anchor.transform);
                self.store.update_extrinsics(anchor.id, anchor.transform)?;
            }
            tracing::info!(anchor = %anchor.id, name = %object.name, "object recovered");
            self.show(anchor.id, object.name.clone(), geometry);
            return Ok(AddOutcome::Recovered { name: object.name });
        }

        tracing::warn!(anchor = %anchor.id, "anchor added with no pending or stored object");
        Ok(AddOutcome::Unknown)
    }

    fn show(&mut self, id: AnchorId, name: String, geometry: Geometry) {
        if self.live.contains_key(&id) {
            self.geometry_sink.update(id, geometry.extrinsics());
        } else {
            self.geometry_sink.spawn(id, &name, &geometry);
        }
        self.live.insert(id, LiveObject { name, geometry });
    }

    /// Drops the staging entry of a registration that failed.
    pub fn rollback(&mut self, id: AnchorId) -> bool {
        let removed = self.pending.remove(&id).is_some();
        if removed {
            tracing::debug!(anchor = %id, "rolled back pending object");
        }
        removed
    }

    pub fn confirm_update(&mut self, id: AnchorId, transform: Mat4) -> Result<bool, StoreError> {
        let Some(live) = self.live.get_mut(&id) else {
            return Ok(false);
        };
        if live.geometry.extrinsics() == transform {
            return Ok(true);
        }
        live.geometry.set_extrinsics(transform);
        self.geometry_sink.update(id, transform);
        self.store.update_extrinsics(id, transform)?;
        Ok(true)
    }

    pub fn confirm_remove(&mut self, id: AnchorId) -> Result<bool, StoreError> {
        let was_live = self.live.remove(&id).is_some();
        if was_live {
            self.geometry_sink.despawn(id);
        }
        let was_pending = self.pending.remove(&id).is_some();
        let was_stored = self.store.delete(id)?;
        if was_stored {
            tracing::info!(anchor = %id, "object removed");
        }
        Ok(was_live || was_pending || was_stored)
    }

    /// Forgets every object: live, staged and persisted. Returns the number of stored
    /// records deleted.
    pub fn clear(&mut self) -> Result<usize, StoreError> {
        for id in self.live.keys() {
            self.geometry_sink.despawn(*id);
        }
        self.live.clear();
        self.pending.clear();
        let removed = self.store.clear()?;
        tracing::info!(removed, "cleared all objects");
        Ok(removed)
    }

    /// Reconciles one anchor event. Orphaned anchors are released through `registry`.
    pub fn apply_event(
        &mut self,
        event: &AnchorEvent,
        registry: &dyn AnchorRegistry,
    ) -> Result<Option<AddOutcome>, StoreError> {
        match event {
            AnchorEvent::Added(anchor) => {
                let outcome = self.confirm_add(anchor)?;
                if outcome == AddOutcome::Unknown
                    && let Err(err) = registry.remove_anchor(anchor.id)
                {
                    tracing::warn!(anchor = %anchor.id, error = %err, "failed to release orphaned anchor");
                }
                Ok(Some(outcome))
            }
            AnchorEvent::Updated(anchor) => {
                self.confirm_update(anchor.id, anchor.transform)?;
                Ok(None)
            }
            AnchorEvent::Removed(id) => {
                self.confirm_remove(*id)?;
                Ok(None)
            }
        }
    }

    /// Asks the registry to release every anchor it holds. Removal events reconcile the
    /// store afterwards. Returns how many releases were accepted.
    pub fn release_all(&self, registry: &dyn AnchorRegistry) -> usize {
        let mut released = 0;
        for id in registry.anchor_ids() {
            match registry.remove_anchor(id) {
                Ok(()) => released += 1,
                Err(err) => tracing::warn!(anchor = %id, error = %err, "anchor release failed"),
            }
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::{FeedbackEvent, RecordingSink};
    use crate::geometry::{Plane, Primitive, Torus, placement};
    use crate::tracking::TrackingError;
    use parking_lot::Mutex;

    fn plane_fit() -> SurfaceFit {
        SurfaceFit::new(
            Primitive::Plane(Plane {
                width: 1.0,
                height: 0.5,
                extrinsics: placement(Vec3::new(0.0, 0.0, -1.0), Vec3::Z),
            }),
            vec![Vec3::new(0.0, 0.0, -1.0)],
            0.002,
        )
    }

    fn reconciler() -> (AnchorReconciler, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let store = ObjectStore::open_in_memory().expect("store");
        (AnchorReconciler::new(store, sink.clone()), sink)
    }

    #[derive(Default)]
    struct Registry {
        ids: Mutex<Vec<AnchorId>>,
        removed: Mutex<Vec<AnchorId>>,
    }

    impl AnchorRegistry for Registry {
        fn add_anchor(&self, anchor: &WorldAnchor) -> Result<(), TrackingError> {
            self.ids.lock().push(anchor.id);
            Ok(())
        }

        fn remove_anchor(&self, id: AnchorId) -> Result<(), TrackingError> {
            self.removed.lock().push(id);
            Ok(())
        }

        fn anchor_ids(&self) -> Vec<AnchorId> {
            self.ids.lock().clone()
        }
    }

    #[test]
    fn names_count_pending_and_persisted_objects() {
        let (mut reconciler, _) = reconciler();
        let first = reconciler.stage(&plane_fit()).expect("stage");
        assert_eq!(first.name, "Plane0");
        reconciler.confirm_add(&first.anchor()).expect("confirm");

        let second = reconciler.stage(&plane_fit()).expect("stage");
        let third = reconciler.stage(&plane_fit()).expect("stage");
        assert_eq!(second.name, "Plane1");
        assert_eq!(third.name, "Plane2");
    }

    #[test]
    fn names_skip_past_taken_ordinals() {
        let (mut reconciler, _) = reconciler();
        let first = reconciler.stage(&plane_fit()).expect("stage");
        reconciler.confirm_add(&first.anchor()).expect("confirm");
        let second = reconciler.stage(&plane_fit()).expect("stage");
        reconciler.confirm_add(&second.anchor()).expect("confirm");
        reconciler.confirm_remove(first.id).expect("remove");

        let third = reconciler.stage(&plane_fit()).expect("stage");
        assert_eq!(third.name, "Plane2");
    }

    #[test]
    fn torus_is_staged_with_collapsed_span() {
        let (mut reconciler, _) = reconciler();
        let ring = (0..16)
            .map(|step| {
                let angle = step as f32 / 16.0 * std::f32::consts::TAU;
                Vec3::new(angle.cos() * 0.3, 0.0, angle.sin() * 0.3)
            })
            .collect();
        let fit = SurfaceFit::new(
            Primitive::Torus(Torus {
                mean_radius: 0.3,
                tube_radius: 0.02,
                extrinsics: Mat4::IDENTITY,
            }),
            ring,
            0.001,
        );
        let staged = reconciler.stage(&fit).expect("stage");
        assert_eq!(staged.name, "Torus0");
        match reconciler.pending(staged.id).map(|pending| pending.geometry) {
            Some(Geometry::Torus { span, .. }) => assert!(span.is_full()),
            other => panic!("expected torus geometry, got {other:?}"),
        }
    }

    #[test]
    fn confirmed_add_promotes_and_spawns() {
        let (mut reconciler, sink) = reconciler();
        let staged = reconciler.stage(&plane_fit()).expect("stage");
        let outcome = reconciler.confirm_add(&staged.anchor()).expect("confirm");

        assert_eq!(
            outcome,
            AddOutcome::Promoted {
                name: "Plane0".to_string()
            }
        );
        assert_eq!(reconciler.pending_count(), 0);
        assert_eq!(reconciler.live_count(), 1);
        let stored = reconciler.store().find(staged.id).expect("find").expect("stored");
        assert_eq!(stored.name, "Plane0");
        assert_eq!(stored.geometry.extrinsics(), staged.transform);
        assert!(matches!(sink.events().as_slice(), [FeedbackEvent::Spawned { .. }]));
    }

    #[test]
    fn rolled_back_anchor_is_unknown() {
        let (mut reconciler, _) = reconciler();
        let staged = reconciler.stage(&plane_fit()).expect("stage");
        assert!(reconciler.rollback(staged.id));
        assert!(!reconciler.rollback(staged.id));
        let outcome = reconciler.confirm_add(&staged.anchor()).expect("confirm");
        assert_eq!(outcome, AddOutcome::Unknown);
        assert_eq!(reconciler.store().count().expect("count"), 0);
    }

    #[test]
    fn failed_insert_keeps_object_staged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("objects.sqlite");
        let sink = Arc::new(RecordingSink::new());
        let mut first = AnchorReconciler::new(ObjectStore::open(&path).expect("open"), sink.clone());
        let mut second = AnchorReconciler::new(ObjectStore::open(&path).expect("open"), sink);

        let a = first.stage(&plane_fit()).expect("stage a");
        let b = second.stage(&plane_fit()).expect("stage b");
        assert_eq!(a.name, b.name);
        first.confirm_add(&a.anchor()).expect("confirm a");

        let err = second.confirm_add(&b.anchor()).expect_err("name clash");
        assert!(matches!(err, StoreError::DuplicateName(ref name) if name == "Plane0"));
        assert_eq!(second.pending(b.id).map(|p| p.name.as_str()), Some("Plane0"));
        assert_eq!(second.live_count(), 0);

        first.confirm_remove(a.id).expect("free the name");
        let retried = second.confirm_add(&b.anchor()).expect("retry");
        assert_eq!(
            retried,
            AddOutcome::Promoted {
                name: "Plane0".to_string()
            }
        );
        assert_eq!(second.pending_count(), 0);
    }

    #[test]
    fn stored_object_is_recovered_after_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("objects.sqlite");
        let sink = Arc::new(RecordingSink::new());

        let staged = {
            let mut reconciler =
                AnchorReconciler::new(ObjectStore::open(&path).expect("open"), sink.clone());
            let staged = reconciler.stage(&plane_fit()).expect("stage");
            reconciler.confirm_add(&staged.anchor()).expect("confirm");
            staged
        };

        let mut restarted = AnchorReconciler::new(ObjectStore::open(&path).expect("reopen"), sink);
        let moved = Mat4::from_translation(Vec3::new(0.0, 0.1, -1.0));
        let outcome = restarted
            .confirm_add(&WorldAnchor {
                id: staged.id,
                transform: moved,
            })
            .expect("recover");
        assert_eq!(
            outcome,
            AddOutcome::Recovered {
                name: "Plane0".to_string()
            }
        );
        assert_eq!(restarted.live(staged.id).map(|live| live.geometry.extrinsics()), Some(moved));
        let stored = restarted.store().find(staged.id).expect("find").expect("stored");
        assert_eq!(stored.geometry.extrinsics(), moved);
    }

    #[test]
    fn update_and_remove_follow_the_anchor() {
        let (mut reconciler, sink) = reconciler();
        let registry = Registry::default();
        let staged = reconciler.stage(&plane_fit()).expect("stage");
        reconciler
            .apply_event(&AnchorEvent::Added(staged.anchor()), &registry)
            .expect("add");

        let moved = Mat4::from_translation(Vec3::new(1.0, 0.0, 0.0));
        reconciler
            .apply_event(
                &AnchorEvent::Updated(WorldAnchor {
                    id: staged.id,
                    transform: moved,
                }),
                &registry,
            )
            .expect("update");
        let stored = reconciler.store().find(staged.id).expect("find").expect("stored");
        assert_eq!(stored.geometry.extrinsics(), moved);

        reconciler
            .apply_event(&AnchorEvent::Removed(staged.id), &registry)
            .expect("remove");
        assert!(reconciler.store().find(staged.id).expect("find").is_none());
        assert_eq!(reconciler.live_count(), 0);
        assert_eq!(sink.summary().despawned, 1);
        assert!(!reconciler.confirm_update(staged.id, moved).expect("update gone"));
    }

    #[test]
    fn orphaned_anchor_is_released() {
        let (mut reconciler, _) = reconciler();
        let registry = Registry::default();
        let orphan = WorldAnchor {
            id: AnchorId::new(),
            transform: Mat4::IDENTITY,
        };
        let outcome = reconciler
            .apply_event(&AnchorEvent::Added(orphan), &registry)
            .expect("apply");
        assert_eq!(outcome, Some(AddOutcome::Unknown));
        assert_eq!(registry.removed.lock().as_slice(), &[orphan.id]);
    }

    #[test]
    fn clear_drops_everything() {
        let (mut reconciler, sink) = reconciler();
        let kept = reconciler.stage(&plane_fit()).expect("stage");
        reconciler.confirm_add(&kept.anchor()).expect("confirm");
        reconciler.stage(&plane_fit()).expect("stage pending");

        assert_eq!(reconciler.clear().expect("clear"), 1);
        assert_eq!(reconciler.pending_count(), 0);
        assert_eq!(reconciler.live_count(), 0);
        assert_eq!(sink.summary().despawned, 1);
    }

    #[test]
    fn release_all_asks_registry_for_every_anchor() {
        let (reconciler, _) = reconciler();
        let registry = Registry::default();
        for _ in 0..3 {
            registry
                .add_anchor(&WorldAnchor {
                    id: AnchorId::new(),
                    transform: Mat4::IDENTITY,
                })
                .expect("add");
        }
        assert_eq!(reconciler.release_all(&registry), 3);
        assert_eq!(registry.removed.lock().len(), 3);
    }
}
