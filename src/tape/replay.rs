//! Drives the full detection pipeline from a session tape.
//!
//! The real mesh store, spatial index, detection loop, router, reconciler and object
//! store are wired to scripted stand-ins for the tracking session and the fitter. In
//! deterministic mode a manual clock follows each event's `t` and `tick` events run
//! iterations inline; live mode plays the tape in real time against a background
//! [`DetectionRunner`].

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use glam::{Mat4, Vec3};
use parking_lot::Mutex;
use serde::Serialize;

use super::{Tape, TapeError, TapeEvent, TapeEventData};
use crate::anchor::{AddOutcome, AnchorReconciler};
use crate::config::EffectiveConfig;
use crate::detect::{
    CancelToken, Clock, DetectionControls, DetectionLoop, DetectionRunner, DetectionStats,
    Iteration, ManualClock, ResultRouter, SystemClock, shared_fitter,
};
use crate::feedback::{FeedbackSummary, RecordingSink};
use crate::fit::{FitError, FitParams, SurfaceFitter};
use crate::geometry::{FitResult, SurfaceFit};
use crate::mesh::{FragmentStore, SharedFragments, SpatialIndex};
use crate::store::ObjectStore;
use crate::tracking::{
    AnchorEvent, AnchorId, AnchorRegistry, Pose, PoseSource, TrackingError, WorldAnchor,
};

const LIVE_POLL: Duration = Duration::from_millis(5);

/// Queue of fit outcomes shared between the tape driver and a [`ScriptedFitter`].
#[derive(Debug, Clone, Default)]
pub struct FitScript {
    queue: Arc<Mutex<VecDeque<Result<Option<SurfaceFit>, String>>>>,
    calls: Arc<AtomicU64>,
    last_params: Arc<Mutex<Option<FitParams>>>,
}

impl FitScript {
    pub fn push_result(&self, result: Option<SurfaceFit>) {
        self.queue.lock().push_back(Ok(result));
    }

    pub fn push_error(&self, message: impl Into<String>) {
        self.queue.lock().push_back(Err(message.into()));
    }

    pub fn remaining(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Tuning the most recent fit was asked to use.
    pub fn last_params(&self) -> Option<FitParams> {
        *self.last_params.lock()
    }
}

/// Answers each fit with the next scripted outcome; an empty script finds nothing.
/// Outcomes whose kind the requested target does not accept come back as `None`.
#[derive(Debug)]
pub struct ScriptedFitter {
    script: FitScript,
}

impl ScriptedFitter {
    pub fn new(script: FitScript) -> Self {
        Self { script }
    }
}

impl SurfaceFitter for ScriptedFitter {
    fn fit(
        &mut self,
        points: &[Vec3],
        seed_index: usize,
        params: &FitParams,
    ) -> Result<FitResult, FitError> {
        self.script.calls.fetch_add(1, Ordering::SeqCst);
        *self.script.last_params.lock() = Some(*params);
        if seed_index >= points.len() {
            return Err(FitError::InvalidInput(format!(
                "seed {seed_index} outside {} points",
                points.len()
            )));
        }
        match self.script.queue.lock().pop_front() {
            Some(Ok(Some(fit))) if !params.accepts(fit.kind()) => {
                tracing::debug!(kind = %fit.kind().as_str(), target = params.target.as_str(), "scripted fit filtered by target");
                Ok(FitResult::None)
            }
            Some(Ok(result)) => Ok(result.into()),
            Some(Err(message)) => Err(FitError::Failed(message)),
            None => Ok(FitResult::None),
        }
    }

}

#[derive(Debug, Default)]
pub struct ScriptedPoses {
    pose: Mutex<Option<Pose>>,
}

impl ScriptedPoses {
    pub fn set(&self, pose: Option<Pose>) {
        *self.pose.lock() = pose;
    }
}

impl PoseSource for ScriptedPoses {
    fn device_pose(&self) -> Option<Pose> {
        *self.pose.lock()
    }
}

/// An in-process tracking session: accepted registrations are echoed back as anchor
/// events, which the driver drains and reconciles.
#[derive(Debug, Default)]
pub struct SimulatedAnchorRegistry {
    anchors: Mutex<BTreeMap<AnchorId, Mat4>>,
    rejections: AtomicU32,
    rejected: Mutex<Vec<AnchorId>>,
    outbox: Mutex<VecDeque<AnchorEvent>>,
}

impl SimulatedAnchorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_next(&self) {
        self.rejections.fetch_add(1, Ordering::SeqCst);
    }

    /// Re-announces an anchor the session already knew, as after a restart.
    pub fn relocalize(&self, anchor: WorldAnchor) {
        self.anchors.lock().insert(anchor.id, anchor.transform);
        self.outbox.lock().push_back(AnchorEvent::Added(anchor));
    }

    pub fn move_anchor(&self, id: AnchorId, transform: Mat4) -> bool {
        let moved = match self.anchors.lock().get_mut(&id) {
            Some(current) => {
                *current = transform;
                true
            }
            None => false,
        };
        if moved {
            self.outbox
                .lock()
                .push_back(AnchorEvent::Updated(WorldAnchor { id, transform }));
        }
        moved
    }

    pub fn drain_events(&self) -> Vec<AnchorEvent> {
        self.outbox.lock().drain(..).collect()
    }

    /// Ids refused by `add_anchor`, oldest first.
    pub fn rejected_ids(&self) -> Vec<AnchorId> {
        self.rejected.lock().clone()
    }

    fn take_rejection(&self) -> bool {
        self.rejections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

impl AnchorRegistry for SimulatedAnchorRegistry {
    fn add_anchor(&self, anchor: &WorldAnchor) -> Result<(), TrackingError> {
        if self.take_rejection() {
            self.rejected.lock().push(anchor.id);
            return Err(TrackingError::Rejected(anchor.id));
        }
        self.anchors.lock().insert(anchor.id, anchor.transform);
        self.outbox.lock().push_back(AnchorEvent::Added(*anchor));
        Ok(())
    }

    fn remove_anchor(&self, id: AnchorId) -> Result<(), TrackingError> {
        if self.anchors.lock().remove(&id).is_none() {
            return Err(TrackingError::UnknownAnchor(id));
        }
        self.outbox.lock().push_back(AnchorEvent::Removed(id));
        Ok(())
    }

    fn anchor_ids(&self) -> Vec<AnchorId> {
        self.anchors.lock().keys().copied().collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IterationTally {
    pub total: usize,
    pub cancelled: usize,
    pub missed: usize,
    pub scanned: usize,
    pub not_found: usize,
    pub previewed: usize,
    pub committed: usize,
    pub commit_failed: usize,
}

impl IterationTally {
    pub fn record(&mut self, iteration: &Iteration) {
        self.total += 1;
        match iteration {
            Iteration::Cancelled => self.cancelled += 1,
            Iteration::Missed => self.missed += 1,
            Iteration::Scanned => self.scanned += 1,
            Iteration::NotFound => self.not_found += 1,
            Iteration::Previewed { .. } => self.previewed += 1,
            Iteration::Committed { .. } => self.committed += 1,
            Iteration::CommitFailed => self.commit_failed += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AnchorTally {
    pub promoted: usize,
    pub recovered: usize,
    pub orphaned: usize,
    pub updated: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayMode {
    Deterministic,
    Live,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub tape_id: String,
    pub mode: ReplayMode,
    pub events: usize,
    pub duration_ms: u64,
    pub iterations: IterationTally,
    pub commits_ignored: usize,
    pub committed: Vec<String>,
    pub anchors: AnchorTally,
    pub fit_calls: u64,
    pub fit_params: FitParams,
    pub objects_stored: usize,
    pub pending: usize,
    pub live_objects: usize,
    pub stats: DetectionStats,
    pub feedback: FeedbackSummary,
}

/// Everything a replay drives, independent of how iterations are scheduled.
struct Pipeline {
    fragments: SharedFragments,
    detection: Arc<DetectionLoop>,
    reconciler: Arc<Mutex<AnchorReconciler>>,
    registry: Arc<SimulatedAnchorRegistry>,
    script: FitScript,
    poses: Arc<ScriptedPoses>,
    feedback: Arc<RecordingSink>,
    anchors: AnchorTally,
    committed: Vec<String>,
    commits_ignored: usize,
}

impl Pipeline {
    fn new(store: ObjectStore, config: &EffectiveConfig, clock: Arc<dyn Clock>) -> Result<Self, TapeError> {
        let fragments = FragmentStore::shared();
        let feedback = Arc::new(RecordingSink::new());
        let registry = Arc::new(SimulatedAnchorRegistry::new());
        let script = FitScript::default();
        let poses = Arc::new(ScriptedPoses::default());

        let persisted = store
            .list()?
            .into_iter()
            .map(|summary| store.find(summary.anchor_id))
            .collect::<Result<Vec<_>, _>>()?;
        for object in persisted.into_iter().flatten() {
            registry.relocalize(WorldAnchor {
                id: object.anchor_id,
                transform: object.geometry.extrinsics(),
            });
        }

        let reconciler = Arc::new(Mutex::new(AnchorReconciler::new(store, feedback.clone())));
        let router = ResultRouter::new(reconciler.clone(), registry.clone(), feedback.clone());
        let detection = DetectionLoop::new(
            SpatialIndex::new(fragments.clone()),
            poses.clone(),
            shared_fitter(ScriptedFitter::new(script.clone())),
            Arc::new(Mutex::new(router)),
            Arc::new(DetectionControls::new(config.detection.align)),
            feedback.clone(),
            clock,
        )
        .with_stats_window(config.detection.stats_window)
        .with_fit_params(config.fit);

        let mut pipeline = Self {
            fragments,
            detection: Arc::new(detection),
            reconciler,
            registry,
            script,
            poses,
            feedback,
            anchors: AnchorTally::default(),
            committed: Vec::new(),
            commits_ignored: 0,
        };
        pipeline.pump_anchor_events()?;
        Ok(pipeline)
    }

    /// Applies every event kind except `tick`.
    fn apply_control(&mut self, data: &TapeEventData) {
        if let Some(mesh_event) = data.mesh_event() {
            self.fragments.write().apply(mesh_event);
            return;
        }
        let controls = self.detection.controls();
        match data {
            TapeEventData::Pose { .. } => self.poses.set(data.pose()),
            TapeEventData::PoseLost => self.poses.set(None),
            TapeEventData::Arm { armed } => controls.set_armed(*armed),
            TapeEventData::Align { align } => controls.set_align(*align),
            TapeEventData::Commit => {
                if !controls.request_commit() {
                    tracing::debug!("commit ignored while disarmed");
                    self.commits_ignored += 1;
                }
            }
            TapeEventData::Fit { result } => self.script.push_result(result.clone()),
            TapeEventData::FitError { message } => self.script.push_error(message.clone()),
            TapeEventData::AnchorReject => self.registry.reject_next(),
            TapeEventData::ReleaseAll => {
                let released = self.reconciler.lock().release_all(self.registry.as_ref());
                tracing::info!(released, "released all anchors");
            }
            TapeEventData::MeshAdd { .. }
            | TapeEventData::MeshUpdate { .. }
            | TapeEventData::MeshRemove { .. }
            | TapeEventData::Tick { .. } => {}
        }
    }

    fn pump_anchor_events(&mut self) -> Result<(), TapeError> {
        loop {
            let events = self.registry.drain_events();
            if events.is_empty() {
                return Ok(());
            }
            for event in events {
                let outcome = self
                    .reconciler
                    .lock()
                    .apply_event(&event, self.registry.as_ref())?;
                match (event, outcome) {
                    (_, Some(AddOutcome::Promoted { name })) => {
                        self.anchors.promoted += 1;
                        self.committed.push(name);
                    }
                    (_, Some(AddOutcome::Recovered { .. })) => self.anchors.recovered += 1,
                    (_, Some(AddOutcome::Unknown)) => self.anchors.orphaned += 1,
                    (AnchorEvent::Updated(_), None) => self.anchors.updated += 1,
                    (AnchorEvent::Removed(_), None) => self.anchors.removed += 1,
                    (AnchorEvent::Added(_), None) => {}
                }
            }
        }
    }

    fn report(
        &self,
        tape: &Tape,
        mode: ReplayMode,
        iterations: IterationTally,
    ) -> Result<ReplayReport, TapeError> {
        let reconciler = self.reconciler.lock();
        Ok(ReplayReport {
            tape_id: tape.id.clone(),
            mode,
            events: tape.events.len(),
            duration_ms: tape.duration_ms(),
            iterations,
            commits_ignored: self.commits_ignored,
            committed: self.committed.clone(),
            anchors: self.anchors,
            fit_calls: self.script.calls(),
            fit_params: self.detection.fit_params(),
            objects_stored: reconciler.store().count()?,
            pending: reconciler.pending_count(),
            live_objects: reconciler.live_count(),
            stats: self.detection.stats(),
            feedback: self.feedback.summary(),
        })
    }
}

/// Deterministic replay: time only moves with the tape.
pub struct ReplayHarness {
    pipeline: Pipeline,
    clock: Arc<ManualClock>,
    cancel: CancelToken,
    iterations: IterationTally,
}

impl ReplayHarness {
    /// Persisted objects in `store` are re-announced by the simulated session before
    /// the first event, as a relocalizing device would.
    pub fn new(store: ObjectStore, config: &EffectiveConfig) -> Result<Self, TapeError> {
        let clock = Arc::new(ManualClock::new());
        let pipeline = Pipeline::new(store, config, clock.clone())?;
        Ok(Self {
            pipeline,
            clock,
            cancel: CancelToken::new(),
            iterations: IterationTally::default(),
        })
    }

    pub fn detection(&self) -> &Arc<DetectionLoop> {
        &self.pipeline.detection
    }

    pub fn reconciler(&self) -> &Arc<Mutex<AnchorReconciler>> {
        &self.pipeline.reconciler
    }

    pub fn registry(&self) -> &Arc<SimulatedAnchorRegistry> {
        &self.pipeline.registry
    }

    pub fn feedback(&self) -> &Arc<RecordingSink> {
        &self.pipeline.feedback
    }

    pub fn fragments(&self) -> &SharedFragments {
        &self.pipeline.fragments
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn iterations(&self) -> IterationTally {
        self.iterations
    }

    /// Applies one event and returns the iterations it ran (only `tick` runs any).
    pub fn apply(&mut self, event: &TapeEvent) -> Result<Vec<Iteration>, TapeError> {
        if event.t > self.clock.elapsed_ms() {
            self.clock.set_ms(event.t);
        }

        let mut ran = Vec::new();
        match &event.data {
            TapeEventData::Tick { count } => {
                for _ in 0..*count {
                    let iteration = self.pipeline.detection.run_iteration(&self.cancel);
                    self.iterations.record(&iteration);
                    ran.push(iteration);
                    self.pipeline.pump_anchor_events()?;
                }
            }
            other => self.pipeline.apply_control(other),
        }
        self.pipeline.pump_anchor_events()?;
        Ok(ran)
    }

    pub fn run(&mut self, tape: &Tape) -> Result<ReplayReport, TapeError> {
        for item in &tape.events {
            self.apply(&item.event)?;
        }
        self.report(tape)
    }

    pub fn report(&self, tape: &Tape) -> Result<ReplayReport, TapeError> {
        self.pipeline
            .report(tape, ReplayMode::Deterministic, self.iterations)
    }

    pub fn snapshot_vertices(&self) -> Vec<Vec3> {
        SpatialIndex::new(self.pipeline.fragments.clone()).snapshot_vertices()
    }
}

/// Plays `tape` in real time with detection on a background thread. `tick` events
/// are ignored; the runner iterates on its own schedule. Stops early once `cancel` is
/// set. Returns the report and the final point set.
pub fn replay_live(
    tape: &Tape,
    store: ObjectStore,
    config: &EffectiveConfig,
    cancel: &CancelToken,
) -> Result<(ReplayReport, Vec<Vec3>), TapeError> {
    let mut pipeline = Pipeline::new(store, config, Arc::new(SystemClock))?;
    let mut runner = DetectionRunner::new(pipeline.detection.clone(), config.detection.interval());
    runner.restart()?;

    let started = Instant::now();
    'events: for item in &tape.events {
        let due = started + Duration::from_millis(item.event.t);
        loop {
            if cancel.is_cancelled() {
                tracing::info!("live replay cancelled");
                break 'events;
            }
            let now = Instant::now();
            if now >= due {
                break;
            }
            pipeline.pump_anchor_events()?;
            thread::sleep((due - now).min(LIVE_POLL));
        }
        pipeline.apply_control(&item.event.data);
        pipeline.pump_anchor_events()?;
    }

    runner.stop()?;
    pipeline.pump_anchor_events()?;

    let iterations = IterationTally {
        total: runner.iterations() as usize,
        ..IterationTally::default()
    };
    let report = pipeline.report(tape, ReplayMode::Live, iterations)?;
    let points = SpatialIndex::new(pipeline.fragments.clone()).snapshot_vertices();
    Ok((report, points))
}
