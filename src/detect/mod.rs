//! The detection loop: aim, raycast, optionally fit, then hand the result to the
//! [`ResultRouter`].

pub mod router;
pub mod stats;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use glam::Vec3;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::feedback::SceneSink;
use crate::fit::{FitParams, SurfaceFitter};
use crate::geometry::{FeatureKind, FitResult, normalize_for_viewer};
use crate::mesh::SpatialIndex;
use crate::tracking::{AnchorId, PoseSource};

pub use router::{RETENTION_RADIUS_SQ, RETENTION_WINDOW, ResultRouter, RouteError, RouteOutcome};
pub use stats::{DEFAULT_STATS_WINDOW, DetectionStats, FoundRate};

const WORKER_THREAD_NAME: &str = "meshprobe-detect";

pub type SharedFitter = Arc<Mutex<Box<dyn SurfaceFitter>>>;

pub fn shared_fitter(fitter: impl SurfaceFitter + 'static) -> SharedFitter {
    Arc::new(Mutex::new(Box::new(fitter)))
}

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("failed to spawn detection thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("detection thread panicked")]
    WorkerPanicked,
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// User-facing switches read by the loop on every iteration.
#[derive(Debug)]
pub struct DetectionControls {
    armed: AtomicBool,
    commit: AtomicBool,
    align: AtomicBool,
}

impl Default for DetectionControls {
    fn default() -> Self {
        Self::new(true)
    }
}

impl DetectionControls {
    pub fn new(align: bool) -> Self {
        Self {
            armed: AtomicBool::new(false),
            commit: AtomicBool::new(false),
            align: AtomicBool::new(align),
        }
    }

    /// Disarming also drops a commit that has not been picked up yet.
    pub fn set_armed(&self, armed: bool) {
        self.armed.store(armed, Ordering::SeqCst);
        if !armed {
            self.commit.store(false, Ordering::SeqCst);
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Returns false (and records nothing) while disarmed.
    pub fn request_commit(&self) -> bool {
        if !self.is_armed() {
            return false;
        }
        self.commit.store(true, Ordering::SeqCst);
        true
    }

    pub fn take_commit(&self) -> bool {
        self.commit.swap(false, Ordering::SeqCst)
    }

    pub fn commit_pending(&self) -> bool {
        self.commit.load(Ordering::SeqCst)
    }

    pub fn set_align(&self, align: bool) {
        self.align.store(align, Ordering::SeqCst);
    }

    pub fn align(&self) -> bool {
        self.align.load(Ordering::SeqCst)
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset_ms: AtomicU64,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset_ms: AtomicU64::new(0),
        }
    }

    pub fn set_ms(&self, millis: u64) {
        self.offset_ms.store(millis, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, millis: u64) {
        self.offset_ms.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.offset_ms.load(Ordering::SeqCst)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
    }
}

/// How one detection iteration ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Iteration {
    Cancelled,
    /// No pose, or the aim ray hit nothing usable.
    Missed,
    /// Hit the mesh while disarmed.
    Scanned,
    NotFound,
    Previewed { kind: FeatureKind },
    Committed { anchor_id: AnchorId, name: String },
    CommitFailed,
}

pub struct DetectionLoop {
    index: SpatialIndex,
    poses: Arc<dyn PoseSource>,
    fitter: SharedFitter,
    router: Arc<Mutex<ResultRouter>>,
    controls: Arc<DetectionControls>,
    scene: Arc<dyn SceneSink>,
    clock: Arc<dyn Clock>,
    fit_params: FitParams,
    stats: Mutex<FoundRate>,
}

impl DetectionLoop {
    pub fn new(
        index: SpatialIndex,
        poses: Arc<dyn PoseSource>,
        fitter: SharedFitter,
        router: Arc<Mutex<ResultRouter>>,
        controls: Arc<DetectionControls>,
        scene: Arc<dyn SceneSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            index,
            poses,
            fitter,
            router,
            controls,
            scene,
            clock,
            fit_params: FitParams::default(),
            stats: Mutex::new(FoundRate::default()),
        }
    }

    /// Tuning passed to the fitter on every call; clamped into accepted ranges.
    pub fn with_fit_params(self, params: FitParams) -> Self {
        Self {
            fit_params: params.clamped(),
            ..self
        }
    }

    pub fn fit_params(&self) -> FitParams {
        self.fit_params
    }

    pub fn with_stats_window(self, window: usize) -> Self {
        Self {
            stats: Mutex::new(FoundRate::new(window)),
            ..self
        }
    }

    pub fn controls(&self) -> &Arc<DetectionControls> {
        &self.controls
    }

    pub fn router(&self) -> &Arc<Mutex<ResultRouter>> {
        &self.router
    }

    pub fn stats(&self) -> DetectionStats {
        let vertex_count = self.index.total_vertex_count();
        self.stats.lock().snapshot(vertex_count)
    }

    pub fn run_iteration(&self, cancel: &CancelToken) -> Iteration {
        if cancel.is_cancelled() {
            return Iteration::Cancelled;
        }

        let Some(pose) = self.poses.device_pose() else {
            self.record_miss();
            return Iteration::Missed;
        };

        let hit = self.index.raycast(pose.position, pose.forward);
        let resolved = hit.and_then(|hit| {
            self.index
                .nearest_triangle_vertices(&hit)
                .map(|triangle| (hit, triangle))
        });
        let Some((hit, triangle)) = resolved else {
            self.record_miss();
            self.scene.point_at(pose.aim_point(), false);
            return Iteration::Missed;
        };

        self.scene.highlight_triangle(triangle);
        self.scene.point_at(hit.position, true);

        if !self.controls.is_armed() {
            return Iteration::Scanned;
        }

        let mut result = self.fit_exclusive(triangle[0]);
        let now = self.clock.now();
        match &mut result {
            FitResult::None => self.stats.lock().record(now, false),
            FitResult::Found(fit) => {
                normalize_for_viewer(fit, pose.position, self.controls.align());
                self.stats.lock().record_found(now, fit.rms_error);
            }
        }

        if cancel.is_cancelled() {
            return Iteration::Cancelled;
        }

        let kind = result.kind();
        let commit = self.controls.take_commit();
        let routed = self.router.lock().route(result, hit.position, commit, now);
        match routed {
            Ok(RouteOutcome::Previewed { .. }) => match kind {
                Some(kind) => Iteration::Previewed { kind },
                None => Iteration::NotFound,
            },
            Ok(RouteOutcome::Committed(staged)) => Iteration::Committed {
                anchor_id: staged.id,
                name: staged.name,
            },
            Ok(RouteOutcome::CommitFailed) => Iteration::CommitFailed,
            Err(err) => {
                tracing::warn!(error = %err, "commit could not be staged");
                Iteration::CommitFailed
            }
        }
    }

    /// Runs the fitter over the full point set, seeded at `seed`. At most one fit runs
    /// at a time across every loop sharing this fitter.
    pub fn fit_exclusive(&self, seed: Vec3) -> FitResult {
        let mut fitter = self.fitter.lock();
        let points = self.index.snapshot_vertices();
        let Some(seed_index) = points.iter().position(|point| *point == seed) else {
            tracing::debug!("seed vertex vanished before fitting");
            return FitResult::None;
        };
        match fitter.fit(&points, seed_index, &self.fit_params) {
            Ok(result) => result,
            Err(err) => {
                tracing::debug!(error = %err, "fitter failed");
                FitResult::None
            }
        }
    }

    fn record_miss(&self) {
        if self.controls.is_armed() {
            let now = self.clock.now();
            self.stats.lock().record(now, false);
        }
    }
}

/// Owns the background thread driving a [`DetectionLoop`]. At most one thread runs.
pub struct DetectionRunner {
    detection: Arc<DetectionLoop>,
    interval: Duration,
    iterations: Arc<AtomicU64>,
    worker: Option<(CancelToken, JoinHandle<()>)>,
}

impl DetectionRunner {
    pub fn new(detection: Arc<DetectionLoop>, interval: Duration) -> Self {
        Self {
            detection,
            interval,
            iterations: Arc::new(AtomicU64::new(0)),
            worker: None,
        }
    }

    pub fn detection(&self) -> &Arc<DetectionLoop> {
        &self.detection
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::SeqCst)
    }

    /// Cancels and joins the running loop, if any, then starts a fresh one.
    pub fn restart(&mut self) -> Result<(), DetectError> {
        self.stop()?;

        let cancel = CancelToken::new();
        let token = cancel.clone();
        let detection = Arc::clone(&self.detection);
        let iterations = Arc::clone(&self.iterations);
        let interval = self.interval;
        let handle = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                while !token.is_cancelled() {
                    if detection.run_iteration(&token) == Iteration::Cancelled {
                        break;
                    }
                    iterations.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(interval);
                }
                tracing::debug!("detection loop exited");
            })?;
        self.worker = Some((cancel, handle));
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), DetectError> {
        let Some((cancel, handle)) = self.worker.take() else {
            return Ok(());
        };
        cancel.cancel();
        handle.join().map_err(|_| DetectError::WorkerPanicked)
    }
}

impl Drop for DetectionRunner {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            tracing::warn!(error = %err, "detection runner stopped uncleanly");
        }
    }
}
