use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::Vec3;
use parking_lot::Mutex;
use thiserror::Error;

use crate::anchor::{AnchorReconciler, StagedAnchor};
use crate::feedback::FeedbackSink;
use crate::geometry::{FitResult, SurfaceFit};
use crate::store::StoreError;
use crate::tracking::AnchorRegistry;

/// How long a good result stays available to a commit that lands on a `None` frame.
pub const RETENTION_WINDOW: Duration = Duration::from_millis(200);
/// Max squared distance (m²) between the retained hit and the commit-time hit.
pub const RETENTION_RADIUS_SQ: f32 = 0.01;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("could not stage committed object: {0}")]
    Stage(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    Previewed { found: bool },
    Committed(StagedAnchor),
    CommitFailed,
}

#[derive(Debug, Clone)]
struct RetainedResult {
    fit: SurfaceFit,
    location: Vec3,
    captured_at: Instant,
}

/// Decides, per detection iteration, between previewing a result and committing it.
pub struct ResultRouter {
    reconciler: Arc<Mutex<AnchorReconciler>>,
    registry: Arc<dyn AnchorRegistry>,
    feedback: Arc<dyn FeedbackSink>,
    retained: Option<RetainedResult>,
}

impl ResultRouter {
    pub fn new(
        reconciler: Arc<Mutex<AnchorReconciler>>,
        registry: Arc<dyn AnchorRegistry>,
        feedback: Arc<dyn FeedbackSink>,
    ) -> Self {
        Self {
            reconciler,
            registry,
            feedback,
            retained: None,
        }
    }

    pub fn reconciler(&self) -> &Arc<Mutex<AnchorReconciler>> {
        &self.reconciler
    }

    pub fn has_retained(&self) -> bool {
        self.retained.is_some()
    }

    pub fn route(
        &mut self,
        result: FitResult,
        hit_location: Vec3,
        commit_requested: bool,
        now: Instant,
    ) -> Result<RouteOutcome, RouteError> {
        if let FitResult::Found(fit) = &result {
            self.retained = Some(RetainedResult {
                fit: fit.clone(),
                location: hit_location,
                captured_at: now,
            });
        }

        if !commit_requested {
            self.feedback.preview(&result);
            return Ok(RouteOutcome::Previewed {
                found: !result.is_none(),
            });
        }

        // A fresh result stays retained after its own commit.
        let candidate = match result {
            FitResult::Found(fit) => Some(fit),
            FitResult::None => self.take_retained(hit_location, now),
        };
        match candidate {
            Some(fit) => self.commit(&fit),
            None => {
                tracing::debug!("commit requested with no usable result");
                self.feedback.commit_failed();
                Ok(RouteOutcome::CommitFailed)
            }
        }
    }

    fn take_retained(&mut self, location: Vec3, now: Instant) -> Option<SurfaceFit> {
        let retained = self.retained.as_ref()?;
        if now.saturating_duration_since(retained.captured_at) >= RETENTION_WINDOW {
            self.retained = None;
            return None;
        }
        if retained.location.distance_squared(location) > RETENTION_RADIUS_SQ {
            return None;
        }
        self.retained.take().map(|retained| retained.fit)
    }

    fn commit(&mut self, fit: &SurfaceFit) -> Result<RouteOutcome, RouteError> {
        let staged = self.reconciler.lock().stage(fit);
        let staged = match staged {
            Ok(staged) => staged,
            Err(err) => {
                self.feedback.commit_failed();
                return Err(err.into());
            }
        };

        match self.registry.add_anchor(&staged.anchor()) {
            Ok(()) => {
                tracing::info!(anchor = %staged.id, name = %staged.name, "commit requested anchor");
                self.feedback.commit_succeeded(staged.id, &staged.name);
                Ok(RouteOutcome::Committed(staged))
            }
            Err(err) => {
                tracing::warn!(anchor = %staged.id, error = %err, "anchor registration failed");
                self.reconciler.lock().rollback(staged.id);
                self.feedback.commit_failed();
                Ok(RouteOutcome::CommitFailed)
            }
        }
    }
}
