use std::collections::VecDeque;
use std::time::Instant;

use serde::Serialize;

pub const DEFAULT_STATS_WINDOW: usize = 180;

/// Rolling record of the most recent iteration outcomes.
#[derive(Debug, Clone)]
pub struct FoundRate {
    samples: VecDeque<(Instant, bool)>,
    capacity: usize,
    iterations: u64,
    latest_rms_error: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DetectionStats {
    pub iterations: u64,
    pub window: usize,
    pub found_in_window: usize,
    pub found_fps: f32,
    pub found_ratio: f32,
    pub latest_rms_error: Option<f32>,
    pub vertex_count: usize,
}

impl Default for FoundRate {
    fn default() -> Self {
        Self::new(DEFAULT_STATS_WINDOW)
    }
}

impl FoundRate {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            iterations: 0,
            latest_rms_error: None,
        }
    }

    pub fn record(&mut self, at: Instant, found: bool) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((at, found));
        self.iterations += 1;
    }

    pub fn record_found(&mut self, at: Instant, rms_error: f32) {
        self.record(at, true);
        self.latest_rms_error = Some(rms_error);
    }

    pub fn found_in_window(&self) -> usize {
        self.samples.iter().filter(|(_, found)| *found).count()
    }

    /// Found results per second across the window's time span.
    pub fn found_fps(&self) -> f32 {
        let (Some((first, _)), Some((last, _))) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let span = last.saturating_duration_since(*first).as_secs_f32();
        if span <= 0.0 {
            return 0.0;
        }
        self.found_in_window() as f32 / span
    }

    pub fn found_ratio(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.found_in_window() as f32 / self.samples.len() as f32
    }

    pub fn snapshot(&self, vertex_count: usize) -> DetectionStats {
        DetectionStats {
            iterations: self.iterations,
            window: self.samples.len(),
            found_in_window: self.found_in_window(),
            found_fps: self.found_fps(),
            found_ratio: self.found_ratio(),
            latest_rms_error: self.latest_rms_error,
            vertex_count,
        }
    }
}
