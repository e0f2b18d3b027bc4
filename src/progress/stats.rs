//! Per-pipeline statistics and the aggregate view over all work pipelines.
//!
//! [`PipelineStats`] is owned by the bus and mutated only on its consumer
//! thread.  Callers receive snapshot copies.

use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

use super::event::{EventPayload, PipelineKind, ProgressEvent};

// ---------------------------------------------------------------------------
// PipelineStats
// ---------------------------------------------------------------------------

/// Running counters for one [`PipelineKind`].
#[derive(Debug, Clone)]
pub struct PipelineStats {
    pub pipeline: PipelineKind,
    pub total_items: u64,
    pub completed_items: u64,
    /// Label of the item currently being processed; empty when idle.
    pub current_item: String,
    pub started_at: Instant,
    pub last_update: Instant,
    pub error_count: u64,
    pub warning_count: u64,
    pub custom_counters: BTreeMap<String, i64>,
    seen_start: bool,
    completed_ids: HashSet<String>,
}

impl PipelineStats {
    pub fn new(pipeline: PipelineKind) -> Self {
        let now = Instant::now();
        Self {
            pipeline,
            total_items: 0,
            completed_items: 0,
            current_item: String::new(),
            started_at: now,
            last_update: now,
            error_count: 0,
            warning_count: 0,
            custom_counters: BTreeMap::new(),
            seen_start: false,
            completed_ids: HashSet::new(),
        }
    }

    /// Fold one event into the counters.
    pub fn apply(&mut self, event: &ProgressEvent) {
        let now = Instant::now();
        match &event.payload {
            EventPayload::Start { total, label } => {
                if !self.seen_start && self.completed_items == 0 {
                    self.started_at = now;
                }
                self.seen_start = true;
                if let Some(total) = total {
                    self.total_items = *total;
                }
                if let Some(label) = label {
                    self.current_item = label.clone();
                }
            }
            EventPayload::Progress {
                completed,
                total,
                label,
            } => {
                self.completed_items = *completed;
                if let Some(total) = total {
                    self.total_items = *total;
                }
                self.current_item = label.clone().unwrap_or_default();
            }
            EventPayload::Complete { item_id, .. } => {
                self.current_item.clear();
                let first_time = match item_id {
                    Some(id) => self.completed_ids.insert(id.clone()),
                    None => true,
                };
                if first_time {
                    self.completed_items += 1;
                }
            }
            EventPayload::Error { .. } => self.error_count += 1,
            EventPayload::Warning { .. } => self.warning_count += 1,
            EventPayload::Info { .. } => {}
        }

        for (key, value) in &event.custom_counters {
            self.custom_counters.insert(key.clone(), *value);
        }
        self.last_update = now;
    }

    /// Completion percentage in `0.0..=100.0`; 0 when the total is unknown.
    pub fn progress_percent(&self) -> f64 {
        if self.total_items == 0 {
            return 0.0;
        }
        (self.completed_items as f64 / self.total_items as f64 * 100.0).min(100.0)
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn items_per_second(&self) -> f64 {
        rate(self.completed_items, self.elapsed())
    }

    /// Estimated seconds until the pipeline finishes.
    pub fn eta_seconds(&self) -> Option<f64> {
        self.eta_with_elapsed(self.elapsed())
    }

    /// ETA computed against an explicit elapsed time.
    ///
    /// `None` until at least one item completed and the rate is positive;
    /// `Some(0.0)` once nothing remains.
    pub fn eta_with_elapsed(&self, elapsed: Duration) -> Option<f64> {
        if self.total_items == 0 || self.completed_items == 0 {
            return None;
        }
        let remaining = self.total_items.saturating_sub(self.completed_items);
        if remaining == 0 {
            return Some(0.0);
        }
        let per_second = rate(self.completed_items, elapsed);
        if per_second <= 0.0 {
            return None;
        }
        Some(remaining as f64 / per_second)
    }

    /// A pipeline is active while it has unfinished work and a current item.
    pub fn is_active(&self) -> bool {
        self.total_items > 0
            && self.completed_items < self.total_items
            && !self.current_item.is_empty()
    }
}

fn rate(completed: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    completed as f64 / secs
}

// ---------------------------------------------------------------------------
// OverallStats
// ---------------------------------------------------------------------------

/// Aggregate over every work pipeline (everything but `Overall`).
#[derive(Debug, Clone, PartialEq)]
pub struct OverallStats {
    pub total_items: u64,
    pub completed_items: u64,
    pub progress_percent: f64,
    pub elapsed: Duration,
    pub error_count: u64,
    pub warning_count: u64,
    /// The largest positive per-pipeline ETA; the slowest pipeline bounds
    /// the run.
    pub eta_seconds: Option<f64>,
    pub active_pipelines: Vec<PipelineKind>,
}

impl OverallStats {
    /// Aggregate `stats`, ignoring any `Overall` entry.
    ///
    /// `elapsed` is measured from `run_started`.
    pub fn aggregate<'a>(
        stats: impl IntoIterator<Item = &'a PipelineStats>,
        run_started: Instant,
    ) -> Self {
        let mut total_items = 0;
        let mut completed_items = 0;
        let mut error_count = 0;
        let mut warning_count = 0;
        let mut eta_seconds: Option<f64> = None;
        let mut active_pipelines = Vec::new();

        for s in stats {
            if s.pipeline == PipelineKind::Overall {
                continue;
            }
            total_items += s.total_items;
            completed_items += s.completed_items;
            error_count += s.error_count;
            warning_count += s.warning_count;

            if let Some(eta) = s.eta_seconds().filter(|eta| *eta > 0.0) {
                eta_seconds = Some(eta_seconds.map_or(eta, |cur| cur.max(eta)));
            }
            if s.is_active() {
                active_pipelines.push(s.pipeline);
            }
        }

        let progress_percent = if total_items == 0 {
            0.0
        } else {
            (completed_items as f64 / total_items as f64 * 100.0).min(100.0)
        };

        Self {
            total_items,
            completed_items,
            progress_percent,
            elapsed: run_started.elapsed(),
            error_count,
            warning_count,
            eta_seconds,
            active_pipelines,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
