//! Batch runner: pushes a list of items through a blocking work function,
//! either one after another or on a bounded worker pool, and reports
//! progress on the bus.
//!
//! # Event flow
//!
//! ```text
//! run()              Start{total = N}
//!   worker           Start{label}                (before the work)
//!   collector        Complete{item_id}                          (success)
//!   collector        Error{message, label} + Progress{k, N}     (failure)
//! ```
//!
//! Each item advances the count through exactly one event: `Complete` for a
//! success, the absolute `Progress` for a failure.  Only the collector emits
//! them, so the reported count never exceeds the total.  Every item yields exactly one
//! [`BatchItemResult`], whether it succeeded, failed, panicked or was
//! cancelled.  Results are returned in input order.

use std::fmt::Display;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::progress::{PipelineKind, ProgressBus, ProgressEvent};

/// Upper bound on pool size regardless of configuration.
pub const MAX_WORKERS: usize = 4;

const CANCELLED: &str = "cancelled";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One unit of work.
#[derive(Debug, Clone)]
pub struct BatchItem<T> {
    pub id: String,
    /// Human-readable name shown in progress events.
    pub label: String,
    pub input: T,
}

impl<T> BatchItem<T> {
    pub fn new(id: impl Into<String>, label: impl Into<String>, input: T) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            input,
        }
    }
}

/// Outcome of one [`BatchItem`].
#[derive(Debug, Clone)]
pub struct BatchItemResult<O> {
    pub item_id: String,
    pub success: bool,
    pub output: Option<O>,
    pub error_message: Option<String>,
    pub processing_time: Duration,
}

impl<O> BatchItemResult<O> {
    fn succeeded(item_id: String, output: O, processing_time: Duration) -> Self {
        Self {
            item_id,
            success: true,
            output: Some(output),
            error_message: None,
            processing_time,
        }
    }

    fn failed(item_id: String, message: String, processing_time: Duration) -> Self {
        Self {
            item_id,
            success: false,
            output: None,
            error_message: Some(message),
            processing_time,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Strictly in order, pausing `delay` between items (not after the last).
    Sequential { delay: Duration },
    /// Up to `workers` items at once.
    Parallel { workers: usize },
}

impl ExecutionMode {
    /// Parallel mode with `workers` clamped to `1..=MAX_WORKERS`.
    pub fn parallel(workers: usize) -> Self {
        Self::Parallel {
            workers: workers.clamp(1, MAX_WORKERS),
        }
    }
}

// ---------------------------------------------------------------------------
// BatchRunner
// ---------------------------------------------------------------------------

pub struct BatchRunner {
    bus: ProgressBus,
    pipeline: PipelineKind,
    cancel: CancellationToken,
}

impl BatchRunner {
    pub fn new(bus: ProgressBus, pipeline: PipelineKind, cancel: CancellationToken) -> Self {
        Self {
            bus,
            pipeline,
            cancel,
        }
    }

    /// Run `work` over every item and return one result per item, in input
    /// order.
    ///
    /// `work` runs on tokio's blocking pool.  An `Err` or a panic fails only
    /// that item.  Once the cancellation token fires, items that have not
    /// started are reported as failed with the message `"cancelled"`.
    pub async fn run<T, O, E, F>(
        &self,
        items: Vec<BatchItem<T>>,
        mode: ExecutionMode,
        work: F,
    ) -> Vec<BatchItemResult<O>>
    where
        T: Send + 'static,
        O: Send + 'static,
        E: Display + 'static,
        F: Fn(&T) -> Result<O, E> + Send + Sync + 'static,
    {
        let total = items.len();
        self.bus
            .emit(ProgressEvent::start(self.pipeline, Some(total as u64), None));
        if total == 0 {
            return Vec::new();
        }

        let labels: Vec<(String, String)> = items
            .iter()
            .map(|i| (i.id.clone(), i.label.clone()))
            .collect();
        let mut collector = Collector::new(&self.bus, self.pipeline, labels);
        let work = Arc::new(work);

        match mode {
            ExecutionMode::Sequential { delay } => {
                self.run_sequential(items, delay, work, &mut collector).await
            }
            ExecutionMode::Parallel { workers } => {
                self.run_parallel(items, workers.clamp(1, MAX_WORKERS), work, &mut collector)
                    .await
            }
        }

        let results = collector.finish();
        let ok = results.iter().filter(|r| r.success).count();
        log::info!(
            "{}: batch finished, {ok}/{total} succeeded",
            self.pipeline
        );
        results
    }

    async fn run_sequential<T, O, E, F>(
        &self,
        items: Vec<BatchItem<T>>,
        delay: Duration,
        work: Arc<F>,
        collector: &mut Collector<'_, O>,
    ) where
        T: Send + 'static,
        O: Send + 'static,
        E: Display + 'static,
        F: Fn(&T) -> Result<O, E> + Send + Sync + 'static,
    {
        for (index, item) in items.into_iter().enumerate() {
            if index > 0 && !delay.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            let result = if self.cancel.is_cancelled() {
                BatchItemResult::failed(item.id, CANCELLED.into(), Duration::ZERO)
            } else {
                spawn_item(self.bus.clone(), self.pipeline, item, Arc::clone(&work)).await
            };
            collector.record(index, result);
        }
    }

    async fn run_parallel<T, O, E, F>(
        &self,
        items: Vec<BatchItem<T>>,
        workers: usize,
        work: Arc<F>,
        collector: &mut Collector<'_, O>,
    ) where
        T: Send + 'static,
        O: Send + 'static,
        E: Display + 'static,
        F: Fn(&T) -> Result<O, E> + Send + Sync + 'static,
    {
        let permits = Arc::new(Semaphore::new(workers));
        let mut set = JoinSet::new();

        for (index, item) in items.into_iter().enumerate() {
            let permits = Arc::clone(&permits);
            let cancel = self.cancel.clone();
            let bus = self.bus.clone();
            let work = Arc::clone(&work);
            let pipeline = self.pipeline;

            set.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = permits.acquire_owned() => permit.ok(),
                };
                let result = match permit {
                    Some(_permit) if !cancel.is_cancelled() => {
                        spawn_item(bus, pipeline, item, work).await
                    }
                    _ => BatchItemResult::failed(item.id, CANCELLED.into(), Duration::ZERO),
                };
                (index, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => collector.record(index, result),
                // Missing slots are filled in by `Collector::finish`.
                Err(e) => log::error!("{}: batch task failed: {e}", self.pipeline),
            }
        }
    }
}

/// Run one item on the blocking pool.
async fn spawn_item<T, O, E, F>(
    bus: ProgressBus,
    pipeline: PipelineKind,
    item: BatchItem<T>,
    work: Arc<F>,
) -> BatchItemResult<O>
where
    T: Send + 'static,
    O: Send + 'static,
    E: Display + 'static,
    F: Fn(&T) -> Result<O, E> + Send + Sync + 'static,
{
    let item_id = item.id.clone();
    let joined = tokio::task::spawn_blocking(move || execute(&bus, pipeline, &item, &*work)).await;
    joined.unwrap_or_else(|e| {
        BatchItemResult::failed(item_id, format!("worker failed: {e}"), Duration::ZERO)
    })
}

fn execute<T, O, E, F>(
    bus: &ProgressBus,
    pipeline: PipelineKind,
    item: &BatchItem<T>,
    work: &F,
) -> BatchItemResult<O>
where
    E: Display + 'static,
    F: Fn(&T) -> Result<O, E>,
{
    bus.emit(ProgressEvent::start(pipeline, None, Some(&item.label)));
    let started = Instant::now();
    let outcome = catch_unwind(AssertUnwindSafe(|| work(&item.input)));
    let elapsed = started.elapsed();

    match outcome {
        Ok(Ok(output)) => BatchItemResult::succeeded(item.id.clone(), output, elapsed),
        Ok(Err(e)) => BatchItemResult::failed(item.id.clone(), e.to_string(), elapsed),
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            BatchItemResult::failed(item.id.clone(), format!("panicked: {msg}"), elapsed)
        }
    }
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

/// Single point that records results and emits the per-item outcome and
/// progress events.
struct Collector<'a, O> {
    bus: &'a ProgressBus,
    pipeline: PipelineKind,
    labels: Vec<(String, String)>,
    slots: Vec<Option<BatchItemResult<O>>>,
    processed: u64,
}

impl<'a, O> Collector<'a, O> {
    fn new(bus: &'a ProgressBus, pipeline: PipelineKind, labels: Vec<(String, String)>) -> Self {
        let slots = labels.iter().map(|_| None).collect();
        Self {
            bus,
            pipeline,
            labels,
            slots,
            processed: 0,
        }
    }

    fn record(&mut self, index: usize, result: BatchItemResult<O>) {
        let total = self.slots.len() as u64;
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        if slot.is_some() {
            return;
        }
        let label = self.labels[index].1.as_str();
        self.processed += 1;
        if result.success {
            self.bus.emit(ProgressEvent::complete(
                self.pipeline,
                Some(&result.item_id),
                Some(label),
            ));
        } else {
            let message = result.error_message.as_deref().unwrap_or("failed");
            self.bus
                .emit(ProgressEvent::error(self.pipeline, message, Some(label)));
            // Errors do not move the count.
            self.bus.emit(ProgressEvent::progress(
                self.pipeline,
                self.processed,
                Some(total),
                None,
            ));
        }
        *slot = Some(result);
    }

    fn finish(mut self) -> Vec<BatchItemResult<O>> {
        for index in 0..self.slots.len() {
            if self.slots[index].is_none() {
                let id = self.labels[index].0.clone();
                self.record(
                    index,
                    BatchItemResult::failed(id, "worker task lost".into(), Duration::ZERO),
                );
            }
        }
        self.slots.into_iter().flatten().collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
