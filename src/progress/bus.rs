//! Thread-safe progress event bus.
//!
//! Producers call [`ProgressBus::emit`] from any thread; it never blocks.  A
//! single consumer thread (`progress-bus`) drains the queue, folds each event
//! into the per-pipeline [`PipelineStats`], keeps a short history of recent
//! events and then hands the event to every subscriber.
//!
//! ```text
//!  synthesis worker ─┐
//!  describe worker  ─┼─ emit ─▶ unbounded mpsc ─▶ progress-bus thread
//!  orchestrator     ─┘                              ├─ stats (one mutex)
//!                                                   ├─ recent ring buffer
//!                                                   └─ subscribers (in order)
//! ```
//!
//! Shutdown is signalled through a [`CancellationToken`] rather than a marker
//! event.  The consumer prefers queued events over the shutdown signal, so
//! everything emitted before [`ProgressBus::stop`] is processed.
//!
//! Subscribers run on the consumer thread one after another.  A slow
//! subscriber delays stat updates for everybody.

use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ProgressConfig;

use super::event::{PipelineKind, ProgressEvent};
use super::stats::{OverallStats, PipelineStats};

/// Name of the consumer thread.
pub const CONSUMER_THREAD_NAME: &str = "progress-bus";

// ---------------------------------------------------------------------------
// BusConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct BusConfig {
    /// Recent events kept per pipeline.
    pub recent_capacity: usize,
    /// How long [`ProgressBus::stop`] waits for the consumer to drain.
    pub shutdown_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            recent_capacity: 10,
            shutdown_timeout: Duration::from_secs(1),
        }
    }
}

impl From<&ProgressConfig> for BusConfig {
    fn from(cfg: &ProgressConfig) -> Self {
        Self {
            recent_capacity: cfg.recent_events,
            shutdown_timeout: Duration::from_millis(cfg.shutdown_timeout_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Subscribers
// ---------------------------------------------------------------------------

/// Receives every event after the bus has applied it to the stats.
pub trait ProgressSubscriber: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

impl<F> ProgressSubscriber for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_event(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// Handle returned by [`ProgressBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

// ---------------------------------------------------------------------------
// Shared state (bus handles + consumer thread)
// ---------------------------------------------------------------------------

struct StatsState {
    stats: BTreeMap<PipelineKind, PipelineStats>,
    recent: BTreeMap<PipelineKind, VecDeque<ProgressEvent>>,
}

struct Shared {
    state: Mutex<StatsState>,
    subscribers: Mutex<Vec<(SubscriptionId, Arc<dyn ProgressSubscriber>)>>,
    next_subscription: AtomicU64,
    recent_capacity: usize,
    created_at: Instant,
}

impl Shared {
    fn process(&self, event: ProgressEvent) {
        {
            let mut state = lock(&self.state);
            state
                .stats
                .entry(event.pipeline)
                .or_insert_with(|| PipelineStats::new(event.pipeline))
                .apply(&event);

            let recent = state.recent.entry(event.pipeline).or_default();
            recent.push_back(event.clone());
            while recent.len() > self.recent_capacity {
                recent.pop_front();
            }
        }

        // Copy the list so subscribers can (un)subscribe from inside a callback.
        let subscribers: Vec<Arc<dyn ProgressSubscriber>> = lock(&self.subscribers)
            .iter()
            .map(|(_, s)| Arc::clone(s))
            .collect();

        for subscriber in subscribers {
            let outcome = catch_unwind(AssertUnwindSafe(|| subscriber.on_event(&event)));
            if let Err(panic) = outcome {
                log::error!(
                    "progress-bus: subscriber panicked on {}: {}",
                    event.id,
                    panic_message(panic.as_ref())
                );
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

type EventReceiver = mpsc::UnboundedReceiver<ProgressEvent>;

enum Consumer {
    /// Not running; the receiver is parked here until the next `start`.
    Idle(EventReceiver),
    Running {
        handle: JoinHandle<EventReceiver>,
        cancel: CancellationToken,
        done: std_mpsc::Receiver<()>,
    },
    /// The consumer thread could not give the receiver back.
    Lost,
}

fn consume(
    mut rx: EventReceiver,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    done: std_mpsc::Sender<()>,
) -> EventReceiver {
    let runtime = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("progress-bus: failed to build consumer runtime: {e}");
            let _ = done.send(());
            return rx;
        }
    };

    runtime.block_on(async {
        loop {
            tokio::select! {
                biased;
                next = rx.recv() => match next {
                    Some(event) => shared.process(event),
                    None => break,
                },
                _ = cancel.cancelled() => {
                    while let Ok(event) = rx.try_recv() {
                        shared.process(event);
                    }
                    break;
                }
            }
        }
    });

    log::debug!("progress-bus: consumer exiting");
    let _ = done.send(());
    rx
}

// ---------------------------------------------------------------------------
// ProgressBus
// ---------------------------------------------------------------------------

struct BusInner {
    tx: mpsc::UnboundedSender<ProgressEvent>,
    consumer: Mutex<Consumer>,
    shared: Arc<Shared>,
    config: BusConfig,
}

impl Drop for BusInner {
    fn drop(&mut self) {
        if let Consumer::Running { cancel, .. } = &*lock(&self.consumer) {
            cancel.cancel();
        }
    }
}

/// Cloneable handle to one event bus.  All clones share the same queue,
/// stats and subscribers.
#[derive(Clone)]
pub struct ProgressBus {
    inner: Arc<BusInner>,
}

impl ProgressBus {
    /// Create a stopped bus with zeroed stats for every pipeline.
    pub fn new(config: BusConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = PipelineKind::ALL
            .iter()
            .map(|&kind| (kind, PipelineStats::new(kind)))
            .collect();
        let shared = Arc::new(Shared {
            state: Mutex::new(StatsState {
                stats,
                recent: BTreeMap::new(),
            }),
            subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            recent_capacity: config.recent_capacity,
            created_at: Instant::now(),
        });
        Self {
            inner: Arc::new(BusInner {
                tx,
                consumer: Mutex::new(Consumer::Idle(rx)),
                shared,
                config,
            }),
        }
    }

    /// Start the consumer thread.  Calling this while it runs does nothing.
    ///
    /// If an earlier [`stop`](Self::stop) timed out, this waits for that
    /// consumer to finish before starting a fresh one.
    pub fn start(&self) -> std::io::Result<()> {
        let mut consumer = lock(&self.inner.consumer);

        let rx = match std::mem::replace(&mut *consumer, Consumer::Lost) {
            Consumer::Idle(rx) => rx,
            Consumer::Running {
                handle,
                cancel,
                done,
            } => {
                if !cancel.is_cancelled() {
                    *consumer = Consumer::Running {
                        handle,
                        cancel,
                        done,
                    };
                    return Ok(());
                }
                match handle.join() {
                    Ok(rx) => rx,
                    Err(_) => {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            "previous progress-bus consumer panicked",
                        ))
                    }
                }
            }
            Consumer::Lost => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "progress-bus receiver is no longer available",
                ))
            }
        };

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = std_mpsc::channel();
        let shared = Arc::clone(&self.inner.shared);
        let thread_cancel = cancel.clone();

        let handle = std::thread::Builder::new()
            .name(CONSUMER_THREAD_NAME.into())
            .spawn(move || consume(rx, shared, thread_cancel, done_tx))?;

        log::debug!("progress-bus: consumer started");
        *consumer = Consumer::Running {
            handle,
            cancel,
            done: done_rx,
        };
        Ok(())
    }

    /// Signal shutdown and wait up to the configured timeout for the consumer
    /// to drain the queue.  Safe to call repeatedly or on a stopped bus.
    pub fn stop(&self) {
        let mut consumer = lock(&self.inner.consumer);
        if !matches!(&*consumer, Consumer::Running { .. }) {
            return;
        }
        let Consumer::Running {
            handle,
            cancel,
            done,
        } = std::mem::replace(&mut *consumer, Consumer::Lost)
        else {
            return;
        };

        cancel.cancel();
        match done.recv_timeout(self.inner.config.shutdown_timeout) {
            Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => match handle.join() {
                Ok(rx) => *consumer = Consumer::Idle(rx),
                Err(_) => {
                    log::error!("progress-bus: consumer thread panicked during shutdown");
                    *consumer = Consumer::Lost;
                }
            },
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                log::warn!(
                    "progress-bus: consumer did not finish within {:?}; leaving it to drain",
                    self.inner.config.shutdown_timeout
                );
                *consumer = Consumer::Running {
                    handle,
                    cancel,
                    done,
                };
            }
        }
    }

    /// Whether a consumer thread is running and has not been told to stop.
    pub fn is_running(&self) -> bool {
        matches!(
            &*lock(&self.inner.consumer),
            Consumer::Running { cancel, .. } if !cancel.is_cancelled()
        )
    }

    /// Queue an event.  Never blocks.  Events emitted before `start` are
    /// processed once the consumer runs.
    pub fn emit(&self, event: ProgressEvent) {
        if self.inner.tx.send(event).is_err() {
            log::debug!("progress-bus: receiver gone, event dropped");
        }
    }

    pub fn subscribe(&self, subscriber: Arc<dyn ProgressSubscriber>) -> SubscriptionId {
        let id = SubscriptionId(
            self.inner
                .shared
                .next_subscription
                .fetch_add(1, Ordering::Relaxed),
        );
        lock(&self.inner.shared.subscribers).push((id, subscriber));
        id
    }

    /// Remove a subscriber.  Returns `false` when the id was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = lock(&self.inner.shared.subscribers);
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    /// Snapshot of one pipeline's stats.
    pub fn stats(&self, pipeline: PipelineKind) -> PipelineStats {
        lock(&self.inner.shared.state)
            .stats
            .get(&pipeline)
            .cloned()
            .unwrap_or_else(|| PipelineStats::new(pipeline))
    }

    /// Up to `limit` recent events for `pipeline`, most recent first.
    pub fn recent_events(&self, pipeline: PipelineKind, limit: usize) -> Vec<ProgressEvent> {
        lock(&self.inner.shared.state)
            .recent
            .get(&pipeline)
            .map(|events| events.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Aggregate over the synthesis, description and extraction pipelines.
    pub fn overall_stats(&self) -> OverallStats {
        let state = lock(&self.inner.shared.state);
        OverallStats::aggregate(state.stats.values(), self.inner.shared.created_at)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
