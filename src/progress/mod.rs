//! Progress reporting: the event model, per-pipeline stats and the event bus
//! that connects producers (batch workers, the orchestrator) to observers.

pub mod bus;
pub mod event;
pub mod log_subscriber;
pub mod stats;

pub use bus::{BusConfig, ProgressBus, ProgressSubscriber, SubscriptionId};
pub use event::{EventKind, EventPayload, PipelineKind, ProgressEvent};
pub use log_subscriber::LogSubscriber;
pub use stats::{OverallStats, PipelineStats};
