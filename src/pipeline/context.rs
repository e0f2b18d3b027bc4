//! Per-run context handed to every stage instead of process-wide globals.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::progress::ProgressBus;

/// Config snapshot, progress bus and cancellation token for one run.
///
/// Cheap to clone; clones share the bus and the token.
#[derive(Clone)]
pub struct RunContext {
    pub config: Arc<AppConfig>,
    pub bus: ProgressBus,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(config: AppConfig, bus: ProgressBus) -> Self {
        Self {
            config: Arc::new(config),
            bus,
            cancel: CancellationToken::new(),
        }
    }

    /// Ask running batches to stop launching new items.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
