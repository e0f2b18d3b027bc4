//! Batch execution of independent work items with progress reporting.

pub mod runner;

pub use runner::{BatchItem, BatchItemResult, BatchRunner, ExecutionMode, MAX_WORKERS};
