//! Pipeline module: turns one document into narrated audio plus a text
//! rendition with image descriptions spliced in.
//!
//! # Architecture
//!
//! ```text
//! document
//!    │
//!    ▼
//! DocumentExtractor ──▶ ExtractionResult
//!    │                     │
//!    │          ┌──────────┴──────────┐
//!    │          ▼                     ▼
//!    │   ImageDescriber batch   DegradingBackend batch
//!    │          │                     │  (chapters/*.wav, audiobook.wav)
//!    │          └──────────┬──────────┘
//!    │                     ▼
//!    │          integrate_descriptions
//!    │                     ▼
//!    └──────────────▶ OutputSink (book.txt, run_summary.json, report)
//!
//! every stage ──emit──▶ ProgressBus
//! ```
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use narrator::config::AppConfig;
//! use narrator::output::DirectorySink;
//! use narrator::pipeline::{Orchestrator, RunContext, RunOptions};
//! use narrator::progress::{BusConfig, ProgressBus};
//!
//! #[tokio::main]
//! async fn main() {
//!     let bus = ProgressBus::new(BusConfig::default());
//!     bus.start().unwrap();
//!     let ctx = RunContext::new(AppConfig::default(), bus.clone());
//!     let orchestrator = Orchestrator::from_config(ctx);
//!     let sink = Arc::new(DirectorySink::new("out"));
//!     let result = orchestrator
//!         .run_complete(Path::new("book.md"), sink, RunOptions::default())
//!         .await;
//!     println!("success: {}", result.success);
//!     bus.stop();
//! }
//! ```

pub mod context;
pub mod integrate;
pub mod orchestrator;

pub use context::RunContext;
pub use integrate::integrate_descriptions;
pub use orchestrator::{
    DescriptionOutcome, Orchestrator, PipelineResult, RunOptions, SynthesisOutcome, STAGES,
};
