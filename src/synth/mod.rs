//! Speech synthesis: the backend trait and its implementations, the
//! degrading wrapper that survives hardware faults, and text preparation.
//!
//! ```text
//! chapter text ─▶ prepare_for_speech ─▶ chunk_text ─▶ DegradingBackend
//!                                                        ├─ Primary      (create_backend)
//!                                                        ├─ SafeFallback (create_backend)
//!                                                        └─ Unavailable
//! ```

pub mod api;
pub mod backend;
pub mod degrading;
pub mod text;
pub mod tone;

pub use api::SpeechApiBackend;
pub use backend::{
    config_factory, create_backend, BackendFactory, BackendVariant, FaultSignatures,
    SynthesisBackend, SynthesisError,
};
pub use degrading::{DegradationLevel, DegradingBackend, RetryPolicy};
pub use text::{chunk_text, prepare_for_speech, sanitize_title};
pub use tone::ToneBackend;

#[cfg(test)]
pub use backend::ScriptedBackend;
