//! Progress event model shared by every producer and subscriber.
//!
//! A [`ProgressEvent`] is an immutable value.  Its [`EventPayload`] is a
//! tagged union: each variant carries only the fields that kind of event
//! actually uses, so the bus never has to dig through an untyped bag.  Open-ended
//! per-pipeline numbers travel in `custom_counters`.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// PipelineKind
// ---------------------------------------------------------------------------

/// Logical pipeline an event or a stats record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    /// Text-to-speech synthesis of chapter text.
    Synthesis,
    /// Image description (captioning).
    Description,
    /// Document extraction.
    Extraction,
    /// Run-level bookkeeping; excluded from aggregate counts.
    Overall,
}

impl PipelineKind {
    /// Every pipeline kind, in a stable order.
    pub const ALL: [PipelineKind; 4] = [
        PipelineKind::Synthesis,
        PipelineKind::Description,
        PipelineKind::Extraction,
        PipelineKind::Overall,
    ];

    /// The kinds that represent real work (everything except `Overall`).
    pub const WORK: [PipelineKind; 3] = [
        PipelineKind::Synthesis,
        PipelineKind::Description,
        PipelineKind::Extraction,
    ];

    /// Short lowercase label used in event ids and log lines.
    pub fn label(&self) -> &'static str {
        match self {
            PipelineKind::Synthesis => "synthesis",
            PipelineKind::Description => "description",
            PipelineKind::Extraction => "extraction",
            PipelineKind::Overall => "overall",
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// EventKind
// ---------------------------------------------------------------------------

/// Discriminant of an [`EventPayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Start,
    Progress,
    Complete,
    Error,
    Info,
    Warning,
}

impl EventKind {
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::Progress => "progress",
            EventKind::Complete => "complete",
            EventKind::Error => "error",
            EventKind::Info => "info",
            EventKind::Warning => "warning",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// EventPayload
// ---------------------------------------------------------------------------

/// Kind-specific data carried by a [`ProgressEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    /// Work started.  `total` (if present) revises the pipeline's item count
    /// without resetting progress; `label` names the current item.
    Start {
        total: Option<u64>,
        label: Option<String>,
    },
    /// Absolute progress report.
    Progress {
        completed: u64,
        total: Option<u64>,
        label: Option<String>,
    },
    /// One unit of work finished.  When `item_id` is set the bus counts the
    /// completion at most once per item.
    Complete {
        item_id: Option<String>,
        label: Option<String>,
    },
    /// A unit of work failed.
    Error {
        message: String,
        label: Option<String>,
    },
    /// Informational note; no counters change.
    Info { message: String },
    /// Something degraded but work continues.
    Warning {
        message: String,
        label: Option<String>,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Start { .. } => EventKind::Start,
            EventPayload::Progress { .. } => EventKind::Progress,
            EventPayload::Complete { .. } => EventKind::Complete,
            EventPayload::Error { .. } => EventKind::Error,
            EventPayload::Info { .. } => EventKind::Info,
            EventPayload::Warning { .. } => EventKind::Warning,
        }
    }

    /// The item label carried by this payload, if any.
    pub fn label(&self) -> Option<&str> {
        match self {
            EventPayload::Start { label, .. }
            | EventPayload::Progress { label, .. }
            | EventPayload::Complete { label, .. }
            | EventPayload::Error { label, .. }
            | EventPayload::Warning { label, .. } => label.as_deref(),
            EventPayload::Info { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ProgressEvent
// ---------------------------------------------------------------------------

/// An immutable progress notification.
///
/// Build one with the kind-specific constructors:
///
/// ```rust
/// use narrator::progress::{EventKind, PipelineKind, ProgressEvent};
///
/// let ev = ProgressEvent::start(PipelineKind::Synthesis, Some(12), Some("Chapter 1"))
///     .with_counter("chunks", 30);
/// assert_eq!(ev.kind(), EventKind::Start);
/// assert!(ev.id.starts_with("synthesis_start_"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub pipeline: PipelineKind,
    pub payload: EventPayload,
    /// Counters merged into the pipeline stats, last write wins per key.
    pub custom_counters: BTreeMap<String, i64>,
    pub timestamp: SystemTime,
    /// `"{pipeline}_{kind}_{unix_millis}"`, derived from the fields above.
    pub id: String,
}

impl ProgressEvent {
    /// Create an event stamped with the current wall-clock time.
    pub fn new(pipeline: PipelineKind, payload: EventPayload) -> Self {
        Self::at(pipeline, payload, SystemTime::now())
    }

    /// Create an event with an explicit timestamp.
    pub fn at(pipeline: PipelineKind, payload: EventPayload, timestamp: SystemTime) -> Self {
        let id = event_id(pipeline, payload.kind(), timestamp);
        Self {
            pipeline,
            payload,
            custom_counters: BTreeMap::new(),
            timestamp,
            id,
        }
    }

    pub fn start(pipeline: PipelineKind, total: Option<u64>, label: Option<&str>) -> Self {
        Self::new(
            pipeline,
            EventPayload::Start {
                total,
                label: label.map(str::to_owned),
            },
        )
    }

    pub fn progress(
        pipeline: PipelineKind,
        completed: u64,
        total: Option<u64>,
        label: Option<&str>,
    ) -> Self {
        Self::new(
            pipeline,
            EventPayload::Progress {
                completed,
                total,
                label: label.map(str::to_owned),
            },
        )
    }

    pub fn complete(pipeline: PipelineKind, item_id: Option<&str>, label: Option<&str>) -> Self {
        Self::new(
            pipeline,
            EventPayload::Complete {
                item_id: item_id.map(str::to_owned),
                label: label.map(str::to_owned),
            },
        )
    }

    pub fn error(pipeline: PipelineKind, message: impl Into<String>, label: Option<&str>) -> Self {
        Self::new(
            pipeline,
            EventPayload::Error {
                message: message.into(),
                label: label.map(str::to_owned),
            },
        )
    }

    pub fn info(pipeline: PipelineKind, message: impl Into<String>) -> Self {
        Self::new(
            pipeline,
            EventPayload::Info {
                message: message.into(),
            },
        )
    }

    pub fn warning(
        pipeline: PipelineKind,
        message: impl Into<String>,
        label: Option<&str>,
    ) -> Self {
        Self::new(
            pipeline,
            EventPayload::Warning {
                message: message.into(),
                label: label.map(str::to_owned),
            },
        )
    }

    /// Attach a custom counter (builder style).
    pub fn with_counter(mut self, key: impl Into<String>, value: i64) -> Self {
        self.custom_counters.insert(key.into(), value);
        self
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

fn event_id(pipeline: PipelineKind, kind: EventKind, timestamp: SystemTime) -> String {
    let millis = timestamp
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("{}_{}_{}", pipeline.label(), kind.label(), millis)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn id_is_deterministic_for_same_inputs() {
        let ts = UNIX_EPOCH + Duration::from_millis(1_700_000_000_123);
        let payload = EventPayload::Info {
            message: "x".into(),
        };
        let a = ProgressEvent::at(PipelineKind::Description, payload.clone(), ts);
        let b = ProgressEvent::at(PipelineKind::Description, payload, ts);
        assert_eq!(a.id, b.id);
        assert_eq!(a.id, "description_info_1700000000123");
    }

    #[test]
    fn id_differs_by_kind() {
        let ts = UNIX_EPOCH + Duration::from_millis(42);
        let a = ProgressEvent::at(
            PipelineKind::Synthesis,
            EventPayload::Info { message: "".into() },
            ts,
        );
        let b = ProgressEvent::at(
            PipelineKind::Synthesis,
            EventPayload::Warning {
                message: "".into(),
                label: None,
            },
            ts,
        );
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn kind_follows_payload() {
        assert_eq!(
            ProgressEvent::complete(PipelineKind::Synthesis, Some("a"), None).kind(),
            EventKind::Complete
        );
        assert_eq!(
            ProgressEvent::error(PipelineKind::Synthesis, "boom", None).kind(),
            EventKind::Error
        );
        assert_eq!(
            ProgressEvent::progress(PipelineKind::Synthesis, 1, None, None).kind(),
            EventKind::Progress
        );
    }

    #[test]
    fn label_is_exposed_for_labelled_payloads() {
        let ev = ProgressEvent::start(PipelineKind::Synthesis, None, Some("Chapter 2"));
        assert_eq!(ev.payload.label(), Some("Chapter 2"));
        let info = ProgressEvent::info(PipelineKind::Overall, "hello");
        assert_eq!(info.payload.label(), None);
    }

    #[test]
    fn with_counter_overwrites_same_key() {
        let ev = ProgressEvent::info(PipelineKind::Overall, "x")
            .with_counter("retries", 1)
            .with_counter("retries", 3);
        assert_eq!(ev.custom_counters.get("retries"), Some(&3));
    }

    #[test]
    fn work_kinds_exclude_overall() {
        assert!(!PipelineKind::WORK.contains(&PipelineKind::Overall));
        assert_eq!(PipelineKind::ALL.len(), PipelineKind::WORK.len() + 1);
    }
}
