//! Bus subscriber that forwards events to the `log` facade.

use super::bus::ProgressSubscriber;
use super::event::{EventPayload, ProgressEvent};

/// Writes every progress event as a log line.
///
/// Errors and warnings go to `warn`.  Batch-level starts (those carrying a
/// total) and item completions go to `info`; everything else to `debug`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSubscriber;

impl LogSubscriber {
    pub fn new() -> Self {
        Self
    }
}

impl ProgressSubscriber for LogSubscriber {
    fn on_event(&self, event: &ProgressEvent) {
        let pipeline = event.pipeline;
        match &event.payload {
            EventPayload::Start {
                total: Some(total),
                label,
            } => log::info!(
                "{pipeline}: started {total} item(s){}",
                suffix(label.as_deref())
            ),
            EventPayload::Start { total: None, label } => {
                log::debug!("{pipeline}: working{}", suffix(label.as_deref()))
            }
            EventPayload::Progress {
                completed, total, ..
            } => match total {
                Some(total) => log::debug!("{pipeline}: {completed}/{total}"),
                None => log::debug!("{pipeline}: {completed} done"),
            },
            EventPayload::Complete { item_id, label } => log::info!(
                "{pipeline}: completed {}",
                label.as_deref().or(item_id.as_deref()).unwrap_or("item")
            ),
            EventPayload::Error { message, label } => {
                log::warn!("{pipeline}: error{}: {message}", suffix(label.as_deref()))
            }
            EventPayload::Warning { message, label } => {
                log::warn!("{pipeline}: {message}{}", suffix(label.as_deref()))
            }
            EventPayload::Info { message } => log::info!("{pipeline}: {message}"),
        }
    }
}

fn suffix(label: Option<&str>) -> String {
    match label {
        Some(l) if !l.is_empty() => format!(" ({l})"),
        _ => String::new(),
    }
}
