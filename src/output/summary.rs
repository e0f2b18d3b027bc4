//! Machine-readable record of a run, written as `run_summary.json` and
//! rendered into the plain-text report.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::{AppConfig, SynthesisEngine};
use crate::extract::Chapter;
use crate::synth::DegradationLevel;

/// Narration speed used for duration estimates.
pub const WORDS_PER_MINUTE: f64 = 150.0;

/// Captions above this confidence count as high confidence in the report.
const HIGH_CONFIDENCE: f32 = 0.7;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub title: String,
    pub metadata: BTreeMap<String, String>,
    pub chapters: Vec<ChapterSummary>,
    pub total_words: usize,
    pub total_characters: usize,
    pub images: Option<ImageSummary>,
    pub synthesis: Option<SynthesisSummary>,
    pub config: ConfigSnapshot,
    /// Seconds per stage, keyed by stage name.
    pub stage_timings: BTreeMap<String, f64>,
    /// Unix seconds.
    pub generated_at: u64,
}

/// The settings a run was made with.  Credentials and endpoints are left
/// out.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConfigSnapshot {
    pub engine: SynthesisEngine,
    pub model: String,
    pub voice: String,
    pub speed: f32,
    pub parallel: bool,
    pub max_workers: usize,
    pub max_retries: u32,
    pub failure_threshold: u32,
    pub max_chunk_chars: usize,
    pub describe_images: bool,
    pub description_model: String,
    pub min_confidence: f32,
    pub merge_audio: bool,
}

impl From<&AppConfig> for ConfigSnapshot {
    fn from(config: &AppConfig) -> Self {
        let s = &config.synthesis;
        let d = &config.description;
        Self {
            engine: s.engine,
            model: s.model.clone(),
            voice: s.voice.clone(),
            speed: s.speed,
            parallel: s.parallel,
            max_workers: s.max_workers,
            max_retries: s.max_retries,
            failure_threshold: s.failure_threshold,
            max_chunk_chars: s.max_chunk_chars,
            describe_images: d.enabled,
            description_model: d.model.clone(),
            min_confidence: d.min_confidence,
            merge_audio: config.output.merge_audio,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChapterSummary {
    pub number: usize,
    pub title: String,
    pub word_count: usize,
    pub estimated_minutes: f64,
}

impl From<&Chapter> for ChapterSummary {
    fn from(chapter: &Chapter) -> Self {
        Self {
            number: chapter.number,
            title: chapter.title.clone(),
            word_count: chapter.word_count,
            estimated_minutes: chapter.word_count as f64 / WORDS_PER_MINUTE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageEntry {
    pub image: String,
    pub description: Option<String>,
    pub confidence: Option<f32>,
    pub model: Option<String>,
    pub integrated: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageSummary {
    pub total: usize,
    pub described: usize,
    pub integrated: usize,
    pub high_confidence: usize,
    pub average_confidence: f64,
    pub entries: Vec<ImageEntry>,
    pub error_message: Option<String>,
}

impl ImageSummary {
    pub fn from_entries(entries: Vec<ImageEntry>, error_message: Option<String>) -> Self {
        let confidences: Vec<f32> = entries.iter().filter_map(|e| e.confidence).collect();
        let average_confidence = if confidences.is_empty() {
            0.0
        } else {
            confidences.iter().map(|&c| f64::from(c)).sum::<f64>() / confidences.len() as f64
        };
        Self {
            total: entries.len(),
            described: confidences.len(),
            integrated: entries.iter().filter(|e| e.integrated).count(),
            high_confidence: confidences.iter().filter(|&&c| c > HIGH_CONFIDENCE).count(),
            average_confidence,
            entries,
            error_message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedItem {
    pub item_id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SynthesisSummary {
    pub total_items: usize,
    pub succeeded: usize,
    pub failed: Vec<FailedItem>,
    pub audio_files: Vec<String>,
    pub merged_file: Option<String>,
    pub final_level: Option<DegradationLevel>,
    pub error_message: Option<String>,
}

impl RunSummary {
    pub fn estimated_minutes(&self) -> f64 {
        self.total_words as f64 / WORDS_PER_MINUTE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, confidence: Option<f32>, integrated: bool) -> ImageEntry {
        ImageEntry {
            image: name.into(),
            description: confidence.map(|_| format!("A picture of {name}.")),
            confidence,
            model: confidence.map(|_| "mock".into()),
            integrated,
            error: confidence.is_none().then(|| "timed out".into()),
        }
    }

    #[test]
    fn image_summary_counts_only_described_images() {
        let summary = ImageSummary::from_entries(
            vec![
                entry("a.png", Some(0.9), true),
                entry("b.png", Some(0.4), false),
                entry("c.png", None, false),
            ],
            None,
        );
        assert_eq!(summary.total, 3);
        assert_eq!(summary.described, 2);
        assert_eq!(summary.integrated, 1);
        assert_eq!(summary.high_confidence, 1);
        assert!((summary.average_confidence - 0.65).abs() < 1e-6);
    }

    #[test]
    fn chapter_duration_uses_narration_speed() {
        let chapter = Chapter::new(1, "One", vec!["word"; 300].join(" "));
        let summary = ChapterSummary::from(&chapter);
        assert_eq!(summary.word_count, 300);
        assert!((summary.estimated_minutes - 2.0).abs() < 1e-9);
    }

    #[test]
    fn serialises_level_in_snake_case() {
        let summary = RunSummary {
            synthesis: Some(SynthesisSummary {
                total_items: 1,
                succeeded: 1,
                failed: Vec::new(),
                audio_files: vec!["chapters/chapter_001_One.wav".into()],
                merged_file: None,
                final_level: Some(DegradationLevel::SafeFallback),
                error_message: None,
            }),
            ..RunSummary::default()
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["synthesis"]["final_level"], "safe_fallback");
    }

    #[test]
    fn config_snapshot_leaves_out_credentials() {
        let mut config = AppConfig::default();
        config.synthesis.api_key = "sk-speech".into();
        config.description.api_key = "sk-vision".into();
        config.synthesis.voice = "nova".into();

        let summary = RunSummary {
            config: ConfigSnapshot::from(&config),
            ..RunSummary::default()
        };
        let json = serde_json::to_string(&summary).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["config"]["voice"], "nova");
        assert_eq!(value["config"]["engine"], "tone");
        assert_eq!(value["config"]["description_model"], "gemma-3n-e4b");
        assert!(!json.contains("sk-speech") && !json.contains("sk-vision"));
        assert!(!json.contains("api_key"));
    }
}
