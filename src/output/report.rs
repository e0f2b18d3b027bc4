//! Plain-text `processing_report.txt`.

use std::fmt::{self, Write};

use super::RunSummary;

const RULE_WIDTH: usize = 40;

/// Render the human-readable report for a run.
pub fn render_report(summary: &RunSummary) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = write_report(&mut out, summary);
    out
}

fn write_report(out: &mut String, s: &RunSummary) -> fmt::Result {
    writeln!(out, "Narration Processing Report")?;
    writeln!(out, "{}", "=".repeat(RULE_WIDTH))?;
    writeln!(out)?;

    writeln!(out, "Book Information:")?;
    writeln!(out, "  Title: {}", s.title)?;
    for (key, value) in s.metadata.iter().filter(|(k, v)| *k != "title" && !v.is_empty()) {
        writeln!(out, "  {}: {value}", capitalize(key))?;
    }
    writeln!(out)?;

    writeln!(out, "Text Processing:")?;
    writeln!(out, "  Chapters extracted: {}", s.chapters.len())?;
    writeln!(out, "  Total text length: {} characters", s.total_characters)?;
    writeln!(out, "  Total word count: {} words", s.total_words)?;
    writeln!(out, "  Estimated duration: {:.1} min", s.estimated_minutes())?;
    writeln!(out)?;

    writeln!(out, "Chapters:")?;
    for chapter in &s.chapters {
        writeln!(out, "  {}. {}", chapter.number, chapter.title)?;
        writeln!(
            out,
            "     Words: {}, Duration: {:.1} min",
            chapter.word_count, chapter.estimated_minutes
        )?;
    }
    writeln!(out)?;

    if let Some(images) = &s.images {
        writeln!(out, "Image Processing:")?;
        writeln!(out, "  Images found: {}", images.total)?;
        writeln!(out, "  Images described: {}", images.described)?;
        writeln!(out, "  Descriptions integrated: {}", images.integrated)?;
        writeln!(out, "  High confidence descriptions: {}", images.high_confidence)?;
        writeln!(out, "  Average confidence: {:.2}", images.average_confidence)?;
        for entry in images.entries.iter().filter(|e| e.error.is_some()) {
            writeln!(
                out,
                "  Failed: {} ({})",
                entry.image,
                entry.error.as_deref().unwrap_or_default()
            )?;
        }
        if let Some(err) = &images.error_message {
            writeln!(out, "  Error: {err}")?;
        }
        writeln!(out)?;
    }

    if let Some(synth) = &s.synthesis {
        writeln!(out, "Audio Generation:")?;
        writeln!(out, "  Items processed: {}/{}", synth.succeeded, synth.total_items)?;
        for failed in &synth.failed {
            writeln!(out, "  Failed: {} ({})", failed.item_id, failed.error)?;
        }
        if let Some(merged) = &synth.merged_file {
            writeln!(out, "  Merged audiobook: {merged}")?;
        }
        if let Some(level) = synth.final_level {
            writeln!(out, "  Final backend level: {level}")?;
        }
        if let Some(err) = &synth.error_message {
            writeln!(out, "  Error: {err}")?;
        }
        writeln!(out)?;
    }

    let c = &s.config;
    writeln!(out, "Configuration:")?;
    writeln!(
        out,
        "  Synthesis: {} engine, model {}, voice {}, speed {:.2}",
        c.engine.as_str(),
        c.model,
        c.voice,
        c.speed
    )?;
    writeln!(
        out,
        "  Workers: {} ({}), retries {}, fault threshold {}",
        c.max_workers,
        if c.parallel { "parallel" } else { "sequential" },
        c.max_retries,
        c.failure_threshold
    )?;
    if c.describe_images {
        writeln!(
            out,
            "  Descriptions: model {}, min confidence {:.2}",
            c.description_model, c.min_confidence
        )?;
    } else {
        writeln!(out, "  Descriptions: disabled")?;
    }
    writeln!(out, "  Merge audio: {}", if c.merge_audio { "yes" } else { "no" })?;
    writeln!(out)?;

    if !s.stage_timings.is_empty() {
        writeln!(out, "Timings:")?;
        for (stage, secs) in &s.stage_timings {
            writeln!(out, "  {stage}: {secs:.2}s")?;
        }
        writeln!(out)?;
    }

    writeln!(out, "Processing completed.")
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::output::{
        ChapterSummary, ConfigSnapshot, FailedItem, ImageEntry, ImageSummary, SynthesisSummary,
    };
    use crate::synth::DegradationLevel;

    fn summary() -> RunSummary {
        RunSummary {
            title: "Sea Stories".into(),
            metadata: [
                ("title".to_string(), "Sea Stories".to_string()),
                ("source".to_string(), "book.md".to_string()),
            ]
            .into(),
            chapters: vec![ChapterSummary {
                number: 1,
                title: "Harbour".into(),
                word_count: 300,
                estimated_minutes: 2.0,
            }],
            total_words: 300,
            total_characters: 1800,
            images: Some(ImageSummary::from_entries(
                vec![ImageEntry {
                    image: "boat.png".into(),
                    description: Some("A boat.".into()),
                    confidence: Some(0.9),
                    model: Some("mock".into()),
                    integrated: true,
                    error: None,
                }],
                None,
            )),
            synthesis: Some(SynthesisSummary {
                total_items: 2,
                succeeded: 1,
                failed: vec![FailedItem {
                    item_id: "ch002".into(),
                    error: "voice rejected".into(),
                }],
                audio_files: vec!["chapters/chapter_001_Harbour.wav".into()],
                merged_file: Some("audiobook.wav".into()),
                final_level: Some(DegradationLevel::Primary),
                error_message: None,
            }),
            config: ConfigSnapshot::from(&AppConfig::default()),
            ..RunSummary::default()
        }
    }

    #[test]
    fn report_covers_every_section() {
        let report = render_report(&summary());
        for needle in [
            "Title: Sea Stories",
            "Source: book.md",
            "1. Harbour",
            "Words: 300, Duration: 2.0 min",
            "High confidence descriptions: 1",
            "Average confidence: 0.90",
            "Items processed: 1/2",
            "Failed: ch002 (voice rejected)",
            "Merged audiobook: audiobook.wav",
            "Final backend level: primary",
            "Synthesis: tone engine, model tts-1, voice alloy, speed 1.00",
            "Workers: 2 (parallel), retries 3, fault threshold 2",
            "Descriptions: model gemma-3n-e4b, min confidence 0.50",
            "Merge audio: yes",
        ] {
            assert!(report.contains(needle), "missing {needle:?} in\n{report}");
        }
    }

    #[test]
    fn skipped_sections_are_omitted() {
        let report = render_report(&RunSummary {
            title: "Plain".into(),
            ..RunSummary::default()
        });
        assert!(!report.contains("Image Processing"));
        assert!(!report.contains("Audio Generation"));
        assert!(report.ends_with("Processing completed.\n"));
    }
}
