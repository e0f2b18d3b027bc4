//! Splice image descriptions into the extracted text.
//!
//! A caption replaces the image's placeholder with
//! `[IMAGE DESCRIPTION: <caption>]`.  Captions below the confidence floor
//! are skipped and their placeholders stay as they are.

use crate::describe::ImageDescription;
use crate::extract::ExtractionResult;

/// Placeholder spellings searched in the full text.  Chapters only carry the
/// first two.
fn placeholders(name: &str) -> [String; 4] {
    [
        format!("[IMAGE: Image of {name}]"),
        format!("[IMAGE: {name}]"),
        format!("![{name}]"),
        format!("![Image of {name}]"),
    ]
}

const CHAPTER_PLACEHOLDERS: usize = 2;

/// Replace placeholders for every `(image name, description)` pair whose
/// confidence is at least `min_confidence`.  Chapter word counts are
/// recomputed.  Returns the names of the images that were integrated.
pub fn integrate_descriptions(
    extraction: &mut ExtractionResult,
    descriptions: &[(String, ImageDescription)],
    min_confidence: f32,
) -> Vec<String> {
    let mut integrated = Vec::new();

    for (name, description) in descriptions {
        if description.confidence < min_confidence {
            log::debug!(
                "integrate: skipping {name} (confidence {:.2} < {min_confidence:.2})",
                description.confidence
            );
            continue;
        }
        let replacement = format!("[IMAGE DESCRIPTION: {}]", description.text);
        let patterns = placeholders(name);

        let mut found = false;
        for pattern in &patterns {
            found |= replace_in(&mut extraction.text, pattern, &replacement);
        }
        for chapter in &mut extraction.chapters {
            let mut content = chapter.content.clone();
            let mut changed = false;
            for pattern in &patterns[..CHAPTER_PLACEHOLDERS] {
                changed |= replace_in(&mut content, pattern, &replacement);
            }
            if changed {
                chapter.set_content(content);
                found = true;
            }
        }

        if found {
            integrated.push(name.clone());
        } else {
            log::warn!("integrate: no placeholder found for {name}");
        }
    }

    integrated
}

fn replace_in(text: &mut String, pattern: &str, replacement: &str) -> bool {
    if !text.contains(pattern) {
        return false;
    }
    *text = text.replace(pattern, replacement);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::Chapter;

    fn extraction(text: &str) -> ExtractionResult {
        ExtractionResult {
            text: text.to_string(),
            chapters: vec![Chapter::new(1, "One", text)],
            metadata: Default::default(),
            images: Vec::new(),
        }
    }

    fn caption(text: &str, confidence: f32) -> ImageDescription {
        ImageDescription {
            text: text.into(),
            confidence,
            model: "mock".into(),
        }
    }

    #[test]
    fn confident_caption_replaces_placeholder_everywhere() {
        let mut ex = extraction("Look. [IMAGE: boat.png] Then sail.");
        let done = integrate_descriptions(
            &mut ex,
            &[("boat.png".into(), caption("A small red boat.", 0.9))],
            0.5,
        );
        assert_eq!(done, vec!["boat.png".to_string()]);
        let expected = "Look. [IMAGE DESCRIPTION: A small red boat.] Then sail.";
        assert_eq!(ex.text, expected);
        assert_eq!(ex.chapters[0].content, expected);
        assert_eq!(ex.chapters[0].word_count, 9);
    }

    #[test]
    fn low_confidence_leaves_placeholder() {
        let mut ex = extraction("[IMAGE: fog.png]");
        let done =
            integrate_descriptions(&mut ex, &[("fog.png".into(), caption("Fog.", 0.3))], 0.5);
        assert!(done.is_empty());
        assert_eq!(ex.text, "[IMAGE: fog.png]");
    }

    #[test]
    fn confidence_at_floor_is_accepted() {
        let mut ex = extraction("[IMAGE: map.png]");
        let done =
            integrate_descriptions(&mut ex, &[("map.png".into(), caption("A map.", 0.5))], 0.5);
        assert_eq!(done.len(), 1);
    }

    #[test]
    fn markdown_style_placeholders_only_in_full_text() {
        let mut ex = extraction("![Image of cat.png]");
        integrate_descriptions(&mut ex, &[("cat.png".into(), caption("A cat.", 0.8))], 0.5);
        assert_eq!(ex.text, "[IMAGE DESCRIPTION: A cat.]");
        assert_eq!(ex.chapters[0].content, "![Image of cat.png]");
    }
}
