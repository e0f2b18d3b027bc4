//! Document extraction: turn an input file into plain text, chapters and
//! image references.
//!
//! [`DocumentExtractor`] is the seam the orchestrator depends on.
//! [`MarkdownExtractor`] is the built-in implementation for Markdown and
//! plain-text books.
//!
//! Each embedded image is replaced in the text by the placeholder
//! `[IMAGE: <file name>]`, which the description stage later resolves.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

/// Characters of surrounding text kept as context on each side of an image.
const CONTEXT_CHARS_EACH_SIDE: usize = 100;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("input file not found: {0}")]
    NotFound(PathBuf),

    #[error("unsupported input format: {0}")]
    Unsupported(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("document contains no text")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chapter {
    /// 1-based position in the book.
    pub number: usize,
    pub title: String,
    pub content: String,
    pub word_count: usize,
}

impl Chapter {
    pub fn new(number: usize, title: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            number,
            title: title.into(),
            word_count: count_words(&content),
            content,
        }
    }

    /// Replace the content and recompute the word count.
    pub fn set_content(&mut self, content: String) {
        self.word_count = count_words(&content);
        self.content = content;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageRef {
    pub path: PathBuf,
    /// Text around the image, used to guide the describer.
    pub context: String,
}

impl ImageRef {
    /// File name used in the text placeholder.
    pub fn name(&self) -> String {
        file_name(&self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionResult {
    pub text: String,
    pub chapters: Vec<Chapter>,
    pub metadata: BTreeMap<String, String>,
    pub images: Vec<ImageRef>,
}

impl ExtractionResult {
    pub fn word_count(&self) -> usize {
        self.chapters.iter().map(|c| c.word_count).sum()
    }

    pub fn title(&self) -> &str {
        self.metadata.get("title").map(String::as_str).unwrap_or("Untitled")
    }
}

pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

// ---------------------------------------------------------------------------
// DocumentExtractor trait
// ---------------------------------------------------------------------------

pub trait DocumentExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<ExtractionResult, ExtractionError>;
}

// Compile-time assertion: Box<dyn DocumentExtractor> must be constructible.
const _: fn() = || {
    fn _assert_object_safe(_: Box<dyn DocumentExtractor>) {}
};

// ---------------------------------------------------------------------------
// MarkdownExtractor
// ---------------------------------------------------------------------------

/// Reads UTF-8 Markdown (`.md`, `.markdown`) or plain text (`.txt`).
///
/// Chapters start at `#` and `##` headings.  A heading with no body (a book
/// title directly followed by the first chapter) does not become a chapter.
/// Without headings the whole text is a single "Chapter 1".
#[derive(Debug, Default, Clone)]
pub struct MarkdownExtractor;

impl MarkdownExtractor {
    pub const EXTENSIONS: [&'static str; 3] = ["md", "markdown", "txt"];

    pub fn new() -> Self {
        Self
    }

    /// Extract from in-memory text.  `source` names the document and anchors
    /// relative image paths.
    pub fn extract_str(&self, raw: &str, source: &Path) -> Result<ExtractionResult, ExtractionError> {
        let base_dir = source.parent().unwrap_or_else(|| Path::new(""));
        let (text, images) = replace_images(raw, base_dir);
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(ExtractionError::Empty);
        }

        let sections = split_sections(&text);
        let mut chapters: Vec<Chapter> = sections
            .iter()
            .filter(|(_, body)| !body.trim().is_empty())
            .enumerate()
            .map(|(i, (title, body))| {
                let title = title.clone().unwrap_or_else(|| "Introduction".into());
                Chapter::new(i + 1, title, body.trim())
            })
            .collect();
        if chapters.is_empty() {
            chapters.push(Chapter::new(1, "Chapter 1", text.as_str()));
        } else if chapters.len() == 1 && sections.iter().all(|(t, _)| t.is_none()) {
            chapters[0].title = "Chapter 1".into();
        }

        let mut metadata = BTreeMap::new();
        let title = sections_iter(&text)
            .find_map(|line| match line {
                Line::Heading(1, t) => Some(t.to_string()),
                _ => None,
            })
            .or_else(|| {
                source
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "Untitled".into());
        metadata.insert("title".into(), title);
        metadata.insert("source".into(), source.display().to_string());
        let format = match extension(source).as_deref() {
            Some("txt") => "text",
            _ => "markdown",
        };
        metadata.insert("format".into(), format.into());

        Ok(ExtractionResult {
            text,
            chapters,
            metadata,
            images,
        })
    }
}

impl DocumentExtractor for MarkdownExtractor {
    fn extract(&self, path: &Path) -> Result<ExtractionResult, ExtractionError> {
        if !path.exists() {
            return Err(ExtractionError::NotFound(path.to_path_buf()));
        }
        match extension(path) {
            Some(ext) if Self::EXTENSIONS.contains(&ext.as_str()) => {}
            other => {
                return Err(ExtractionError::Unsupported(
                    other.unwrap_or_else(|| "(no extension)".into()),
                ))
            }
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ExtractionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let result = self.extract_str(&raw, path)?;
        log::info!(
            "extract: {} chapter(s), {} image(s), {} words from {}",
            result.chapters.len(),
            result.images.len(),
            result.word_count(),
            path.display()
        );
        Ok(result)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn image_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"!\[([^\]]*)\]\(\s*<?([^)\s>]+)>?(?:\s+"[^"]*")?\s*\)"#).expect("static regex")
    })
}

fn heading_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(#{1,2})\s+(.+?)\s*#*\s*$").expect("static regex"))
}

/// Swap every Markdown image for its placeholder and collect references.
fn replace_images(raw: &str, base_dir: &Path) -> (String, Vec<ImageRef>) {
    let mut out = String::with_capacity(raw.len());
    let mut spans = Vec::new();
    let mut last = 0;

    for caps in image_pattern().captures_iter(raw) {
        let (Some(whole), Some(target)) = (caps.get(0), caps.get(2)) else {
            continue;
        };
        out.push_str(&raw[last..whole.start()]);
        let path = base_dir.join(target.as_str());
        let name = file_name(&path);
        let start = out.len();
        out.push_str(&format!("[IMAGE: {name}]"));
        spans.push((path, start, out.len()));
        last = whole.end();
    }
    out.push_str(&raw[last..]);

    let images = spans
        .into_iter()
        .map(|(path, start, end)| ImageRef {
            path,
            context: surrounding_text(&out, start, end),
        })
        .collect();
    (out, images)
}

fn surrounding_text(text: &str, start: usize, end: usize) -> String {
    let before: String = {
        let mut chars: Vec<char> = text[..start]
            .chars()
            .rev()
            .take(CONTEXT_CHARS_EACH_SIDE)
            .collect();
        chars.reverse();
        chars.into_iter().collect()
    };
    let after: String = text[end..].chars().take(CONTEXT_CHARS_EACH_SIDE).collect();
    let joined = format!("{before} {after}");
    joined.split_whitespace().collect::<Vec<_>>().join(" ")
}

enum Line<'a> {
    Heading(usize, &'a str),
    Text(&'a str),
}

fn sections_iter(text: &str) -> impl Iterator<Item = Line<'_>> {
    let mut in_fence = false;
    text.lines().map(move |line| {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            return Line::Text(line);
        }
        if !in_fence {
            if let Some(caps) = heading_pattern().captures(line) {
                if let (Some(hashes), Some(title)) = (caps.get(1), caps.get(2)) {
                    return Line::Heading(hashes.as_str().len(), title.as_str());
                }
            }
        }
        Line::Text(line)
    })
}

/// Split into `(heading, body)` pairs.  Text before the first heading gets
/// `None` as its heading.
fn split_sections(text: &str) -> Vec<(Option<String>, String)> {
    let mut sections: Vec<(Option<String>, String)> = vec![(None, String::new())];
    for line in sections_iter(text) {
        match line {
            Line::Heading(_, title) => sections.push((Some(title.to_string()), String::new())),
            Line::Text(line) => {
                if let Some((_, body)) = sections.last_mut() {
                    body.push_str(line);
                    body.push('\n');
                }
            }
        }
    }
    sections
}

// ---------------------------------------------------------------------------
// StaticExtractor (test only)
// ---------------------------------------------------------------------------

/// Test double returning a canned result or a canned failure.
#[cfg(test)]
pub struct StaticExtractor {
    result: Option<ExtractionResult>,
}

#[cfg(test)]
impl StaticExtractor {
    pub fn ok(result: ExtractionResult) -> Self {
        Self {
            result: Some(result),
        }
    }

    pub fn failing() -> Self {
        Self { result: None }
    }
}

#[cfg(test)]
impl DocumentExtractor for StaticExtractor {
    fn extract(&self, path: &Path) -> Result<ExtractionResult, ExtractionError> {
        self.result
            .clone()
            .ok_or_else(|| ExtractionError::NotFound(path.to_path_buf()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
