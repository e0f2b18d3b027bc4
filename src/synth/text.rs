//! Text preparation for speech: markup removal and chunking.
//!
//! Cleaned chapter text may carry bracketed markers (`[PAUSE: 1.5]`,
//! `[EMPHASIS_STRONG: ...]`, `[DIALOGUE_START]`, `[CHAPTER_START: ...]`,
//! `[IMAGE: ...]`).  A plain speech endpoint would read them aloud, so
//! [`prepare_for_speech`] rewrites them as speakable text.

use std::sync::OnceLock;

use regex::Regex;

struct Patterns {
    pause: Regex,
    emphasis: Regex,
    dialogue: Regex,
    chapter: Regex,
    image: Regex,
    whitespace: Regex,
    sentence_end: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        pause: Regex::new(r"\[PAUSE:\s*[\d.]+\]").expect("static regex"),
        emphasis: Regex::new(r"\[EMPHASIS_(?:STRONG|MILD):\s*([^\]]+)\]").expect("static regex"),
        dialogue: Regex::new(r"\[DIALOGUE_(?:START|END)\]").expect("static regex"),
        chapter: Regex::new(r"\[CHAPTER_START:\s*([^\]]+)\]").expect("static regex"),
        image: Regex::new(r"\[IMAGE(?: DESCRIPTION)?:\s*([^\]]+)\]").expect("static regex"),
        whitespace: Regex::new(r"\s+").expect("static regex"),
        sentence_end: Regex::new(r"[.!?]\s+").expect("static regex"),
    })
}

/// Rewrite markup as plain speakable text and collapse whitespace.
pub fn prepare_for_speech(text: &str) -> String {
    let p = patterns();
    let out = p.pause.replace_all(text, " ... ");
    let out = p.emphasis.replace_all(&out, "$1");
    let out = p.dialogue.replace_all(&out, " ");
    let out = p.chapter.replace_all(&out, "Chapter: $1. ");
    let out = p.image.replace_all(&out, "Image description: $1. ");
    p.whitespace.replace_all(&out, " ").trim().to_string()
}

/// Split `text` into pieces of at most `max_chars` characters.
///
/// Breaks fall at sentence ends where possible, then between words.  A
/// single word longer than `max_chars` is cut.  Empty input yields no chunks.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    if char_len(text) <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();

    for sentence in split_sentences(text) {
        if fits(&current, sentence, max_chars) {
            append(&mut current, sentence);
            continue;
        }
        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if char_len(sentence) <= max_chars {
            current.push_str(sentence);
            continue;
        }
        for word in sentence.split_whitespace() {
            if fits(&current, word, max_chars) {
                append(&mut current, word);
                continue;
            }
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            if char_len(word) <= max_chars {
                current.push_str(word);
            } else {
                let chars: Vec<char> = word.chars().collect();
                for piece in chars.chunks(max_chars) {
                    chunks.push(piece.iter().collect());
                }
            }
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    for m in patterns().sentence_end.find_iter(text) {
        // The terminator is a single ASCII byte.
        let end = m.start() + 1;
        sentences.push(&text[start..end]);
        start = m.end();
    }
    if start < text.len() {
        sentences.push(&text[start..]);
    }
    sentences
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn fits(current: &str, next: &str, max_chars: usize) -> bool {
    let sep = usize::from(!current.is_empty());
    char_len(current) + sep + char_len(next) <= max_chars
}

fn append(current: &mut String, next: &str) {
    if !current.is_empty() {
        current.push(' ');
    }
    current.push_str(next);
}

/// File-name-safe version of a chapter title: ASCII alphanumerics, `-` and
/// `_` kept, whitespace turned into `_`, cut to `max_len` characters.
pub fn sanitize_title(title: &str, max_len: usize) -> String {
    let cleaned: String = title
        .chars()
        .filter_map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                Some(c)
            } else if c.is_whitespace() {
                Some('_')
            } else {
                None
            }
        })
        .take(max_len)
        .collect();
    let trimmed = cleaned.trim_matches('_');
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed.to_string()
    }
}
