//! Clean up a raw caption so it reads well when spoken.

/// Trim, drop quotation marks, capitalise the first letter, make sure the
/// text ends with terminal punctuation and keep it within `max_len`
/// characters, cutting at a sentence end when one fits.
pub fn postprocess_description(raw: &str, max_len: usize) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '"' | '\u{201C}' | '\u{201D}'))
        .collect();
    let cleaned = cleaned
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let cleaned = cleaned.trim_matches(|c: char| c == '\'' || c.is_whitespace());
    if cleaned.is_empty() {
        return String::new();
    }

    let mut text = capitalize(cleaned);
    if !ends_with_terminal(&text) {
        text.push('.');
    }

    if text.chars().count() <= max_len {
        return text;
    }
    limit_length(&text, max_len.max(2))
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn ends_with_terminal(s: &str) -> bool {
    s.ends_with(['.', '!', '?'])
}

/// Longest prefix of whole sentences within `max_len`; failing that, whole
/// words within `max_len - 1` followed by a period.
fn limit_length(text: &str, max_len: usize) -> String {
    let mut best = None;
    for (idx, c) in text.char_indices() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        let end = idx + c.len_utf8();
        if text[..end].chars().count() > max_len {
            break;
        }
        best = Some(end);
    }
    if let Some(end) = best {
        return text[..end].trim().to_string();
    }

    let budget = max_len - 1;
    let mut out = String::new();
    for word in text.split_whitespace() {
        let extra = usize::from(!out.is_empty()) + word.chars().count();
        if out.chars().count() + extra > budget {
            break;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    if out.is_empty() {
        out = text.chars().take(budget).collect();
    }
    let mut out = out
        .trim_end_matches(|c: char| c == ',' || c == ';' || c == ':' || c == '.')
        .to_string();
    out.push('.');
    out
}
