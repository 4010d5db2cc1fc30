//! Cleanup of page-marked text pulled out of PDFs.
//!
//! `normalize_text` is pure and idempotent. `{PAGE N}` markers survive
//! untouched so triples can still be attributed to pages downstream.

use once_cell::sync::Lazy;
use regex::Regex;

static PAGE_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\s*PAGE\s+(\d+)\s*\}").expect("page marker regex"));
static UNSAFE_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[^\w\s.,;:\-'"()]"#).expect("unsafe char regex"));
static PARAGRAPH_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n[ \t\r\f\v\u{a0}]*\n").expect("paragraph regex"));
static CAMEL_BOUNDARY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([a-z])([A-Z])").expect("camel regex"));
static GLUED_CONJUNCTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\w)(through|based|with|from|into|onto|across)(\w)")
        .expect("conjunction regex")
});
static SPACE_BEFORE_PUNCT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ \t]+([.,;:])").expect("punct regex"));
static SPACE_AFTER_PUNCT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([.,;:])[ \t]+").expect("punct regex"));

/// Page number carried by a `{PAGE N}` marker.
pub fn page_markers(text: &str) -> Vec<(usize, u32)> {
    PAGE_MARKER
        .captures_iter(text)
        .filter_map(|capture| {
            let start = capture.get(0)?.start();
            let page = capture.get(1)?.as_str().parse().ok()?;
            Some((start, page))
        })
        .collect()
}

pub fn normalize_text(raw: &str) -> String {
    let mut pieces = Vec::new();
    let mut cursor = 0;

    for capture in PAGE_MARKER.captures_iter(raw) {
        let Some(whole) = capture.get(0) else {
            continue;
        };
        push_segment(&mut pieces, &raw[cursor..whole.start()]);
        if let Some(page) = capture.get(1) {
            pieces.push(format!("{{PAGE {}}}", page.as_str()));
        }
        cursor = whole.end();
    }
    push_segment(&mut pieces, &raw[cursor..]);

    pieces.join("\n")
}

fn push_segment(pieces: &mut Vec<String>, segment: &str) {
    let normalized = normalize_segment(segment);
    if !normalized.is_empty() {
        pieces.push(normalized);
    }
}

fn normalize_segment(segment: &str) -> String {
    let folded = fold_quotes(segment);
    let stripped = UNSAFE_CHARS.replace_all(&folded, " ");
    let collapsed = collapse_whitespace(&stripped);
    let split_camel = CAMEL_BOUNDARY.replace_all(&collapsed, "$1 $2");
    let separated = separate_conjunctions(&split_camel);
    let tightened = SPACE_BEFORE_PUNCT.replace_all(&separated, "$1");
    let spaced = SPACE_AFTER_PUNCT.replace_all(&tightened, "$1 ");
    collapse_whitespace(&spaced)
}

fn fold_quotes(text: &str) -> String {
    text.chars()
        .map(|ch| match ch {
            '\u{201c}' | '\u{201d}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            other => other,
        })
        .collect()
}

/// Collapses horizontal whitespace while keeping single line breaks and
/// blank-line paragraph breaks.
pub fn collapse_whitespace(text: &str) -> String {
    PARAGRAPH_BREAK
        .split(&text.replace("\r\n", "\n"))
        .map(|paragraph| {
            paragraph
                .lines()
                .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
                .filter(|line| !line.is_empty())
                .collect::<Vec<_>>()
                .join("\n")
        })
        .filter(|paragraph| !paragraph.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

// Non-overlapping matches can leave a second glued token behind, so loop
// until nothing changes.
fn separate_conjunctions(text: &str) -> String {
    let mut current = text.to_string();
    loop {
        let next = GLUED_CONJUNCTION.replace_all(&current, "$1 $2 $3").into_owned();
        if next == current {
            return current;
        }
        current = next;
    }
}
