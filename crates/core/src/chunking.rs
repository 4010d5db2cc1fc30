use crate::models::ExtractionOptions;
use std::collections::VecDeque;

const MAX_OVERLAP_CHARS: usize = 500;
const SEPARATORS: [&str; 3] = ["\n\n", "\n", ""];

#[derive(Debug, Clone, Copy)]
pub struct ChunkingConfig {
    /// Segment size used when `max_chunks` is 0 (no count bound).
    pub target_chars: usize,
    pub max_chunks: usize,
    pub min_chars: usize,
}

impl From<&ExtractionOptions> for ChunkingConfig {
    fn from(value: &ExtractionOptions) -> Self {
        Self {
            target_chars: value.chunk_target_chars,
            max_chunks: value.max_chunks,
            min_chars: value.min_chunk_chars,
        }
    }
}

impl ChunkingConfig {
    pub fn chunk_size(&self, text_chars: usize) -> usize {
        let size = if self.max_chunks == 0 {
            self.min_chars.max(self.target_chars)
        } else {
            self.min_chars.max(text_chars / self.max_chunks)
        };
        size.max(1)
    }

    pub fn overlap(&self, chunk_size: usize) -> usize {
        MAX_OVERLAP_CHARS.min(chunk_size / 10)
    }
}

/// Splits `text` into overlapping segments in document order.
///
/// Paragraph breaks are preferred over line breaks, which are preferred over
/// arbitrary character boundaries. When `max_chunks` is non-zero the result
/// never holds more than `max_chunks` segments; extra trailing segments are
/// folded into their predecessor.
pub fn chunk_text(text: &str, config: ChunkingConfig) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let size = config.chunk_size(char_len(text));
    let overlap = config.overlap(size);
    let mut chunks = split_recursive(text, &SEPARATORS, size, overlap);

    if config.max_chunks > 0 {
        while chunks.len() > config.max_chunks {
            let Some(last) = chunks.pop() else {
                break;
            };
            if let Some(previous) = chunks.last_mut() {
                previous.push('\n');
                previous.push_str(&last);
            }
        }
    }

    chunks
}

fn split_recursive(text: &str, separators: &[&str], size: usize, overlap: usize) -> Vec<String> {
    let (separator, rest) = pick_separator(text, separators);

    let splits: Vec<String> = if separator.is_empty() {
        text.chars().map(String::from).collect()
    } else {
        text.split(separator)
            .filter(|piece| !piece.trim().is_empty())
            .map(str::to_string)
            .collect()
    };

    let mut output = Vec::new();
    let mut pending = Vec::new();

    for split in splits {
        if char_len(&split) <= size {
            pending.push(split);
            continue;
        }

        if !pending.is_empty() {
            output.extend(merge_splits(&pending, separator, size, overlap));
            pending.clear();
        }

        if rest.is_empty() {
            output.push(split);
        } else {
            output.extend(split_recursive(&split, rest, size, overlap));
        }
    }

    if !pending.is_empty() {
        output.extend(merge_splits(&pending, separator, size, overlap));
    }

    output
}

fn pick_separator<'a, 'b>(text: &str, separators: &'b [&'a str]) -> (&'a str, &'b [&'a str]) {
    for (index, separator) in separators.iter().copied().enumerate() {
        if separator.is_empty() || text.contains(separator) {
            return (separator, &separators[index + 1..]);
        }
    }
    ("", &[])
}

// Packs small splits into segments of at most `size` characters, carrying up
// to `overlap` characters of trailing splits into the next segment.
fn merge_splits(splits: &[String], separator: &str, size: usize, overlap: usize) -> Vec<String> {
    let separator_len = char_len(separator);
    let mut segments = Vec::new();
    let mut window: VecDeque<&str> = VecDeque::new();
    let mut total = 0usize;

    for split in splits {
        let len = char_len(split);
        let joiner = if window.is_empty() { 0 } else { separator_len };

        if total + len + joiner > size && !window.is_empty() {
            push_joined(&mut segments, &window, separator);

            loop {
                let joiner = if window.is_empty() { 0 } else { separator_len };
                let still_too_large = total > 0 && total + len + joiner > size;
                if total <= overlap && !still_too_large {
                    break;
                }
                let Some(front) = window.pop_front() else {
                    break;
                };
                let dropped_joiner = if window.is_empty() { 0 } else { separator_len };
                total = total.saturating_sub(char_len(front) + dropped_joiner);
            }
        }

        let joiner = if window.is_empty() { 0 } else { separator_len };
        window.push_back(split.as_str());
        total += len + joiner;
    }

    push_joined(&mut segments, &window, separator);
    segments
}

fn push_joined(segments: &mut Vec<String>, window: &VecDeque<&str>, separator: &str) {
    let joined = window.iter().copied().collect::<Vec<_>>().join(separator);
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        segments.push(trimmed.to_string());
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}
