//! Rule-based extraction of the terms a question is about.
//!
//! Named-entity-like spans ("ReAct", "Wikipedia API") win. Without any,
//! the remaining content words are used.

use std::collections::HashSet;

const STOP_WORDS: &[&str] = &[
    // articles and demonstratives
    "a", "an", "the", "this", "that", "these", "those",
    // prepositions
    "at", "in", "on", "to", "for", "of", "from", "by", "with", "about", "into", "through",
    "during", "before", "after", "above", "below", "between", "under", "over", "across",
    "onto", "via", "per", "within", "without",
    // conjunctions
    "and", "or", "but", "nor", "so", "yet", "both", "either", "neither", "than",
    // pronouns
    "i", "me", "my", "we", "our", "you", "your", "he", "she", "it", "its", "they", "them",
    "their", "his", "her", "us",
    // question words
    "what", "which", "who", "whom", "whose", "when", "where", "why", "how",
    // auxiliaries
    "is", "are", "was", "were", "be", "been", "being", "am", "do", "does", "did", "done",
    "has", "have", "had", "can", "could", "will", "would", "shall", "should", "may", "might",
    "must",
    // request verbs and fillers
    "tell", "explain", "describe", "show", "give", "list", "find", "know", "mean", "means",
    "please", "paper", "document", "work", "works", "used", "use", "uses", "using", "relate",
    "related", "relationship", "some", "any", "all", "each", "every", "other",
    "more", "most", "much", "many", "not", "no", "also", "just", "there", "here", "then",
    // question and claim verbs
    "help", "helps", "helped", "improve", "improves", "improved", "increase", "increases",
    "increased", "decrease", "decreases", "reduce", "reduces", "reduced", "compare",
    "compares", "compared", "comparing", "enable", "enables", "enabled", "affect", "affects",
    "affected", "make", "makes", "made", "get", "gets", "lead", "leads", "cause", "causes",
    "allow", "allows", "achieve", "achieves", "contribute", "contributes", "differ", "differs",
];

fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.contains(&word.to_lowercase().as_str())
}

fn tokens(text: &str) -> Vec<&str> {
    text.split_whitespace()
        .map(|word| word.trim_matches(|ch: char| !ch.is_alphanumeric() && ch != '-'))
        .filter(|word| !word.is_empty())
        .collect()
}

// Capitalized mid-sentence, mixed case (`ReAct`), acronym (`LLM`), or
// letters with digits (`GPT-4`).
fn is_entity_like(word: &str, position: usize) -> bool {
    if is_stop_word(word) {
        return false;
    }

    let mut chars = word.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    let rest: Vec<char> = chars.collect();

    let has_letter = word.chars().any(char::is_alphabetic);
    let has_digit = word.chars().any(|ch| ch.is_ascii_digit());
    let inner_upper = rest.iter().any(|ch| ch.is_uppercase());
    let inner_lower = rest.iter().any(|ch| ch.is_lowercase());

    (has_letter && has_digit)
        || (first.is_uppercase() && inner_upper)
        || (first.is_lowercase() && inner_upper)
        || (first.is_uppercase() && inner_lower && position > 0)
}

/// Entity-like spans in order of appearance, without duplicates.
pub fn entity_spans(query: &str) -> Vec<String> {
    let words = tokens(query);
    let mut spans = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for (position, word) in words.iter().copied().enumerate() {
        if is_entity_like(word, position) {
            current.push(word);
        } else if !current.is_empty() {
            spans.push(current.join(" "));
            current.clear();
        }
    }
    if !current.is_empty() {
        spans.push(current.join(" "));
    }

    unique(spans)
}

/// Lower-cased content tokens longer than two characters.
pub fn content_words(query: &str) -> Vec<String> {
    unique(
        tokens(query)
            .into_iter()
            .filter(|word| word.chars().count() > 2 && !is_stop_word(word))
            .filter(|word| word.chars().any(char::is_alphanumeric))
            .map(str::to_lowercase)
            .collect(),
    )
}

pub fn candidate_terms(query: &str) -> Vec<String> {
    let spans = entity_spans(query);
    if spans.is_empty() {
        content_words(query)
    } else {
        spans
    }
}

fn unique(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.to_lowercase()))
        .collect()
}
