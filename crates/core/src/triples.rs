use crate::chunking::{chunk_text, ChunkingConfig};
use crate::llm::{extract_json_payload, parse_model_json, CompletionModel, CompletionRequest};
use crate::models::{Confidence, EntityType, ExtractionOptions, FormalityLevel, PageRef, Triple};
use crate::normalize::{normalize_text, page_markers};
use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_with::{serde_as, DefaultOnError};
use std::collections::HashSet;
use tracing::{debug, info, warn};

const MAX_ENTITY_CHARS: usize = 100;
const MAX_ENTITY_WORDS: usize = 8;
const VAGUE_TERMS: [&str; 11] = [
    "it", "this", "that", "these", "those", "thing", "stuff", "something", "anything",
    "everything", "nothing",
];

static EDGE_PUNCTUATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\w\s]+|[^\w\s]+$").expect("edge punctuation regex"));
static LEADING_ARTICLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(a|an|the)\s+").expect("article regex"));

const TRIPLE_SYSTEM_PROMPT: &str = r#"You extract knowledge-graph triples from academic and technical text.

Return ONLY one JSON object:
{"triples": [{
  "subject": "entity", "subject_type": "Formal_Definition|Concept|Algorithm|Metric|Task|Component",
  "relation": "descriptive_action_verb",
  "object": "entity", "object_type": "Formal_Definition|Concept|Algorithm|Metric|Task|Component",
  "evidence": "verbatim excerpt of 20-200 characters on one line",
  "formality_level": "mathematical|formal|conceptual",
  "formal_notation": "symbolic expression, only for mathematical content",
  "page": 1,
  "confidence": "high|medium|low"
}]}

Take "page" from the nearest preceding {PAGE N} marker, or "NAN" when there is none. Prefer 10-30 precise triples: definitions, components, algorithms, task interactions, quantitative claims. Avoid pronouns and vague entities. Escape quotes, newlines and tabs inside strings. No trailing commas."#;

#[serde_as]
#[derive(Debug, Default, Deserialize)]
struct RawTripleEnvelope {
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    triples: Vec<RawTriple>,
}

#[serde_as]
#[derive(Debug, Default, Deserialize)]
struct RawTriple {
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    subject: String,
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    subject_type: EntityType,
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    relation: String,
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    object: String,
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    object_type: EntityType,
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    evidence: String,
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    formality_level: FormalityLevel,
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    formal_notation: Option<String>,
    #[serde(default)]
    page: PageRef,
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    confidence: Confidence,
}

pub struct TripleExtractor<M> {
    model: M,
    options: ExtractionOptions,
}

impl<M: CompletionModel> TripleExtractor<M> {
    pub fn new(model: M, options: ExtractionOptions) -> Self {
        Self { model, options }
    }

    /// Extracts deduplicated triples from raw page-marked text.
    ///
    /// Chunks are sent to the model concurrently. A chunk whose call or
    /// parse fails contributes nothing; the rest still count.
    pub async fn extract(&self, text: &str) -> Vec<Triple> {
        let normalized = normalize_text(text);
        let chunks = chunk_text(&normalized, ChunkingConfig::from(&self.options));
        let selected = &chunks[..chunks.len().min(self.options.max_model_chunks)];

        info!(
            chunks = chunks.len(),
            sent = selected.len(),
            chars = normalized.len(),
            "extracting triples"
        );

        let per_chunk = join_all(
            selected
                .iter()
                .enumerate()
                .map(|(index, chunk)| self.extract_chunk(index, chunk)),
        )
        .await;

        let triples = dedup_triples(per_chunk.into_iter().flatten());
        info!(triples = triples.len(), "triple extraction finished");
        triples
    }

    async fn extract_chunk(&self, index: usize, chunk: &str) -> Vec<Triple> {
        let request = CompletionRequest::new(
            TRIPLE_SYSTEM_PROMPT,
            format!(
                "Extract knowledge graph triples from this text. It contains {{PAGE N}} markers at page boundaries.\n\nText:\n{chunk}"
            ),
        );

        let response = match self.model.complete(&request).await {
            Ok(response) => response,
            Err(error) => {
                warn!(chunk = index, %error, "completion failed for chunk");
                return Vec::new();
            }
        };

        match parse_chunk_triples(&response, chunk) {
            Ok(triples) => {
                debug!(chunk = index, triples = triples.len(), "chunk extracted");
                triples
            }
            Err(reason) => {
                warn!(chunk = index, %reason, "discarding unparseable chunk output");
                Vec::new()
            }
        }
    }
}

/// Parses one chunk reply into cleaned, valid triples.
pub fn parse_chunk_triples(response: &str, chunk: &str) -> Result<Vec<Triple>, String> {
    let payload = extract_json_payload(response).ok_or("no JSON object in reply")?;
    let envelope: RawTripleEnvelope =
        parse_model_json(payload).map_err(|error| error.to_string())?;

    Ok(envelope
        .triples
        .into_iter()
        .filter_map(|raw| clean_triple(raw, chunk))
        .collect())
}

fn clean_triple(raw: RawTriple, chunk: &str) -> Option<Triple> {
    let subject = clean_entity(&raw.subject);
    let object = clean_entity(&raw.object);
    let relation = normalize_relation(&raw.relation);

    if !is_valid_triple(&subject, &relation, &object) {
        debug!(%subject, %relation, %object, "rejected triple");
        return None;
    }

    let page = if raw.page.is_unknown() {
        page_for_evidence(chunk, &raw.evidence)
    } else {
        raw.page
    };

    Some(Triple {
        subject,
        subject_type: raw.subject_type,
        relation,
        object,
        object_type: raw.object_type,
        evidence: escape_evidence(raw.evidence.trim()),
        formality_level: raw.formality_level,
        formal_notation: raw
            .formal_notation
            .map(|notation| notation.trim().to_string())
            .filter(|notation| !notation.is_empty()),
        page,
        confidence: raw.confidence,
        source: String::new(),
        document_id: String::new(),
    })
}

pub fn clean_entity(text: &str) -> String {
    let trimmed = text.trim();
    let stripped = EDGE_PUNCTUATION.replace_all(trimmed, "");
    let without_article = LEADING_ARTICLE.replace(stripped.trim(), "");
    let collapsed = without_article.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut chars = collapsed.chars();
    match chars.next() {
        Some(first) if !first.is_uppercase() => first.to_uppercase().chain(chars).collect(),
        _ => collapsed,
    }
}

pub fn normalize_relation(relation: &str) -> String {
    relation.split_whitespace().collect::<Vec<_>>().join("_").to_lowercase()
}

pub fn escape_evidence(evidence: &str) -> String {
    evidence
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('\t', "\\t")
}

pub fn is_valid_triple(subject: &str, relation: &str, object: &str) -> bool {
    if subject.is_empty() || relation.is_empty() || object.is_empty() {
        return false;
    }

    if [subject, relation, object]
        .iter()
        .any(|part| part.chars().count() < 2)
    {
        return false;
    }

    let subject_lower = subject.to_lowercase();
    let object_lower = object.to_lowercase();
    if subject_lower == object_lower {
        return false;
    }

    if VAGUE_TERMS.contains(&subject_lower.as_str()) || VAGUE_TERMS.contains(&object_lower.as_str())
    {
        return false;
    }

    [subject, object].iter().all(|entity| {
        entity.chars().count() <= MAX_ENTITY_CHARS
            && entity.split(' ').filter(|word| !word.is_empty()).count() <= MAX_ENTITY_WORDS
    })
}

/// Keeps the first triple for each case-insensitive (subject, relation, object).
pub fn dedup_triples(triples: impl IntoIterator<Item = Triple>) -> Vec<Triple> {
    let mut seen = HashSet::new();
    triples
        .into_iter()
        .filter(|triple| seen.insert(triple.dedup_key()))
        .collect()
}

// Page of the last `{PAGE N}` marker before the evidence, else the chunk's
// first marker.
fn page_for_evidence(chunk: &str, evidence: &str) -> PageRef {
    let markers = page_markers(chunk);
    let needle = evidence.trim();

    let position = if needle.is_empty() {
        None
    } else {
        chunk.find(needle)
    };

    let page = match position {
        Some(offset) => markers
            .iter()
            .take_while(|(start, _)| *start <= offset)
            .last()
            .or_else(|| markers.first()),
        None => markers.first(),
    };

    page.map_or(PageRef::Unknown, |(_, number)| PageRef::Number(*number))
}
