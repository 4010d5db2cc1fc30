use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_with::{serde_as, DefaultOnError, DefaultOnNull, OneOrMany};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentFingerprint {
    pub document_id: String,
    pub source_label: String,
    pub locator: String,
    pub checksum: String,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(from = "String")]
pub enum EntityType {
    #[default]
    Concept,
    Algorithm,
    Metric,
    Task,
    Component,
    #[serde(rename = "Formal_Definition")]
    FormalDefinition,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Concept => "Concept",
            Self::Algorithm => "Algorithm",
            Self::Metric => "Metric",
            Self::Task => "Task",
            Self::Component => "Component",
            Self::FormalDefinition => "Formal_Definition",
        }
    }
}

impl From<String> for EntityType {
    fn from(value: String) -> Self {
        match value.trim().to_lowercase().replace([' ', '-'], "_").as_str() {
            "algorithm" => Self::Algorithm,
            "metric" => Self::Metric,
            "task" => Self::Task,
            "component" => Self::Component,
            "formal_definition" => Self::FormalDefinition,
            _ => Self::Concept,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(from = "String", rename_all = "lowercase")]
pub enum Confidence {
    High,
    #[default]
    Medium,
    Low,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl From<String> for Confidence {
    fn from(value: String) -> Self {
        match value.trim().to_lowercase().as_str() {
            "high" => Self::High,
            "low" => Self::Low,
            _ => Self::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(from = "String", rename_all = "lowercase")]
pub enum FormalityLevel {
    Mathematical,
    Formal,
    #[default]
    Conceptual,
}

impl FormalityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mathematical => "mathematical",
            Self::Formal => "formal",
            Self::Conceptual => "conceptual",
        }
    }
}

impl From<String> for FormalityLevel {
    fn from(value: String) -> Self {
        match value.trim().to_lowercase().as_str() {
            "mathematical" => Self::Mathematical,
            "formal" => Self::Formal,
            _ => Self::Conceptual,
        }
    }
}

/// A page number, or `NAN` when the source gave none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PageRef {
    Number(u32),
    #[default]
    Unknown,
}

impl PageRef {
    pub fn number(&self) -> Option<u32> {
        match self {
            Self::Number(page) => Some(*page),
            Self::Unknown => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }
}

impl fmt::Display for PageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(page) => write!(f, "{page}"),
            Self::Unknown => f.write_str("NAN"),
        }
    }
}

impl Serialize for PageRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Number(page) => serializer.serialize_u32(*page),
            Self::Unknown => serializer.serialize_str("NAN"),
        }
    }
}

impl<'de> Deserialize<'de> for PageRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawPage {
            Int(i64),
            Float(f64),
            Text(String),
            Other(serde::de::IgnoredAny),
        }

        let page = match Option::<RawPage>::deserialize(deserializer)? {
            Some(RawPage::Int(value)) => u32::try_from(value).ok(),
            Some(RawPage::Float(value)) if value.is_finite() && value >= 0.0 => {
                Some(value as u32)
            }
            Some(RawPage::Text(value)) => value.trim().parse::<u32>().ok(),
            _ => None,
        };

        Ok(page.map_or(Self::Unknown, Self::Number))
    }
}

/// A `(subject, relation, object)` fact with evidence and provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Triple {
    pub subject: String,
    pub subject_type: EntityType,
    pub relation: String,
    pub object: String,
    pub object_type: EntityType,
    pub evidence: String,
    pub formality_level: FormalityLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formal_notation: Option<String>,
    pub page: PageRef,
    pub confidence: Confidence,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub document_id: String,
}

impl Triple {
    pub fn dedup_key(&self) -> (String, String, String) {
        (
            self.subject.to_lowercase(),
            self.relation.to_lowercase(),
            self.object.to_lowercase(),
        )
    }
}

#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthorRecord {
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    pub name: String,
    #[serde_as(deserialize_as = "DefaultOnError<DefaultOnNull<OneOrMany<_>>>")]
    #[serde(default)]
    pub affiliations: Vec<String>,
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    pub email: Option<String>,
}

#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SectionRecord {
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    pub section_name: String,
    #[serde(default = "unnumbered", deserialize_with = "string_or_number")]
    pub section_number: String,
    #[serde(default)]
    pub start_page: PageRef,
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    pub confidence: Confidence,
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    pub content: String,
}

/// Title, authors and major sections of one document.
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaperStructure {
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    pub document_title: String,
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    pub authors: Vec<AuthorRecord>,
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    pub sections: Vec<SectionRecord>,
}

impl PaperStructure {
    /// Key used for the Paper node; untitled documents still get one.
    pub fn paper_title(&self) -> &str {
        let title = self.document_title.trim();
        if title.is_empty() {
            "Untitled document"
        } else {
            title
        }
    }
}

fn unnumbered() -> String {
    "NAN".to_string()
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(text)) if !text.trim().is_empty() => text.trim().to_string(),
        Some(serde_json::Value::Number(number)) => number.to_string(),
        _ => unnumbered(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperRecord {
    pub title: String,
    pub document_id: String,
    #[serde(default)]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRow {
    pub subject: String,
    pub relation: String,
    pub object: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphStatistics {
    pub entities: u64,
    pub relationships: u64,
    pub samples: Vec<SampleRow>,
}

/// One edge matched by a keyword search, with both endpoint types.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRecord {
    pub subject: String,
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    pub subject_type: EntityType,
    pub relation: String,
    pub object: String,
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    pub object_type: EntityType,
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    pub evidence: String,
    #[serde(default)]
    pub page: PageRef,
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    pub confidence: Confidence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRelationship {
    pub subject: String,
    pub relation: String,
    pub object: String,
    #[serde(default)]
    pub evidence: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathHop {
    pub from: String,
    pub relation: String,
    pub to: String,
    pub evidence: Option<String>,
}

/// An entity chain `entities[0] -relations[0]-> entities[1] ...`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphPath {
    pub entities: Vec<String>,
    pub relations: Vec<String>,
    #[serde(default)]
    pub evidence: Vec<Option<String>>,
}

impl GraphPath {
    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    pub fn hops(&self) -> Vec<PathHop> {
        self.relations
            .iter()
            .enumerate()
            .filter_map(|(index, relation)| {
                let from = self.entities.get(index)?;
                let to = self.entities.get(index + 1)?;
                Some(PathHop {
                    from: from.clone(),
                    relation: relation.clone(),
                    to: to.clone(),
                    evidence: self.evidence.get(index).cloned().flatten(),
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionOptions {
    pub chunk_target_chars: usize,
    pub max_chunks: usize,
    pub min_chunk_chars: usize,
    pub max_model_chunks: usize,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            chunk_target_chars: 5_500,
            max_chunks: 10,
            min_chunk_chars: 1_000,
            max_model_chunks: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_ref_accepts_numbers_strings_and_nan() {
        let pages: Vec<PageRef> =
            serde_json::from_str(r#"[3, "7", "NAN", null, 2.0, -1, true]"#).expect("pages parse");
        assert_eq!(
            pages,
            vec![
                PageRef::Number(3),
                PageRef::Number(7),
                PageRef::Unknown,
                PageRef::Unknown,
                PageRef::Number(2),
                PageRef::Unknown,
                PageRef::Unknown,
            ]
        );
        assert_eq!(serde_json::to_string(&PageRef::Unknown).unwrap(), "\"NAN\"");
    }

    #[test]
    fn unknown_entity_types_fall_back_to_concept() {
        let types: Vec<EntityType> =
            serde_json::from_str(r#"["Algorithm", "formal definition", "Widget"]"#).unwrap();
        assert_eq!(
            types,
            vec![EntityType::Algorithm, EntityType::FormalDefinition, EntityType::Concept]
        );
        assert_eq!(
            serde_json::to_string(&EntityType::FormalDefinition).unwrap(),
            "\"Formal_Definition\""
        );
    }

    #[test]
    fn structure_fields_default_when_malformed() {
        let structure: PaperStructure = serde_json::from_str(
            r#"{
                "document_title": 42,
                "authors": [{"name": "Ada", "affiliations": "MIT", "email": null}],
                "sections": [{"section_name": "Abstract", "section_number": 1, "content": "x"}]
            }"#,
        )
        .unwrap();

        assert_eq!(structure.document_title, "");
        assert_eq!(structure.authors[0].affiliations, vec!["MIT".to_string()]);
        assert_eq!(structure.authors[0].email, None);
        assert_eq!(structure.sections[0].section_number, "1");
        assert_eq!(structure.sections[0].start_page, PageRef::Unknown);
        assert_eq!(structure.sections[0].confidence, Confidence::Medium);
    }

    #[test]
    fn path_hops_pair_entities_with_relations() {
        let path = GraphPath {
            entities: vec!["A".into(), "B".into(), "C".into()],
            relations: vec!["uses".into(), "feeds".into()],
            evidence: vec![Some("A uses B".into())],
        };
        let hops = path.hops();
        assert_eq!(path.len(), 2);
        assert_eq!(hops[1].from, "B");
        assert_eq!(hops[1].to, "C");
        assert_eq!(hops[0].evidence.as_deref(), Some("A uses B"));
        assert_eq!(hops[1].evidence, None);
    }
}
