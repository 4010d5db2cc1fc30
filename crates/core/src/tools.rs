use crate::models::{
    AuthorRecord, EntityRelationship, GraphPath, PaperRecord, RelationshipRecord, SectionRecord,
};
use crate::query_terms::candidate_terms;
use crate::traits::KnowledgeGraph;
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, warn};

pub const SEARCH_TERM_LIMIT: usize = 5;
pub const SEARCH_ROW_LIMIT: usize = 50;
pub const ENTITY_LOOKUP_LIMIT: usize = 20;
pub const MAX_PATH_HOPS: usize = 3;
pub const PATH_LIMIT: usize = 10;

/// Result of a retrieval tool. Failures carry a message for the caller to
/// read; they are never raised.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome<T> {
    Success(T),
    Failure(String),
}

impl<T> ToolOutcome<T> {
    pub fn success(self) -> Option<T> {
        match self {
            Self::Success(value) => Some(value),
            Self::Failure(_) => None,
        }
    }

    fn render(self, format: impl FnOnce(T) -> String) -> String {
        match self {
            Self::Success(value) => format(value),
            Self::Failure(message) => message,
        }
    }
}

/// Retrieval operations over one knowledge graph, every call scoped by
/// document id.
pub struct GraphTools<G> {
    graph: G,
}

impl<G: KnowledgeGraph> GraphTools<G> {
    pub fn new(graph: G) -> Self {
        Self { graph }
    }

    pub async fn search_kg(
        &self,
        document_id: &str,
        query: &str,
    ) -> ToolOutcome<Vec<RelationshipRecord>> {
        let terms: Vec<String> = candidate_terms(query)
            .into_iter()
            .take(SEARCH_TERM_LIMIT)
            .collect();
        if terms.is_empty() {
            debug!(query, "no candidate terms in query");
            return ToolOutcome::Success(Vec::new());
        }

        let lookups = join_all(terms.iter().map(|term| {
            self.graph
                .search_relationships(document_id, term, SEARCH_ROW_LIMIT)
        }))
        .await;

        let mut failures = Vec::new();
        let mut seen = HashSet::new();
        let mut records = Vec::new();

        for (term, lookup) in terms.iter().zip(lookups) {
            match lookup {
                Ok(rows) => {
                    for mut record in rows {
                        record.relation = record
                            .relation
                            .split_whitespace()
                            .collect::<Vec<_>>()
                            .join("_")
                            .to_lowercase();
                        let key = (
                            record.subject.clone(),
                            record.relation.clone(),
                            record.object.clone(),
                        );
                        if seen.insert(key) {
                            records.push(record);
                        }
                    }
                }
                Err(error) => {
                    warn!(term = %term, %error, "knowledge graph term lookup failed");
                    failures.push(error.to_string());
                }
            }
        }

        if failures.len() == terms.len() {
            return ToolOutcome::Failure(format!(
                "Error searching knowledge graph: {}",
                failures.join("; ")
            ));
        }

        ToolOutcome::Success(records)
    }

    pub async fn entity_lookup(
        &self,
        document_id: &str,
        entity: &str,
    ) -> ToolOutcome<Vec<EntityRelationship>> {
        match self
            .graph
            .entity_relationships(document_id, entity.trim(), ENTITY_LOOKUP_LIMIT)
            .await
        {
            Ok(rows) => ToolOutcome::Success(rows),
            Err(error) => ToolOutcome::Failure(format!("Error looking up entity: {error}")),
        }
    }

    pub async fn multi_hop_search(
        &self,
        document_id: &str,
        query: &str,
    ) -> ToolOutcome<Vec<GraphPath>> {
        match self
            .graph
            .find_paths(document_id, query.trim(), MAX_PATH_HOPS, PATH_LIMIT)
            .await
        {
            Ok(paths) => ToolOutcome::Success(
                paths.into_iter().filter(|path| !path.is_empty()).collect(),
            ),
            Err(error) => ToolOutcome::Failure(format!("Error in multi-hop search: {error}")),
        }
    }

    pub async fn paper_lookup(&self, document_id: &str) -> ToolOutcome<Option<PaperRecord>> {
        match self.graph.paper(document_id).await {
            Ok(paper) => ToolOutcome::Success(paper),
            Err(error) => ToolOutcome::Failure(format!("Error looking up paper: {error}")),
        }
    }

    pub async fn author_lookup(&self, document_id: &str) -> ToolOutcome<Vec<AuthorRecord>> {
        match self.graph.authors(document_id).await {
            Ok(authors) => ToolOutcome::Success(authors),
            Err(error) => ToolOutcome::Failure(format!("Error looking up authors: {error}")),
        }
    }

    pub async fn section_lookup(&self, document_id: &str) -> ToolOutcome<Vec<SectionRecord>> {
        match self.graph.sections(document_id).await {
            Ok(sections) => ToolOutcome::Success(sections),
            Err(error) => ToolOutcome::Failure(format!("Error looking up sections: {error}")),
        }
    }
}

pub fn render_entity_relationships(entity: &str, rows: &[EntityRelationship]) -> String {
    if rows.is_empty() {
        return format!("No relationships found for entity: {entity}");
    }

    rows.iter()
        .map(|row| {
            format!(
                "{} --{}--> {}\n  evidence: {}",
                row.subject,
                row.relation,
                row.object,
                row.evidence.as_deref().unwrap_or("No evidence")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_paths(paths: &[GraphPath]) -> String {
    if paths.is_empty() {
        return "No multi-hop paths found.".to_string();
    }

    paths
        .iter()
        .enumerate()
        .map(|(index, path)| {
            let hops = path
                .hops()
                .into_iter()
                .map(|hop| {
                    format!(
                        "{} --{}--> {} (evidence: {})",
                        hop.from,
                        hop.relation,
                        hop.to,
                        hop.evidence.as_deref().unwrap_or("No evidence")
                    )
                })
                .collect::<Vec<_>>()
                .join(" | ");
            format!("{}. {hops}", index + 1)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value)
        .unwrap_or_else(|error| format!("Error serializing tool result: {error}"))
}

/// Description of one tool, shown to the reasoning model.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub arguments: &'static [&'static str],
}

static TOOL_SPECS: [ToolSpec; 6] = [
    ToolSpec {
        name: "search_kg",
        description: "Search the knowledge graph for relationships mentioning the entities in a free-text query. Returns a JSON list of triples with evidence, page and confidence.",
        arguments: &["query"],
    },
    ToolSpec {
        name: "entity_lookup",
        description: "List the outgoing relationships of an entity (exact or partial name), each with its evidence.",
        arguments: &["entity_name"],
    },
    ToolSpec {
        name: "multi_hop_search",
        description: "Find chains of up to three relationships that start or end at an entity matching the query. Use for indirect connections.",
        arguments: &["path_query"],
    },
    ToolSpec {
        name: "paper_lookup",
        description: "Return the title and id of the paper.",
        arguments: &[],
    },
    ToolSpec {
        name: "author_lookup",
        description: "Return the paper's authors with affiliations and email.",
        arguments: &[],
    },
    ToolSpec {
        name: "section_lookup",
        description: "Return the paper's major sections with start page, confidence and content.",
        arguments: &[],
    },
];

/// Output of one dispatched tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolReply {
    pub text: String,
    /// True when the graph returned at least one record.
    pub found_content: bool,
}

impl ToolReply {
    fn new(text: String, found_content: bool) -> Self {
        Self {
            text,
            found_content,
        }
    }
}

/// The six tools bound to a single document, dispatched by name.
pub struct ToolBox<G> {
    tools: GraphTools<G>,
    document_id: String,
}

impl<G: KnowledgeGraph> ToolBox<G> {
    pub fn new(graph: G, document_id: impl Into<String>) -> Self {
        Self {
            tools: GraphTools::new(graph),
            document_id: document_id.into(),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn specs(&self) -> &'static [ToolSpec] {
        &TOOL_SPECS
    }

    pub async fn invoke(&self, name: &str, arguments: &Value) -> String {
        self.dispatch(name, arguments).await.text
    }

    /// Runs a tool by name. Never fails: unknown tools and bad arguments
    /// come back as readable text.
    pub async fn dispatch(&self, name: &str, arguments: &Value) -> ToolReply {
        let document_id = self.document_id.as_str();

        match name {
            "search_kg" => {
                let Some(query) = string_argument(arguments, &["query"]) else {
                    return missing_argument(name, "query");
                };
                let outcome = self.tools.search_kg(document_id, &query).await;
                let found = outcome_has_rows(&outcome);
                ToolReply::new(outcome.render(|rows| render_json(&rows)), found)
            }
            "entity_lookup" => {
                let Some(entity) = string_argument(arguments, &["entity_name", "entity"]) else {
                    return missing_argument(name, "entity_name");
                };
                let outcome = self.tools.entity_lookup(document_id, &entity).await;
                let found = outcome_has_rows(&outcome);
                ToolReply::new(
                    outcome.render(|rows| render_entity_relationships(&entity, &rows)),
                    found,
                )
            }
            "multi_hop_search" => {
                let Some(query) = string_argument(arguments, &["path_query", "query"]) else {
                    return missing_argument(name, "path_query");
                };
                let outcome = self.tools.multi_hop_search(document_id, &query).await;
                let found = outcome_has_rows(&outcome);
                ToolReply::new(outcome.render(|paths| render_paths(&paths)), found)
            }
            "paper_lookup" => {
                let outcome = self.tools.paper_lookup(document_id).await;
                let found = matches!(outcome, ToolOutcome::Success(Some(_)));
                ToolReply::new(
                    outcome.render(|paper| match paper {
                        Some(paper) => render_json(&paper),
                        None => "No paper found for this document.".to_string(),
                    }),
                    found,
                )
            }
            "author_lookup" => {
                let outcome = self.tools.author_lookup(document_id).await;
                let found = outcome_has_rows(&outcome);
                ToolReply::new(
                    outcome.render(|authors| {
                        if authors.is_empty() {
                            "No authors found for this document.".to_string()
                        } else {
                            render_json(&authors)
                        }
                    }),
                    found,
                )
            }
            "section_lookup" => {
                let outcome = self.tools.section_lookup(document_id).await;
                let found = outcome_has_rows(&outcome);
                ToolReply::new(
                    outcome.render(|sections| {
                        if sections.is_empty() {
                            "No sections found for this document.".to_string()
                        } else {
                            render_json(&sections)
                        }
                    }),
                    found,
                )
            }
            unknown => {
                let available = TOOL_SPECS
                    .iter()
                    .map(|spec| spec.name)
                    .collect::<Vec<_>>()
                    .join(", ");
                ToolReply::new(
                    format!("Unknown tool: {unknown}. Available tools: {available}"),
                    false,
                )
            }
        }
    }
}

fn outcome_has_rows<T>(outcome: &ToolOutcome<Vec<T>>) -> bool {
    matches!(outcome, ToolOutcome::Success(rows) if !rows.is_empty())
}

fn missing_argument(tool: &str, argument: &str) -> ToolReply {
    ToolReply::new(
        format!("Missing required argument '{argument}' for tool {tool}"),
        false,
    )
}

// A bare string stands in for the single expected argument.
fn string_argument(arguments: &Value, keys: &[&str]) -> Option<String> {
    let value = match arguments {
        Value::String(text) => Some(text.as_str()),
        Value::Object(map) => keys
            .iter()
            .find_map(|key| map.get(*key))
            .and_then(Value::as_str),
        _ => None,
    }?;

    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
