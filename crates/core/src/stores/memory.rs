use crate::error::GraphError;
use crate::models::{
    AuthorRecord, Confidence, EntityRelationship, EntityType, GraphPath,
    GraphStatistics, PageRef, PaperRecord, PaperStructure, RelationshipRecord, SampleRow,
    SectionRecord, Triple,
};
use crate::traits::KnowledgeGraph;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EdgeKey {
    document_id: String,
    subject: String,
    object: String,
    relation: String,
    source: String,
}

#[derive(Debug, Clone)]
struct StoredEdge {
    key: EdgeKey,
    evidence: String,
    page: PageRef,
    confidence: Confidence,
}

#[derive(Debug, Default)]
struct GraphState {
    // (document_id, name) -> type fixed at creation
    entities: HashMap<(String, String), EntityType>,
    edges: Vec<StoredEdge>,
    edge_index: HashSet<EdgeKey>,
    papers: Vec<PaperRecord>,
    authors: Vec<(String, AuthorRecord)>,
    authored: HashSet<(String, String, String)>,
    sections: Vec<(String, SectionRecord)>,
    has_section: HashSet<(String, String, String, String)>,
}

impl GraphState {
    fn document_edges<'a>(&'a self, document_id: &'a str) -> impl Iterator<Item = &'a StoredEdge> {
        self.edges
            .iter()
            .filter(move |edge| edge.key.document_id == document_id)
    }

    fn entity_type(&self, document_id: &str, name: &str) -> EntityType {
        self.entities
            .get(&(document_id.to_string(), name.to_string()))
            .copied()
            .unwrap_or_default()
    }
}

/// In-process knowledge graph with the same upsert, scoping and path
/// semantics as the Neo4j store.
#[derive(Debug, Default)]
pub struct MemoryGraph {
    state: RwLock<GraphState>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KnowledgeGraph for MemoryGraph {
    async fn initialize(&self) -> Result<(), GraphError> {
        Ok(())
    }

    async fn store_triples_batch(
        &self,
        document_id: &str,
        triples: &[Triple],
        source: &str,
    ) -> Result<usize, GraphError> {
        if triples.is_empty() {
            return Ok(0);
        }

        let mut state = self.state.write().await;
        for triple in triples {
            state
                .entities
                .entry((document_id.to_string(), triple.subject.clone()))
                .or_insert(triple.subject_type);
            state
                .entities
                .entry((document_id.to_string(), triple.object.clone()))
                .or_insert(triple.object_type);

            let key = EdgeKey {
                document_id: document_id.to_string(),
                subject: triple.subject.clone(),
                object: triple.object.clone(),
                relation: triple.relation.clone(),
                source: source.to_string(),
            };
            if state.edge_index.insert(key.clone()) {
                state.edges.push(StoredEdge {
                    key,
                    evidence: triple.evidence.clone(),
                    page: triple.page,
                    confidence: triple.confidence,
                });
            }
        }

        info!(document_id, sent = triples.len(), "stored triples in memory graph");
        Ok(triples.len())
    }

    async fn clear_graph(&self, document_id: &str) -> Result<(), GraphError> {
        let mut state = self.state.write().await;
        state.edges.retain(|edge| edge.key.document_id != document_id);
        state.edge_index.retain(|key| key.document_id != document_id);
        Ok(())
    }

    async fn build_structured_graph(
        &self,
        structure: &PaperStructure,
        document_id: &str,
        checksum: Option<&str>,
    ) -> Result<(), GraphError> {
        let title = structure.paper_title().to_string();
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        match state
            .papers
            .iter_mut()
            .find(|paper| paper.title == title && paper.document_id == document_id)
        {
            Some(paper) => {
                if let Some(checksum) = checksum {
                    paper.checksum = Some(checksum.to_string());
                }
            }
            None => state.papers.push(PaperRecord {
                title: title.clone(),
                document_id: document_id.to_string(),
                checksum: checksum.map(str::to_string),
            }),
        }

        for author in &structure.authors {
            let name = author.name.trim().to_string();
            let exists = state
                .authors
                .iter()
                .any(|(document, stored)| document == document_id && stored.name == name);
            if !exists {
                state.authors.push((
                    document_id.to_string(),
                    AuthorRecord {
                        name: name.clone(),
                        ..author.clone()
                    },
                ));
            }
            state
                .authored
                .insert((document_id.to_string(), name, title.clone()));
        }

        for section in &structure.sections {
            let name = section.section_name.trim().to_string();
            let exists = state.sections.iter().any(|(document, stored)| {
                document == document_id
                    && stored.section_name == name
                    && stored.section_number == section.section_number
            });
            if !exists {
                state.sections.push((
                    document_id.to_string(),
                    SectionRecord {
                        section_name: name.clone(),
                        ..section.clone()
                    },
                ));
            }
            state.has_section.insert((
                document_id.to_string(),
                title.clone(),
                name,
                section.section_number.clone(),
            ));
        }

        Ok(())
    }

    async fn statistics(
        &self,
        document_id: &str,
        sample_limit: usize,
    ) -> Result<GraphStatistics, GraphError> {
        let state = self.state.read().await;
        let mut entities = HashSet::new();
        let mut relationships = 0u64;
        for edge in state.document_edges(document_id) {
            entities.insert(edge.key.subject.as_str());
            entities.insert(edge.key.object.as_str());
            relationships += 1;
        }

        Ok(GraphStatistics {
            entities: entities.len() as u64,
            relationships,
            samples: sample_rows(&state, document_id, sample_limit),
        })
    }

    async fn sample(&self, document_id: &str, limit: usize) -> Result<Vec<SampleRow>, GraphError> {
        let state = self.state.read().await;
        Ok(sample_rows(&state, document_id, limit))
    }

    async fn search_relationships(
        &self,
        document_id: &str,
        term: &str,
        limit: usize,
    ) -> Result<Vec<RelationshipRecord>, GraphError> {
        let term = term.to_lowercase();
        let state = self.state.read().await;

        Ok(state
            .document_edges(document_id)
            .filter(|edge| {
                edge.key.subject.to_lowercase().contains(&term)
                    || edge.key.object.to_lowercase().contains(&term)
            })
            .take(limit)
            .map(|edge| RelationshipRecord {
                subject: edge.key.subject.clone(),
                subject_type: state.entity_type(document_id, &edge.key.subject),
                relation: edge.key.relation.clone(),
                object: edge.key.object.clone(),
                object_type: state.entity_type(document_id, &edge.key.object),
                evidence: edge.evidence.clone(),
                page: edge.page,
                confidence: edge.confidence,
            })
            .collect())
    }

    async fn entity_relationships(
        &self,
        document_id: &str,
        entity: &str,
        limit: usize,
    ) -> Result<Vec<EntityRelationship>, GraphError> {
        let entity = entity.to_lowercase();
        let state = self.state.read().await;

        Ok(state
            .document_edges(document_id)
            .filter(|edge| edge.key.subject.to_lowercase().contains(&entity))
            .take(limit)
            .map(|edge| EntityRelationship {
                subject: edge.key.subject.clone(),
                relation: edge.key.relation.clone(),
                object: edge.key.object.clone(),
                evidence: Some(edge.evidence.clone()),
            })
            .collect())
    }

    async fn find_paths(
        &self,
        document_id: &str,
        query: &str,
        max_hops: usize,
        limit: usize,
    ) -> Result<Vec<GraphPath>, GraphError> {
        let query = query.to_lowercase();
        let state = self.state.read().await;
        let edges: Vec<&StoredEdge> = state.document_edges(document_id).collect();

        let matches_query = |path: &[usize]| {
            let (Some(first), Some(last)) = (path.first(), path.last()) else {
                return false;
            };
            edges[*first].key.subject.to_lowercase().contains(&query)
                || edges[*last].key.object.to_lowercase().contains(&query)
        };

        let mut found = Vec::new();
        let mut frontier: Vec<Vec<usize>> = (0..edges.len()).map(|index| vec![index]).collect();

        for _ in 0..max_hops.max(1) {
            found.extend(frontier.iter().filter(|path| matches_query(path)).cloned());
            if found.len() >= limit || frontier.is_empty() {
                break;
            }

            // Extend by one edge; a path never reuses an edge.
            frontier = frontier
                .iter()
                .flat_map(|path| {
                    let tail = path.last().map(|index| &edges[*index].key.object);
                    edges
                        .iter()
                        .enumerate()
                        .filter(move |(index, edge)| {
                            Some(&edge.key.subject) == tail && !path.contains(index)
                        })
                        .map(move |(index, _)| {
                            let mut extended = path.clone();
                            extended.push(index);
                            extended
                        })
                })
                .collect();
        }

        found.truncate(limit);
        Ok(found
            .into_iter()
            .map(|path| {
                let mut entities = Vec::with_capacity(path.len() + 1);
                if let Some(first) = path.first() {
                    entities.push(edges[*first].key.subject.clone());
                }
                entities.extend(path.iter().map(|index| edges[*index].key.object.clone()));

                GraphPath {
                    entities,
                    relations: path
                        .iter()
                        .map(|index| edges[*index].key.relation.clone())
                        .collect(),
                    evidence: path
                        .iter()
                        .map(|index| Some(edges[*index].evidence.clone()))
                        .collect(),
                }
            })
            .collect())
    }

    async fn paper(&self, document_id: &str) -> Result<Option<PaperRecord>, GraphError> {
        let state = self.state.read().await;
        Ok(state
            .papers
            .iter()
            .find(|paper| paper.document_id == document_id)
            .cloned())
    }

    async fn authors(&self, document_id: &str) -> Result<Vec<AuthorRecord>, GraphError> {
        let state = self.state.read().await;
        let mut authors: Vec<AuthorRecord> = state
            .authors
            .iter()
            .filter(|(document, author)| {
                document == document_id
                    && state
                        .authored
                        .iter()
                        .any(|(linked, name, _)| linked == document_id && *name == author.name)
            })
            .map(|(_, author)| author.clone())
            .collect();
        authors.sort_by(|left, right| left.name.cmp(&right.name));
        Ok(authors)
    }

    async fn sections(&self, document_id: &str) -> Result<Vec<SectionRecord>, GraphError> {
        let state = self.state.read().await;
        let mut sections: Vec<SectionRecord> = state
            .sections
            .iter()
            .filter(|(document, section)| {
                document == document_id
                    && state.has_section.iter().any(|(linked, _, name, number)| {
                        linked == document_id
                            && *name == section.section_name
                            && *number == section.section_number
                    })
            })
            .map(|(_, section)| section.clone())
            .collect();
        sections.sort_by_key(|section| section.start_page.number().unwrap_or(u32::MAX));
        Ok(sections)
    }
}

fn sample_rows(state: &GraphState, document_id: &str, limit: usize) -> Vec<SampleRow> {
    state
        .document_edges(document_id)
        .take(limit)
        .map(|edge| SampleRow {
            subject: edge.key.subject.clone(),
            relation: edge.key.relation.clone(),
            object: edge.key.object.clone(),
        })
        .collect()
}
