use crate::error::BuildError;
use crate::extractor::{render_page_marked, ExtractionQuality};
use crate::llm::CompletionModel;
use crate::models::{DocumentFingerprint, ExtractionOptions};
use crate::normalize::normalize_text;
use crate::structure::StructureExtractor;
use crate::traits::{DocumentSource, KnowledgeGraph};
use crate::triples::TripleExtractor;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildTimings {
    pub fetch_ms: u64,
    pub extraction_ms: u64,
    pub store_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub fingerprint: DocumentFingerprint,
    pub pages: usize,
    pub triples_extracted: usize,
    pub triples_stored: usize,
    pub structure_stored: bool,
    pub timings: BuildTimings,
}

impl BuildReport {
    pub fn document_id(&self) -> &str {
        &self.fingerprint.document_id
    }
}

/// Fetches a document, extracts its structure and triples, and writes both
/// to the knowledge graph.
pub struct KnowledgeGraphBuilder<S, M, G> {
    source: S,
    structure: StructureExtractor<Arc<M>>,
    triples: TripleExtractor<Arc<M>>,
    graph: G,
}

impl<S, M, G> KnowledgeGraphBuilder<S, M, G>
where
    S: DocumentSource,
    M: CompletionModel,
    G: KnowledgeGraph,
{
    pub fn new(source: S, model: M, graph: G, options: ExtractionOptions) -> Self {
        let model = Arc::new(model);
        Self {
            source,
            structure: StructureExtractor::new(Arc::clone(&model)),
            triples: TripleExtractor::new(model, options),
            graph,
        }
    }

    /// Runs the whole build. Fetch and graph-write failures abort it; a
    /// failed structure extraction only means no structure nodes. Triples
    /// are written before the structure nodes.
    pub async fn build(
        &self,
        locator: &str,
        document_id: Option<&str>,
        quality: ExtractionQuality,
    ) -> Result<BuildReport, BuildError> {
        let started = Instant::now();
        let fetched = self.source.fetch_text(locator, quality).await?;
        let fetch_ms = elapsed_ms(started);

        let fingerprint = DocumentFingerprint {
            document_id: document_id
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            source_label: fetched.source_label,
            locator: locator.to_string(),
            checksum: fetched.checksum,
            ingested_at: Utc::now(),
        };
        let document_id = fingerprint.document_id.as_str();
        info!(
            document_id,
            source = %fingerprint.source_label,
            pages = fetched.pages.len(),
            "building knowledge graph"
        );

        let marked = render_page_marked(&fetched.pages);
        let normalized = normalize_text(&marked);

        let started = Instant::now();
        let (structure, mut triples) = tokio::join!(
            self.structure.extract(&normalized),
            self.triples.extract(&marked)
        );
        let extraction_ms = elapsed_ms(started);

        let started = Instant::now();
        self.graph.initialize().await?;

        for triple in &mut triples {
            triple.source = fingerprint.source_label.clone();
            triple.document_id = fingerprint.document_id.clone();
        }
        let triples_stored = self
            .graph
            .store_triples_batch(document_id, &triples, &fingerprint.source_label)
            .await?;

        let structure_stored = match structure {
            Ok(structure) => {
                let checksum = Some(fingerprint.checksum.as_str());
                self.graph
                    .build_structured_graph(&structure, document_id, checksum)
                    .await?;
                true
            }
            Err(error) => {
                warn!(document_id, %error, "structure extraction failed, skipping structure nodes");
                false
            }
        };
        let store_ms = elapsed_ms(started);

        info!(
            document_id,
            triples = triples_stored,
            structure_stored,
            fetch_ms,
            extraction_ms,
            store_ms,
            "knowledge graph built"
        );

        Ok(BuildReport {
            pages: fetched.pages.len(),
            triples_extracted: triples.len(),
            triples_stored,
            structure_stored,
            timings: BuildTimings {
                fetch_ms,
                extraction_ms,
                store_ms,
            },
            fingerprint,
        })
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GraphError, IngestError, ModelError};
    use crate::extractor::{FetchedDocument, PageText};
    use crate::llm::CompletionRequest;
    use crate::models::{
        AuthorRecord, EntityRelationship, GraphPath, GraphStatistics, PaperRecord, PaperStructure,
        RelationshipRecord, SampleRow, SectionRecord, Triple,
    };
    use crate::stores::MemoryGraph;
    use async_trait::async_trait;

    struct FakeSource {
        missing: bool,
    }

    #[async_trait]
    impl DocumentSource for FakeSource {
        async fn fetch_text(
            &self,
            locator: &str,
            _quality: ExtractionQuality,
        ) -> Result<FetchedDocument, IngestError> {
            if self.missing {
                return Err(IngestError::Fetch {
                    locator: locator.to_string(),
                    status: 404,
                });
            }
            Ok(FetchedDocument {
                source_label: "react.pdf".to_string(),
                checksum: "feedface".to_string(),
                pages: vec![
                    PageText {
                        number: 1,
                        text: "ReAct enables tool use.".to_string(),
                    },
                    PageText {
                        number: 2,
                        text: "ReAct outperforms chain of thought.".to_string(),
                    },
                ],
            })
        }
    }

    struct PaperModel {
        structure_reply: &'static str,
    }

    #[async_trait]
    impl CompletionModel for PaperModel {
        async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelError> {
            if request.system.contains("knowledge-graph triples") {
                return Ok(r#"{"triples": [
                    {"subject": "ReAct", "relation": "Enables", "object": "tool use", "evidence": "ReAct enables tool use.", "confidence": "high"},
                    {"subject": "ReAct", "relation": "outperforms", "object": "Chain of thought", "evidence": "ReAct outperforms chain of thought."},
                    {"subject": "react", "relation": "enables", "object": "Tool use", "evidence": "duplicate"}
                ]}"#
                .to_string());
            }
            Ok(self.structure_reply.to_string())
        }
    }

    const STRUCTURE: &str = r#"{"document_title": "ReAct", "authors": [{"name": "Shunyu Yao"}], "sections": [{"section_name": "Abstract", "start_page": 1, "content": "ReAct enables tool use."}]}"#;

    #[tokio::test]
    async fn build_stores_structure_and_triples() {
        let graph = Arc::new(MemoryGraph::new());
        let builder = KnowledgeGraphBuilder::new(
            FakeSource { missing: false },
            PaperModel {
                structure_reply: STRUCTURE,
            },
            Arc::clone(&graph),
            ExtractionOptions::default(),
        );

        let report = builder
            .build("react.pdf", Some("doc-1"), ExtractionQuality::Fast)
            .await
            .expect("build succeeds");

        assert_eq!(report.document_id(), "doc-1");
        assert_eq!(report.pages, 2);
        assert_eq!(report.triples_extracted, 2);
        assert_eq!(report.triples_stored, 2);
        assert!(report.structure_stored);

        let stats = graph.statistics("doc-1", 30).await.unwrap();
        assert_eq!(stats.relationships, 2);
        assert_eq!(stats.entities, 3);

        let paper = graph.paper("doc-1").await.unwrap().expect("paper node");
        assert_eq!(paper.checksum.as_deref(), Some("feedface"));

        let edges = graph.search_relationships("doc-1", "tool", 50).await.unwrap();
        assert_eq!(edges[0].relation, "enables");
        assert_eq!(edges[0].page.number(), Some(1));
    }

    #[tokio::test]
    async fn structure_failure_still_stores_triples() {
        let graph = Arc::new(MemoryGraph::new());
        let builder = KnowledgeGraphBuilder::new(
            FakeSource { missing: false },
            PaperModel {
                structure_reply: "I could not read this paper.",
            },
            Arc::clone(&graph),
            ExtractionOptions::default(),
        );

        let report = builder
            .build("react.pdf", None, ExtractionQuality::Fast)
            .await
            .expect("build succeeds");

        assert!(!report.structure_stored);
        assert_eq!(report.triples_stored, 2);
        assert!(Uuid::parse_str(report.document_id()).is_ok());
        assert!(graph.paper(report.document_id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fetch_failure_aborts_the_build() {
        let builder = KnowledgeGraphBuilder::new(
            FakeSource { missing: true },
            PaperModel {
                structure_reply: STRUCTURE,
            },
            MemoryGraph::new(),
            ExtractionOptions::default(),
        );

        let result = builder
            .build("https://example.org/missing.pdf", Some("doc-1"), ExtractionQuality::Fast)
            .await;

        assert!(matches!(
            result,
            Err(BuildError::Ingest(IngestError::Fetch { status: 404, .. }))
        ));
    }

    /// Delegates to a `MemoryGraph` but refuses structure writes.
    struct NoStructureGraph {
        inner: Arc<MemoryGraph>,
    }

    #[async_trait]
    impl KnowledgeGraph for NoStructureGraph {
        async fn initialize(&self) -> Result<(), GraphError> {
            self.inner.initialize().await
        }

        async fn store_triples_batch(
            &self,
            document_id: &str,
            triples: &[Triple],
            source: &str,
        ) -> Result<usize, GraphError> {
            self.inner.store_triples_batch(document_id, triples, source).await
        }

        async fn clear_graph(&self, document_id: &str) -> Result<(), GraphError> {
            self.inner.clear_graph(document_id).await
        }

        async fn build_structured_graph(
            &self,
            _structure: &PaperStructure,
            _document_id: &str,
            _checksum: Option<&str>,
        ) -> Result<(), GraphError> {
            Err(GraphError::Statement {
                code: "Neo.TransientError.Transaction.Terminated".to_string(),
                message: "terminated".to_string(),
            })
        }

        async fn statistics(
            &self,
            document_id: &str,
            sample_limit: usize,
        ) -> Result<GraphStatistics, GraphError> {
            self.inner.statistics(document_id, sample_limit).await
        }

        async fn sample(&self, document_id: &str, limit: usize) -> Result<Vec<SampleRow>, GraphError> {
            self.inner.sample(document_id, limit).await
        }

        async fn search_relationships(
            &self,
            document_id: &str,
            term: &str,
            limit: usize,
        ) -> Result<Vec<RelationshipRecord>, GraphError> {
            self.inner.search_relationships(document_id, term, limit).await
        }

        async fn entity_relationships(
            &self,
            document_id: &str,
            entity: &str,
            limit: usize,
        ) -> Result<Vec<EntityRelationship>, GraphError> {
            self.inner.entity_relationships(document_id, entity, limit).await
        }

        async fn find_paths(
            &self,
            document_id: &str,
            query: &str,
            max_hops: usize,
            limit: usize,
        ) -> Result<Vec<GraphPath>, GraphError> {
            self.inner.find_paths(document_id, query, max_hops, limit).await
        }

        async fn paper(&self, document_id: &str) -> Result<Option<PaperRecord>, GraphError> {
            self.inner.paper(document_id).await
        }

        async fn authors(&self, document_id: &str) -> Result<Vec<AuthorRecord>, GraphError> {
            self.inner.authors(document_id).await
        }

        async fn sections(&self, document_id: &str) -> Result<Vec<SectionRecord>, GraphError> {
            self.inner.sections(document_id).await
        }
    }

    #[tokio::test]
    async fn triples_survive_a_failed_structure_write() {
        let memory = Arc::new(MemoryGraph::new());
        let builder = KnowledgeGraphBuilder::new(
            FakeSource { missing: false },
            PaperModel {
                structure_reply: STRUCTURE,
            },
            NoStructureGraph {
                inner: Arc::clone(&memory),
            },
            ExtractionOptions::default(),
        );

        let result = builder
            .build("react.pdf", Some("doc-1"), ExtractionQuality::Fast)
            .await;

        assert!(matches!(
            result,
            Err(BuildError::Graph(GraphError::Statement { .. }))
        ));
        let stats = memory.statistics("doc-1", 30).await.unwrap();
        assert_eq!(stats.relationships, 2);
        assert!(memory.paper("doc-1").await.unwrap().is_none());
    }
}
