pub mod agent;
pub mod chunking;
pub mod error;
pub mod extractor;
pub mod llm;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod query_terms;
pub mod stores;
pub mod structure;
pub mod tools;
pub mod traits;
pub mod triples;

pub use agent::{AnswerType, KnowledgeGraphAnswer, ReasoningAgent, DEFAULT_MAX_STEPS};
pub use chunking::{chunk_text, ChunkingConfig};
pub use error::{AgentError, BuildError, GraphError, IngestError, ModelError, StructureError};
pub use extractor::{
    extract_pages, ExtractionQuality, FetchedDocument, OcrEndpointConfig, PageText, PdfFetcher,
};
pub use llm::{CompletionModel, CompletionRequest, OpenAiCompatibleModel};
pub use models::{
    AuthorRecord, Confidence, DocumentFingerprint, EntityRelationship, EntityType,
    ExtractionOptions, FormalityLevel, GraphPath, GraphStatistics, PageRef, PaperRecord,
    PaperStructure, RelationshipRecord, SampleRow, SectionRecord, Triple,
};
pub use normalize::normalize_text;
pub use pipeline::{BuildReport, BuildTimings, KnowledgeGraphBuilder};
pub use stores::{MemoryGraph, Neo4jGraph};
pub use structure::StructureExtractor;
pub use tools::{GraphTools, ToolBox, ToolOutcome, ToolReply, ToolSpec};
pub use traits::{DocumentSource, KnowledgeGraph};
pub use triples::TripleExtractor;
