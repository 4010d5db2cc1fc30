use crate::error::{GraphError, IngestError};
use crate::extractor::{ExtractionQuality, FetchedDocument};
use crate::models::{
    AuthorRecord, EntityRelationship, GraphPath, GraphStatistics, PaperRecord, PaperStructure,
    RelationshipRecord, SampleRow, SectionRecord, Triple,
};
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Returns the readable pages behind `locator` in page order.
    async fn fetch_text(
        &self,
        locator: &str,
        quality: ExtractionQuality,
    ) -> Result<FetchedDocument, IngestError>;
}

/// Property graph of entity relationships, every record scoped by document id.
#[async_trait]
pub trait KnowledgeGraph: Send + Sync {
    /// Establishes the (name, document_id) uniqueness constraint. Safe to
    /// call repeatedly. A backend that cannot express the constraint is not
    /// an error; an unreachable or unauthorized one is.
    async fn initialize(&self) -> Result<(), GraphError>;

    /// Upserts all triples in one write and returns how many were sent.
    async fn store_triples_batch(
        &self,
        document_id: &str,
        triples: &[Triple],
        source: &str,
    ) -> Result<usize, GraphError>;

    /// Deletes every relationship edge of the document. Entity nodes stay.
    async fn clear_graph(&self, document_id: &str) -> Result<(), GraphError>;

    async fn build_structured_graph(
        &self,
        structure: &PaperStructure,
        document_id: &str,
        checksum: Option<&str>,
    ) -> Result<(), GraphError>;

    async fn statistics(
        &self,
        document_id: &str,
        sample_limit: usize,
    ) -> Result<GraphStatistics, GraphError>;

    /// The sample rows of `statistics` without the counts.
    async fn sample(&self, document_id: &str, limit: usize) -> Result<Vec<SampleRow>, GraphError>;

    /// Edges whose subject or object name contains `term`, ignoring case.
    async fn search_relationships(
        &self,
        document_id: &str,
        term: &str,
        limit: usize,
    ) -> Result<Vec<RelationshipRecord>, GraphError>;

    /// Outgoing edges of every entity whose name contains `entity`.
    async fn entity_relationships(
        &self,
        document_id: &str,
        entity: &str,
        limit: usize,
    ) -> Result<Vec<EntityRelationship>, GraphError>;

    /// Paths of 1 to `max_hops` edges, shortest first, that start or end at
    /// an entity whose name contains `query`.
    async fn find_paths(
        &self,
        document_id: &str,
        query: &str,
        max_hops: usize,
        limit: usize,
    ) -> Result<Vec<GraphPath>, GraphError>;

    async fn paper(&self, document_id: &str) -> Result<Option<PaperRecord>, GraphError>;

    async fn authors(&self, document_id: &str) -> Result<Vec<AuthorRecord>, GraphError>;

    async fn sections(&self, document_id: &str) -> Result<Vec<SectionRecord>, GraphError>;
}

#[async_trait]
impl<G: KnowledgeGraph + ?Sized> KnowledgeGraph for Arc<G> {
    async fn initialize(&self) -> Result<(), GraphError> {
        (**self).initialize().await
    }

    async fn store_triples_batch(
        &self,
        document_id: &str,
        triples: &[Triple],
        source: &str,
    ) -> Result<usize, GraphError> {
        (**self).store_triples_batch(document_id, triples, source).await
    }

    async fn clear_graph(&self, document_id: &str) -> Result<(), GraphError> {
        (**self).clear_graph(document_id).await
    }

    async fn build_structured_graph(
        &self,
        structure: &PaperStructure,
        document_id: &str,
        checksum: Option<&str>,
    ) -> Result<(), GraphError> {
        (**self)
            .build_structured_graph(structure, document_id, checksum)
            .await
    }

    async fn statistics(
        &self,
        document_id: &str,
        sample_limit: usize,
    ) -> Result<GraphStatistics, GraphError> {
        (**self).statistics(document_id, sample_limit).await
    }

    async fn sample(&self, document_id: &str, limit: usize) -> Result<Vec<SampleRow>, GraphError> {
        (**self).sample(document_id, limit).await
    }

    async fn search_relationships(
        &self,
        document_id: &str,
        term: &str,
        limit: usize,
    ) -> Result<Vec<RelationshipRecord>, GraphError> {
        (**self).search_relationships(document_id, term, limit).await
    }

    async fn entity_relationships(
        &self,
        document_id: &str,
        entity: &str,
        limit: usize,
    ) -> Result<Vec<EntityRelationship>, GraphError> {
        (**self).entity_relationships(document_id, entity, limit).await
    }

    async fn find_paths(
        &self,
        document_id: &str,
        query: &str,
        max_hops: usize,
        limit: usize,
    ) -> Result<Vec<GraphPath>, GraphError> {
        (**self).find_paths(document_id, query, max_hops, limit).await
    }

    async fn paper(&self, document_id: &str) -> Result<Option<PaperRecord>, GraphError> {
        (**self).paper(document_id).await
    }

    async fn authors(&self, document_id: &str) -> Result<Vec<AuthorRecord>, GraphError> {
        (**self).authors(document_id).await
    }

    async fn sections(&self, document_id: &str) -> Result<Vec<SectionRecord>, GraphError> {
        (**self).sections(document_id).await
    }
}
