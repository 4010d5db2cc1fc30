use crate::error::GraphError;
use crate::models::{
    AuthorRecord, EntityRelationship, GraphPath, GraphStatistics, PaperRecord, PaperStructure,
    RelationshipRecord, SampleRow, SectionRecord, Triple,
};
use crate::traits::KnowledgeGraph;
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};
use url::Url;

const ENTITY_CONSTRAINT: &str = r#"
    CREATE CONSTRAINT entity_name_document IF NOT EXISTS
    FOR (e:Entity) REQUIRE (e.name, e.document_id) IS UNIQUE
"#;

const UPSERT_TRIPLES: &str = r#"
    UNWIND $rows AS row
    MERGE (s:Entity {name: row.subject, document_id: $document_id})
      ON CREATE SET s.type = row.subject_type
    MERGE (o:Entity {name: row.object, document_id: $document_id})
      ON CREATE SET o.type = row.object_type
    MERGE (s)-[r:RELATED {type: row.relation, source: $source, document_id: $document_id}]->(o)
      ON CREATE SET r.evidence = row.evidence,
                    r.page = row.page,
                    r.confidence = row.confidence,
                    r.formality_level = row.formality_level,
                    r.formal_notation = row.formal_notation
    RETURN count(r) AS written
"#;

const CLEAR_EDGES: &str = r#"
    MATCH (:Entity)-[r:RELATED {document_id: $document_id}]->(:Entity)
    DELETE r
"#;

const UPSERT_PAPER: &str = r#"
    MERGE (p:Paper {title: $title, document_id: $document_id})
    SET p.checksum = coalesce($checksum, p.checksum)
"#;

const UPSERT_AUTHORS: &str = r#"
    MATCH (p:Paper {title: $title, document_id: $document_id})
    UNWIND $authors AS author
    MERGE (a:Author {name: author.name, document_id: $document_id})
      ON CREATE SET a.email = author.email, a.affiliations = author.affiliations
    MERGE (a)-[:AUTHORED]->(p)
"#;

const UPSERT_SECTIONS: &str = r#"
    MATCH (p:Paper {title: $title, document_id: $document_id})
    UNWIND $sections AS section
    MERGE (s:Section {section_name: section.section_name,
                      section_number: section.section_number,
                      document_id: $document_id})
      ON CREATE SET s.start_page = section.start_page,
                    s.confidence = section.confidence,
                    s.content = section.content
    MERGE (p)-[:HAS_SECTION]->(s)
"#;

const COUNT_GRAPH: &str = r#"
    MATCH (a:Entity)-[r:RELATED {document_id: $document_id}]->(b:Entity)
    WITH collect(r) AS edges, collect(a) + collect(b) AS endpoints
    UNWIND (CASE WHEN size(endpoints) = 0 THEN [null] ELSE endpoints END) AS e
    RETURN count(DISTINCT e) AS entities, size(edges) AS relationships
"#;

const SAMPLE_EDGES: &str = r#"
    MATCH (a:Entity)-[r:RELATED {document_id: $document_id}]->(b:Entity)
    RETURN a.name AS subject, r.type AS relation, b.name AS object
    LIMIT $limit
"#;

const SEARCH_EDGES: &str = r#"
    MATCH (n:Entity)-[r:RELATED {document_id: $document_id}]->(m:Entity)
    WHERE toLower(n.name) CONTAINS $term OR toLower(m.name) CONTAINS $term
    RETURN n.name AS subject, n.type AS subject_type,
           r.type AS relation, r.evidence AS evidence,
           r.page AS page, r.confidence AS confidence,
           m.name AS object, m.type AS object_type
    LIMIT $limit
"#;

const ENTITY_EDGES: &str = r#"
    MATCH (e:Entity)-[r:RELATED {document_id: $document_id}]->(target:Entity)
    WHERE toLower(e.name) CONTAINS $entity
    RETURN e.name AS subject, r.type AS relation, target.name AS object, r.evidence AS evidence
    LIMIT $limit
"#;

const PAPER: &str = r#"
    MATCH (p:Paper {document_id: $document_id})
    RETURN p.title AS title, p.document_id AS document_id, p.checksum AS checksum
    LIMIT 1
"#;

const AUTHORS: &str = r#"
    MATCH (a:Author {document_id: $document_id})-[:AUTHORED]->(:Paper {document_id: $document_id})
    RETURN DISTINCT a.name AS name, a.affiliations AS affiliations, a.email AS email
    ORDER BY name
"#;

const SECTIONS: &str = r#"
    MATCH (:Paper {document_id: $document_id})-[:HAS_SECTION]->(s:Section)
    RETURN DISTINCT s.section_name AS section_name, s.section_number AS section_number,
           s.start_page AS start_page, s.confidence AS confidence, s.content AS content
    ORDER BY start_page, section_number
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessMode {
    Read,
    Write,
}

impl AccessMode {
    fn header(self) -> &'static str {
        match self {
            Self::Read => "READ",
            Self::Write => "WRITE",
        }
    }
}

/// Knowledge graph stored in Neo4j through the HTTP transactional API.
///
/// Each trait call is one `tx/commit` request, so every logical operation
/// commits or fails as a unit. The `reqwest::Client` is the connection pool
/// and is meant to be shared.
pub struct Neo4jGraph {
    endpoint: String,
    database: String,
    username: String,
    password: String,
    client: Client,
}

impl Neo4jGraph {
    pub fn new(
        endpoint: impl Into<String>,
        database: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        client: Client,
    ) -> Result<Self, GraphError> {
        let endpoint = endpoint.into();
        Url::parse(&endpoint)?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            database: database.into(),
            username: username.into(),
            password: password.into(),
            client,
        })
    }

    fn tx_url(&self) -> String {
        format!("{}/db/{}/tx/commit", self.endpoint, self.database)
    }

    async fn commit(&self, mode: AccessMode, statements: Vec<Value>) -> Result<Value, GraphError> {
        let response = self
            .client
            .post(self.tx_url())
            .basic_auth(&self.username, Some(&self.password))
            .header("access-mode", mode.header())
            .json(&json!({ "statements": statements }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GraphError::BackendResponse {
                backend: "neo4j".to_string(),
                details: format!("{status}: {body}"),
            });
        }

        let body: Value = response.json().await?;
        check_errors(&body)?;
        Ok(body)
    }

    async fn query<T: DeserializeOwned>(
        &self,
        statement: &str,
        parameters: Value,
    ) -> Result<Vec<T>, GraphError> {
        let body = self
            .commit(AccessMode::Read, vec![statement_json(statement, parameters)])
            .await?;
        decode_records(&body, 0)
    }
}

fn statement_json(statement: &str, parameters: Value) -> Value {
    json!({ "statement": statement, "parameters": parameters })
}

fn check_errors(body: &Value) -> Result<(), GraphError> {
    let first = body
        .get("errors")
        .and_then(Value::as_array)
        .and_then(|errors| errors.first());

    match first {
        Some(error) => Err(GraphError::Statement {
            code: error
                .get("code")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }),
        None => Ok(()),
    }
}

/// Rows of the `index`-th statement result, each keyed by its column name.
fn result_records(payload: &Value, index: usize) -> Vec<Map<String, Value>> {
    let Some(result) = payload
        .get("results")
        .and_then(Value::as_array)
        .and_then(|results| results.get(index))
    else {
        return Vec::new();
    };

    let columns: Vec<&str> = result
        .get("columns")
        .and_then(Value::as_array)
        .map(|columns| columns.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    result
        .get("data")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(|entry| entry.get("row").or(Some(entry)))
                .filter_map(Value::as_array)
                .map(|values| {
                    columns
                        .iter()
                        .zip(values)
                        .map(|(column, value)| (column.to_string(), value.clone()))
                        .collect()
                })
                .collect()
        })
        .unwrap_or_default()
}

fn decode_records<T: DeserializeOwned>(payload: &Value, index: usize) -> Result<Vec<T>, GraphError> {
    result_records(payload, index)
        .into_iter()
        .map(|record| serde_json::from_value(Value::Object(record)).map_err(GraphError::from))
        .collect()
}

fn count_column(payload: &Value, column: &str) -> u64 {
    result_records(payload, 0)
        .first()
        .and_then(|record| record.get(column))
        .and_then(Value::as_u64)
        .unwrap_or_default()
}

fn triple_rows(triples: &[Triple]) -> Vec<Value> {
    triples
        .iter()
        .map(|triple| {
            json!({
                "subject": triple.subject,
                "subject_type": triple.subject_type.as_str(),
                "relation": triple.relation,
                "object": triple.object,
                "object_type": triple.object_type.as_str(),
                "evidence": triple.evidence,
                "page": triple.page,
                "confidence": triple.confidence.as_str(),
                "formality_level": triple.formality_level.as_str(),
                "formal_notation": triple.formal_notation,
            })
        })
        .collect()
}

#[async_trait]
impl KnowledgeGraph for Neo4jGraph {
    async fn initialize(&self) -> Result<(), GraphError> {
        match self
            .commit(AccessMode::Write, vec![statement_json(ENTITY_CONSTRAINT, json!({}))])
            .await
        {
            Ok(_) => {
                debug!("entity constraint ensured");
                Ok(())
            }
            // Servers without composite constraints reject the statement
            // itself; the graph still works without it.
            Err(error @ GraphError::Statement { .. }) => {
                warn!(%error, "could not create entity constraint");
                Ok(())
            }
            Err(error) => {
                error!(%error, "neo4j is unreachable or rejected the credentials");
                Err(error)
            }
        }
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

        let body = self
            .commit(
                AccessMode::Write,
                vec![statement_json(
                    UPSERT_TRIPLES,
                    json!({
                        "rows": triple_rows(triples),
                        "document_id": document_id,
                        "source": source,
                    }),
                )],
            )
            .await?;

        info!(
            document_id,
            sent = triples.len(),
            written = count_column(&body, "written"),
            "stored triples"
        );
        Ok(triples.len())
    }

    async fn clear_graph(&self, document_id: &str) -> Result<(), GraphError> {
        self.commit(
            AccessMode::Write,
            vec![statement_json(CLEAR_EDGES, json!({ "document_id": document_id }))],
        )
        .await?;
        info!(document_id, "cleared document edges");
        Ok(())
    }

    async fn build_structured_graph(
        &self,
        structure: &PaperStructure,
        document_id: &str,
        checksum: Option<&str>,
    ) -> Result<(), GraphError> {
        let title = structure.paper_title();
        let authors: Vec<Value> = structure
            .authors
            .iter()
            .map(|author| {
                json!({
                    "name": author.name.trim(),
                    "affiliations": author.affiliations,
                    "email": author.email,
                })
            })
            .collect();
        let sections: Vec<Value> = structure
            .sections
            .iter()
            .map(|section| {
                json!({
                    "section_name": section.section_name.trim(),
                    "section_number": section.section_number,
                    "start_page": section.start_page,
                    "confidence": section.confidence.as_str(),
                    "content": section.content,
                })
            })
            .collect();

        let scope = |extra: Value| {
            let mut parameters = json!({ "title": title, "document_id": document_id });
            if let (Some(target), Value::Object(extra)) = (parameters.as_object_mut(), extra) {
                target.extend(extra);
            }
            parameters
        };

        self.commit(
            AccessMode::Write,
            vec![
                statement_json(UPSERT_PAPER, scope(json!({ "checksum": checksum }))),
                statement_json(UPSERT_AUTHORS, scope(json!({ "authors": authors }))),
                statement_json(UPSERT_SECTIONS, scope(json!({ "sections": sections }))),
            ],
        )
        .await?;

        info!(
            document_id,
            title,
            authors = structure.authors.len(),
            sections = structure.sections.len(),
            "stored document structure"
        );
        Ok(())
    }

    async fn statistics(
        &self,
        document_id: &str,
        sample_limit: usize,
    ) -> Result<GraphStatistics, GraphError> {
        let body = self
            .commit(
                AccessMode::Read,
                vec![
                    statement_json(COUNT_GRAPH, json!({ "document_id": document_id })),
                    statement_json(
                        SAMPLE_EDGES,
                        json!({ "document_id": document_id, "limit": sample_limit }),
                    ),
                ],
            )
            .await?;

        Ok(GraphStatistics {
            entities: count_column(&body, "entities"),
            relationships: count_column(&body, "relationships"),
            samples: decode_records(&body, 1)?,
        })
    }

    async fn sample(&self, document_id: &str, limit: usize) -> Result<Vec<SampleRow>, GraphError> {
        self.query(SAMPLE_EDGES, json!({ "document_id": document_id, "limit": limit }))
            .await
    }

    async fn search_relationships(
        &self,
        document_id: &str,
        term: &str,
        limit: usize,
    ) -> Result<Vec<RelationshipRecord>, GraphError> {
        self.query(
            SEARCH_EDGES,
            json!({ "document_id": document_id, "term": term.to_lowercase(), "limit": limit }),
        )
        .await
    }

    async fn entity_relationships(
        &self,
        document_id: &str,
        entity: &str,
        limit: usize,
    ) -> Result<Vec<EntityRelationship>, GraphError> {
        self.query(
            ENTITY_EDGES,
            json!({ "document_id": document_id, "entity": entity.to_lowercase(), "limit": limit }),
        )
        .await
    }

    async fn find_paths(
        &self,
        document_id: &str,
        query: &str,
        max_hops: usize,
        limit: usize,
    ) -> Result<Vec<GraphPath>, GraphError> {
        // Cypher cannot parameterize a variable-length bound.
        let statement = format!(
            r#"
            MATCH path = (start:Entity)-[:RELATED*1..{hops}]->(end:Entity)
            WHERE (toLower(start.name) CONTAINS $query OR toLower(end.name) CONTAINS $query)
              AND ALL(rel IN relationships(path) WHERE rel.document_id = $document_id)
            WITH path, length(path) AS hops
            ORDER BY hops
            LIMIT $limit
            RETURN [node IN nodes(path) | node.name] AS entities,
                   [rel IN relationships(path) | rel.type] AS relations,
                   [rel IN relationships(path) | rel.evidence] AS evidence
            "#,
            hops = max_hops.max(1)
        );

        self.query(
            &statement,
            json!({ "document_id": document_id, "query": query.to_lowercase(), "limit": limit }),
        )
        .await
    }

    async fn paper(&self, document_id: &str) -> Result<Option<PaperRecord>, GraphError> {
        let records: Vec<PaperRecord> = self
            .query(PAPER, json!({ "document_id": document_id }))
            .await?;
        Ok(records.into_iter().next())
    }

    async fn authors(&self, document_id: &str) -> Result<Vec<AuthorRecord>, GraphError> {
        self.query(AUTHORS, json!({ "document_id": document_id })).await
    }

    async fn sections(&self, document_id: &str) -> Result<Vec<SectionRecord>, GraphError> {
        self.query(SECTIONS, json!({ "document_id": document_id })).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Confidence, EntityType, FormalityLevel, PageRef, SampleRow};
    use mockito::{Matcher, Server};

    #[test]
    fn records_are_keyed_by_column() {
        let payload = json!({
            "results": [{
                "columns": ["subject", "subject_type", "relation", "evidence", "page", "confidence", "object", "object_type"],
                "data": [
                    {"row": ["ReAct", "Algorithm", "enables", "ReAct enables tool use", 1, "high", "Tool use", null], "meta": []},
                    {"row": ["ReAct", null, "uses", null, "NAN", null, "Reasoning", "Concept"], "meta": []}
                ]
            }],
            "errors": []
        });

        let records: Vec<RelationshipRecord> = decode_records(&payload, 0).expect("rows decode");

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].subject_type, EntityType::Algorithm);
        assert_eq!(records[0].object_type, EntityType::Concept);
        assert_eq!(records[0].page, PageRef::Number(1));
        assert_eq!(records[0].confidence, Confidence::High);
        assert_eq!(records[1].evidence, "");
        assert_eq!(records[1].page, PageRef::Unknown);
        assert_eq!(records[1].confidence, Confidence::Medium);
    }

    #[test]
    fn later_statement_results_are_addressable() {
        let payload = json!({
            "results": [
                {"columns": ["entities", "relationships"], "data": [{"row": [3, 2]}]},
                {"columns": ["subject", "relation", "object"], "data": [{"row": ["A", "uses", "B"]}]}
            ],
            "errors": []
        });

        assert_eq!(count_column(&payload, "entities"), 3);
        assert_eq!(count_column(&payload, "relationships"), 2);
        let samples: Vec<SampleRow> = decode_records(&payload, 1).expect("samples decode");
        assert_eq!(samples[0].object, "B");
        assert!(decode_records::<SampleRow>(&payload, 5).expect("missing result").is_empty());
    }

    #[test]
    fn path_rows_decode_with_missing_evidence() {
        let payload = json!({
            "results": [{
                "columns": ["entities", "relations", "evidence"],
                "data": [{"row": [["A", "B", "C"], ["feeds", "drives"], ["A feeds B", null]]}]
            }],
            "errors": []
        });

        let paths: Vec<GraphPath> = decode_records(&payload, 0).expect("paths decode");
        assert_eq!(paths[0].len(), 2);
        assert_eq!(paths[0].evidence, vec![Some("A feeds B".to_string()), None]);
    }

    #[test]
    fn statement_errors_surface() {
        let payload = json!({
            "results": [],
            "errors": [{"code": "Neo.ClientError.Statement.SyntaxError", "message": "bad cypher"}]
        });

        match check_errors(&payload) {
            Err(GraphError::Statement { code, message }) => {
                assert_eq!(code, "Neo.ClientError.Statement.SyntaxError");
                assert_eq!(message, "bad cypher");
            }
            other => panic!("expected statement error, got {other:?}"),
        }
        assert!(check_errors(&json!({"results": [], "errors": []})).is_ok());
    }

    #[test]
    fn endpoint_must_be_a_url() {
        assert!(Neo4jGraph::new("not a url", "neo4j", "neo4j", "pw", Client::new()).is_err());

        let graph = Neo4jGraph::new("http://localhost:7474/", "neo4j", "neo4j", "pw", Client::new())
            .expect("valid endpoint");
        assert_eq!(graph.tx_url(), "http://localhost:7474/db/neo4j/tx/commit");
    }

    fn graph_at(url: &str) -> Neo4jGraph {
        Neo4jGraph::new(url, "neo4j", "neo4j", "secret", Client::new()).expect("valid endpoint")
    }

    fn designed_for() -> Triple {
        Triple {
            subject: "ReAct".to_string(),
            subject_type: EntityType::Algorithm,
            relation: "is_designed_for".to_string(),
            object: "Question answering".to_string(),
            object_type: EntityType::Concept,
            evidence: "ReAct is designed for question answering.".to_string(),
            formality_level: FormalityLevel::Conceptual,
            formal_notation: None,
            page: PageRef::Number(2),
            confidence: Confidence::High,
            source: String::new(),
            document_id: String::new(),
        }
    }

    #[tokio::test]
    async fn empty_batch_sends_no_request() {
        let mut server = Server::new_async().await;
        let commit = server
            .mock("POST", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let written = graph_at(&server.url())
            .store_triples_batch("doc-1", &[], "react.pdf")
            .await
            .expect("empty batch is a no-op");

        assert_eq!(written, 0);
        commit.assert_async().await;
    }

    #[tokio::test]
    async fn batch_is_one_scoped_write_commit() {
        let mut server = Server::new_async().await;
        let commit = server
            .mock("POST", "/db/neo4j/tx/commit")
            .match_header("access-mode", "WRITE")
            .match_header("authorization", Matcher::Regex("^Basic ".to_string()))
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex(r#"UNWIND \$rows"#.to_string()),
                Matcher::Regex(r#""relation":"is_designed_for""#.to_string()),
                Matcher::Regex(r#""document_id":"doc-1""#.to_string()),
                Matcher::Regex(r#""source":"react.pdf""#.to_string()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "results": [{"columns": ["written"], "data": [{"row": [1], "meta": [null]}]}],
                    "errors": []
                })
                .to_string(),
            )
            .expect(1)
            .create_async()
            .await;

        let written = graph_at(&server.url())
            .store_triples_batch("doc-1", &[designed_for()], "react.pdf")
            .await
            .expect("batch is stored");

        assert_eq!(written, 1);
        commit.assert_async().await;
    }

    #[tokio::test]
    async fn errors_in_a_commit_body_become_statement_errors() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/db/neo4j/tx/commit")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "results": [],
                    "errors": [{"code": "Neo.ClientError.Schema.ConstraintValidationFailed", "message": "duplicate"}]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let result = graph_at(&server.url())
            .store_triples_batch("doc-1", &[designed_for()], "react.pdf")
            .await;

        assert!(matches!(
            result,
            Err(GraphError::Statement { ref code, .. }) if code == "Neo.ClientError.Schema.ConstraintValidationFailed"
        ));
    }

    #[tokio::test]
    async fn rejected_credentials_fail_initialize() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/db/neo4j/tx/commit")
            .with_status(401)
            .with_body("unauthorized")
            .create_async()
            .await;

        let result = graph_at(&server.url()).initialize().await;

        assert!(matches!(
            result,
            Err(GraphError::BackendResponse { ref details, .. }) if details.starts_with("401")
        ));
    }

    #[tokio::test]
    async fn unsupported_constraint_does_not_fail_initialize() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/db/neo4j/tx/commit")
            .match_header("access-mode", "WRITE")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "results": [],
                    "errors": [{"code": "Neo.ClientError.Statement.SyntaxError", "message": "composite constraints unsupported"}]
                })
                .to_string(),
            )
            .create_async()
            .await;

        assert!(graph_at(&server.url()).initialize().await.is_ok());
    }

    #[tokio::test]
    async fn samples_are_a_read_query() {
        let mut server = Server::new_async().await;
        let read = server
            .mock("POST", "/db/neo4j/tx/commit")
            .match_header("access-mode", "READ")
            .match_body(Matcher::Regex(r#""limit":5"#.to_string()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "results": [{
                        "columns": ["subject", "relation", "object"],
                        "data": [{"row": ["ReAct", "is_designed_for", "Question answering"]}]
                    }],
                    "errors": []
                })
                .to_string(),
            )
            .expect(1)
            .create_async()
            .await;

        let rows = graph_at(&server.url())
            .sample("doc-1", 5)
            .await
            .expect("samples decode");

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].relation, "is_designed_for");
        read.assert_async().await;
    }
}
