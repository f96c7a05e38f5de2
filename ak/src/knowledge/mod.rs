//! Knowledge store contract
//!
//! The store itself is an external collaborator; the runtime consumes it
//! read-mostly to enrich prompts. Failures degrade to empty results rather
//! than failing the task.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Error surfaced by a knowledge store implementation
#[derive(Debug, thiserror::Error)]
pub enum KnowledgeError {
    #[error("Knowledge store unavailable: {0}")]
    Unavailable(String),

    #[error("Document not found: {0}")]
    NotFound(String),
}

/// A document handed to `ingest`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub content: String,
}

/// One ranked search hit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub document_id: String,
    pub snippet: String,
    pub score: f64,
}

/// An entity extracted from a document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    pub kind: String,
}

/// Consumed knowledge store interface
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn ingest(&self, document: Document) -> Result<String, KnowledgeError>;

    async fn search(
        &self,
        query: &str,
        limit: usize,
        filters: &HashMap<String, String>,
    ) -> Result<Vec<SearchResult>, KnowledgeError>;

    async fn extract_entities(&self, document_id: &str) -> Result<Vec<Entity>, KnowledgeError>;
}

/// Store used when no knowledge backend is configured
///
/// Searches return nothing, ingest accepts and discards.
pub struct NoopKnowledgeStore;

#[async_trait]
impl KnowledgeStore for NoopKnowledgeStore {
    async fn ingest(&self, document: Document) -> Result<String, KnowledgeError> {
        Ok(document.id)
    }

    async fn search(
        &self,
        _query: &str,
        _limit: usize,
        _filters: &HashMap<String, String>,
    ) -> Result<Vec<SearchResult>, KnowledgeError> {
        Ok(Vec::new())
    }

    async fn extract_entities(&self, _document_id: &str) -> Result<Vec<Entity>, KnowledgeError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_store() {
        let store = NoopKnowledgeStore;

        let id = store
            .ingest(Document {
                id: "doc-1".to_string(),
                title: "t".to_string(),
                content: "c".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(id, "doc-1");

        let results = store.search("anything", 10, &HashMap::new()).await.unwrap();
        assert!(results.is_empty());

        let entities = store.extract_entities("doc-1").await.unwrap();
        assert!(entities.is_empty());
    }
}
