//! Query-time retrieval over a project's collection

use minirag_core::{
    collection_name, CollectionInfo, EmbeddingKind, EmbeddingProvider, Result, SearchResult,
};
use minirag_vector::VectorStore;
use std::sync::Arc;

/// Default number of matches returned by a search
pub const DEFAULT_SEARCH_LIMIT: usize = 10;

/// Result of a retrieval
#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome {
    /// Ranked matches, best first
    Matches(Vec<SearchResult>),

    /// The provider produced no usable query vector
    NoEmbedding,

    /// The collection is missing, empty, or nothing matched
    NoMatches,
}

impl SearchOutcome {
    /// Collapse to matches, treating both empty outcomes alike
    pub fn into_matches(self) -> Option<Vec<SearchResult>> {
        match self {
            Self::Matches(results) => Some(results),
            Self::NoEmbedding | Self::NoMatches => None,
        }
    }
}

/// Embeds queries and searches the project's collection
#[derive(Clone)]
pub struct RetrievalService {
    vector_store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl RetrievalService {
    pub fn new(vector_store: Arc<dyn VectorStore>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            vector_store,
            embedder,
        }
    }

    /// Collection backing `project_id` for the current embedding width
    pub fn collection_for(&self, project_id: i64) -> String {
        collection_name(project_id, self.embedder.width())
    }

    /// Top `limit` matches for `query`
    pub async fn search(&self, project_id: i64, query: &str, limit: usize) -> Result<SearchOutcome> {
        let vectors = self
            .embedder
            .embed(&[query.to_string()], EmbeddingKind::Query)
            .await?;

        let Some(vector) = vectors.into_iter().next() else {
            tracing::warn!(project_id, "Query produced no embedding");
            return Ok(SearchOutcome::NoEmbedding);
        };
        if vector.is_empty() || vector.len() != self.embedder.width() {
            tracing::warn!(project_id, width = vector.len(), "Query embedding is unusable");
            return Ok(SearchOutcome::NoEmbedding);
        }

        let collection = self.collection_for(project_id);
        match self
            .vector_store
            .search_by_vector(&collection, &vector, limit)
            .await?
        {
            Some(results) if !results.is_empty() => Ok(SearchOutcome::Matches(results)),
            _ => Ok(SearchOutcome::NoMatches),
        }
    }

    pub async fn collection_info(&self, project_id: i64) -> Result<Option<CollectionInfo>> {
        self.vector_store
            .collection_info(&self.collection_for(project_id))
            .await
    }

    /// Drop the project's collection; `false` if there was none
    pub async fn reset_collection(&self, project_id: i64) -> Result<bool> {
        self.vector_store
            .delete_collection(&self.collection_for(project_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_matches() {
        let result = SearchResult {
            text: "apple".to_string(),
            score: 1.0,
            external_id: 1,
        };
        assert_eq!(
            SearchOutcome::Matches(vec![result.clone()]).into_matches(),
            Some(vec![result])
        );
        assert_eq!(SearchOutcome::NoEmbedding.into_matches(), None);
        assert_eq!(SearchOutcome::NoMatches.into_matches(), None);
    }
}
