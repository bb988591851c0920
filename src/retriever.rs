//! Document retrieval for terminology questions
//!
//! The retriever sits over a pluggable vector store, filters hits by a
//! relevance threshold, and never propagates store failures: a broken
//! store degrades to an empty result set and the report stage explains
//! the absence of documents to the user.

use crate::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// One retrieved document chunk with its relevance score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub content: String,
    pub source: String,
    pub page: Option<u32>,
    pub score: f32,
}

/// Trait for similarity search over an indexed corpus
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Top-k chunks for a query, most relevant first, scores in [0, 1].
    async fn retrieve_with_scores(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>>;
}

pub struct Retriever {
    store: Arc<dyn VectorStore>,
    top_k: usize,
    threshold: f32,
}

impl Retriever {
    pub fn new(store: Arc<dyn VectorStore>, top_k: usize, threshold: f32) -> Self {
        Self {
            store,
            top_k,
            threshold,
        }
    }

    /// Retrieve chunks above the relevance threshold, best first.
    pub async fn retrieve(&self, query: &str) -> Vec<ScoredChunk> {
        info!(query = %query, top_k = self.top_k, "Retrieving documents");

        let chunks = match self.store.retrieve_with_scores(query, self.top_k).await {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!("Vector store retrieval failed: {}", e);
                return Vec::new();
            }
        };

        let mut relevant: Vec<ScoredChunk> = chunks
            .into_iter()
            .filter(|chunk| chunk.score >= self.threshold)
            .collect();
        relevant.sort_by(|a, b| b.score.total_cmp(&a.score));

        info!(count = relevant.len(), "Documents above threshold");
        relevant
    }
}

/// In-memory store scoring by token overlap. Stands in for a real
/// embedding index in development and tests.
#[derive(Default)]
pub struct InMemoryVectorStore {
    chunks: Vec<ScoredChunk>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, content: &str, source: &str, page: Option<u32>) {
        self.chunks.push(ScoredChunk {
            content: content.to_string(),
            source: source.to_string(),
            page,
            score: 0.0,
        });
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn retrieve_with_scores(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>> {
        let query_tokens: HashSet<String> = tokenize(query);
        if query_tokens.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<ScoredChunk> = self
            .chunks
            .iter()
            .map(|chunk| {
                let chunk_tokens = tokenize(&chunk.content);
                let overlap = query_tokens.intersection(&chunk_tokens).count();
                ScoredChunk {
                    score: overlap as f32 / query_tokens.len() as f32,
                    ..chunk.clone()
                }
            })
            .collect();

        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        Ok(scored)
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(|token| {
            token
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|token| !token.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkflowError;

    struct FixedStore(Vec<ScoredChunk>);

    #[async_trait]
    impl VectorStore for FixedStore {
        async fn retrieve_with_scores(&self, _query: &str, k: usize) -> Result<Vec<ScoredChunk>> {
            Ok(self.0.iter().take(k).cloned().collect())
        }
    }

    struct FailingStore;

    #[async_trait]
    impl VectorStore for FailingStore {
        async fn retrieve_with_scores(&self, _query: &str, _k: usize) -> Result<Vec<ScoredChunk>> {
            Err(WorkflowError::Retrieval("index unavailable".to_string()))
        }
    }

    fn chunk(content: &str, score: f32) -> ScoredChunk {
        ScoredChunk {
            content: content.to_string(),
            source: "glossary.pdf".to_string(),
            page: Some(3),
            score,
        }
    }

    #[tokio::test]
    async fn test_threshold_filters_and_orders() {
        let store = FixedStore(vec![
            chunk("low", 0.2),
            chunk("high", 0.9),
            chunk("mid", 0.5),
        ]);
        let retriever = Retriever::new(Arc::new(store), 5, 0.3);
        let results = retriever.retrieve("나스닥").await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].content, "high");
        assert_eq!(results[1].content, "mid");
    }

    #[tokio::test]
    async fn test_empty_store_is_empty_result() {
        let retriever = Retriever::new(Arc::new(FixedStore(Vec::new())), 5, 0.3);
        assert!(retriever.retrieve("나스닥").await.is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_degrades_to_empty() {
        let retriever = Retriever::new(Arc::new(FailingStore), 5, 0.3);
        assert!(retriever.retrieve("나스닥").await.is_empty());
    }

    #[tokio::test]
    async fn test_in_memory_overlap_scoring() {
        let mut store = InMemoryVectorStore::new();
        store.add("나스닥은 미국의 장외 주식시장입니다", "terms.md", Some(1));
        store.add("김치는 한국의 전통 음식입니다", "food.md", None);

        let results = store.retrieve_with_scores("나스닥은 뭐야", 5).await.unwrap();
        assert_eq!(results[0].source, "terms.md");
        assert!(results[0].score > results[1].score);
    }
}
