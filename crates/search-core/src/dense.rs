use std::sync::Arc;

use async_trait::async_trait;
use common::{Query, RagError, RagResult, RetrievalResult, Similarity};
use embeddings::{cosine_similarity, dot_product};
use rayon::prelude::*;
use tracing::debug;

use crate::{
    index::{DenseIndex, IndexStore, check_vector},
    retrieval::{RetrievalDefaults, Retriever, positive, to_result, top_k_positions},
};

/// Nearest-neighbour search over the dense index. Returns `(position, score)`
/// pairs best first, at most `k` of them.
pub trait VectorBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn search(
        &self,
        index: &DenseIndex,
        query: &[f32],
        k: usize,
        similarity: Similarity,
    ) -> Vec<(usize, f32)>;
}

/// Brute-force scan over every chunk vector.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactSearch;

impl VectorBackend for ExactSearch {
    fn name(&self) -> &'static str {
        "exact"
    }

    fn search(
        &self,
        index: &DenseIndex,
        query: &[f32],
        k: usize,
        similarity: Similarity,
    ) -> Vec<(usize, f32)> {
        let scored = index
            .vectors()
            .par_iter()
            .enumerate()
            .map(|(position, vector)| (position, score(similarity, query, vector)))
            .collect::<Vec<_>>();
        top_k_positions(scored, k)
    }
}

pub fn score(similarity: Similarity, query: &[f32], vector: &[f32]) -> f32 {
    match similarity {
        Similarity::Cosine => cosine_similarity(query, vector),
        Similarity::DotProduct => dot_product(query, vector),
    }
}

pub struct DenseRetriever {
    store: Arc<IndexStore>,
    backend: Arc<dyn VectorBackend>,
    similarity: Similarity,
    defaults: RetrievalDefaults,
}

impl DenseRetriever {
    pub fn new(store: Arc<IndexStore>) -> Self {
        Self {
            store,
            backend: Arc::new(ExactSearch),
            similarity: Similarity::Cosine,
            defaults: RetrievalDefaults::default(),
        }
    }

    #[must_use]
    pub const fn with_similarity(mut self, similarity: Similarity) -> Self {
        self.similarity = similarity;
        self
    }

    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn VectorBackend>) -> Self {
        self.backend = backend;
        self
    }

    #[must_use]
    pub const fn with_defaults(mut self, defaults: RetrievalDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn store(&self) -> &Arc<IndexStore> {
        &self.store
    }

    pub async fn search(&self, text: &str, k: usize) -> RagResult<RetrievalResult> {
        let k = positive("k", k)?;
        let index = self.store.handle()?;
        let dense = index.dense()?;
        let embedder = self
            .store
            .embedder()
            .ok_or(RagError::IndexNotBuilt("query embedder"))?;

        let mut embedded = embedder
            .embed(&[text.to_string()])
            .await
            .map_err(|err| RagError::EmbeddingFailure(format!("{err:#}")))?;
        if embedded.len() != 1 {
            return Err(RagError::EmbeddingFailure(format!(
                "embedder returned {} vectors for one query",
                embedded.len()
            )));
        }
        let query_vector = embedded.remove(0);
        check_vector(&query_vector, dense.dimension())
            .map_err(|msg| RagError::EmbeddingFailure(format!("query: {msg}")))?;

        let ranked = self
            .backend
            .search(dense, &query_vector, k, self.similarity);
        debug!(
            retriever = "dense",
            backend = self.backend.name(),
            k,
            hits = ranked.len(),
            "dense retrieval"
        );
        Ok(to_result(&index, ranked))
    }
}

#[async_trait]
impl Retriever for DenseRetriever {
    fn name(&self) -> &str {
        "dense"
    }

    async fn retrieve(&self, query: &Query) -> RagResult<RetrievalResult> {
        self.search(&query.text, self.defaults.top_k(query)?).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use common::{Chunk, RagError, Similarity};
    use embeddings::{EmbeddingConfig, EmbeddingEngine, Embedder};

    use super::DenseRetriever;
    use crate::index::IndexStore;

    struct TableEmbedder;

    #[async_trait]
    impl Embedder for TableEmbedder {
        fn name(&self) -> &str {
            "table"
        }

        fn dimension(&self) -> Option<usize> {
            Some(2)
        }

        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| match t.as_str() {
                    "north" => vec![0.0, 1.0],
                    "east" => vec![1.0, 0.0],
                    "north-east" => vec![0.7, 0.7],
                    "long east" => vec![3.0, 0.0],
                    "bad" => vec![1.0, 0.0, 0.0],
                    _ => vec![0.5, 0.5],
                })
                .collect())
        }
    }

    async fn build(texts: &[&str]) -> Arc<IndexStore> {
        let store = Arc::new(IndexStore::with_embedder(Arc::new(TableEmbedder), 2));
        let chunks = texts
            .iter()
            .enumerate()
            .map(|(i, text)| Chunk::new(format!("c{i}"), *text))
            .collect();
        store.build(chunks).await.expect("build");
        store
    }

    #[tokio::test]
    async fn ranks_by_cosine() {
        let store = build(&["north", "east", "north-east"]).await;
        let result = DenseRetriever::new(store).search("east", 2).await.expect("search");
        assert_eq!(result.chunk_ids(), vec!["c1", "c2"]);
        assert!((result.candidates()[0].score - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn dot_product_rewards_magnitude() {
        let store = build(&["east", "long east"]).await;
        let result = DenseRetriever::new(store)
            .with_similarity(Similarity::DotProduct)
            .search("east", 2)
            .await
            .expect("search");
        assert_eq!(result.chunk_ids(), vec!["c1", "c0"]);
    }

    #[tokio::test]
    async fn wrong_query_dimension_is_embedding_failure() {
        let store = build(&["north", "east"]).await;
        let err = DenseRetriever::new(store).search("bad", 1).await.err();
        assert!(matches!(err, Some(RagError::EmbeddingFailure(_))));
    }

    #[tokio::test]
    async fn sparse_only_store_is_not_built_for_dense() {
        let store = Arc::new(IndexStore::new());
        store
            .build(vec![Chunk::new("c0", "north")])
            .await
            .expect("build");
        let err = DenseRetriever::new(store).search("north", 1).await.err();
        assert!(matches!(err, Some(RagError::IndexNotBuilt(_))));
    }

    #[tokio::test]
    async fn pseudo_engine_finds_shared_words() {
        let engine = Arc::new(EmbeddingEngine::new(EmbeddingConfig::pseudo(256)));
        let store = Arc::new(IndexStore::with_embedder(engine, 16));
        store
            .build(vec![
                Chunk::new("c0", "wandb logs images"),
                Chunk::new("c1", "artifacts version datasets"),
            ])
            .await
            .expect("build");
        let result = DenseRetriever::new(store)
            .search("artifacts datasets", 1)
            .await
            .expect("search");
        assert_eq!(result.chunk_ids(), vec!["c1"]);
    }
}
