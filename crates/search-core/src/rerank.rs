use std::sync::Arc;

use async_trait::async_trait;
use common::{Query, RagError, RagResult, RetrievalResult};
use embeddings::{Embedder, cosine_similarity};
use tracing::debug;

use crate::{
    dense::DenseRetriever,
    index::IndexStore,
    retrieval::{RetrievalDefaults, Retriever, positive},
};

/// Scores (query, document) pairs in one batch. Must return exactly one
/// finite score per document, in document order.
#[async_trait]
pub trait RelevanceModel: Send + Sync {
    fn name(&self) -> &str;

    async fn score(&self, query: &str, documents: &[&str]) -> anyhow::Result<Vec<f32>>;
}

/// Re-scores a candidate pool with a relevance model and keeps the best
/// `top_n`. Original retrieval scores are discarded.
#[derive(Clone)]
pub struct Reranker {
    store: Arc<IndexStore>,
    model: Arc<dyn RelevanceModel>,
}

impl Reranker {
    pub fn new(store: Arc<IndexStore>, model: Arc<dyn RelevanceModel>) -> Self {
        Self { store, model }
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub async fn rerank(
        &self,
        query: &str,
        candidates: &RetrievalResult,
        top_n: usize,
    ) -> RagResult<RetrievalResult> {
        let top_n = positive("top_n", top_n)?;
        if candidates.is_empty() {
            return Ok(RetrievalResult::empty());
        }
        let index = self.store.handle()?;
        let texts = candidates
            .iter()
            .map(|candidate| {
                index
                    .chunk(&candidate.chunk_id)
                    .map(|chunk| chunk.text.as_str())
                    .ok_or_else(|| {
                        RagError::invalid(format!("unknown chunk id `{}`", candidate.chunk_id))
                    })
            })
            .collect::<RagResult<Vec<_>>>()?;

        let scores = self
            .model
            .score(query, &texts)
            .await
            .map_err(|err| RagError::RerankFailure(format!("{}: {err:#}", self.model.name())))?;
        if scores.len() != texts.len() {
            return Err(RagError::RerankFailure(format!(
                "{} returned {} scores for {} candidates",
                self.model.name(),
                scores.len(),
                texts.len()
            )));
        }
        if let Some(bad) = scores.iter().position(|s| !s.is_finite()) {
            return Err(RagError::RerankFailure(format!(
                "{} returned a non-finite score for candidate {bad}",
                self.model.name()
            )));
        }

        let mut rescored = candidates
            .iter()
            .zip(scores)
            .enumerate()
            .map(|(incoming, (candidate, score))| (incoming, candidate.chunk_id.clone(), score))
            .collect::<Vec<_>>();
        rescored.sort_by(|a, b| b.2.total_cmp(&a.2).then(a.0.cmp(&b.0)));
        rescored.truncate(top_n);
        debug!(
            model = self.model.name(),
            pool = candidates.len(),
            kept = rescored.len(),
            "reranked candidates"
        );
        Ok(RetrievalResult::from_sorted(
            rescored.into_iter().map(|(_, id, score)| (id, score)),
        ))
    }
}

/// Bi-encoder relevance: cosine between the query and candidate embeddings.
pub struct EmbeddingRelevanceModel {
    embedder: Arc<dyn Embedder>,
}

impl EmbeddingRelevanceModel {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }
}

#[async_trait]
impl RelevanceModel for EmbeddingRelevanceModel {
    fn name(&self) -> &str {
        "embedding-cosine"
    }

    async fn score(&self, query: &str, documents: &[&str]) -> anyhow::Result<Vec<f32>> {
        let mut texts = Vec::with_capacity(documents.len() + 1);
        texts.push(query.to_string());
        texts.extend(documents.iter().map(|d| (*d).to_string()));
        let vectors = self.embedder.embed(&texts).await?;
        let Some((query_vec, doc_vecs)) = vectors.split_first() else {
            anyhow::bail!("embedder returned no vectors");
        };
        Ok(doc_vecs
            .iter()
            .map(|vector| cosine_similarity(query_vec, vector))
            .collect())
    }
}

/// Dense retrieval of a `top_k` pool, reranked down to `top_n`.
pub struct DenseRetrieverWithReranker {
    dense: DenseRetriever,
    reranker: Reranker,
    defaults: RetrievalDefaults,
}

impl DenseRetrieverWithReranker {
    pub fn new(dense: DenseRetriever, reranker: Reranker) -> Self {
        Self {
            dense,
            reranker,
            defaults: RetrievalDefaults::default(),
        }
    }

    #[must_use]
    pub const fn with_defaults(mut self, defaults: RetrievalDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub async fn search(&self, text: &str, top_k: usize, top_n: usize) -> RagResult<RetrievalResult> {
        let top_n = positive("top_n", top_n)?;
        let pool = self.dense.search(text, top_k).await?;
        self.reranker.rerank(text, &pool, top_n).await
    }
}

#[async_trait]
impl Retriever for DenseRetrieverWithReranker {
    fn name(&self) -> &str {
        "dense_rerank"
    }

    async fn retrieve(&self, query: &Query) -> RagResult<RetrievalResult> {
        self.search(
            &query.text,
            self.defaults.top_k(query)?,
            self.defaults.top_n(query)?,
        )
        .await
    }
}
