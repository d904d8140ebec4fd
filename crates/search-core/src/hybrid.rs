use std::sync::Arc;

use async_trait::async_trait;
use common::{Query, RagResult, RetrievalResult};
use tracing::debug;

use crate::{
    fusion::{FusionStrategy, MinMaxFusion},
    index::IndexStore,
    rerank::Reranker,
    retrieval::{RetrievalDefaults, Retriever, positive},
};

/// Runs a sparse and a dense retriever side by side, fuses their candidates
/// and cuts the fused list to `top_n`, through the reranker when one is set.
pub struct HybridFusionRetriever {
    store: Arc<IndexStore>,
    sparse: Arc<dyn Retriever>,
    dense: Arc<dyn Retriever>,
    fusion: Arc<dyn FusionStrategy>,
    reranker: Option<Reranker>,
    defaults: RetrievalDefaults,
}

impl HybridFusionRetriever {
    pub fn new(store: Arc<IndexStore>, sparse: Arc<dyn Retriever>, dense: Arc<dyn Retriever>) -> Self {
        Self {
            store,
            sparse,
            dense,
            fusion: Arc::new(MinMaxFusion::default()),
            reranker: None,
            defaults: RetrievalDefaults::default(),
        }
    }

    #[must_use]
    pub fn with_fusion(mut self, fusion: Arc<dyn FusionStrategy>) -> Self {
        self.fusion = fusion;
        self
    }

    #[must_use]
    pub fn with_reranker(mut self, reranker: Reranker) -> Self {
        self.reranker = Some(reranker);
        self
    }

    #[must_use]
    pub const fn with_defaults(mut self, defaults: RetrievalDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// The deduplicated, fused candidate list before any cut to `top_n`.
    pub async fn fused_candidates(&self, text: &str, top_k: usize) -> RagResult<RetrievalResult> {
        let top_k = positive("top_k", top_k)?;
        let index = self.store.handle()?;
        let query = Query::new(text).with_top_k(top_k);
        let (sparse, dense) =
            futures::try_join!(self.sparse.retrieve(&query), self.dense.retrieve(&query))?;

        let mut fused = self
            .fusion
            .fuse(&sparse, &dense)
            .into_iter()
            .map(|scored| {
                let position = index.position_of(&scored.id).unwrap_or(usize::MAX);
                (position, scored)
            })
            .collect::<Vec<_>>();
        fused.sort_by(|a, b| b.1.score.total_cmp(&a.1.score).then(a.0.cmp(&b.0)));
        debug!(
            fusion = self.fusion.name(),
            sparse = sparse.len(),
            dense = dense.len(),
            fused = fused.len(),
            "fused candidates"
        );
        Ok(RetrievalResult::from_sorted(
            fused.into_iter().map(|(_, scored)| (scored.id, scored.score)),
        ))
    }

    pub async fn search(&self, text: &str, top_k: usize, top_n: usize) -> RagResult<RetrievalResult> {
        let top_n = positive("top_n", top_n)?;
        let fused = self.fused_candidates(text, top_k).await?;
        match self.reranker.as_ref() {
            Some(reranker) => reranker.rerank(text, &fused, top_n).await,
            None => Ok(RetrievalResult::from_sorted(
                fused
                    .into_candidates()
                    .into_iter()
                    .take(top_n)
                    .map(|c| (c.chunk_id, c.score)),
            )),
        }
    }
}

#[async_trait]
impl Retriever for HybridFusionRetriever {
    fn name(&self) -> &str {
        "hybrid"
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
