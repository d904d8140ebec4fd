use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use common::{Chunk, RetrievalResult};
use embeddings::{EmbeddingConfig, EmbeddingEngine};
use proptest::prelude::*;
use search_core::{
    Bm25Retriever, DenseRetriever, HybridFusionRetriever, IndexStore, MinMaxFusion,
    RelevanceModel, Reranker, TfIdfRetriever,
};

const VOCAB: &[&str] = &[
    "wandb", "logs", "images", "tracks", "metrics", "artifacts", "version", "datasets", "sweeps",
    "tables", "reports", "runs",
];

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

fn text_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(prop::sample::select(VOCAB), 1..6).prop_map(|words| words.join(" "))
}

fn corpus_strategy() -> impl Strategy<Value = Vec<Chunk>> {
    prop::collection::vec(text_strategy(), 1..12).prop_map(|texts| {
        texts
            .into_iter()
            .enumerate()
            .map(|(i, text)| Chunk::new(format!("c{i}"), text))
            .collect()
    })
}

async fn dense_store(chunks: Vec<Chunk>) -> Arc<IndexStore> {
    let engine = Arc::new(EmbeddingEngine::new(EmbeddingConfig::pseudo(64)));
    let store = Arc::new(IndexStore::with_embedder(engine, 4));
    store.build(chunks).await.expect("build");
    store
}

fn assert_well_formed(result: &RetrievalResult, k: usize) {
    assert!(result.len() <= k);
    let scores = result.iter().map(|c| c.score).collect::<Vec<_>>();
    assert!(scores.windows(2).all(|w| w[0] >= w[1]), "scores {scores:?}");
    let unique = result.iter().map(|c| c.chunk_id.as_str()).collect::<HashSet<_>>();
    assert_eq!(unique.len(), result.len());
    for (idx, candidate) in result.iter().enumerate() {
        assert_eq!(candidate.rank, idx + 1);
    }
}

struct ReversedModel;

#[async_trait]
impl RelevanceModel for ReversedModel {
    fn name(&self) -> &str {
        "reversed"
    }

    async fn score(&self, _query: &str, documents: &[&str]) -> anyhow::Result<Vec<f32>> {
        #[allow(clippy::cast_precision_loss)]
        Ok((0..documents.len()).map(|i| i as f32).collect())
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn single_retrievers_return_sorted_unique_results(
        corpus in corpus_strategy(),
        query in text_strategy(),
        k in 1usize..15,
    ) {
        runtime().block_on(async {
            let size = corpus.len();
            let store = dense_store(corpus).await;
            let bm25 = Bm25Retriever::new(Arc::clone(&store)).search(&query, k).expect("bm25");
            let tfidf = TfIdfRetriever::new(Arc::clone(&store)).search(&query, k).expect("tfidf");
            let dense = DenseRetriever::new(Arc::clone(&store)).search(&query, k).await.expect("dense");
            for result in [&bm25, &tfidf, &dense] {
                assert_well_formed(result, k);
                assert_eq!(result.len(), k.min(size));
            }
        });
    }

    #[test]
    fn alpha_extremes_reproduce_single_rankings(
        corpus in corpus_strategy(),
        query in text_strategy(),
        k in 1usize..8,
    ) {
        runtime().block_on(async {
            let store = dense_store(corpus).await;
            let sparse = Arc::new(Bm25Retriever::new(Arc::clone(&store)));
            let dense = Arc::new(DenseRetriever::new(Arc::clone(&store)));

            let sparse_only = HybridFusionRetriever::new(Arc::clone(&store), sparse.clone(), dense.clone())
                .with_fusion(Arc::new(MinMaxFusion::new(1.0)));
            let fused = sparse_only.search(&query, k, k).await.expect("hybrid");
            let expected = sparse.search(&query, k).expect("bm25");
            assert_eq!(fused.chunk_ids(), expected.chunk_ids());

            let dense_only = HybridFusionRetriever::new(Arc::clone(&store), sparse, dense.clone())
                .with_fusion(Arc::new(MinMaxFusion::new(0.0)));
            let fused = dense_only.search(&query, k, k).await.expect("hybrid");
            let expected = dense.search(&query, k).await.expect("dense");
            assert_eq!(fused.chunk_ids(), expected.chunk_ids());
        });
    }

    #[test]
    fn reranker_output_is_bounded(
        corpus in corpus_strategy(),
        pool_size in 1usize..12,
        top_n in 1usize..12,
    ) {
        runtime().block_on(async {
            let store = dense_store(corpus).await;
            let pool = Bm25Retriever::new(Arc::clone(&store))
                .search("wandb", pool_size)
                .expect("pool");
            let reranked = Reranker::new(Arc::clone(&store), Arc::new(ReversedModel))
                .rerank("wandb", &pool, top_n)
                .await
                .expect("rerank");
            assert!(reranked.len() <= top_n);
            assert!(reranked.len() <= pool.len());
            assert_well_formed(&reranked, top_n);
            let pool_ids = pool.chunk_ids().into_iter().collect::<HashSet<_>>();
            assert!(reranked.iter().all(|c| pool_ids.contains(c.chunk_id.as_str())));
        });
    }
}
