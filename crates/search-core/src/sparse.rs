use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use common::{IdfWeighting, Query, RagResult, RetrievalResult, config::Bm25Section};
use tracing::debug;

use crate::{
    index::{CorpusIndex, IndexStore, SparseIndex},
    retrieval::{RetrievalDefaults, Retriever, positive, to_result, top_k_positions},
};

/// Cosine similarity between TF-IDF weighted query and chunk vectors.
pub struct TfIdfRetriever {
    store: Arc<IndexStore>,
    weighting: IdfWeighting,
    defaults: RetrievalDefaults,
}

impl TfIdfRetriever {
    pub fn new(store: Arc<IndexStore>) -> Self {
        Self {
            store,
            weighting: IdfWeighting::Plain,
            defaults: RetrievalDefaults::default(),
        }
    }

    #[must_use]
    pub const fn with_weighting(mut self, weighting: IdfWeighting) -> Self {
        self.weighting = weighting;
        self
    }

    #[must_use]
    pub const fn with_defaults(mut self, defaults: RetrievalDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn search(&self, text: &str, k: usize) -> RagResult<RetrievalResult> {
        let k = positive("k", k)?;
        let index = self.store.handle()?;
        let terms = self.store.analyzer().terms(text);
        let scored = tfidf_scores(index.sparse(), &terms, self.weighting);
        let ranked = top_k_positions(scored, k);
        debug!(retriever = "tfidf", k, hits = ranked.len(), "sparse retrieval");
        Ok(to_result(&index, ranked))
    }
}

fn tfidf_scores(sparse: &SparseIndex, terms: &[String], weighting: IdfWeighting) -> Vec<(usize, f32)> {
    let mut query_tf: AHashMap<usize, u32> = AHashMap::new();
    for term in terms {
        if let Some(term_id) = sparse.term_id(term) {
            *query_tf.entry(term_id).or_insert(0) += 1;
        }
    }

    let mut dots = vec![0.0f32; sparse.num_chunks()];
    let mut query_norm = 0.0f32;
    for (&term_id, &tf) in &query_tf {
        let idf = sparse.idf(term_id, weighting);
        #[allow(clippy::cast_precision_loss)]
        let query_weight = tf as f32 * idf;
        query_norm += query_weight * query_weight;
        for &(position, chunk_tf) in sparse.postings(term_id) {
            #[allow(clippy::cast_precision_loss)]
            let chunk_weight = chunk_tf as f32 * idf;
            dots[position as usize] += query_weight * chunk_weight;
        }
    }
    let query_norm = query_norm.sqrt();

    dots.into_iter()
        .enumerate()
        .map(|(position, dot)| {
            let chunk_norm = sparse.tfidf_norm(position, weighting);
            let score = if query_norm == 0.0 || chunk_norm == 0.0 {
                0.0
            } else {
                (dot / (query_norm * chunk_norm)).clamp(0.0, 1.0)
            };
            (position, score)
        })
        .collect()
}

#[async_trait]
impl Retriever for TfIdfRetriever {
    fn name(&self) -> &str {
        "tfidf"
    }

    async fn retrieve(&self, query: &Query) -> RagResult<RetrievalResult> {
        self.search(&query.text, self.defaults.top_k(query)?)
    }
}

/// Okapi BM25 with a non-negative IDF.
pub struct Bm25Retriever {
    store: Arc<IndexStore>,
    params: Bm25Section,
    defaults: RetrievalDefaults,
}

impl Bm25Retriever {
    pub fn new(store: Arc<IndexStore>) -> Self {
        Self {
            store,
            params: Bm25Section::default(),
            defaults: RetrievalDefaults::default(),
        }
    }

    #[must_use]
    pub const fn with_params(mut self, params: Bm25Section) -> Self {
        self.params = params;
        self
    }

    #[must_use]
    pub const fn with_defaults(mut self, defaults: RetrievalDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn search(&self, text: &str, k: usize) -> RagResult<RetrievalResult> {
        let k = positive("k", k)?;
        let index = self.store.handle()?;
        let terms = self.store.analyzer().terms(text);
        let scored = bm25_scores(&index, &terms, self.params);
        let ranked = top_k_positions(scored, k);
        debug!(retriever = "bm25", k, hits = ranked.len(), "sparse retrieval");
        Ok(to_result(&index, ranked))
    }
}

#[allow(clippy::cast_precision_loss)]
fn bm25_idf(sparse: &SparseIndex, term_id: usize) -> f32 {
    let n = sparse.num_chunks() as f32;
    let df = sparse.doc_freq(term_id) as f32;
    (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
}

/// Each query term occurrence contributes once; chunks sharing no term with
/// the query keep a score of exactly zero.
fn bm25_scores(index: &CorpusIndex, terms: &[String], params: Bm25Section) -> Vec<(usize, f32)> {
    let sparse = index.sparse();
    let mut scores = vec![0.0f32; sparse.num_chunks()];
    let avg_len = sparse.avg_doc_len();
    for term in terms {
        let Some(term_id) = sparse.term_id(term) else {
            continue;
        };
        let idf = bm25_idf(sparse, term_id);
        for &(position, tf) in sparse.postings(term_id) {
            let position = position as usize;
            #[allow(clippy::cast_precision_loss)]
            let tf = tf as f32;
            #[allow(clippy::cast_precision_loss)]
            let length_ratio = if avg_len > 0.0 {
                sparse.doc_len(position) as f32 / avg_len
            } else {
                1.0
            };
            let norm = params.k1 * (1.0 - params.b + params.b * length_ratio);
            scores[position] += idf * tf * (params.k1 + 1.0) / (tf + norm);
        }
    }
    scores.into_iter().enumerate().collect()
}

#[async_trait]
impl Retriever for Bm25Retriever {
    fn name(&self) -> &str {
        "bm25"
    }

    async fn retrieve(&self, query: &Query) -> RagResult<RetrievalResult> {
        self.search(&query.text, self.defaults.top_k(query)?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use common::{Chunk, IdfWeighting, RagError};

    use super::{Bm25Retriever, TfIdfRetriever};
    use crate::index::IndexStore;

    async fn store(texts: &[&str]) -> Arc<IndexStore> {
        let store = Arc::new(IndexStore::new());
        let chunks = texts
            .iter()
            .enumerate()
            .map(|(i, text)| Chunk::new(format!("c{i}"), *text))
            .collect();
        store.build(chunks).await.expect("build");
        store
    }

    #[tokio::test]
    async fn bm25_scores_zero_without_shared_terms() {
        let store = store(&["wandb logs images", "artifacts version datasets"]).await;
        let result = Bm25Retriever::new(store).search("log images", 2).expect("search");
        assert_eq!(result.chunk_ids(), vec!["c0", "c1"]);
        assert!(result.candidates()[0].score > 0.0);
        assert_eq!(result.candidates()[1].score.to_bits(), 0.0f32.to_bits());
    }

    #[tokio::test]
    async fn k_larger_than_corpus_returns_every_chunk() {
        let store = store(&["alpha", "beta", "gamma"]).await;
        let result = Bm25Retriever::new(store).search("beta", 10).expect("search");
        assert_eq!(result.len(), 3);
        assert_eq!(result.chunk_ids()[0], "c1");
    }

    #[tokio::test]
    async fn zero_k_is_invalid() {
        let store = store(&["alpha"]).await;
        let err = TfIdfRetriever::new(store).search("alpha", 0).err();
        assert!(matches!(err, Some(RagError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn query_before_build_fails() {
        let store = Arc::new(IndexStore::new());
        let err = Bm25Retriever::new(store).search("alpha", 1).err();
        assert!(matches!(err, Some(RagError::IndexNotBuilt(_))));
    }

    #[tokio::test]
    async fn tfidf_single_chunk_is_deterministic() {
        let store = store(&["wandb logs images"]).await;
        let retriever = TfIdfRetriever::new(Arc::clone(&store));
        let first = retriever.search("images", 3).expect("search");
        let again = retriever.search("completely unrelated", 3).expect("search");
        assert_eq!(first.chunk_ids(), vec!["c0"]);
        assert_eq!(first.candidates()[0].score.to_bits(), 0.0f32.to_bits());
        assert_eq!(again.candidates()[0].score.to_bits(), 0.0f32.to_bits());

        let smooth = TfIdfRetriever::new(store).with_weighting(IdfWeighting::Smooth);
        let scored = smooth.search("images", 1).expect("search");
        assert!((scored.candidates()[0].score - 1.0 / 3.0f32.sqrt()).abs() < 1e-5);
    }

    #[tokio::test]
    async fn tfidf_identical_text_scores_one() {
        let store = store(&["wandb logs images", "artifacts version datasets"]).await;
        let result = TfIdfRetriever::new(store)
            .search("artifacts version datasets", 1)
            .expect("search");
        assert_eq!(result.chunk_ids(), vec!["c1"]);
        assert!((result.candidates()[0].score - 1.0).abs() < 1e-5);
    }
}
