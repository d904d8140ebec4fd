use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicBool, Ordering},
};

use ahash::AHashMap;
use common::{Chunk, IdfWeighting, RagError, RagResult, RetrievalResult, RetrievedChunk};
use embeddings::Embedder;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::analyzer::Analyzer;

const DEFAULT_EMBED_BATCH: usize = 64;

/// Builds and owns the immutable index of one corpus version.
///
/// A store is built at most once. Retrievers share it behind an `Arc` and
/// read it without locks; every read before a successful build fails with
/// [`RagError::IndexNotBuilt`].
pub struct IndexStore {
    analyzer: Analyzer,
    embedder: Option<Arc<dyn Embedder>>,
    embed_batch_size: usize,
    building: AtomicBool,
    built: OnceLock<Arc<CorpusIndex>>,
}

/// Everything derived from a corpus at build time.
pub struct CorpusIndex {
    version: String,
    chunks: Vec<Chunk>,
    positions: AHashMap<String, usize>,
    sparse: SparseIndex,
    dense: Option<DenseIndex>,
}

#[derive(Debug)]
pub struct SparseIndex {
    vocabulary: AHashMap<String, usize>,
    /// Per term id: `(chunk position, term frequency)` in ascending position.
    postings: Vec<Vec<(u32, u32)>>,
    doc_len: Vec<u32>,
    avg_doc_len: f32,
    plain_norms: Vec<f32>,
    smooth_norms: Vec<f32>,
}

#[derive(Debug)]
pub struct DenseIndex {
    dimension: usize,
    vectors: Vec<Vec<f32>>,
}

impl IndexStore {
    /// A sparse-only store. Dense retrieval against it fails with
    /// `IndexNotBuilt`.
    pub fn new() -> Self {
        Self {
            analyzer: Analyzer::english(),
            embedder: None,
            embed_batch_size: DEFAULT_EMBED_BATCH,
            building: AtomicBool::new(false),
            built: OnceLock::new(),
        }
    }

    pub fn with_embedder(embedder: Arc<dyn Embedder>, batch_size: usize) -> Self {
        Self {
            embedder: Some(embedder),
            embed_batch_size: batch_size.max(1),
            ..Self::new()
        }
    }

    pub fn analyzer(&self) -> &Analyzer {
        &self.analyzer
    }

    pub fn embedder(&self) -> Option<&Arc<dyn Embedder>> {
        self.embedder.as_ref()
    }

    pub fn is_built(&self) -> bool {
        self.built.get().is_some()
    }

    /// Builds the sparse and, when an embedder is configured, dense index in
    /// one pass. Any failure leaves the store unbuilt.
    pub async fn build(&self, chunks: Vec<Chunk>) -> RagResult<Arc<CorpusIndex>> {
        if chunks.is_empty() {
            return Err(RagError::EmptyCorpus);
        }
        if self.is_built() {
            return Err(RagError::invalid("index store is already built"));
        }
        if self.building.swap(true, Ordering::AcqRel) {
            return Err(RagError::invalid("index store build already in progress"));
        }
        let guard = BuildGuard(&self.building);

        match self.build_inner(chunks).await {
            Ok(index) => {
                let index = Arc::new(index);
                if self.built.set(Arc::clone(&index)).is_err() {
                    return Err(RagError::invalid("index store is already built"));
                }
                drop(guard);
                info!(
                    corpus_version = %index.version,
                    chunks = index.len(),
                    terms = index.sparse.vocabulary.len(),
                    dense = index.dense.is_some(),
                    "index store built"
                );
                Ok(index)
            }
            Err(err) => {
                warn!(error = %err, kind = err.kind(), "index build failed");
                Err(err)
            }
        }
    }

    async fn build_inner(&self, chunks: Vec<Chunk>) -> RagResult<CorpusIndex> {
        let mut positions = AHashMap::with_capacity(chunks.len());
        for (position, chunk) in chunks.iter().enumerate() {
            if positions.insert(chunk.id.clone(), position).is_some() {
                return Err(RagError::invalid(format!("duplicate chunk id `{}`", chunk.id)));
            }
        }

        let sparse = SparseIndex::build(&self.analyzer, &chunks);
        let dense = match self.embedder.as_ref() {
            Some(embedder) => Some(self.embed_corpus(embedder.as_ref(), &chunks).await?),
            None => None,
        };

        Ok(CorpusIndex {
            version: corpus_version(&chunks),
            chunks,
            positions,
            sparse,
            dense,
        })
    }

    async fn embed_corpus(&self, embedder: &dyn Embedder, chunks: &[Chunk]) -> RagResult<DenseIndex> {
        let mut vectors = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(self.embed_batch_size) {
            let texts = batch.iter().map(|c| c.text.clone()).collect::<Vec<_>>();
            let embedded = embedder
                .embed(&texts)
                .await
                .map_err(|err| RagError::EmbeddingFailure(format!("{err:#}")))?;
            if embedded.len() != texts.len() {
                return Err(RagError::EmbeddingFailure(format!(
                    "embedder returned {} vectors for {} texts",
                    embedded.len(),
                    texts.len()
                )));
            }
            vectors.extend(embedded);
        }

        let dimension = vectors.first().map_or(0, Vec::len);
        if dimension == 0 {
            return Err(RagError::EmbeddingFailure(
                "embedder returned zero-dimension vectors".to_string(),
            ));
        }
        if let Some(expected) = embedder.dimension().filter(|d| *d != dimension) {
            return Err(RagError::EmbeddingFailure(format!(
                "embedder declared dimension {expected} but returned {dimension}"
            )));
        }
        for (position, vector) in vectors.iter().enumerate() {
            check_vector(vector, dimension)
                .map_err(|msg| RagError::EmbeddingFailure(format!("chunk {position}: {msg}")))?;
        }
        Ok(DenseIndex { dimension, vectors })
    }

    pub fn handle(&self) -> RagResult<Arc<CorpusIndex>> {
        self.built
            .get()
            .cloned()
            .ok_or(RagError::IndexNotBuilt("corpus"))
    }

    /// Resolves ranked ids to chunk text and source.
    pub fn resolve(&self, result: &RetrievalResult) -> RagResult<Vec<RetrievedChunk>> {
        let index = self.handle()?;
        result
            .iter()
            .map(|candidate| {
                let chunk = index.chunk(&candidate.chunk_id).ok_or_else(|| {
                    RagError::invalid(format!("unknown chunk id `{}`", candidate.chunk_id))
                })?;
                Ok(RetrievedChunk {
                    chunk_id: chunk.id.clone(),
                    source: chunk.metadata.source.clone(),
                    text: chunk.text.clone(),
                    score: candidate.score,
                    rank: candidate.rank,
                })
            })
            .collect()
    }
}

/// Clears the in-progress flag when a build finishes, fails or is dropped.
struct BuildGuard<'a>(&'a AtomicBool);

impl Drop for BuildGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for IndexStore {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn check_vector(vector: &[f32], dimension: usize) -> Result<(), String> {
    if vector.len() != dimension {
        return Err(format!(
            "expected dimension {dimension}, got {}",
            vector.len()
        ));
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err("vector contains non-finite values".to_string());
    }
    Ok(())
}

/// SHA-256 over ids and texts; identical corpora share a version.
fn corpus_version(chunks: &[Chunk]) -> String {
    let mut hasher = Sha256::new();
    for chunk in chunks {
        hasher.update(chunk.id.as_bytes());
        hasher.update([0u8]);
        hasher.update(chunk.text.as_bytes());
        hasher.update([0u8]);
    }
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

impl CorpusIndex {
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn chunk(&self, id: &str) -> Option<&Chunk> {
        self.position_of(id).map(|position| &self.chunks[position])
    }

    pub fn position_of(&self, id: &str) -> Option<usize> {
        self.positions.get(id).copied()
    }

    pub fn chunk_id(&self, position: usize) -> &str {
        &self.chunks[position].id
    }

    pub const fn sparse(&self) -> &SparseIndex {
        &self.sparse
    }

    pub fn dense(&self) -> RagResult<&DenseIndex> {
        self.dense
            .as_ref()
            .ok_or(RagError::IndexNotBuilt("dense embeddings"))
    }
}

impl SparseIndex {
    fn build(analyzer: &Analyzer, chunks: &[Chunk]) -> Self {
        let term_counts = chunks
            .par_iter()
            .map(|chunk| {
                let mut counts: AHashMap<String, u32> = AHashMap::new();
                for term in analyzer.terms(&chunk.text) {
                    *counts.entry(term).or_insert(0) += 1;
                }
                counts
            })
            .collect::<Vec<_>>();

        let mut vocabulary: AHashMap<String, usize> = AHashMap::new();
        let mut postings: Vec<Vec<(u32, u32)>> = Vec::new();
        let mut doc_len = Vec::with_capacity(chunks.len());
        for (position, counts) in term_counts.iter().enumerate() {
            doc_len.push(counts.values().sum::<u32>());
            let mut terms = counts.iter().collect::<Vec<_>>();
            terms.sort_by(|a, b| a.0.cmp(b.0));
            for (term, tf) in terms {
                let next_id = vocabulary.len();
                let term_id = *vocabulary.entry(term.clone()).or_insert(next_id);
                if term_id == postings.len() {
                    postings.push(Vec::new());
                }
                postings[term_id].push((u32::try_from(position).unwrap_or(u32::MAX), *tf));
            }
        }

        let total_len = doc_len.iter().map(|len| f64::from(*len)).sum::<f64>();
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        let avg_doc_len = (total_len / chunks.len() as f64) as f32;

        let mut index = Self {
            vocabulary,
            postings,
            doc_len,
            avg_doc_len,
            plain_norms: Vec::new(),
            smooth_norms: Vec::new(),
        };
        index.plain_norms = index.chunk_norms(&term_counts, IdfWeighting::Plain);
        index.smooth_norms = index.chunk_norms(&term_counts, IdfWeighting::Smooth);
        index
    }

    fn chunk_norms(&self, term_counts: &[AHashMap<String, u32>], weighting: IdfWeighting) -> Vec<f32> {
        term_counts
            .par_iter()
            .map(|counts| {
                counts
                    .iter()
                    .filter_map(|(term, tf)| {
                        let idf = self.idf(self.term_id(term)?, weighting);
                        #[allow(clippy::cast_precision_loss)]
                        let weight = *tf as f32 * idf;
                        Some(weight * weight)
                    })
                    .sum::<f32>()
                    .sqrt()
            })
            .collect()
    }

    pub fn num_chunks(&self) -> usize {
        self.doc_len.len()
    }

    pub fn term_id(&self, term: &str) -> Option<usize> {
        self.vocabulary.get(term).copied()
    }

    pub fn postings(&self, term_id: usize) -> &[(u32, u32)] {
        &self.postings[term_id]
    }

    pub fn doc_freq(&self, term_id: usize) -> usize {
        self.postings[term_id].len()
    }

    pub fn doc_len(&self, position: usize) -> u32 {
        self.doc_len[position]
    }

    pub const fn avg_doc_len(&self) -> f32 {
        self.avg_doc_len
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn idf(&self, term_id: usize, weighting: IdfWeighting) -> f32 {
        let n = self.num_chunks() as f32;
        let df = self.doc_freq(term_id) as f32;
        match weighting {
            IdfWeighting::Plain => (n / df).ln(),
            IdfWeighting::Smooth => ((1.0 + n) / (1.0 + df)).ln() + 1.0,
        }
    }

    pub fn tfidf_norm(&self, position: usize, weighting: IdfWeighting) -> f32 {
        match weighting {
            IdfWeighting::Plain => self.plain_norms[position],
            IdfWeighting::Smooth => self.smooth_norms[position],
        }
    }
}

impl DenseIndex {
    pub const fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn vectors(&self) -> &[Vec<f32>] {
        &self.vectors
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use common::{Chunk, RagError, RetrievalResult};
    use embeddings::Embedder;

    use super::IndexStore;

    struct FixedEmbedder {
        vectors: Vec<Vec<f32>>,
    }

    #[async_trait]
    impl Embedder for FixedEmbedder {
        fn name(&self) -> &str {
            "fixed"
        }

        fn dimension(&self) -> Option<usize> {
            None
        }

        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(self.vectors.iter().take(texts.len()).cloned().collect())
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        fn name(&self) -> &str {
            "failing"
        }

        fn dimension(&self) -> Option<usize> {
            Some(4)
        }

        async fn embed(&self, _texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            anyhow::bail!("upstream timeout")
        }
    }

    struct SlowEmbedder {
        delay: std::time::Duration,
    }

    #[async_trait]
    impl Embedder for SlowEmbedder {
        fn name(&self) -> &str {
            "slow"
        }

        fn dimension(&self) -> Option<usize> {
            Some(2)
        }

        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            tokio::time::sleep(self.delay).await;
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    fn corpus() -> Vec<Chunk> {
        vec![
            Chunk::new("c0", "wandb logs images"),
            Chunk::new("c1", "wandb tracks metrics"),
            Chunk::new("c2", "artifacts version datasets"),
        ]
    }

    #[tokio::test]
    async fn rejects_empty_corpus() {
        let store = IndexStore::new();
        let err = store.build(Vec::new()).await.err();
        assert_eq!(err, Some(RagError::EmptyCorpus));
    }

    #[tokio::test]
    async fn rejects_duplicate_ids_and_stays_unbuilt() {
        let store = IndexStore::new();
        let err = store
            .build(vec![Chunk::new("a", "x"), Chunk::new("a", "y")])
            .await
            .err();
        assert!(matches!(err, Some(RagError::InvalidArgument(_))));
        assert!(!store.is_built());
        assert!(store.build(corpus()).await.is_ok());
    }

    #[tokio::test]
    async fn second_build_is_rejected() {
        let store = IndexStore::new();
        store.build(corpus()).await.expect("first build");
        let err = store.build(corpus()).await.err();
        assert!(matches!(err, Some(RagError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn reads_before_build_fail() {
        let store = IndexStore::new();
        assert!(matches!(store.handle(), Err(RagError::IndexNotBuilt(_))));
        assert!(store.resolve(&RetrievalResult::empty()).is_err());
    }

    #[tokio::test]
    async fn sparse_statistics_match_corpus() {
        let store = IndexStore::new();
        let index = store.build(corpus()).await.expect("build");
        let sparse = index.sparse();
        let wandb = sparse.term_id("wandb").expect("wandb indexed");
        assert_eq!(sparse.doc_freq(wandb), 2);
        assert_eq!(sparse.doc_len(0), 3);
        assert!((sparse.avg_doc_len() - 3.0).abs() < 1e-6);
        assert_eq!(index.position_of("c2"), Some(2));
        assert!(index.dense().is_err());
        assert_eq!(index.version().len(), 16);
    }

    #[tokio::test]
    async fn embedder_failure_aborts_build() {
        let store = IndexStore::with_embedder(Arc::new(FailingEmbedder), 2);
        let err = store.build(corpus()).await.err();
        assert!(matches!(err, Some(RagError::EmbeddingFailure(_))));
        assert!(!store.is_built());
    }

    #[tokio::test]
    async fn inconsistent_dimensions_are_embedding_failures() {
        let store = IndexStore::with_embedder(
            Arc::new(FixedEmbedder {
                vectors: vec![vec![1.0, 0.0], vec![0.0, 1.0, 0.0], vec![1.0, 1.0]],
            }),
            8,
        );
        let err = store.build(corpus()).await.err();
        assert!(matches!(err, Some(RagError::EmbeddingFailure(_))));
    }

    #[tokio::test]
    async fn short_embedding_batch_is_rejected() {
        let store = IndexStore::with_embedder(
            Arc::new(FixedEmbedder {
                vectors: vec![vec![1.0, 0.0]],
            }),
            8,
        );
        let err = store.build(corpus()).await.err();
        assert!(matches!(err, Some(RagError::EmbeddingFailure(_))));
    }

    #[tokio::test]
    async fn same_corpus_has_same_version() {
        let a = IndexStore::new().build(corpus()).await.expect("build");
        let b = IndexStore::new().build(corpus()).await.expect("build");
        assert_eq!(a.version(), b.version());
    }

    #[tokio::test]
    async fn cancelled_build_can_be_retried() {
        let store = IndexStore::with_embedder(
            Arc::new(SlowEmbedder {
                delay: std::time::Duration::from_millis(200),
            }),
            8,
        );
        let cancelled =
            tokio::time::timeout(std::time::Duration::from_millis(20), store.build(corpus())).await;
        assert!(cancelled.is_err());
        assert!(!store.is_built());

        let index = store.build(corpus()).await.expect("rebuild after cancellation");
        assert_eq!(index.len(), 3);
        assert!(store.is_built());
    }
}
