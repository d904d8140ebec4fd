pub mod analyzer;
pub mod cohere;
pub mod dense;
pub mod fusion;
pub mod hybrid;
pub mod index;
pub mod rerank;
pub mod retrieval;
pub mod sparse;

pub use analyzer::Analyzer;
pub use cohere::{CohereConfig, CohereRelevanceModel};
pub use dense::{DenseRetriever, ExactSearch, VectorBackend};
pub use fusion::{
    FusionStrategy, MinMaxFusion, ReciprocalRankFusion, ScoredId, SingleListScore, rrf_fuse,
};
pub use hybrid::HybridFusionRetriever;
pub use index::{CorpusIndex, IndexStore};
pub use rerank::{DenseRetrieverWithReranker, EmbeddingRelevanceModel, RelevanceModel, Reranker};
pub use retrieval::{RetrievalDefaults, Retriever};
pub use sparse::{Bm25Retriever, TfIdfRetriever};
