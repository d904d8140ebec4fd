pub mod config;
pub mod dataset;
pub mod error;

use serde::{Deserialize, Serialize};

pub use config::{IdfWeighting, RagConfig, Similarity};
pub use dataset::{CallArgs, Example};
pub use error::{RagError, RagResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ChunkMetadata {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub token_count: usize,
    #[serde(default)]
    pub position: usize,
}

/// A passage of a corpus. Immutable once handed to an index store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: ChunkMetadata,
}

impl Chunk {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata: ChunkMetadata::default(),
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.metadata.source = source.into();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Query {
    pub text: String,
    #[serde(default, alias = "k")]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub top_n: Option<usize>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            top_k: None,
            top_n: None,
        }
    }

    #[must_use]
    pub const fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    #[must_use]
    pub const fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = Some(top_n);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredCandidate {
    pub chunk_id: String,
    pub score: f32,
    /// 1-based position within its result list.
    pub rank: usize,
}

/// An ordered, read-only ranking. Scores never increase with rank and ranks
/// run 1..=len.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RetrievalResult {
    candidates: Vec<ScoredCandidate>,
}

impl RetrievalResult {
    /// Builds a result from `(chunk_id, score)` pairs that are already sorted
    /// best-first, assigning ranks in iteration order.
    pub fn from_sorted<I>(scored: I) -> Self
    where
        I: IntoIterator<Item = (String, f32)>,
    {
        let candidates = scored
            .into_iter()
            .enumerate()
            .map(|(idx, (chunk_id, score))| ScoredCandidate {
                chunk_id,
                score,
                rank: idx + 1,
            })
            .collect::<Vec<_>>();
        debug_assert!(
            candidates.windows(2).all(|w| w[0].score >= w[1].score),
            "retrieval result must be sorted by non-increasing score"
        );
        Self { candidates }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ScoredCandidate> {
        self.candidates.iter()
    }

    pub fn candidates(&self) -> &[ScoredCandidate] {
        &self.candidates
    }

    pub fn first(&self) -> Option<&ScoredCandidate> {
        self.candidates.first()
    }

    pub fn chunk_ids(&self) -> Vec<&str> {
        self.candidates
            .iter()
            .map(|c| c.chunk_id.as_str())
            .collect()
    }

    pub fn into_candidates(self) -> Vec<ScoredCandidate> {
        self.candidates
    }
}

impl<'a> IntoIterator for &'a RetrievalResult {
    type Item = &'a ScoredCandidate;
    type IntoIter = std::slice::Iter<'a, ScoredCandidate>;

    fn into_iter(self) -> Self::IntoIter {
        self.candidates.iter()
    }
}

/// A scored candidate resolved against the index store, carrying the text a
/// generator or judge needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub source: String,
    pub text: String,
    pub score: f32,
    pub rank: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_sorted_assigns_one_based_ranks() {
        let result = RetrievalResult::from_sorted(vec![
            ("a".to_string(), 3.0),
            ("b".to_string(), 2.0),
            ("c".to_string(), 2.0),
        ]);
        let ranks = result.iter().map(|c| c.rank).collect::<Vec<_>>();
        assert_eq!(ranks, vec![1, 2, 3]);
        assert_eq!(result.chunk_ids(), vec!["a", "b", "c"]);
    }

    #[test]
    fn query_accepts_k_alias() {
        let query: Query = serde_json::from_str(r#"{"text":"log images","k":4}"#).expect("query");
        assert_eq!(query.top_k, Some(4));
        assert_eq!(query.top_n, None);
    }

    #[test]
    fn chunk_metadata_defaults_when_missing() {
        let chunk: Chunk =
            serde_json::from_str(r#"{"id":"c1","text":"wandb logs images"}"#).expect("chunk");
        assert_eq!(chunk.metadata, ChunkMetadata::default());
    }
}
