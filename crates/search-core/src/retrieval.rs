use async_trait::async_trait;
use common::{Query, RagError, RagResult, RetrievalResult, config::RetrievalSection};

use crate::index::CorpusIndex;

/// A ranking strategy over a built index store.
///
/// Implementations are interchangeable behind `Arc<dyn Retriever>`: the
/// evaluation harness and pipelines never need to know which variant they
/// drive.
#[async_trait]
pub trait Retriever: Send + Sync {
    fn name(&self) -> &str;

    async fn retrieve(&self, query: &Query) -> RagResult<RetrievalResult>;
}

/// Fallbacks for queries that leave `top_k` / `top_n` unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrievalDefaults {
    pub top_k: usize,
    pub top_n: usize,
}

impl Default for RetrievalDefaults {
    fn default() -> Self {
        Self::from(&RetrievalSection::default())
    }
}

impl From<&RetrievalSection> for RetrievalDefaults {
    fn from(section: &RetrievalSection) -> Self {
        Self {
            top_k: section.top_k,
            top_n: section.top_n,
        }
    }
}

impl RetrievalDefaults {
    pub fn top_k(&self, query: &Query) -> RagResult<usize> {
        positive("top_k", query.top_k.unwrap_or(self.top_k))
    }

    pub fn top_n(&self, query: &Query) -> RagResult<usize> {
        positive("top_n", query.top_n.unwrap_or(self.top_n))
    }
}

pub(crate) fn positive(name: &str, value: usize) -> RagResult<usize> {
    if value == 0 {
        return Err(RagError::invalid(format!("{name} must be positive")));
    }
    Ok(value)
}

/// Keeps the `k` best `(position, score)` pairs, best first. Equal scores keep
/// corpus insertion order.
pub(crate) fn top_k_positions(mut scored: Vec<(usize, f32)>, k: usize) -> Vec<(usize, f32)> {
    let by_rank = |a: &(usize, f32), b: &(usize, f32)| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0));
    if k < scored.len() {
        scored.select_nth_unstable_by(k, by_rank);
        scored.truncate(k);
    }
    scored.sort_unstable_by(by_rank);
    scored
}

pub(crate) fn to_result(index: &CorpusIndex, ranked: Vec<(usize, f32)>) -> RetrievalResult {
    RetrievalResult::from_sorted(
        ranked
            .into_iter()
            .map(|(position, score)| (index.chunk_id(position).to_string(), score)),
    )
}

#[cfg(test)]
mod tests {
    use common::Query;

    use super::{RetrievalDefaults, top_k_positions};

    #[test]
    fn defaults_follow_retrieval_section() {
        let d = RetrievalDefaults::default();
        assert_eq!(d.top_k, 5);
        assert_eq!(d.top_n, 3);
    }

    #[test]
    fn query_values_override_defaults_and_zero_is_rejected() {
        let d = RetrievalDefaults::default();
        assert_eq!(d.top_k(&Query::new("q").with_top_k(9)).expect("k"), 9);
        assert!(d.top_n(&Query::new("q").with_top_n(0)).is_err());
    }

    #[test]
    fn ties_keep_insertion_order() {
        let ranked = top_k_positions(vec![(0, 1.0), (1, 2.0), (2, 1.0), (3, 1.0)], 3);
        assert_eq!(ranked, vec![(1, 2.0), (0, 1.0), (2, 1.0)]);
    }
}
