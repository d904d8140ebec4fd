use ahash::AHashMap;
use common::RetrievalResult;

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredId {
    pub id: String,
    pub score: f32,
}

/// Merges a sparse and a dense ranking into one deduplicated candidate set.
/// Output order is unspecified; callers sort.
pub trait FusionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn fuse(&self, sparse: &RetrievalResult, dense: &RetrievalResult) -> Vec<ScoredId>;
}

/// How a chunk found by only one retriever is scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SingleListScore {
    /// Its normalized score as is.
    #[default]
    Unweighted,
    /// Its normalized score times that list's weight.
    Weighted,
}

/// Min-max normalizes each list to [0, 1] and combines
/// `alpha * sparse + (1 - alpha) * dense`.
///
/// A list whose scores are all equal normalizes to 1.0. A list with weight 0
/// contributes no candidates of its own, so `alpha = 1` and `alpha = 0`
/// reproduce the sparse and dense rankings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinMaxFusion {
    pub alpha: f32,
    pub single_list: SingleListScore,
}

impl Default for MinMaxFusion {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl MinMaxFusion {
    pub fn new(alpha: f32) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            single_list: SingleListScore::Unweighted,
        }
    }

    #[must_use]
    pub const fn with_single_list(mut self, single_list: SingleListScore) -> Self {
        self.single_list = single_list;
        self
    }
}

pub fn min_max_normalize(result: &RetrievalResult) -> Vec<(&str, f32)> {
    let (min, max) = result
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), c| {
            (lo.min(c.score), hi.max(c.score))
        });
    let range = max - min;
    result
        .iter()
        .map(|c| {
            let normalized = if range > 0.0 {
                (c.score - min) / range
            } else {
                1.0
            };
            (c.chunk_id.as_str(), normalized)
        })
        .collect()
}

#[derive(Default)]
struct Contribution {
    sparse: Option<f32>,
    dense: Option<f32>,
}

impl FusionStrategy for MinMaxFusion {
    fn name(&self) -> &'static str {
        "min_max"
    }

    fn fuse(&self, sparse: &RetrievalResult, dense: &RetrievalResult) -> Vec<ScoredId> {
        let sparse_weight = self.alpha;
        let dense_weight = 1.0 - self.alpha;

        let mut order: Vec<&str> = Vec::with_capacity(sparse.len() + dense.len());
        let mut merged: AHashMap<&str, Contribution> = AHashMap::new();
        for (id, score) in min_max_normalize(sparse) {
            let entry = merged.entry(id).or_insert_with(|| {
                order.push(id);
                Contribution::default()
            });
            entry.sparse.get_or_insert(score);
        }
        for (id, score) in min_max_normalize(dense) {
            let entry = merged.entry(id).or_insert_with(|| {
                order.push(id);
                Contribution::default()
            });
            entry.dense.get_or_insert(score);
        }

        order
            .into_iter()
            .filter_map(|id| {
                let contribution = merged.get(id)?;
                let score = match (contribution.sparse, contribution.dense) {
                    (Some(s), Some(d)) => sparse_weight * s + dense_weight * d,
                    (Some(s), None) if sparse_weight > 0.0 => match self.single_list {
                        SingleListScore::Unweighted => s,
                        SingleListScore::Weighted => sparse_weight * s,
                    },
                    (None, Some(d)) if dense_weight > 0.0 => match self.single_list {
                        SingleListScore::Unweighted => d,
                        SingleListScore::Weighted => dense_weight * d,
                    },
                    _ => return None,
                };
                Some(ScoredId {
                    id: id.to_string(),
                    score,
                })
            })
            .collect()
    }
}

/// Weighted reciprocal rank fusion: `w / (k + rank)` summed over lists.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReciprocalRankFusion {
    pub k: usize,
    pub sparse_weight: f32,
    pub dense_weight: f32,
}

impl Default for ReciprocalRankFusion {
    fn default() -> Self {
        Self {
            k: 60,
            sparse_weight: 1.0,
            dense_weight: 1.0,
        }
    }
}

impl FusionStrategy for ReciprocalRankFusion {
    fn name(&self) -> &'static str {
        "rrf"
    }

    fn fuse(&self, sparse: &RetrievalResult, dense: &RetrievalResult) -> Vec<ScoredId> {
        let sparse_ids = sparse.iter().map(|c| c.chunk_id.clone()).collect::<Vec<_>>();
        let dense_ids = dense.iter().map(|c| c.chunk_id.clone()).collect::<Vec<_>>();
        rrf_fuse(
            &sparse_ids,
            &dense_ids,
            self.k,
            self.sparse_weight,
            self.dense_weight,
        )
    }
}

/// Reciprocal rank fusion over two id lists, best first.
#[allow(clippy::cast_precision_loss)]
pub fn rrf_fuse(
    sparse_ids: &[String],
    dense_ids: &[String],
    k: usize,
    w_sparse: f32,
    w_dense: f32,
) -> Vec<ScoredId> {
    let kf = k as f32;
    let mut scores: AHashMap<&str, (usize, f32)> = AHashMap::new();
    let lists = [(sparse_ids, w_sparse), (dense_ids, w_dense)];
    for (ids, weight) in lists {
        for (rank, id) in ids.iter().enumerate() {
            let rr = weight / (kf + (rank + 1) as f32);
            let next = scores.len();
            scores.entry(id.as_str()).or_insert((next, 0.0)).1 += rr;
        }
    }

    let mut fused = scores
        .into_iter()
        .map(|(id, (first_seen, score))| {
            let scored = ScoredId {
                id: id.to_string(),
                score,
            };
            (first_seen, scored)
        })
        .collect::<Vec<_>>();
    fused.sort_by(|a, b| b.1.score.total_cmp(&a.1.score).then(a.0.cmp(&b.0)));
    fused.into_iter().map(|(_, scored)| scored).collect()
}
