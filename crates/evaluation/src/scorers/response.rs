//! Lexical overlap metrics between a generated answer and the ground truth.

use std::{collections::HashMap, sync::Arc};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use common::Example;

use crate::{
    model::ModelOutput,
    scorer::{ScoreMap, Scorer},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NlpMetric {
    TokenF1,
    RougeL,
    Bleu,
    Levenshtein,
}

impl NlpMetric {
    pub const ALL: [Self; 4] = [Self::TokenF1, Self::RougeL, Self::Bleu, Self::Levenshtein];

    pub const fn label(self) -> &'static str {
        match self {
            Self::TokenF1 => "token_f1",
            Self::RougeL => "rouge_l",
            Self::Bleu => "bleu",
            Self::Levenshtein => "levenshtein",
        }
    }

    pub fn compute(self, answer: &str, reference: &str) -> ScoreMap {
        let candidate = tokenize(answer);
        let target = tokenize(reference);
        match self {
            Self::TokenF1 => {
                let overlap = bag_overlap(&candidate, &target);
                prf(overlap, candidate.len(), target.len())
            }
            Self::RougeL => prf(lcs_length(&candidate, &target), candidate.len(), target.len()),
            Self::Bleu => ScoreMap::from([("score".to_string(), bleu(&candidate, &target))]),
            Self::Levenshtein => ScoreMap::from([(
                "similarity".to_string(),
                levenshtein_similarity(&normalize(answer), &normalize(reference)),
            )]),
        }
    }
}

pub struct ResponseMetric {
    metric: NlpMetric,
}

impl ResponseMetric {
    pub const fn new(metric: NlpMetric) -> Self {
        Self { metric }
    }
}

#[async_trait]
impl Scorer for ResponseMetric {
    fn name(&self) -> &str {
        self.metric.label()
    }

    async fn score(&self, output: &ModelOutput, example: &Example) -> Result<ScoreMap> {
        let answer = output
            .answer
            .as_deref()
            .ok_or_else(|| anyhow!("{}: target produced no answer", self.name()))?;
        let reference = example
            .ground_truth
            .as_deref()
            .ok_or_else(|| anyhow!("{}: example has no ground truth", self.name()))?;
        Ok(self.metric.compute(answer, reference))
    }
}

pub fn nlp_metrics() -> Vec<Arc<dyn Scorer>> {
    NlpMetric::ALL
        .into_iter()
        .map(|metric| Arc::new(ResponseMetric::new(metric)) as Arc<dyn Scorer>)
        .collect()
}

/// Lowercases, strips punctuation and collapses whitespace.
fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn tokenize(text: &str) -> Vec<String> {
    normalize(text)
        .split(' ')
        .filter(|token| !token.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn counts<'a>(tokens: impl Iterator<Item = &'a [String]>) -> HashMap<&'a [String], usize> {
    let mut counts = HashMap::new();
    for token in tokens {
        *counts.entry(token).or_insert(0) += 1;
    }
    counts
}

/// Clipped count of shared n-grams.
fn ngram_overlap(candidate: &[String], reference: &[String], n: usize) -> (usize, usize) {
    if candidate.len() < n {
        return (0, 0);
    }
    let reference_counts = counts(reference.windows(n));
    let candidate_counts = counts(candidate.windows(n));
    let matched = candidate_counts
        .iter()
        .map(|(gram, count)| (*count).min(reference_counts.get(gram).copied().unwrap_or(0)))
        .sum();
    (matched, candidate.len() + 1 - n)
}

fn bag_overlap(candidate: &[String], reference: &[String]) -> usize {
    ngram_overlap(candidate, reference, 1).0
}

#[allow(clippy::cast_precision_loss)]
fn prf(overlap: usize, candidate_len: usize, reference_len: usize) -> ScoreMap {
    let (precision, recall) = if candidate_len == 0 || reference_len == 0 {
        let both_empty = candidate_len == reference_len;
        (f64::from(u8::from(both_empty)), f64::from(u8::from(both_empty)))
    } else {
        (
            overlap as f64 / candidate_len as f64,
            overlap as f64 / reference_len as f64,
        )
    };
    let f1 = if precision + recall == 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    };
    ScoreMap::from([
        ("f1".to_string(), f1),
        ("precision".to_string(), precision),
        ("recall".to_string(), recall),
    ])
}

fn lcs_length(a: &[String], b: &[String]) -> usize {
    let mut dp = vec![0usize; b.len() + 1];
    for left in a {
        let mut prev = 0;
        for (j, right) in b.iter().enumerate() {
            let above = dp[j + 1];
            dp[j + 1] = if left == right {
                prev + 1
            } else {
                dp[j + 1].max(dp[j])
            };
            prev = above;
        }
    }
    dp[b.len()]
}

/// Sentence BLEU up to 4-grams with add-one smoothing above unigrams.
#[allow(clippy::cast_precision_loss)]
fn bleu(candidate: &[String], reference: &[String]) -> f64 {
    if candidate.is_empty() || reference.is_empty() {
        return 0.0;
    }
    let max_order = candidate.len().min(4);
    let mut log_sum = 0.0;
    for n in 1..=max_order {
        let (matched, total) = ngram_overlap(candidate, reference, n);
        let precision = if n == 1 {
            matched as f64 / total as f64
        } else {
            (matched as f64 + 1.0) / (total as f64 + 1.0)
        };
        if precision == 0.0 {
            return 0.0;
        }
        log_sum += precision.ln();
    }
    let geometric = (log_sum / max_order as f64).exp();
    let (c, r) = (candidate.len() as f64, reference.len() as f64);
    let brevity = if c < r { (1.0 - r / c).exp() } else { 1.0 };
    brevity * geometric
}

#[allow(clippy::cast_precision_loss)]
fn levenshtein_similarity(a: &str, b: &str) -> f64 {
    let a = a.chars().collect::<Vec<_>>();
    let b = b.chars().collect::<Vec<_>>();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }
    let mut row = (0..=b.len()).collect::<Vec<_>>();
    for (i, ca) in a.iter().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = diagonal + usize::from(ca != cb);
            diagonal = row[j + 1];
            row[j + 1] = substitution.min(row[j] + 1).min(row[j + 1] + 1);
        }
    }
    1.0 - row[b.len()] as f64 / longest as f64
}

#[cfg(test)]
mod tests {
    use common::Example;
    use proptest::prelude::*;

    use super::{NlpMetric, bleu, lcs_length, levenshtein_similarity, nlp_metrics, tokenize};
    use crate::{model::ModelOutput, scorer::Scorer};

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn token_f1_counts_shared_tokens_once_per_occurrence() {
        let scores = NlpMetric::TokenF1.compute("Use wandb.log to log images", "log images with wandb");
        assert!(close(scores["precision"], 3.0 / 6.0));
        assert!(close(scores["recall"], 3.0 / 4.0));
        assert!(close(scores["f1"], 0.6));
    }

    #[test]
    fn rouge_l_uses_longest_common_subsequence() {
        let a = tokenize("the run logs metrics to the dashboard");
        let b = tokenize("the run sends metrics to a dashboard");
        assert_eq!(lcs_length(&a, &b), 5);
        let scores = NlpMetric::RougeL.compute("a b c", "a b c");
        assert!(close(scores["f1"], 1.0));
    }

    #[test]
    fn bleu_rewards_exact_matches_and_penalizes_brevity() {
        let reference = tokenize("call wandb init before logging any metrics");
        assert!(close(bleu(&reference, &reference), 1.0));
        let short = tokenize("call wandb init");
        let score = bleu(&short, &reference);
        assert!(score > 0.0 && score < 0.5, "{score}");
        assert!(close(bleu(&tokenize("unrelated words"), &reference), 0.0));
    }

    #[test]
    fn levenshtein_similarity_is_normalized() {
        assert!(close(levenshtein_similarity("kitten", "sitting"), 1.0 - 3.0 / 7.0));
        assert!(close(levenshtein_similarity("", ""), 1.0));
        assert!(close(levenshtein_similarity("abc", ""), 0.0));
    }

    #[tokio::test]
    async fn missing_answer_or_ground_truth_is_an_error() {
        let scorers = nlp_metrics();
        let scorer = &scorers[0];
        let with_answer = ModelOutput {
            answer: Some("log images".to_string()),
            ..ModelOutput::default()
        };
        let unlabeled = Example::new("e1", "q");
        assert!(scorer.score(&with_answer, &unlabeled).await.is_err());
        let labeled = unlabeled.with_ground_truth("log images");
        assert!(scorer.score(&ModelOutput::default(), &labeled).await.is_err());
        assert!(scorer.score(&with_answer, &labeled).await.is_ok());
    }

    proptest! {
        #[test]
        fn response_scores_stay_in_unit_range(answer in "[a-z ]{0,40}", reference in "[a-z ]{0,40}") {
            for metric in NlpMetric::ALL {
                for (field, value) in metric.compute(&answer, &reference) {
                    prop_assert!((0.0..=1.0).contains(&value), "{:?} {} = {}", metric, field, value);
                }
            }
        }
    }
}
