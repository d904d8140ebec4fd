//! Rank-aware retrieval metrics over `ModelOutput::context`.
//!
//! A retrieved chunk is a hit when its id or its source equals one of the
//! example's relevant labels. Each label is credited at most once, so several
//! chunks from the same relevant source count as a single hit.

use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use common::{Example, RetrievedChunk};

use crate::{
    model::ModelOutput,
    scorer::{ScoreMap, Scorer},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrMetric {
    HitRate,
    Mrr,
    Ndcg,
    Precision,
    Recall,
    Map,
}

impl IrMetric {
    pub const ALL: [Self; 6] = [
        Self::HitRate,
        Self::Mrr,
        Self::Ndcg,
        Self::Precision,
        Self::Recall,
        Self::Map,
    ];

    pub const fn label(self) -> &'static str {
        match self {
            Self::HitRate => "hit_rate",
            Self::Mrr => "mrr",
            Self::Ndcg => "ndcg",
            Self::Precision => "precision",
            Self::Recall => "recall",
            Self::Map => "map",
        }
    }
}

pub struct RetrievalMetric {
    metric: IrMetric,
    k: usize,
    name: String,
}

impl RetrievalMetric {
    pub fn new(metric: IrMetric, k: usize) -> Self {
        Self {
            metric,
            k,
            name: format!("{}@{k}", metric.label()),
        }
    }

    pub fn compute(&self, context: &[RetrievedChunk], relevant: &[String]) -> Result<f64> {
        if self.k == 0 {
            bail!("{}: k must be positive", self.name);
        }
        let labels = distinct(relevant);
        if labels.is_empty() {
            bail!("{}: example has no relevant labels", self.name);
        }
        let hits = hit_flags(context, &labels, self.k);
        Ok(match self.metric {
            IrMetric::HitRate => f64::from(u8::from(hits.contains(&true))),
            IrMetric::Mrr => reciprocal_rank(&hits),
            IrMetric::Ndcg => ndcg(&hits, labels.len(), self.k),
            IrMetric::Precision => ratio(count(&hits), self.k),
            IrMetric::Recall => ratio(count(&hits), labels.len()),
            IrMetric::Map => average_precision(&hits, labels.len().min(self.k)),
        })
    }
}

#[async_trait]
impl Scorer for RetrievalMetric {
    fn name(&self) -> &str {
        &self.name
    }

    async fn score(&self, output: &ModelOutput, example: &Example) -> Result<ScoreMap> {
        let value = self.compute(&output.context, &example.relevant)?;
        Ok(ScoreMap::from([("score".to_string(), value)]))
    }
}

/// The standard retrieval set at cutoff `k`.
pub fn ir_metrics(k: usize) -> Vec<Arc<dyn Scorer>> {
    IrMetric::ALL
        .into_iter()
        .map(|metric| Arc::new(RetrievalMetric::new(metric, k)) as Arc<dyn Scorer>)
        .collect()
}

fn distinct(relevant: &[String]) -> Vec<&str> {
    let mut labels: Vec<&str> = Vec::with_capacity(relevant.len());
    for label in relevant {
        if !label.is_empty() && !labels.contains(&label.as_str()) {
            labels.push(label);
        }
    }
    labels
}

fn hit_flags(context: &[RetrievedChunk], labels: &[&str], k: usize) -> Vec<bool> {
    let mut credited = vec![false; labels.len()];
    context
        .iter()
        .take(k)
        .map(|chunk| {
            let matched = labels.iter().enumerate().position(|(idx, label)| {
                !credited[idx] && (chunk.chunk_id == *label || chunk.source == *label)
            });
            matched.is_some_and(|idx| {
                credited[idx] = true;
                true
            })
        })
        .collect()
}

fn count(hits: &[bool]) -> usize {
    hits.iter().filter(|hit| **hit).count()
}

#[allow(clippy::cast_precision_loss)]
fn ratio(numerator: usize, denominator: usize) -> f64 {
    numerator as f64 / denominator as f64
}

fn reciprocal_rank(hits: &[bool]) -> f64 {
    hits.iter()
        .position(|hit| *hit)
        .map_or(0.0, |pos| ratio(1, pos + 1))
}

#[allow(clippy::cast_precision_loss)]
fn discount(pos: usize) -> f64 {
    1.0 / (pos as f64 + 2.0).log2()
}

fn ndcg(hits: &[bool], relevant: usize, k: usize) -> f64 {
    let dcg: f64 = hits
        .iter()
        .enumerate()
        .filter(|(_, hit)| **hit)
        .map(|(pos, _)| discount(pos))
        .sum();
    let idcg: f64 = (0..relevant.min(k)).map(discount).sum();
    dcg / idcg
}

fn average_precision(hits: &[bool], denominator: usize) -> f64 {
    let mut seen = 0;
    let mut sum = 0.0;
    for (pos, hit) in hits.iter().enumerate() {
        if *hit {
            seen += 1;
            sum += ratio(seen, pos + 1);
        }
    }
    sum / ratio(denominator, 1)
}
