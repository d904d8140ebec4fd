use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{harness::EvaluationRecord, scorer::MetricOutcome, telemetry::EvaluationTelemetrySnapshot};

/// Distribution of one score field over the successful units of a metric.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FieldStats {
    pub count: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub p50: f64,
    pub max: f64,
}

impl FieldStats {
    /// Returns `None` for an empty sample.
    pub fn from_values(values: &mut [f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        values.sort_by(f64::total_cmp);
        #[allow(clippy::cast_precision_loss)]
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Some(Self {
            count: values.len(),
            mean,
            std_dev: variance.sqrt(),
            min: values[0],
            p50: percentile(values, 0.50),
            max: values[values.len() - 1],
        })
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MetricSummary {
    pub scored: usize,
    pub failures: usize,
    pub failed_example_ids: Vec<String>,
    pub fields: BTreeMap<String, FieldStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationSummary {
    pub run_id: String,
    pub name: String,
    pub model: String,
    pub elapsed_ms: u64,
    pub target_failures: usize,
    pub metrics: BTreeMap<String, MetricSummary>,
    pub records: Vec<EvaluationRecord>,
    pub telemetry: EvaluationTelemetrySnapshot,
}

impl EvaluationSummary {
    pub fn mean(&self, scorer: &str, field: &str) -> Option<f64> {
        self.metrics
            .get(scorer)?
            .fields
            .get(field)
            .map(|stats| stats.mean)
    }

    pub fn metric(&self, scorer: &str) -> Option<&MetricSummary> {
        self.metrics.get(scorer)
    }
}

/// Aggregates per-metric statistics in record order.
pub fn summarize_metrics(
    scorer_names: &[String],
    records: &[EvaluationRecord],
) -> BTreeMap<String, MetricSummary> {
    scorer_names
        .iter()
        .map(|name| {
            let mut summary = MetricSummary::default();
            let mut samples: BTreeMap<String, Vec<f64>> = BTreeMap::new();
            for record in records {
                match record.metric_scores.get(name) {
                    Some(MetricOutcome::Scored { values }) => {
                        summary.scored += 1;
                        for (field, value) in values {
                            samples.entry(field.clone()).or_default().push(*value);
                        }
                    }
                    Some(MetricOutcome::Failed { .. }) | None => {
                        summary.failures += 1;
                        summary.failed_example_ids.push(record.example_id.clone());
                    }
                }
            }
            summary.fields = samples
                .into_iter()
                .filter_map(|(field, mut values)| {
                    FieldStats::from_values(&mut values).map(|stats| (field, stats))
                })
                .collect();
            (name.clone(), summary)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use common::CallArgs;

    use super::{FieldStats, summarize_metrics};
    use crate::{
        harness::EvaluationRecord,
        scorer::{MetricOutcome, ScoreMap},
    };

    fn record(id: &str, outcome: MetricOutcome) -> EvaluationRecord {
        let mut metric_scores = BTreeMap::new();
        metric_scores.insert("exact".to_string(), outcome);
        EvaluationRecord {
            example_id: id.to_string(),
            model_input: CallArgs::new("q"),
            model_output: None,
            ground_truth: None,
            metric_scores,
            model_latency_ms: 0,
            target_error: None,
        }
    }

    fn scored(value: f64) -> MetricOutcome {
        let mut values = ScoreMap::new();
        values.insert("score".to_string(), value);
        MetricOutcome::from_values(values)
    }

    #[test]
    fn field_stats_match_known_sample() {
        let mut values = vec![4.0, 1.0, 3.0, 2.0, 5.0];
        let stats = FieldStats::from_values(&mut values).expect("stats");
        assert_eq!(stats.count, 5);
        assert!((stats.mean - 3.0).abs() < 1e-12);
        assert!((stats.std_dev - 2.0_f64.sqrt()).abs() < 1e-12);
        assert!((stats.min - 1.0).abs() < 1e-12);
        assert!((stats.p50 - 3.0).abs() < 1e-12);
        assert!((stats.max - 5.0).abs() < 1e-12);
        assert!(FieldStats::from_values(&mut []).is_none());
    }

    #[test]
    fn failures_are_counted_and_excluded_from_means() {
        let records = vec![
            record("a", scored(1.0)),
            record("b", MetricOutcome::failed("boom")),
            record("c", scored(0.0)),
        ];
        let metrics = summarize_metrics(&["exact".to_string()], &records);
        let exact = &metrics["exact"];
        assert_eq!(exact.scored, 2);
        assert_eq!(exact.failures, 1);
        assert_eq!(exact.failed_example_ids, vec!["b".to_string()]);
        assert!((exact.fields["score"].mean - 0.5).abs() < 1e-12);
    }
}
