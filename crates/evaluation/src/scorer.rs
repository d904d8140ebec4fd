use std::collections::BTreeMap;

use async_trait::async_trait;
use common::Example;
use serde::{Deserialize, Serialize};

use crate::model::ModelOutput;

/// Named values produced by one scorer for one example.
pub type ScoreMap = BTreeMap<String, f64>;

/// A metric over one target output. Implementations must not mutate shared state.
#[async_trait]
pub trait Scorer: Send + Sync {
    fn name(&self) -> &str;

    async fn score(&self, output: &ModelOutput, example: &Example) -> anyhow::Result<ScoreMap>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MetricOutcome {
    Scored { values: ScoreMap },
    Failed { error: String },
}

impl MetricOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
        }
    }

    /// Non-finite values are treated as a scorer failure.
    pub fn from_values(values: ScoreMap) -> Self {
        match values.iter().find(|(_, value)| !value.is_finite()) {
            Some((field, value)) => Self::failed(format!("non-finite value {value} for {field}")),
            None => Self::Scored { values },
        }
    }

    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub const fn values(&self) -> Option<&ScoreMap> {
        match self {
            Self::Scored { values } => Some(values),
            Self::Failed { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{MetricOutcome, ScoreMap};

    #[test]
    fn non_finite_values_become_failures() {
        let mut values = ScoreMap::new();
        values.insert("f1".to_string(), 0.5);
        assert!(!MetricOutcome::from_values(values.clone()).is_failed());

        values.insert("recall".to_string(), f64::NAN);
        let outcome = MetricOutcome::from_values(values);
        assert!(outcome.is_failed());
        assert!(outcome.values().is_none());
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let outcome = MetricOutcome::failed("judge timed out");
        let json = serde_json::to_value(&outcome).expect("serialize");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"], "judge timed out");
    }
}
