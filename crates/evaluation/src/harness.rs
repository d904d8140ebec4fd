use std::{
    any::Any,
    collections::{BTreeMap, HashMap, HashSet},
    future::Future,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
    time::{Duration, Instant},
};

use common::{
    CallArgs, Example, RagError, RagResult, config::EvaluationSection, dataset::ensure_unique_ids,
};
use futures::{FutureExt, future::join_all};
use serde::{Deserialize, Serialize};
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    model::{Model, ModelOutput, Preprocess},
    scorer::{MetricOutcome, Scorer},
    stats::{EvaluationSummary, summarize_metrics},
    telemetry::EvaluationTelemetry,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationConfig {
    pub name: String,
    /// Upper bound on concurrent target and scorer calls.
    pub max_concurrency: usize,
    /// Applied to each target call and each scorer call.
    pub unit_timeout: Option<Duration>,
}

impl EvaluationConfig {
    pub fn from_section(name: impl Into<String>, section: &EvaluationSection) -> Self {
        Self {
            name: name.into(),
            max_concurrency: section.max_concurrency,
            unit_timeout: section.unit_timeout_ms.map(Duration::from_millis),
        }
    }

    #[must_use]
    pub const fn with_unit_timeout(mut self, timeout: Duration) -> Self {
        self.unit_timeout = Some(timeout);
        self
    }
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self::from_section("evaluation", &EvaluationSection::default())
    }
}

/// One dataset row after the target and every scorer have run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationRecord {
    pub example_id: String,
    pub model_input: CallArgs,
    pub model_output: Option<ModelOutput>,
    pub ground_truth: Option<String>,
    pub metric_scores: BTreeMap<String, MetricOutcome>,
    pub model_latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_error: Option<String>,
}

impl EvaluationRecord {
    fn all_failed(
        example: &Example,
        model_input: CallArgs,
        scorer_names: &[String],
        error: &str,
        model_latency_ms: u64,
    ) -> Self {
        Self {
            example_id: example.id.clone(),
            model_input,
            model_output: None,
            ground_truth: example.ground_truth.clone(),
            metric_scores: scorer_names
                .iter()
                .map(|name| (name.clone(), MetricOutcome::failed(format!("target failed: {error}"))))
                .collect(),
            model_latency_ms,
            target_error: Some(error.to_string()),
        }
    }
}

/// Drives a target over a dataset and scores every output.
pub struct Evaluation {
    config: EvaluationConfig,
    dataset: Vec<Example>,
    scorers: Arc<[Arc<dyn Scorer>]>,
    scorer_names: Arc<[String]>,
    preprocess: Preprocess,
}

impl Evaluation {
    pub fn new(
        config: EvaluationConfig,
        dataset: Vec<Example>,
        scorers: Vec<Arc<dyn Scorer>>,
        preprocess: Preprocess,
    ) -> RagResult<Self> {
        if config.max_concurrency == 0 {
            return Err(RagError::invalid("max_concurrency must be positive"));
        }
        let mut seen = HashSet::new();
        for scorer in &scorers {
            if !seen.insert(scorer.name()) {
                return Err(RagError::invalid(format!(
                    "duplicate scorer name: {}",
                    scorer.name()
                )));
            }
        }
        ensure_unique_ids(&dataset)?;
        let scorer_names = scorers.iter().map(|s| s.name().to_string()).collect();
        Ok(Self {
            config,
            dataset,
            scorers: scorers.into(),
            scorer_names,
            preprocess,
        })
    }

    pub fn dataset(&self) -> &[Example] {
        &self.dataset
    }

    pub fn scorer_names(&self) -> &[String] {
        &self.scorer_names
    }

    /// Runs one evaluation pass. Records come back in dataset order.
    pub async fn evaluate(&self, model: Arc<dyn Model>) -> EvaluationSummary {
        let run_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let telemetry = Arc::new(EvaluationTelemetry::default());
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));

        let mut inputs = Vec::with_capacity(self.dataset.len());
        let mut slots: Vec<Option<EvaluationRecord>> =
            (0..self.dataset.len()).map(|_| None).collect();
        let mut tasks = JoinSet::new();
        let mut slot_of_task = HashMap::with_capacity(self.dataset.len());
        for (index, example) in self.dataset.iter().enumerate() {
            let args = match catch_unwind(AssertUnwindSafe(|| (self.preprocess)(example))) {
                Ok(args) => args,
                Err(payload) => {
                    let error = format!("preprocess panicked: {}", panic_message(payload.as_ref()));
                    warn!(run_id = %run_id, example_id = %example.id, error = %error, "preprocess failed");
                    let args = CallArgs::new(example.question.clone());
                    inputs.push(args.clone());
                    telemetry.inc_target_failures();
                    telemetry.inc_unit_failures(self.scorers.len() as u64);
                    telemetry.inc_examples_completed();
                    slots[index] = Some(EvaluationRecord::all_failed(
                        example,
                        args,
                        &self.scorer_names,
                        &error,
                        0,
                    ));
                    continue;
                }
            };
            inputs.push(args.clone());
            let unit = ExampleUnit {
                example: example.clone(),
                args,
                model: Arc::clone(&model),
                scorers: Arc::clone(&self.scorers),
                scorer_names: Arc::clone(&self.scorer_names),
                semaphore: Arc::clone(&semaphore),
                telemetry: Arc::clone(&telemetry),
                timeout: self.config.unit_timeout,
            };
            let handle = tasks.spawn(unit.run());
            slot_of_task.insert(handle.id(), index);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            let (task_id, record) = match joined {
                Ok((task_id, record)) => (task_id, Some(record)),
                Err(err) => {
                    warn!(run_id = %run_id, error = %err, "evaluation task aborted");
                    (err.id(), None)
                }
            };
            if let Some(&index) = slot_of_task.get(&task_id) {
                slots[index] = record;
            }
        }

        let records = slots
            .into_iter()
            .zip(self.dataset.iter().zip(inputs))
            .map(|(slot, (example, args))| {
                slot.unwrap_or_else(|| {
                    telemetry.inc_target_failures();
                    EvaluationRecord::all_failed(
                        example,
                        args,
                        &self.scorer_names,
                        "evaluation task aborted",
                        0,
                    )
                })
            })
            .collect::<Vec<_>>();

        let metrics = summarize_metrics(&self.scorer_names, &records);
        let target_failures = records.iter().filter(|r| r.target_error.is_some()).count();
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            run_id = %run_id,
            name = %self.config.name,
            model = model.name(),
            examples = records.len(),
            target_failures,
            elapsed_ms,
            "evaluation completed"
        );

        EvaluationSummary {
            run_id,
            name: self.config.name.clone(),
            model: model.name().to_string(),
            elapsed_ms,
            target_failures,
            metrics,
            records,
            telemetry: telemetry.snapshot(),
        }
    }
}

struct ExampleUnit {
    example: Example,
    args: CallArgs,
    model: Arc<dyn Model>,
    scorers: Arc<[Arc<dyn Scorer>]>,
    scorer_names: Arc<[String]>,
    semaphore: Arc<Semaphore>,
    telemetry: Arc<EvaluationTelemetry>,
    timeout: Option<Duration>,
}

impl ExampleUnit {
    async fn run(self) -> EvaluationRecord {
        self.telemetry.enter();
        let (predicted, latency_ms) = {
            let _permit = Arc::clone(&self.semaphore).acquire_owned().await.ok();
            let started = Instant::now();
            let predicted = guarded(self.timeout, self.model.predict(&self.args)).await;
            let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            (predicted, latency_ms)
        };
        #[allow(clippy::cast_precision_loss)]
        let latency = latency_ms as f64;
        metrics::histogram!("ragbench_eval_target_latency_ms").record(latency);
        metrics::counter!("ragbench_eval_units_total").increment(self.scorers.len() as u64);

        let record = match predicted {
            Ok(output) => self.score(output, latency_ms).await,
            Err(error) => {
                warn!(example_id = %self.example.id, error = %error, "target call failed");
                self.telemetry.inc_target_failures();
                self.telemetry.inc_unit_failures(self.scorers.len() as u64);
                for name in self.scorer_names.iter() {
                    metrics::counter!("ragbench_eval_unit_failures_total", "scorer" => name.clone())
                        .increment(1);
                }
                EvaluationRecord::all_failed(
                    &self.example,
                    self.args.clone(),
                    &self.scorer_names,
                    &error,
                    latency_ms,
                )
            }
        };
        self.telemetry.inc_examples_completed();
        self.telemetry.exit();
        record
    }

    async fn score(&self, output: ModelOutput, latency_ms: u64) -> EvaluationRecord {
        let units = self.scorers.iter().map(|scorer| {
            let semaphore = Arc::clone(&self.semaphore);
            let output = &output;
            async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let outcome = match guarded(self.timeout, scorer.score(output, &self.example)).await
                {
                    Ok(values) => MetricOutcome::from_values(values),
                    Err(error) => MetricOutcome::failed(error),
                };
                (scorer.name().to_string(), outcome)
            }
        });
        let outcomes = join_all(units).await;

        let mut metric_scores = BTreeMap::new();
        for (name, outcome) in outcomes {
            if let MetricOutcome::Failed { error } = &outcome {
                warn!(example_id = %self.example.id, scorer = %name, error = %error, "scorer failed");
                self.telemetry.inc_unit_failures(1);
                metrics::counter!("ragbench_eval_unit_failures_total", "scorer" => name.clone())
                    .increment(1);
            } else {
                self.telemetry.inc_units_scored(1);
            }
            metric_scores.insert(name, outcome);
        }

        EvaluationRecord {
            example_id: self.example.id.clone(),
            model_input: self.args.clone(),
            model_output: Some(output),
            ground_truth: self.example.ground_truth.clone(),
            metric_scores,
            model_latency_ms: latency_ms,
            target_error: None,
        }
    }
}

/// Runs `fut` under an optional deadline, converting errors and panics to messages.
async fn guarded<T, F>(timeout: Option<Duration>, fut: F) -> Result<T, String>
where
    F: Future<Output = anyhow::Result<T>>,
{
    let caught = AssertUnwindSafe(fut).catch_unwind();
    let settled = match timeout {
        Some(limit) => match tokio::time::timeout(limit, caught).await {
            Ok(settled) => settled,
            Err(_) => return Err(format!("timed out after {} ms", limit.as_millis())),
        },
        None => caught.await,
    };
    match settled {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(format!("{error:#}")),
        Err(payload) => Err(format!("panicked: {}", panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
