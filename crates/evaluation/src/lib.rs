pub mod clients;
pub mod harness;
pub mod model;
pub mod pipeline;
pub mod reply;
pub mod scorer;
pub mod scorers;
pub mod stats;
pub mod telemetry;

pub use clients::{ChatClient, ChatConfig, LlmQueryEnhancer};
pub use harness::{Evaluation, EvaluationConfig, EvaluationRecord};
pub use model::{
    Model, ModelOutput, Preprocess, RetrieverModel, question_only, with_k, with_rerank,
};
pub use pipeline::{
    EnhancedQuery, GenerationRequest, QueryEnhancedRagPipeline, QueryEnhancer, RagPipeline,
    ResponseGenerator,
};
pub use scorer::{MetricOutcome, ScoreMap, Scorer};
pub use stats::{EvaluationSummary, FieldStats, MetricSummary};
pub use telemetry::{EvaluationTelemetry, EvaluationTelemetrySnapshot};
