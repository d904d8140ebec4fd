pub mod judge;
pub mod response;
pub mod retrieval;

pub use judge::{AnswerJudge, Judge, JudgeCriterion, RetrievalJudge, judge_metrics};
pub use response::{NlpMetric, ResponseMetric, nlp_metrics};
pub use retrieval::{IrMetric, RetrievalMetric, ir_metrics};
