//! Scorers that delegate grading to a language model.

use std::{fmt::Write as _, sync::Arc};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use common::{Example, RetrievedChunk};
use futures::future::try_join_all;

use crate::{
    model::ModelOutput,
    reply::parse_score,
    scorer::{ScoreMap, Scorer},
};

/// A chat-style completion endpoint used for grading.
#[async_trait]
pub trait Judge: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, system: &str, user: &str) -> Result<String>;
}

const REPLY_FORMAT: &str = "Reply with a JSON object only: {\"score\": <number>, \"reason\": \"<one sentence>\"}.";

const CORRECTNESS_SYSTEM: &str = "You grade answers to questions about a software library. \
Compare the candidate answer with the reference answer. Score 1 when the candidate is wrong \
or contradicts the reference, 3 when it is partially correct, 5 when it is fully correct and complete.";

const RELEVANCE_SYSTEM: &str = "You grade whether an answer addresses the user's question. \
Score 1 when the answer is off-topic, 3 when it addresses the question only in part, \
5 when it directly and completely addresses the question.";

const FAITHFULNESS_SYSTEM: &str = "You grade whether an answer is supported by the supplied context. \
Score 1 when the answer makes claims the context does not support, 3 when some claims are \
unsupported, 5 when every claim is grounded in the context.";

const CHUNK_RELEVANCE_SYSTEM: &str = "You judge whether a retrieved document helps answer a question. \
Score 1 when the document is relevant and 0 when it is not.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JudgeCriterion {
    Correctness,
    Relevance,
    Faithfulness,
}

impl JudgeCriterion {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Correctness => "answer_correctness",
            Self::Relevance => "answer_relevance",
            Self::Faithfulness => "faithfulness",
        }
    }

    const fn system_prompt(self) -> &'static str {
        match self {
            Self::Correctness => CORRECTNESS_SYSTEM,
            Self::Relevance => RELEVANCE_SYSTEM,
            Self::Faithfulness => FAITHFULNESS_SYSTEM,
        }
    }
}

/// Grades the generated answer on a 1 to 5 scale.
pub struct AnswerJudge {
    criterion: JudgeCriterion,
    judge: Arc<dyn Judge>,
}

impl AnswerJudge {
    pub fn new(criterion: JudgeCriterion, judge: Arc<dyn Judge>) -> Self {
        Self { criterion, judge }
    }

    fn user_prompt(&self, output: &ModelOutput, example: &Example) -> Result<String> {
        let answer = output
            .answer
            .as_deref()
            .ok_or_else(|| anyhow!("{}: target produced no answer", self.name()))?;
        let mut prompt = format!("Question: {}\n\n", example.question);
        match self.criterion {
            JudgeCriterion::Correctness => {
                let reference = example
                    .ground_truth
                    .as_deref()
                    .ok_or_else(|| anyhow!("{}: example has no ground truth", self.name()))?;
                let _ = writeln!(prompt, "Reference answer: {reference}\n");
            }
            JudgeCriterion::Faithfulness => {
                if output.context.is_empty() {
                    bail!("{}: target returned no context", self.name());
                }
                let _ = writeln!(prompt, "Context:\n{}", render_context(&output.context));
            }
            JudgeCriterion::Relevance => {}
        }
        let _ = write!(prompt, "Candidate answer: {answer}\n\n{REPLY_FORMAT}");
        Ok(prompt)
    }
}

#[async_trait]
impl Scorer for AnswerJudge {
    fn name(&self) -> &str {
        self.criterion.label()
    }

    async fn score(&self, output: &ModelOutput, example: &Example) -> Result<ScoreMap> {
        let prompt = self.user_prompt(output, example)?;
        let reply = self
            .judge
            .complete(self.criterion.system_prompt(), &prompt)
            .await?;
        let raw = parse_score(&reply)?;
        if !(1.0..=5.0).contains(&raw) {
            bail!("{}: score {raw} outside 1..=5", self.name());
        }
        Ok(ScoreMap::from([
            ("raw".to_string(), raw),
            ("score".to_string(), (raw - 1.0) / 4.0),
        ]))
    }
}

/// Rates every retrieved chunk and summarizes the ranking.
pub struct RetrievalJudge {
    judge: Arc<dyn Judge>,
}

impl RetrievalJudge {
    pub fn new(judge: Arc<dyn Judge>) -> Self {
        Self { judge }
    }

    async fn rate(&self, question: &str, chunk: &RetrievedChunk) -> Result<f64> {
        let prompt = format!(
            "Question: {question}\n\nDocument ({}):\n{}\n\n{REPLY_FORMAT}",
            chunk.source, chunk.text
        );
        let reply = self.judge.complete(CHUNK_RELEVANCE_SYSTEM, &prompt).await?;
        let score = parse_score(&reply)?;
        if !(0.0..=1.0).contains(&score) {
            bail!("retrieval_judge: chunk {} scored {score} outside 0..=1", chunk.chunk_id);
        }
        Ok(score)
    }
}

#[async_trait]
impl Scorer for RetrievalJudge {
    fn name(&self) -> &str {
        "retrieval_judge"
    }

    #[allow(clippy::cast_precision_loss)]
    async fn score(&self, output: &ModelOutput, example: &Example) -> Result<ScoreMap> {
        if output.context.is_empty() {
            bail!("retrieval_judge: target returned no context");
        }
        let ratings = try_join_all(
            output
                .context
                .iter()
                .map(|chunk| self.rate(&example.question, chunk)),
        )
        .await?;

        let mean = ratings.iter().sum::<f64>() / ratings.len() as f64;
        let first = ratings.iter().position(|score| *score >= 0.5);
        Ok(ScoreMap::from([
            ("mean_relevance".to_string(), mean),
            (
                "first_relevant_rank".to_string(),
                first.map_or(0.0, |pos| (pos + 1) as f64),
            ),
            (
                "reciprocal_rank".to_string(),
                first.map_or(0.0, |pos| 1.0 / (pos + 1) as f64),
            ),
        ]))
    }
}

/// Correctness, relevance, faithfulness and the retrieval judge over one client.
pub fn judge_metrics(judge: &Arc<dyn Judge>) -> Vec<Arc<dyn Scorer>> {
    vec![
        Arc::new(AnswerJudge::new(JudgeCriterion::Correctness, Arc::clone(judge))),
        Arc::new(AnswerJudge::new(JudgeCriterion::Relevance, Arc::clone(judge))),
        Arc::new(AnswerJudge::new(JudgeCriterion::Faithfulness, Arc::clone(judge))),
        Arc::new(RetrievalJudge::new(Arc::clone(judge))),
    ]
}

pub(crate) fn render_context(context: &[RetrievedChunk]) -> String {
    let mut rendered = String::new();
    for chunk in context {
        let _ = writeln!(rendered, "[{}] ({}) {}", chunk.rank, chunk.source, chunk.text);
    }
    rendered
}
