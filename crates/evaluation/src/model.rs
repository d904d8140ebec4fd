use std::sync::Arc;

use async_trait::async_trait;
use common::{CallArgs, Example, Query, RetrievedChunk};
use search_core::{IndexStore, Retriever};
use serde::{Deserialize, Serialize};

/// Whatever a target produced for one example.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default)]
    pub context: Vec<RetrievedChunk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enhanced_query: Option<String>,
}

/// The system under evaluation: a bare retriever or a full pipeline.
#[async_trait]
pub trait Model: Send + Sync {
    fn name(&self) -> &str;

    async fn predict(&self, args: &CallArgs) -> anyhow::Result<ModelOutput>;
}

/// Maps a dataset row to the call arguments of a target.
pub type Preprocess = Arc<dyn Fn(&Example) -> CallArgs + Send + Sync>;

pub fn question_only() -> Preprocess {
    Arc::new(|example: &Example| CallArgs::new(example.question.clone()))
}

pub fn with_k(k: usize) -> Preprocess {
    Arc::new(move |example: &Example| CallArgs {
        top_k: Some(k),
        ..CallArgs::new(example.question.clone())
    })
}

pub fn with_rerank(top_k: usize, top_n: usize) -> Preprocess {
    Arc::new(move |example: &Example| CallArgs {
        query: example.question.clone(),
        top_k: Some(top_k),
        top_n: Some(top_n),
    })
}

pub(crate) fn to_query(args: &CallArgs) -> Query {
    Query {
        text: args.query.clone(),
        top_k: args.top_k,
        top_n: args.top_n,
    }
}

/// Exposes a retriever as a target; its output is the resolved ranking.
pub struct RetrieverModel {
    retriever: Arc<dyn Retriever>,
    store: Arc<IndexStore>,
}

impl RetrieverModel {
    pub fn new(retriever: Arc<dyn Retriever>, store: Arc<IndexStore>) -> Self {
        Self { retriever, store }
    }
}

#[async_trait]
impl Model for RetrieverModel {
    fn name(&self) -> &str {
        self.retriever.name()
    }

    async fn predict(&self, args: &CallArgs) -> anyhow::Result<ModelOutput> {
        let result = self.retriever.retrieve(&to_query(args)).await?;
        Ok(ModelOutput {
            context: self.store.resolve(&result)?,
            ..ModelOutput::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use common::{CallArgs, Chunk, Example};
    use search_core::{Bm25Retriever, IndexStore};

    use super::{Model, RetrieverModel, question_only, with_k, with_rerank};

    #[test]
    fn preprocess_helpers_shape_call_args() {
        let example = Example::new("q1", "how do I log images?");
        assert_eq!(question_only()(&example), CallArgs::new("how do I log images?"));
        assert_eq!(with_k(4)(&example).top_k, Some(4));
        let rerank = with_rerank(20, 10)(&example);
        assert_eq!((rerank.top_k, rerank.top_n), (Some(20), Some(10)));
    }

    #[tokio::test]
    async fn retriever_model_resolves_context() {
        let store = Arc::new(IndexStore::new());
        store
            .build(vec![
                Chunk::new("c0", "wandb logs images").with_source("log.md"),
                Chunk::new("c1", "artifacts version datasets").with_source("artifacts.md"),
            ])
            .await
            .expect("build");
        let model = RetrieverModel::new(Arc::new(Bm25Retriever::new(Arc::clone(&store))), store);

        let output = model
            .predict(&CallArgs {
                top_k: Some(1),
                ..CallArgs::new("log images")
            })
            .await
            .expect("predict");
        assert_eq!(model.name(), "bm25");
        assert_eq!(output.context.len(), 1);
        assert_eq!(output.context[0].source, "log.md");
        assert!(output.answer.is_none());
    }
}
