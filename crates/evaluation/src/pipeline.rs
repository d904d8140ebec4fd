//! Retrieval-augmented generation targets.

use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use common::{CallArgs, Query, RetrievedChunk};
use futures::future::try_join_all;
use search_core::{IndexStore, Retriever};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{Model, ModelOutput, to_query};

/// A rewritten query plus the sub-queries used for retrieval.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnhancedQuery {
    pub rewritten: String,
    #[serde(default)]
    pub search_queries: Vec<String>,
    #[serde(default)]
    pub intent: String,
}

#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub query: &'a str,
    pub enhanced_query: Option<&'a EnhancedQuery>,
    pub context: &'a [RetrievedChunk],
}

#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: GenerationRequest<'_>) -> anyhow::Result<String>;
}

#[async_trait]
pub trait QueryEnhancer: Send + Sync {
    async fn enhance(&self, query: &str) -> anyhow::Result<EnhancedQuery>;
}

/// Retrieve, resolve, then generate an answer grounded in the hits.
pub struct RagPipeline {
    name: String,
    retriever: Arc<dyn Retriever>,
    store: Arc<IndexStore>,
    generator: Arc<dyn ResponseGenerator>,
    top_k: Option<usize>,
    top_n: Option<usize>,
}

impl RagPipeline {
    pub fn new(
        retriever: Arc<dyn Retriever>,
        store: Arc<IndexStore>,
        generator: Arc<dyn ResponseGenerator>,
    ) -> Self {
        let name = format!("rag_{}", retriever.name());
        Self {
            name,
            retriever,
            store,
            generator,
            top_k: None,
            top_n: None,
        }
    }

    #[must_use]
    pub const fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    #[must_use]
    pub const fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = Some(top_n);
        self
    }

    /// Call arguments win over the pipeline's own cutoffs.
    fn query(&self, args: &CallArgs) -> Query {
        let mut query = to_query(args);
        query.top_k = query.top_k.or(self.top_k);
        query.top_n = query.top_n.or(self.top_n);
        query
    }
}

#[async_trait]
impl Model for RagPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    async fn predict(&self, args: &CallArgs) -> anyhow::Result<ModelOutput> {
        let result = self.retriever.retrieve(&self.query(args)).await?;
        let context = self.store.resolve(&result)?;
        let answer = self
            .generator
            .generate(GenerationRequest {
                query: &args.query,
                enhanced_query: None,
                context: &context,
            })
            .await?;
        debug!(pipeline = %self.name, hits = context.len(), "generated answer");
        Ok(ModelOutput {
            answer: Some(answer),
            context,
            enhanced_query: None,
        })
    }
}

/// Expands the query first and retrieves for every sub-query.
pub struct QueryEnhancedRagPipeline {
    name: String,
    retriever: Arc<dyn Retriever>,
    store: Arc<IndexStore>,
    generator: Arc<dyn ResponseGenerator>,
    enhancer: Arc<dyn QueryEnhancer>,
    top_k: usize,
}

impl QueryEnhancedRagPipeline {
    pub fn new(
        retriever: Arc<dyn Retriever>,
        store: Arc<IndexStore>,
        generator: Arc<dyn ResponseGenerator>,
        enhancer: Arc<dyn QueryEnhancer>,
    ) -> Self {
        let name = format!("query_enhanced_rag_{}", retriever.name());
        Self {
            name,
            retriever,
            store,
            generator,
            enhancer,
            top_k: 5,
        }
    }

    #[must_use]
    pub const fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }
}

#[async_trait]
impl Model for QueryEnhancedRagPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    async fn predict(&self, args: &CallArgs) -> anyhow::Result<ModelOutput> {
        let top_k = args.top_k.unwrap_or(self.top_k);
        let enhanced = self.enhancer.enhance(&args.query).await?;

        let mut queries = vec![args.query.clone()];
        for sub_query in &enhanced.search_queries {
            if !sub_query.trim().is_empty() && !queries.contains(sub_query) {
                queries.push(sub_query.clone());
            }
        }
        let results = try_join_all(queries.iter().map(|text| {
            let query = Query {
                text: text.clone(),
                top_k: Some(top_k),
                top_n: args.top_n,
            };
            async move { self.retriever.retrieve(&query).await }
        }))
        .await?;

        let context = merge_first_hit(
            results
                .iter()
                .map(|result| self.store.resolve(result))
                .collect::<Result<Vec<_>, _>>()?,
            top_k,
        );
        debug!(
            pipeline = %self.name,
            sub_queries = queries.len(),
            hits = context.len(),
            "merged enhanced retrieval"
        );

        let answer = self
            .generator
            .generate(GenerationRequest {
                query: &args.query,
                enhanced_query: Some(&enhanced),
                context: &context,
            })
            .await?;
        Ok(ModelOutput {
            answer: Some(answer),
            context,
            enhanced_query: Some(enhanced.rewritten),
        })
    }
}

/// Concatenates ranked lists in order, keeping the first hit per chunk id, and re-ranks.
fn merge_first_hit(lists: Vec<Vec<RetrievedChunk>>, top_k: usize) -> Vec<RetrievedChunk> {
    let mut seen = HashSet::new();
    lists
        .into_iter()
        .flatten()
        .filter(|chunk| seen.insert(chunk.chunk_id.clone()))
        .take(top_k)
        .enumerate()
        .map(|(idx, chunk)| RetrievedChunk {
            rank: idx + 1,
            ..chunk
        })
        .collect()
}
