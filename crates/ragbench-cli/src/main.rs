use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use common::{
    Chunk, Query, RagConfig,
    dataset::{load_chunks, load_examples},
};
use embeddings::{Embedder, EmbeddingConfig, EmbeddingEngine};
use evaluation::{Evaluation, EvaluationConfig, RetrieverModel, scorers::ir_metrics, with_rerank};
use search_core::{
    Bm25Retriever, CohereConfig, CohereRelevanceModel, DenseRetriever, DenseRetrieverWithReranker,
    EmbeddingRelevanceModel, FusionStrategy, HybridFusionRetriever, IndexStore, MinMaxFusion,
    ReciprocalRankFusion, RelevanceModel, Reranker, RetrievalDefaults, Retriever, TfIdfRetriever,
};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "ragbench")]
#[command(about = "Retrieval and RAG evaluation testbed")]
struct Cli {
    /// TOML config file; missing files fall back to defaults.
    #[arg(long, global = true, default_value = "ragbench.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RetrieverKind {
    Tfidf,
    Bm25,
    Dense,
    DenseRerank,
    Hybrid,
}

impl RetrieverKind {
    const fn needs_embedder(self) -> bool {
        matches!(self, Self::Dense | Self::DenseRerank | Self::Hybrid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FusionKind {
    MinMax,
    Rrf,
}

#[derive(Debug, clap::Args)]
struct RetrieverArgs {
    /// JSON array of chunks.
    #[arg(long)]
    corpus: PathBuf,
    #[arg(long, value_enum, default_value = "bm25")]
    retriever: RetrieverKind,
    #[arg(long, value_enum, default_value = "min-max")]
    fusion: FusionKind,
    /// Rerank hybrid candidates before the top_n cut.
    #[arg(long)]
    rerank: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Retrieve chunks for one query.
    Search {
        #[command(flatten)]
        target: RetrieverArgs,
        #[arg(long)]
        query: String,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long)]
        top_n: Option<usize>,
    },
    /// Score a retriever against a labeled dataset with rank metrics.
    EvalRetrieval {
        #[command(flatten)]
        target: RetrieverArgs,
        /// JSON array of examples with `relevant` labels.
        #[arg(long)]
        dataset: PathBuf,
        /// Metric cutoff and final result count.
        #[arg(long)]
        k: Option<usize>,
        /// Include per-example records in the output.
        #[arg(long)]
        records: bool,
    },
    /// Print the effective configuration.
    ShowConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = RagConfig::load(&cli.config)
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;

    match cli.command {
        Commands::Search {
            target,
            query,
            top_k,
            top_n,
        } => search(&config, &target, query, top_k, top_n).await,
        Commands::EvalRetrieval {
            target,
            dataset,
            k,
            records,
        } => eval_retrieval(&config, &target, &dataset, k, records).await,
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn search(
    config: &RagConfig,
    target: &RetrieverArgs,
    text: String,
    top_k: Option<usize>,
    top_n: Option<usize>,
) -> anyhow::Result<()> {
    let (store, retriever) = open_retriever(config, target).await?;
    let query = Query {
        text,
        top_k,
        top_n,
    };
    let result = retriever.retrieve(&query).await?;
    let hits = store.resolve(&result)?;
    let output = serde_json::json!({
        "retriever": retriever.name(),
        "query": query.text,
        "corpus_version": store.handle()?.version(),
        "hits": hits,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn eval_retrieval(
    config: &RagConfig,
    target: &RetrieverArgs,
    dataset: &Path,
    k: Option<usize>,
    keep_records: bool,
) -> anyhow::Result<()> {
    let examples = load_examples(dataset)?;
    let (store, retriever) = open_retriever(config, target).await?;
    let k = k.unwrap_or(config.retrieval.top_k);
    let name = format!("{}-ir@{k}", retriever.name());
    let evaluation = Evaluation::new(
        EvaluationConfig::from_section(name, &config.evaluation),
        examples,
        ir_metrics(k),
        with_rerank(k.max(config.retrieval.top_k), k),
    )?;
    let mut summary = evaluation
        .evaluate(Arc::new(RetrieverModel::new(retriever, store)))
        .await;
    if !keep_records {
        summary.records.clear();
    }
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn open_retriever(
    config: &RagConfig,
    target: &RetrieverArgs,
) -> anyhow::Result<(Arc<IndexStore>, Arc<dyn Retriever>)> {
    let chunks: Vec<Chunk> = load_chunks(&target.corpus)?;
    let store = Arc::new(if target.retriever.needs_embedder() {
        let embedder: Arc<dyn Embedder> = Arc::new(EmbeddingEngine::new(
            EmbeddingConfig::from_section(&config.embedding),
        ));
        IndexStore::with_embedder(embedder, config.embedding.batch_size)
    } else {
        IndexStore::new()
    });
    let index = store.build(chunks).await?;
    info!(
        corpus = %target.corpus.display(),
        chunks = index.len(),
        version = index.version(),
        "corpus indexed"
    );
    let retriever = build_retriever(config, target, &store)?;
    Ok((store, retriever))
}

fn build_retriever(
    config: &RagConfig,
    target: &RetrieverArgs,
    store: &Arc<IndexStore>,
) -> anyhow::Result<Arc<dyn Retriever>> {
    let defaults = RetrievalDefaults::from(&config.retrieval);
    let bm25 = || {
        Bm25Retriever::new(Arc::clone(store))
            .with_params(config.bm25)
            .with_defaults(defaults)
    };
    let dense = || {
        DenseRetriever::new(Arc::clone(store))
            .with_similarity(config.retrieval.similarity)
            .with_defaults(defaults)
    };
    let retriever: Arc<dyn Retriever> = match target.retriever {
        RetrieverKind::Tfidf => Arc::new(
            TfIdfRetriever::new(Arc::clone(store))
                .with_weighting(config.retrieval.idf)
                .with_defaults(defaults),
        ),
        RetrieverKind::Bm25 => Arc::new(bm25()),
        RetrieverKind::Dense => Arc::new(dense()),
        RetrieverKind::DenseRerank => Arc::new(
            DenseRetrieverWithReranker::new(dense(), reranker(store)?).with_defaults(defaults),
        ),
        RetrieverKind::Hybrid => {
            let fusion: Arc<dyn FusionStrategy> = match target.fusion {
                FusionKind::MinMax => Arc::new(MinMaxFusion::new(config.fusion.alpha)),
                FusionKind::Rrf => Arc::new(ReciprocalRankFusion::default()),
            };
            let mut hybrid =
                HybridFusionRetriever::new(Arc::clone(store), Arc::new(bm25()), Arc::new(dense()))
                    .with_fusion(fusion)
                    .with_defaults(defaults);
            if target.rerank {
                hybrid = hybrid.with_reranker(reranker(store)?);
            }
            Arc::new(hybrid)
        }
    };
    Ok(retriever)
}

/// Cohere when `COHERE_API_KEY` is set, otherwise cosine over the corpus embedder.
fn reranker(store: &Arc<IndexStore>) -> anyhow::Result<Reranker> {
    let model: Arc<dyn RelevanceModel> = match CohereConfig::from_env() {
        Some(cohere) => Arc::new(CohereRelevanceModel::new(cohere)?),
        None => {
            let embedder = store
                .embedder()
                .context("reranking needs an embedding model")?;
            Arc::new(EmbeddingRelevanceModel::new(Arc::clone(embedder)))
        }
    };
    info!(model = model.name(), "reranker configured");
    Ok(Reranker::new(Arc::clone(store), model))
}
