use std::{fs, path::Path};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Similarity {
    #[default]
    Cosine,
    DotProduct,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum IdfWeighting {
    /// `ln(N / df)`: terms present in every chunk weigh nothing.
    #[default]
    Plain,
    /// `ln((1 + N) / (1 + df)) + 1`, the scikit-learn default.
    Smooth,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalSection {
    pub top_k: usize,
    pub top_n: usize,
    pub similarity: Similarity,
    pub idf: IdfWeighting,
}

impl Default for RetrievalSection {
    fn default() -> Self {
        Self {
            top_k: 5,
            top_n: 3,
            similarity: Similarity::Cosine,
            idf: IdfWeighting::Plain,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Bm25Section {
    pub k1: f32,
    pub b: f32,
}

impl Default for Bm25Section {
    fn default() -> Self {
        Self { k1: 1.5, b: 0.75 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FusionSection {
    pub alpha: f32,
}

impl Default for FusionSection {
    fn default() -> Self {
        Self { alpha: 0.5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EvaluationSection {
    pub max_concurrency: usize,
    pub unit_timeout_ms: Option<u64>,
}

impl Default for EvaluationSection {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            unit_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EmbeddingSection {
    pub model_path: String,
    pub batch_size: usize,
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            model_path: "models/all-minilm-l6-v2.onnx".to_string(),
            batch_size: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct RagConfig {
    pub retrieval: RetrievalSection,
    pub bm25: Bm25Section,
    pub fusion: FusionSection,
    pub evaluation: EvaluationSection,
    pub embedding: EmbeddingSection,
}

impl RagConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed reading config file: {}", path.display()))?;
            toml::from_str::<Self>(&raw)
                .with_context(|| format!("failed parsing config file: {}", path.display()))?
        } else {
            Self::default()
        };

        cfg.apply_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    /// Applies `RAGBENCH_*` overrides. Unparseable values keep the current
    /// setting.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(top_k) = lookup("RAGBENCH_TOP_K") {
            self.retrieval.top_k = top_k.trim().parse().unwrap_or(self.retrieval.top_k);
        }
        if let Some(top_n) = lookup("RAGBENCH_TOP_N") {
            self.retrieval.top_n = top_n.trim().parse().unwrap_or(self.retrieval.top_n);
        }
        if let Some(alpha) = lookup("RAGBENCH_FUSION_ALPHA") {
            self.fusion.alpha = alpha.trim().parse().unwrap_or(self.fusion.alpha);
        }
        if let Some(limit) = lookup("RAGBENCH_MAX_CONCURRENCY") {
            self.evaluation.max_concurrency = limit
                .trim()
                .parse()
                .unwrap_or(self.evaluation.max_concurrency);
        }
        if let Some(timeout) = lookup("RAGBENCH_UNIT_TIMEOUT_MS") {
            let timeout = timeout.trim();
            if timeout.is_empty() || timeout == "0" {
                self.evaluation.unit_timeout_ms = None;
            } else if let Ok(ms) = timeout.parse() {
                self.evaluation.unit_timeout_ms = Some(ms);
            }
        }
        if let Some(model) = lookup("RAGBENCH_MODEL_PATH") {
            self.embedding.model_path = model;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.retrieval.top_k == 0 || self.retrieval.top_n == 0 {
            bail!("retrieval.top_k and retrieval.top_n must be positive");
        }
        if !(0.0..=1.0).contains(&self.fusion.alpha) {
            bail!("fusion.alpha must lie in [0, 1], got {}", self.fusion.alpha);
        }
        if self.bm25.k1 < 0.0 || !(0.0..=1.0).contains(&self.bm25.b) {
            bail!("bm25.k1 must be >= 0 and bm25.b must lie in [0, 1]");
        }
        if self.evaluation.max_concurrency == 0 {
            bail!("evaluation.max_concurrency must be positive");
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be positive");
        }
        Ok(())
    }
}
