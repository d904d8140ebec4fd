use common::config::EmbeddingSection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionDevice {
    Cpu,
    GpuPreferred,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingConfig {
    pub model_path: String,
    pub tokenizer_path: Option<String>,
    pub vector_dim: usize,
    pub max_sequence_length: usize,
    pub batch_size: usize,
    pub execution_device: ExecutionDevice,
    pub allow_pseudo_fallback: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let model_path = std::env::var("RAGBENCH_MODEL_PATH")
            .unwrap_or_else(|_| EmbeddingSection::default().model_path);
        Self::with_model_path(model_path, EmbeddingSection::default().batch_size)
    }
}

impl EmbeddingConfig {
    /// Builds the engine config from the `[embedding]` section of a loaded
    /// `RagConfig`, which has already applied `RAGBENCH_MODEL_PATH`.
    pub fn from_section(section: &EmbeddingSection) -> Self {
        Self::with_model_path(section.model_path.clone(), section.batch_size)
    }

    /// Deterministic hashed-token embeddings, for tests and offline runs.
    pub fn pseudo(vector_dim: usize) -> Self {
        Self {
            vector_dim,
            allow_pseudo_fallback: true,
            ..Self::default()
        }
    }

    fn with_model_path(model_path: String, batch_size: usize) -> Self {
        let tokenizer_path = std::env::var("RAGBENCH_TOKENIZER_PATH").ok().or_else(|| {
            let candidate = std::path::Path::new(&model_path).with_extension("tokenizer.json");
            if candidate.exists() {
                Some(candidate.display().to_string())
            } else {
                None
            }
        });
        Self {
            model_path,
            tokenizer_path,
            vector_dim: 384,
            max_sequence_length: 256,
            batch_size: batch_size.max(1),
            execution_device: ExecutionDevice::from_env(),
            allow_pseudo_fallback: std::env::var("RAGBENCH_ALLOW_PSEUDO_EMBED")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(cfg!(test)),
        }
    }
}

impl ExecutionDevice {
    pub fn from_env() -> Self {
        let raw = std::env::var("RAGBENCH_EMBEDDING_DEVICE").unwrap_or_default();
        if raw.eq_ignore_ascii_case("gpu") {
            Self::GpuPreferred
        } else {
            Self::Cpu
        }
    }
}
