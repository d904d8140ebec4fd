use std::{
    collections::HashMap,
    hash::BuildHasher,
    path::Path,
    sync::{Arc, Mutex},
};

use ahash::RandomState;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use ort::{session::Session, value::Tensor};
use tokenizers::{EncodeInput, Tokenizer};

use crate::{
    config::{EmbeddingConfig, ExecutionDevice},
    similarity::l2_normalize,
    traits::Embedder,
};

/// Local sentence embedder: an ONNX encoder with mean pooling, or a
/// deterministic hashed bag-of-words fallback when pseudo embeddings are
/// allowed.
pub struct EmbeddingEngine {
    config: EmbeddingConfig,
    device_used: ExecutionDevice,
    backend: EmbeddingBackend,
}

enum EmbeddingBackend {
    Onnx(OnnxBackend),
    Pseudo(RandomState),
    Unavailable(String),
}

struct OnnxBackend {
    session: Mutex<Session>,
    tokenizer: Option<Arc<Tokenizer>>,
}

struct TokenBatch {
    input_ids: Vec<i64>,
    attention_mask: Vec<i64>,
    rows: usize,
    seq_len: usize,
}

impl EmbeddingEngine {
    pub fn new(config: EmbeddingConfig) -> Self {
        let device_used = resolve_device(config.execution_device);
        let backend = match build_backend(&config) {
            Ok(backend) => backend,
            Err(err) => EmbeddingBackend::Unavailable(err.to_string()),
        };
        Self {
            config,
            device_used,
            backend,
        }
    }

    pub const fn backend_name(&self) -> &'static str {
        match self.backend {
            EmbeddingBackend::Onnx(_) => "onnx",
            EmbeddingBackend::Pseudo(_) => "pseudo",
            EmbeddingBackend::Unavailable(_) => "unavailable",
        }
    }

    pub const fn device_mode(&self) -> &'static str {
        match self.device_used {
            ExecutionDevice::Cpu => "cpu",
            ExecutionDevice::GpuPreferred => "gpu",
        }
    }

    pub const fn vector_dim(&self) -> usize {
        self.config.vector_dim
    }

    /// Embeds `inputs` in slices of the configured batch size.
    pub fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let mut out = Vec::with_capacity(inputs.len());
        for slice in inputs.chunks(self.config.batch_size.max(1)) {
            let vectors = match &self.backend {
                EmbeddingBackend::Onnx(backend) => backend.embed(slice, &self.config)?,
                EmbeddingBackend::Pseudo(hasher) => slice
                    .iter()
                    .map(|input| pseudo_embed(hasher, input, self.config.vector_dim))
                    .collect::<Vec<_>>(),
                EmbeddingBackend::Unavailable(msg) => {
                    return Err(anyhow!(
                        "embedding unavailable: {msg}. set RAGBENCH_ALLOW_PSEUDO_EMBED=true only for offline runs"
                    ));
                }
            };
            out.extend(vectors);
        }
        Ok(out)
    }
}

#[async_trait]
impl Embedder for EmbeddingEngine {
    fn name(&self) -> &str {
        self.backend_name()
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.config.vector_dim)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.embed_batch(texts)
    }
}

impl OnnxBackend {
    fn embed(&self, inputs: &[String], cfg: &EmbeddingConfig) -> Result<Vec<Vec<f32>>> {
        let batch = tokenize(inputs, cfg, self.tokenizer.as_ref())?;
        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("embedding session lock poisoned"))?;

        let shape = vec![batch.rows as i64, batch.seq_len as i64];
        let ids = Tensor::<i64>::from_array((shape.clone(), batch.input_ids.clone()))?;
        let mask = Tensor::<i64>::from_array((shape.clone(), batch.attention_mask.clone()))?;
        let token_types =
            Tensor::<i64>::from_array((shape, vec![0i64; batch.rows * batch.seq_len]))?;

        let mut model_inputs = HashMap::new();
        for input in session.inputs() {
            let name = input.name().to_lowercase();
            let value = if name.contains("attention") && name.contains("mask") {
                mask.clone().upcast()
            } else if name.contains("token_type") {
                token_types.clone().upcast()
            } else {
                ids.clone().upcast()
            };
            model_inputs.insert(input.name().to_string(), value);
        }

        let mut outputs = session.run(model_inputs)?;
        let first_key = outputs
            .keys()
            .next()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("embedding model returned no outputs"))?;
        let output = outputs
            .remove(first_key)
            .ok_or_else(|| anyhow!("embedding model output extraction failed"))?;
        let (out_shape, values) = output
            .try_extract_tensor::<f32>()
            .map_err(|err| anyhow!("embedding output decode failed: {err}"))?;

        let mut vectors = pool_output(out_shape, values, &batch, cfg.vector_dim)?;
        for vector in &mut vectors {
            l2_normalize(vector);
        }
        Ok(vectors)
    }
}

/// Turns encoder output into one vector per row: rank-2 output is already
/// pooled, rank-3 output is mean-pooled over attended tokens.
fn pool_output(
    shape: &[i64],
    values: &[f32],
    batch: &TokenBatch,
    target_dim: usize,
) -> Result<Vec<Vec<f32>>> {
    if shape.len() < 2 || shape[0] <= 0 {
        return Err(anyhow!("embedding output shape {shape:?} is unsupported"));
    }
    let hidden = usize::try_from(shape[shape.len() - 1]).unwrap_or(0);
    if hidden == 0 {
        return Err(anyhow!("embedding output hidden dimension is invalid"));
    }

    if shape.len() == 2 {
        if values.len() < batch.rows * hidden {
            return Err(anyhow!(
                "embedding output tensor too small for {}x{hidden}",
                batch.rows
            ));
        }
        return Ok(values
            .chunks(hidden)
            .take(batch.rows)
            .map(|row| fit_vector_dim(row, target_dim))
            .collect());
    }

    let model_seq_len = usize::try_from(shape[shape.len() - 2]).unwrap_or(batch.seq_len);
    if values.len() < batch.rows * model_seq_len * hidden {
        return Err(anyhow!("embedding output tensor too small for mean pooling"));
    }

    let mut out = Vec::with_capacity(batch.rows);
    for row in 0..batch.rows {
        let mut pooled = vec![0.0f32; hidden];
        let mut attended = 0.0f32;
        for token in 0..model_seq_len {
            let mask_index = row * batch.seq_len + token.min(batch.seq_len.saturating_sub(1));
            if batch.attention_mask.get(mask_index).copied().unwrap_or(0) == 0 {
                continue;
            }
            attended += 1.0;
            let base = (row * model_seq_len + token) * hidden;
            for (acc, value) in pooled.iter_mut().zip(&values[base..base + hidden]) {
                *acc += value;
            }
        }
        if attended > 0.0 {
            for value in &mut pooled {
                *value /= attended;
            }
        }
        out.push(fit_vector_dim(&pooled, target_dim));
    }
    Ok(out)
}

fn fit_vector_dim(values: &[f32], target_dim: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; target_dim];
    let keep = values.len().min(target_dim);
    out[..keep].copy_from_slice(&values[..keep]);
    out
}

fn build_backend(config: &EmbeddingConfig) -> Result<EmbeddingBackend> {
    if config.allow_pseudo_fallback {
        return Ok(EmbeddingBackend::Pseudo(RandomState::with_seeds(
            0x5241_4742, 0x454e_4348, 0x7073_6575, 0x646f_0001,
        )));
    }
    let model_path = Path::new(&config.model_path);
    if !model_path.exists() {
        return Err(anyhow!(
            "embedding model not found at {}",
            model_path.display()
        ));
    }

    let session = Session::builder()
        .context("failed to create ONNX session builder")?
        .commit_from_file(model_path)
        .with_context(|| format!("failed to load ONNX model {}", model_path.display()))?;
    let tokenizer = load_tokenizer(config)?;

    Ok(EmbeddingBackend::Onnx(OnnxBackend {
        session: Mutex::new(session),
        tokenizer,
    }))
}

fn load_tokenizer(config: &EmbeddingConfig) -> Result<Option<Arc<Tokenizer>>> {
    let Some(path) = config.tokenizer_path.as_ref() else {
        return Ok(None);
    };
    let tokenizer = Tokenizer::from_file(path)
        .map_err(|err| anyhow!("failed loading tokenizer from {path}: {err}"))?;
    Ok(Some(Arc::new(tokenizer)))
}

fn tokenize(
    inputs: &[String],
    config: &EmbeddingConfig,
    tokenizer: Option<&Arc<Tokenizer>>,
) -> Result<TokenBatch> {
    let seq_len = config.max_sequence_length.max(1);
    let mut input_ids = vec![0i64; inputs.len() * seq_len];
    let mut attention_mask = vec![0i64; inputs.len() * seq_len];

    if let Some(tokenizer) = tokenizer {
        let encodings = tokenizer
            .encode_batch(
                inputs
                    .iter()
                    .map(|text| EncodeInput::Single(text.as_str().into()))
                    .collect::<Vec<_>>(),
                true,
            )
            .map_err(|err| anyhow!("tokenization failed: {err}"))?;
        for (row, encoding) in encodings.iter().enumerate() {
            for (col, token_id) in encoding.get_ids().iter().take(seq_len).enumerate() {
                input_ids[row * seq_len + col] = i64::from(*token_id);
                attention_mask[row * seq_len + col] = 1;
            }
        }
    } else {
        // Byte ids; only meaningful for models exported with a byte vocabulary.
        for (row, text) in inputs.iter().enumerate() {
            for (col, byte) in text.as_bytes().iter().take(seq_len).enumerate() {
                input_ids[row * seq_len + col] = i64::from(*byte) + 1;
                attention_mask[row * seq_len + col] = 1;
            }
        }
    }

    Ok(TokenBatch {
        input_ids,
        attention_mask,
        rows: inputs.len(),
        seq_len,
    })
}

fn resolve_device(preferred: ExecutionDevice) -> ExecutionDevice {
    match preferred {
        ExecutionDevice::GpuPreferred if gpu_runtime_available() => ExecutionDevice::GpuPreferred,
        _ => ExecutionDevice::Cpu,
    }
}

fn gpu_runtime_available() -> bool {
    std::env::var("RAGBENCH_GPU_AVAILABLE")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Hashes lowercase alphanumeric tokens into `dim` signed buckets, then
/// normalizes. Texts sharing words land close together.
fn pseudo_embed(hasher: &RandomState, input: &str, dim: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; dim.max(1)];
    let buckets = out.len() as u64;
    for token in input
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let hash = hasher.hash_one(token.to_lowercase());
        let bucket = usize::try_from(hash % buckets).unwrap_or(0);
        let sign = if hash & (1 << 63) == 0 { 1.0 } else { -1.0 };
        out[bucket] += sign;
    }
    l2_normalize(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use crate::{
        EmbeddingConfig, EmbeddingEngine, ExecutionDevice, cosine_similarity, traits::Embedder,
    };

    #[test]
    fn embeds_batch_with_expected_dimensions_in_pseudo_mode() {
        let engine = EmbeddingEngine::new(EmbeddingConfig {
            batch_size: 1,
            ..EmbeddingConfig::pseudo(8)
        });
        let vectors = engine
            .embed_batch(&["hello".to_string(), "world".to_string()])
            .expect("pseudo vectors");
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0].len(), 8);
        assert_eq!(engine.backend_name(), "pseudo");
    }

    #[test]
    fn pseudo_embeddings_are_deterministic_and_word_sensitive() {
        let engine = EmbeddingEngine::new(EmbeddingConfig::pseudo(64));
        let texts = [
            "wandb logs images".to_string(),
            "Wandb logs IMAGES".to_string(),
            "artifacts version datasets".to_string(),
        ];
        let first = engine.embed_batch(&texts).expect("vectors");
        let second = engine.embed_batch(&texts).expect("vectors");
        assert_eq!(first, second);
        assert!((cosine_similarity(&first[0], &first[1]) - 1.0).abs() < 1e-5);
        assert!(cosine_similarity(&first[0], &first[2]) < 0.99);
    }

    #[test]
    fn gpu_preferred_falls_back_to_cpu_when_unavailable() {
        let engine = EmbeddingEngine::new(EmbeddingConfig {
            execution_device: ExecutionDevice::GpuPreferred,
            ..EmbeddingConfig::default()
        });
        assert_eq!(engine.device_mode(), "cpu");
    }

    #[tokio::test]
    async fn reports_model_error_when_pseudo_disabled() {
        let engine = EmbeddingEngine::new(EmbeddingConfig {
            model_path: "/tmp/does-not-exist.onnx".to_string(),
            allow_pseudo_fallback: false,
            ..EmbeddingConfig::default()
        });
        let err = engine
            .embed(&["hello".to_string()])
            .await
            .expect_err("missing model should be reported");
        assert!(err.to_string().contains("embedding unavailable"));
    }
}
