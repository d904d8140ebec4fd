pub mod config;
pub mod engine;
pub mod http;
pub mod remote;
pub mod similarity;
pub mod traits;

pub use config::{EmbeddingConfig, ExecutionDevice};
pub use engine::EmbeddingEngine;
pub use http::RetryPolicy;
pub use remote::{RemoteEmbedder, RemoteEmbedderConfig};
pub use similarity::{cosine_similarity, dot_product, l2_normalize};
pub use traits::Embedder;
