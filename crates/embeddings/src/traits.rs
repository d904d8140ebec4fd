use async_trait::async_trait;

/// Maps texts to fixed-dimension vectors.
///
/// The same embedder must be used for indexing a corpus and for embedding the
/// queries run against it. Implementations are shared behind `Arc<dyn
/// Embedder>` across tasks, so they must be `Send + Sync`.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    /// Output dimensionality when known ahead of the first call.
    fn dimension(&self) -> Option<usize>;

    /// Returns exactly one vector per input text, in input order.
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;
}
