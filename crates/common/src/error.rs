use thiserror::Error;

/// Failures raised by index construction, retrieval and reranking.
///
/// Every variant is fatal to the call that produced it and leaves shared
/// state untouched: the index store is immutable once built.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RagError {
    #[error("cannot build an index from an empty corpus")]
    EmptyCorpus,
    #[error("index not built: {0}")]
    IndexNotBuilt(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("embedding failed: {0}")]
    EmbeddingFailure(String),
    #[error("rerank failed: {0}")]
    RerankFailure(String),
}

impl RagError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Self::EmptyCorpus => "empty_corpus",
            Self::IndexNotBuilt(_) => "index_not_built",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::EmbeddingFailure(_) => "embedding_failure",
            Self::RerankFailure(_) => "rerank_failure",
        }
    }
}

pub type RagResult<T> = Result<T, RagError>;

#[cfg(test)]
mod tests {
    use super::RagError;

    #[test]
    fn display_includes_detail() {
        let err = RagError::invalid("k must be positive");
        assert_eq!(err.to_string(), "invalid argument: k must be positive");
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[test]
    fn index_not_built_names_missing_part() {
        let err = RagError::IndexNotBuilt("dense embeddings");
        assert!(err.to_string().contains("dense embeddings"));
    }
}
