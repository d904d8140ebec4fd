use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::{Chunk, RagError, RagResult};

/// One labeled dataset row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Example {
    #[serde(default)]
    pub id: String,
    #[serde(alias = "query")]
    pub question: String,
    #[serde(default, alias = "answer")]
    pub ground_truth: Option<String>,
    /// Chunk ids or sources judged relevant to the question.
    #[serde(default, alias = "relevant_sources", alias = "relevant_ids")]
    pub relevant: Vec<String>,
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl Example {
    pub fn new(id: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            question: question.into(),
            ground_truth: None,
            relevant: Vec::new(),
            metadata: Map::new(),
        }
    }

    #[must_use]
    pub fn with_ground_truth(mut self, answer: impl Into<String>) -> Self {
        self.ground_truth = Some(answer.into());
        self
    }

    #[must_use]
    pub fn with_relevant<I, S>(mut self, relevant: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.relevant = relevant.into_iter().map(Into::into).collect();
        self
    }
}

/// Arguments handed to a target model for one example.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallArgs {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_n: Option<usize>,
}

impl CallArgs {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            top_k: None,
            top_n: None,
        }
    }
}

/// Reads a JSON array of examples. Rows without an id are numbered by
/// position so every record stays addressable.
pub fn load_examples(path: &Path) -> Result<Vec<Example>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading dataset: {}", path.display()))?;
    let mut examples = serde_json::from_str::<Vec<Example>>(&raw)
        .with_context(|| format!("failed parsing dataset: {}", path.display()))?;
    for (idx, example) in examples.iter_mut().enumerate() {
        if example.id.is_empty() {
            example.id = format!("example-{idx}");
        }
    }
    debug!(path = %path.display(), rows = examples.len(), "loaded dataset");
    Ok(examples)
}

/// Reads a JSON array of chunks. Missing positions are filled from array
/// order and missing token counts from whitespace splitting.
pub fn load_chunks(path: &Path) -> Result<Vec<Chunk>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading corpus: {}", path.display()))?;
    let mut chunks = serde_json::from_str::<Vec<Chunk>>(&raw)
        .with_context(|| format!("failed parsing corpus: {}", path.display()))?;
    for (idx, chunk) in chunks.iter_mut().enumerate() {
        if chunk.metadata.position == 0 {
            chunk.metadata.position = idx;
        }
        if chunk.metadata.token_count == 0 {
            chunk.metadata.token_count = chunk.text.split_whitespace().count();
        }
    }
    debug!(path = %path.display(), chunks = chunks.len(), "loaded corpus");
    Ok(chunks)
}

pub fn ensure_unique_ids(examples: &[Example]) -> RagResult<()> {
    let mut seen = std::collections::HashSet::with_capacity(examples.len());
    for example in examples {
        if !seen.insert(example.id.as_str()) {
            return Err(RagError::invalid(format!(
                "duplicate example id `{}`",
                example.id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{Example, ensure_unique_ids, load_chunks, load_examples};

    #[test]
    fn example_keeps_unknown_fields_as_metadata() {
        let example: Example = serde_json::from_str(
            r#"{"id":"q1","question":"how do I log images?","answer":"use wandb.Image","relevant_sources":["docs/log.md"],"difficulty":"easy"}"#,
        )
        .expect("example");
        assert_eq!(example.ground_truth.as_deref(), Some("use wandb.Image"));
        assert_eq!(example.relevant, vec!["docs/log.md".to_string()]);
        assert_eq!(example.metadata.get("difficulty").and_then(|v| v.as_str()), Some("easy"));
    }

    #[test]
    fn load_examples_numbers_rows_without_ids() {
        let mut path = std::env::temp_dir();
        path.push("ragbench-dataset-test.json");
        fs::write(&path, r#"[{"question":"a"},{"id":"named","question":"b"}]"#).expect("write");

        let examples = load_examples(path.as_path()).expect("examples");
        assert_eq!(examples[0].id, "example-0");
        assert_eq!(examples[1].id, "named");
    }

    #[test]
    fn load_chunks_fills_positions_and_token_counts() {
        let mut path = std::env::temp_dir();
        path.push("ragbench-corpus-test.json");
        fs::write(
            &path,
            r#"[{"id":"c0","text":"wandb logs images"},{"id":"c1","text":"wandb tracks metrics"}]"#,
        )
        .expect("write");

        let chunks = load_chunks(path.as_path()).expect("chunks");
        assert_eq!(chunks[1].metadata.position, 1);
        assert_eq!(chunks[0].metadata.token_count, 3);
    }

    #[test]
    fn duplicate_example_ids_are_rejected() {
        let examples = vec![Example::new("a", "q"), Example::new("a", "q2")];
        assert!(ensure_unique_ids(&examples).is_err());
    }
}
