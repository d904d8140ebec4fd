//! Parsing of JSON objects embedded in free-form model replies.

use anyhow::{Context, Result, bail};
use serde::de::DeserializeOwned;

/// Returns the outermost `{...}` span of `reply`, ignoring code fences and prose.
pub fn json_object_span(reply: &str) -> Option<&str> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (end > start).then(|| &reply[start..=end])
}

pub fn parse_json_reply<T: DeserializeOwned>(reply: &str) -> Result<T> {
    let Some(span) = json_object_span(reply) else {
        bail!("reply contains no JSON object: {}", truncate(reply, 120));
    };
    serde_json::from_str(span).with_context(|| format!("malformed JSON reply: {}", truncate(span, 120)))
}

/// Extracts a finite numeric `score` field.
pub fn parse_score(reply: &str) -> Result<f64> {
    let value: serde_json::Value = parse_json_reply(reply)?;
    let Some(score) = value.get("score").and_then(serde_json::Value::as_f64) else {
        bail!("reply has no numeric score field");
    };
    if !score.is_finite() {
        bail!("reply score is not finite");
    }
    Ok(score)
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
