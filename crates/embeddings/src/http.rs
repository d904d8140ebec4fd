use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::warn;

/// Retry policy owned by HTTP collaborators. Rate limits, server errors and
/// transport errors are retried with exponential backoff; other statuses fail
/// immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
        }
    }

    fn backoff(&self, attempt: usize) -> Duration {
        let factor = 1u32 << attempt.min(6);
        self.initial_backoff.saturating_mul(factor)
    }
}

pub fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Sends the request produced by `build` and decodes a JSON body, retrying
/// per `policy`. `build` is called once per attempt.
pub async fn send_json<T, F>(policy: &RetryPolicy, label: &str, build: F) -> Result<T>
where
    T: DeserializeOwned,
    F: Fn() -> RequestBuilder,
{
    let mut attempt = 0usize;
    loop {
        match build().send().await {
            Ok(response) if response.status().is_success() => {
                return response
                    .json::<T>()
                    .await
                    .with_context(|| format!("{label}: response body is not the expected JSON"));
            }
            Ok(response) => {
                let status = response.status();
                if !is_retryable(status) || attempt >= policy.max_retries {
                    let body = response.text().await.unwrap_or_default();
                    bail!("{label}: http {status}: {body}");
                }
                warn!(label, status = status.as_u16(), attempt, "retrying request");
            }
            Err(err) => {
                if attempt >= policy.max_retries {
                    return Err(err).with_context(|| format!("{label}: request failed"));
                }
                warn!(label, error = %err, attempt, "retrying request after transport error");
            }
        }
        tokio::time::sleep(policy.backoff(attempt)).await;
        attempt += 1;
    }
}
