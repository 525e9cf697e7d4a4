//! Batched, retried, deadline-bound calls into an [`Embedder`].
//!
//! The embedder is synchronous and may block for a long time, so every slice
//! runs on tokio's blocking pool. Retryable failures (timeouts, unavailable
//! service) back off exponentially; anything else is surfaced immediately.

use std::sync::Arc;
use std::time::Duration;

use localkb_core::config::EmbeddingConfig;
use localkb_core::error::EmbeddingError;
use localkb_core::traits::Embedder;
use localkb_core::types::Embedding;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub batch_size: usize,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub timeout: Duration,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self::from(&EmbeddingConfig::default())
    }
}

impl From<&EmbeddingConfig> for BatchPolicy {
    fn from(cfg: &EmbeddingConfig) -> Self {
        Self {
            batch_size: cfg.batch_size.max(1),
            max_attempts: cfg.max_attempts.max(1),
            initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            timeout: Duration::from_millis(cfg.timeout_ms),
        }
    }
}

#[derive(Clone)]
pub struct EmbedBatcher {
    inner: Arc<dyn Embedder>,
    policy: BatchPolicy,
}

impl EmbedBatcher {
    pub fn new(inner: Arc<dyn Embedder>, policy: BatchPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.inner
    }

    pub fn policy(&self) -> BatchPolicy {
        self.policy
    }

    /// Embeds every text, one output per input in input order. Fails as a whole
    /// if any slice exhausts its attempts; nothing partial is returned.
    pub async fn embed_all(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
        let mut out = Vec::with_capacity(texts.len());
        for (batch_no, slice) in texts.chunks(self.policy.batch_size).enumerate() {
            let vectors = self.embed_slice(batch_no, slice).await?;
            out.extend(vectors);
        }
        Ok(out)
    }

    /// Embeds a single query string.
    pub async fn embed_one(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        let mut v = self.embed_all(&[text.to_string()]).await?;
        v.pop().ok_or_else(|| EmbeddingError::ServiceUnavailable("embedder returned no vector".to_string()))
    }

    async fn embed_slice(&self, batch_no: usize, slice: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.call_once(slice).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < self.policy.max_attempts => {
                    let backoff = self.policy.initial_backoff * 2u32.saturating_pow(attempt - 1);
                    tracing::warn!(
                        target: "embed",
                        batch = batch_no,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "embedding batch failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn call_once(&self, slice: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
        let inner = Arc::clone(&self.inner);
        let texts = slice.to_vec();
        let task = tokio::task::spawn_blocking(move || inner.embed_batch(&texts));
        let vectors = match tokio::time::timeout(self.policy.timeout, task).await {
            Err(_) => return Err(EmbeddingError::Timeout(self.policy.timeout.as_millis() as u64)),
            Ok(Err(join)) => return Err(EmbeddingError::ServiceUnavailable(format!("embedding task failed: {join}"))),
            Ok(Ok(result)) => result?,
        };
        if vectors.len() != slice.len() {
            return Err(EmbeddingError::ServiceUnavailable(format!(
                "embedder returned {} vectors for {} inputs",
                vectors.len(),
                slice.len()
            )));
        }
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        failures_left: AtomicUsize,
        calls: AtomicUsize,
        error: EmbeddingError,
    }

    impl Embedder for Flaky {
        fn id(&self) -> &str {
            "flaky"
        }

        fn dim(&self) -> usize {
            2
        }

        fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(self.error.clone());
            }
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    fn policy(batch_size: usize) -> BatchPolicy {
        BatchPolicy {
            batch_size,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
        }
    }

    fn flaky(failures: usize, error: EmbeddingError) -> Arc<Flaky> {
        Arc::new(Flaky { failures_left: AtomicUsize::new(failures), calls: AtomicUsize::new(0), error })
    }

    #[tokio::test]
    async fn preserves_order_across_batches() {
        let e = flaky(0, EmbeddingError::InvalidInput(String::new()));
        let batcher = EmbedBatcher::new(e.clone(), policy(2));
        let texts: Vec<String> = ["a", "bb", "ccc", "dddd", "eeeee"].iter().map(|s| s.to_string()).collect();
        let out = batcher.embed_all(&texts).await.expect("embed");
        let lens: Vec<f32> = out.iter().map(|v| v[0]).collect();
        assert_eq!(lens, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(e.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let e = flaky(2, EmbeddingError::ServiceUnavailable("down".into()));
        let batcher = EmbedBatcher::new(e.clone(), policy(8));
        let out = batcher.embed_all(&["x".to_string()]).await.expect("third attempt succeeds");
        assert_eq!(out.len(), 1);
        assert_eq!(e.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let e = flaky(10, EmbeddingError::Timeout(5));
        let batcher = EmbedBatcher::new(e.clone(), policy(8));
        let err = batcher.embed_all(&["x".to_string()]).await.expect_err("exhausted");
        assert_eq!(err, EmbeddingError::Timeout(5));
        assert_eq!(e.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn invalid_input_is_not_retried() {
        let e = flaky(1, EmbeddingError::InvalidInput("bad".into()));
        let batcher = EmbedBatcher::new(e.clone(), policy(8));
        assert!(batcher.embed_all(&["x".to_string()]).await.is_err());
        assert_eq!(e.calls.load(Ordering::SeqCst), 1);
    }
}
