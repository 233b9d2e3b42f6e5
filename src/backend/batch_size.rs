//! Batch-size discovery policies.
//!
//! Epistemic foundation:
//! - I^R: A configured batch size is used as-is
//! - I^B: Otherwise capacity is unknown → double a trial batch until the backend refuses

use super::{ModelBackend, SamplingConfig};
use crate::models::{EvalError, Result};
use async_trait::async_trait;
use tracing::{debug, info};

/// Decides how many tasks may be in flight against a backend.
#[async_trait]
pub trait BatchSizePolicy: Send + Sync {
    async fn discover(&self, backend: &dyn ModelBackend) -> Result<usize>;
}

/// Always the same batch size.
#[derive(Debug, Clone, Copy)]
pub struct FixedBatchSize(pub usize);

#[async_trait]
impl BatchSizePolicy for FixedBatchSize {
    async fn discover(&self, _backend: &dyn ModelBackend) -> Result<usize> {
        Ok(self.0.max(1))
    }
}

/// Backend hint if present, else the largest trial batch the backend accepts.
#[derive(Debug, Clone, Copy)]
pub struct DoublingBatchSize {
    pub start: usize,
    pub max: usize,
}

const SIZING_PROMPT: &str = "Reply with the single word OK.";

#[async_trait]
impl BatchSizePolicy for DoublingBatchSize {
    async fn discover(&self, backend: &dyn ModelBackend) -> Result<usize> {
        if let Some(hint) = backend.batch_size_hint() {
            debug!(backend = %backend.key(), hint, "Using backend batch-size hint");
            return Ok(hint.max(1));
        }

        let max = self.max.max(1);
        let mut size = self.start.clamp(1, max);
        let mut accepted = 0;

        while size <= max {
            let prompts = vec![SIZING_PROMPT.to_string(); size];
            match backend
                .batched_generate(&prompts, 1, &SamplingConfig::greedy())
                .await
            {
                Ok(_) => {
                    accepted = size;
                    if size == max {
                        break;
                    }
                    size = (size * 2).min(max);
                }
                Err(EvalError::CapacityExceeded(reason)) => {
                    debug!(size, %reason, "Trial batch refused");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        if accepted == 0 {
            return Err(EvalError::CapacityExceeded(format!(
                "{} refused a trial batch of {}",
                backend.key(),
                self.start.max(1)
            )));
        }
        info!(backend = %backend.key(), batch_size = accepted, "Discovered batch size");
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::StubBackend;

    #[tokio::test]
    async fn test_doubling_stops_at_capacity() {
        let backend = StubBackend::new("sizing").with_capacity(12);
        let policy = DoublingBatchSize { start: 1, max: 64 };
        assert_eq!(policy.discover(&backend).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_doubling_caps_at_max() {
        let backend = StubBackend::new("sizing");
        let policy = DoublingBatchSize { start: 3, max: 20 };
        assert_eq!(policy.discover(&backend).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_doubling_fails_when_nothing_fits() {
        let backend = StubBackend::new("sizing").with_capacity(0);
        let policy = DoublingBatchSize { start: 1, max: 8 };
        assert!(matches!(
            policy.discover(&backend).await,
            Err(EvalError::CapacityExceeded(_))
        ));
    }

    #[tokio::test]
    async fn test_hint_wins_over_doubling() {
        let backend = StubBackend::new("sizing").with_hint(5);
        let policy = DoublingBatchSize { start: 1, max: 64 };
        assert_eq!(policy.discover(&backend).await.unwrap(), 5);
        assert_eq!(FixedBatchSize(0).discover(&backend).await.unwrap(), 1);
    }
}
