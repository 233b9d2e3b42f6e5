//! Hosted API backend (generation only).

use super::{BackendKey, ModelBackend, RawGeneration, SamplingConfig, ScoringSequence, TokenScores};
use crate::client::{ApiPricing, CompletionParams, LLMClient, Message};
use crate::models::{ApiConfig, EvalError, Result};
use async_trait::async_trait;
use futures::future::try_join_all;
use std::sync::Arc;

/// Sends each prompt as a single user message to a chat completions API.
pub struct ApiBackend {
    key: BackendKey,
    client: Arc<LLMClient>,
    concurrency: usize,
}

impl ApiBackend {
    pub fn new(key: BackendKey, api: &ApiConfig, api_key: String) -> Result<Self> {
        let client = LLMClient::new(
            key.to_string(),
            Some(api_key),
            api.base_url.clone(),
            api.timeout_secs,
            api.max_retries,
            ApiPricing {
                input_per_1m: api.input_price_per_1m,
                output_per_1m: api.output_price_per_1m,
            },
        )?;
        Ok(Self::with_client(key, Arc::new(client), api.concurrency))
    }

    pub fn with_client(key: BackendKey, client: Arc<LLMClient>, concurrency: usize) -> Self {
        Self {
            key,
            client,
            concurrency: concurrency.max(1),
        }
    }

    pub fn client(&self) -> &Arc<LLMClient> {
        &self.client
    }
}

#[async_trait]
impl ModelBackend for ApiBackend {
    fn key(&self) -> &BackendKey {
        &self.key
    }

    fn supports_forward(&self) -> bool {
        false
    }

    async fn batched_generate(
        &self,
        prompts: &[String],
        max_new_tokens: u32,
        sampling: &SamplingConfig,
    ) -> Result<Vec<RawGeneration>> {
        let params = CompletionParams {
            max_tokens: max_new_tokens,
            temperature: Some(sampling.temperature),
            top_p: sampling.top_p,
            stop: sampling.stop.clone(),
            seed: sampling.seed,
        };

        try_join_all(prompts.iter().map(|prompt| {
            let params = &params;
            async move {
                let messages = [Message::user(prompt.as_str())];
                let response = self
                    .client
                    .complete(&self.key.model_id, &messages, params)
                    .await?;
                Ok::<_, EvalError>(RawGeneration {
                    text: response.content,
                    payload: response.payload,
                    input_tokens: response.input_tokens,
                    output_tokens: response.output_tokens,
                    cost_usd: response.cost_usd,
                })
            }
        }))
        .await
    }

    async fn batched_forward(&self, _sequences: &[ScoringSequence]) -> Result<Vec<TokenScores>> {
        Err(EvalError::Unsupported {
            backend: self.key.to_string(),
            operation: "forward scoring",
        })
    }

    fn batch_size_hint(&self) -> Option<usize> {
        Some(self.concurrency)
    }

    async fn shutdown(&self) -> Result<()> {
        let (input, output) = self.client.total_tokens();
        tracing::info!(
            backend = %self.key,
            input_tokens = input,
            output_tokens = output,
            cost_usd = self.client.total_cost_usd(),
            "API backend released"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;

    #[tokio::test]
    async fn test_forward_is_unsupported() {
        let key = BackendKey::new("gpt-5", "cuda", BackendKind::Api, 1);
        let backend = ApiBackend::new(key, &ApiConfig::default(), "sk-test".into()).unwrap();
        assert!(!backend.supports_forward());
        assert_eq!(backend.batch_size_hint(), Some(16));

        let err = backend
            .batched_forward(&[ScoringSequence::new("ctx", "A")])
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::Unsupported { .. }));
    }
}
