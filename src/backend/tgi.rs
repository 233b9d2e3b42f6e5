//! Local-weights backend served by text-generation-inference.
//!
//! Forward scoring reads prefill log-probabilities (`decoder_input_details`)
//! of context+continuation; the continuation starts after as many tokens as
//! `/tokenize` reports for the context alone.

use super::{
    BackendKey, LaunchSpec, ModelBackend, RawGeneration, SamplingConfig, ScoringSequence,
    ServerProcess, TokenScores, post_json, visible_devices,
};
use crate::models::{EvalError, LocalConfig, Result};
use async_trait::async_trait;
use futures::future::try_join_all;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    generated_text: String,
    #[serde(default)]
    details: Option<GenerateDetails>,
}

#[derive(Debug, Deserialize)]
struct GenerateDetails {
    #[serde(default)]
    generated_tokens: u32,
    #[serde(default)]
    prefill: Vec<PrefillToken>,
}

#[derive(Debug, Deserialize)]
struct PrefillToken {
    #[serde(default)]
    logprob: Option<f64>,
}

/// Text-generation-inference server running one model.
pub struct TgiBackend {
    key: BackendKey,
    http: reqwest::Client,
    base_url: String,
    server: Option<ServerProcess>,
}

impl TgiBackend {
    /// Launch a server for `key` on `port` and wait for it to come up.
    pub async fn launch(key: BackendKey, local: &LocalConfig, port: u16) -> Result<Self> {
        let base_url = format!("http://{}:{port}", local.host);
        let http = http_client(local)?;

        let mut args = vec![
            "--model-id".to_string(),
            key.model_id.clone(),
            "--hostname".to_string(),
            local.host.clone(),
            "--port".to_string(),
            port.to_string(),
            "--num-shard".to_string(),
            key.parallelism.to_string(),
        ];
        args.extend(local.extra_args.iter().cloned());

        let mut env = HashMap::new();
        if let Some(devices) = visible_devices(&key.device) {
            env.insert("CUDA_VISIBLE_DEVICES".to_string(), devices);
        }

        let server = ServerProcess::launch(
            LaunchSpec {
                name: key.to_string(),
                program: local.tgi_launcher.clone(),
                args,
                env,
                base_url: base_url.clone(),
                startup_timeout: Duration::from_secs(local.startup_timeout_secs),
            },
            &http,
        )
        .await?;

        Ok(Self {
            key,
            http,
            base_url,
            server: Some(server),
        })
    }

    /// Attach to a server that is already running.
    pub fn connect(key: BackendKey, local: &LocalConfig, base_url: impl Into<String>) -> Result<Self> {
        let base_url: String = base_url.into();
        Ok(Self {
            key,
            http: http_client(local)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            server: None,
        })
    }

    fn name(&self) -> String {
        self.key.to_string()
    }

    async fn generate_one(
        &self,
        prompt: &str,
        max_new_tokens: u32,
        sampling: &SamplingConfig,
    ) -> Result<RawGeneration> {
        let mut parameters = json!({
            "max_new_tokens": max_new_tokens,
            "do_sample": !sampling.is_greedy(),
            "details": true,
        });
        if !sampling.is_greedy() {
            parameters["temperature"] = json!(sampling.temperature);
        }
        if let Some(top_p) = sampling.top_p {
            parameters["top_p"] = json!(top_p);
        }
        if !sampling.stop.is_empty() {
            parameters["stop"] = json!(sampling.stop);
        }
        if let Some(seed) = sampling.seed {
            parameters["seed"] = json!(seed);
        }
        let body = json!({ "inputs": prompt, "parameters": parameters });

        let payload: serde_json::Value =
            post_json(&self.http, &self.name(), &format!("{}/generate", self.base_url), &body)
                .await?;
        let response: GenerateResponse = serde_json::from_value(payload.clone())
            .map_err(|e| EvalError::ParseError(format!("tgi generate response: {e}")))?;

        Ok(RawGeneration {
            text: response.generated_text,
            output_tokens: response.details.map(|d| d.generated_tokens).unwrap_or(0),
            payload,
            ..Default::default()
        })
    }

    async fn token_count(&self, text: &str) -> Result<usize> {
        let tokens: Vec<serde_json::Value> = post_json(
            &self.http,
            &self.name(),
            &format!("{}/tokenize", self.base_url),
            &json!({ "inputs": text }),
        )
        .await?;
        Ok(tokens.len())
    }

    async fn score_one(&self, sequence: &ScoringSequence) -> Result<TokenScores> {
        let context_tokens = self.token_count(&sequence.context).await?;
        let body = json!({
            "inputs": format!("{}{}", sequence.context, sequence.continuation),
            "parameters": {
                "max_new_tokens": 1,
                "details": true,
                "decoder_input_details": true,
            },
        });
        let response: GenerateResponse = post_json(
            &self.http,
            &self.name(),
            &format!("{}/generate", self.base_url),
            &body,
        )
        .await?;
        let prefill = response.details.map(|d| d.prefill).unwrap_or_default();
        continuation_scores(&prefill, context_tokens)
    }
}

/// Log-probabilities of the prefill tokens after the context.
fn continuation_scores(prefill: &[PrefillToken], context_tokens: usize) -> Result<TokenScores> {
    if prefill.len() <= context_tokens {
        return Err(EvalError::GenerationFailure(format!(
            "prefill has {} tokens, context alone has {context_tokens}",
            prefill.len()
        )));
    }
    let logprobs = prefill[context_tokens..]
        .iter()
        .map(|t| {
            t.logprob
                .ok_or_else(|| EvalError::GenerationFailure("missing prefill logprob".into()))
        })
        .collect::<Result<Vec<f64>>>()?;
    Ok(TokenScores::new(logprobs))
}

pub(crate) fn http_client(local: &LocalConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(local.request_timeout_secs))
        .build()
        .map_err(EvalError::Network)
}

#[async_trait]
impl ModelBackend for TgiBackend {
    fn key(&self) -> &BackendKey {
        &self.key
    }

    fn supports_forward(&self) -> bool {
        true
    }

    async fn batched_generate(
        &self,
        prompts: &[String],
        max_new_tokens: u32,
        sampling: &SamplingConfig,
    ) -> Result<Vec<RawGeneration>> {
        // The server batches concurrent requests itself
        try_join_all(
            prompts
                .iter()
                .map(|p| self.generate_one(p, max_new_tokens, sampling)),
        )
        .await
    }

    async fn batched_forward(&self, sequences: &[ScoringSequence]) -> Result<Vec<TokenScores>> {
        try_join_all(sequences.iter().map(|s| self.score_one(s))).await
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(server) = &self.server {
            server.kill().await;
        }
        Ok(())
    }
}
