//! High-throughput backend served by vLLM's OpenAI-compatible server.

use super::{
    BackendKey, LaunchSpec, ModelBackend, RawGeneration, SamplingConfig, ScoringSequence,
    ServerProcess, TokenScores, http_client, post_json, visible_devices,
};
use crate::models::{EvalError, LocalConfig, Result};
use async_trait::async_trait;
use futures::future::try_join_all;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct CompletionsResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    index: usize,
    #[serde(default)]
    text: String,
    /// One map per prompt token (first is null): token id → logprob info
    #[serde(default)]
    prompt_logprobs: Option<Vec<Option<HashMap<String, PromptLogprob>>>>,
}

#[derive(Debug, Deserialize)]
struct PromptLogprob {
    logprob: f64,
}

#[derive(Debug, Deserialize)]
struct TokenizeResponse {
    tokens: Vec<u64>,
}

/// vLLM server running one model.
pub struct VllmBackend {
    key: BackendKey,
    http: reqwest::Client,
    base_url: String,
    server: Option<ServerProcess>,
}

impl VllmBackend {
    /// Launch `vllm serve` for `key` on `port` and wait for it to come up.
    pub async fn launch(key: BackendKey, local: &LocalConfig, port: u16) -> Result<Self> {
        let base_url = format!("http://{}:{port}", local.host);
        let http = http_client(local)?;

        let mut args = vec![
            "serve".to_string(),
            key.model_id.clone(),
            "--host".to_string(),
            local.host.clone(),
            "--port".to_string(),
            port.to_string(),
            "--tensor-parallel-size".to_string(),
            key.parallelism.to_string(),
        ];
        if key.device.eq_ignore_ascii_case("cpu") {
            args.extend(["--device".to_string(), "cpu".to_string()]);
        }
        args.extend(local.extra_args.iter().cloned());

        let mut env = HashMap::new();
        if let Some(devices) = visible_devices(&key.device) {
            env.insert("CUDA_VISIBLE_DEVICES".to_string(), devices);
        }

        let server = ServerProcess::launch(
            LaunchSpec {
                name: key.to_string(),
                program: local.vllm_launcher.clone(),
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

    async fn completions(
        &self,
        body: serde_json::Value,
    ) -> Result<(serde_json::Value, Vec<CompletionChoice>)> {
        let payload: serde_json::Value = post_json(
            &self.http,
            &self.name(),
            &format!("{}/v1/completions", self.base_url),
            &body,
        )
        .await?;
        let response: CompletionsResponse = serde_json::from_value(payload.clone())
            .map_err(|e| EvalError::ParseError(format!("vllm completions response: {e}")))?;
        Ok((payload, response.choices))
    }

    async fn tokenize(&self, text: &str) -> Result<Vec<u64>> {
        let response: TokenizeResponse = post_json(
            &self.http,
            &self.name(),
            &format!("{}/tokenize", self.base_url),
            &json!({ "model": self.key.model_id, "prompt": text }),
        )
        .await?;
        Ok(response.tokens)
    }
}

/// Put choices back in prompt order and check one exists per prompt.
fn ordered_choices(mut choices: Vec<CompletionChoice>, expected: usize) -> Result<Vec<CompletionChoice>> {
    choices.sort_by_key(|c| c.index);
    if choices.len() != expected || choices.iter().enumerate().any(|(i, c)| c.index != i) {
        return Err(EvalError::GenerationFailure(format!(
            "expected {expected} completions, got {}",
            choices.len()
        )));
    }
    Ok(choices)
}

/// Log-probabilities of `full_tokens[context_len..]` from a prompt_logprobs list.
fn continuation_logprobs(
    prompt_logprobs: &[Option<HashMap<String, PromptLogprob>>],
    full_tokens: &[u64],
    context_len: usize,
) -> Result<TokenScores> {
    if full_tokens.len() <= context_len {
        return Err(EvalError::GenerationFailure(format!(
            "sequence has {} tokens, context alone has {context_len}",
            full_tokens.len()
        )));
    }
    let logprobs = (context_len..full_tokens.len())
        .map(|pos| {
            let token = full_tokens[pos].to_string();
            prompt_logprobs
                .get(pos)
                .and_then(Option::as_ref)
                .and_then(|candidates| candidates.get(&token))
                .map(|entry| entry.logprob)
                .ok_or_else(|| {
                    EvalError::GenerationFailure(format!("no prompt logprob for position {pos}"))
                })
        })
        .collect::<Result<Vec<f64>>>()?;
    Ok(TokenScores::new(logprobs))
}

#[async_trait]
impl ModelBackend for VllmBackend {
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
        if prompts.is_empty() {
            return Ok(Vec::new());
        }
        let mut body = json!({
            "model": self.key.model_id,
            "prompt": prompts,
            "max_tokens": max_new_tokens,
            "temperature": sampling.temperature,
        });
        if let Some(top_p) = sampling.top_p {
            body["top_p"] = json!(top_p);
        }
        if !sampling.stop.is_empty() {
            body["stop"] = json!(sampling.stop);
        }
        if let Some(seed) = sampling.seed {
            body["seed"] = json!(seed);
        }

        let (payload, choices) = self.completions(body).await?;
        let choices = ordered_choices(choices, prompts.len())?;
        let raw_choices = payload["choices"].as_array().cloned().unwrap_or_default();
        Ok(choices
            .into_iter()
            .map(|choice| RawGeneration {
                payload: raw_choices
                    .iter()
                    .find(|raw| raw["index"].as_u64() == Some(choice.index as u64))
                    .cloned()
                    .unwrap_or_default(),
                text: choice.text,
                ..Default::default()
            })
            .collect())
    }

    async fn batched_forward(&self, sequences: &[ScoringSequence]) -> Result<Vec<TokenScores>> {
        if sequences.is_empty() {
            return Ok(Vec::new());
        }
        let fulls: Vec<String> = sequences
            .iter()
            .map(|s| format!("{}{}", s.context, s.continuation))
            .collect();
        let context_lens = try_join_all(sequences.iter().map(|s| self.tokenize(&s.context))).await?;
        let full_tokens = try_join_all(fulls.iter().map(|f| self.tokenize(f))).await?;

        let body = json!({
            "model": self.key.model_id,
            "prompt": fulls,
            "max_tokens": 1,
            "temperature": 0.0,
            "prompt_logprobs": 0,
        });
        let (_, choices) = self.completions(body).await?;
        let choices = ordered_choices(choices, sequences.len())?;

        choices
            .iter()
            .zip(full_tokens.iter().zip(&context_lens))
            .map(|(choice, (tokens, context))| {
                let prompt_logprobs = choice.prompt_logprobs.as_deref().ok_or_else(|| {
                    EvalError::GenerationFailure("server returned no prompt_logprobs".into())
                })?;
                continuation_logprobs(prompt_logprobs, tokens, context.len())
            })
            .collect()
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(server) = &self.server {
            server.kill().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use crate::backend::testing::{fake_logprob, fake_vllm, serve};

    #[test]
    fn test_ordered_choices() {
        let choices: Vec<CompletionChoice> = serde_json::from_value(json!([
            {"index": 1, "text": "B"},
            {"index": 0, "text": "A"}
        ]))
        .unwrap();
        let ordered = ordered_choices(choices, 2).unwrap();
        assert_eq!(ordered[0].text, "A");
        assert_eq!(ordered[1].text, "B");
    }

    #[test]
    fn test_ordered_choices_count_mismatch() {
        let choices: Vec<CompletionChoice> =
            serde_json::from_value(json!([{"index": 0, "text": "A"}])).unwrap();
        assert!(matches!(ordered_choices(choices, 2), Err(EvalError::GenerationFailure(_))));
    }

    #[test]
    fn test_continuation_logprobs_from_prompt_logprobs() {
        let prompt_logprobs: Vec<Option<HashMap<String, PromptLogprob>>> =
            serde_json::from_value(json!([
                null,
                {"11": {"logprob": -0.1, "rank": 1}},
                {"12": {"logprob": -2.5, "rank": 3}, "99": {"logprob": -0.2, "rank": 1}}
            ]))
            .unwrap();
        let scores = continuation_logprobs(&prompt_logprobs, &[1, 11, 12], 2).unwrap();
        assert_eq!(scores.logprobs, vec![-2.5]);
    }

    fn key() -> BackendKey {
        BackendKey::new("Qwen/Qwen3-8B", "cuda", BackendKind::Vllm, 1)
    }

    async fn connected() -> VllmBackend {
        let url = serve(fake_vllm()).await;
        VllmBackend::connect(key(), &LocalConfig::default(), url).unwrap()
    }

    #[tokio::test]
    async fn test_forward_scores_align_with_input_order() {
        let backend = connected().await;
        let sequences = vec![
            ScoringSequence::new("Q? ", "B"),
            ScoringSequence::new("Longer context: ", "AB"),
            ScoringSequence::new("Q? ", "A"),
        ];

        let scores = backend.batched_forward(&sequences).await.unwrap();

        assert_eq!(scores.len(), 3);
        assert_eq!(scores[0].logprobs, vec![fake_logprob('B')]);
        assert_eq!(scores[1].logprobs, vec![fake_logprob('A'), fake_logprob('B')]);
        assert_eq!(scores[2].logprobs, vec![fake_logprob('A')]);
    }

    #[tokio::test]
    async fn test_generate_restores_prompt_order() {
        let backend = connected().await;
        let prompts: Vec<String> = ["one", "two", "three"].map(String::from).to_vec();

        let outputs = backend
            .batched_generate(&prompts, 8, &SamplingConfig::greedy())
            .await
            .unwrap();

        let texts: Vec<&str> = outputs.iter().map(|o| o.text.as_str()).collect();
        assert_eq!(texts, vec!["echo:one", "echo:two", "echo:three"]);
        assert_eq!(outputs[1].payload["index"], 1);
    }

    #[tokio::test]
    async fn test_insufficient_storage_is_capacity_exceeded() {
        let backend = connected().await;
        let prompts = vec!["fine".to_string(), "HUGE".to_string()];

        let err = backend
            .batched_generate(&prompts, 8, &SamplingConfig::greedy())
            .await
            .unwrap_err();

        assert!(matches!(err, EvalError::CapacityExceeded(_)));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let backend =
            VllmBackend::connect(key(), &LocalConfig::default(), format!("http://{addr}")).unwrap();
        let err = backend
            .batched_generate(&["hello".to_string()], 8, &SamplingConfig::greedy())
            .await
            .unwrap_err();

        assert!(matches!(err, EvalError::BackendUnavailable { .. }));
        assert!(!err.is_task_level());
    }
}
