//! Scripted backend and fake inference servers for unit tests.

use super::{
    BackendKey, BackendKind, ModelBackend, RawGeneration, SamplingConfig, ScoringSequence,
    TokenScores,
};
use crate::models::{EvalError, Result};
use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;

type ReplyFn = dyn Fn(&str) -> Result<String> + Send + Sync;
type ScoreFn = dyn Fn(&ScoringSequence) -> Result<Vec<f64>> + Send + Sync;

pub(crate) struct StubBackend {
    key: BackendKey,
    reply: Arc<ReplyFn>,
    score: Arc<ScoreFn>,
    forward: bool,
    capacity: Option<usize>,
    concurrency_limit: Option<usize>,
    in_flight: AtomicUsize,
    hint: Option<usize>,
    delay: Duration,
    pub generate_calls: AtomicUsize,
    pub shutdowns: AtomicUsize,
}

impl StubBackend {
    pub fn new(model_id: &str) -> Self {
        Self {
            key: BackendKey::new(model_id, "cuda", BackendKind::Vllm, 1),
            reply: Arc::new(|_| Ok("Final answer: A".to_string())),
            score: Arc::new(|seq| Ok(default_scores(&seq.continuation))),
            forward: true,
            capacity: None,
            concurrency_limit: None,
            in_flight: AtomicUsize::new(0),
            hint: None,
            delay: Duration::ZERO,
            generate_calls: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        }
    }

    pub fn with_key(mut self, key: BackendKey) -> Self {
        self.key = key;
        self
    }

    pub fn with_reply(mut self, reply: impl Fn(&str) -> Result<String> + Send + Sync + 'static) -> Self {
        self.reply = Arc::new(reply);
        self
    }

    pub fn with_scores(
        mut self,
        score: impl Fn(&ScoringSequence) -> Result<Vec<f64>> + Send + Sync + 'static,
    ) -> Self {
        self.score = Arc::new(score);
        self
    }

    pub fn without_forward(mut self) -> Self {
        self.forward = false;
        self
    }

    /// Refuse batches larger than `capacity`.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Refuse calls made while `limit` others are already running.
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    pub fn with_hint(mut self, hint: usize) -> Self {
        self.hint = Some(hint);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn check_capacity(&self, batch: usize) -> Result<()> {
        match self.capacity {
            Some(capacity) if batch > capacity => Err(EvalError::CapacityExceeded(format!(
                "batch of {batch} exceeds {capacity}"
            ))),
            _ => Ok(()),
        }
    }

    /// Run `body` while counted as in flight, refusing it above the concurrency limit.
    async fn admitted<T>(&self, body: impl FnOnce() -> Result<T>) -> Result<T> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let result = match self.concurrency_limit {
            Some(limit) if running > limit => Err(EvalError::CapacityExceeded(format!(
                "{running} concurrent calls exceed {limit}"
            ))),
            _ => {
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                body()
            }
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// "A" scores higher than "B"; other text gets -0.5 per word.
fn default_scores(continuation: &str) -> Vec<f64> {
    match continuation.trim() {
        "A" => vec![-0.1],
        "B" => vec![-1.0],
        text => vec![-0.5; text.split_whitespace().count().max(1)],
    }
}

#[async_trait]
impl ModelBackend for StubBackend {
    fn key(&self) -> &BackendKey {
        &self.key
    }

    fn supports_forward(&self) -> bool {
        self.forward
    }

    async fn batched_generate(
        &self,
        prompts: &[String],
        _max_new_tokens: u32,
        _sampling: &SamplingConfig,
    ) -> Result<Vec<RawGeneration>> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        self.check_capacity(prompts.len())?;
        self.admitted(|| {
            prompts
                .iter()
                .map(|p| (self.reply)(p).map(RawGeneration::text))
                .collect()
        })
        .await
    }

    async fn batched_forward(&self, sequences: &[ScoringSequence]) -> Result<Vec<TokenScores>> {
        if !self.forward {
            return Err(EvalError::Unsupported {
                backend: self.key.to_string(),
                operation: "forward scoring",
            });
        }
        self.check_capacity(sequences.len())?;
        self.admitted(|| {
            sequences
                .iter()
                .map(|s| (self.score)(s).map(TokenScores::new))
                .collect()
        })
        .await
    }

    fn batch_size_hint(&self) -> Option<usize> {
        self.hint
    }

    async fn shutdown(&self) -> Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Log-probability the fake servers assign to a character token.
pub fn fake_logprob(c: char) -> f64 {
    match c {
        'A' => -0.1,
        'B' => -2.0,
        _ => -0.5,
    }
}

/// Serve `router` on an ephemeral local port; returns its base URL.
pub async fn serve(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// Requests mentioning "HUGE" are refused with `status`.
fn refuse_oversized(text: &str, status: StatusCode) -> Option<Response> {
    text.contains("HUGE")
        .then(|| (status, "request exceeds server capacity").into_response())
}

/// text-generation-inference look-alike with one token per character.
pub fn fake_tgi() -> Router {
    Router::new()
        .route(
            "/tokenize",
            post(|Json(body): Json<Value>| async move {
                let inputs = body["inputs"].as_str().unwrap_or_default().to_string();
                let tokens: Vec<Value> = inputs
                    .chars()
                    .map(|c| json!({"id": c as u32, "text": c.to_string()}))
                    .collect();
                Json(Value::Array(tokens))
            }),
        )
        .route(
            "/generate",
            post(|Json(body): Json<Value>| async move {
                let inputs = body["inputs"].as_str().unwrap_or_default().to_string();
                if let Some(refusal) = refuse_oversized(&inputs, StatusCode::PAYLOAD_TOO_LARGE) {
                    return refusal;
                }
                let prefill: Vec<Value> =
                    if body["parameters"]["decoder_input_details"].as_bool() == Some(true) {
                        inputs
                            .chars()
                            .enumerate()
                            .map(|(i, c)| {
                                let logprob =
                                    if i == 0 { Value::Null } else { json!(fake_logprob(c)) };
                                json!({"id": c as u32, "text": c.to_string(), "logprob": logprob})
                            })
                            .collect()
                    } else {
                        Vec::new()
                    };
                let generated_text = format!("echo:{inputs}");
                Json(json!({
                    "generated_text": generated_text,
                    "details": {"generated_tokens": 3, "prefill": prefill},
                }))
                .into_response()
            }),
        )
}

/// vLLM look-alike with one token per character; choices come back reversed.
pub fn fake_vllm() -> Router {
    Router::new()
        .route(
            "/tokenize",
            post(|Json(body): Json<Value>| async move {
                let prompt = body["prompt"].as_str().unwrap_or_default();
                let tokens: Vec<u32> = prompt.chars().map(|c| c as u32).collect();
                Json(json!({"count": tokens.len(), "tokens": tokens}))
            }),
        )
        .route(
            "/v1/completions",
            post(|Json(body): Json<Value>| async move {
                let prompts: Vec<String> = body["prompt"]
                    .as_array()
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|p| p.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                if let Some(refusal) = prompts
                    .iter()
                    .find_map(|p| refuse_oversized(p, StatusCode::INSUFFICIENT_STORAGE))
                {
                    return refusal;
                }
                let scoring = body.get("prompt_logprobs").is_some();
                let choices: Vec<Value> = prompts
                    .iter()
                    .enumerate()
                    .rev()
                    .map(|(index, prompt)| {
                        if scoring {
                            json!({"index": index, "text": "", "prompt_logprobs": prompt_logprobs(prompt)})
                        } else {
                            json!({"index": index, "text": format!("echo:{prompt}")})
                        }
                    })
                    .collect();
                Json(json!({"choices": choices})).into_response()
            }),
        )
}

fn prompt_logprobs(prompt: &str) -> Vec<Value> {
    prompt
        .chars()
        .enumerate()
        .map(|(i, c)| {
            if i == 0 {
                return Value::Null;
            }
            let mut candidates = Map::new();
            candidates.insert(
                (c as u32).to_string(),
                json!({"logprob": fake_logprob(c), "rank": 1}),
            );
            Value::Object(candidates)
        })
        .collect()
}
