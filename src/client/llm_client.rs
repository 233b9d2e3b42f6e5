//! Client for OpenAI-compatible chat completion APIs.
//!
//! Epistemic foundation:
//! - K_i: The chat completions schema is shared by hosted providers (OpenAI, DeepSeek)
//! - B_i: API will respond within timeout (might fail)
//! - B_i: Response will be valid JSON (might fail)
//! - I^B: Network availability unknowable → retry with backoff

use crate::client::RateLimiter;
use crate::models::{ApiError, EvalError, Result};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Message in a chat completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Per-token prices used for cost accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ApiPricing {
    pub input_per_1m: f64,
    pub output_per_1m: f64,
}

impl ApiPricing {
    pub fn cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (input_tokens as f64 / 1_000_000.0) * self.input_per_1m
            + (output_tokens as f64 / 1_000_000.0) * self.output_per_1m
    }
}

/// Sampling parameters for one completion.
#[derive(Debug, Clone, Default)]
pub struct CompletionParams {
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub stop: Vec<String>,
    pub seed: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

/// API error body (OpenAI-compatible).
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Response from a completion request.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    /// Generated content
    pub content: String,
    /// Model used (may differ from requested)
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Estimated cost in USD
    pub cost_usd: f64,
    /// Request duration
    pub duration: Duration,
    /// Parsed response body
    pub payload: serde_json::Value,
}

/// Client for one OpenAI-compatible endpoint.
///
/// Features:
/// - Adaptive rate limiting from response headers
/// - Retry with exponential backoff
/// - Token and cost tracking
pub struct LLMClient {
    client: reqwest::Client,
    /// Name of this endpoint (for logging)
    name: String,
    api_key: Option<String>,
    base_url: String,
    timeout: Duration,
    max_retries: u32,
    pricing: ApiPricing,
    rate_limiter: Arc<RateLimiter>,
    total_input_tokens: AtomicU64,
    total_output_tokens: AtomicU64,
    total_cost_micros: AtomicU64, // microdollars for atomic ops
}

impl LLMClient {
    pub fn new(
        name: impl Into<String>,
        api_key: Option<String>,
        base_url: impl Into<String>,
        timeout_secs: u64,
        max_retries: u32,
        pricing: ApiPricing,
    ) -> Result<Self> {
        let timeout = Duration::from_secs(timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(EvalError::Network)?;

        Ok(Self {
            client,
            name: name.into(),
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            max_retries: max_retries.max(1),
            pricing,
            rate_limiter: Arc::new(RateLimiter::new()),
            total_input_tokens: AtomicU64::new(0),
            total_output_tokens: AtomicU64::new(0),
            total_cost_micros: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(|_| {
                EvalError::unavailable(&self.name, "API key contains invalid header characters")
            })?;
            headers.insert(AUTHORIZATION, value);
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    /// Complete a chat request.
    ///
    /// B_i(API available) → Result
    /// B_i(valid response) → Result
    /// I^B(rate limits) → adaptive backoff
    pub async fn complete(
        &self,
        model: &str,
        messages: &[Message],
        params: &CompletionParams,
    ) -> Result<CompletionResponse> {
        let start = Instant::now();
        let request = ChatCompletionRequest {
            model,
            messages,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            stop: &params.stop,
            seed: params.seed,
        };
        let url = format!("{}/chat/completions", self.base_url);
        let headers = self.headers()?;
        let mut last_error: Option<EvalError> = None;

        for attempt in 0..self.max_retries {
            self.rate_limiter.wait_if_needed(model).await;

            let error = match self
                .client
                .post(&url)
                .headers(headers.clone())
                .json(&request)
                .send()
                .await
            {
                Err(e) if e.is_timeout() => EvalError::Timeout(self.timeout),
                Err(e) => EvalError::Network(e),
                Ok(response) => {
                    let status = response.status().as_u16();
                    self.rate_limiter
                        .record_request(model, status, response.headers());

                    if status == 429 {
                        let retry_after_secs = response
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|s| s.parse::<f64>().ok())
                            .unwrap_or(1.0);
                        EvalError::RateLimited { retry_after_secs }
                    } else if !response.status().is_success() {
                        let body = response.text().await.unwrap_or_default();
                        let message = serde_json::from_str::<ApiErrorResponse>(&body)
                            .map(|e| e.error.message)
                            .unwrap_or(body);
                        EvalError::Api(match status {
                            401 | 403 => ApiError::AuthenticationFailed,
                            404 => ApiError::ModelNotFound(model.to_string()),
                            _ => ApiError::Status { status, message },
                        })
                    } else {
                        let payload: serde_json::Value = response.json().await.map_err(|e| {
                            EvalError::ParseError(format!("Failed to parse response: {e}"))
                        })?;
                        return self.finish(model, payload, start.elapsed());
                    }
                }
            };

            if !error.is_retryable() || attempt + 1 == self.max_retries {
                last_error = Some(error);
                break;
            }
            let backoff = error
                .retry_after()
                .map(Duration::from_secs_f64)
                .unwrap_or_else(|| Duration::from_secs(2u64.pow(attempt)));
            debug!(
                endpoint = %self.name,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "Retrying request"
            );
            last_error = Some(error);
            tokio::time::sleep(backoff).await;
        }

        Err(last_error.unwrap_or_else(|| {
            EvalError::Api(ApiError::MaxRetriesExceeded {
                attempts: self.max_retries,
                last_error: "unknown error".to_string(),
            })
        }))
    }

    fn finish(
        &self,
        model: &str,
        payload: serde_json::Value,
        duration: Duration,
    ) -> Result<CompletionResponse> {
        let body: ChatCompletionResponse = serde_json::from_value(payload.clone())
            .map_err(|e| EvalError::Api(ApiError::InvalidResponse(e.to_string())))?;

        let content = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.unwrap_or_default())
            .ok_or_else(|| EvalError::Api(ApiError::InvalidResponse("no choices".into())))?;

        let usage = body.usage.unwrap_or_default();
        let cost = self
            .pricing
            .cost(usage.prompt_tokens, usage.completion_tokens);

        self.total_input_tokens
            .fetch_add(usage.prompt_tokens as u64, Ordering::Relaxed);
        self.total_output_tokens
            .fetch_add(usage.completion_tokens as u64, Ordering::Relaxed);
        self.total_cost_micros
            .fetch_add((cost * 1_000_000.0) as u64, Ordering::Relaxed);

        Ok(CompletionResponse {
            content,
            model: body.model.unwrap_or_else(|| model.to_string()),
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            cost_usd: cost,
            duration,
            payload,
        })
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.total_cost_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    /// (input, output) tokens tracked so far.
    pub fn total_tokens(&self) -> (u64, u64) {
        (
            self.total_input_tokens.load(Ordering::Relaxed),
            self.total_output_tokens.load(Ordering::Relaxed),
        )
    }

    /// Health check: ping the /models endpoint.
    ///
    /// B_i: endpoint is healthy if /models returns 200
    pub async fn health_check(&self) -> HealthCheckResult {
        let start = Instant::now();
        let url = format!("{}/models", self.base_url);
        let headers = match self.headers() {
            Ok(h) => h,
            Err(e) => {
                return HealthCheckResult {
                    endpoint: self.name.clone(),
                    status: HealthStatus::Unhealthy,
                    latency_ms: None,
                    error: Some(e.to_string()),
                };
            }
        };

        match self
            .client
            .get(&url)
            .headers(headers)
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            Ok(response) => {
                let latency_ms = Some(start.elapsed().as_millis() as u64);
                if response.status().is_success() {
                    HealthCheckResult {
                        endpoint: self.name.clone(),
                        status: HealthStatus::Healthy,
                        latency_ms,
                        error: None,
                    }
                } else {
                    HealthCheckResult {
                        endpoint: self.name.clone(),
                        status: HealthStatus::Unhealthy,
                        latency_ms,
                        error: Some(format!("HTTP {}", response.status().as_u16())),
                    }
                }
            }
            Err(e) => HealthCheckResult {
                endpoint: self.name.clone(),
                status: HealthStatus::Unreachable,
                latency_ms: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Health check result.
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    pub endpoint: String,
    pub status: HealthStatus,
    /// Latency in milliseconds (if reachable)
    pub latency_ms: Option<u64>,
    /// Error message (if unhealthy or unreachable)
    pub error: Option<String>,
}

/// Health status of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unreachable,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}
