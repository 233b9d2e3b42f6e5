//! Inference backends.
//!
//! Epistemic foundation:
//! - K_i: A backend is identified by (model id, device, kind, parallelism)
//! - K_i: Generation and forward scoring are batched: one output per input, in order
//! - B_i: Forward scoring is optional → `Unsupported` when absent
//! - I^B: Backend capacity unknown until exceeded → `CapacityExceeded`

mod api;
mod batch_size;
mod registry;
mod server;
mod tgi;
mod vllm;

#[cfg(test)]
pub(crate) mod testing;

pub use api::*;
pub use batch_size::*;
pub use registry::*;
pub use server::*;
pub use tgi::*;
pub use vllm::*;

use crate::models::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a backend runs the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Hosted OpenAI-compatible API
    Api,
    /// Local weights served by text-generation-inference
    #[serde(alias = "local", alias = "tgi")]
    HuggingFace,
    /// Local weights served by vLLM
    #[serde(alias = "high_throughput")]
    Vllm,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Api => "api",
            Self::HuggingFace => "huggingface",
            Self::Vllm => "vllm",
        };
        f.write_str(s)
    }
}

/// Identity of one backend instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendKey {
    pub model_id: String,
    pub device: String,
    pub kind: BackendKind,
    pub parallelism: usize,
}

impl BackendKey {
    pub fn new(model_id: &str, device: &str, kind: BackendKind, parallelism: usize) -> Self {
        Self {
            model_id: model_id.to_string(),
            device: device.to_string(),
            kind,
            parallelism,
        }
    }
}

impl fmt::Display for BackendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}[{} x{}]",
            self.model_id, self.device, self.kind, self.parallelism
        )
    }
}

/// Sampling parameters for generation.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingConfig {
    /// 0.0 means greedy decoding
    pub temperature: f64,
    pub top_p: Option<f64>,
    pub stop: Vec<String>,
    pub seed: Option<u64>,
}

impl SamplingConfig {
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_p: None,
            stop: Vec::new(),
            seed: None,
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self::greedy()
    }
}

/// Raw output of one generation.
#[derive(Debug, Clone, Default)]
pub struct RawGeneration {
    pub text: String,
    /// Backend response the text was taken from
    pub payload: serde_json::Value,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_usd: f64,
}

impl RawGeneration {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// A (context, continuation) pair to score.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoringSequence {
    pub context: String,
    pub continuation: String,
}

impl ScoringSequence {
    pub fn new(context: impl Into<String>, continuation: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            continuation: continuation.into(),
        }
    }
}

/// Per-token log-probabilities of a scored continuation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenScores {
    pub logprobs: Vec<f64>,
}

impl TokenScores {
    pub fn new(logprobs: Vec<f64>) -> Self {
        Self { logprobs }
    }

    pub fn sum(&self) -> f64 {
        self.logprobs.iter().sum()
    }

    pub fn len(&self) -> usize {
        self.logprobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logprobs.is_empty()
    }

    /// exp(-mean log-probability); None for an empty continuation.
    pub fn perplexity(&self) -> Option<f64> {
        if self.logprobs.is_empty() {
            return None;
        }
        Some((-self.sum() / self.logprobs.len() as f64).exp())
    }
}

/// A loaded model that can generate and, optionally, score text.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn key(&self) -> &BackendKey;

    /// Whether `batched_forward` is available.
    fn supports_forward(&self) -> bool;

    /// Generate one completion per prompt, in prompt order.
    async fn batched_generate(
        &self,
        prompts: &[String],
        max_new_tokens: u32,
        sampling: &SamplingConfig,
    ) -> Result<Vec<RawGeneration>>;

    /// Score each continuation given its context, in input order.
    async fn batched_forward(&self, sequences: &[ScoringSequence]) -> Result<Vec<TokenScores>>;

    /// Batch size the backend knows it can sustain, if any.
    fn batch_size_hint(&self) -> Option<usize> {
        None
    }

    /// Release processes and memory held by the backend.
    async fn shutdown(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_equality_covers_all_fields() {
        let a = BackendKey::new("Qwen/Qwen3-8B", "cuda", BackendKind::Vllm, 1);
        let b = BackendKey::new("Qwen/Qwen3-8B", "cuda", BackendKind::Vllm, 2);
        let c = BackendKey::new("Qwen/Qwen3-8B", "cuda", BackendKind::HuggingFace, 1);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, a.clone());
        assert_eq!(a.to_string(), "Qwen/Qwen3-8B@cuda[vllm x1]");
    }

    #[test]
    fn test_perplexity() {
        let scores = TokenScores::new(vec![-1.0, -1.0]);
        assert!((scores.perplexity().unwrap() - std::f64::consts::E).abs() < 1e-9);
        assert_eq!(TokenScores::default().perplexity(), None);
    }

    #[test]
    fn test_backend_kind_aliases() {
        #[derive(Deserialize)]
        struct Wrapper {
            kind: BackendKind,
        }
        let parsed: Wrapper = toml::from_str("kind = \"tgi\"").unwrap();
        assert_eq!(parsed.kind, BackendKind::HuggingFace);
        let parsed: Wrapper = toml::from_str("kind = \"vllm\"").unwrap();
        assert_eq!(parsed.kind, BackendKind::Vllm);
    }
}
