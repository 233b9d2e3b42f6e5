//! Per-family translation between evaluation requests and backend calls.
//!
//! Epistemic foundation:
//! - K_i: The outward contract is identical for every family
//! - K_i: Families differ only in chat template and response cleaning
//! - B_i: A reply may carry no recognisable verdict → UnparseableVerdict
//! - I^R: Family is detected from the model id or set in config

mod api_chat;
mod granite4;
mod llama3;
mod prompts;
mod qwen3;

pub use api_chat::*;
pub use granite4::*;
pub use llama3::*;
pub use prompts::*;
pub use qwen3::*;

use crate::backend::{BackendKind, ModelBackend, SamplingConfig, ScoringSequence};
use crate::models::{
    ComparisonResult, Entry, EvalError, ForwardResult, GenerationResult, Pair, Result, RunConfig,
    Verdict,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Chat-template and response-format family of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    Qwen3,
    Llama3,
    Granite4,
    ApiChat,
}

impl ModelFamily {
    /// Guess the family from a model id; API backends fall back to plain chat.
    pub fn detect(model_id: &str, backend: BackendKind) -> Option<Self> {
        let id = model_id.to_ascii_lowercase();
        if id.contains("qwen") {
            Some(Self::Qwen3)
        } else if id.contains("llama") {
            Some(Self::Llama3)
        } else if id.contains("granite") {
            Some(Self::Granite4)
        } else if backend == BackendKind::Api {
            Some(Self::ApiChat)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Qwen3 => "qwen3",
            Self::Llama3 => "llama3",
            Self::Granite4 => "granite4",
            Self::ApiChat => "api_chat",
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token budgets for generating requests.
#[derive(Debug, Clone, Copy)]
pub struct GenerationLimits {
    pub cot_max_new_tokens: u32,
    pub response_max_new_tokens: u32,
}

impl Default for GenerationLimits {
    fn default() -> Self {
        Self {
            cot_max_new_tokens: 2048,
            response_max_new_tokens: 512,
        }
    }
}

impl From<&RunConfig> for GenerationLimits {
    fn from(run: &RunConfig) -> Self {
        Self {
            cot_max_new_tokens: run.cot_max_new_tokens,
            response_max_new_tokens: run.response_max_new_tokens,
        }
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Turns evaluation requests into backend calls and typed results.
///
/// Implementors supply the template hooks; the evaluation operations are shared.
#[async_trait]
pub trait ModelInterface: Send + Sync {
    fn family(&self) -> ModelFamily;

    fn limits(&self) -> &GenerationLimits;

    /// Render one system + user turn and open the assistant turn.
    ///
    /// `reasoning` leaves room for the model to think before answering.
    fn render_chat(&self, system: &str, user: &str, reasoning: bool) -> String;

    /// Strip template artefacts from a generated reply.
    fn clean_response(&self, raw: &str) -> String {
        raw.trim().to_string()
    }

    fn parse_verdict(&self, raw: &str) -> Result<Verdict> {
        extract_verdict(&self.clean_response(raw)).ok_or_else(|| EvalError::unparseable(raw))
    }

    /// Perplexity of the entry's answer given its question.
    async fn score_perplexity(&self, backend: &dyn ModelBackend, entry: &Entry) -> Result<ForwardResult> {
        let answer = entry
            .answer()
            .ok_or_else(|| EvalError::InvalidInput(format!("entry {} has no answer", entry.id)))?;
        let context = self.render_chat(ANSWER_SYSTEM_PROMPT, &question_prompt(entry), false);

        let start = Instant::now();
        let scores = backend
            .batched_forward(&[ScoringSequence::new(context, answer)])
            .await?
            .pop()
            .ok_or_else(|| EvalError::GenerationFailure("backend returned no scores".into()))?;
        let perplexity = scores.perplexity().ok_or_else(|| {
            EvalError::GenerationFailure(format!("answer of {} scored no tokens", entry.id))
        })?;

        Ok(ForwardResult {
            id: entry.id.clone(),
            lang: entry.language.clone(),
            label: entry.label,
            subject: entry.subject.clone(),
            question: entry.question.clone(),
            answer: answer.to_string(),
            num_tokens: scores.len(),
            log_likelihood: scores.sum(),
            perplexity,
            model: backend.key().model_id.clone(),
            latency_ms: elapsed_ms(start),
            collected_at: Utc::now(),
        })
    }

    /// Forced choice: compare the likelihood of replying "A" against "B".
    async fn judge_preference_direct(
        &self,
        backend: &dyn ModelBackend,
        pair: &Pair,
    ) -> Result<ComparisonResult> {
        let context = self.render_chat(JUDGE_SYSTEM_PROMPT, &direct_judge_prompt(pair), false);
        let sequences = [
            ScoringSequence::new(context.clone(), "A"),
            ScoringSequence::new(context, "B"),
        ];

        let start = Instant::now();
        let scores = backend.batched_forward(&sequences).await?;
        let [a, b] = scores.as_slice() else {
            return Err(EvalError::GenerationFailure(format!(
                "expected 2 score vectors, got {}",
                scores.len()
            )));
        };
        if a.is_empty() || b.is_empty() {
            return Err(EvalError::GenerationFailure("verdict token scored empty".into()));
        }
        let (logprob_a, logprob_b) = (a.sum(), b.sum());
        let verdict = if logprob_a >= logprob_b { Verdict::A } else { Verdict::B };

        Ok(comparison(pair, backend, verdict, None, Some((logprob_a, logprob_b)), start, 0.0))
    }

    /// Reason first, then read the verdict from the end of the reply.
    async fn judge_preference_cot(
        &self,
        backend: &dyn ModelBackend,
        pair: &Pair,
    ) -> Result<ComparisonResult> {
        let prompt = self.render_chat(JUDGE_SYSTEM_PROMPT, &cot_judge_prompt(pair), true);

        let start = Instant::now();
        let generation = backend
            .batched_generate(&[prompt], self.limits().cot_max_new_tokens, &SamplingConfig::greedy())
            .await?
            .pop()
            .ok_or_else(|| EvalError::GenerationFailure("backend returned no generation".into()))?;
        let verdict = self.parse_verdict(&generation.text)?;
        let rationale = generation.text.trim().to_string();

        Ok(comparison(
            pair,
            backend,
            verdict,
            Some(rationale),
            None,
            start,
            generation.cost_usd,
        ))
    }

    /// Free-form answer to the entry's question.
    async fn generate_response(
        &self,
        backend: &dyn ModelBackend,
        entry: &Entry,
    ) -> Result<GenerationResult> {
        let prompt = self.render_chat(ANSWER_SYSTEM_PROMPT, &question_prompt(entry), false);

        let start = Instant::now();
        let generation = backend
            .batched_generate(
                &[prompt],
                self.limits().response_max_new_tokens,
                &SamplingConfig::greedy(),
            )
            .await?
            .pop()
            .ok_or_else(|| EvalError::GenerationFailure("backend returned no generation".into()))?;
        let response = self.clean_response(&generation.text);
        if response.is_empty() {
            return Err(EvalError::GenerationFailure(format!(
                "empty response for {}",
                entry.id
            )));
        }

        Ok(GenerationResult {
            id: entry.id.clone(),
            lang: entry.language.clone(),
            subject: entry.subject.clone(),
            question: entry.question.clone(),
            response,
            raw: generation.payload,
            model: backend.key().model_id.clone(),
            latency_ms: elapsed_ms(start),
            cost_usd: generation.cost_usd,
            collected_at: Utc::now(),
        })
    }
}

fn comparison(
    pair: &Pair,
    backend: &dyn ModelBackend,
    verdict: Verdict,
    rationale: Option<String>,
    logprobs: Option<(f64, f64)>,
    start: Instant,
    cost_usd: f64,
) -> ComparisonResult {
    ComparisonResult {
        pair_id: pair.id(),
        lang_a: pair.lang_a().to_string(),
        lang_b: pair.lang_b().to_string(),
        label_a: pair.entry_a.label,
        label_b: pair.entry_b.label,
        subject: pair.entry_a.subject.clone(),
        verdict,
        rationale,
        logprob_a: logprobs.map(|(a, _)| a),
        logprob_b: logprobs.map(|(_, b)| b),
        model: backend.key().model_id.clone(),
        latency_ms: elapsed_ms(start),
        cost_usd,
        collected_at: Utc::now(),
    }
}

/// Interface implementation for a family.
pub fn create_interface(family: ModelFamily, limits: GenerationLimits) -> Arc<dyn ModelInterface> {
    match family {
        ModelFamily::Qwen3 => Arc::new(Qwen3Interface::new(limits)),
        ModelFamily::Llama3 => Arc::new(Llama3Interface::new(limits)),
        ModelFamily::Granite4 => Arc::new(Granite4Interface::new(limits)),
        ModelFamily::ApiChat => Arc::new(ApiChatInterface::new(limits)),
    }
}
