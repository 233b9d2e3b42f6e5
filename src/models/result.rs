//! Evaluation results and run reports.
//!
//! Epistemic foundation:
//! - K_i: Every persisted record carries the id of the task that produced it
//! - B_i: A task may fail → recorded as `TaskFailure`, never as a partial record
//! - I^R: Result type chosen per run by the user

use crate::models::{CorrectnessLabel, FailureReason};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which evaluation a run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultType {
    /// One forward pass scoring the verdict tokens "A" and "B"
    PreferenceDirect,
    /// Free-form reasoning ending in a verdict
    PreferenceCot,
    /// Answer log-likelihood given the question
    Perplexity,
    /// Free-form answer generation
    Response,
}

impl ResultType {
    /// Directory name under the model's result directory.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::PreferenceDirect => "preferences_direct",
            Self::PreferenceCot => "preferences_cot",
            Self::Perplexity => "perplexities",
            Self::Response => "responses",
        }
    }

    /// Whether tasks of this type are pairs.
    pub fn is_pairwise(&self) -> bool {
        matches!(self, Self::PreferenceDirect | Self::PreferenceCot)
    }

    /// Whether this result type needs forward-pass scoring.
    pub fn requires_forward(&self) -> bool {
        matches!(self, Self::PreferenceDirect | Self::Perplexity)
    }
}

impl fmt::Display for ResultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PreferenceDirect => "preference_direct",
            Self::PreferenceCot => "preference_cot",
            Self::Perplexity => "perplexity",
            Self::Response => "response",
        };
        f.write_str(s)
    }
}

impl FromStr for ResultType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "preference_direct" => Ok(Self::PreferenceDirect),
            "preference_cot" => Ok(Self::PreferenceCot),
            "perplexity" => Ok(Self::Perplexity),
            "response" => Ok(Self::Response),
            other => Err(format!(
                "unknown result type '{other}' (expected preference_direct, preference_cot, perplexity or response)"
            )),
        }
    }
}

/// Which side of a pair the judge preferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    A,
    B,
}

impl Verdict {
    pub fn from_letter(letter: &str) -> Option<Self> {
        match letter.trim().to_ascii_uppercase().as_str() {
            "A" => Some(Self::A),
            "B" => Some(Self::B),
            _ => None,
        }
    }
}

/// Perplexity of one entry's answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardResult {
    pub id: String,
    pub lang: String,
    pub label: CorrectnessLabel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub question: String,
    pub answer: String,
    /// Tokens in the scored answer
    pub num_tokens: usize,
    /// Sum of answer token log-probabilities
    pub log_likelihood: f64,
    pub perplexity: f64,
    pub model: String,
    pub latency_ms: u64,
    pub collected_at: DateTime<Utc>,
}

/// Free-form response to one entry's question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    pub id: String,
    pub lang: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub question: String,
    pub response: String,
    /// Backend payload the response was parsed from
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub raw: serde_json::Value,
    pub model: String,
    pub latency_ms: u64,
    #[serde(default)]
    pub cost_usd: f64,
    pub collected_at: DateTime<Utc>,
}

/// Judge verdict for one pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub pair_id: String,
    pub lang_a: String,
    pub lang_b: String,
    pub label_a: CorrectnessLabel,
    pub label_b: CorrectnessLabel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub verdict: Verdict,
    /// Reasoning preceding the verdict (chain-of-thought only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    /// Log-likelihood of verdict "A" (direct only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logprob_a: Option<f64>,
    /// Log-likelihood of verdict "B" (direct only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logprob_b: Option<f64>,
    pub model: String,
    pub latency_ms: u64,
    #[serde(default)]
    pub cost_usd: f64,
    pub collected_at: DateTime<Utc>,
}

impl ComparisonResult {
    /// Whether the judge picked the side carrying the correct answer.
    ///
    /// None when both sides share a label.
    pub fn preferred_correct(&self) -> Option<bool> {
        if self.label_a == self.label_b {
            return None;
        }
        let preferred = match self.verdict {
            Verdict::A => self.label_a,
            Verdict::B => self.label_b,
        };
        Some(preferred == CorrectnessLabel::Correct)
    }
}

/// Any persisted evaluation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InferenceResult {
    Comparison(ComparisonResult),
    Forward(ForwardResult),
    Generation(GenerationResult),
}

/// Records that know which task produced them.
pub trait TaskRecord {
    fn task_id(&self) -> &str;
}

impl TaskRecord for ForwardResult {
    fn task_id(&self) -> &str {
        &self.id
    }
}

impl TaskRecord for GenerationResult {
    fn task_id(&self) -> &str {
        &self.id
    }
}

impl TaskRecord for ComparisonResult {
    fn task_id(&self) -> &str {
        &self.pair_id
    }
}

impl TaskRecord for InferenceResult {
    fn task_id(&self) -> &str {
        match self {
            Self::Comparison(r) => r.task_id(),
            Self::Forward(r) => r.task_id(),
            Self::Generation(r) => r.task_id(),
        }
    }
}

impl InferenceResult {
    pub fn cost_usd(&self) -> f64 {
        match self {
            Self::Comparison(r) => r.cost_usd,
            Self::Generation(r) => r.cost_usd,
            Self::Forward(_) => 0.0,
        }
    }
}

/// A task that ended in the Failed state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task_id: String,
    pub reason: FailureReason,
    pub message: String,
}

/// Ids kept in a report's failure sample.
pub const FAILURE_SAMPLE_SIZE: usize = 10;

/// Outcome of one output group (one result file).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupReport {
    /// Output suffix (e.g., "en_correct_fr_incorrect")
    pub suffix: String,
    /// Tasks in the group
    pub total: usize,
    /// Tasks skipped because their results were already persisted
    pub already_done: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Bounded sample of failed task ids
    pub failure_sample: Vec<String>,
    pub cost_usd: f64,
    pub runtime_secs: f64,
}

impl GroupReport {
    pub fn new(suffix: impl Into<String>, total: usize) -> Self {
        Self {
            suffix: suffix.into(),
            total,
            ..Default::default()
        }
    }

    /// Fold one collection's outcome into the report.
    pub fn record(&mut self, results: &[InferenceResult], failures: &[TaskFailure]) {
        self.succeeded += results.len();
        self.failed += failures.len();
        self.cost_usd += results.iter().map(InferenceResult::cost_usd).sum::<f64>();
        let room = FAILURE_SAMPLE_SIZE.saturating_sub(self.failure_sample.len());
        self.failure_sample
            .extend(failures.iter().take(room).map(|f| f.task_id.clone()));
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    pub model: String,
    pub result_type: Option<ResultType>,
    pub groups: Vec<GroupReport>,
    /// Groups skipped because their inputs could not be paired
    pub skipped_groups: Vec<String>,
    pub runtime_secs: f64,
    /// Completed tasks per hour
    pub throughput_per_hour: f64,
}

impl RunReport {
    pub fn total_succeeded(&self) -> usize {
        self.groups.iter().map(|g| g.succeeded).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.groups.iter().map(|g| g.failed).sum()
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.groups.iter().map(|g| g.cost_usd).sum()
    }

    /// Calculate derived stats.
    pub fn finalize(&mut self) {
        if self.runtime_secs > 0.0 {
            self.throughput_per_hour = self.total_succeeded() as f64 / self.runtime_secs * 3600.0;
        }
    }
}
