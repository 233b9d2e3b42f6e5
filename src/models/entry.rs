//! Dataset records: entries, cross-language pairs and the tasks built from them.
//!
//! Epistemic foundation:
//! - K_i: Every entry carries a language code and a correctness label
//! - K_i: A pair's id is derived from its two entry ids, never stored separately
//! - B_i: Raw records use several field spellings → normalized at load time

use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether an entry's answer is the ground-truth answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrectnessLabel {
    Correct,
    Incorrect,
}

impl CorrectnessLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Correct => "correct",
            Self::Incorrect => "incorrect",
        }
    }
}

impl fmt::Display for CorrectnessLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One question/answer record in one language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Unique within its source file
    pub id: String,

    pub question: String,

    /// Multiple-choice options, when the record has them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<[String; 4]>,

    /// Index into `choices` of the answer this entry presents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_index: Option<usize>,

    /// Free-text answer, when the record carries one directly
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_text: Option<String>,

    pub language: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    pub label: CorrectnessLabel,
}

impl Entry {
    /// The answer text this entry presents, resolved from choices when needed.
    pub fn answer(&self) -> Option<&str> {
        if let Some(text) = &self.answer_text {
            return Some(text.as_str());
        }
        let choices = self.choices.as_ref()?;
        choices.get(self.answer_index?).map(String::as_str)
    }

    /// Numeric key used to align entries across languages.
    pub fn question_key(&self) -> Option<u64> {
        numeric_key(&self.id)
    }
}

/// Trailing-digit key of an id segment ("17" → 17, "en_17" → 17, "abc" → None).
pub fn numeric_key(id: &str) -> Option<u64> {
    let digits_start = id
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i)?;
    id[digits_start..].parse().ok()
}

/// Two entries (one per language) judged together.
///
/// K_i: `entry_a.language` sorts strictly before `entry_b.language`.
#[derive(Debug, Clone, PartialEq)]
pub struct Pair {
    pub entry_a: Entry,
    pub entry_b: Entry,
}

impl Pair {
    /// Deterministic id derived from both entry ids.
    pub fn id(&self) -> String {
        pair_id(&self.entry_a.id, &self.entry_b.id)
    }

    pub fn lang_a(&self) -> &str {
        &self.entry_a.language
    }

    pub fn lang_b(&self) -> &str {
        &self.entry_b.language
    }
}

/// Separator between the two entry ids of a pair id.
pub const PAIR_ID_SEPARATOR: &str = "__";

pub fn pair_id(id_a: &str, id_b: &str) -> String {
    format!("{id_a}{PAIR_ID_SEPARATOR}{id_b}")
}

/// One unit of evaluation work.
#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    Single(Entry),
    Pair(Pair),
}

impl Task {
    /// Entry id for single tasks, derived pair id for pair tasks.
    pub fn id(&self) -> String {
        match self {
            Self::Single(entry) => entry.id.clone(),
            Self::Pair(pair) => pair.id(),
        }
    }
}

/// Lifecycle of a task inside a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InFlight,
    Succeeded,
    Failed,
}

#[cfg(test)]
pub(crate) fn test_entry(id: &str, language: &str, label: CorrectnessLabel) -> Entry {
    Entry {
        id: id.to_string(),
        question: format!("question {id}"),
        choices: None,
        answer_index: None,
        answer_text: Some(format!("answer {id}")),
        language: language.to_string(),
        subject: None,
        label,
    }
}
