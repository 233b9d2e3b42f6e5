//! Entry store: loads per-language entry files.
//!
//! Epistemic foundation:
//! - K_i: Files are JSON lines named `{lang}_{correct|incorrect}.jsonl`
//! - B_i: Each line is a valid record → ParseError with line number otherwise
//! - B_i: Record language agrees with the file's language → InvalidInput otherwise

use crate::models::{CorrectnessLabel, Entry, EvalError, Result};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Record id as it appears on disk: numeric index or string id.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawId {
    Number(u64),
    Text(String),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::Text(s) => s,
        }
    }
}

/// Answer as it appears on disk: choice index, choice letter, or free text.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawAnswer {
    Index(usize),
    Text(String),
}

/// On-disk entry record; several upstream dataset spellings are accepted.
#[derive(Debug, Deserialize)]
struct EntryRecord {
    #[serde(alias = "index", alias = "original_index")]
    id: RawId,
    question: String,
    #[serde(default)]
    choices: Option<Vec<String>>,
    #[serde(default)]
    answer: Option<RawAnswer>,
    #[serde(default, alias = "lang")]
    language: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    is_correct: Option<bool>,
}

impl EntryRecord {
    fn into_entry(self, lang: &str, file_label: CorrectnessLabel) -> Result<Entry> {
        let id = self.id.into_string();

        if let Some(language) = &self.language {
            if language != lang {
                return Err(EvalError::InvalidInput(format!(
                    "entry {id} is tagged '{language}' but was loaded as '{lang}'"
                )));
            }
        }

        let choices: Option<[String; 4]> = match self.choices {
            Some(list) => Some(list.try_into().map_err(|list: Vec<String>| {
                EvalError::InvalidInput(format!(
                    "entry {id} has {} choices, expected 4",
                    list.len()
                ))
            })?),
            None => None,
        };

        let (answer_index, answer_text) = match self.answer {
            Some(RawAnswer::Index(i)) => (Some(i), None),
            Some(RawAnswer::Text(text)) => match (&choices, choice_letter(&text)) {
                (Some(_), Some(i)) => (Some(i), None),
                _ => (None, Some(text)),
            },
            None => (None, None),
        };

        let label = match self.is_correct {
            Some(true) => CorrectnessLabel::Correct,
            Some(false) => CorrectnessLabel::Incorrect,
            None => file_label,
        };

        Ok(Entry {
            id,
            question: self.question,
            choices,
            answer_index,
            answer_text,
            language: lang.to_string(),
            subject: self.subject,
            label,
        })
    }
}

/// Map "A".."D" to a choice index.
fn choice_letter(text: &str) -> Option<usize> {
    match text.trim() {
        "A" => Some(0),
        "B" => Some(1),
        "C" => Some(2),
        "D" => Some(3),
        _ => None,
    }
}

/// Loads entry lists from a dataset directory.
#[derive(Debug, Clone)]
pub struct EntryStore {
    data_dir: PathBuf,
}

impl EntryStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Path of the entry file for a language and label.
    pub fn path_for(&self, lang: &str, label: CorrectnessLabel) -> PathBuf {
        self.data_dir.join(format!("{lang}_{label}.jsonl"))
    }

    /// Load the entries for one language and label, keeping at most `limit`.
    pub fn load(
        &self,
        lang: &str,
        label: CorrectnessLabel,
        limit: Option<usize>,
    ) -> Result<Vec<Entry>> {
        let path = self.path_for(lang, label);
        let entries = Self::load_file(&path, lang, label, limit)?;
        info!(path = %path.display(), count = entries.len(), "Loaded entries");
        Ok(entries)
    }

    /// Load entries from an explicit file.
    ///
    /// Blank lines are skipped; reading stops once `limit` entries are collected.
    pub fn load_file(
        path: &Path,
        lang: &str,
        label: CorrectnessLabel,
        limit: Option<usize>,
    ) -> Result<Vec<Entry>> {
        let file = File::open(path)
            .map_err(|e| EvalError::io(format!("opening entry file {}", path.display()), e))?;
        let reader = BufReader::new(file);
        let limit = limit.unwrap_or(usize::MAX);
        let mut entries = Vec::new();

        for (line_num, line) in reader.lines().enumerate() {
            if entries.len() >= limit {
                debug!(limit, "Entry limit reached");
                break;
            }
            let line = line.map_err(|e| EvalError::io("reading entry file", e))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: EntryRecord = serde_json::from_str(&line).map_err(|e| {
                EvalError::ParseError(format!("{} line {}: {}", path.display(), line_num + 1, e))
            })?;
            entries.push(record.into_entry(lang, label)?);
        }

        Ok(entries)
    }
}
