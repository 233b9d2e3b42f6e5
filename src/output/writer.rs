//! Merge-and-rewrite persistence of JSONL result files.
//!
//! Epistemic foundation:
//! - K_i: After every write the file is sorted and free of duplicate task ids
//! - K_i: A persisted record is never replaced by a later result for the same task
//! - K_i: The file is replaced atomically (write-then-rename)
//! - B_i: The file may not exist yet → treated as empty

use crate::models::{EvalError, PAIR_ID_SEPARATOR, Result, TaskRecord, numeric_key};
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// What one `append_and_rewrite` call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    /// Records already in the file
    pub existing: usize,
    /// New records written
    pub added: usize,
    /// New records dropped because their task id was already present
    pub duplicates: usize,
    /// Records in the file afterwards
    pub total: usize,
}

/// One persisted line and the task id it carries, if any.
struct Line {
    id: Option<String>,
    text: String,
}

/// Owns one result file.
#[derive(Debug, Clone)]
pub struct ResultWriter {
    path: PathBuf,
}

impl ResultWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Task ids already persisted.
    pub fn existing_ids(&self) -> Result<HashSet<String>> {
        Ok(self.read_lines()?.into_iter().filter_map(|line| line.id).collect())
    }

    /// Merge `new_results` into the file, keeping existing records on id clashes,
    /// then rewrite it sorted by the numeric key of each task id.
    pub fn append_and_rewrite<T>(&self, new_results: &[T]) -> Result<WriteSummary>
    where
        T: Serialize + TaskRecord,
    {
        let mut lines = self.read_lines()?;
        let mut seen: HashSet<String> = lines.iter().filter_map(|l| l.id.clone()).collect();
        let mut summary = WriteSummary {
            existing: lines.len(),
            ..Default::default()
        };

        for result in new_results {
            let id = result.task_id();
            if !seen.insert(id.to_string()) {
                summary.duplicates += 1;
                continue;
            }
            let text = serde_json::to_string(result)
                .map_err(|e| EvalError::Internal(format!("Serializing result {id}: {e}")))?;
            lines.push(Line {
                id: Some(id.to_string()),
                text,
            });
            summary.added += 1;
        }

        lines.sort_by(compare_lines);
        summary.total = lines.len();
        self.write_lines(&lines)?;

        debug!(
            path = %self.path.display(),
            added = summary.added,
            duplicates = summary.duplicates,
            total = summary.total,
            "Results written"
        );
        Ok(summary)
    }

    fn read_lines(&self) -> Result<Vec<Line>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EvalError::io("opening result file", e)),
        };

        let mut lines = Vec::new();
        let mut seen = HashSet::new();
        for (line_num, line) in BufReader::new(file).lines().enumerate() {
            let text = line.map_err(|e| EvalError::io("reading result file", e))?;
            if text.trim().is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(&text).map_err(|e| {
                EvalError::ParseError(format!(
                    "{} line {}: {e}",
                    self.path.display(),
                    line_num + 1
                ))
            })?;
            let id = record_id(&value);
            // Files written by other tools may repeat ids; the first one wins
            if let Some(id) = &id {
                if !seen.insert(id.clone()) {
                    continue;
                }
            }
            lines.push(Line { id, text });
        }
        Ok(lines)
    }

    fn write_lines(&self, lines: &[Line]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| EvalError::io("creating result directory", e))?;
        }

        let mut temp_name = self.path.file_name().unwrap_or_default().to_os_string();
        temp_name.push(".tmp");
        let temp_path = self.path.with_file_name(temp_name);

        let file =
            File::create(&temp_path).map_err(|e| EvalError::io("creating temp result file", e))?;
        let mut writer = BufWriter::new(file);
        for line in lines {
            writeln!(writer, "{}", line.text)
                .map_err(|e| EvalError::io("writing result file", e))?;
        }
        writer
            .flush()
            .map_err(|e| EvalError::io("flushing result file", e))?;
        drop(writer);

        fs::rename(&temp_path, &self.path).map_err(|e| EvalError::io("renaming result file", e))
    }
}

/// Task id of a persisted record: `pair_id`, else `id`, else `index`.
fn record_id(value: &Value) -> Option<String> {
    ["pair_id", "id", "index"]
        .iter()
        .find_map(|field| match value.get(field)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

/// Numeric key of a task id; pair ids use their first entry's id.
fn sort_key(id: &str) -> Option<u64> {
    id.split(PAIR_ID_SEPARATOR).next().and_then(numeric_key)
}

/// Keyed records by key then id; unkeyed records after them, in their existing order.
fn compare_lines(a: &Line, b: &Line) -> Ordering {
    let key_a = a.id.as_deref().and_then(|id| sort_key(id).map(|k| (k, id)));
    let key_b = b.id.as_deref().and_then(|id| sort_key(id).map(|k| (k, id)));
    match (key_a, key_b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
