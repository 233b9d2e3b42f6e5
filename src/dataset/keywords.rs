//! Keyword-assist records (`{"id": ..., "keywords": [...]}` per line).

use crate::models::{Entry, EvalError, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

#[derive(Debug, Deserialize)]
struct KeywordRecord {
    id: serde_json::Value,
    #[serde(default)]
    keywords: Vec<String>,
}

/// Keywords per record id, ordered by id.
pub type KeywordIndex = BTreeMap<String, Vec<String>>;

/// Load a keyword file. Numeric ids are stringified to match entry ids.
pub fn load_keywords(path: &Path) -> Result<KeywordIndex> {
    let file = File::open(path)
        .map_err(|e| EvalError::io(format!("opening keyword file {}", path.display()), e))?;
    let mut index = KeywordIndex::new();

    for (line_num, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| EvalError::io("reading keyword file", e))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: KeywordRecord = serde_json::from_str(&line)
            .map_err(|e| EvalError::ParseError(format!("Line {}: {}", line_num + 1, e)))?;
        let id = match record.id {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        let keywords = record.keywords.into_iter().filter(|k| !k.is_empty()).collect();
        index.insert(id, keywords);
    }

    Ok(index)
}

/// Keyword ids with no matching entry id.
pub fn unmatched_keyword_ids(index: &KeywordIndex, entries: &[Entry]) -> Vec<String> {
    let known: HashSet<&str> = entries.iter().map(|e| e.id.as_str()).collect();
    index
        .keys()
        .filter(|id| !known.contains(id.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CorrectnessLabel, test_entry};
    use tempfile::TempDir;

    #[test]
    fn test_load_and_match_keywords() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keywords.jsonl");
        std::fs::write(
            &path,
            "{\"id\": 1, \"keywords\": [\"paris\", \"\"]}\n{\"id\": \"q9\", \"keywords\": []}\n",
        )
        .unwrap();

        let index = load_keywords(&path).unwrap();
        assert_eq!(index["1"], vec!["paris".to_string()]);

        let entries = vec![test_entry("1", "en", CorrectnessLabel::Correct)];
        assert_eq!(unmatched_keyword_ids(&index, &entries), vec!["q9".to_string()]);
    }
}
