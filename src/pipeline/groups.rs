//! Task groups: one output file's worth of tasks.

use crate::dataset::{EntryStore, PairBuilder};
use crate::models::{CorrectnessLabel, Entry, EvalError, Result, ResultType, Task};
use std::collections::HashMap;
use tracing::warn;

use CorrectnessLabel::{Correct, Incorrect};

/// Tasks that share one output file, named by `suffix`.
#[derive(Debug, Clone)]
pub struct TaskGroup {
    pub suffix: String,
    pub tasks: Vec<Task>,
}

/// Groups to run, plus suffixes of groups whose inputs could not be paired.
#[derive(Debug, Default)]
pub struct GroupPlan {
    pub groups: Vec<TaskGroup>,
    pub skipped: Vec<String>,
}

/// Label combinations evaluated for every language pair.
const PAIR_LABELS: [(CorrectnessLabel, CorrectnessLabel); 4] = [
    (Correct, Incorrect),
    (Incorrect, Correct),
    (Correct, Correct),
    (Incorrect, Incorrect),
];

/// Output suffix of a pair group, languages in pair order.
pub fn pair_suffix(
    lang_x: &str,
    label_x: CorrectnessLabel,
    lang_y: &str,
    label_y: CorrectnessLabel,
) -> String {
    let ((lang_a, label_a), (lang_b, label_b)) = if lang_x <= lang_y {
        ((lang_x, label_x), (lang_y, label_y))
    } else {
        ((lang_y, label_y), (lang_x, label_x))
    };
    format!("{lang_a}_{label_a}_{lang_b}_{label_b}")
}

/// Loads each entry file at most once.
struct EntryCache<'a> {
    store: &'a EntryStore,
    limit: Option<usize>,
    loaded: HashMap<(String, CorrectnessLabel), Vec<Entry>>,
}

impl<'a> EntryCache<'a> {
    fn new(store: &'a EntryStore, limit: Option<usize>) -> Self {
        Self {
            store,
            limit,
            loaded: HashMap::new(),
        }
    }

    fn get(&mut self, lang: &str, label: CorrectnessLabel) -> Result<&[Entry]> {
        let key = (lang.to_string(), label);
        if !self.loaded.contains_key(&key) {
            let entries = self.store.load(lang, label, self.limit)?;
            self.loaded.insert(key.clone(), entries);
        }
        Ok(self.loaded.get(&key).map(Vec::as_slice).unwrap_or_default())
    }
}

/// Build the task groups a run of `result_type` over two languages needs.
pub fn plan_groups(
    store: &EntryStore,
    result_type: ResultType,
    lang1: &str,
    lang2: &str,
    limit: Option<usize>,
) -> Result<GroupPlan> {
    let mut cache = EntryCache::new(store, limit);
    let mut plan = GroupPlan::default();

    match result_type {
        ResultType::PreferenceDirect | ResultType::PreferenceCot => {
            for (label1, label2) in PAIR_LABELS {
                let suffix = pair_suffix(lang1, label1, lang2, label2);
                let x = cache.get(lang1, label1)?.to_vec();
                let y = cache.get(lang2, label2)?;
                match PairBuilder::combine(&x, y, lang1, lang2) {
                    Ok(pairs) => plan.groups.push(TaskGroup {
                        suffix,
                        tasks: pairs.into_iter().map(Task::Pair).collect(),
                    }),
                    Err(EvalError::InputMismatch(reason)) => {
                        warn!(%suffix, %reason, "Skipping pair group");
                        plan.skipped.push(suffix);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        ResultType::Perplexity => {
            for lang in [lang1, lang2] {
                for label in [Correct, Incorrect] {
                    push_singles(&mut plan, format!("{lang}_{label}"), cache.get(lang, label)?);
                }
            }
        }
        ResultType::Response => {
            for lang in [lang1, lang2] {
                push_singles(&mut plan, lang.to_string(), cache.get(lang, Correct)?);
            }
        }
    }

    Ok(plan)
}

fn push_singles(plan: &mut GroupPlan, suffix: String, entries: &[Entry]) {
    if entries.is_empty() {
        warn!(%suffix, "Skipping empty entry group");
        plan.skipped.push(suffix);
        return;
    }
    plan.groups.push(TaskGroup {
        suffix,
        tasks: entries.iter().cloned().map(Task::Single).collect(),
    });
}
