//! Cross-language pair construction.
//!
//! Epistemic foundation:
//! - K_i: Pair side A always holds the alphabetically-first language
//! - K_i: Entries describing the same question share a numeric id key
//! - B_i: Both lists carry keys → key join; otherwise positional zip
//! - B_i: A key join may match nothing → InputMismatch

use crate::models::{Entry, EvalError, Pair, Result};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Builds ordered pairs from two per-language entry lists.
pub struct PairBuilder;

impl PairBuilder {
    /// Combine two entry lists into pairs.
    ///
    /// The languages are ordered internally, so swapping the arguments yields
    /// the same pairs in the same order. Entries are aligned by their numeric
    /// id key when every entry has one, positionally otherwise.
    pub fn combine(x: &[Entry], y: &[Entry], lang_x: &str, lang_y: &str) -> Result<Vec<Pair>> {
        if x.is_empty() || y.is_empty() {
            return Err(EvalError::InputMismatch(format!(
                "cannot pair {lang_x} ({} entries) with {lang_y} ({} entries)",
                x.len(),
                y.len()
            )));
        }
        if lang_x == lang_y {
            return Err(EvalError::InputMismatch(format!(
                "pairing needs two distinct languages, got '{lang_x}' twice"
            )));
        }

        let (first, second) = if lang_x < lang_y { (x, y) } else { (y, x) };

        let keyed = first.iter().chain(second).all(|e| e.question_key().is_some());
        let pairs = if keyed {
            let pairs = Self::join_by_key(first, second);
            if pairs.is_empty() {
                return Err(EvalError::InputMismatch(format!(
                    "{lang_x} and {lang_y} entries share no question keys"
                )));
            }
            pairs
        } else {
            if first.len() != second.len() {
                warn!(
                    first = first.len(),
                    second = second.len(),
                    "Unkeyed entry lists differ in length; extra entries are dropped"
                );
            }
            first
                .iter()
                .zip(second)
                .map(|(a, b)| make_pair(a, b))
                .collect()
        };

        debug!(pairs = pairs.len(), keyed, "Combined entries into pairs");
        Ok(pairs)
    }

    fn join_by_key(first: &[Entry], second: &[Entry]) -> Vec<Pair> {
        let mut by_key: HashMap<u64, &Entry> = HashMap::with_capacity(second.len());
        for entry in second {
            if let Some(key) = entry.question_key() {
                by_key.entry(key).or_insert(entry);
            }
        }

        let pairs: Vec<Pair> = first
            .iter()
            .filter_map(|a| {
                let b = by_key.get(&a.question_key()?)?;
                Some(make_pair(a, b))
            })
            .collect();

        let unmatched = first.len() - pairs.len();
        if unmatched > 0 {
            warn!(unmatched, "Entries without a counterpart were left unpaired");
        }
        pairs
    }
}

fn make_pair(a: &Entry, b: &Entry) -> Pair {
    Pair {
        entry_a: a.clone(),
        entry_b: b.clone(),
    }
}
