//! Prompt text shared by every model family, and verdict extraction.

use crate::models::{Entry, Pair, Verdict};
use regex::Regex;
use std::sync::LazyLock;

/// System prompt for answering a benchmark question.
pub const ANSWER_SYSTEM_PROMPT: &str =
    "You are a knowledgeable assistant. Answer the question accurately and concisely.";

/// System prompt for comparing two candidate answers.
pub const JUDGE_SYSTEM_PROMPT: &str = "You are an impartial judge. You are shown a question and \
two candidate answers, labelled A and B. Decide which answer is more correct.";

const LETTERS: [char; 4] = ['A', 'B', 'C', 'D'];

/// The question, followed by its lettered choices when the entry has them.
pub fn question_prompt(entry: &Entry) -> String {
    match &entry.choices {
        Some(choices) => {
            let options: Vec<String> = LETTERS
                .iter()
                .zip(choices)
                .map(|(letter, choice)| format!("{letter}. {choice}"))
                .collect();
            format!("{}\n\n{}", entry.question, options.join("\n"))
        }
        None => entry.question.clone(),
    }
}

fn comparison_body(pair: &Pair) -> String {
    format!(
        "## Question\n{}\n\n## Answer A\n{}\n\n## Answer B\n{}",
        question_prompt(&pair.entry_a),
        pair.entry_a.answer().unwrap_or_default(),
        pair.entry_b.answer().unwrap_or_default(),
    )
}

/// Forced-choice prompt: the reply is a single letter.
pub fn direct_judge_prompt(pair: &Pair) -> String {
    format!(
        "{}\n\nWhich answer is correct? Reply with exactly one letter: A or B.",
        comparison_body(pair)
    )
}

/// Reasoning prompt: free-form analysis ending in a marked verdict.
pub fn cot_judge_prompt(pair: &Pair) -> String {
    format!(
        "{}\n\nThink through the question step by step, then compare both answers. \
End your reply with a final line of the form \"Final answer: A\" or \"Final answer: B\".",
        comparison_body(pair)
    )
}

static MARKED_VERDICT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\\boxed\{\s*(?:\\text\{)?\s*([AB])\s*\}?\s*\}|(?i:final\s+answer|verdict)\s*(?:is)?\s*[:：]?\s*\**\s*\(?([AB])\b",
    )
    .expect("valid verdict pattern")
});

static BARE_VERDICT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\**\(?([AB])\)?\.?\**$").expect("valid bare verdict pattern")
});

/// Find the verdict in a reply. The last marked verdict wins; a reply that is
/// only a letter counts as a verdict too.
pub fn extract_verdict(text: &str) -> Option<Verdict> {
    let marked = MARKED_VERDICT
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .last();
    if let Some(letter) = marked {
        return Verdict::from_letter(letter.as_str());
    }

    BARE_VERDICT
        .captures(text.trim())
        .and_then(|caps| caps.get(1))
        .and_then(|letter| Verdict::from_letter(letter.as_str()))
}
