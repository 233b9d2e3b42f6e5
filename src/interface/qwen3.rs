//! Qwen3 ChatML template with optional thinking.

use super::{GenerationLimits, ModelFamily, ModelInterface, extract_verdict};
use crate::models::{EvalError, Result, Verdict};

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";
const IM_END: &str = "<|im_end|>";

pub struct Qwen3Interface {
    limits: GenerationLimits,
}

impl Qwen3Interface {
    pub fn new(limits: GenerationLimits) -> Self {
        Self { limits }
    }
}

/// Text after the reasoning block. An unclosed block leaves nothing.
fn after_thinking(raw: &str) -> &str {
    if let Some(pos) = raw.rfind(THINK_CLOSE) {
        &raw[pos + THINK_CLOSE.len()..]
    } else if raw.contains(THINK_OPEN) {
        ""
    } else {
        raw
    }
}

impl ModelInterface for Qwen3Interface {
    fn family(&self) -> ModelFamily {
        ModelFamily::Qwen3
    }

    fn limits(&self) -> &GenerationLimits {
        &self.limits
    }

    fn render_chat(&self, system: &str, user: &str, reasoning: bool) -> String {
        let mut prompt = format!(
            "<|im_start|>system\n{system}{IM_END}\n<|im_start|>user\n{user}{IM_END}\n<|im_start|>assistant\n"
        );
        if !reasoning {
            prompt.push_str("<think>\n\n</think>\n\n");
        }
        prompt
    }

    fn clean_response(&self, raw: &str) -> String {
        after_thinking(raw).replace(IM_END, "").trim().to_string()
    }

    /// Look after the reasoning first, then anywhere in the reply.
    fn parse_verdict(&self, raw: &str) -> Result<Verdict> {
        extract_verdict(&self.clean_response(raw))
            .or_else(|| extract_verdict(&raw.replace(IM_END, "")))
            .ok_or_else(|| EvalError::unparseable(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interface() -> Qwen3Interface {
        Qwen3Interface::new(GenerationLimits::default())
    }

    #[test]
    fn test_render_disables_thinking_for_direct() {
        let direct = interface().render_chat("sys", "hi", false);
        assert!(direct.starts_with("<|im_start|>system\nsys<|im_end|>\n<|im_start|>user\nhi"));
        assert!(direct.ends_with("<|im_start|>assistant\n<think>\n\n</think>\n\n"));

        let reasoning = interface().render_chat("sys", "hi", true);
        assert!(reasoning.ends_with("<|im_start|>assistant\n"));
    }

    #[test]
    fn test_clean_strips_reasoning() {
        let raw = "<think>Maybe A... no, Final answer: A is wrong.</think>\n\nFinal answer: B<|im_end|>";
        assert_eq!(interface().clean_response(raw), "Final answer: B");
        assert_eq!(interface().parse_verdict(raw).unwrap(), Verdict::B);
    }

    #[test]
    fn test_verdict_inside_truncated_reasoning() {
        let raw = "<think>Answer B contradicts the question, so Final answer: A";
        assert_eq!(interface().clean_response(raw), "");
        assert_eq!(interface().parse_verdict(raw).unwrap(), Verdict::A);
        assert!(interface().parse_verdict("<think>undecided").is_err());
    }
}
