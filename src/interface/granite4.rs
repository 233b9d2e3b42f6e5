//! Granite 4 role template.

use super::{GenerationLimits, ModelFamily, ModelInterface};

const END_OF_TEXT: &str = "<|end_of_text|>";

pub struct Granite4Interface {
    limits: GenerationLimits,
}

impl Granite4Interface {
    pub fn new(limits: GenerationLimits) -> Self {
        Self { limits }
    }
}

impl ModelInterface for Granite4Interface {
    fn family(&self) -> ModelFamily {
        ModelFamily::Granite4
    }

    fn limits(&self) -> &GenerationLimits {
        &self.limits
    }

    fn render_chat(&self, system: &str, user: &str, _reasoning: bool) -> String {
        format!(
            "<|start_of_role|>system<|end_of_role|>{system}{END_OF_TEXT}\n\
<|start_of_role|>user<|end_of_role|>{user}{END_OF_TEXT}\n\
<|start_of_role|>assistant<|end_of_role|>"
        )
    }

    fn clean_response(&self, raw: &str) -> String {
        raw.replace(END_OF_TEXT, "").trim().to_string()
    }
}
