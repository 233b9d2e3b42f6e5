//! Llama 3.x header template.

use super::{GenerationLimits, ModelFamily, ModelInterface};

const EOT: &str = "<|eot_id|>";

pub struct Llama3Interface {
    limits: GenerationLimits,
}

impl Llama3Interface {
    pub fn new(limits: GenerationLimits) -> Self {
        Self { limits }
    }
}

fn header(role: &str) -> String {
    format!("<|start_header_id|>{role}<|end_header_id|>\n\n")
}

impl ModelInterface for Llama3Interface {
    fn family(&self) -> ModelFamily {
        ModelFamily::Llama3
    }

    fn limits(&self) -> &GenerationLimits {
        &self.limits
    }

    fn render_chat(&self, system: &str, user: &str, _reasoning: bool) -> String {
        format!(
            "<|begin_of_text|>{}{system}{EOT}{}{user}{EOT}{}",
            header("system"),
            header("user"),
            header("assistant"),
        )
    }

    fn clean_response(&self, raw: &str) -> String {
        raw.replace(EOT, "").trim().to_string()
    }
}
