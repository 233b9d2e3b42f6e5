//! Hosted chat models: the rendered prompt is sent as one user message.

use super::{GenerationLimits, ModelFamily, ModelInterface};

pub struct ApiChatInterface {
    limits: GenerationLimits,
}

impl ApiChatInterface {
    pub fn new(limits: GenerationLimits) -> Self {
        Self { limits }
    }
}

impl ModelInterface for ApiChatInterface {
    fn family(&self) -> ModelFamily {
        ModelFamily::ApiChat
    }

    fn limits(&self) -> &GenerationLimits {
        &self.limits
    }

    fn render_chat(&self, system: &str, user: &str, _reasoning: bool) -> String {
        if system.is_empty() {
            user.to_string()
        } else {
            format!("{system}\n\n{user}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_chat() {
        let interface = ApiChatInterface::new(GenerationLimits::default());
        assert_eq!(interface.render_chat("sys", "hi", true), "sys\n\nhi");
        assert_eq!(interface.render_chat("", "hi", true), "hi");
        assert_eq!(interface.family(), ModelFamily::ApiChat);
    }
}
