//! Prompt templates for chat-tuned models
//!
//! A template is pure data: a global prefix, per-role wrapper strings, a
//! stop sequence, and an optional system prompt. Rendering walks the
//! history and wraps each turn, then opens the assistant turn for the
//! model to complete. No template language is involved.

use serde::{Deserialize, Serialize};

/// Speaker of one conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// End user
    User,
    /// The model
    Bot,
}

/// One prior turn of the conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    /// Who spoke
    pub role: Role,
    /// What they said
    pub content: String,
}

/// Wrapper strings placed around one role's content
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Emitted before the content
    pub prefix: String,
    /// Emitted after the content
    pub suffix: String,
}

impl Attachment {
    fn new(prefix: &str, suffix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
        }
    }
}

/// Conversation formatting rules for one model family
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    /// Emitted once at the start of a rendered prompt
    pub prefix: String,
    /// Wrappers for the system prompt
    pub system: Attachment,
    /// Wrappers for user turns
    pub user: Attachment,
    /// Wrappers for bot turns
    pub bot: Attachment,
    /// Text whose appearance ends generation
    pub stop_sequence: Option<String>,
    /// Standing system prompt, wrapped by `system`
    pub system_prompt: Option<String>,
    /// Drop the final character of the opening bot prefix
    ///
    /// Some model families tokenize the trailing space of their assistant
    /// marker together with the first generated piece.
    pub should_drop_last: bool,
}

impl Template {
    /// Render a prompt from history plus the new input
    ///
    /// With `continuing` set, only the new input is rendered: the caller
    /// holds retained KV state covering everything earlier, so re-rendering
    /// history would double-feed it.
    #[must_use]
    pub fn render(&self, input: &str, history: &[Turn], continuing: bool) -> String {
        if continuing {
            let mut out = self.prefix.clone();
            out.push_str(&self.user.prefix);
            out.push_str(input);
            out.push_str(&self.user.suffix);
            out.push_str(&self.bot.prefix);
            return out;
        }

        let mut out = self.prefix.clone();

        if let Some(system_prompt) = &self.system_prompt {
            out.push_str(&self.system.prefix);
            out.push_str(system_prompt);
            out.push_str(&self.system.suffix);
        }

        for turn in history {
            let attachment = match turn.role {
                Role::User => &self.user,
                Role::Bot => &self.bot,
            };
            out.push_str(&attachment.prefix);
            out.push_str(&turn.content);
            out.push_str(&attachment.suffix);
        }

        out.push_str(&self.user.prefix);
        out.push_str(input);
        out.push_str(&self.user.suffix);

        if self.should_drop_last {
            let mut opener = self.bot.prefix.clone();
            opener.pop();
            out.push_str(&opener);
        } else {
            out.push_str(&self.bot.prefix);
        }

        out
    }

    /// Template for OLMoE-style models
    #[must_use]
    pub fn olmoe(system_prompt: Option<String>) -> Self {
        Self {
            prefix: "<|endoftext|>".to_string(),
            system: Attachment::new("<|system|>\n", "\n"),
            user: Attachment::new("<|user|>\n", "\n"),
            bot: Attachment::new("<|assistant|>\n", "\n"),
            stop_sequence: Some("<|endoftext|>".to_string()),
            system_prompt,
            should_drop_last: false,
        }
    }

    /// Template for ChatML-format models
    #[must_use]
    pub fn chat_ml(system_prompt: Option<String>) -> Self {
        Self {
            prefix: String::new(),
            system: Attachment::new("<|im_start|>system\n", "<|im_end|>\n"),
            user: Attachment::new("<|im_start|>user\n", "<|im_end|>\n"),
            bot: Attachment::new("<|im_start|>assistant\n", "<|im_end|>\n"),
            stop_sequence: Some("<|im_end|>".to_string()),
            system_prompt,
            should_drop_last: false,
        }
    }

    /// Template for Alpaca-style instruction models
    #[must_use]
    pub fn alpaca(system_prompt: Option<String>) -> Self {
        Self {
            prefix: String::new(),
            system: Attachment::new("", "\n\n"),
            user: Attachment::new("### Instruction:\n", "\n\n"),
            bot: Attachment::new("### Response:\n", "\n\n"),
            stop_sequence: Some("###".to_string()),
            system_prompt,
            should_drop_last: false,
        }
    }

    /// Template for LLaMA-style chat models
    #[must_use]
    pub fn llama(system_prompt: Option<String>) -> Self {
        Self {
            prefix: "[INST] ".to_string(),
            system: Attachment::new("<<SYS>>\n", "\n<</SYS>>\n\n"),
            user: Attachment::new("", " [/INST]"),
            bot: Attachment::new(" ", "</s><s>[INST] "),
            stop_sequence: Some("</s>".to_string()),
            system_prompt,
            should_drop_last: true,
        }
    }

    /// Template for Mistral-instruct models
    #[must_use]
    pub fn mistral() -> Self {
        Self {
            prefix: String::new(),
            system: Attachment::default(),
            user: Attachment::new("[INST] ", " [/INST]"),
            bot: Attachment::new("", "</s> "),
            stop_sequence: Some("</s>".to_string()),
            system_prompt: None,
            should_drop_last: false,
        }
    }
}
