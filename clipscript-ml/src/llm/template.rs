//! Chat templates and assistant reply extraction.

use clipscript_core::config::ChatTemplateKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix returned when a decode has no assistant turn to extract.
pub const PARSE_ERROR_PREFIX: &str = "Error parsing response. Raw output:\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// A chat message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Renders conversations in a model family's special-token markup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatTemplate {
    kind: ChatTemplateKind,
}

impl ChatTemplate {
    pub fn new(kind: ChatTemplateKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> ChatTemplateKind {
        self.kind
    }

    /// Render `messages`. With `add_generation_prompt`, an open assistant
    /// header is appended for the model to continue.
    pub fn render(&self, messages: &[ChatMessage], add_generation_prompt: bool) -> String {
        let mut out = String::new();
        if self.kind == ChatTemplateKind::Llama3 {
            out.push_str("<|begin_of_text|>");
        }
        for message in messages {
            out.push_str(&self.header(message.role));
            out.push_str(&message.content);
            out.push_str(self.end_of_turn());
            if self.kind == ChatTemplateKind::ChatMl {
                out.push('\n');
            }
        }
        if add_generation_prompt {
            out.push_str(&self.header(Role::Assistant));
        }
        out
    }

    fn header(&self, role: Role) -> String {
        match self.kind {
            ChatTemplateKind::Llama3 => format!("<|start_header_id|>{role}<|end_header_id|>\n\n"),
            ChatTemplateKind::ChatMl => format!("<|im_start|>{role}\n"),
        }
    }

    /// Marker that opens the assistant turn.
    pub fn assistant_marker(&self) -> &'static str {
        match self.kind {
            ChatTemplateKind::Llama3 => "<|start_header_id|>assistant<|end_header_id|>",
            ChatTemplateKind::ChatMl => "<|im_start|>assistant",
        }
    }

    pub fn end_of_turn(&self) -> &'static str {
        match self.kind {
            ChatTemplateKind::Llama3 => "<|eot_id|>",
            ChatTemplateKind::ChatMl => "<|im_end|>",
        }
    }

    /// Tokens that may close a generated turn.
    fn stop_markers(&self) -> &'static [&'static str] {
        match self.kind {
            ChatTemplateKind::Llama3 => &["<|eot_id|>", "<|end_of_text|>"],
            ChatTemplateKind::ChatMl => &["<|im_end|>", "<|endoftext|>"],
        }
    }

    /// Pull the final assistant turn out of a raw decode.
    ///
    /// Returns the text after the last assistant marker up to the first stop
    /// marker, trimmed. Never fails: without a marker the raw text comes back
    /// behind `PARSE_ERROR_PREFIX`.
    pub fn extract_reply(&self, raw: &str) -> String {
        let marker = self.assistant_marker();
        let Some(idx) = raw.rfind(marker) else {
            return format!("{PARSE_ERROR_PREFIX}{raw}");
        };

        let turn = &raw[idx + marker.len()..];
        let end = self
            .stop_markers()
            .iter()
            .filter_map(|stop| turn.find(stop))
            .min()
            .unwrap_or(turn.len());
        turn[..end].trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn llama3() -> ChatTemplate {
        ChatTemplate::new(ChatTemplateKind::Llama3)
    }

    #[test]
    fn test_llama3_training_example() {
        let text = llama3().render(
            &[
                ChatMessage::new(Role::User, "Write a script."),
                ChatMessage::new(Role::Assistant, "no cap, here it is"),
            ],
            false,
        );
        assert_eq!(
            text,
            "<|begin_of_text|><|start_header_id|>user<|end_header_id|>\n\nWrite a script.<|eot_id|>\
             <|start_header_id|>assistant<|end_header_id|>\n\nno cap, here it is<|eot_id|>"
        );
    }

    #[test]
    fn test_llama3_generation_prompt() {
        let text = llama3().render(
            &[
                ChatMessage::new(Role::System, "sys"),
                ChatMessage::new(Role::User, "News Summary:\nrates rose"),
            ],
            true,
        );
        assert!(text.starts_with("<|begin_of_text|><|start_header_id|>system<|end_header_id|>\n\nsys<|eot_id|>"));
        assert!(text.ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"));
    }

    #[test]
    fn test_chatml_render() {
        let text = ChatTemplate::new(ChatTemplateKind::ChatMl)
            .render(&[ChatMessage::new(Role::User, "hi")], true);
        assert_eq!(text, "<|im_start|>user\nhi<|im_end|>\n<|im_start|>assistant\n");
    }

    #[test]
    fn test_extract_between_markers() {
        let raw = "<|begin_of_text|><|start_header_id|>user<|end_header_id|>\n\nq<|eot_id|>\
                   <|start_header_id|>assistant<|end_header_id|>\n\n  POV: the Fed said no  \n<|eot_id|>";
        assert_eq!(llama3().extract_reply(raw), "POV: the Fed said no");
    }

    #[test]
    fn test_extract_uses_last_assistant_turn() {
        let raw = "<|start_header_id|>assistant<|end_header_id|>\n\nfirst<|eot_id|>\
                   <|start_header_id|>assistant<|end_header_id|>\n\nsecond<|eot_id|>";
        assert_eq!(llama3().extract_reply(raw), "second");
    }

    #[test]
    fn test_extract_without_end_marker_takes_rest() {
        let raw = "<|start_header_id|>assistant<|end_header_id|>\n\ncut off mid sentence";
        assert_eq!(llama3().extract_reply(raw), "cut off mid sentence");
    }

    #[test]
    fn test_extract_stops_at_end_of_text() {
        let raw = "<|start_header_id|>assistant<|end_header_id|>\n\nbody<|end_of_text|>junk";
        assert_eq!(llama3().extract_reply(raw), "body");
    }

    #[test]
    fn test_extract_without_marker_degrades_to_raw() {
        let raw = "the model rambled with no header";
        let reply = llama3().extract_reply(raw);
        assert_eq!(reply, format!("{PARSE_ERROR_PREFIX}{raw}"));
        assert!(reply.starts_with("Error parsing response. Raw output:\n"));
    }

    #[test]
    fn test_chatml_extract() {
        let template = ChatTemplate::new(ChatTemplateKind::ChatMl);
        let raw = "<|im_start|>user\nq<|im_end|>\n<|im_start|>assistant\nreply here<|im_end|>";
        assert_eq!(template.extract_reply(raw), "reply here");
    }
}
