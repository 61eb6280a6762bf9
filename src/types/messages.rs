//! Messages API request and response types

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

// ============================================================================
// Request
// ============================================================================

/// Speaker of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// End user
    User,
    /// Model
    Assistant,
}

/// Content of a conversation turn: plain text or blocks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain string content
    Text(String),
    /// Structured content blocks
    Blocks(Vec<ContentBlock>),
}

/// One conversation turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who is speaking
    pub role: Role,
    /// What was said
    pub content: MessageContent,
}

impl ChatMessage {
    /// A user turn with plain text
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    /// An assistant turn with plain text
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }
}

/// Body of a `POST /v1/messages` call
///
/// # Example
///
/// ```
/// use anthropic_oauth_session::types::{ChatMessage, MessageRequest};
///
/// let request = MessageRequest::builder()
///     .model("claude-sonnet-4-5")
///     .messages(vec![ChatMessage::user("Explain photosynthesis to a 10 year old")])
///     .system("You are a patient tutor.")
///     .build();
/// assert_eq!(request.max_tokens, 1024);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct MessageRequest {
    /// Model identifier
    #[builder(setter(into))]
    pub model: String,
    /// Upper bound on generated tokens
    #[builder(default = 1024)]
    pub max_tokens: u32,
    /// Conversation so far
    pub messages: Vec<ChatMessage>,
    /// System prompt
    #[builder(default, setter(strip_option, into))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Sampling temperature
    #[builder(default, setter(strip_option))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

// ============================================================================
// Response
// ============================================================================

/// Content block types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Text content block
    Text {
        /// Text content
        text: String,
    },
    /// Thinking content block (extended thinking)
    Thinking {
        /// Thinking content
        thinking: String,
        /// Signature for verification
        signature: String,
    },
    /// Tool use request
    ToolUse {
        /// Tool use ID
        id: String,
        /// Tool name
        name: String,
        /// Tool input parameters
        input: serde_json::Value,
    },
}

/// Token accounting for one call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageUsage {
    /// Prompt tokens
    #[serde(default)]
    pub input_tokens: u64,
    /// Generated tokens
    #[serde(default)]
    pub output_tokens: u64,
}

/// Reply from `POST /v1/messages`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageResponse {
    /// Message ID
    pub id: String,
    /// Model that generated the message
    pub model: String,
    /// Always `assistant`
    pub role: Role,
    /// Message content blocks
    pub content: Vec<ContentBlock>,
    /// Why generation stopped
    #[serde(default)]
    pub stop_reason: Option<String>,
    /// Token usage
    #[serde(default)]
    pub usage: MessageUsage,
}

impl MessageResponse {
    /// Concatenated text of every text block
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization_skips_unset_fields() {
        let request = MessageRequest::builder()
            .model("claude-sonnet-4-5")
            .messages(vec![ChatMessage::user("hi")])
            .build();
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(
            value,
            json!({
                "model": "claude-sonnet-4-5",
                "max_tokens": 1024,
                "messages": [{"role": "user", "content": "hi"}]
            })
        );
    }

    #[test]
    fn test_response_text_joins_text_blocks() {
        let response: MessageResponse = serde_json::from_value(json!({
            "id": "msg_1",
            "model": "claude-sonnet-4-5",
            "role": "assistant",
            "content": [
                {"type": "thinking", "thinking": "hmm", "signature": "sig"},
                {"type": "text", "text": "Plants "},
                {"type": "text", "text": "eat light."}
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 12, "output_tokens": 4}
        }))
        .unwrap();

        assert_eq!(response.text(), "Plants eat light.");
        assert_eq!(response.usage.output_tokens, 4);
    }
}
