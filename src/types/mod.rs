//! Type definitions shared across the crate

mod identifiers;
mod messages;

pub use identifiers::{ContextId, ListenerId, SessionId};
pub use messages::{
    ChatMessage, ContentBlock, MessageContent, MessageRequest, MessageResponse, MessageUsage, Role,
};
