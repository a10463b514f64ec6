use thiserror::Error;

use crate::models::{ChatId, ChatStatus};
use crate::remote::RemoteError;

/// Errors surfaced by the sync engine to its caller
#[derive(Debug, Error)]
pub enum SyncError {
    /// The backend call failed (after retries, for writes)
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// A fourth pin was requested; nothing was written
    #[error("You can only pin up to {max} chats. Unpin one first.")]
    PinCapacity { max: usize },

    #[error("Chat {chat} is {status} and does not accept new messages")]
    ChatNotWritable { chat: ChatId, status: ChatStatus },

    #[error("Chat {chat} cannot move from {from} to {to}")]
    InvalidStatusTransition {
        chat: ChatId,
        from: ChatStatus,
        to: ChatStatus,
    },

    #[error("Chat {0} is not in the conversation list")]
    UnknownConversation(ChatId),

    #[error("No conversation is selected")]
    NoConversationSelected,

    #[error("Message is empty")]
    EmptyMessage,

    #[error("Unsupported attachment type: {0}")]
    UnsupportedAttachment(String),

    /// The local pin fallback file could not be read or written
    #[error("Local store error: {0}")]
    LocalStore(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;
