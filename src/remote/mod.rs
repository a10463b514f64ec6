// Remote access layer: the REST backend the engine synchronises against.
// `http` talks to the real backend, `memory` is an in-process stand-in.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{
    Chat, ChatId, ChatStatus, Company, Job, JobApplication, Message, MessageId, MessagePatch,
    NewChat, NewMessage, PinnedChat, Resume, ResumeApplication, User, UserId,
};

pub mod http;
pub mod memory;

pub use http::HttpRemote;
pub use memory::InMemoryRemote;

#[derive(Debug, Error)]
pub enum RemoteError {
    /// Connection refused, reset, timed out, ...
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP {status} from {endpoint}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("Failed to decode response from {endpoint}: {reason}")]
    Decode { endpoint: String, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),
}

impl RemoteError {
    /// Transient failures are worth retrying for writes
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Transport(_) => true,
            RemoteError::Status { status, .. } => *status >= 500 || *status == 429,
            RemoteError::Decode { .. } | RemoteError::NotFound(_) => false,
        }
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Every backend endpoint the engine uses. Implementations must be cheap to
/// share across tasks.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    // Chats
    async fn list_chats(&self) -> RemoteResult<Vec<Chat>>;
    async fn get_chat(&self, id: ChatId) -> RemoteResult<Chat>;
    async fn create_chat(&self, chat: &NewChat) -> RemoteResult<Chat>;
    async fn update_chat_status(&self, id: ChatId, status: ChatStatus) -> RemoteResult<Chat>;
    async fn delete_chat(&self, id: ChatId) -> RemoteResult<()>;
    async fn mark_all_read(&self, chat: ChatId, user: UserId) -> RemoteResult<()>;
    async fn unread_count(&self, user: UserId) -> RemoteResult<u32>;

    // Messages
    async fn list_messages(&self) -> RemoteResult<Vec<Message>>;
    async fn list_chat_messages(&self, chat: ChatId) -> RemoteResult<Vec<Message>>;
    async fn get_message(&self, id: MessageId) -> RemoteResult<Message>;
    async fn create_message(&self, message: &NewMessage) -> RemoteResult<Message>;
    async fn update_message(&self, id: MessageId, patch: &MessagePatch) -> RemoteResult<Message>;
    async fn delete_message(&self, id: MessageId) -> RemoteResult<()>;
    async fn delete_all_messages(&self, chat: ChatId) -> RemoteResult<()>;

    // Records the aggregator joins against
    async fn list_job_applications(&self) -> RemoteResult<Vec<JobApplication>>;
    async fn list_resume_applications(&self) -> RemoteResult<Vec<ResumeApplication>>;
    async fn list_jobs(&self) -> RemoteResult<Vec<Job>>;
    async fn list_resumes(&self) -> RemoteResult<Vec<Resume>>;
    async fn list_users(&self) -> RemoteResult<Vec<User>>;
    async fn get_user(&self, id: UserId) -> RemoteResult<User>;
    async fn list_companies(&self) -> RemoteResult<Vec<Company>>;

    // Pins
    async fn list_pinned_chats(&self, user: UserId) -> RemoteResult<Vec<PinnedChat>>;
    async fn create_pinned_chat(&self, user: UserId, chat: ChatId) -> RemoteResult<PinnedChat>;
    async fn delete_pinned_chat(&self, user: UserId, chat: ChatId) -> RemoteResult<()>;
}
