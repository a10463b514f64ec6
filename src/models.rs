// Records exchanged with the job-board backend and the view-models built from them

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

pub type ChatId = u64;
pub type MessageId = u64;
pub type UserId = u64;
pub type CompanyId = u64;
pub type JobId = u64;
pub type ResumeId = u64;
pub type ApplicationId = u64;

/// The authenticated participant. Relevance and unread counts are always
/// computed from this perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", content = "user_id", rename_all = "lowercase")]
pub enum Viewer {
    Student(UserId),
    Company(UserId),
}

impl Viewer {
    pub fn user_id(&self) -> UserId {
        match self {
            Viewer::Student(id) | Viewer::Company(id) => *id,
        }
    }

    pub fn role_name(&self) -> &'static str {
        match self {
            Viewer::Student(_) => "student",
            Viewer::Company(_) => "company",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatStatus {
    Active,
    Closed,  // Terminal
    Blocked, // Can be reverted to Active
}

impl ChatStatus {
    /// Whether participants may still post into a chat in this status
    pub fn accepts_messages(&self) -> bool {
        matches!(self, ChatStatus::Active)
    }

    pub fn can_transition_to(&self, next: ChatStatus) -> bool {
        match (self, next) {
            (ChatStatus::Active, ChatStatus::Closed) => true,
            (ChatStatus::Active, ChatStatus::Blocked) => true,
            (ChatStatus::Blocked, ChatStatus::Active) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ChatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChatStatus::Active => "active",
            ChatStatus::Closed => "closed",
            ChatStatus::Blocked => "blocked",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for ChatStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(ChatStatus::Active),
            "closed" => Ok(ChatStatus::Closed),
            "blocked" => Ok(ChatStatus::Blocked),
            other => Err(format!("unknown chat status '{}'", other)),
        }
    }
}

/// The application a conversation is anchored to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    JobApplication(ApplicationId),
    ResumeApplication(ApplicationId),
}

/// Wire shape of a chat. Both origin columns are nullable on the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRecord {
    pub id: ChatId,
    #[serde(default)]
    pub application: Option<ApplicationId>,
    #[serde(default)]
    pub resume_application: Option<ApplicationId>,
    pub status: ChatStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ChatRecord", into = "ChatRecord")]
pub struct Chat {
    pub id: ChatId,
    pub origin: Origin,
    pub status: ChatStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Chat {
    /// Version used when two copies of the same chat disagree
    pub fn version(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or(self.created_at)
    }
}

impl TryFrom<ChatRecord> for Chat {
    type Error = String;

    fn try_from(record: ChatRecord) -> Result<Self, Self::Error> {
        let origin = match (record.application, record.resume_application) {
            (Some(app), _) => Origin::JobApplication(app),
            (None, Some(app)) => Origin::ResumeApplication(app),
            (None, None) => return Err(format!("chat {} has no origin application", record.id)),
        };
        Ok(Chat {
            id: record.id,
            origin,
            status: record.status,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

impl From<Chat> for ChatRecord {
    fn from(chat: Chat) -> Self {
        let (application, resume_application) = match chat.origin {
            Origin::JobApplication(id) => (Some(id), None),
            Origin::ResumeApplication(id) => (None, Some(id)),
        };
        ChatRecord {
            id: chat.id,
            application,
            resume_application,
            status: chat.status,
            created_at: chat.created_at,
            updated_at: chat.updated_at,
        }
    }
}

/// Body for `POST /chats/`
#[derive(Debug, Clone, Serialize)]
pub struct NewChat {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application: Option<ApplicationId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_application: Option<ApplicationId>,
    pub status: ChatStatus,
}

impl NewChat {
    pub fn for_origin(origin: Origin) -> Self {
        match origin {
            Origin::JobApplication(id) => NewChat {
                application: Some(id),
                resume_application: None,
                status: ChatStatus::Active,
            },
            Origin::ResumeApplication(id) => NewChat {
                application: None,
                resume_application: Some(id),
                status: ChatStatus::Active,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    Text,
    Image,
    Document,
    Resume,
    CoverLetter,
    JobOffer,
    Notification,
}

/// Type-specific payload. File messages carry the upload, resume messages the resume id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_id: Option<ResumeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub chat: ChatId,
    pub sender: UserId,
    pub content: String,
    pub message_type: MessageType,
    #[serde(default)]
    pub metadata: Option<MessageMetadata>,
    #[serde(default)]
    pub read: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn key(&self) -> MessageKey {
        MessageKey {
            created_at: self.created_at,
            id: self.id,
        }
    }

    /// Whether this message counts towards `viewer`'s unread badge
    pub fn is_unread_for(&self, viewer: UserId) -> bool {
        !self.read && self.sender != viewer
    }

    /// Version used when two copies of the same message disagree
    pub fn version(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or(self.created_at)
    }
}

/// Total order of messages within a chat: `created_at`, then `id`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub created_at: DateTime<Utc>,
    pub id: MessageId,
}

impl Ord for MessageKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for MessageKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Body for `POST /messages/`
#[derive(Debug, Clone, Serialize)]
pub struct NewMessage {
    pub chat: ChatId,
    pub sender: UserId,
    pub content: String,
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
    pub read: bool,
}

/// Body for `PATCH /messages/{id}/`
#[derive(Debug, Clone, Default, Serialize)]
pub struct MessagePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinnedChat {
    #[serde(default)]
    pub id: Option<u64>,
    pub user: UserId,
    pub chat: ChatId,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

impl User {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
    pub id: CompanyId,
    pub user: UserId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub logo: Option<String>,
}

/// A company as embedded inside a job when the backend expands the relation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanySummary {
    pub id: CompanyId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub user: Option<UserId>,
}

/// Jobs reference their company either by raw id or as an embedded object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CompanyRef {
    Id(CompanyId),
    Embedded(CompanySummary),
}

impl CompanyRef {
    pub fn id(&self) -> CompanyId {
        match self {
            CompanyRef::Id(id) => *id,
            CompanyRef::Embedded(summary) => summary.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub company: CompanyRef,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resume {
    pub id: ResumeId,
    pub user: UserId,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub profession: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobApplication {
    pub id: ApplicationId,
    pub user: UserId,
    pub job: JobId,
    #[serde(default)]
    pub resume: Option<ResumeId>,
    #[serde(default)]
    pub cover_letter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeApplication {
    pub id: ApplicationId,
    pub resume: ResumeId,
    pub company: CompanyId,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationKind {
    Job,
    Resume,
}

/// One row of the conversation list as the UI shows it
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub id: ChatId,
    pub kind: ConversationKind,
    pub display_name: String,
    pub title: String,
    pub avatar_url: String,
    pub counterpart: Option<UserId>,
    pub last_message: String,
    pub last_message_at: DateTime<Utc>,
    pub unread_count: u32,
    pub status: ChatStatus,
    pub is_pinned: bool,
}

/// Local lifecycle of a message in the open conversation
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum DeliveryStatus {
    Pending,   // Optimistically shown, remote create outstanding
    Confirmed, // Persisted on the backend
    Failed,    // Remote create failed, entry removed from the list
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    /// Server id for confirmed entries, `temp-<uuid>` for pending ones
    pub local_id: String,
    pub message: Message,
    pub status: DeliveryStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayLabel {
    Today,
    Yesterday,
    Date(NaiveDate),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DayGroup {
    pub date: NaiveDate,
    pub label: DayLabel,
    pub entries: Vec<TimelineEntry>,
}
