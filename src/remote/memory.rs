// In-process backend used for offline demos and tests.
// Behaves like the REST backend: ids are assigned server-side, mark_all_read
// only touches messages from the other participant, pins are unique per
// (user, chat) and deleting a chat cascades to its messages.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{RemoteApi, RemoteError, RemoteResult};
use crate::models::{
    Chat, ChatId, ChatStatus, Company, CompanyRef, Job, JobApplication, Message, MessageId,
    MessagePatch, MessageType, NewChat, NewMessage, Origin, PinnedChat, Resume, ResumeApplication,
    User, UserId,
};

const WRITE_ENDPOINTS: &[&str] = &[
    "create_chat",
    "update_chat_status",
    "delete_chat",
    "mark_all_read",
    "create_message",
    "update_message",
    "delete_message",
    "delete_all_messages",
    "create_pinned_chat",
    "delete_pinned_chat",
];

#[derive(Default)]
struct World {
    chats: Vec<Chat>,
    messages: Vec<Message>,
    job_applications: Vec<JobApplication>,
    resume_applications: Vec<ResumeApplication>,
    jobs: Vec<Job>,
    resumes: Vec<Resume>,
    users: Vec<User>,
    companies: Vec<Company>,
    pins: Vec<PinnedChat>,
    next_id: u64,
    clock_ticks: i64,
}

impl World {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Deterministic server clock: one minute per created record
    fn now(&mut self) -> DateTime<Utc> {
        self.clock_ticks += 1;
        base_time() + ChronoDuration::minutes(self.clock_ticks)
    }
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

#[derive(Default)]
struct Faults {
    offline: bool,
    fail_next: HashMap<String, usize>,
    latency: Option<Duration>,
    latency_for: HashMap<String, Duration>,
    /// Reads that answer from the state at call time, delivered late
    stale_latency_for: HashMap<String, Duration>,
}

pub struct InMemoryRemote {
    world: Mutex<World>,
    faults: Mutex<Faults>,
    calls: Mutex<HashMap<String, usize>>,
    read_transitions: AtomicUsize,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self {
            world: Mutex::new(World::default()),
            faults: Mutex::new(Faults::default()),
            calls: Mutex::new(HashMap::new()),
            read_transitions: AtomicUsize::new(0),
        }
    }

    // ------------------- Seeding -------------------

    pub fn add_user(&self, first_name: &str, last_name: &str, avatar: Option<&str>) -> UserId {
        let mut world = self.world.lock().unwrap();
        let id = world.next_id();
        world.users.push(User {
            id,
            email: format!("{}@example.com", first_name.to_lowercase()),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            avatar: avatar.map(|a| a.to_string()),
            role: None,
        });
        id
    }

    pub fn add_company(&self, owner: UserId, name: &str) -> u64 {
        let mut world = self.world.lock().unwrap();
        let id = world.next_id();
        world.companies.push(Company {
            id,
            user: owner,
            name: name.to_string(),
            logo: None,
        });
        id
    }

    pub fn add_job(&self, company: CompanyRef, title: &str) -> u64 {
        let mut world = self.world.lock().unwrap();
        let id = world.next_id();
        world.jobs.push(Job {
            id,
            company,
            title: title.to_string(),
        });
        id
    }

    pub fn add_resume(&self, owner: UserId, profession: Option<&str>) -> u64 {
        let mut world = self.world.lock().unwrap();
        let id = world.next_id();
        world.resumes.push(Resume {
            id,
            user: owner,
            title: None,
            profession: profession.map(|p| p.to_string()),
        });
        id
    }

    pub fn add_job_application(&self, applicant: UserId, job: u64) -> u64 {
        let mut world = self.world.lock().unwrap();
        let id = world.next_id();
        world.job_applications.push(JobApplication {
            id,
            user: applicant,
            job,
            resume: None,
            cover_letter: None,
        });
        id
    }

    pub fn add_resume_application(&self, resume: u64, company: u64, message: Option<&str>) -> u64 {
        let mut world = self.world.lock().unwrap();
        let id = world.next_id();
        world.resume_applications.push(ResumeApplication {
            id,
            resume,
            company,
            message: message.map(|m| m.to_string()),
        });
        id
    }

    pub fn add_chat(&self, origin: Origin) -> ChatId {
        let mut world = self.world.lock().unwrap();
        let id = world.next_id();
        let created_at = world.now();
        world.chats.push(Chat {
            id,
            origin,
            status: ChatStatus::Active,
            created_at,
            updated_at: None,
        });
        id
    }

    pub fn add_message(&self, chat: ChatId, sender: UserId, content: &str, read: bool) -> MessageId {
        let mut world = self.world.lock().unwrap();
        let id = world.next_id();
        let created_at = world.now();
        world.messages.push(Message {
            id,
            chat,
            sender,
            content: content.to_string(),
            message_type: MessageType::Text,
            metadata: None,
            read,
            created_at,
            updated_at: None,
        });
        id
    }

    /// Pin on the server side only, bypassing any client checks
    pub fn add_pin(&self, user: UserId, chat: ChatId) {
        let mut world = self.world.lock().unwrap();
        let id = world.next_id();
        world.pins.push(PinnedChat {
            id: Some(id),
            user,
            chat,
            created_at: None,
        });
    }

    // ------------------- Inspection -------------------

    pub fn message(&self, id: MessageId) -> Option<Message> {
        let world = self.world.lock().unwrap();
        world.messages.iter().find(|m| m.id == id).cloned()
    }

    pub fn messages_in(&self, chat: ChatId) -> Vec<Message> {
        let world = self.world.lock().unwrap();
        world.messages.iter().filter(|m| m.chat == chat).cloned().collect()
    }

    pub fn chat(&self, id: ChatId) -> Option<Chat> {
        let world = self.world.lock().unwrap();
        world.chats.iter().find(|c| c.id == id).cloned()
    }

    pub fn pinned(&self, user: UserId) -> Vec<ChatId> {
        let world = self.world.lock().unwrap();
        world.pins.iter().filter(|p| p.user == user).map(|p| p.chat).collect()
    }

    /// Number of messages flipped from unread to read by mark_all_read
    pub fn read_transitions(&self) -> usize {
        self.read_transitions.load(Ordering::SeqCst)
    }

    pub fn calls(&self, endpoint: &str) -> usize {
        self.calls.lock().unwrap().get(endpoint).copied().unwrap_or(0)
    }

    pub fn write_calls(&self) -> usize {
        let calls = self.calls.lock().unwrap();
        WRITE_ENDPOINTS
            .iter()
            .map(|endpoint| calls.get(*endpoint).copied().unwrap_or(0))
            .sum()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    // ------------------- Fault injection -------------------

    pub fn set_offline(&self, offline: bool) {
        self.faults.lock().unwrap().offline = offline;
    }

    /// Fail the next `count` calls to `endpoint` with a transport error
    pub fn fail_next(&self, endpoint: &str, count: usize) {
        self.faults
            .lock()
            .unwrap()
            .fail_next
            .insert(endpoint.to_string(), count);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.faults.lock().unwrap().latency = latency;
    }

    pub fn set_latency_for(&self, endpoint: &str, latency: Duration) {
        self.faults
            .lock()
            .unwrap()
            .latency_for
            .insert(endpoint.to_string(), latency);
    }

    /// Delay `endpoint`'s response after its state was read, so the caller
    /// receives data that was current when the call was made
    pub fn set_stale_latency_for(&self, endpoint: &str, latency: Duration) {
        self.faults
            .lock()
            .unwrap()
            .stale_latency_for
            .insert(endpoint.to_string(), latency);
    }

    /// Hand a read's result back, late if a stale latency is configured
    async fn respond<T>(&self, endpoint: &str, value: T) -> RemoteResult<T> {
        let delay = self
            .faults
            .lock()
            .unwrap()
            .stale_latency_for
            .get(endpoint)
            .copied();
        if let Some(delay) = delay {
            debug!("Delivering {} response {:?} late", endpoint, delay);
            tokio::time::sleep(delay).await;
        }
        Ok(value)
    }

    /// Bookkeeping shared by every endpoint: count, delay, then maybe fail
    async fn enter(&self, endpoint: &str) -> RemoteResult<()> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(endpoint.to_string())
            .or_insert(0) += 1;

        let delay = {
            let faults = self.faults.lock().unwrap();
            faults.latency_for.get(endpoint).copied().or(faults.latency)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut faults = self.faults.lock().unwrap();
        if faults.offline {
            debug!("In-memory backend offline, rejecting {}", endpoint);
            return Err(RemoteError::Transport(format!("{}: network unreachable", endpoint)));
        }
        if let Some(remaining) = faults.fail_next.get_mut(endpoint) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RemoteError::Transport(format!("{}: connection reset", endpoint)));
            }
        }
        Ok(())
    }
}

fn not_found(what: &str, id: u64) -> RemoteError {
    RemoteError::NotFound(format!("{} {}", what, id))
}

#[async_trait]
impl RemoteApi for InMemoryRemote {
    async fn list_chats(&self) -> RemoteResult<Vec<Chat>> {
        self.enter("list_chats").await?;
        let chats = self.world.lock().unwrap().chats.clone();
        self.respond("list_chats", chats).await
    }

    async fn get_chat(&self, id: ChatId) -> RemoteResult<Chat> {
        self.enter("get_chat").await?;
        let chat = self.chat(id).ok_or_else(|| not_found("chat", id))?;
        self.respond("get_chat", chat).await
    }

    async fn create_chat(&self, chat: &NewChat) -> RemoteResult<Chat> {
        self.enter("create_chat").await?;
        let origin = match (chat.application, chat.resume_application) {
            (Some(app), _) => Origin::JobApplication(app),
            (None, Some(app)) => Origin::ResumeApplication(app),
            (None, None) => {
                return Err(RemoteError::Status {
                    endpoint: "/chats/".to_string(),
                    status: 400,
                    body: "application or resume_application is required".to_string(),
                })
            }
        };
        let mut world = self.world.lock().unwrap();
        let id = world.next_id();
        let created_at = world.now();
        let created = Chat {
            id,
            origin,
            status: chat.status,
            created_at,
            updated_at: None,
        };
        world.chats.push(created.clone());
        Ok(created)
    }

    async fn update_chat_status(&self, id: ChatId, status: ChatStatus) -> RemoteResult<Chat> {
        self.enter("update_chat_status").await?;
        let mut world = self.world.lock().unwrap();
        let now = world.now();
        let chat = world
            .chats
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| not_found("chat", id))?;
        chat.status = status;
        chat.updated_at = Some(now);
        Ok(chat.clone())
    }

    async fn delete_chat(&self, id: ChatId) -> RemoteResult<()> {
        self.enter("delete_chat").await?;
        let mut world = self.world.lock().unwrap();
        let before = world.chats.len();
        world.chats.retain(|c| c.id != id);
        if world.chats.len() == before {
            return Err(not_found("chat", id));
        }
        world.messages.retain(|m| m.chat != id);
        world.pins.retain(|p| p.chat != id);
        Ok(())
    }

    async fn mark_all_read(&self, chat: ChatId, user: UserId) -> RemoteResult<()> {
        self.enter("mark_all_read").await?;
        let mut world = self.world.lock().unwrap();
        let now = world.now();
        let mut flipped = 0;
        for message in world.messages.iter_mut() {
            if message.chat == chat && message.sender != user && !message.read {
                message.read = true;
                message.updated_at = Some(now);
                flipped += 1;
            }
        }
        self.read_transitions.fetch_add(flipped, Ordering::SeqCst);
        Ok(())
    }

    async fn unread_count(&self, user: UserId) -> RemoteResult<u32> {
        self.enter("unread_count").await?;
        let count = {
            let world = self.world.lock().unwrap();
            world.messages.iter().filter(|m| m.is_unread_for(user)).count() as u32
        };
        self.respond("unread_count", count).await
    }

    async fn list_messages(&self) -> RemoteResult<Vec<Message>> {
        self.enter("list_messages").await?;
        let messages = self.world.lock().unwrap().messages.clone();
        self.respond("list_messages", messages).await
    }

    async fn list_chat_messages(&self, chat: ChatId) -> RemoteResult<Vec<Message>> {
        self.enter("list_chat_messages").await?;
        let messages = self.messages_in(chat);
        self.respond("list_chat_messages", messages).await
    }

    async fn get_message(&self, id: MessageId) -> RemoteResult<Message> {
        self.enter("get_message").await?;
        let message = self.message(id).ok_or_else(|| not_found("message", id))?;
        self.respond("get_message", message).await
    }

    async fn create_message(&self, message: &NewMessage) -> RemoteResult<Message> {
        self.enter("create_message").await?;
        let mut world = self.world.lock().unwrap();
        if !world.chats.iter().any(|c| c.id == message.chat) {
            return Err(not_found("chat", message.chat));
        }
        let id = world.next_id();
        let created_at = world.now();
        let created = Message {
            id,
            chat: message.chat,
            sender: message.sender,
            content: message.content.clone(),
            message_type: message.message_type,
            metadata: message.metadata.clone(),
            read: message.read,
            created_at,
            updated_at: None,
        };
        world.messages.push(created.clone());
        Ok(created)
    }

    async fn update_message(&self, id: MessageId, patch: &MessagePatch) -> RemoteResult<Message> {
        self.enter("update_message").await?;
        let mut world = self.world.lock().unwrap();
        let now = world.now();
        let message = world
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| not_found("message", id))?;
        if let Some(content) = &patch.content {
            message.content = content.clone();
        }
        if let Some(metadata) = &patch.metadata {
            message.metadata = Some(metadata.clone());
        }
        message.updated_at = Some(now);
        Ok(message.clone())
    }

    async fn delete_message(&self, id: MessageId) -> RemoteResult<()> {
        self.enter("delete_message").await?;
        let mut world = self.world.lock().unwrap();
        let before = world.messages.len();
        world.messages.retain(|m| m.id != id);
        if world.messages.len() == before {
            return Err(not_found("message", id));
        }
        Ok(())
    }

    async fn delete_all_messages(&self, chat: ChatId) -> RemoteResult<()> {
        self.enter("delete_all_messages").await?;
        self.world.lock().unwrap().messages.retain(|m| m.chat != chat);
        Ok(())
    }

    async fn list_job_applications(&self) -> RemoteResult<Vec<JobApplication>> {
        self.enter("list_job_applications").await?;
        let job_applications = self.world.lock().unwrap().job_applications.clone();
        self.respond("list_job_applications", job_applications).await
    }

    async fn list_resume_applications(&self) -> RemoteResult<Vec<ResumeApplication>> {
        self.enter("list_resume_applications").await?;
        let resume_applications = self.world.lock().unwrap().resume_applications.clone();
        self.respond("list_resume_applications", resume_applications).await
    }

    async fn list_jobs(&self) -> RemoteResult<Vec<Job>> {
        self.enter("list_jobs").await?;
        let jobs = self.world.lock().unwrap().jobs.clone();
        self.respond("list_jobs", jobs).await
    }

    async fn list_resumes(&self) -> RemoteResult<Vec<Resume>> {
        self.enter("list_resumes").await?;
        let resumes = self.world.lock().unwrap().resumes.clone();
        self.respond("list_resumes", resumes).await
    }

    async fn list_users(&self) -> RemoteResult<Vec<User>> {
        self.enter("list_users").await?;
        let users = self.world.lock().unwrap().users.clone();
        self.respond("list_users", users).await
    }

    async fn get_user(&self, id: UserId) -> RemoteResult<User> {
        self.enter("get_user").await?;
        let user = self
            .world
            .lock()
            .unwrap()
            .users
            .iter()
            .find(|u| u.id == id)
            .cloned()
            .ok_or_else(|| not_found("user", id))?;
        self.respond("get_user", user).await
    }

    async fn list_companies(&self) -> RemoteResult<Vec<Company>> {
        self.enter("list_companies").await?;
        let companies = self.world.lock().unwrap().companies.clone();
        self.respond("list_companies", companies).await
    }

    async fn list_pinned_chats(&self, user: UserId) -> RemoteResult<Vec<PinnedChat>> {
        self.enter("list_pinned_chats").await?;
        let pins: Vec<PinnedChat> = {
            let world = self.world.lock().unwrap();
            world.pins.iter().filter(|p| p.user == user).cloned().collect()
        };
        self.respond("list_pinned_chats", pins).await
    }

    async fn create_pinned_chat(&self, user: UserId, chat: ChatId) -> RemoteResult<PinnedChat> {
        self.enter("create_pinned_chat").await?;
        let mut world = self.world.lock().unwrap();
        if let Some(existing) = world.pins.iter().find(|p| p.user == user && p.chat == chat) {
            return Ok(existing.clone());
        }
        let id = world.next_id();
        let created_at = world.now();
        let pin = PinnedChat {
            id: Some(id),
            user,
            chat,
            created_at: Some(created_at),
        };
        world.pins.push(pin.clone());
        Ok(pin)
    }

    async fn delete_pinned_chat(&self, user: UserId, chat: ChatId) -> RemoteResult<()> {
        self.enter("delete_pinned_chat").await?;
        self.world
            .lock()
            .unwrap()
            .pins
            .retain(|p| !(p.user == user && p.chat == chat));
        Ok(())
    }
}
