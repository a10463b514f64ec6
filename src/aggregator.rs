//! Conversation aggregation.
//!
//! Joins raw chats with their origin application, the job or resume behind
//! it and the company/user records on either side, and produces the sorted,
//! unread-annotated conversation list the UI shows. Chats whose origin
//! cannot be resolved, or that the viewer does not take part in, are
//! filtered out silently.

use futures::future::join_all;
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::models::{
    Chat, ChatId, ChatStatus, Company, CompanyId, CompanyRef, Conversation, ConversationKind, Job,
    JobApplication, Message, MessageKey, Origin, Resume, ResumeApplication, User, UserId, Viewer,
};
use crate::remote::RemoteResult;
use crate::services::ChatServices;

const FALLBACK_COMPANY_NAME: &str = "Company";
const FALLBACK_APPLICANT_NAME: &str = "Applicant";
const FALLBACK_STUDENT_NAME: &str = "Student";
const FALLBACK_RESUME_TITLE: &str = "Resume";

/// Generated avatar for participants without an uploaded one
pub fn fallback_avatar(name: &str) -> String {
    let initial: String = name.chars().take(1).collect();
    format!(
        "https://ui-avatars.com/api/?name={}&background=10B981&color=fff",
        initial
    )
}

/// Lookup tables for every record a chat can reference
#[derive(Debug, Default, Clone)]
pub struct Directory {
    job_applications: HashMap<u64, JobApplication>,
    resume_applications: HashMap<u64, ResumeApplication>,
    jobs: HashMap<u64, Job>,
    resumes: HashMap<u64, Resume>,
    users: HashMap<UserId, User>,
    companies: HashMap<CompanyId, Company>,
}

impl Directory {
    pub fn new(
        job_applications: Vec<JobApplication>,
        resume_applications: Vec<ResumeApplication>,
        jobs: Vec<Job>,
        resumes: Vec<Resume>,
        users: Vec<User>,
        companies: Vec<Company>,
    ) -> Self {
        Self {
            job_applications: job_applications.into_iter().map(|a| (a.id, a)).collect(),
            resume_applications: resume_applications.into_iter().map(|a| (a.id, a)).collect(),
            jobs: jobs.into_iter().map(|j| (j.id, j)).collect(),
            resumes: resumes.into_iter().map(|r| (r.id, r)).collect(),
            users: users.into_iter().map(|u| (u.id, u)).collect(),
            companies: companies.into_iter().map(|c| (c.id, c)).collect(),
        }
    }

    /// The company profile a company-role user operates under
    pub fn company_owned_by(&self, user: UserId) -> Option<&Company> {
        // Lowest id wins if a user somehow owns several
        self.companies
            .values()
            .filter(|c| c.user == user)
            .min_by_key(|c| c.id)
    }

    pub fn user(&self, id: UserId) -> Option<&User> {
        self.users.get(&id)
    }
}

/// A chat joined with everything needed to display it
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedChat {
    pub chat: Chat,
    pub kind: ConversationKind,
    pub title: String,
    pub display_name: String,
    pub avatar_url: String,
    pub counterpart: Option<UserId>,
    /// Shown as the preview when the chat has no messages yet
    pub fallback_preview: Option<String>,
}

struct CompanyIdentity {
    name: String,
    avatar_url: String,
    user: Option<UserId>,
}

fn company_identity(dir: &Directory, company_ref: &CompanyRef) -> CompanyIdentity {
    let company_id = company_ref.id();
    let company = dir.companies.get(&company_id);
    let embedded = match company_ref {
        CompanyRef::Embedded(summary) => Some(summary),
        CompanyRef::Id(_) => None,
    };

    let name = company
        .map(|c| c.name.clone())
        .filter(|n| !n.is_empty())
        .or_else(|| embedded.and_then(|s| s.name.clone()))
        .unwrap_or_else(|| FALLBACK_COMPANY_NAME.to_string());

    // Without a company record the backend's id doubles as the owner's user id
    let owner = company
        .map(|c| c.user)
        .or_else(|| embedded.and_then(|s| s.user))
        .unwrap_or(company_id);
    let owner_user = dir.user(owner);

    let avatar_url = owner_user
        .and_then(|u| u.avatar.clone())
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| fallback_avatar(&name));

    CompanyIdentity {
        name,
        avatar_url,
        user: owner_user.map(|u| u.id),
    }
}

fn person_identity(dir: &Directory, user: UserId, fallback: &str) -> (String, String, Option<UserId>) {
    match dir.user(user) {
        Some(u) => {
            let name = match u.full_name() {
                n if n.is_empty() => fallback.to_string(),
                n => n,
            };
            let avatar = u
                .avatar
                .clone()
                .filter(|a| !a.is_empty())
                .unwrap_or_else(|| fallback_avatar(&name));
            (name, avatar, Some(u.id))
        }
        None => (fallback.to_string(), fallback_avatar(fallback), None),
    }
}

fn job_chat_is_relevant(viewer: &Viewer, dir: &Directory, application: &JobApplication, job: &Job) -> bool {
    match viewer {
        Viewer::Student(user) => application.user == *user,
        Viewer::Company(user) => match dir.company_owned_by(*user) {
            Some(company) => job.company.id() == company.id,
            // Older accounts reference the owning user directly
            None => job.company.id() == *user,
        },
    }
}

fn resume_chat_is_relevant(
    viewer: &Viewer,
    dir: &Directory,
    application: &ResumeApplication,
    resume: &Resume,
) -> bool {
    match viewer {
        Viewer::Student(user) => resume.user == *user,
        Viewer::Company(user) => match dir.company_owned_by(*user) {
            Some(company) => application.company == company.id,
            None => application.company == *user,
        },
    }
}

/// Resolve a chat from the viewer's perspective. `None` means the chat is
/// dangling or does not involve the viewer.
pub fn resolve(viewer: &Viewer, dir: &Directory, chat: &Chat) -> Option<ResolvedChat> {
    match chat.origin {
        Origin::JobApplication(app_id) => {
            let application = dir.job_applications.get(&app_id)?;
            let job = dir.jobs.get(&application.job)?;
            if !job_chat_is_relevant(viewer, dir, application, job) {
                return None;
            }

            let (display_name, avatar_url, counterpart) = match viewer {
                Viewer::Student(_) => {
                    let company = company_identity(dir, &job.company);
                    (company.name, company.avatar_url, company.user)
                }
                Viewer::Company(_) => person_identity(dir, application.user, FALLBACK_APPLICANT_NAME),
            };

            Some(ResolvedChat {
                chat: chat.clone(),
                kind: ConversationKind::Job,
                title: job.title.clone(),
                display_name,
                avatar_url,
                counterpart,
                fallback_preview: None,
            })
        }
        Origin::ResumeApplication(app_id) => {
            let application = dir.resume_applications.get(&app_id)?;
            let resume = dir.resumes.get(&application.resume)?;
            if !resume_chat_is_relevant(viewer, dir, application, resume) {
                return None;
            }

            let (display_name, avatar_url, counterpart) = match viewer {
                Viewer::Student(_) => {
                    let company = company_identity(dir, &CompanyRef::Id(application.company));
                    (company.name, company.avatar_url, company.user)
                }
                Viewer::Company(_) => person_identity(dir, resume.user, FALLBACK_STUDENT_NAME),
            };

            let title = resume
                .profession
                .clone()
                .or_else(|| resume.title.clone())
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| FALLBACK_RESUME_TITLE.to_string());

            Some(ResolvedChat {
                chat: chat.clone(),
                kind: ConversationKind::Resume,
                title,
                display_name,
                avatar_url,
                counterpart,
                fallback_preview: application.message.clone(),
            })
        }
    }
}

/// Count of messages `viewer` has not read yet. Messages at or below
/// `read_up_to` were covered by a successful mark-read and never count.
pub fn unread_count(messages: &[Message], viewer: UserId, read_up_to: Option<MessageKey>) -> u32 {
    messages
        .iter()
        .filter(|m| m.is_unread_for(viewer))
        .filter(|m| read_up_to.map(|floor| m.key() > floor).unwrap_or(true))
        .count() as u32
}

pub struct ConversationContext<'a> {
    pub viewer: UserId,
    pub open_chat: Option<ChatId>,
    pub pinned: &'a HashSet<ChatId>,
    pub read_watermarks: &'a HashMap<ChatId, MessageKey>,
}

pub fn build_conversation(resolved: ResolvedChat, messages: &[Message], ctx: &ConversationContext<'_>) -> Conversation {
    let id = resolved.chat.id;
    let last = messages.iter().max_by_key(|m| m.key());

    // The open conversation is being read; counting it would make the badge flicker
    let unread = if ctx.open_chat == Some(id) {
        0
    } else {
        unread_count(messages, ctx.viewer, ctx.read_watermarks.get(&id).copied())
    };

    let last_message = last
        .map(|m| m.content.clone())
        .or(resolved.fallback_preview)
        .unwrap_or_default();

    Conversation {
        id,
        kind: resolved.kind,
        display_name: resolved.display_name,
        title: resolved.title,
        avatar_url: resolved.avatar_url,
        counterpart: resolved.counterpart,
        last_message,
        last_message_at: last.map(|m| m.created_at).unwrap_or(resolved.chat.created_at),
        unread_count: unread,
        status: resolved.chat.status,
        is_pinned: ctx.pinned.contains(&id),
    }
}

/// Pinned first, then most recent activity first
pub fn sort_conversations(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| {
        b.is_pinned
            .cmp(&a.is_pinned)
            .then_with(|| b.last_message_at.cmp(&a.last_message_at))
            .then_with(|| b.id.cmp(&a.id))
    });
}

/// Re-apply a pin set to an already built list
pub fn apply_pins(conversations: &mut [Conversation], pinned: &HashSet<ChatId>) {
    for conversation in conversations.iter_mut() {
        conversation.is_pinned = pinned.contains(&conversation.id);
    }
    sort_conversations(conversations);
}

pub fn total_unread(conversations: &[Conversation]) -> u32 {
    conversations.iter().map(|c| c.unread_count).sum()
}

/// Case-insensitive match on the counterpart's name or the job/resume title
pub fn filter_conversations<'a>(conversations: &'a [Conversation], query: &str) -> Vec<&'a Conversation> {
    let needle = query.trim().to_lowercase();
    conversations
        .iter()
        .filter(|c| {
            needle.is_empty()
                || c.display_name.to_lowercase().contains(&needle)
                || c.title.to_lowercase().contains(&needle)
        })
        .collect()
}

/// Everything one aggregation pass fetched: the relevant chats, resolved,
/// with their messages. Building the list from it is synchronous so it can
/// be redone whenever local state (open chat, pins, read marks) changes.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    chats: Vec<(ResolvedChat, Vec<Message>)>,
}

impl Snapshot {
    pub fn new(chats: Vec<(ResolvedChat, Vec<Message>)>) -> Self {
        Self { chats }
    }

    pub fn len(&self) -> usize {
        self.chats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chats.is_empty()
    }

    pub fn contains(&self, chat: ChatId) -> bool {
        self.chats.iter().any(|(r, _)| r.chat.id == chat)
    }

    pub fn status_of(&self, chat: ChatId) -> Option<ChatStatus> {
        self.chats
            .iter()
            .find(|(r, _)| r.chat.id == chat)
            .map(|(r, _)| r.chat.status)
    }

    pub fn build(&self, ctx: &ConversationContext<'_>) -> Vec<Conversation> {
        let mut conversations: Vec<Conversation> = self
            .chats
            .iter()
            .map(|(resolved, messages)| build_conversation(resolved.clone(), messages, ctx))
            .collect();
        sort_conversations(&mut conversations);
        conversations
    }

    pub fn replace_messages(&mut self, chat: ChatId, messages: Vec<Message>) {
        if let Some((_, existing)) = self.chats.iter_mut().find(|(r, _)| r.chat.id == chat) {
            *existing = messages;
        }
    }

    /// Add a message we just sent so the preview updates before the next poll
    pub fn record_message(&mut self, message: Message) {
        if let Some((_, existing)) = self.chats.iter_mut().find(|(r, _)| r.chat.id == message.chat) {
            if !existing.iter().any(|m| m.id == message.id) {
                existing.push(message);
            }
        }
    }

    /// Adopt a chat record returned by a write, unless we already hold a newer one
    pub fn update_chat(&mut self, chat: Chat) {
        if let Some((resolved, _)) = self.chats.iter_mut().find(|(r, _)| r.chat.id == chat.id) {
            if chat.version() >= resolved.chat.version() {
                resolved.chat = chat;
            }
        }
    }

    /// Keep the newer copy of every chat both snapshots hold
    pub fn keep_newer_chats(&mut self, previous: &Snapshot) {
        for (resolved, _) in self.chats.iter_mut() {
            let local = previous
                .chats
                .iter()
                .find(|(r, _)| r.chat.id == resolved.chat.id)
                .map(|(r, _)| &r.chat);
            if let Some(kept) = local.filter(|kept| kept.version() > resolved.chat.version()) {
                debug!("Keeping newer local copy of chat {}", kept.id);
                resolved.chat = kept.clone();
            }
        }
    }

    pub fn remove(&mut self, chat: ChatId) {
        self.chats.retain(|(r, _)| r.chat.id != chat);
    }
}

pub struct Aggregator {
    services: Arc<ChatServices>,
    viewer: Viewer,
}

impl Aggregator {
    pub fn new(services: Arc<ChatServices>, viewer: Viewer) -> Self {
        Self { services, viewer }
    }

    pub fn viewer(&self) -> Viewer {
        self.viewer
    }

    pub async fn load_directory(&self) -> RemoteResult<Directory> {
        let (job_applications, resume_applications, jobs, resumes, users, companies) = tokio::try_join!(
            self.services.job_applications(),
            self.services.resume_applications(),
            self.services.jobs(),
            self.services.resumes(),
            self.services.users(),
            self.services.companies(),
        )?;
        Ok(Directory::new(
            job_applications,
            resume_applications,
            jobs,
            resumes,
            users,
            companies,
        ))
    }

    /// Fetch and resolve. Message lists are fetched only for chats that
    /// survive resolution and relevance filtering.
    pub async fn snapshot(&self) -> RemoteResult<Snapshot> {
        let chats = self.services.chats().await?;
        let directory = self.load_directory().await?;

        let resolved: Vec<ResolvedChat> = chats
            .iter()
            .filter_map(|chat| {
                let resolved = resolve(&self.viewer, &directory, chat);
                if resolved.is_none() {
                    debug!("Chat {} filtered out for viewer {}", chat.id, self.viewer.user_id());
                }
                resolved
            })
            .collect();

        let fetches = resolved
            .iter()
            .map(|r| self.services.chat_messages(r.chat.id));
        let message_lists = join_all(fetches).await;

        let mut entries = Vec::with_capacity(resolved.len());
        for (resolved, messages) in resolved.into_iter().zip(message_lists) {
            match messages {
                Ok(messages) => entries.push((resolved, messages)),
                Err(e) => {
                    warn!("Failed to fetch messages for chat {}: {}", resolved.chat.id, e);
                    return Err(e);
                }
            }
        }

        debug!("Resolved {} of {} chats", entries.len(), chats.len());
        Ok(Snapshot::new(entries))
    }

    /// One full pass: fetch, then build the sorted list
    pub async fn aggregate(
        &self,
        open_chat: Option<ChatId>,
        pinned: &HashSet<ChatId>,
        read_watermarks: &HashMap<ChatId, MessageKey>,
    ) -> RemoteResult<Vec<Conversation>> {
        let snapshot = self.snapshot().await?;
        let ctx = ConversationContext {
            viewer: self.viewer.user_id(),
            open_chat,
            pinned,
            read_watermarks,
        };
        Ok(snapshot.build(&ctx))
    }
}
