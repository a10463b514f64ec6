//! The chat synchronization engine.
//!
//! `ChatEngine` owns one viewer's view of the backend: the conversation list
//! with unread badges, the open conversation's messages, pins and read
//! state. The poll loop drives periodic refreshes; user actions go through
//! the methods here and are reflected locally as soon as the backend
//! confirms them.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};

use crate::aggregator::{filter_conversations, total_unread, Aggregator, ConversationContext, Snapshot};
use crate::cache::ResponseCache;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::models::{
    Chat, ChatId, ChatStatus, Conversation, DayGroup, DeliveryStatus, Message, MessageMetadata,
    MessageType, NewChat, NewMessage, Origin, ResumeId, TimelineEntry, Viewer,
};
use crate::pins::{PinChange, PinManager, PinStore, DEFAULT_MAX_PINS};
use crate::poll::{PollLoop, PollState, PollTarget, DEFAULT_POLL_INTERVAL};
use crate::read_state::{MarkRead, ReadStateReconciler};
use crate::remote::RemoteApi;
use crate::services::{ChatServices, RetryPolicy};
use crate::timeline::{group_by_day, Timeline};

const IMAGE_TYPES: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];
const DOCUMENT_TYPES: &[&str] = &[
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "text/plain",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
];

/// Map an upload's MIME type to the message type it is sent as
pub fn classify_attachment(mime_type: &str) -> Result<MessageType> {
    let mime = mime_type.trim().to_ascii_lowercase();
    if IMAGE_TYPES.contains(&mime.as_str()) {
        Ok(MessageType::Image)
    } else if DOCUMENT_TYPES.contains(&mime.as_str()) {
        Ok(MessageType::Document)
    } else {
        Err(SyncError::UnsupportedAttachment(mime_type.to_string()))
    }
}

/// What the viewer wants to send into the open conversation
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Text(String),
    /// An already uploaded file
    Attachment {
        file_url: String,
        file_name: String,
        mime_type: String,
        size: u64,
    },
    Resume {
        resume: ResumeId,
        note: Option<String>,
    },
}

impl Outgoing {
    fn into_parts(self) -> Result<(String, MessageType, Option<MessageMetadata>)> {
        match self {
            Outgoing::Text(text) => {
                let text = text.trim().to_string();
                if text.is_empty() {
                    return Err(SyncError::EmptyMessage);
                }
                Ok((text, MessageType::Text, None))
            }
            Outgoing::Attachment {
                file_url,
                file_name,
                mime_type,
                size,
            } => {
                let message_type = classify_attachment(&mime_type)?;
                let metadata = MessageMetadata {
                    file_url: Some(file_url),
                    file_name: Some(file_name.clone()),
                    file_type: Some(mime_type),
                    file_size: Some(size),
                    resume_id: None,
                };
                Ok((file_name, message_type, Some(metadata)))
            }
            Outgoing::Resume { resume, note } => {
                let content = note
                    .map(|n| n.trim().to_string())
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| "Shared a resume".to_string());
                let metadata = MessageMetadata {
                    resume_id: Some(resume),
                    ..MessageMetadata::default()
                };
                Ok((content, MessageType::Resume, Some(metadata)))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub cache_ttl: Duration,
    pub retry: RetryPolicy,
    pub max_pins: usize,
    pub poll_interval: Duration,
    pub auto_mark_read: bool,
    pub pin_store: Option<PinStore>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            cache_ttl: crate::cache::DEFAULT_TTL,
            retry: RetryPolicy::default(),
            max_pins: DEFAULT_MAX_PINS,
            poll_interval: DEFAULT_POLL_INTERVAL,
            auto_mark_read: true,
            pin_store: None,
        }
    }
}

impl EngineOptions {
    pub fn from_config(config: &SyncConfig, viewer: Viewer) -> anyhow::Result<Self> {
        let state_dir = config.state_dir()?;
        Ok(Self {
            cache_ttl: config.cache_ttl(),
            retry: RetryPolicy {
                attempts: config.write_attempts,
                base_delay: config.retry_base_delay(),
            },
            max_pins: config.max_pins,
            poll_interval: config.poll_interval(),
            auto_mark_read: config.auto_mark_read,
            pin_store: Some(PinStore::in_dir(&state_dir, viewer.user_id())),
        })
    }
}

/// Clears a busy flag when dropped, including on early return or cancellation
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ChatEngine {
    viewer: Viewer,
    services: Arc<ChatServices>,
    aggregator: Aggregator,
    read_state: ReadStateReconciler,
    pins: PinManager,
    /// Lock order: `snapshot` before `timeline`
    snapshot: Mutex<Option<Snapshot>>,
    timeline: Mutex<Timeline>,
    events: EventBus,
    poll: PollLoop,
    auto_mark_read: bool,
    alive: AtomicBool,
    refreshing: AtomicBool,
    /// Bumped under the `snapshot` lock each time a local write is applied
    /// to it; a conversation refresh that started earlier is dropped
    local_writes: AtomicU64,
}

/// Lets the poll loop drive the engine without keeping it alive
struct EngineTarget(Weak<ChatEngine>);

#[async_trait]
impl PollTarget for EngineTarget {
    async fn poll_cycle(&self) {
        if let Some(engine) = self.0.upgrade() {
            engine.poll_cycle().await;
        }
    }
}

impl ChatEngine {
    pub fn new(remote: Arc<dyn RemoteApi>, viewer: Viewer, options: EngineOptions) -> Result<Arc<Self>> {
        let cache = Arc::new(ResponseCache::new(options.cache_ttl));
        let services = Arc::new(ChatServices::new(remote, cache, options.retry));
        let pins = PinManager::new(
            services.clone(),
            viewer.user_id(),
            options.max_pins,
            options.pin_store,
        )?;

        info!(
            "Chat engine ready for {} {}",
            viewer.role_name(),
            viewer.user_id()
        );
        Ok(Arc::new(Self {
            viewer,
            aggregator: Aggregator::new(services.clone(), viewer),
            read_state: ReadStateReconciler::new(services.clone(), viewer.user_id()),
            pins,
            services,
            snapshot: Mutex::new(None),
            timeline: Mutex::new(Timeline::new()),
            events: EventBus::new(),
            poll: PollLoop::new(options.poll_interval),
            auto_mark_read: options.auto_mark_read,
            alive: AtomicBool::new(true),
            refreshing: AtomicBool::new(false),
            local_writes: AtomicU64::new(0),
        }))
    }

    pub fn viewer(&self) -> Viewer {
        self.viewer
    }

    pub fn services(&self) -> &Arc<ChatServices> {
        &self.services
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    // ------------------- Lifecycle -------------------

    /// Begin polling; the first cycle runs right away
    pub fn start(self: &Arc<Self>) {
        if !self.is_alive() {
            warn!("Not starting polling on a shut down engine");
            return;
        }
        self.poll.start(Arc::new(EngineTarget(Arc::downgrade(self))));
    }

    pub fn poll_state(&self) -> PollState {
        self.poll.state()
    }

    pub fn set_foreground(&self, visible: bool) {
        self.poll.set_foreground(visible);
    }

    /// Stop polling and drop whatever is still in flight
    pub fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.poll.stop();
        info!("Chat engine for user {} shut down", self.viewer.user_id());
    }

    /// Drop cached responses, e.g. after switching accounts
    pub fn clear_cache(&self) {
        self.services.cache().clear();
    }

    async fn poll_cycle(&self) {
        if !self.is_alive() {
            return;
        }
        if let Err(e) = self.refresh_conversations().await {
            warn!("Conversation refresh failed: {}", e);
        }
        if let Err(e) = self.refresh_messages().await {
            warn!("Message refresh failed: {}", e);
        }
    }

    // ------------------- Observation -------------------

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn watch_conversations(&self) -> watch::Receiver<Arc<Vec<Conversation>>> {
        self.events.watch_conversations()
    }

    pub fn watch_total_unread(&self) -> watch::Receiver<u32> {
        self.events.watch_total_unread()
    }

    pub fn watch_messages(&self) -> watch::Receiver<Arc<Vec<TimelineEntry>>> {
        self.events.watch_timeline()
    }

    pub fn conversations(&self) -> Arc<Vec<Conversation>> {
        self.events.conversations()
    }

    pub fn conversation(&self, chat: ChatId) -> Option<Conversation> {
        self.conversations().iter().find(|c| c.id == chat).cloned()
    }

    pub fn total_unread(&self) -> u32 {
        self.events.total_unread()
    }

    pub fn search(&self, query: &str) -> Vec<Conversation> {
        let conversations = self.conversations();
        filter_conversations(&conversations, query)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn selected(&self) -> Option<ChatId> {
        self.timeline.lock().unwrap().chat()
    }

    pub fn messages(&self) -> Vec<TimelineEntry> {
        self.timeline.lock().unwrap().entries().to_vec()
    }

    pub fn day_groups(&self, today: NaiveDate) -> Vec<DayGroup> {
        group_by_day(self.timeline.lock().unwrap().entries(), today)
    }

    /// True once after each selection change
    pub fn take_initial_scroll(&self) -> bool {
        self.timeline.lock().unwrap().take_initial_scroll()
    }

    pub fn pinned(&self) -> Vec<ChatId> {
        self.pins.pinned()
    }

    /// Server-side unread total, for badges shown outside the chat view
    pub async fn remote_unread_count(&self) -> Result<u32> {
        Ok(self.services.unread_count(self.viewer.user_id()).await?)
    }

    // ------------------- Publishing -------------------

    /// Rebuild the list from the last snapshot with the current open chat,
    /// pins and read marks, and publish it. Callers may hold no other lock.
    fn rebuild(&self) {
        let snapshot = self.snapshot.lock().unwrap();
        self.publish_from(snapshot.as_ref());
    }

    fn publish_from(&self, snapshot: Option<&Snapshot>) {
        let snapshot = match snapshot {
            Some(snapshot) => snapshot,
            None => return,
        };
        if !self.is_alive() {
            return;
        }
        let open_chat = self.timeline.lock().unwrap().chat();
        let pinned = self.pins.pinned_set();
        let watermarks = self.read_state.watermarks();
        let ctx = ConversationContext {
            viewer: self.viewer.user_id(),
            open_chat,
            pinned: &pinned,
            read_watermarks: &watermarks,
        };
        let conversations = snapshot.build(&ctx);
        let total = total_unread(&conversations);
        self.events.publish_conversations(conversations);
        self.events.publish_total_unread(total);
    }

    fn update_snapshot<F>(&self, update: F)
    where
        F: FnOnce(&mut Snapshot),
    {
        let mut snapshot = self.snapshot.lock().unwrap();
        if let Some(snapshot) = snapshot.as_mut() {
            update(snapshot);
        }
        self.publish_from(snapshot.as_ref());
    }

    /// Like `update_snapshot`, for changes the backend has confirmed but a
    /// listing already in flight may not include yet
    fn apply_local_write<F>(&self, update: F)
    where
        F: FnOnce(&mut Snapshot),
    {
        let mut snapshot = self.snapshot.lock().unwrap();
        self.local_writes.fetch_add(1, Ordering::SeqCst);
        if let Some(snapshot) = snapshot.as_mut() {
            update(snapshot);
        }
        self.publish_from(snapshot.as_ref());
    }

    fn publish_timeline(&self) {
        if !self.is_alive() {
            return;
        }
        let (chat, entries) = {
            let timeline = self.timeline.lock().unwrap();
            (timeline.chat(), timeline.entries().to_vec())
        };
        self.events.publish_timeline(chat, entries);
    }

    // ------------------- Refresh -------------------

    /// One aggregation pass. Returns `Ok(false)` if skipped because another
    /// pass is running or the engine is shut down, or if a local write was
    /// applied while fetching; another pass is then requested. On failure the
    /// last good list stays published.
    pub async fn refresh_conversations(&self) -> Result<bool> {
        if !self.is_alive() {
            return Ok(false);
        }
        if self.refreshing.swap(true, Ordering::SeqCst) {
            debug!("Conversation refresh already in flight, skipping");
            return Ok(false);
        }
        let _busy = BusyGuard(&self.refreshing);
        let writes_before = self.local_writes.load(Ordering::SeqCst);

        self.services.expire_volatile();
        if let Err(e) = self.pins.sync_from_remote().await {
            debug!("Using local pins this cycle: {}", e);
        }

        let mut fresh = self.aggregator.snapshot().await?;
        if !self.is_alive() {
            debug!("Engine shut down during refresh, discarding result");
            return Ok(false);
        }

        let mut snapshot = self.snapshot.lock().unwrap();
        if self.local_writes.load(Ordering::SeqCst) != writes_before {
            debug!("Local write landed during refresh, discarding the older listing");
            drop(snapshot);
            self.poll.request_refresh();
            return Ok(false);
        }
        if let Some(previous) = snapshot.as_ref() {
            fresh.keep_newer_chats(previous);
        }
        *snapshot = Some(fresh);
        self.publish_from(snapshot.as_ref());
        Ok(true)
    }

    /// Refresh the open conversation's messages. Returns `Ok(false)` when
    /// nothing is open or the result arrived for a previous selection.
    pub async fn refresh_messages(&self) -> Result<bool> {
        let (chat, generation) = {
            let timeline = self.timeline.lock().unwrap();
            match timeline.chat() {
                Some(chat) => (chat, timeline.generation()),
                None => return Ok(false),
            }
        };

        let mut fetched = self.services.chat_messages_fresh(chat).await?;
        if !self.is_alive() {
            return Ok(false);
        }
        self.read_state.reconcile(chat, &mut fetched);

        let (confirmed, needs_mark) = {
            let mut timeline = self.timeline.lock().unwrap();
            if !timeline.merge_fetched(chat, generation, fetched) {
                return Ok(false);
            }
            let confirmed: Vec<Message> = timeline
                .entries()
                .iter()
                .filter(|e| e.status == DeliveryStatus::Confirmed)
                .map(|e| e.message.clone())
                .collect();
            (confirmed, timeline.has_unread_for(self.viewer.user_id()))
        };

        self.publish_timeline();
        self.update_snapshot(|snapshot| snapshot.replace_messages(chat, confirmed));

        if needs_mark && self.auto_mark_read {
            debug!("Open chat {} has unread messages, marking read", chat);
            if let Err(e) = self.mark_read(chat).await {
                warn!("Automatic mark-read of chat {} failed: {}", chat, e);
            }
        }
        Ok(true)
    }

    // ------------------- Actions -------------------

    /// Open `chat` (or close the open one with `None`). Results still in
    /// flight for the previous selection are dropped when they arrive.
    pub async fn select_conversation(&self, chat: Option<ChatId>) -> Result<()> {
        if let Some(chat) = chat {
            if self.conversation(chat).is_none() {
                return Err(SyncError::UnknownConversation(chat));
            }
        }

        {
            let snapshot = self.snapshot.lock().unwrap();
            self.timeline.lock().unwrap().select(chat);
            self.publish_from(snapshot.as_ref());
        }
        self.publish_timeline();
        self.events.emit(SyncEvent::ConversationSelected { chat });
        info!("Selected conversation {:?}", chat);

        if chat.is_some() {
            self.refresh_messages().await?;
        }
        Ok(())
    }

    /// Send into the open conversation. The message shows up immediately as
    /// pending and is removed again if the backend rejects it.
    pub async fn send_message(&self, outgoing: Outgoing) -> Result<Message> {
        let chat = self.selected().ok_or(SyncError::NoConversationSelected)?;
        let conversation = self
            .conversation(chat)
            .ok_or(SyncError::UnknownConversation(chat))?;
        if !conversation.status.accepts_messages() {
            return Err(SyncError::ChatNotWritable {
                chat,
                status: conversation.status,
            });
        }

        let (content, message_type, metadata) = outgoing.into_parts()?;
        let request = NewMessage {
            chat,
            sender: self.viewer.user_id(),
            content: content.clone(),
            message_type,
            metadata: metadata.clone(),
            read: false,
        };
        let draft = Message {
            id: 0,
            chat,
            sender: self.viewer.user_id(),
            content,
            message_type,
            metadata,
            read: false,
            created_at: Utc::now(),
            updated_at: None,
        };

        let local_id = self.timeline.lock().unwrap().push_pending(draft);
        self.publish_timeline();

        match self.services.create_message(&request).await {
            Ok(saved) => {
                self.timeline.lock().unwrap().confirm(&local_id, saved.clone());
                self.publish_timeline();
                let recorded = saved.clone();
                self.apply_local_write(|snapshot| snapshot.record_message(recorded));
                debug!("Message {} sent to chat {}", saved.id, chat);
                Ok(saved)
            }
            Err(e) => {
                warn!("Send to chat {} failed, rolling back {}: {}", chat, local_id, e);
                self.timeline.lock().unwrap().reject(&local_id);
                self.publish_timeline();
                self.events.emit(SyncEvent::SendFailed { chat, local_id });
                Err(e.into())
            }
        }
    }

    /// Mark every counterpart message in `chat` read
    pub async fn mark_read(&self, chat: ChatId) -> Result<MarkRead> {
        let outcome = self.read_state.mark_all_read(chat).await?;
        if let MarkRead::Marked { through } = outcome {
            {
                let mut timeline = self.timeline.lock().unwrap();
                if timeline.chat() == Some(chat) {
                    timeline.mark_read_through(self.viewer.user_id(), through);
                }
            }
            self.publish_timeline();
            self.rebuild();
        }
        Ok(outcome)
    }

    pub async fn toggle_pin(&self, chat: ChatId) -> Result<PinChange> {
        let change = self.pins.toggle_pin(chat).await?;
        self.rebuild();
        self.events.emit(SyncEvent::PinsChanged);
        Ok(change)
    }

    pub async fn update_status(&self, chat: ChatId, status: ChatStatus) -> Result<Chat> {
        let current = self
            .conversation(chat)
            .map(|c| c.status)
            .ok_or(SyncError::UnknownConversation(chat))?;
        if !current.can_transition_to(status) {
            return Err(SyncError::InvalidStatusTransition {
                chat,
                from: current,
                to: status,
            });
        }

        let updated = self.services.update_chat_status(chat, status).await?;
        let recorded = updated.clone();
        self.apply_local_write(|snapshot| snapshot.update_chat(recorded));
        info!("Chat {} is now {}", chat, updated.status);
        Ok(updated)
    }

    /// Delete the conversation and all of its messages
    pub async fn delete_conversation(&self, chat: ChatId) -> Result<()> {
        self.services.delete_chat(chat).await?;
        self.pins.forget(chat);
        self.read_state.forget(chat);

        let was_open = {
            let mut timeline = self.timeline.lock().unwrap();
            let open = timeline.chat() == Some(chat);
            if open {
                timeline.select(None);
            }
            open
        };
        if was_open {
            self.publish_timeline();
            self.events.emit(SyncEvent::ConversationSelected { chat: None });
        }
        self.apply_local_write(|snapshot| snapshot.remove(chat));
        info!("Deleted chat {}", chat);
        Ok(())
    }

    /// Delete every message but keep the conversation
    pub async fn clear_conversation(&self, chat: ChatId) -> Result<()> {
        self.services.delete_all_messages(chat).await?;
        self.read_state.forget(chat);
        {
            let mut timeline = self.timeline.lock().unwrap();
            if timeline.chat() == Some(chat) {
                timeline.clear_confirmed();
            }
        }
        self.publish_timeline();
        self.apply_local_write(|snapshot| snapshot.replace_messages(chat, Vec::new()));
        info!("Cleared chat {}", chat);
        Ok(())
    }

    /// Open a new conversation for an application and refresh the list
    pub async fn start_conversation(&self, origin: Origin) -> Result<Chat> {
        let chat = self.services.create_chat(&NewChat::for_origin(origin)).await?;
        info!("Started chat {} for {:?}", chat.id, origin);
        if !self.refresh_conversations().await? {
            self.poll.request_refresh();
        }
        Ok(chat)
    }
}

impl Drop for ChatEngine {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}
