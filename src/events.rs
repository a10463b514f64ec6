// Change notifications for whoever renders the engine's state.
// Discrete events go out on a broadcast channel; the latest conversation
// list, unread total and open timeline are kept in watch channels so a late
// subscriber always starts from the current value.

use log::debug;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use crate::models::{ChatId, Conversation, TimelineEntry};

const EVENT_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The total unread count across all conversations changed
    UnreadCountChanged { total: u32 },
    ConversationsUpdated,
    MessagesUpdated { chat: ChatId },
    ConversationSelected { chat: Option<ChatId> },
    /// An optimistic send was rolled back
    SendFailed { chat: ChatId, local_id: String },
    PinsChanged,
}

pub struct EventBus {
    events: broadcast::Sender<SyncEvent>,
    conversations: watch::Sender<Arc<Vec<Conversation>>>,
    total_unread: watch::Sender<u32>,
    timeline: watch::Sender<Arc<Vec<TimelineEntry>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (conversations, _) = watch::channel(Arc::new(Vec::new()));
        let (total_unread, _) = watch::channel(0);
        let (timeline, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            events,
            conversations,
            total_unread,
            timeline,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn watch_conversations(&self) -> watch::Receiver<Arc<Vec<Conversation>>> {
        self.conversations.subscribe()
    }

    pub fn watch_total_unread(&self) -> watch::Receiver<u32> {
        self.total_unread.subscribe()
    }

    pub fn watch_timeline(&self) -> watch::Receiver<Arc<Vec<TimelineEntry>>> {
        self.timeline.subscribe()
    }

    pub fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        if self.events.send(event.clone()).is_err() {
            debug!("Dropped event with no listeners: {:?}", event);
        }
    }

    pub fn conversations(&self) -> Arc<Vec<Conversation>> {
        self.conversations.borrow().clone()
    }

    pub fn total_unread(&self) -> u32 {
        *self.total_unread.borrow()
    }

    pub fn timeline(&self) -> Arc<Vec<TimelineEntry>> {
        self.timeline.borrow().clone()
    }

    /// Publish a new conversation list. Returns whether it differs from the
    /// previous one.
    pub fn publish_conversations(&self, list: Vec<Conversation>) -> bool {
        let changed = self.conversations.send_if_modified(|current| {
            if current.as_slice() == list.as_slice() {
                return false;
            }
            *current = Arc::new(list);
            true
        });
        if changed {
            self.emit(SyncEvent::ConversationsUpdated);
        }
        changed
    }

    /// Publish the unread total, emitting `UnreadCountChanged` only on change
    pub fn publish_total_unread(&self, total: u32) -> bool {
        let changed = self.total_unread.send_if_modified(|current| {
            if *current == total {
                return false;
            }
            *current = total;
            true
        });
        if changed {
            debug!("Total unread is now {}", total);
            self.emit(SyncEvent::UnreadCountChanged { total });
        }
        changed
    }

    pub fn publish_timeline(&self, chat: Option<ChatId>, entries: Vec<TimelineEntry>) -> bool {
        let changed = self.timeline.send_if_modified(|current| {
            if current.as_slice() == entries.as_slice() {
                return false;
            }
            *current = Arc::new(entries);
            true
        });
        if let (true, Some(chat)) = (changed, chat) {
            self.emit(SyncEvent::MessagesUpdated { chat });
        }
        changed
    }
}
