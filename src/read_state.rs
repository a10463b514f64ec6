//! Read-state reconciliation.
//!
//! Marking a chat read is a single backend write that flips every message
//! from the other participant. Locally we remember, per chat, the newest
//! message that write is known to cover (the read watermark) so that a poll
//! result fetched before the write landed cannot resurrect an unread badge.
//! Read flags only ever move from unread to read.

use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::models::{ChatId, Message, MessageKey, UserId};
use crate::remote::RemoteResult;
use crate::services::ChatServices;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkRead {
    /// Another mark-read for the same chat is still in flight
    Skipped,
    /// The backend confirmed; messages up to `through` are read
    Marked { through: Option<MessageKey> },
}

/// Combine two observations of the same message's read flag
pub fn merge_read(local: bool, remote: bool) -> bool {
    local || remote
}

/// Newest message in `messages` sent by someone other than `viewer`
pub fn latest_counterpart_key(messages: &[Message], viewer: UserId) -> Option<MessageKey> {
    messages
        .iter()
        .filter(|m| m.sender != viewer)
        .map(|m| m.key())
        .max()
}

struct InFlight<'a> {
    chats: &'a Mutex<HashSet<ChatId>>,
    chat: ChatId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut chats) = self.chats.lock() {
            chats.remove(&self.chat);
        }
    }
}

pub struct ReadStateReconciler {
    services: Arc<ChatServices>,
    viewer: UserId,
    in_flight: Mutex<HashSet<ChatId>>,
    watermarks: Mutex<HashMap<ChatId, MessageKey>>,
}

impl ReadStateReconciler {
    pub fn new(services: Arc<ChatServices>, viewer: UserId) -> Self {
        Self {
            services,
            viewer,
            in_flight: Mutex::new(HashSet::new()),
            watermarks: Mutex::new(HashMap::new()),
        }
    }

    fn enter(&self, chat: ChatId) -> Option<InFlight<'_>> {
        let mut chats = self.in_flight.lock().unwrap();
        if !chats.insert(chat) {
            return None;
        }
        Some(InFlight {
            chats: &self.in_flight,
            chat,
        })
    }

    pub fn is_in_flight(&self, chat: ChatId) -> bool {
        self.in_flight.lock().unwrap().contains(&chat)
    }

    /// Mark every message from the other participant in `chat` as read.
    ///
    /// Safe to call repeatedly; a call made while another one for the same
    /// chat is outstanding returns `Skipped` without touching the backend.
    pub async fn mark_all_read(&self, chat: ChatId) -> RemoteResult<MarkRead> {
        let _guard = match self.enter(chat) {
            Some(guard) => guard,
            None => {
                debug!("Mark-read for chat {} already in flight", chat);
                return Ok(MarkRead::Skipped);
            }
        };

        // Only messages that exist before the write are guaranteed to be covered by it
        let known = match self.services.chat_messages(chat).await {
            Ok(messages) => latest_counterpart_key(&messages, self.viewer),
            Err(e) => {
                warn!("Could not list messages of chat {} before mark-read: {}", chat, e);
                None
            }
        };

        self.services.mark_all_read(chat, self.viewer).await?;

        if let Some(key) = known {
            self.raise_watermark(chat, key);
        }
        info!("Marked chat {} read for user {}", chat, self.viewer);
        Ok(MarkRead::Marked {
            through: self.watermark(chat),
        })
    }

    fn raise_watermark(&self, chat: ChatId, key: MessageKey) {
        let mut watermarks = self.watermarks.lock().unwrap();
        let entry = watermarks.entry(chat).or_insert(key);
        if key > *entry {
            *entry = key;
        }
    }

    pub fn watermark(&self, chat: ChatId) -> Option<MessageKey> {
        self.watermarks.lock().unwrap().get(&chat).copied()
    }

    pub fn watermarks(&self) -> HashMap<ChatId, MessageKey> {
        self.watermarks.lock().unwrap().clone()
    }

    /// Apply the known read state to a freshly fetched message list
    pub fn reconcile(&self, chat: ChatId, messages: &mut [Message]) {
        let floor = match self.watermark(chat) {
            Some(floor) => floor,
            None => return,
        };
        for message in messages.iter_mut() {
            if message.sender != self.viewer && message.key() <= floor {
                message.read = merge_read(message.read, true);
            }
        }
    }

    /// Drop state for a chat that was deleted or cleared
    pub fn forget(&self, chat: ChatId) {
        self.watermarks.lock().unwrap().remove(&chat);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResponseCache;
    use crate::models::Origin;
    use crate::remote::InMemoryRemote;
    use crate::services::RetryPolicy;
    use std::time::Duration;

    fn setup() -> (Arc<InMemoryRemote>, Arc<ChatServices>, UserId, UserId, ChatId) {
        let remote = Arc::new(InMemoryRemote::new());
        let student = remote.add_user("Ada", "Lovelace", None);
        let recruiter = remote.add_user("Rita", "Hire", None);
        let company = remote.add_company(recruiter, "Acme");
        let job = remote.add_job(crate::models::CompanyRef::Id(company), "Intern");
        let application = remote.add_job_application(student, job);
        let chat = remote.add_chat(Origin::JobApplication(application));
        let services = Arc::new(ChatServices::new(
            remote.clone(),
            Arc::new(ResponseCache::default()),
            RetryPolicy::default(),
        ));
        (remote, services, student, recruiter, chat)
    }

    #[test]
    fn test_merge_read_is_monotonic() {
        assert!(merge_read(true, false));
        assert!(merge_read(false, true));
        assert!(!merge_read(false, false));
    }

    #[tokio::test]
    async fn test_mark_all_read_is_idempotent() {
        let (remote, services, student, recruiter, chat) = setup();
        remote.add_message(chat, recruiter, "hello", false);
        remote.add_message(chat, recruiter, "are you there?", false);
        remote.add_message(chat, student, "mine", false);
        let reconciler = ReadStateReconciler::new(services, student);

        let first = reconciler.mark_all_read(chat).await.unwrap();
        assert!(matches!(first, MarkRead::Marked { through: Some(_) }));
        assert_eq!(remote.read_transitions(), 2);

        reconciler.mark_all_read(chat).await.unwrap();
        assert_eq!(remote.read_transitions(), 2);
        assert!(remote
            .messages_in(chat)
            .iter()
            .all(|m| m.sender == student || m.read));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_mark_read_is_skipped() {
        let (remote, services, student, recruiter, chat) = setup();
        remote.add_message(chat, recruiter, "hello", false);
        remote.set_latency_for("mark_all_read", Duration::from_millis(500));
        let reconciler = ReadStateReconciler::new(services, student);

        let (a, b) = tokio::join!(reconciler.mark_all_read(chat), reconciler.mark_all_read(chat));
        let outcomes = [a.unwrap(), b.unwrap()];
        assert_eq!(outcomes.iter().filter(|o| **o == MarkRead::Skipped).count(), 1);
        assert_eq!(remote.calls("mark_all_read"), 1);
        assert!(!reconciler.is_in_flight(chat));
    }

    #[tokio::test]
    async fn test_stale_listing_is_reconciled_against_watermark() {
        let (remote, services, student, recruiter, chat) = setup();
        remote.add_message(chat, recruiter, "hello", false);

        // A poll fetched the list before the write
        let mut stale = services.chat_messages(chat).await.unwrap();
        let reconciler = ReadStateReconciler::new(services, student);
        reconciler.mark_all_read(chat).await.unwrap();

        assert!(!stale[0].read);
        reconciler.reconcile(chat, &mut stale);
        assert!(stale[0].read);

        reconciler.forget(chat);
        assert_eq!(reconciler.watermark(chat), None);
    }

    #[tokio::test]
    async fn test_failed_mark_read_releases_guard() {
        let (remote, services, student, recruiter, chat) = setup();
        remote.add_message(chat, recruiter, "hello", false);
        remote.fail_next("mark_all_read", 1);
        let reconciler = ReadStateReconciler::new(services, student);

        assert!(reconciler.mark_all_read(chat).await.is_err());
        assert_eq!(reconciler.watermark(chat), None);
        assert!(matches!(
            reconciler.mark_all_read(chat).await.unwrap(),
            MarkRead::Marked { .. }
        ));
    }
}
