// Read-through cached access to the backend.
// Reads consult the ResponseCache first; writes go straight to the backend
// and synchronously invalidate every cache entry they could have made stale
// before returning to the caller.

use log::{debug, error, info, warn};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheKey, ResponseCache};
use crate::models::{
    Chat, ChatId, ChatStatus, Company, Job, JobApplication, Message, MessageId, MessagePatch,
    NewChat, NewMessage, PinnedChat, Resume, ResumeApplication, User, UserId,
};
use crate::remote::{RemoteApi, RemoteError, RemoteResult};

/// Backoff for write operations: attempt `n` waits `base_delay * n` before
/// the next one, plus up to 10% jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let base = self.base_delay * attempt as u32;
        let jitter_ms = base.as_millis() as u64 / 10;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> RemoteResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RemoteResult<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!("{} succeeded on attempt {}/{}", what, attempt, attempts);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!("{} failed on attempt {}/{}: {}", what, attempt, attempts, e);
                    tokio::time::sleep(self.delay_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!("{} failed after {} attempt(s): {}", what, attempt, e);
                    return Err(e);
                }
            }
        }
    }
}

pub struct ChatServices {
    remote: Arc<dyn RemoteApi>,
    cache: Arc<ResponseCache>,
    retry: RetryPolicy,
}

impl ChatServices {
    pub fn new(remote: Arc<dyn RemoteApi>, cache: Arc<ResponseCache>, retry: RetryPolicy) -> Self {
        Self { remote, cache, retry }
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn remote(&self) -> &Arc<dyn RemoteApi> {
        &self.remote
    }

    async fn cached<T, F, Fut>(&self, key: CacheKey, fetch: F) -> RemoteResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = RemoteResult<T>>,
    {
        if let Some(hit) = self.cache.get::<T>(&key) {
            return Ok(hit);
        }
        let ticket = self.cache.ticket();
        let fresh = fetch().await?;
        self.cache.fill(ticket, key, &fresh);
        Ok(fresh)
    }

    fn invalidate_chat_messages(&self, chat: ChatId) {
        self.cache.invalidate_where(|key| key.touches_chat_messages(chat));
    }

    /// Forget entries other participants can change at any time. Called at
    /// the start of every poll cycle; jobs, users and the like stay cached.
    pub fn expire_volatile(&self) {
        self.cache.invalidate_where(|key| {
            matches!(
                key,
                CacheKey::AllChats
                    | CacheKey::Chat(_)
                    | CacheKey::AllMessages
                    | CacheKey::ChatMessages(_)
                    | CacheKey::PinnedChats(_)
            )
        });
    }

    // ------------------- Reads -------------------

    pub async fn chats(&self) -> RemoteResult<Vec<Chat>> {
        self.cached(CacheKey::AllChats, || self.remote.list_chats()).await
    }

    pub async fn chat(&self, id: ChatId) -> RemoteResult<Chat> {
        self.cached(CacheKey::Chat(id), || self.remote.get_chat(id)).await
    }

    pub async fn all_messages(&self) -> RemoteResult<Vec<Message>> {
        self.cached(CacheKey::AllMessages, || self.remote.list_messages()).await
    }

    pub async fn message(&self, id: MessageId) -> RemoteResult<Message> {
        self.cached(CacheKey::Message(id), || self.remote.get_message(id)).await
    }

    pub async fn chat_messages(&self, chat: ChatId) -> RemoteResult<Vec<Message>> {
        self.cached(CacheKey::ChatMessages(chat), || self.remote.list_chat_messages(chat))
            .await
    }

    /// Bypasses the cache; used for the open conversation, which must always be current
    pub async fn chat_messages_fresh(&self, chat: ChatId) -> RemoteResult<Vec<Message>> {
        self.cache.invalidate(&CacheKey::ChatMessages(chat));
        self.chat_messages(chat).await
    }

    pub async fn job_applications(&self) -> RemoteResult<Vec<JobApplication>> {
        self.cached(CacheKey::JobApplications, || self.remote.list_job_applications())
            .await
    }

    pub async fn resume_applications(&self) -> RemoteResult<Vec<ResumeApplication>> {
        self.cached(CacheKey::ResumeApplications, || self.remote.list_resume_applications())
            .await
    }

    pub async fn jobs(&self) -> RemoteResult<Vec<Job>> {
        self.cached(CacheKey::Jobs, || self.remote.list_jobs()).await
    }

    pub async fn resumes(&self) -> RemoteResult<Vec<Resume>> {
        self.cached(CacheKey::Resumes, || self.remote.list_resumes()).await
    }

    pub async fn users(&self) -> RemoteResult<Vec<User>> {
        self.cached(CacheKey::Users, || self.remote.list_users()).await
    }

    pub async fn user(&self, id: UserId) -> RemoteResult<User> {
        self.cached(CacheKey::User(id), || self.remote.get_user(id)).await
    }

    pub async fn companies(&self) -> RemoteResult<Vec<Company>> {
        self.cached(CacheKey::Companies, || self.remote.list_companies()).await
    }

    pub async fn pinned_chats(&self, user: UserId) -> RemoteResult<Vec<PinnedChat>> {
        self.cached(CacheKey::PinnedChats(user), || self.remote.list_pinned_chats(user))
            .await
    }

    /// Server-side unread total, never cached
    pub async fn unread_count(&self, user: UserId) -> RemoteResult<u32> {
        self.remote.unread_count(user).await
    }

    // ------------------- Chat writes -------------------

    pub async fn create_chat(&self, chat: &NewChat) -> RemoteResult<Chat> {
        let result = self
            .retry
            .run("create chat", || self.remote.create_chat(chat))
            .await;
        self.cache.invalidate(&CacheKey::AllChats);
        let created = result?;
        info!("Created chat {}", created.id);
        Ok(created)
    }

    pub async fn update_chat_status(&self, id: ChatId, status: ChatStatus) -> RemoteResult<Chat> {
        let result = self.remote.update_chat_status(id, status).await;
        self.cache.invalidate(&CacheKey::Chat(id));
        self.cache.invalidate(&CacheKey::AllChats);
        let updated = result?;
        info!("Chat {} is now {}", id, updated.status);
        Ok(updated)
    }

    pub async fn delete_chat(&self, id: ChatId) -> RemoteResult<()> {
        let result = self.remote.delete_chat(id).await;
        self.cache.invalidate_where(|key| {
            matches!(key, CacheKey::Chat(c) if *c == id)
                || *key == CacheKey::AllChats
                || key.touches_chat_messages(id)
                || matches!(key, CacheKey::PinnedChats(_))
        });
        result?;
        info!("Deleted chat {}", id);
        Ok(())
    }

    pub async fn mark_all_read(&self, chat: ChatId, user: UserId) -> RemoteResult<()> {
        let result = self.remote.mark_all_read(chat, user).await;
        self.invalidate_chat_messages(chat);
        self.cache.invalidate_where(|key| matches!(key, CacheKey::Message(_)));
        result?;
        debug!("Marked chat {} read for user {}", chat, user);
        Ok(())
    }

    // ------------------- Message writes -------------------

    pub async fn create_message(&self, message: &NewMessage) -> RemoteResult<Message> {
        let result = self
            .retry
            .run("create message", || self.remote.create_message(message))
            .await;
        self.invalidate_chat_messages(message.chat);
        let created = result?;
        self.cache.put(CacheKey::Message(created.id), &created);
        Ok(created)
    }

    pub async fn update_message(&self, id: MessageId, patch: &MessagePatch) -> RemoteResult<Message> {
        let owner = self.message(id).await.ok().map(|m| m.chat);
        let result = self.remote.update_message(id, patch).await;
        self.cache.invalidate(&CacheKey::Message(id));
        match (&result, owner) {
            (Ok(updated), _) => self.invalidate_chat_messages(updated.chat),
            (Err(_), Some(chat)) => self.invalidate_chat_messages(chat),
            (Err(_), None) => self
                .cache
                .invalidate_where(|key| matches!(key, CacheKey::ChatMessages(_) | CacheKey::AllMessages)),
        }
        result
    }

    pub async fn delete_message(&self, id: MessageId) -> RemoteResult<()> {
        let owner = self.message(id).await.ok().map(|m| m.chat);
        let result = self.remote.delete_message(id).await;
        self.cache.invalidate(&CacheKey::Message(id));
        match owner {
            Some(chat) => self.invalidate_chat_messages(chat),
            None => self
                .cache
                .invalidate_where(|key| matches!(key, CacheKey::ChatMessages(_) | CacheKey::AllMessages)),
        }
        result
    }

    /// Bulk delete, falling back to one delete per message if the bulk endpoint fails
    pub async fn delete_all_messages(&self, chat: ChatId) -> RemoteResult<()> {
        let bulk = self.remote.delete_all_messages(chat).await;
        self.invalidate_chat_messages(chat);
        let bulk_error = match bulk {
            Ok(()) => {
                info!("Cleared all messages in chat {}", chat);
                return Ok(());
            }
            Err(e) => e,
        };

        warn!("Bulk delete for chat {} failed ({}), deleting one by one", chat, bulk_error);
        let messages = self.remote.list_chat_messages(chat).await?;
        let deletions = messages.iter().map(|m| self.remote.delete_message(m.id));
        let results = futures::future::join_all(deletions).await;
        self.invalidate_chat_messages(chat);
        self.cache.invalidate_where(|key| matches!(key, CacheKey::Message(_)));

        let failures: Vec<RemoteError> = results.into_iter().filter_map(|r| r.err()).collect();
        match failures.into_iter().next() {
            Some(first) => Err(first),
            None => Ok(()),
        }
    }

    // ------------------- Pin writes -------------------

    pub async fn create_pinned_chat(&self, user: UserId, chat: ChatId) -> RemoteResult<PinnedChat> {
        let result = self.remote.create_pinned_chat(user, chat).await;
        self.cache.invalidate(&CacheKey::PinnedChats(user));
        result
    }

    pub async fn delete_pinned_chat(&self, user: UserId, chat: ChatId) -> RemoteResult<()> {
        let result = self.remote.delete_pinned_chat(user, chat).await;
        self.cache.invalidate(&CacheKey::PinnedChats(user));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageType, Origin};
    use crate::remote::InMemoryRemote;

    fn services(remote: Arc<InMemoryRemote>) -> ChatServices {
        ChatServices::new(
            remote,
            Arc::new(ResponseCache::default()),
            RetryPolicy {
                attempts: 3,
                base_delay: Duration::from_millis(10),
            },
        )
    }

    fn text(chat: ChatId, sender: UserId, content: &str) -> NewMessage {
        NewMessage {
            chat,
            sender,
            content: content.to_string(),
            message_type: MessageType::Text,
            metadata: None,
            read: false,
        }
    }

    #[tokio::test]
    async fn test_reads_are_served_from_cache() {
        let remote = Arc::new(InMemoryRemote::new());
        let chat = remote.add_chat(Origin::JobApplication(1));
        let services = services(remote.clone());

        services.chat_messages(chat).await.unwrap();
        services.chat_messages(chat).await.unwrap();

        assert_eq!(remote.calls("list_chat_messages"), 1);
    }

    #[tokio::test]
    async fn test_create_message_invalidates_chat_list() {
        let remote = Arc::new(InMemoryRemote::new());
        let chat = remote.add_chat(Origin::JobApplication(1));
        let services = services(remote.clone());

        assert!(services.chat_messages(chat).await.unwrap().is_empty());
        services.create_message(&text(chat, 1, "hello")).await.unwrap();

        let messages = services.chat_messages(chat).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hello");
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_message_retries_transient_failures() {
        let remote = Arc::new(InMemoryRemote::new());
        let chat = remote.add_chat(Origin::JobApplication(1));
        remote.fail_next("create_message", 2);
        let services = services(remote.clone());

        let created = services.create_message(&text(chat, 1, "third time lucky")).await;

        assert!(created.is_ok());
        assert_eq!(remote.calls("create_message"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_message_gives_up_after_three_attempts() {
        let remote = Arc::new(InMemoryRemote::new());
        let chat = remote.add_chat(Origin::JobApplication(1));
        remote.fail_next("create_message", 5);
        let services = services(remote.clone());

        assert!(services.create_message(&text(chat, 1, "never")).await.is_err());
        assert_eq!(remote.calls("create_message"), 3);
        assert!(remote.messages_in(chat).is_empty());
    }

    #[tokio::test]
    async fn test_reads_are_not_retried() {
        let remote = Arc::new(InMemoryRemote::new());
        remote.fail_next("list_chats", 1);
        let services = services(remote.clone());

        assert!(services.chats().await.is_err());
        assert_eq!(remote.calls("list_chats"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_writes_still_invalidate() {
        let remote = Arc::new(InMemoryRemote::new());
        let chat = remote.add_chat(Origin::JobApplication(1));
        let message = remote.add_message(chat, 1, "draft", false);
        let services = services(remote.clone());

        services.chat_messages(chat).await.unwrap();
        services.message(message).await.unwrap();
        remote.fail_next("update_message", 1);
        let patch = MessagePatch {
            content: Some("final".into()),
            ..MessagePatch::default()
        };
        assert!(services.update_message(message, &patch).await.is_err());
        assert!(!services.cache().contains(&CacheKey::ChatMessages(chat)));
        assert!(!services.cache().contains(&CacheKey::Message(message)));

        services.chats().await.unwrap();
        remote.fail_next("create_chat", 5);
        assert!(services
            .create_chat(&NewChat::for_origin(Origin::JobApplication(2)))
            .await
            .is_err());
        assert!(!services.cache().contains(&CacheKey::AllChats));
    }

    #[tokio::test]
    async fn test_delete_all_falls_back_to_single_deletes() {
        let remote = Arc::new(InMemoryRemote::new());
        let chat = remote.add_chat(Origin::JobApplication(1));
        remote.add_message(chat, 1, "a", false);
        remote.add_message(chat, 2, "b", false);
        remote.fail_next("delete_all_messages", 1);
        let services = services(remote.clone());

        services.delete_all_messages(chat).await.unwrap();

        assert!(remote.messages_in(chat).is_empty());
        assert_eq!(remote.calls("delete_message"), 2);
    }

    #[test]
    fn test_retry_delay_grows_linearly() {
        let policy = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1000),
        };
        let first = policy.delay_for(1);
        let second = policy.delay_for(2);
        assert!(first >= Duration::from_millis(1000) && first <= Duration::from_millis(1100));
        assert!(second >= Duration::from_millis(2000) && second <= Duration::from_millis(2200));
    }

    #[tokio::test]
    async fn test_expire_volatile_keeps_directory_records() {
        let remote = Arc::new(InMemoryRemote::new());
        let chat = remote.add_chat(Origin::JobApplication(1));
        let services = services(remote.clone());

        services.chats().await.unwrap();
        services.chat_messages(chat).await.unwrap();
        services.jobs().await.unwrap();
        services.expire_volatile();

        assert!(!services.cache().contains(&CacheKey::AllChats));
        assert!(!services.cache().contains(&CacheKey::ChatMessages(chat)));
        assert!(services.cache().contains(&CacheKey::Jobs));
    }
}
