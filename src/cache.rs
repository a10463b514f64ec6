//! Short-lived memoization of backend reads.
//!
//! Entries are stored as JSON values and replaced wholesale; there is no
//! field-level patching. Every invalidation bumps an epoch so that a read
//! which started before a write cannot repopulate the cache with the
//! pre-write value once it resolves.

use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::models::{ChatId, MessageId, UserId};

pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    AllChats,
    Chat(ChatId),
    AllMessages,
    Message(MessageId),
    ChatMessages(ChatId),
    JobApplications,
    ResumeApplications,
    Jobs,
    Resumes,
    Users,
    User(UserId),
    Companies,
    PinnedChats(UserId),
}

impl CacheKey {
    /// Keys whose contents are derived from a chat's messages
    pub fn touches_chat_messages(&self, chat: ChatId) -> bool {
        matches!(self, CacheKey::ChatMessages(c) if *c == chat) || *self == CacheKey::AllMessages
    }
}

struct CacheEntry {
    data: Value,
    stored_at: Instant,
}

struct Inner {
    entries: HashMap<CacheKey, CacheEntry>,
    epoch: u64,
}

/// Captured before a fetch starts; the fetched value is only stored if no
/// invalidation happened in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillTicket {
    epoch: u64,
}

pub struct ResponseCache {
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                epoch: 0,
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the cached value if present, fresh and decodable
    pub fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        let fresh = match inner.entries.get(key) {
            Some(entry) => entry.stored_at.elapsed() < self.ttl,
            None => return None,
        };
        if !fresh {
            inner.entries.remove(key);
            return None;
        }

        let entry = inner.entries.get(key)?;
        match serde_json::from_value(entry.data.clone()) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!("Dropping undecodable cache entry {:?}: {}", key, e);
                inner.entries.remove(key);
                None
            }
        }
    }

    /// Unconditionally store `value` under `key`
    pub fn put<T: Serialize>(&self, key: CacheKey, value: &T) {
        if let Ok(data) = serde_json::to_value(value) {
            let mut inner = self.inner.lock().unwrap();
            inner.entries.insert(
                key,
                CacheEntry {
                    data,
                    stored_at: Instant::now(),
                },
            );
        }
    }

    pub fn ticket(&self) -> FillTicket {
        FillTicket {
            epoch: self.inner.lock().unwrap().epoch,
        }
    }

    /// Store `value` only if nothing was invalidated since `ticket` was taken.
    /// Returns whether the value was stored.
    pub fn fill<T: Serialize>(&self, ticket: FillTicket, key: CacheKey, value: &T) -> bool {
        let data = match serde_json::to_value(value) {
            Ok(data) => data,
            Err(_) => return false,
        };
        let mut inner = self.inner.lock().unwrap();
        if inner.epoch != ticket.epoch {
            debug!("Not caching {:?}: invalidated while in flight", key);
            return false;
        }
        inner.entries.insert(
            key,
            CacheEntry {
                data,
                stored_at: Instant::now(),
            },
        );
        true
    }

    pub fn invalidate(&self, key: &CacheKey) {
        let mut inner = self.inner.lock().unwrap();
        inner.epoch += 1;
        inner.entries.remove(key);
    }

    pub fn invalidate_where<F>(&self, predicate: F)
    where
        F: Fn(&CacheKey) -> bool,
    {
        let mut inner = self.inner.lock().unwrap();
        inner.epoch += 1;
        inner.entries.retain(|key, _| !predicate(key));
    }

    /// Drop everything, e.g. on logout
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.epoch += 1;
        inner.entries.clear();
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .get(key)
            .map(|entry| entry.stored_at.elapsed() < self.ttl)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
