//! Pinned conversations.
//!
//! A user may pin at most `max_pins` chats. The backend's list is the
//! source of truth whenever it can be fetched; a small JSON file keeps the
//! last known set so pins survive restarts while the backend is unreachable.
//!
//! Toggles and syncs issued from this process are serialized, so two local
//! toggles can never both pass the capacity check and a listing fetched
//! before a local change is never adopted after it. Two processes toggling
//! for the same user at once can still overshoot by one until the next sync.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Result, SyncError};
use crate::models::{ChatId, UserId};
use crate::remote::RemoteResult;
use crate::services::ChatServices;

pub const DEFAULT_MAX_PINS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinChange {
    Pinned,
    Unpinned,
}

#[derive(Serialize, Deserialize, Default)]
struct StoredPins {
    user: UserId,
    chats: Vec<ChatId>,
}

/// On-disk fallback for one user's pins
#[derive(Debug, Clone)]
pub struct PinStore {
    path: PathBuf,
    user: UserId,
}

impl PinStore {
    pub fn new(path: impl Into<PathBuf>, user: UserId) -> Self {
        Self {
            path: path.into(),
            user,
        }
    }

    /// `pinned_chats_<user>.json` inside `dir`
    pub fn in_dir(dir: &Path, user: UserId) -> Self {
        Self::new(dir.join(format!("pinned_chats_{}.json", user)), user)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty set; an unparseable one is logged and ignored
    pub fn load(&self) -> io::Result<Vec<ChatId>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        match serde_json::from_reader::<_, StoredPins>(BufReader::new(file)) {
            Ok(stored) if stored.user == self.user => Ok(stored.chats),
            Ok(stored) => {
                warn!(
                    "Ignoring pin file {} written for user {}",
                    self.path.display(),
                    stored.user
                );
                Ok(Vec::new())
            }
            Err(e) => {
                warn!("Ignoring corrupt pin file {}: {}", self.path.display(), e);
                Ok(Vec::new())
            }
        }
    }

    pub fn save(&self, chats: &[ChatId]) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(&self.path)?;
        let stored = StoredPins {
            user: self.user,
            chats: chats.to_vec(),
        };
        serde_json::to_writer_pretty(file, &stored).map_err(io::Error::from)?;
        debug!("Saved {} pin(s) to {}", chats.len(), self.path.display());
        Ok(())
    }
}

pub struct PinManager {
    services: Arc<ChatServices>,
    user: UserId,
    max_pins: usize,
    store: Option<PinStore>,
    pinned: Mutex<Vec<ChatId>>,
    /// Held across every toggle and remote sync
    toggle_lock: tokio::sync::Mutex<()>,
    /// Bumped on every local change to the set
    changes: AtomicU64,
}

impl PinManager {
    /// Starts from the locally persisted set, if any
    pub fn new(
        services: Arc<ChatServices>,
        user: UserId,
        max_pins: usize,
        store: Option<PinStore>,
    ) -> Result<Self> {
        let pinned = match &store {
            Some(store) => store.load().map_err(SyncError::LocalStore)?,
            None => Vec::new(),
        };
        if !pinned.is_empty() {
            info!("Restored {} local pin(s) for user {}", pinned.len(), user);
        }
        Ok(Self {
            services,
            user,
            max_pins,
            store,
            pinned: Mutex::new(pinned),
            toggle_lock: tokio::sync::Mutex::new(()),
            changes: AtomicU64::new(0),
        })
    }

    pub fn max_pins(&self) -> usize {
        self.max_pins
    }

    pub fn pinned(&self) -> Vec<ChatId> {
        self.pinned.lock().unwrap().clone()
    }

    pub fn pinned_set(&self) -> HashSet<ChatId> {
        self.pinned.lock().unwrap().iter().copied().collect()
    }

    pub fn is_pinned(&self, chat: ChatId) -> bool {
        self.pinned.lock().unwrap().contains(&chat)
    }

    fn replace(&self, chats: Vec<ChatId>) {
        {
            let mut pinned = self.pinned.lock().unwrap();
            *pinned = chats.clone();
            self.changes.fetch_add(1, Ordering::SeqCst);
        }
        self.persist(&chats);
    }

    fn persist(&self, chats: &[ChatId]) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(chats) {
                warn!("Failed to persist pins to {}: {}", store.path().display(), e);
            }
        }
    }

    /// Adopt the backend's pin list. On failure the local set is kept, and so
    /// is a local change made while the list was being fetched.
    pub async fn sync_from_remote(&self) -> RemoteResult<Vec<ChatId>> {
        let _serial = self.toggle_lock.lock().await;
        let changes_before = self.changes.load(Ordering::SeqCst);
        let remote = match self.services.pinned_chats(self.user).await {
            Ok(remote) => remote,
            Err(e) => {
                warn!("Could not fetch pins for user {}, keeping local set: {}", self.user, e);
                return Err(e);
            }
        };
        let mut chats: Vec<ChatId> = Vec::with_capacity(remote.len());
        for pin in remote {
            if !chats.contains(&pin.chat) {
                chats.push(pin.chat);
            }
        }
        if chats.len() > self.max_pins {
            warn!(
                "Backend holds {} pins for user {}, more than the limit of {}",
                chats.len(),
                self.user,
                self.max_pins
            );
        }
        if self.changes.load(Ordering::SeqCst) != changes_before {
            debug!("Pins for user {} changed locally during sync, keeping them", self.user);
            return Ok(self.pinned());
        }
        if chats != self.pinned() {
            debug!("Pins for user {} now {:?}", self.user, chats);
            self.replace(chats.clone());
        }
        Ok(chats)
    }

    /// Pin `chat` if unpinned, unpin it otherwise. A pin beyond capacity is
    /// refused before anything is written.
    pub async fn toggle_pin(&self, chat: ChatId) -> Result<PinChange> {
        let _serial = self.toggle_lock.lock().await;

        if self.is_pinned(chat) {
            self.services.delete_pinned_chat(self.user, chat).await?;
            let remaining: Vec<ChatId> = self.pinned().into_iter().filter(|c| *c != chat).collect();
            self.replace(remaining);
            info!("Unpinned chat {}", chat);
            return Ok(PinChange::Unpinned);
        }

        if self.pinned.lock().unwrap().len() >= self.max_pins {
            debug!("Refusing to pin chat {}: already {} pinned", chat, self.max_pins);
            return Err(SyncError::PinCapacity { max: self.max_pins });
        }

        self.services.create_pinned_chat(self.user, chat).await?;
        let mut chats = self.pinned();
        chats.push(chat);
        self.replace(chats);
        info!("Pinned chat {}", chat);
        Ok(PinChange::Pinned)
    }

    /// Drop a chat that no longer exists
    pub fn forget(&self, chat: ChatId) {
        if self.is_pinned(chat) {
            let remaining: Vec<ChatId> = self.pinned().into_iter().filter(|c| *c != chat).collect();
            self.replace(remaining);
        }
    }
}
