// Message list of the open conversation.
// Holds confirmed messages merged from every fetch plus optimistic entries
// for sends still in flight. Each selection change bumps a generation so
// results fetched for a previous selection are dropped on arrival.

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use log::debug;
use std::collections::{HashMap, HashSet};

use crate::models::{
    ChatId, DayGroup, DayLabel, DeliveryStatus, Message, MessageId, MessageKey, TimelineEntry,
    UserId,
};
use crate::read_state::merge_read;

pub fn temp_id() -> String {
    format!("temp-{}", uuid::Uuid::new_v4())
}

#[derive(Debug, Default)]
pub struct Timeline {
    chat: Option<ChatId>,
    generation: u64,
    entries: Vec<TimelineEntry>,
    /// Confirmed locally but not yet seen in a server listing
    unlisted: HashSet<MessageId>,
    initial_scroll: bool,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chat(&self) -> Option<ChatId> {
        self.chat
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self, chat: ChatId, generation: u64) -> bool {
        self.chat == Some(chat) && self.generation == generation
    }

    /// Switch to `chat` (or to nothing). Returns the new generation.
    pub fn select(&mut self, chat: Option<ChatId>) -> u64 {
        self.generation += 1;
        self.chat = chat;
        self.entries.clear();
        self.unlisted.clear();
        self.initial_scroll = chat.is_some();
        debug!("Selected {:?}, generation {}", chat, self.generation);
        self.generation
    }

    /// True exactly once after each selection, when the view should jump to the bottom
    pub fn take_initial_scroll(&mut self) -> bool {
        std::mem::replace(&mut self.initial_scroll, false)
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter().map(|e| &e.message)
    }

    pub fn has_unread_for(&self, viewer: UserId) -> bool {
        self.entries
            .iter()
            .any(|e| e.status == DeliveryStatus::Confirmed && e.message.is_unread_for(viewer))
    }

    fn sort(&mut self) {
        self.entries.sort_by_key(|e| e.message.key());
    }

    /// Merge a server listing fetched under `generation`. Returns false and
    /// changes nothing if the selection moved on in the meantime.
    pub fn merge_fetched(&mut self, chat: ChatId, generation: u64, fetched: Vec<Message>) -> bool {
        if !self.is_current(chat, generation) {
            debug!(
                "Discarding messages for chat {} from generation {} (now {:?}/{})",
                chat, generation, self.chat, self.generation
            );
            return false;
        }

        let mut local: HashMap<MessageId, TimelineEntry> = HashMap::new();
        let mut pending = Vec::new();
        for entry in self.entries.drain(..) {
            match entry.status {
                DeliveryStatus::Confirmed => {
                    local.insert(entry.message.id, entry);
                }
                _ => pending.push(entry),
            }
        }

        let mut merged = Vec::with_capacity(fetched.len() + pending.len());
        for remote in fetched {
            self.unlisted.remove(&remote.id);
            let message = match local.remove(&remote.id) {
                Some(existing) => merge_message(existing.message, remote),
                None => remote,
            };
            merged.push(confirmed_entry(message));
        }

        // A listing that started before our own send completed does not know about it yet
        for (id, entry) in local {
            if self.unlisted.contains(&id) {
                merged.push(entry);
            }
        }

        merged.extend(pending);
        self.entries = merged;
        self.sort();
        true
    }

    /// Show `draft` immediately while its create call is outstanding
    pub fn push_pending(&mut self, draft: Message) -> String {
        let local_id = temp_id();
        self.entries.push(TimelineEntry {
            local_id: local_id.clone(),
            message: draft,
            status: DeliveryStatus::Pending,
        });
        self.sort();
        local_id
    }

    /// Replace the pending entry with the server's copy
    pub fn confirm(&mut self, local_id: &str, saved: Message) -> bool {
        let position = match self.entries.iter().position(|e| e.local_id == local_id) {
            Some(position) => position,
            None => return false,
        };
        self.entries.remove(position);

        // A poll may have delivered the saved message before the create call returned
        if let Some(existing) = self.entries.iter_mut().find(|e| e.message.id == saved.id) {
            existing.message = merge_message(existing.message.clone(), saved);
        } else {
            self.unlisted.insert(saved.id);
            self.entries.push(confirmed_entry(saved));
        }
        self.sort();
        true
    }

    /// Roll back a failed send, leaving the list as it was before
    pub fn reject(&mut self, local_id: &str) -> Option<TimelineEntry> {
        let position = self.entries.iter().position(|e| e.local_id == local_id)?;
        let mut entry = self.entries.remove(position);
        entry.status = DeliveryStatus::Failed;
        Some(entry)
    }

    /// Reflect a successful mark-read locally
    pub fn mark_read_through(&mut self, viewer: UserId, through: Option<MessageKey>) {
        for entry in self.entries.iter_mut() {
            let covered = through.map(|t| entry.message.key() <= t).unwrap_or(true);
            if entry.status == DeliveryStatus::Confirmed && entry.message.sender != viewer && covered {
                entry.message.read = true;
            }
        }
    }

    /// Drop every confirmed message (after the conversation was cleared).
    /// Listings fetched before the clear are discarded when they arrive.
    pub fn clear_confirmed(&mut self) {
        self.generation += 1;
        self.entries.retain(|e| e.status != DeliveryStatus::Confirmed);
        self.unlisted.clear();
    }
}

fn confirmed_entry(message: Message) -> TimelineEntry {
    TimelineEntry {
        local_id: message.id.to_string(),
        message,
        status: DeliveryStatus::Confirmed,
    }
}

/// Two copies of the same message: the newer version wins, the read flag never regresses
pub fn merge_message(local: Message, remote: Message) -> Message {
    let read = merge_read(local.read, remote.read);
    let mut winner = if local.version() > remote.version() {
        local
    } else {
        remote
    };
    winner.read = read;
    winner
}

pub fn day_label(date: NaiveDate, today: NaiveDate) -> DayLabel {
    if date == today {
        DayLabel::Today
    } else if Some(date) == today.checked_sub_signed(ChronoDuration::days(1)) {
        DayLabel::Yesterday
    } else {
        DayLabel::Date(date)
    }
}

/// Group entries by calendar day (UTC), oldest day first
pub fn group_by_day(entries: &[TimelineEntry], today: NaiveDate) -> Vec<DayGroup> {
    let mut groups: Vec<DayGroup> = Vec::new();
    for entry in entries {
        let date = entry.message.created_at.date_naive();
        match groups.last_mut() {
            Some(group) if group.date == date => group.entries.push(entry.clone()),
            _ => groups.push(DayGroup {
                date,
                label: day_label(date, today),
                entries: vec![entry.clone()],
            }),
        }
    }
    groups
}

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageType;
    use chrono::{DateTime, TimeZone};

    const ME: UserId = 1;
    const THEM: UserId = 2;
    const CHAT: ChatId = 9;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, hour, 0, 0).unwrap()
    }

    fn message(id: MessageId, sender: UserId, created_at: DateTime<Utc>, read: bool) -> Message {
        Message {
            id,
            chat: CHAT,
            sender,
            content: format!("m{}", id),
            message_type: MessageType::Text,
            metadata: None,
            read,
            created_at,
            updated_at: None,
        }
    }

    fn ids(timeline: &Timeline) -> Vec<MessageId> {
        timeline.messages().map(|m| m.id).collect()
    }

    #[test]
    fn test_fetched_messages_are_ordered_by_time_then_id() {
        let mut timeline = Timeline::new();
        let generation = timeline.select(Some(CHAT));
        let fetched = vec![
            message(3, THEM, at(2, 10), false),
            message(1, ME, at(1, 10), true),
            message(2, THEM, at(2, 10), false),
        ];
        assert!(timeline.merge_fetched(CHAT, generation, fetched));
        assert_eq!(ids(&timeline), vec![1, 2, 3]);
    }

    #[test]
    fn test_result_for_previous_selection_is_discarded() {
        let mut timeline = Timeline::new();
        let old = timeline.select(Some(CHAT));
        let new = timeline.select(Some(CHAT + 1));
        assert_ne!(old, new);

        assert!(!timeline.merge_fetched(CHAT, old, vec![message(1, THEM, at(1, 1), false)]));
        assert!(timeline.entries().is_empty());
        assert_eq!(timeline.chat(), Some(CHAT + 1));
    }

    #[test]
    fn test_reselecting_same_chat_still_discards_older_generation() {
        let mut timeline = Timeline::new();
        let old = timeline.select(Some(CHAT));
        let _ = timeline.select(Some(CHAT));
        assert!(!timeline.merge_fetched(CHAT, old, vec![message(1, THEM, at(1, 1), false)]));
    }

    #[test]
    fn test_listing_fetched_before_clear_is_discarded() {
        let mut timeline = Timeline::new();
        let generation = timeline.select(Some(CHAT));
        timeline.merge_fetched(CHAT, generation, vec![message(1, THEM, at(1, 1), true)]);

        timeline.clear_confirmed();
        assert!(!timeline.merge_fetched(CHAT, generation, vec![message(1, THEM, at(1, 1), true)]));
        assert!(timeline.entries().is_empty());
        assert_eq!(timeline.chat(), Some(CHAT));
    }

    #[test]
    fn test_read_flag_never_regresses_on_merge() {
        let mut timeline = Timeline::new();
        let generation = timeline.select(Some(CHAT));
        timeline.merge_fetched(CHAT, generation, vec![message(1, THEM, at(1, 1), false)]);
        timeline.mark_read_through(ME, None);
        assert!(timeline.entries()[0].message.read);

        // A stale poll still reports it unread
        timeline.merge_fetched(CHAT, generation, vec![message(1, THEM, at(1, 1), false)]);
        assert!(timeline.entries()[0].message.read);
        assert!(!timeline.has_unread_for(ME));
    }

    #[test]
    fn test_newer_version_wins() {
        let mut edited = message(1, THEM, at(1, 1), false);
        edited.content = "edited".into();
        edited.updated_at = Some(at(1, 5));
        let original = message(1, THEM, at(1, 1), true);

        let merged = merge_message(edited.clone(), original.clone());
        assert_eq!(merged.content, "edited");
        assert!(merged.read);

        let merged = merge_message(original, edited);
        assert_eq!(merged.content, "edited");
    }

    #[test]
    fn test_pending_send_confirm_and_reject() {
        let mut timeline = Timeline::new();
        let generation = timeline.select(Some(CHAT));
        timeline.merge_fetched(CHAT, generation, vec![message(1, THEM, at(1, 1), false)]);
        let before = timeline.entries().to_vec();

        let ok = timeline.push_pending(message(0, ME, at(1, 2), false));
        let failed = timeline.push_pending(message(0, ME, at(1, 3), false));
        assert!(ok.starts_with("temp-"));
        assert_eq!(timeline.entries().len(), 3);
        assert_eq!(timeline.entries()[2].status, DeliveryStatus::Pending);

        let rolled_back = timeline.reject(&failed).unwrap();
        assert_eq!(rolled_back.status, DeliveryStatus::Failed);

        assert!(timeline.confirm(&ok, message(7, ME, at(1, 2), false)));
        assert_eq!(ids(&timeline), vec![1, 7]);
        assert!(timeline.entries().iter().all(|e| e.status == DeliveryStatus::Confirmed));

        // Rolling back only the failed one leaves the original list plus the confirmed send
        assert_eq!(timeline.entries()[0], before[0]);
    }

    #[test]
    fn test_confirmed_send_survives_listing_that_predates_it() {
        let mut timeline = Timeline::new();
        let generation = timeline.select(Some(CHAT));
        let local_id = timeline.push_pending(message(0, ME, at(1, 2), false));
        timeline.confirm(&local_id, message(7, ME, at(1, 2), false));

        timeline.merge_fetched(CHAT, generation, vec![message(1, THEM, at(1, 1), false)]);
        assert_eq!(ids(&timeline), vec![1, 7]);

        // Once listed, a later listing without it means it was deleted remotely
        timeline.merge_fetched(CHAT, generation, vec![message(1, THEM, at(1, 1), false), message(7, ME, at(1, 2), false)]);
        timeline.merge_fetched(CHAT, generation, vec![message(1, THEM, at(1, 1), false)]);
        assert_eq!(ids(&timeline), vec![1]);
    }

    #[test]
    fn test_confirm_after_poll_delivered_it_does_not_duplicate() {
        let mut timeline = Timeline::new();
        let generation = timeline.select(Some(CHAT));
        let local_id = timeline.push_pending(message(0, ME, at(1, 2), false));
        timeline.merge_fetched(CHAT, generation, vec![message(7, ME, at(1, 2), false)]);
        assert_eq!(timeline.entries().len(), 2);

        timeline.confirm(&local_id, message(7, ME, at(1, 2), false));
        assert_eq!(ids(&timeline), vec![7]);
    }

    #[test]
    fn test_initial_scroll_resets_on_selection() {
        let mut timeline = Timeline::new();
        timeline.select(Some(CHAT));
        assert!(timeline.take_initial_scroll());
        assert!(!timeline.take_initial_scroll());
        timeline.select(Some(CHAT + 1));
        assert!(timeline.take_initial_scroll());
        timeline.select(None);
        assert!(!timeline.take_initial_scroll());
    }

    #[test]
    fn test_group_by_day_labels() {
        let entries: Vec<TimelineEntry> = vec![
            message(1, THEM, at(1, 9), true),
            message(2, ME, at(1, 18), true),
            message(3, THEM, at(9, 8), false),
            message(4, THEM, at(10, 8), false),
        ]
        .into_iter()
        .map(confirmed_entry)
        .collect();

        let today = NaiveDate::from_ymd_opt(2024, 5, 10).unwrap();
        let groups = group_by_day(&entries, today);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].label, DayLabel::Date(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()));
        assert_eq!(groups[0].entries.len(), 2);
        assert_eq!(groups[1].label, DayLabel::Yesterday);
        assert_eq!(groups[2].label, DayLabel::Today);
    }
}
