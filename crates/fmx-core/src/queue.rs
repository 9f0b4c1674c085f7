//! Pending entry records.
//!
//! Every matrix entry request lands in a durable queue before the
//! placement run picks it up. Entries are processed in non-decreasing
//! `enqueued_at` order with the numeric id as tiebreak, and the
//! `processed` flag transitions false to true exactly once.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier for a queue entry. Monotonic, assigned by the store.
pub type EntryId = i64;

/// How an entry got into the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    /// A paid entry purchase.
    Purchase,
    /// Automatic re-entry after a cycle completion.
    Reentry,
    /// Manually injected by an operator.
    Admin,
}

impl EntryType {
    /// Stable string form used for persistence.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Purchase => "PURCHASE",
            Self::Reentry => "REENTRY",
            Self::Admin => "ADMIN",
        }
    }

    /// Parses the persisted string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PURCHASE" => Some(Self::Purchase),
            "REENTRY" => Some(Self::Reentry),
            "ADMIN" => Some(Self::Admin),
            _ => None,
        }
    }
}

/// A pending (or settled) placement request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Store-assigned id, also the resume cursor.
    pub id: EntryId,
    /// Requesting user id.
    pub user_id: String,
    /// Requesting user's display name.
    pub username: String,
    /// Target matrix level.
    pub level: u32,
    /// When the entry was enqueued; primary processing order key.
    pub enqueued_at: DateTime<Utc>,
    /// Origin of the entry.
    pub entry_type: EntryType,
    /// Optional sponsor override. When absent the user directory's
    /// sponsor relation is used.
    pub sponsor_hint: Option<String>,
    /// Whether the run has finalized this entry (success or failure).
    pub processed: bool,
    /// When the entry was finalized.
    pub processed_at: Option<DateTime<Utc>>,
    /// Failure reason recorded by `mark_failed`, for admin follow-up.
    pub failure_reason: Option<String>,
}

impl QueueEntry {
    /// Processing order: ascending `enqueued_at`, then ascending id.
    #[must_use]
    pub fn processing_order(a: &Self, b: &Self) -> Ordering {
        a.enqueued_at
            .cmp(&b.enqueued_at)
            .then_with(|| a.id.cmp(&b.id))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn entry(id: EntryId, secs: i64) -> QueueEntry {
        QueueEntry {
            id,
            user_id: format!("u{id}"),
            username: format!("user{id}"),
            level: 1,
            enqueued_at: Utc.timestamp_opt(secs, 0).unwrap(),
            entry_type: EntryType::Purchase,
            sponsor_hint: None,
            processed: false,
            processed_at: None,
            failure_reason: None,
        }
    }

    #[test]
    fn test_order_by_enqueue_time_then_id() {
        let mut entries = vec![entry(3, 200), entry(2, 100), entry(1, 100)];
        entries.sort_by(QueueEntry::processing_order);
        let ids: Vec<EntryId> = entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_entry_type_round_trips() {
        for ty in [EntryType::Purchase, EntryType::Reentry, EntryType::Admin] {
            assert_eq!(EntryType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(EntryType::parse("GIFT"), None);
    }
}
