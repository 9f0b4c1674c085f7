//! Queue entry persistence.
//!
//! Entries are append-only; the run finalizes them by flipping
//! `processed` exactly once. `mark_processed` and `mark_failed` are
//! both idempotent: finalizing an already-finalized entry is a no-op,
//! never an error, so crash-recovery replays cannot corrupt the queue.

use chrono::{DateTime, Utc};
use fmx_core::position::PositionId;
use fmx_core::queue::{EntryId, EntryType, QueueEntry};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::{decode_ms, SqliteStore, StoreError};

/// Filter for the admin queue listing.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueFilter {
    /// Restrict to processed (`Some(true)`) or pending entries.
    pub processed: Option<bool>,
    /// Page size; 0 means the store default of 100.
    pub limit: u32,
    /// Page offset.
    pub offset: u32,
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<(QueueEntry, i64, Option<i64>, String)> {
    Ok((
        QueueEntry {
            id: row.get(0)?,
            user_id: row.get(1)?,
            username: row.get(2)?,
            level: row.get(3)?,
            enqueued_at: Utc::now(), // patched from the raw ms below
            entry_type: EntryType::Purchase, // patched below
            sponsor_hint: row.get(6)?,
            processed: row.get::<_, i64>(7)? != 0,
            processed_at: None, // patched below
            failure_reason: row.get(9)?,
        },
        row.get(4)?,
        row.get(8)?,
        row.get(5)?,
    ))
}

fn decode_entry(
    (mut entry, enqueued_ms, processed_ms, entry_type): (QueueEntry, i64, Option<i64>, String),
) -> Result<QueueEntry, StoreError> {
    entry.enqueued_at = decode_ms(enqueued_ms, "queue_entry.enqueued_at")?;
    entry.processed_at = processed_ms
        .map(|ms| decode_ms(ms, "queue_entry.processed_at"))
        .transpose()?;
    entry.entry_type = EntryType::parse(&entry_type).ok_or_else(|| StoreError::Corrupt {
        detail: format!("queue_entry {}: bad entry_type {entry_type}", entry.id),
    })?;
    Ok(entry)
}

const SELECT_COLUMNS: &str = "id, user_id, username, level, enqueued_at, entry_type, \
                              sponsor_hint, processed, processed_at, failure_reason";

impl SqliteStore {
    /// Appends a new queue entry and returns it with its assigned id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on write failure.
    pub fn enqueue(
        &self,
        user_id: &str,
        username: &str,
        level: u32,
        entry_type: EntryType,
        sponsor_hint: Option<&str>,
        enqueued_at: DateTime<Utc>,
    ) -> Result<QueueEntry, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO queue_entry
                 (user_id, username, level, enqueued_at, entry_type, sponsor_hint)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user_id,
                username,
                level,
                enqueued_at.timestamp_millis(),
                entry_type.as_str(),
                sponsor_hint
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(QueueEntry {
            id,
            user_id: user_id.to_string(),
            username: username.to_string(),
            level,
            enqueued_at,
            entry_type,
            sponsor_hint: sponsor_hint.map(str::to_string),
            processed: false,
            processed_at: None,
            failure_reason: None,
        })
    }

    /// Pending entries in processing order: ascending `enqueued_at`,
    /// id as tiebreak.
    ///
    /// Selection is by the `processed` flag, not the run cursor: the
    /// flag re-offers entries a transient failure deferred, which a
    /// cursor lower bound would skip past. The cursor only reports
    /// progress (see `SqliteStore::advance_cursor`).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on query failure, or
    /// [`StoreError::Corrupt`] if a row fails to decode.
    pub fn fetch_pending(&self, limit: u32) -> Result<Vec<QueueEntry>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM queue_entry
             WHERE processed = 0
             ORDER BY enqueued_at ASC, id ASC
             LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit], row_to_entry)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(decode_entry(row?)?);
        }
        Ok(entries)
    }

    /// Number of pending entries, for operator dashboards.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on query failure.
    pub fn count_pending(&self) -> Result<u64, StoreError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queue_entry WHERE processed = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Finalizes an entry as successfully processed. Idempotent: a
    /// second call finds `processed = 1` and changes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on write failure.
    pub fn mark_processed(&self, id: EntryId, now: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE queue_entry SET processed = 1, processed_at = ?2
             WHERE id = ?1 AND processed = 0",
            params![id, now.timestamp_millis()],
        )?;
        Ok(())
    }

    /// Finalizes an entry as failed, recording the reason for admin
    /// follow-up. Also idempotent; advances the queue past a poisoned
    /// entry (fail-open).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on write failure.
    pub fn mark_failed(
        &self,
        id: EntryId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE queue_entry SET processed = 1, processed_at = ?2, failure_reason = ?3
             WHERE id = ?1 AND processed = 0",
            params![id, now.timestamp_millis(), reason],
        )?;
        Ok(())
    }

    /// Position already placed for this entry, if any. Written by
    /// `insert_position` in the placement transaction; a retry after a
    /// transient failure resumes at the cascade instead of placing
    /// twice.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on query failure.
    pub fn entry_position(&self, id: EntryId) -> Result<Option<PositionId>, StoreError> {
        let conn = self.conn()?;
        let raw: Option<Option<String>> = conn
            .query_row(
                "SELECT placed_position_id FROM queue_entry WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match raw.flatten() {
            None => Ok(None),
            Some(s) => Uuid::parse_str(&s)
                .map(Some)
                .map_err(|_| StoreError::Corrupt {
                    detail: format!("queue_entry {id}: bad placed_position_id {s}"),
                }),
        }
    }

    /// Deletes a (typically mistaken) entry. Returns whether a row was
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on write failure.
    pub fn delete_entry(&self, id: EntryId) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM queue_entry WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    /// Admin listing with optional processed filter and paging.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on query failure, or
    /// [`StoreError::Corrupt`] if a row fails to decode.
    pub fn list_entries(&self, filter: QueueFilter) -> Result<Vec<QueueEntry>, StoreError> {
        let limit = if filter.limit == 0 { 100 } else { filter.limit };
        let conn = self.conn()?;
        let (sql, wants) = match filter.processed {
            Some(p) => (
                format!(
                    "SELECT {SELECT_COLUMNS} FROM queue_entry WHERE processed = ?3
                     ORDER BY enqueued_at ASC, id ASC LIMIT ?1 OFFSET ?2"
                ),
                Some(i64::from(p)),
            ),
            None => (
                format!(
                    "SELECT {SELECT_COLUMNS} FROM queue_entry
                     ORDER BY enqueued_at ASC, id ASC LIMIT ?1 OFFSET ?2"
                ),
                None,
            ),
        };
        let mut stmt = conn.prepare(&sql)?;
        let mut entries = Vec::new();
        match wants {
            Some(p) => {
                let rows = stmt.query_map(params![limit, filter.offset, p], row_to_entry)?;
                for row in rows {
                    entries.push(decode_entry(row?)?);
                }
            },
            None => {
                let rows = stmt.query_map(params![limit, filter.offset], row_to_entry)?;
                for row in rows {
                    entries.push(decode_entry(row?)?);
                }
            },
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use fmx_core::position::MatrixPosition;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn store_with_entries() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        // Enqueue out of time order to prove ordering is by timestamp.
        store
            .enqueue("u2", "bob", 1, EntryType::Purchase, None, at(200))
            .unwrap();
        store
            .enqueue("u1", "alice", 1, EntryType::Purchase, Some("s1"), at(100))
            .unwrap();
        store
    }

    #[test]
    fn test_fetch_pending_orders_by_enqueue_time() {
        let store = store_with_entries();
        let pending = store.fetch_pending(10).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].username, "alice");
        assert_eq!(pending[1].username, "bob");
        assert_eq!(store.count_pending().unwrap(), 2);
    }

    #[test]
    fn test_same_timestamp_breaks_ties_by_id() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = store
            .enqueue("u1", "a", 1, EntryType::Purchase, None, at(100))
            .unwrap();
        let second = store
            .enqueue("u2", "b", 1, EntryType::Purchase, None, at(100))
            .unwrap();
        let pending = store.fetch_pending(10).unwrap();
        assert_eq!(pending[0].id, first.id);
        assert_eq!(pending[1].id, second.id);
    }

    #[test]
    fn test_mark_processed_is_idempotent() {
        let store = store_with_entries();
        let pending = store.fetch_pending(10).unwrap();
        let id = pending[0].id;

        store.mark_processed(id, at(300)).unwrap();
        let first_pass = store
            .list_entries(QueueFilter {
                processed: Some(true),
                ..QueueFilter::default()
            })
            .unwrap();
        assert_eq!(first_pass.len(), 1);
        let recorded_at = first_pass[0].processed_at;

        // Second finalization is a no-op, not an error, and does not
        // move the processed timestamp.
        store.mark_processed(id, at(999)).unwrap();
        let second_pass = store
            .list_entries(QueueFilter {
                processed: Some(true),
                ..QueueFilter::default()
            })
            .unwrap();
        assert_eq!(second_pass[0].processed_at, recorded_at);
        assert_eq!(store.count_pending().unwrap(), 1);
    }

    #[test]
    fn test_mark_failed_records_reason_and_advances() {
        let store = store_with_entries();
        let id = store.fetch_pending(10).unwrap()[0].id;

        store.mark_failed(id, "unknown user", at(300)).unwrap();
        assert_eq!(store.count_pending().unwrap(), 1);

        let failed = store
            .list_entries(QueueFilter {
                processed: Some(true),
                ..QueueFilter::default()
            })
            .unwrap();
        assert_eq!(failed[0].failure_reason.as_deref(), Some("unknown user"));
    }

    #[test]
    fn test_entry_position_round_trip() {
        let store = store_with_entries();
        let id = store.fetch_pending(10).unwrap()[0].id;
        assert_eq!(store.entry_position(id).unwrap(), None);

        let pos = MatrixPosition::new_root("u1", "alice", 1, None, Utc::now());
        store.insert_position(&pos, Some(id)).unwrap();
        assert_eq!(store.entry_position(id).unwrap(), Some(pos.id));
    }

    #[test]
    fn test_delete_entry() {
        let store = store_with_entries();
        let id = store.fetch_pending(10).unwrap()[0].id;
        assert!(store.delete_entry(id).unwrap());
        assert!(!store.delete_entry(id).unwrap());
        assert_eq!(store.count_pending().unwrap(), 1);
    }
}
