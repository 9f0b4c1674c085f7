//! Matrix position persistence and tree reads.
//!
//! The placement transaction is the critical write: the position row
//! insert and the level's `positions_filled` increment commit together,
//! so the counter can never drift from the slot count under partial
//! failure. Roots are excluded from the counter: they open a matrix
//! rather than occupy a slot in one, which is what lets the configured
//! capacity `w^d` bound child placements per matrix generation.
//! Subtree population for cycle detection is a depth-bounded
//! recursive CTE over the parent pointers; the materialized
//! `position_path` is kept as an ancestor cache for listings only.

use chrono::{DateTime, Utc};
use fmx_core::placement::{ChildSlot, PlacementError, TreeView};
use fmx_core::position::{MatrixPosition, PositionId, PositionStatus};
use fmx_core::queue::{EntryId, EntryType};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::{decode_ms, SqliteStore, StoreError};

fn parse_position_id(raw: &str, context: &str) -> Result<PositionId, StoreError> {
    Uuid::parse_str(raw).map_err(|_| StoreError::Corrupt {
        detail: format!("{context}: bad position id {raw}"),
    })
}

fn row_to_position(row: &Row<'_>) -> rusqlite::Result<(MatrixPosition, String, Option<String>, String, i64)> {
    Ok((
        MatrixPosition {
            id: Uuid::nil(), // patched below
            user_id: row.get(1)?,
            username: row.get(2)?,
            level: row.get(3)?,
            parent_position_id: None, // patched below
            slot_index: row.get(5)?,
            position_path: row.get(6)?,
            sponsor_id: row.get(7)?,
            status: PositionStatus::Active, // patched below
            total_earned: row.get(9)?,
            cycle_count: row.get(10)?,
            created_at: Utc::now(), // patched below
        },
        row.get(0)?,
        row.get(4)?,
        row.get(8)?,
        row.get(11)?,
    ))
}

fn decode_position(
    (mut pos, id, parent, status, created_ms): (
        MatrixPosition,
        String,
        Option<String>,
        String,
        i64,
    ),
) -> Result<MatrixPosition, StoreError> {
    pos.id = parse_position_id(&id, "matrix_position.id")?;
    pos.parent_position_id = parent
        .map(|p| parse_position_id(&p, "matrix_position.parent_position_id"))
        .transpose()?;
    pos.status = PositionStatus::parse(&status).ok_or_else(|| StoreError::Corrupt {
        detail: format!("matrix_position {id}: bad status {status}"),
    })?;
    pos.created_at = decode_ms(created_ms, "matrix_position.created_at")?;
    Ok(pos)
}

const POSITION_COLUMNS: &str = "id, user_id, username, level, parent_position_id, slot_index, \
                                position_path, sponsor_id, status, total_earned, cycle_count, \
                                created_at";

impl SqliteStore {
    /// Inserts a position and, for child placements, increments the
    /// level's fill counter in the same transaction. When the position
    /// was produced by a queue entry, the entry's `placed_position_id`
    /// resume marker commits in that transaction too: a crash can
    /// never leave a committed position whose entry a recovery run
    /// would place again.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on write failure; a `UNIQUE`
    /// violation on `(parent, slot)` surfaces here if two runs ever
    /// raced past the single-flight lock.
    pub fn insert_position(
        &self,
        position: &MatrixPosition,
        entry: Option<EntryId>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO matrix_position
                 (id, user_id, username, level, parent_position_id, slot_index,
                  position_path, sponsor_id, status, total_earned, cycle_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                position.id.to_string(),
                position.user_id,
                position.username,
                position.level,
                position.parent_position_id.map(|p| p.to_string()),
                position.slot_index,
                position.position_path,
                position.sponsor_id,
                position.status.as_str(),
                position.total_earned,
                position.cycle_count,
                position.created_at.timestamp_millis(),
            ],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO matrix_level_state (level, positions_filled) VALUES (?1, 0)",
            params![position.level],
        )?;
        // Roots do not occupy a slot in anyone's matrix; only child
        // placements count against the level capacity.
        if position.parent_position_id.is_some() {
            tx.execute(
                "UPDATE matrix_level_state SET positions_filled = positions_filled + 1
                 WHERE level = ?1",
                params![position.level],
            )?;
        }
        if let Some(entry_id) = entry {
            tx.execute(
                "UPDATE queue_entry SET placed_position_id = ?2 WHERE id = ?1",
                params![entry_id, position.id.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Loads one position.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on query failure, or
    /// [`StoreError::Corrupt`] if the row fails to decode.
    pub fn get_position(&self, id: PositionId) -> Result<Option<MatrixPosition>, StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {POSITION_COLUMNS} FROM matrix_position WHERE id = ?1"),
            params![id.to_string()],
            row_to_position,
        )
        .optional()?
        .map(decode_position)
        .transpose()
    }

    /// A user's positions at a level, oldest first. These are the
    /// breadth-first search roots for sponsor-tree placement.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on query failure.
    pub fn user_positions(&self, user_id: &str, level: u32) -> Result<Vec<PositionId>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM matrix_position
             WHERE user_id = ?1 AND level = ?2
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![user_id, level], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(parse_position_id(&row?, "matrix_position.id")?);
        }
        Ok(ids)
    }

    /// Root positions (no parent) at a level, oldest first: the global
    /// root pool.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on query failure.
    pub fn level_roots(&self, level: u32) -> Result<Vec<PositionId>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM matrix_position
             WHERE level = ?1 AND parent_position_id IS NULL
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![level], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(parse_position_id(&row?, "matrix_position.id")?);
        }
        Ok(ids)
    }

    /// Direct children of a parent as `(id, slot_index)` pairs.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on query failure.
    pub fn children_of(&self, parent: PositionId) -> Result<Vec<ChildSlot>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, slot_index FROM matrix_position
             WHERE parent_position_id = ?1
             ORDER BY slot_index ASC",
        )?;
        let rows = stmt.query_map(params![parent.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
        })?;
        let mut children = Vec::new();
        for row in rows {
            let (id, slot_index) = row?;
            children.push(ChildSlot {
                id: parse_position_id(&id, "matrix_position.id")?,
                slot_index,
            });
        }
        Ok(children)
    }

    /// Number of descendants within `depth` steps below `root`,
    /// excluding the root itself. Bounded recursive CTE over the
    /// parent pointers.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on query failure.
    pub fn subtree_population(&self, root: PositionId, depth: u32) -> Result<u64, StoreError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "WITH RECURSIVE subtree(id, depth) AS (
                 SELECT id, 0 FROM matrix_position WHERE id = ?1
                 UNION ALL
                 SELECT p.id, s.depth + 1
                 FROM matrix_position p
                 JOIN subtree s ON p.parent_position_id = s.id
                 WHERE s.depth < ?2
             )
             SELECT COUNT(*) - 1 FROM subtree",
            params![root.to_string(), depth],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Ancestors of a position walking parent pointers, nearest first,
    /// bounded by `max_depth`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on query failure, or
    /// [`StoreError::Corrupt`] on an unreadable ancestor row (broken
    /// parent pointer included).
    pub fn ancestors_of(
        &self,
        position: &MatrixPosition,
        max_depth: u32,
    ) -> Result<Vec<MatrixPosition>, StoreError> {
        let mut ancestors = Vec::new();
        let mut next = position.parent_position_id;
        while let Some(parent_id) = next {
            if ancestors.len() as u32 >= max_depth {
                break;
            }
            let parent = self
                .get_position(parent_id)?
                .ok_or_else(|| StoreError::Corrupt {
                    detail: format!(
                        "position {} references missing parent {parent_id}",
                        position.id
                    ),
                })?;
            next = parent.parent_position_id;
            ancestors.push(parent);
        }
        Ok(ancestors)
    }

    /// Completes a cycled position and applies its follow-up effects
    /// in one transaction: status flip (guarded, so replays are
    /// no-ops), payout accrual, optional level counter reset, and the
    /// optional re-entry enqueue.
    ///
    /// Returns `false` if the position had already been completed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on write failure.
    pub fn complete_position(
        &self,
        position_id: PositionId,
        payout: i64,
        level: u32,
        reset_level_counter: bool,
        reentry: Option<(&str, &str, Option<&str>)>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE matrix_position
             SET status = 'COMPLETED',
                 cycle_count = cycle_count + 1,
                 total_earned = total_earned + ?2
             WHERE id = ?1 AND status != 'COMPLETED'",
            params![position_id.to_string(), payout],
        )?;
        if changed == 0 {
            // Already completed by an earlier (crashed) pass.
            tx.commit()?;
            return Ok(false);
        }
        if reset_level_counter {
            tx.execute(
                "UPDATE matrix_level_state SET positions_filled = 0 WHERE level = ?1",
                params![level],
            )?;
        }
        if let Some((user_id, username, sponsor_hint)) = reentry {
            tx.execute(
                "INSERT INTO queue_entry
                     (user_id, username, level, enqueued_at, entry_type, sponsor_hint)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    user_id,
                    username,
                    level,
                    now.timestamp_millis(),
                    EntryType::Reentry.as_str(),
                    sponsor_hint
                ],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    /// Current `positions_filled` for a level (0 when the level has
    /// never been placed into).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on query failure.
    pub fn positions_filled(&self, level: u32) -> Result<u64, StoreError> {
        let conn = self.conn()?;
        let filled: Option<i64> = conn
            .query_row(
                "SELECT positions_filled FROM matrix_level_state WHERE level = ?1",
                params![level],
                |row| row.get(0),
            )
            .optional()?;
        Ok(filled.unwrap_or(0).max(0) as u64)
    }

    /// Total position rows at a level, for invariant checks and the
    /// admin surface.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on query failure.
    pub fn position_count(&self, level: u32) -> Result<u64, StoreError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM matrix_position WHERE level = ?1",
            params![level],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

impl TreeView for SqliteStore {
    fn children(&self, parent: PositionId) -> Result<Vec<ChildSlot>, PlacementError> {
        self.children_of(parent)
            .map_err(|e| PlacementError::View(e.to_string()))
    }
}
