//! Matrix position records.
//!
//! A position is one slot in a level's forced matrix. Positions form a
//! tree through `parent_position_id`; the `position_path` column keeps
//! a materialized root-to-node id chain as an ancestor cache so the
//! admin surface can filter by subtree without recursive queries. The
//! authoritative ancestor relation is always the parent pointer.
//!
//! Positions are historical records: status and earnings mutate, rows
//! are never deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier for a matrix position.
pub type PositionId = Uuid;

/// Separator used in the materialized `position_path`.
pub const PATH_SEPARATOR: char = '/';

/// Lifecycle status of a matrix position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    /// Created but not yet confirmed by the placement transaction.
    Pending,
    /// Live in the matrix, accumulating descendants.
    Active,
    /// Subtree filled; the position has cycled.
    Completed,
}

impl PositionStatus {
    /// Stable string form used for persistence and events.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
        }
    }

    /// Parses the persisted string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "ACTIVE" => Some(Self::Active),
            "COMPLETED" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// One slot in a level's forced matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixPosition {
    /// Unique position id.
    pub id: PositionId,
    /// Owning user id.
    pub user_id: String,
    /// Owning user's display name, denormalized for admin listings.
    pub username: String,
    /// Matrix level this position belongs to.
    pub level: u32,
    /// Parent position; `None` for roots.
    pub parent_position_id: Option<PositionId>,
    /// Slot under the parent, `0..width`. Roots use slot 0.
    pub slot_index: u32,
    /// Materialized root-to-self id chain, `PATH_SEPARATOR`-joined.
    pub position_path: String,
    /// Sponsoring user id, if any.
    pub sponsor_id: Option<String>,
    /// Lifecycle status.
    pub status: PositionStatus,
    /// Total minor units earned by this position so far.
    pub total_earned: i64,
    /// Number of times this position has cycled.
    pub cycle_count: u32,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl MatrixPosition {
    /// Creates a new root position (no parent, slot 0).
    #[must_use]
    pub fn new_root(
        user_id: &str,
        username: &str,
        level: u32,
        sponsor_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            user_id: user_id.to_string(),
            username: username.to_string(),
            level,
            parent_position_id: None,
            slot_index: 0,
            position_path: id.to_string(),
            sponsor_id: sponsor_id.map(str::to_string),
            status: PositionStatus::Active,
            total_earned: 0,
            cycle_count: 0,
            created_at: now,
        }
    }

    /// Creates a child position under `parent_path`/`parent_id` at the
    /// given slot.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new_child(
        user_id: &str,
        username: &str,
        level: u32,
        parent_id: PositionId,
        parent_path: &str,
        slot_index: u32,
        sponsor_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            user_id: user_id.to_string(),
            username: username.to_string(),
            level,
            parent_position_id: Some(parent_id),
            slot_index,
            position_path: format!("{parent_path}{PATH_SEPARATOR}{id}"),
            sponsor_id: sponsor_id.map(str::to_string),
            status: PositionStatus::Active,
            total_earned: 0,
            cycle_count: 0,
            created_at: now,
        }
    }

    /// Ids along the materialized path, root first. Entries that fail
    /// to parse are skipped; the parent pointer remains authoritative.
    #[must_use]
    pub fn path_ids(&self) -> Vec<PositionId> {
        self.position_path
            .split(PATH_SEPARATOR)
            .filter_map(|part| Uuid::parse_str(part).ok())
            .collect()
    }

    /// Depth of this position below its root (root = 0).
    #[must_use]
    pub fn path_depth(&self) -> u32 {
        self.position_path
            .matches(PATH_SEPARATOR)
            .count()
            .try_into()
            .unwrap_or(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_persisted_form() {
        for status in [
            PositionStatus::Pending,
            PositionStatus::Active,
            PositionStatus::Completed,
        ] {
            assert_eq!(PositionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(PositionStatus::parse("RETIRED"), None);
    }

    #[test]
    fn test_root_path_is_own_id() {
        let root = MatrixPosition::new_root("u1", "alice", 1, None, Utc::now());
        assert_eq!(root.position_path, root.id.to_string());
        assert_eq!(root.path_ids(), vec![root.id]);
        assert_eq!(root.path_depth(), 0);
    }

    #[test]
    fn test_child_path_extends_parent() {
        let now = Utc::now();
        let root = MatrixPosition::new_root("u1", "alice", 1, None, now);
        let child = MatrixPosition::new_child(
            "u2",
            "bob",
            1,
            root.id,
            &root.position_path,
            1,
            Some("u1"),
            now,
        );
        assert_eq!(child.path_ids(), vec![root.id, child.id]);
        assert_eq!(child.path_depth(), 1);
        assert_eq!(child.slot_index, 1);
        assert_eq!(child.parent_position_id, Some(root.id));
    }
}
