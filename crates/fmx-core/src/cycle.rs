//! Subtree-completion ("cycling") detection.
//!
//! After every successful placement, the engine walks up from the new
//! position and evaluates each ancestor whose bounded subtree could
//! have been completed by that placement. The walk is an explicit loop
//! over a caller-supplied ancestor list, never recursion, so nested
//! completions stay analyzable: the lowest ancestor resolves first and
//! the highest last, since a child's completion is a precondition for
//! its parent's.
//!
//! Only ancestors within `depth` steps of the new leaf can be affected
//! by it; the caller bounds the walk accordingly.

use serde::Serialize;

use crate::level::LevelConfig;
use crate::position::PositionId;

/// Snapshot of one ancestor's bounded subtree, supplied by the store.
///
/// Ancestors are ordered nearest-first (direct parent at index 0).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AncestorSubtree {
    /// The ancestor position.
    pub position_id: PositionId,
    /// Owner of the ancestor position.
    pub owner_user_id: String,
    /// Descendants within `depth` steps below the ancestor, excluding
    /// the ancestor itself.
    pub populated: u64,
    /// Whether the ancestor already cycled.
    pub already_completed: bool,
    /// Whether the ancestor is a level root (no parent). Completing a
    /// root on a re-entry level recycles the level's fill counter.
    pub is_root: bool,
}

/// A completion event produced by [`detect_cycles`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleCompletion {
    /// The position that cycled.
    pub position_id: PositionId,
    /// Its owner, who receives the cycle payout.
    pub owner_user_id: String,
    /// Flat payout, `price x matrix_bonus_pct`.
    pub payout: i64,
    /// Whether the owner re-enters the same level with a fresh
    /// position.
    pub reenter: bool,
    /// Whether this completion resets the level's `positions_filled`
    /// counter (root recycle).
    pub resets_level_counter: bool,
}

/// Evaluates every candidate ancestor once, lowest first, and returns
/// the completions in commit order.
///
/// An ancestor completes when its bounded subtree population equals the
/// level capacity `w^d` and it has not already cycled. Populations
/// above capacity are tolerated here (the placement allocator rejects
/// the structural violation before any count can exceed capacity).
#[must_use]
pub fn detect_cycles(cfg: &LevelConfig, ancestors: &[AncestorSubtree]) -> Vec<CycleCompletion> {
    let capacity = cfg.capacity();
    ancestors
        .iter()
        .filter(|a| !a.already_completed && a.populated == capacity)
        .map(|a| CycleCompletion {
            position_id: a.position_id,
            owner_user_id: a.owner_user_id.clone(),
            payout: cfg.cycle_payout(),
            reenter: cfg.reentry,
            // A completed non-recycling root keeps the level at
            // capacity so later entrants get a LevelFull rejection.
            resets_level_counter: a.is_root && cfg.reentry,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn cfg() -> LevelConfig {
        LevelConfig {
            level: 1,
            price: 100,
            width: 2,
            depth: 2,
            referral_bonus_pct: 10,
            matrix_bonus_pct: 30,
            referral_depth_table: vec![],
            reentry: true,
        }
    }

    fn ancestor(populated: u64, completed: bool, is_root: bool) -> AncestorSubtree {
        AncestorSubtree {
            position_id: Uuid::new_v4(),
            owner_user_id: "owner".to_string(),
            populated,
            already_completed: completed,
            is_root,
        }
    }

    #[test]
    fn test_exact_capacity_completes_once() {
        let full = ancestor(4, false, false);
        let completions = detect_cycles(&cfg(), &[full.clone()]);
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].position_id, full.position_id);
        assert_eq!(completions[0].payout, 30);
        assert!(completions[0].reenter);
        assert!(!completions[0].resets_level_counter);
    }

    #[test]
    fn test_partial_subtree_does_not_complete() {
        let completions = detect_cycles(&cfg(), &[ancestor(3, false, false)]);
        assert!(completions.is_empty());
    }

    #[test]
    fn test_already_completed_ancestor_is_skipped() {
        let completions = detect_cycles(&cfg(), &[ancestor(4, true, false)]);
        assert!(completions.is_empty());
    }

    #[test]
    fn test_nested_completions_commit_lowest_first() {
        // Direct parent full, grandparent also full on the same
        // placement (w=1-style degenerate chain is the simplest shape
        // that produces this with w=2 in production data).
        let parent = ancestor(4, false, false);
        let grandparent = ancestor(4, false, true);
        let completions = detect_cycles(&cfg(), &[parent.clone(), grandparent.clone()]);
        assert_eq!(completions.len(), 2);
        assert_eq!(completions[0].position_id, parent.position_id);
        assert_eq!(completions[1].position_id, grandparent.position_id);
        assert!(completions[1].resets_level_counter);
    }

    #[test]
    fn test_root_completion_flags_counter_reset() {
        let completions = detect_cycles(&cfg(), &[ancestor(4, false, true)]);
        assert_eq!(completions.len(), 1);
        assert!(completions[0].resets_level_counter);
    }

    #[test]
    fn test_no_reentry_when_level_disables_it() {
        let mut no_reentry = cfg();
        no_reentry.reentry = false;
        let completions = detect_cycles(&no_reentry, &[ancestor(4, false, false)]);
        assert_eq!(completions.len(), 1);
        assert!(!completions[0].reenter);
    }

    #[test]
    fn test_non_reentry_root_keeps_level_counter() {
        let mut no_reentry = cfg();
        no_reentry.reentry = false;
        let completions = detect_cycles(&no_reentry, &[ancestor(4, false, true)]);
        assert_eq!(completions.len(), 1);
        assert!(!completions[0].resets_level_counter);
    }
}
