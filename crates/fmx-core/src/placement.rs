//! Breadth-first open-slot search ("spillover" placement).
//!
//! The allocator fills a forced matrix breadth-first, left to right:
//! the next entrant always lands in the shallowest, leftmost open slot
//! reachable from the search roots. This is the standard forced-matrix
//! fill discipline and is what makes completion times predictable.
//!
//! The search runs against an abstract [`TreeView`] so the same
//! algorithm is exercised by in-memory unit tests and by the
//! `SQLite`-backed store in `fmx-daemon`.
//!
//! # Contracts
//!
//! - A parent never reports more than `width` children; a violation is
//!   a structural error, not a recoverable condition.
//! - No two children of a parent share a `slot_index`.
//! - Visited nodes are bounded by [`MAX_SCAN_NODES`]; the search fails
//!   closed rather than walking an unbounded (corrupt) tree.

use std::collections::{HashMap, VecDeque};

use thiserror::Error;

use crate::position::PositionId;

/// Hard bound on nodes visited by one open-slot search. A healthy
/// frontier-cached search touches O(depth) nodes; hitting this limit
/// means the tree is corrupt or the cache layer is broken.
pub const MAX_SCAN_NODES: usize = 100_000;

/// Errors raised by the placement allocator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PlacementError {
    /// The target level is not configured.
    #[error("invalid matrix level: {level}")]
    InvalidLevel {
        /// The rejected level number.
        level: u32,
    },

    /// The level has reached its position cap and does not recycle.
    #[error("matrix level {level} is full")]
    LevelFull {
        /// The full level number.
        level: u32,
    },

    /// The referenced sponsor does not exist in the user directory.
    #[error("sponsor not found: {sponsor_id}")]
    SponsorNotFound {
        /// The missing sponsor's user id.
        sponsor_id: String,
    },

    /// The tree violates a structural invariant. Fatal for the current
    /// entry; the run must stop and leave the lock stuck for admin
    /// inspection.
    #[error("matrix tree inconsistent: {detail}")]
    TreeInconsistent {
        /// Human-readable description with full context.
        detail: String,
    },

    /// The bounded search visited [`MAX_SCAN_NODES`] nodes without
    /// finding an open slot.
    #[error("open-slot scan exceeded {limit} nodes")]
    ScanLimitExceeded {
        /// The configured node budget.
        limit: usize,
    },

    /// The underlying tree view failed (storage layer).
    #[error("tree view error: {0}")]
    View(String),
}

/// One child edge as reported by a [`TreeView`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildSlot {
    /// The child position id.
    pub id: PositionId,
    /// The slot the child occupies under its parent.
    pub slot_index: u32,
}

/// Read access to the matrix tree, supplied by the store.
pub trait TreeView {
    /// Returns the direct children of `parent`, any order.
    ///
    /// # Errors
    ///
    /// Implementations map storage failures to
    /// [`PlacementError::View`].
    fn children(&self, parent: PositionId) -> Result<Vec<ChildSlot>, PlacementError>;
}

/// A slot chosen by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenSlot {
    /// Parent the new position attaches to.
    pub parent: PositionId,
    /// Lowest free slot index under that parent.
    pub slot_index: u32,
}

/// Inspects one node: lowest free slot if any, plus its children in
/// slot order for the BFS frontier.
fn inspect_node<V: TreeView>(
    view: &V,
    node: PositionId,
    width: u32,
) -> Result<(Option<u32>, Vec<PositionId>), PlacementError> {
    let mut children = view.children(node)?;
    if children.len() > width as usize {
        return Err(PlacementError::TreeInconsistent {
            detail: format!(
                "position {node} has {} children, width is {width}",
                children.len()
            ),
        });
    }
    children.sort_by_key(|c| c.slot_index);
    let mut occupied = vec![false; width as usize];
    for child in &children {
        let idx = child.slot_index as usize;
        let Some(slot) = occupied.get_mut(idx) else {
            return Err(PlacementError::TreeInconsistent {
                detail: format!(
                    "position {} occupies slot {} under {node}, width is {width}",
                    child.id, child.slot_index
                ),
            });
        };
        if *slot {
            return Err(PlacementError::TreeInconsistent {
                detail: format!("duplicate slot {} under {node}", child.slot_index),
            });
        }
        *slot = true;
    }
    let free = occupied.iter().position(|taken| !taken).map(|i| i as u32);
    Ok((free, children.into_iter().map(|c| c.id).collect()))
}

/// Finds the shallowest, leftmost open slot reachable from `roots` by
/// breadth-first search, never deeper than `max_depth` levels below a
/// root.
///
/// Roots are visited in the given order, so a sponsor's oldest position
/// fills first. Returns `None` when `roots` is empty or every matrix
/// under them is full to depth (the caller then materializes a new
/// root or rejects the entry via the level capacity check).
///
/// # Errors
///
/// Propagates view errors and structural violations; fails with
/// [`PlacementError::ScanLimitExceeded`] if the bounded scan budget is
/// exhausted.
pub fn find_open_slot<V: TreeView>(
    view: &V,
    roots: &[PositionId],
    width: u32,
    max_depth: u32,
) -> Result<Option<OpenSlot>, PlacementError> {
    let mut frontier: VecDeque<(PositionId, u32)> = roots.iter().map(|r| (*r, 0)).collect();
    let mut visited = 0usize;

    while let Some((node, depth)) = frontier.pop_front() {
        // A node at max_depth would parent children beyond the matrix
        // floor.
        if depth >= max_depth {
            continue;
        }
        visited += 1;
        if visited > MAX_SCAN_NODES {
            return Err(PlacementError::ScanLimitExceeded {
                limit: MAX_SCAN_NODES,
            });
        }
        let (free, children) = inspect_node(view, node, width)?;
        if let Some(slot_index) = free {
            return Ok(Some(OpenSlot {
                parent: node,
                slot_index,
            }));
        }
        frontier.extend(children.into_iter().map(|c| (c, depth + 1)));
    }
    Ok(None)
}

/// Per-sponsor frontier cache.
///
/// Remembers, per `(sponsor, level)`, the last node known to have free
/// capacity so the common case is a single `children` probe instead of
/// a full scan from the roots. The cache is advisory: a stale or full
/// cached node just means falling back to the breadth-first search,
/// never a wrong placement, because slots only ever fill and the cached
/// node was reached by an earlier left-to-right scan.
#[derive(Debug, Default)]
pub struct FrontierCache {
    entries: HashMap<(String, u32), PositionId>,
}

impl FrontierCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached frontier node for a sponsor and level, if any.
    #[must_use]
    pub fn get(&self, sponsor_id: &str, level: u32) -> Option<PositionId> {
        self.entries.get(&(sponsor_id.to_string(), level)).copied()
    }

    /// Records the node that just accepted a child.
    pub fn record(&mut self, sponsor_id: &str, level: u32, node: PositionId) {
        self.entries.insert((sponsor_id.to_string(), level), node);
    }

    /// Drops a stale cache entry (cached node filled up).
    pub fn invalidate(&mut self, sponsor_id: &str, level: u32) {
        self.entries.remove(&(sponsor_id.to_string(), level));
    }
}

/// Frontier-cached slot search: probes the cached node first, falling
/// back to the full breadth-first scan (and refreshing the cache) when
/// the cached node is absent or full.
///
/// # Errors
///
/// Same failure modes as [`find_open_slot`].
pub fn find_open_slot_cached<V: TreeView>(
    view: &V,
    cache: &mut FrontierCache,
    sponsor_id: &str,
    level: u32,
    roots: &[PositionId],
    width: u32,
    max_depth: u32,
) -> Result<Option<OpenSlot>, PlacementError> {
    // A cached node was returned as a parent by an earlier bounded
    // search, so it sits above the matrix floor; depth never changes
    // after placement, which keeps the probe valid.
    if let Some(node) = cache.get(sponsor_id, level) {
        let (free, _children) = inspect_node(view, node, width)?;
        if let Some(slot_index) = free {
            return Ok(Some(OpenSlot {
                parent: node,
                slot_index,
            }));
        }
        cache.invalidate(sponsor_id, level);
    }

    let slot = find_open_slot(view, roots, width, max_depth)?;
    if let Some(open) = slot {
        cache.record(sponsor_id, level, open.parent);
    }
    Ok(slot)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use uuid::Uuid;

    use super::*;

    /// In-memory tree for exercising the allocator without a store.
    #[derive(Default)]
    struct MemTree {
        children: HashMap<PositionId, Vec<ChildSlot>>,
    }

    impl MemTree {
        fn add_child(&mut self, parent: PositionId, slot_index: u32) -> PositionId {
            let id = Uuid::new_v4();
            self.children
                .entry(parent)
                .or_default()
                .push(ChildSlot { id, slot_index });
            id
        }
    }

    impl TreeView for MemTree {
        fn children(&self, parent: PositionId) -> Result<Vec<ChildSlot>, PlacementError> {
            Ok(self.children.get(&parent).cloned().unwrap_or_default())
        }
    }

    /// Places `count` nodes under a single root with width `w` and
    /// returns the chosen slots in order.
    fn fill(tree: &mut MemTree, root: PositionId, width: u32, count: usize) -> Vec<OpenSlot> {
        let mut placed = Vec::new();
        for _ in 0..count {
            let slot = find_open_slot(tree, &[root], width, 12)
                .unwrap()
                .expect("open slot");
            tree.add_child(slot.parent, slot.slot_index);
            placed.push(slot);
        }
        placed
    }

    #[test]
    fn test_empty_roots_yield_no_slot() {
        let tree = MemTree::default();
        assert_eq!(find_open_slot(&tree, &[], 2, 3).unwrap(), None);
    }

    #[test]
    fn test_full_matrix_to_depth_yields_no_slot() {
        let mut tree = MemTree::default();
        let root = Uuid::new_v4();
        tree.add_child(root, 0);
        tree.add_child(root, 1);

        // Depth 1: both slots taken, the children's own slots are
        // below the matrix floor.
        assert_eq!(find_open_slot(&tree, &[root], 2, 1).unwrap(), None);
        // A deeper matrix over the same tree still has room.
        assert!(find_open_slot(&tree, &[root], 2, 2).unwrap().is_some());
    }

    #[test]
    fn test_breadth_first_fill_order_w2() {
        let mut tree = MemTree::default();
        let root = Uuid::new_v4();

        let placed = fill(&mut tree, root, 2, 4);

        // First two are direct children of the root.
        assert_eq!(placed[0], OpenSlot { parent: root, slot_index: 0 });
        assert_eq!(placed[1], OpenSlot { parent: root, slot_index: 1 });

        // Next two land under the first child, left to right.
        let first_child = tree.children.get(&root).unwrap()[0].id;
        assert_eq!(placed[2].parent, first_child);
        assert_eq!(placed[2].slot_index, 0);
        assert_eq!(placed[3].parent, first_child);
        assert_eq!(placed[3].slot_index, 1);
    }

    #[test]
    fn test_lowest_free_slot_wins_after_gap() {
        let mut tree = MemTree::default();
        let root = Uuid::new_v4();
        // Slot 0 left open, slot 1 taken.
        tree.add_child(root, 1);

        let slot = find_open_slot(&tree, &[root], 2, 2).unwrap().unwrap();
        assert_eq!(slot, OpenSlot { parent: root, slot_index: 0 });
    }

    #[test]
    fn test_earlier_root_fills_first() {
        let mut tree = MemTree::default();
        let old_root = Uuid::new_v4();
        let new_root = Uuid::new_v4();

        let slot = find_open_slot(&tree, &[old_root, new_root], 3, 2)
            .unwrap()
            .unwrap();
        assert_eq!(slot.parent, old_root);
    }

    #[test]
    fn test_overwide_parent_is_structural_error() {
        let mut tree = MemTree::default();
        let root = Uuid::new_v4();
        tree.add_child(root, 0);
        tree.add_child(root, 1);
        tree.add_child(root, 2);

        let err = find_open_slot(&tree, &[root], 2, 2).unwrap_err();
        assert!(matches!(err, PlacementError::TreeInconsistent { .. }));
    }

    #[test]
    fn test_duplicate_slot_is_structural_error() {
        let mut tree = MemTree::default();
        let root = Uuid::new_v4();
        tree.add_child(root, 0);
        tree.add_child(root, 0);

        let err = find_open_slot(&tree, &[root], 3, 2).unwrap_err();
        assert!(matches!(err, PlacementError::TreeInconsistent { .. }));
    }

    #[test]
    fn test_out_of_range_slot_is_structural_error() {
        let mut tree = MemTree::default();
        let root = Uuid::new_v4();
        tree.add_child(root, 5);

        let err = find_open_slot(&tree, &[root], 2, 2).unwrap_err();
        assert!(matches!(err, PlacementError::TreeInconsistent { .. }));
    }

    #[test]
    fn test_frontier_cache_short_circuits() {
        let mut tree = MemTree::default();
        let root = Uuid::new_v4();
        let mut cache = FrontierCache::new();

        let first = find_open_slot_cached(&tree, &mut cache, "s1", 1, &[root], 2, 3)
            .unwrap()
            .unwrap();
        tree.add_child(first.parent, first.slot_index);
        assert_eq!(cache.get("s1", 1), Some(root));

        // Cached root still has slot 1 free; probe hits it directly.
        let second = find_open_slot_cached(&tree, &mut cache, "s1", 1, &[root], 2, 3)
            .unwrap()
            .unwrap();
        assert_eq!(second, OpenSlot { parent: root, slot_index: 1 });
        tree.add_child(second.parent, second.slot_index);

        // Root is now full: cache invalidates and falls back to BFS.
        let third = find_open_slot_cached(&tree, &mut cache, "s1", 1, &[root], 2, 3)
            .unwrap()
            .unwrap();
        assert_ne!(third.parent, root);
        assert_eq!(cache.get("s1", 1), Some(third.parent));
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            /// Any placement sequence keeps every parent at or below
            /// width and all sibling slots unique.
            #[test]
            fn prop_slots_unique_and_bounded(width in 1u32..5, count in 1usize..60) {
                let mut tree = MemTree::default();
                let root = Uuid::new_v4();
                for _ in 0..count {
                    let slot = find_open_slot(&tree, &[root], width, 64)
                        .unwrap()
                        .expect("tree grows, slot always exists");
                    tree.add_child(slot.parent, slot.slot_index);
                }
                for children in tree.children.values() {
                    prop_assert!(children.len() <= width as usize);
                    let mut slots: Vec<u32> =
                        children.iter().map(|c| c.slot_index).collect();
                    slots.sort_unstable();
                    slots.dedup();
                    prop_assert_eq!(slots.len(), children.len());
                }
            }

            /// Spillover fills shallower levels completely before any
            /// deeper slot is used.
            #[test]
            fn prop_fill_is_breadth_first(width in 1u32..4, count in 1usize..40) {
                let mut tree = MemTree::default();
                let root = Uuid::new_v4();
                let mut depth_of: HashMap<PositionId, u32> = HashMap::new();
                depth_of.insert(root, 0);
                let mut last_depth = 0u32;
                for _ in 0..count {
                    let slot = find_open_slot(&tree, &[root], width, 64)
                        .unwrap()
                        .expect("slot");
                    let parent_depth = depth_of[&slot.parent];
                    let id = tree.add_child(slot.parent, slot.slot_index);
                    depth_of.insert(id, parent_depth + 1);
                    // Depth never decreases across a fill sequence.
                    prop_assert!(parent_depth + 1 >= last_depth);
                    last_depth = parent_depth + 1;
                }
            }
        }
    }
}
