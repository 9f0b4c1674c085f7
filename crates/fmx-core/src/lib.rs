//! Core domain logic for the forced-matrix compensation engine.
//!
//! This crate contains the pure (I/O-free) half of the engine:
//!
//! - [`level`]: per-level matrix configuration and the level registry
//! - [`position`]: matrix position records and status transitions
//! - [`queue`]: pending entry records and their FIFO ordering
//! - [`placement`]: breadth-first open-slot search over an abstract tree
//!   view, plus the sponsor frontier cache
//! - [`cycle`]: subtree-completion detection as an explicit upward walk
//! - [`commission`]: referral/cycle credit planning with idempotency keys
//! - [`cron`]: the single-flight run-lock state machine
//!
//! Persistence, the orchestrator loop, and the admin surface live in
//! `fmx-daemon`. Everything here is deterministic and unit-testable
//! without a database.

pub mod commission;
pub mod cron;
pub mod cycle;
pub mod level;
pub mod placement;
pub mod position;
pub mod queue;

pub use commission::{CommissionCredit, CommissionKind};
pub use cron::{CronError, CronLock, CronState, RunReport};
pub use cycle::{AncestorSubtree, CycleCompletion};
pub use level::{LevelConfig, LevelError, LevelRegistry};
pub use placement::{ChildSlot, FrontierCache, OpenSlot, PlacementError, TreeView};
pub use position::{MatrixPosition, PositionId, PositionStatus};
pub use queue::{EntryId, EntryType, QueueEntry};
