//! Single-flight run-lock state machine.
//!
//! The queue drain is guarded by a singleton lock row. This module is
//! the pure state machine over that row; the daemon's store gives the
//! acquire path compare-and-swap semantics (a guarded `UPDATE`) so two
//! simultaneous triggers cannot both enter `Running`.
//!
//! # States
//!
//! - `Idle -> Running` via [`CronLock::try_start`]
//! - `Running -> Idle` via [`CronLock::complete`] (happy path)
//! - `Running -> Stuck` via [`CronLock::mark_stuck`] (structural error)
//!   or the elapsed-time heuristic in [`CronLock::state`] (crash)
//! - `Stuck -> Idle` via [`CronLock::force_unlock`] only
//!
//! `force_unlock` never touches the resume cursor: reprocessing a
//! partially handled entry is safe because every credit is guarded by
//! the ledger idempotency check.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::EntryId;

/// Observable state of the run lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CronState {
    /// No run in progress.
    Idle,
    /// A run holds the lock.
    Running,
    /// The lock is held but the run is presumed dead (explicit mark or
    /// elapsed-time heuristic). Manual unlock required.
    Stuck,
}

impl CronState {
    /// Stable string form for status payloads.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
            Self::Stuck => "STUCK",
        }
    }
}

/// Errors raised by lock transitions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CronError {
    /// A run already holds the lock.
    #[error("queue run already active (since {since:?})")]
    AlreadyRunning {
        /// When the active run started, if known.
        since: Option<DateTime<Utc>>,
    },
}

/// The singleton lock row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronLock {
    /// True while a run holds the lock.
    pub active: bool,
    /// Set when a run aborted on a structural error.
    pub stuck: bool,
    /// Start time of the current or most recent run.
    pub last_run: Option<DateTime<Utc>>,
    /// Resume cursor: id of the last finalized queue entry.
    pub last_processed_entry_id: Option<EntryId>,
}

impl CronLock {
    /// Acquires the lock.
    ///
    /// # Errors
    ///
    /// Returns [`CronError::AlreadyRunning`] when the lock is held,
    /// including stuck locks: a stuck lock must be explicitly cleared
    /// by an operator, never silently stolen.
    pub fn try_start(&mut self, now: DateTime<Utc>) -> Result<(), CronError> {
        if self.active {
            return Err(CronError::AlreadyRunning {
                since: self.last_run,
            });
        }
        self.active = true;
        self.stuck = false;
        self.last_run = Some(now);
        Ok(())
    }

    /// Releases the lock after a normal run.
    pub fn complete(&mut self) {
        self.active = false;
        self.stuck = false;
    }

    /// Flags the current run as dead without releasing the lock, so
    /// the next trigger is rejected until an operator inspects the
    /// failure.
    pub fn mark_stuck(&mut self) {
        self.stuck = true;
    }

    /// Operator override: clears the lock, leaving the cursor intact.
    pub fn force_unlock(&mut self) {
        self.active = false;
        self.stuck = false;
    }

    /// Advances the resume cursor past a finalized entry.
    pub fn advance_cursor(&mut self, entry_id: EntryId) {
        self.last_processed_entry_id = Some(entry_id);
    }

    /// Current state, applying the elapsed-time stuck heuristic: a
    /// lock held longer than `stuck_after` is reported stuck even
    /// without an explicit mark (crashed run).
    #[must_use]
    pub fn state(&self, now: DateTime<Utc>, stuck_after: Duration) -> CronState {
        if !self.active {
            return CronState::Idle;
        }
        if self.stuck {
            return CronState::Stuck;
        }
        match self.last_run {
            Some(started) if now - started > stuck_after => CronState::Stuck,
            _ => CronState::Running,
        }
    }
}

/// Counters for one queue drain, logged and returned to the admin
/// surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// Entries finalized this run (success or failure).
    pub processed: u64,
    /// Positions created.
    pub placed: u64,
    /// Cycle completions.
    pub cycles: u64,
    /// Ledger credits written (idempotent skips excluded).
    pub credits: u64,
    /// Entries marked failed.
    pub failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_complete_round_trip() {
        let mut lock = CronLock::default();
        let now = Utc::now();

        lock.try_start(now).unwrap();
        assert!(lock.active);
        assert_eq!(lock.last_run, Some(now));
        assert_eq!(lock.state(now, Duration::minutes(10)), CronState::Running);

        lock.complete();
        assert_eq!(lock.state(now, Duration::minutes(10)), CronState::Idle);
    }

    #[test]
    fn test_double_start_is_rejected() {
        let mut lock = CronLock::default();
        let now = Utc::now();
        lock.try_start(now).unwrap();

        let err = lock.try_start(now).unwrap_err();
        assert_eq!(err, CronError::AlreadyRunning { since: Some(now) });
    }

    #[test]
    fn test_stuck_lock_rejects_start_until_unlocked() {
        let mut lock = CronLock::default();
        let now = Utc::now();
        lock.try_start(now).unwrap();
        lock.mark_stuck();

        assert_eq!(lock.state(now, Duration::minutes(10)), CronState::Stuck);
        assert!(lock.try_start(now).is_err());

        lock.force_unlock();
        assert_eq!(lock.state(now, Duration::minutes(10)), CronState::Idle);
        lock.try_start(now).unwrap();
    }

    #[test]
    fn test_force_unlock_preserves_cursor() {
        let mut lock = CronLock::default();
        lock.try_start(Utc::now()).unwrap();
        lock.advance_cursor(42);
        lock.force_unlock();

        assert_eq!(lock.last_processed_entry_id, Some(42));
        assert!(!lock.active);
    }

    #[test]
    fn test_elapsed_time_heuristic_reports_stuck() {
        let mut lock = CronLock::default();
        let started = Utc::now();
        lock.try_start(started).unwrap();

        let soon = started + Duration::minutes(1);
        assert_eq!(lock.state(soon, Duration::minutes(10)), CronState::Running);

        let much_later = started + Duration::hours(2);
        assert_eq!(
            lock.state(much_later, Duration::minutes(10)),
            CronState::Stuck
        );
    }
}
