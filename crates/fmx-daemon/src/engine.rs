//! Queue-driven placement engine: the single-flight orchestrator.
//!
//! One run drains the entry queue under the CAS lock: for each entry,
//! in strict `(enqueued_at, id)` order, the run places the entrant
//! (breadth-first spillover), cascades referral credits up the sponsor
//! chain, detects cycle completions by walking up from the new leaf,
//! and finalizes the entry, advancing the resume cursor after every
//! entry rather than at batch end.
//!
//! # Error taxonomy
//!
//! - **Validation** (unknown user/level/sponsor, full non-recycling
//!   level): the entry is marked failed with a reason and the run
//!   continues. Never retried automatically.
//! - **Transient** (ledger unavailable): the entry stays unprocessed
//!   and the run ends normally; the next run retries it. The recorded
//!   `placed_position_id` and the ledger idempotency check make the
//!   retry at-most-once.
//! - **Structural** (slot collision, over-wide parent, broken parent
//!   pointer): the run aborts and the lock is left stuck for admin
//!   inspection. Silently continuing could mis-cascade commissions.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use fmx_core::commission::{plan_cycle_credit, plan_referral_cascade, CommissionCredit};
use fmx_core::cron::{CronError, CronState, RunReport};
use fmx_core::cycle::{detect_cycles, AncestorSubtree};
use fmx_core::level::{LevelConfig, LevelRegistry};
use fmx_core::placement::{find_open_slot_cached, FrontierCache, PlacementError};
use fmx_core::position::{MatrixPosition, PositionStatus};
use fmx_core::queue::{EntryId, EntryType, QueueEntry};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::{EngineSettings, RootPolicy};
use crate::ledger::{Ledger, LedgerError};
use crate::notify::NotificationEmitter;
use crate::store::{SqliteStore, StoreError};

/// Hard bound on entries finalized in one run. Re-entries enqueued
/// mid-run are drained in the same run; this bound keeps a
/// pathological re-entry storm from pinning the lock forever.
pub const MAX_ENTRIES_PER_RUN: u64 = 10_000;

/// Errors that abort a run.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Another run holds the lock. Normal contention, mapped to 409 by
    /// the admin surface.
    #[error(transparent)]
    AlreadyRunning(CronError),

    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Matrix tree invariant violation. The lock is left stuck.
    #[error("structural error: {detail}")]
    Structural {
        /// Full context for the admin log.
        detail: String,
    },

    /// Invalid operator input (unknown level, bad entry type). Mapped
    /// to 400 by the admin surface.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Operator-facing status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CronStatus {
    /// Current state, with the elapsed-time stuck heuristic applied.
    pub state: CronState,
    /// Raw lock flag.
    pub active: bool,
    /// Start of the current or most recent run.
    pub last_run: Option<DateTime<Utc>>,
    /// Resume cursor.
    pub last_processed_entry_id: Option<EntryId>,
    /// Entries awaiting processing.
    pub pending: u64,
}

/// Outcome of processing one entry.
enum EntryOutcome {
    /// Placed and fully settled.
    Settled { cycles: u64, credits: u64 },
    /// Validation failure; entry marked failed.
    Invalid(String),
    /// Transient failure; entry left pending for the next run.
    Deferred(String),
}

/// Outcome of one guarded ledger credit.
enum CreditOutcome {
    Applied,
    /// Already recorded, or beneficiary flagged for admin review.
    Skipped,
    /// Ledger unreachable; retry next run.
    Deferred(String),
}

/// The placement/cycling engine. Cheap to clone-share via `Arc`; all
/// methods take `&self`.
pub struct MatrixEngine {
    store: SqliteStore,
    registry: LevelRegistry,
    settings: EngineSettings,
    ledger: Arc<dyn Ledger>,
    notifier: Arc<dyn NotificationEmitter>,
    frontier: Mutex<FrontierCache>,
}

impl MatrixEngine {
    /// Builds an engine over an opened store.
    #[must_use]
    pub fn new(
        store: SqliteStore,
        registry: LevelRegistry,
        settings: EngineSettings,
        ledger: Arc<dyn Ledger>,
        notifier: Arc<dyn NotificationEmitter>,
    ) -> Self {
        Self {
            store,
            registry,
            settings,
            ledger,
            notifier,
            frontier: Mutex::new(FrontierCache::new()),
        }
    }

    /// The underlying store, for the admin surface's queue CRUD.
    #[must_use]
    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    /// Acquires the run lock.
    ///
    /// # Errors
    ///
    /// [`EngineError::AlreadyRunning`] when another run holds it.
    pub fn acquire(&self) -> Result<(), EngineError> {
        match self.store.try_acquire_lock(Utc::now())? {
            Ok(()) => Ok(()),
            Err(rejection) => Err(EngineError::AlreadyRunning(rejection)),
        }
    }

    /// Acquires the lock and drains the queue.
    ///
    /// # Errors
    ///
    /// [`EngineError::AlreadyRunning`] on contention; structural and
    /// storage errors abort the run with the lock left stuck.
    pub fn run(&self) -> Result<RunReport, EngineError> {
        self.acquire()?;
        self.run_acquired()
    }

    /// Drains the queue assuming the caller already holds the lock
    /// (used by the admin endpoint, which acquires synchronously so it
    /// can answer 409 before spawning the drain).
    ///
    /// # Errors
    ///
    /// Structural and storage errors; the lock is marked stuck before
    /// returning them.
    pub fn run_acquired(&self) -> Result<RunReport, EngineError> {
        match self.drain() {
            Ok(report) => {
                self.store.release_lock()?;
                info!(
                    processed = report.processed,
                    placed = report.placed,
                    cycles = report.cycles,
                    credits = report.credits,
                    failed = report.failed,
                    "queue run complete"
                );
                Ok(report)
            },
            Err(err) => {
                error!(error = %err, "queue run aborted; lock left stuck for inspection");
                if let Err(lock_err) = self.store.mark_lock_stuck() {
                    error!(error = %lock_err, "failed to mark lock stuck");
                }
                Err(err)
            },
        }
    }

    /// Operator status snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] on read failure.
    pub fn status(&self) -> Result<CronStatus, EngineError> {
        let lock = self.store.lock_state()?;
        // stuck_after_secs comes from operator config; out-of-range
        // values degrade to "never stuck" instead of panicking.
        let stuck_after = i64::try_from(self.settings.stuck_after_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX);
        Ok(CronStatus {
            state: lock.state(Utc::now(), stuck_after),
            active: lock.active,
            last_run: lock.last_run,
            last_processed_entry_id: lock.last_processed_entry_id,
            pending: self.store.count_pending()?,
        })
    }

    /// Operator override: clears the lock, cursor untouched.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] on write failure.
    pub fn force_unlock(&self) -> Result<(), EngineError> {
        self.store.force_unlock()?;
        warn!("run lock force-unlocked by operator");
        Ok(())
    }

    fn drain(&self) -> Result<RunReport, EngineError> {
        let mut report = RunReport::default();
        'runs: while report.processed < MAX_ENTRIES_PER_RUN {
            let batch = self.store.fetch_pending(self.settings.batch_size)?;
            if batch.is_empty() {
                break;
            }
            for entry in batch {
                if report.processed >= MAX_ENTRIES_PER_RUN {
                    break 'runs;
                }
                match self.process_entry(&entry)? {
                    EntryOutcome::Settled { cycles, credits } => {
                        self.store.mark_processed(entry.id, Utc::now())?;
                        self.store.advance_cursor(entry.id)?;
                        report.processed += 1;
                        report.placed += 1;
                        report.cycles += cycles;
                        report.credits += credits;
                    },
                    EntryOutcome::Invalid(reason) => {
                        warn!(entry_id = entry.id, reason = %reason, "entry failed validation");
                        self.store.mark_failed(entry.id, &reason, Utc::now())?;
                        self.store.advance_cursor(entry.id)?;
                        report.processed += 1;
                        report.failed += 1;
                    },
                    EntryOutcome::Deferred(reason) => {
                        info!(
                            entry_id = entry.id,
                            reason = %reason,
                            "entry deferred; will retry next run"
                        );
                        break 'runs;
                    },
                }
            }
        }
        Ok(report)
    }

    /// Places, cascades, and cycle-checks one entry. Each mutating
    /// step is its own transaction; a transient failure partway
    /// through never rolls back an already-valid placement.
    fn process_entry(&self, entry: &QueueEntry) -> Result<EntryOutcome, EngineError> {
        let cfg = match self.registry.get(entry.level) {
            Ok(cfg) => cfg,
            Err(e) => return Ok(EntryOutcome::Invalid(e.to_string())),
        };

        let Some((_, directory_sponsor)) = self.store.find_user(&entry.user_id)? else {
            return Ok(EntryOutcome::Invalid(format!(
                "unknown user: {}",
                entry.user_id
            )));
        };
        let sponsor = entry.sponsor_hint.clone().or(directory_sponsor);
        if let Some(sponsor_id) = &sponsor {
            if self.store.find_user(sponsor_id)?.is_none() {
                return Ok(EntryOutcome::Invalid(format!(
                    "sponsor not found: {sponsor_id}"
                )));
            }
        }

        if !cfg.reentry && self.store.positions_filled(entry.level)? >= cfg.capacity() {
            return Ok(EntryOutcome::Invalid(format!(
                "matrix level {} is full",
                entry.level
            )));
        }

        // Resume guard: a retry after a transient failure reuses the
        // position it already placed instead of placing twice.
        let position = match self.store.entry_position(entry.id)? {
            Some(existing) => {
                self.store
                    .get_position(existing)?
                    .ok_or_else(|| EngineError::Structural {
                        detail: format!(
                            "entry {} references missing position {existing}",
                            entry.id
                        ),
                    })?
            },
            None => self.place(entry, cfg, sponsor.as_deref())?,
        };

        let mut credits = 0u64;
        for credit in self.referral_plan(cfg, &position, sponsor.as_deref())? {
            match self.apply_credit(&credit)? {
                CreditOutcome::Applied => {
                    credits += 1;
                    self.notifier.bonus_awarded(entry.level, &credit);
                },
                CreditOutcome::Skipped => {},
                CreditOutcome::Deferred(reason) => return Ok(EntryOutcome::Deferred(reason)),
            }
        }

        let (cycles, cycle_credits) = match self.settle_cycles(cfg, &position)? {
            Ok(counts) => counts,
            Err(deferred) => return Ok(EntryOutcome::Deferred(deferred)),
        };

        Ok(EntryOutcome::Settled {
            cycles,
            credits: credits + cycle_credits,
        })
    }

    /// Breadth-first placement: sponsor tree first, root-pool or fresh
    /// root fallback per policy.
    fn place(
        &self,
        entry: &QueueEntry,
        cfg: &LevelConfig,
        sponsor: Option<&str>,
    ) -> Result<MatrixPosition, EngineError> {
        let mut roots = match sponsor {
            Some(sponsor_id) => self.store.user_positions(sponsor_id, entry.level)?,
            None => Vec::new(),
        };
        if roots.is_empty() && self.settings.root_policy == RootPolicy::GlobalPool {
            roots = self.store.level_roots(entry.level)?;
        }

        let cache_key = sponsor.unwrap_or("__pool__");
        let slot = {
            let mut cache = self
                .frontier
                .lock()
                .map_err(|_| EngineError::Structural {
                    detail: "frontier cache lock poisoned".to_string(),
                })?;
            find_open_slot_cached(
                &self.store,
                &mut cache,
                cache_key,
                entry.level,
                &roots,
                cfg.width,
                cfg.depth,
            )
            .map_err(|e| match e {
                PlacementError::TreeInconsistent { .. }
                | PlacementError::ScanLimitExceeded { .. }
                | PlacementError::View(_) => EngineError::Structural {
                    detail: e.to_string(),
                },
                other => EngineError::Structural {
                    detail: format!("unexpected placement failure: {other}"),
                },
            })?
        };

        let now = Utc::now();
        let position = match slot {
            Some(open) => {
                let parent =
                    self.store
                        .get_position(open.parent)?
                        .ok_or_else(|| EngineError::Structural {
                            detail: format!("open slot under missing parent {}", open.parent),
                        })?;
                MatrixPosition::new_child(
                    &entry.user_id,
                    &entry.username,
                    entry.level,
                    parent.id,
                    &parent.position_path,
                    open.slot_index,
                    sponsor,
                    now,
                )
            },
            None => MatrixPosition::new_root(&entry.user_id, &entry.username, entry.level, sponsor, now),
        };

        // The insert also records the entry's resume marker, so a
        // crash right after this commit replays into the resume guard
        // instead of a second placement.
        self.store.insert_position(&position, Some(entry.id))?;
        self.notifier.position_placed(&position);
        info!(
            entry_id = entry.id,
            position_id = %position.id,
            level = entry.level,
            slot_index = position.slot_index,
            parent = ?position.parent_position_id,
            "position placed"
        );
        Ok(position)
    }

    fn referral_plan(
        &self,
        cfg: &LevelConfig,
        position: &MatrixPosition,
        sponsor: Option<&str>,
    ) -> Result<Vec<CommissionCredit>, EngineError> {
        let chain = match sponsor {
            None => Vec::new(),
            Some(sponsor_id) => {
                let mut chain = vec![sponsor_id.to_string()];
                if self.settings.cascade_depth > 1 {
                    chain.extend(
                        self.store
                            .sponsor_chain(sponsor_id, self.settings.cascade_depth - 1)?,
                    );
                }
                chain
            },
        };
        Ok(plan_referral_cascade(
            cfg,
            position.id,
            &chain,
            self.settings.cascade_depth,
        ))
    }

    /// Walks up from the new position and settles every completion,
    /// lowest ancestor first. Credits are written before the
    /// completion transaction so a crash between the two replays into
    /// the idempotency guard, never into a missed payout.
    ///
    /// Returns `Err(reason)` in the inner result for transient
    /// deferral.
    #[allow(clippy::type_complexity)]
    fn settle_cycles(
        &self,
        cfg: &LevelConfig,
        position: &MatrixPosition,
    ) -> Result<Result<(u64, u64), String>, EngineError> {
        let ancestors = self.store.ancestors_of(position, cfg.depth)?;
        let mut snapshots = Vec::with_capacity(ancestors.len());
        for ancestor in &ancestors {
            snapshots.push(AncestorSubtree {
                position_id: ancestor.id,
                owner_user_id: ancestor.user_id.clone(),
                populated: self.store.subtree_population(ancestor.id, cfg.depth)?,
                already_completed: ancestor.status == PositionStatus::Completed,
                is_root: ancestor.parent_position_id.is_none(),
            });
        }

        let mut cycles = 0u64;
        let mut credits = 0u64;
        for completion in detect_cycles(cfg, &snapshots) {
            let credit = plan_cycle_credit(cfg, completion.position_id, &completion.owner_user_id);
            match self.apply_credit(&credit)? {
                CreditOutcome::Applied => {
                    credits += 1;
                    self.notifier.bonus_awarded(cfg.level, &credit);
                },
                CreditOutcome::Skipped => {},
                CreditOutcome::Deferred(reason) => return Ok(Err(reason)),
            }

            let owner = ancestors
                .iter()
                .find(|a| a.id == completion.position_id)
                .ok_or_else(|| EngineError::Structural {
                    detail: format!("completion for unknown ancestor {}", completion.position_id),
                })?;
            let reentry = completion
                .reenter
                .then_some((
                    owner.user_id.as_str(),
                    owner.username.as_str(),
                    owner.sponsor_id.as_deref(),
                ));
            let applied = self.store.complete_position(
                completion.position_id,
                completion.payout,
                cfg.level,
                completion.resets_level_counter,
                reentry,
                Utc::now(),
            )?;
            if applied {
                cycles += 1;
                self.notifier.cycle_completed(cfg.level, &completion);
                info!(
                    position_id = %completion.position_id,
                    owner = %completion.owner_user_id,
                    level = cfg.level,
                    payout = completion.payout,
                    reenter = completion.reenter,
                    "matrix position cycled"
                );
            }
        }
        Ok(Ok((cycles, credits)))
    }

    /// One guarded ledger credit: `find_transaction` first, then
    /// `credit`. A missing beneficiary is logged and flagged, never
    /// fatal for the remaining ancestors.
    fn apply_credit(&self, credit: &CommissionCredit) -> Result<CreditOutcome, EngineError> {
        match self
            .ledger
            .find_transaction(&credit.reference_id, credit.kind)
        {
            Ok(Some(_)) => return Ok(CreditOutcome::Skipped),
            Ok(None) => {},
            Err(LedgerError::Unavailable(reason) | LedgerError::Storage(reason)) => {
                return Ok(CreditOutcome::Deferred(reason));
            },
            Err(other) => {
                return Ok(CreditOutcome::Deferred(other.to_string()));
            },
        }

        match self.ledger.credit(
            &credit.beneficiary,
            credit.amount,
            credit.kind,
            &credit.reference_id,
        ) {
            Ok(_) => Ok(CreditOutcome::Applied),
            Err(LedgerError::BeneficiaryMissing { user_id }) => {
                warn!(
                    beneficiary = %user_id,
                    reference_id = %credit.reference_id,
                    amount = credit.amount,
                    "credit skipped: beneficiary missing; flagged for admin review"
                );
                Ok(CreditOutcome::Skipped)
            },
            Err(LedgerError::Unavailable(reason) | LedgerError::Storage(reason)) => {
                Ok(CreditOutcome::Deferred(reason))
            },
            Err(other) => Ok(CreditOutcome::Deferred(other.to_string())),
        }
    }

    // ---- admin queue operations -----------------------------------------

    /// Creates a queue entry on behalf of an operator. The username
    /// and optional sponsor username must resolve in the directory and
    /// the level must be configured.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownUser`] for unresolved names; storage
    /// errors otherwise.
    pub fn create_queue_entry(
        &self,
        username: &str,
        level: u32,
        enqueued_at: Option<DateTime<Utc>>,
        entry_type: Option<EntryType>,
        sponsor_username: Option<&str>,
    ) -> Result<QueueEntry, EngineError> {
        self.registry
            .get(level)
            .map_err(|e| EngineError::InvalidRequest(e.to_string()))?;
        let user_id =
            self.store
                .find_user_by_username(username)?
                .ok_or_else(|| StoreError::UnknownUser {
                    username: username.to_string(),
                })?;
        let sponsor_id = match sponsor_username {
            None => None,
            Some(name) => Some(self.store.find_user_by_username(name)?.ok_or_else(|| {
                StoreError::UnknownUser {
                    username: name.to_string(),
                }
            })?),
        };
        Ok(self.store.enqueue(
            &user_id,
            username,
            level,
            entry_type.unwrap_or(EntryType::Admin),
            sponsor_id.as_deref(),
            enqueued_at.unwrap_or_else(Utc::now),
        )?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use fmx_core::commission::CommissionKind;
    use fmx_core::level::LevelConfig;

    use crate::ledger::{SqliteLedger, TransactionRecord};
    use crate::notify::TracingEmitter;

    use super::*;

    fn level(reentry: bool) -> LevelConfig {
        LevelConfig {
            level: 1,
            price: 100,
            width: 2,
            depth: 1,
            referral_bonus_pct: 10,
            matrix_bonus_pct: 30,
            referral_depth_table: Vec::new(),
            reentry,
        }
    }

    fn engine_with(store: SqliteStore, ledger: Arc<dyn Ledger>, reentry: bool) -> MatrixEngine {
        MatrixEngine::new(
            store,
            LevelRegistry::new(vec![level(reentry)]).unwrap(),
            EngineSettings::default(),
            ledger,
            Arc::new(TracingEmitter),
        )
    }

    fn sqlite_engine(reentry: bool) -> (MatrixEngine, SqliteLedger) {
        let store = SqliteStore::open_in_memory().unwrap();
        let ledger = SqliteLedger::new(store.connection());
        (
            engine_with(store, Arc::new(ledger.clone()), reentry),
            ledger,
        )
    }

    /// Delegates to an inner ledger, failing every call while the flag
    /// is set.
    struct FlakyLedger {
        inner: SqliteLedger,
        failing: AtomicBool,
    }

    impl Ledger for FlakyLedger {
        fn credit(
            &self,
            user_id: &str,
            amount: i64,
            kind: CommissionKind,
            reference_id: &str,
        ) -> Result<TransactionRecord, LedgerError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(LedgerError::Unavailable("simulated outage".to_string()));
            }
            self.inner.credit(user_id, amount, kind, reference_id)
        }

        fn find_transaction(
            &self,
            reference_id: &str,
            kind: CommissionKind,
        ) -> Result<Option<TransactionRecord>, LedgerError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(LedgerError::Unavailable("simulated outage".to_string()));
            }
            self.inner.find_transaction(reference_id, kind)
        }
    }

    #[test]
    fn test_unknown_user_entry_is_marked_failed() {
        let (engine, _ledger) = sqlite_engine(false);
        engine
            .store()
            .enqueue("ghost", "ghost", 1, EntryType::Purchase, None, Utc::now())
            .unwrap();

        let report = engine.run().unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.placed, 0);
        assert_eq!(engine.store().count_pending().unwrap(), 0);
    }

    #[test]
    fn test_run_rejected_while_lock_held() {
        let (engine, _ledger) = sqlite_engine(false);
        engine.acquire().unwrap();

        let err = engine.run().unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRunning(_)));
    }

    #[test]
    fn test_unknown_sponsor_hint_is_marked_failed() {
        let (engine, _ledger) = sqlite_engine(false);
        engine.store().upsert_user("u1", "alice", None).unwrap();
        engine
            .store()
            .enqueue(
                "u1",
                "alice",
                1,
                EntryType::Purchase,
                Some("nobody"),
                Utc::now(),
            )
            .unwrap();

        let report = engine.run().unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.placed, 0);
    }

    #[test]
    fn test_ledger_outage_defers_and_replay_places_once() {
        let store = SqliteStore::open_in_memory().unwrap();
        let inner = SqliteLedger::new(store.connection());
        let flaky = Arc::new(FlakyLedger {
            inner: inner.clone(),
            failing: AtomicBool::new(true),
        });
        let engine = engine_with(store, flaky.clone(), false);

        engine.store().upsert_user("s1", "sponsor", None).unwrap();
        engine
            .store()
            .upsert_user("u1", "alice", Some("s1"))
            .unwrap();
        // Sponsor holds the root so the new entrant has a referrer.
        engine
            .store()
            .enqueue("s1", "sponsor", 1, EntryType::Purchase, None, Utc::now())
            .unwrap();
        engine
            .store()
            .enqueue("u1", "alice", 1, EntryType::Purchase, None, Utc::now())
            .unwrap();

        // First run: sponsor's root placement has no credits, alice's
        // referral credit hits the outage and defers.
        let report = engine.run().unwrap();
        assert_eq!(report.placed, 1);
        assert_eq!(engine.store().count_pending().unwrap(), 1);
        // The position was placed before the outage and recorded.
        assert_eq!(engine.store().position_count(1).unwrap(), 2);

        flaky.failing.store(false, Ordering::SeqCst);
        let report = engine.run().unwrap();
        assert_eq!(report.placed, 1);
        assert_eq!(report.credits, 1);
        // No second placement for the retried entry.
        assert_eq!(engine.store().position_count(1).unwrap(), 2);
        assert_eq!(inner.balance("s1").unwrap(), 10);
        assert_eq!(engine.store().count_pending().unwrap(), 0);
    }

    #[test]
    fn test_full_level_rejects_when_reentry_disabled() {
        let (engine, _ledger) = sqlite_engine(false);
        for (id, name) in [("a", "a"), ("b", "b"), ("c", "c"), ("d", "d")] {
            engine.store().upsert_user(id, name, None).unwrap();
            engine
                .store()
                .enqueue(id, name, 1, EntryType::Purchase, None, Utc::now())
                .unwrap();
        }

        // Capacity is w^d = 2: a opens the matrix, b and c fill it
        // (cycling a's root), and with re-entry off the counter stays
        // at capacity so d is rejected.
        let report = engine.run().unwrap();
        assert_eq!(report.placed, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(report.cycles, 1);
        assert_eq!(engine.store().positions_filled(1).unwrap(), 2);
    }

    #[test]
    fn test_status_reports_pending_and_idle() {
        let (engine, _ledger) = sqlite_engine(false);
        engine.store().upsert_user("u1", "alice", None).unwrap();
        engine
            .store()
            .enqueue("u1", "alice", 1, EntryType::Purchase, None, Utc::now())
            .unwrap();

        let status = engine.status().unwrap();
        assert_eq!(status.state, CronState::Idle);
        assert_eq!(status.pending, 1);

        engine.run().unwrap();
        let status = engine.status().unwrap();
        assert_eq!(status.state, CronState::Idle);
        assert_eq!(status.pending, 0);
    }

    #[test]
    fn test_status_survives_extreme_stuck_threshold() {
        let store = SqliteStore::open_in_memory().unwrap();
        let ledger = SqliteLedger::new(store.connection());
        let settings = EngineSettings {
            stuck_after_secs: u64::MAX,
            ..EngineSettings::default()
        };
        let engine = MatrixEngine::new(
            store,
            LevelRegistry::new(vec![level(false)]).unwrap(),
            settings,
            Arc::new(ledger),
            Arc::new(TracingEmitter),
        );

        engine.acquire().unwrap();
        assert_eq!(engine.status().unwrap().state, CronState::Running);
    }

    #[test]
    fn test_create_queue_entry_resolves_usernames() {
        let (engine, _ledger) = sqlite_engine(false);
        engine.store().upsert_user("s1", "sponsor", None).unwrap();
        engine
            .store()
            .upsert_user("u1", "alice", Some("s1"))
            .unwrap();

        let entry = engine
            .create_queue_entry("alice", 1, None, None, Some("sponsor"))
            .unwrap();
        assert_eq!(entry.user_id, "u1");
        assert_eq!(entry.sponsor_hint.as_deref(), Some("s1"));
        assert_eq!(entry.entry_type, EntryType::Admin);

        let err = engine
            .create_queue_entry("nobody", 1, None, None, None)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Store(StoreError::UnknownUser { .. })
        ));

        let err = engine
            .create_queue_entry("alice", 9, None, None, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
    }
}
