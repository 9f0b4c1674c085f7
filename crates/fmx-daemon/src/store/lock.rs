//! Singleton run-lock persistence.
//!
//! Acquisition is a single guarded `UPDATE ... WHERE active = 0`: the
//! row-level write lock in `SQLite` makes the check-and-set atomic, so
//! two simultaneous triggers cannot both observe `active = 0`. The
//! pure state machine lives in [`fmx_core::cron`]; this module only
//! maps it onto the `cron_lock_state` row.

use chrono::{DateTime, Utc};
use fmx_core::cron::{CronError, CronLock};
use fmx_core::queue::EntryId;
use rusqlite::params;

use super::{decode_ms, SqliteStore, StoreError};

impl SqliteStore {
    /// Reads the lock row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on query failure, or
    /// [`StoreError::Corrupt`] if the stored timestamp is unreadable.
    pub fn lock_state(&self) -> Result<CronLock, StoreError> {
        let conn = self.conn()?;
        let (active, stuck, last_run_ms, cursor): (i64, i64, Option<i64>, Option<EntryId>) = conn
            .query_row(
                "SELECT active, stuck, last_run, last_processed_entry_id
                 FROM cron_lock_state WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;
        Ok(CronLock {
            active: active != 0,
            stuck: stuck != 0,
            last_run: last_run_ms
                .map(|ms| decode_ms(ms, "cron_lock_state.last_run"))
                .transpose()?,
            last_processed_entry_id: cursor,
        })
    }

    /// Compare-and-swap lock acquisition.
    ///
    /// # Errors
    ///
    /// Returns `Ok(Err(CronError::AlreadyRunning))` when another run
    /// holds the lock (a normal rejection, not a failure), and
    /// [`StoreError::Db`] on storage failure.
    pub fn try_acquire_lock(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Result<(), CronError>, StoreError> {
        let changed = {
            let conn = self.conn()?;
            conn.execute(
                "UPDATE cron_lock_state
                 SET active = 1, stuck = 0, last_run = ?1
                 WHERE id = 1 AND active = 0",
                params![now.timestamp_millis()],
            )?
        };
        if changed == 1 {
            return Ok(Ok(()));
        }
        let held = self.lock_state()?;
        Ok(Err(CronError::AlreadyRunning {
            since: held.last_run,
        }))
    }

    /// Releases the lock after a normal run.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on write failure.
    pub fn release_lock(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE cron_lock_state SET active = 0, stuck = 0 WHERE id = 1",
            [],
        )?;
        Ok(())
    }

    /// Flags the held lock as stuck (structural failure); the lock
    /// stays held until an operator unlocks it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on write failure.
    pub fn mark_lock_stuck(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute("UPDATE cron_lock_state SET stuck = 1 WHERE id = 1", [])?;
        Ok(())
    }

    /// Operator override: clears the lock unconditionally, leaving the
    /// resume cursor untouched.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on write failure.
    pub fn force_unlock(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE cron_lock_state SET active = 0, stuck = 0 WHERE id = 1",
            [],
        )?;
        Ok(())
    }

    /// Advances the resume cursor past a finalized entry. Called after
    /// every entry, not at batch end, so a crash loses at most the
    /// in-flight entry.
    ///
    /// The cursor is operator-facing progress reporting; the fetch
    /// path resumes on the `processed` flag so deferred entries are
    /// retried even though the cursor has moved past them.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on write failure.
    pub fn advance_cursor(&self, entry_id: EntryId) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE cron_lock_state SET last_processed_entry_id = ?1 WHERE id = 1",
            params![entry_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cas_acquire_rejects_second_caller() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();

        assert!(store.try_acquire_lock(now).unwrap().is_ok());
        let rejection = store.try_acquire_lock(now).unwrap().unwrap_err();
        assert!(matches!(rejection, CronError::AlreadyRunning { .. }));

        store.release_lock().unwrap();
        assert!(store.try_acquire_lock(now).unwrap().is_ok());
    }

    #[test]
    fn test_stuck_lock_survives_until_force_unlock() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.try_acquire_lock(Utc::now()).unwrap().unwrap();
        store.mark_lock_stuck().unwrap();

        let state = store.lock_state().unwrap();
        assert!(state.active);
        assert!(state.stuck);
        assert!(store.try_acquire_lock(Utc::now()).unwrap().is_err());

        store.force_unlock().unwrap();
        let state = store.lock_state().unwrap();
        assert!(!state.active);
        assert!(!state.stuck);
    }

    #[test]
    fn test_cursor_survives_force_unlock() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.try_acquire_lock(Utc::now()).unwrap().unwrap();
        store.advance_cursor(7).unwrap();
        store.force_unlock().unwrap();

        assert_eq!(store.lock_state().unwrap().last_processed_entry_id, Some(7));
    }
}
