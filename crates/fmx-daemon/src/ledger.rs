//! Ledger collaborator seam.
//!
//! The engine talks to the payments ledger through the [`Ledger`]
//! trait: `credit` writes a transaction and the matching balance
//! update atomically, `find_transaction` is the at-most-once guard the
//! cascade checks before every credit. Deployments pointing at a real
//! payments service implement the trait over its API; the bundled
//! [`SqliteLedger`] keeps the same contract in the engine database and
//! backs the standalone deployment and the test suite.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};
use fmx_core::commission::CommissionKind;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::debug;

/// Errors raised by ledger operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerError {
    /// The beneficiary does not exist. Validation-class: the cascade
    /// logs it, flags the credit for admin review, and continues with
    /// the remaining ancestors.
    #[error("beneficiary account missing: {user_id}")]
    BeneficiaryMissing {
        /// The unknown user id.
        user_id: String,
    },

    /// The ledger service could not be reached (or timed out).
    /// Transient-class: the entry stays unprocessed and the next run
    /// retries it; the idempotency check makes the retry safe.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    /// Storage failure inside the durable ledger.
    #[error("ledger storage error: {0}")]
    Storage(String),
}

/// A recorded ledger transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    /// Deterministic reference, see [`fmx_core::commission::reference_id`].
    pub reference_id: String,
    /// Credit kind (part of the idempotency key).
    pub kind: CommissionKind,
    /// Credited user.
    pub user_id: String,
    /// Amount in minor units.
    pub amount: i64,
    /// When the credit was recorded.
    pub created_at: DateTime<Utc>,
}

/// Payments ledger contract.
pub trait Ledger: Send + Sync {
    /// Credits `amount` to `user_id`, recording a transaction under
    /// `(reference_id, kind)`. Must be atomic with the balance update.
    ///
    /// # Errors
    ///
    /// [`LedgerError::BeneficiaryMissing`] for unknown users,
    /// [`LedgerError::Unavailable`] for transient outages.
    fn credit(
        &self,
        user_id: &str,
        amount: i64,
        kind: CommissionKind,
        reference_id: &str,
    ) -> Result<TransactionRecord, LedgerError>;

    /// At-most-once guard: returns the existing transaction for
    /// `(reference_id, kind)`, if any.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Unavailable`] for transient outages.
    fn find_transaction(
        &self,
        reference_id: &str,
        kind: CommissionKind,
    ) -> Result<Option<TransactionRecord>, LedgerError>;
}

/// Durable ledger in the engine database.
#[derive(Debug, Clone)]
pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedger {
    /// Wraps a shared connection (typically
    /// [`crate::store::SqliteStore::connection`], so ledger rows live
    /// next to the engine tables).
    #[must_use]
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.conn
            .lock()
            .map_err(|_| LedgerError::Storage("connection lock poisoned".to_string()))
    }

    /// Current balance for a user; 0 for users never credited.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Storage`] on query failure.
    pub fn balance(&self, user_id: &str) -> Result<i64, LedgerError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT balance FROM ledger_balance WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| LedgerError::Storage(e.to_string()))
        .map(|b| b.unwrap_or(0))
    }

    /// Total number of recorded transactions, for replay assertions.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Storage`] on query failure.
    pub fn transaction_count(&self) -> Result<u64, LedgerError> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM ledger_transaction", [], |row| {
                row.get(0)
            })
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        Ok(count.max(0) as u64)
    }
}

impl Ledger for SqliteLedger {
    fn credit(
        &self,
        user_id: &str,
        amount: i64,
        kind: CommissionKind,
        reference_id: &str,
    ) -> Result<TransactionRecord, LedgerError> {
        let now = Utc::now();
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| LedgerError::Storage(e.to_string()))?;

        let known: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM users WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        if known.is_none() {
            return Err(LedgerError::BeneficiaryMissing {
                user_id: user_id.to_string(),
            });
        }

        // Second line of defense behind the caller's find_transaction
        // check: the primary key makes a duplicate credit a no-op.
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO ledger_transaction
                     (reference_id, kind, user_id, amount, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    reference_id,
                    kind.as_str(),
                    user_id,
                    amount,
                    now.timestamp_millis()
                ],
            )
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        if inserted == 1 {
            tx.execute(
                "INSERT INTO ledger_balance (user_id, balance) VALUES (?1, ?2)
                 ON CONFLICT(user_id) DO UPDATE SET balance = balance + ?2",
                params![user_id, amount],
            )
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        }
        tx.commit().map_err(|e| LedgerError::Storage(e.to_string()))?;

        debug!(
            user_id = %user_id,
            amount,
            kind = kind.as_str(),
            reference_id = %reference_id,
            duplicate = inserted == 0,
            "ledger credit"
        );

        Ok(TransactionRecord {
            reference_id: reference_id.to_string(),
            kind,
            user_id: user_id.to_string(),
            amount,
            created_at: now,
        })
    }

    fn find_transaction(
        &self,
        reference_id: &str,
        kind: CommissionKind,
    ) -> Result<Option<TransactionRecord>, LedgerError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT user_id, amount, created_at FROM ledger_transaction
             WHERE reference_id = ?1 AND kind = ?2",
            params![reference_id, kind.as_str()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )
        .optional()
        .map_err(|e| LedgerError::Storage(e.to_string()))?
        .map(|(user_id, amount, created_ms)| {
            let created_at = Utc
                .timestamp_millis_opt(created_ms)
                .single()
                .ok_or_else(|| LedgerError::Storage(format!("bad timestamp {created_ms}")))?;
            Ok(TransactionRecord {
                reference_id: reference_id.to_string(),
                kind,
                user_id,
                amount,
                created_at,
            })
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use crate::store::SqliteStore;

    use super::*;

    fn ledger_with_user() -> (SqliteStore, SqliteLedger) {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_user("u1", "alice", None).unwrap();
        let ledger = SqliteLedger::new(store.connection());
        (store, ledger)
    }

    #[test]
    fn test_credit_updates_balance_and_record() {
        let (_store, ledger) = ledger_with_user();
        ledger
            .credit("u1", 1_000, CommissionKind::Referral, "REFERRAL:p1:u1")
            .unwrap();

        assert_eq!(ledger.balance("u1").unwrap(), 1_000);
        let found = ledger
            .find_transaction("REFERRAL:p1:u1", CommissionKind::Referral)
            .unwrap()
            .unwrap();
        assert_eq!(found.amount, 1_000);
        assert_eq!(found.user_id, "u1");
    }

    #[test]
    fn test_duplicate_reference_does_not_double_credit() {
        let (_store, ledger) = ledger_with_user();
        ledger
            .credit("u1", 500, CommissionKind::Cycle, "CYCLE:p1:u1")
            .unwrap();
        ledger
            .credit("u1", 500, CommissionKind::Cycle, "CYCLE:p1:u1")
            .unwrap();

        assert_eq!(ledger.balance("u1").unwrap(), 500);
        assert_eq!(ledger.transaction_count().unwrap(), 1);
    }

    #[test]
    fn test_same_reference_different_kind_is_distinct() {
        let (_store, ledger) = ledger_with_user();
        ledger
            .credit("u1", 100, CommissionKind::Referral, "ref-1")
            .unwrap();
        ledger
            .credit("u1", 300, CommissionKind::Cycle, "ref-1")
            .unwrap();
        assert_eq!(ledger.balance("u1").unwrap(), 400);
        assert_eq!(ledger.transaction_count().unwrap(), 2);
    }

    #[test]
    fn test_missing_beneficiary_is_typed() {
        let (_store, ledger) = ledger_with_user();
        let err = ledger
            .credit("ghost", 100, CommissionKind::Referral, "ref-2")
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::BeneficiaryMissing { user_id } if user_id == "ghost"
        ));
        // Nothing was recorded.
        assert_eq!(ledger.transaction_count().unwrap(), 0);
    }
}
