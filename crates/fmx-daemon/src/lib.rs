//! Forced-matrix engine daemon.
//!
//! Wires the pure domain logic from `fmx-core` onto durable `SQLite`
//! state and exposes it two ways: an interval scheduler that drains
//! the entry queue, and an admin HTTP surface for triggering runs,
//! recovering a stuck lock, and managing the queue.
//!
//! Layering, top down:
//!
//! - [`admin`] — axum router over the engine
//! - [`engine`] — single-flight run orchestrator
//! - [`ledger`], [`notify`] — collaborator seams (durable defaults)
//! - [`store`] — `SQLite` persistence for queue, tree, and lock
//! - [`config`] — TOML level table and engine tunables

pub mod admin;
pub mod config;
pub mod engine;
pub mod ledger;
pub mod notify;
pub mod store;

pub use admin::router;
pub use config::{EngineConfig, EngineSettings, RootPolicy};
pub use engine::{CronStatus, EngineError, MatrixEngine};
pub use ledger::{Ledger, LedgerError, SqliteLedger, TransactionRecord};
pub use notify::{BroadcastEmitter, EngineEvent, NotificationEmitter, TracingEmitter};
pub use store::{QueueFilter, SqliteStore, StoreError};
