//! Durable storage for the engine: the signal queue and log, the delayed
//! signal scheduler table, entity snapshots and their property index.
//!
//! Two backends implement the [`Storage`] contract: [`PgStorage`] on Postgres
//! via sqlx, and [`MemoryStorage`] for tests and single-process demos.

pub mod memory;
pub mod postgres;
pub mod traits;

pub use memory::MemoryStorage;
pub use postgres::PgStorage;
pub use traits::{
    read_log, CommitReceipt, DelayedSignalStore, EntityStore, SignalLog, SignalQueue, Storage,
    TransitionCommit, TransitionStore,
};
