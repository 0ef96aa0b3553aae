//! Shared storage primitives for the saga participants.
//!
//! Every service owns its own row types and its own `sqlx` queries (an
//! invoice row looks nothing like a customer row), so this crate does not
//! try to offer a generic `EntityStore<T>`. What *is* shared across billing,
//! accounts, inventory and payments is the handful of cross-cutting
//! concerns that sit around those rows:
//!
//! - [`locks`] — per-key async mutual exclusion, so that two concurrently
//!   delivered events for the same invoice/customer/item serialize in this
//!   process before either one issues its `UPDATE ... WHERE status = ...`.
//! - [`idempotency`] — the `processed_events` / `applied_compensations`
//!   style ledger that makes at-least-once delivery safe to consume.
//! - [`dlq`] — the `failed_events` dead-letter table used once retries are
//!   exhausted.
//!
//! Production implementations are backed by `sqlx::PgPool`; in-memory
//! implementations exist for every trait so that unit and integration
//! tests can run without a database, mirroring the split `event-bus`
//! already makes between `NatsBus` and `InMemoryBus`.

pub mod dlq;
pub mod idempotency;
pub mod locks;

pub use dlq::{DeadLetterQueue, FailedEvent, InMemoryDeadLetterQueue, PostgresDeadLetterQueue};
pub use idempotency::{IdempotencyLedger, InMemoryIdempotencyLedger, PostgresIdempotencyLedger};
pub use locks::EntityLocks;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("entity not found")]
    NotFound,

    #[error("optimistic update was skipped: predicate did not match current state")]
    PredicateMismatch,
}
