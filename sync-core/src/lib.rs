//! # sync-core
//!
//! Pure logic for rtsync (no I/O, instant tests).
//!
//! This crate implements the state machines and algorithms of the sync
//! engine without any network access, timers or clocks of its own, enabling
//! fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input (including the
//! current time) and produce output without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (channels, timers, cache writes) is performed by
//! `sync-client`, which interprets the actions produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod debounce;
pub mod health;
pub mod ledger;
pub mod scheduler;
pub mod state;
pub mod subscription;

pub use backoff::{RetryDecision, RetryPolicy, DEFAULT_MAX_DELAY};
pub use debounce::{Debouncer, DEFAULT_DEBOUNCE_WINDOW};
pub use health::{ConnectionHealth, HealthSnapshot, HealthVerdict, DEFAULT_FAILURE_THRESHOLD};
pub use ledger::{OptimisticLedger, PendingUpdate, DEFAULT_MATCH_WINDOW, DEFAULT_PENDING_TIMEOUT};
pub use scheduler::DeadlineQueue;
pub use state::{Action, Event, Lifecycle, SubscriptionState};
pub use subscription::{Predicate, PredicateOp, Priority, SubscriptionConfig, SubscriptionStatus};
