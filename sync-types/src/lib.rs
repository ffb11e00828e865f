//! # sync-types
//!
//! Shared types for the rtsync real-time synchronization engine.
//!
//! This crate provides the foundational types used across all rtsync crates:
//! - [`Topic`], [`EntityId`], [`UpdateId`] - Identity types
//! - [`ChangeEvent`] - Normalized change notification from a topic
//! - [`EventKind`], [`EventFilter`], [`Origin`] - Event classification
//! - [`SyncError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod event;
mod ids;

pub use error::SyncError;
pub use event::{now_ms, ChangeEvent, EventFilter, EventKind, Origin};
pub use ids::{EntityId, Topic, UpdateId};
