//! # sync-client
//!
//! Client engine for rtsync real-time synchronization.
//!
//! This is the main library that applications use to keep a local cache in
//! sync with a server-of-record.
//!
//! ## Features
//!
//! - **Resilient Subscriptions**: per-topic channels with exponential backoff and a retry budget
//! - **Optimistic Updates**: speculative writes with confirmation, timeout and rollback
//! - **Cache Synchronization**: idempotent apply of change events, derived-query invalidation
//! - **Debounced Notifications**: bursts on a topic collapse into one listener call
//! - **Health Monitoring**: mass reconnect after repeated failing intervals
//! - **Transport Abstraction**: Pluggable transport layer (mock included)
//! - **Pure State Machines**: Uses sync-core for side-effect-free logic
//!
//! ## Example
//!
//! ```ignore
//! use sync_client::{EngineConfig, InMemoryCache, MockTransport, SyncEngine};
//!
//! let config = EngineConfig::from_file("rtsync.toml".as_ref())?;
//! let engine = SyncEngine::new(config, MockTransport::new(), InMemoryCache::new())?;
//!
//! // Listen for changes on a topic
//! let subscription = engine.subscribe(engine.config().subscription("orders"), |notification| {
//!     println!("{:?}", notification);
//! })?;
//!
//! // Tear everything down
//! engine.shutdown().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod config;
mod dispatcher;
mod engine;
pub mod error;
mod locks;
mod monitor;
pub mod optimistic;
mod registry;
pub mod synchronizer;
pub mod transport;

pub use cache::{Cache, InMemoryCache};
pub use config::{ConfigError, DispatcherConfig, EngineConfig, HealthConfig, LedgerConfig};
pub use dispatcher::SyncNotification;
pub use engine::{EngineStatus, SubscriptionHandle, SyncEngine};
pub use error::EngineError;
pub use optimistic::{
    confirm_with, ConfirmError, ConfirmFuture, SpeculativeWrite, UpdateHandle, UpdateOutcome,
};
pub use registry::{Listener, ListenerId};
pub use synchronizer::CacheSynchronizer;
pub use transport::{
    Channel, ChannelId, ChannelMessage, ChannelStatus, MockTransport, Transport, TransportError,
};

// Types listeners and configs are built from
pub use sync_core::{
    HealthSnapshot, HealthVerdict, Predicate, PredicateOp, Priority, RetryPolicy,
    SubscriptionConfig, SubscriptionState, SubscriptionStatus,
};
pub use sync_types::{ChangeEvent, EntityId, EventFilter, EventKind, Origin, Topic, UpdateId};
