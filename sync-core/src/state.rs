//! Subscription lifecycle state machine.
//!
//! This module provides a pure, side-effect-free state machine for one topic
//! subscription. It takes channel events as input and produces a new state
//! plus a list of actions to execute.
//!
//! The actual I/O (opening channels, arming timers) is performed by
//! sync-client, not by this module.
//!
//! ```text
//! connecting ──subscribed──► connected ──closed──► disconnected
//!     │                          │                      │
//!     └────────failed────────────┴──► error             │
//!                                       │               │
//!                                 reconnect timer ◄─────┘
//!                                       ▼
//!                                 reconnecting ──opened──► connecting
//!
//! any state ──listeners gone──► removed (terminal)
//! ```

use serde::Serialize;
use std::time::Duration;

use crate::backoff::{RetryDecision, RetryPolicy};

/// Lifecycle state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    /// Channel opened, waiting for the server to confirm.
    Connecting,
    /// Server confirmed; events flow.
    Connected,
    /// Channel failed; a retry may be pending.
    Error,
    /// Retry timer fired; the channel is being reopened.
    Reconnecting,
    /// Channel closed cleanly; a reopen is pending.
    Disconnected,
    /// Last listener left. Terminal.
    Removed,
}

/// Inputs to the lifecycle machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Transport accepted the (re)open request.
    ChannelOpened,
    /// Server confirmed the subscription.
    Subscribed,
    /// Channel errored or timed out.
    ChannelFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// Channel closed without error.
    ChannelClosed,
    /// Reconnect timer fired.
    ReconnectTimer,
    /// Tear down and reopen regardless of backoff state.
    ForceReconnect,
    /// The last listener unsubscribed.
    ListenersGone,
}

/// Actions to be executed by sync-client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open a new channel for the topic.
    OpenChannel,
    /// Close the current channel.
    CloseChannel,
    /// Arm the reconnect timer.
    StartReconnectTimer {
        /// Delay before the timer fires.
        delay: Duration,
        /// Retry number (0 for a reopen after a clean close).
        attempt: u32,
    },
    /// Disarm any pending reconnect timer.
    CancelReconnect,
    /// The subscription reached `connected`.
    MarkConnected,
    /// A channel failure to feed into connection health.
    RecordFailure {
        /// Error message describing the failure.
        error: String,
    },
    /// Retry budget exhausted; surface to listeners.
    ReportPermanentFailure {
        /// Consecutive failures observed.
        failures: u32,
        /// Last error.
        error: String,
    },
}

/// Lifecycle of one subscription - NO I/O, just state transitions.
#[derive(Debug, Clone, PartialEq)]
pub struct Lifecycle {
    state: SubscriptionState,
    failures: u32,
    permanently_failed: bool,
    last_error: Option<String>,
    policy: RetryPolicy,
}

impl Lifecycle {
    /// Create a lifecycle in `connecting` (the caller opens the first channel).
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: SubscriptionState::Connecting,
            failures: 0,
            permanently_failed: false,
            last_error: None,
            policy,
        }
    }

    /// Process an event and return the new lifecycle plus actions to execute.
    ///
    /// This is a pure function - no side effects.
    pub fn on_event(mut self, event: Event) -> (Self, Vec<Action>) {
        use SubscriptionState::*;

        match (self.state, event) {
            (Removed, _) => (self, vec![]),

            (_, Event::ListenersGone) => {
                self.state = Removed;
                (self, vec![Action::CancelReconnect, Action::CloseChannel])
            }

            (_, Event::ForceReconnect) => {
                self.state = Reconnecting;
                self.failures = 0;
                self.permanently_failed = false;
                (
                    self,
                    vec![
                        Action::CancelReconnect,
                        Action::CloseChannel,
                        Action::OpenChannel,
                    ],
                )
            }

            // From Connecting
            (Connecting, Event::ChannelOpened) => (self, vec![]),
            (Connecting, Event::Subscribed) => {
                self.state = Connected;
                self.failures = 0;
                self.permanently_failed = false;
                (self, vec![Action::MarkConnected])
            }
            (Connecting, Event::ChannelClosed) => {
                self.fail("channel closed before subscription confirmed".into())
            }

            // From Connected
            (Connected, Event::ChannelClosed) => {
                self.state = Disconnected;
                let delay = self.policy.base_delay();
                (
                    self,
                    vec![
                        Action::CloseChannel,
                        Action::StartReconnectTimer { delay, attempt: 0 },
                    ],
                )
            }

            (Connecting | Connected | Reconnecting, Event::ChannelFailed { error }) => {
                self.fail(error)
            }

            // From Error / Disconnected
            (Error, Event::ReconnectTimer) if !self.permanently_failed => {
                self.state = Reconnecting;
                (self, vec![Action::OpenChannel])
            }
            (Disconnected, Event::ReconnectTimer) => {
                self.state = Reconnecting;
                (self, vec![Action::OpenChannel])
            }

            // From Reconnecting
            (Reconnecting, Event::ChannelOpened) => {
                self.state = Connecting;
                (self, vec![])
            }

            // Invalid transitions - stay in current state
            (_, _) => (self, vec![]),
        }
    }

    fn fail(mut self, error: String) -> (Self, Vec<Action>) {
        self.state = SubscriptionState::Error;
        self.failures = self.failures.saturating_add(1);
        self.last_error = Some(error.clone());

        let mut actions = vec![
            Action::CloseChannel,
            Action::RecordFailure {
                error: error.clone(),
            },
        ];
        match self.policy.on_failure(self.failures) {
            RetryDecision::Retry { delay, attempt } => {
                actions.push(Action::StartReconnectTimer { delay, attempt });
            }
            RetryDecision::GiveUp { failures } => {
                self.permanently_failed = true;
                actions.push(Action::ReportPermanentFailure { failures, error });
            }
        }
        (self, actions)
    }

    /// Current state.
    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Consecutive failures since the last `connected`.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Whether the retry budget is exhausted.
    pub fn is_permanently_failed(&self) -> bool {
        self.permanently_failed
    }

    /// Most recent channel error.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Retry policy in force.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Check if events are flowing.
    pub fn is_connected(&self) -> bool {
        self.state == SubscriptionState::Connected
    }
}
