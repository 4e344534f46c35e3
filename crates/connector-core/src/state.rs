//! Connection lifecycle of one feed, independent of any I/O.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Disconnected,
    /// First attempt after start or after a fallback retry.
    Connecting,
    Streaming,
    /// Waiting out backoff and retrying.
    Reconnecting,
    FallbackPolling,
}

impl fmt::Display for FeedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FeedState::Disconnected => "DISCONNECTED",
            FeedState::Connecting => "CONNECTING",
            FeedState::Streaming => "STREAMING",
            FeedState::Reconnecting => "RECONNECTING",
            FeedState::FallbackPolling => "FALLBACK_POLLING",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedEvent {
    Start,
    Opened,
    ConnectFailed,
    /// An established stream ended.
    Closed,
    FallbackRetryDue,
    Stop,
}

/// Transition table for a feed.
///
/// Failed connects are counted until a connect succeeds. Leaving fallback
/// does not clear the count, so a failed retry goes straight back to polling.
#[derive(Debug, Clone)]
pub struct FeedStateMachine {
    state: FeedState,
    consecutive_failures: u32,
    max_failures: u32,
}

impl FeedStateMachine {
    /// `max_failures` of zero is treated as one.
    pub fn new(max_failures: u32) -> Self {
        Self {
            state: FeedState::Disconnected,
            consecutive_failures: 0,
            max_failures: max_failures.max(1),
        }
    }

    pub fn state(&self) -> FeedState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Apply `event` and return the resulting state.
    ///
    /// Events that make no sense in the current state leave it unchanged.
    pub fn on_event(&mut self, event: FeedEvent) -> FeedState {
        use FeedEvent::*;
        use FeedState::*;

        self.state = match (self.state, event) {
            (_, Stop) => Disconnected,
            (Disconnected, Start) => Connecting,
            (Connecting | Reconnecting, Opened) => {
                self.consecutive_failures = 0;
                Streaming
            }
            (Connecting | Reconnecting, ConnectFailed) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= self.max_failures {
                    FallbackPolling
                } else {
                    Reconnecting
                }
            }
            (Streaming, Closed) => Reconnecting,
            (FallbackPolling, FallbackRetryDue) => Connecting,
            (state, _) => state,
        };
        self.state
    }
}
