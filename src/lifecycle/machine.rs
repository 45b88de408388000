//! Pure transition rules for one tenant's connection.
//!
//! [`decide`] maps the current state and one connection update to the side
//! effect the driver must perform. It never touches I/O, so every rule is
//! testable without a runtime.

use crate::network::{ConnectionUpdate, DEFAULT_FATAL_STATUSES};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

/// Where a tenant's connection stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    /// Handshake in progress without credentials; a pairing code is pending.
    AwaitingPairCode,
    Connected,
    /// Closed with a recoverable status; a reconnect is scheduled.
    ClosedTransient,
    /// Closed for good; eviction follows.
    ClosedFatal,
    Evicted,
}

impl SessionState {
    /// No automatic transition leaves a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::ClosedFatal | Self::Evicted)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::AwaitingPairCode => "awaiting_pair_code",
            Self::Connected => "connected",
            Self::ClosedTransient => "closed_transient",
            Self::ClosedFatal => "closed_fatal",
            Self::Evicted => "evicted",
        }
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Why a tenant is being evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    /// The network closed the connection with a fatal status.
    FatalStatus(u16),
    /// The network claimed the connection was open while the socket was not.
    PhantomOpen,
}

impl Display for EvictReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FatalStatus(status) => write!(f, "closed with status {}", status),
            Self::PhantomOpen => write!(f, "reported open without a live transport"),
        }
    }
}

/// What the driver does in response to one update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Move to `AwaitingPairCode` and ask the network for a pairing code.
    RequestPairCode,
    /// Register the handle and move to `Connected`.
    Register,
    /// Queue the rotated credentials for writing.
    PersistCredentials,
    /// Move to `ClosedTransient`, back off, reconnect.
    Reconnect { status: u16 },
    /// Move to `ClosedFatal`, then `Evicted`.
    Evict(EvictReason),
    Ignore,
}

impl Decision {
    /// The state the driver enters when carrying out this decision.
    pub fn target(self) -> Option<SessionState> {
        match self {
            Self::RequestPairCode => Some(SessionState::AwaitingPairCode),
            Self::Register => Some(SessionState::Connected),
            Self::Reconnect { .. } => Some(SessionState::ClosedTransient),
            Self::Evict(_) => Some(SessionState::ClosedFatal),
            Self::PersistCredentials | Self::Ignore => None,
        }
    }
}

/// Which close statuses are fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosePolicy {
    fatal: BTreeSet<u16>,
}

impl ClosePolicy {
    pub fn new(fatal: impl IntoIterator<Item = u16>) -> Self {
        Self {
            fatal: fatal.into_iter().collect(),
        }
    }

    pub fn is_fatal(&self, status: u16) -> bool {
        self.fatal.contains(&status)
    }
}

impl Default for ClosePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_FATAL_STATUSES)
    }
}

/// Facts the driver samples right before deciding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecideContext {
    /// A credential record exists on disk for the tenant.
    pub credentials_present: bool,
}

/// Maps `(state, update)` to the driver's next action.
pub fn decide(
    state: SessionState,
    update: &ConnectionUpdate,
    context: DecideContext,
    policy: &ClosePolicy,
) -> Decision {
    if state.is_terminal() || state == SessionState::ClosedTransient {
        return Decision::Ignore;
    }

    match update {
        ConnectionUpdate::Connecting => {
            if state == SessionState::Initializing && !context.credentials_present {
                Decision::RequestPairCode
            } else {
                Decision::Ignore
            }
        }
        ConnectionUpdate::Open { transport_open } => {
            if !transport_open {
                Decision::Evict(EvictReason::PhantomOpen)
            } else if state == SessionState::Connected {
                Decision::Ignore
            } else {
                Decision::Register
            }
        }
        ConnectionUpdate::Closed { status } => {
            if policy.is_fatal(*status) {
                Decision::Evict(EvictReason::FatalStatus(*status))
            } else {
                Decision::Reconnect { status: *status }
            }
        }
        ConnectionUpdate::CredentialsUpdated(_) => Decision::PersistCredentials,
    }
}

#[cfg(test)]
#[path = "tests/machine_tests.rs"]
mod tests;
