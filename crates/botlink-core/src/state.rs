//! Device Connection State Machine
//!
//! Pure transition function for the device lifecycle. The runtime's lifecycle manager
//! is the only caller; it feeds `LifecycleEvent`s in and publishes the resulting state.
//!
//! ```text
//! Unpaired -> AwaitingPairing -> Connecting -> Connected -> Disconnected -> Reconnecting
//!    ^              |                ^  |                                      |
//!    +--- timeout --+                |  +------- connect failed ---------------+
//!                                    +------------- retry ---------------------+
//! any -> Terminated (shutdown, absorbing)      any live state -> Unpaired (revoked)
//! ```

use core::fmt;
use serde::{Deserialize, Serialize};

use crate::errors::StateTransitionError;

// ----------------------------------------------------------------------------
// Connection State
// ----------------------------------------------------------------------------

/// Lifecycle state; exactly one instance per process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No credential stored; pairing required
    Unpaired,
    /// Pairing handshake in progress
    AwaitingPairing,
    /// Transport connect in flight
    Connecting,
    /// Live session; the dispatcher is consuming events
    Connected,
    /// Link lost; reconnect pending
    Disconnected,
    /// Waiting out the backoff delay before the next connect attempt
    Reconnecting,
    /// Shut down; absorbing
    Terminated,
}

impl ConnectionState {
    /// Initial state given whether a credential was found in the store
    pub fn initial(has_credential: bool) -> Self {
        if has_credential {
            ConnectionState::Connecting
        } else {
            ConnectionState::Unpaired
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Unpaired => "Unpaired",
            ConnectionState::AwaitingPairing => "AwaitingPairing",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Reconnecting => "Reconnecting",
            ConnectionState::Terminated => "Terminated",
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, ConnectionState::Terminated)
    }

    /// Whether replies can be submitted in this state
    pub fn can_send(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Process an event and return the transition (consumes self)
    pub fn transition(self, event: LifecycleEvent) -> Result<StateTransition, StateTransitionError> {
        use ConnectionState::*;
        use LifecycleEvent as E;

        let to = match (self, event) {
            // Shutdown is accepted everywhere; repeated requests land on Terminated again
            (_, E::Shutdown) => Terminated,
            (Terminated, _) => return Err(self.invalid(event)),

            (Unpaired, E::BeginPairing) => AwaitingPairing,

            (AwaitingPairing, E::PairingConfirmed) => Connecting,
            (AwaitingPairing, E::PairingTimedOut)
            | (AwaitingPairing, E::PairingCancelled)
            | (AwaitingPairing, E::ConnectFailed) => Unpaired,

            (Connecting, E::SessionEstablished) => Connected,
            (Connecting, E::ConnectFailed) => Reconnecting,

            (Connected, E::LinkLost) => Disconnected,

            (Disconnected, E::BeginReconnect) => Reconnecting,

            (Reconnecting, E::RetryConnect) => Connecting,

            (Connecting, E::CredentialRevoked)
            | (Connected, E::CredentialRevoked)
            | (Disconnected, E::CredentialRevoked)
            | (Reconnecting, E::CredentialRevoked) => Unpaired,

            (from, event) => return Err(from.invalid(event)),
        };

        Ok(StateTransition {
            from: self,
            to,
            event,
        })
    }

    fn invalid(self, event: LifecycleEvent) -> StateTransitionError {
        StateTransitionError::InvalidTransition {
            from_state: self.name().to_string(),
            event: event.name().to_string(),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ----------------------------------------------------------------------------
// Lifecycle Events
// ----------------------------------------------------------------------------

/// Inputs that drive the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleEvent {
    /// Pairing handshake started
    BeginPairing,
    /// Pairing confirmed and the credential persisted
    PairingConfirmed,
    /// Overall pairing timeout elapsed
    PairingTimedOut,
    /// Pairing aborted by the network or operator
    PairingCancelled,
    /// Transport session established
    SessionEstablished,
    /// Connect attempt failed or timed out
    ConnectFailed,
    /// Transport reported link loss
    LinkLost,
    /// Reconnect scheduling started
    BeginReconnect,
    /// Backoff delay elapsed
    RetryConnect,
    /// Transport reported the stored session invalid
    CredentialRevoked,
    /// Shutdown requested
    Shutdown,
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::BeginPairing => "BeginPairing",
            LifecycleEvent::PairingConfirmed => "PairingConfirmed",
            LifecycleEvent::PairingTimedOut => "PairingTimedOut",
            LifecycleEvent::PairingCancelled => "PairingCancelled",
            LifecycleEvent::SessionEstablished => "SessionEstablished",
            LifecycleEvent::ConnectFailed => "ConnectFailed",
            LifecycleEvent::LinkLost => "LinkLost",
            LifecycleEvent::BeginReconnect => "BeginReconnect",
            LifecycleEvent::RetryConnect => "RetryConnect",
            LifecycleEvent::CredentialRevoked => "CredentialRevoked",
            LifecycleEvent::Shutdown => "Shutdown",
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ----------------------------------------------------------------------------
// State Transition Results
// ----------------------------------------------------------------------------

/// Result of a state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub event: LifecycleEvent,
}

impl StateTransition {
    /// False for idempotent re-entries such as a second shutdown
    pub fn changed(&self) -> bool {
        self.from != self.to
    }

    pub fn audit_entry(&self, timestamp_ms: u64) -> AuditEntry {
        AuditEntry {
            timestamp_ms,
            from_state: self.from,
            to_state: self.to,
            event: self.event,
        }
    }
}

/// Audit trail entry for state transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp_ms: u64,
    pub from_state: ConnectionState,
    pub to_state: ConnectionState,
    pub event: LifecycleEvent,
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
