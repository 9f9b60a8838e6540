//! Inbound events surfaced by the Transport
//!
//! A closed, tagged union: adding a kind is a compile-time decision that every
//! exhaustive `match` has to acknowledge. Transports that observe something the core
//! does not model report it as `Unknown`, which the dispatcher drops.

use core::fmt;
use serde::{Deserialize, Serialize};

use crate::types::{ChatId, DeviceCredential, DeviceIdentity, PairingArtifact};

// ----------------------------------------------------------------------------
// Event Payloads
// ----------------------------------------------------------------------------

/// A conversation message received from the network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingMessage {
    /// Transport-assigned message id
    pub id: String,
    /// Conversation the message belongs to; replies are addressed here
    pub chat: ChatId,
    /// Display name or address of the author
    pub sender: String,
    /// Text body (empty for non-text messages)
    pub body: String,
    /// Receive time in milliseconds since UNIX epoch
    pub timestamp_ms: u64,
}

impl IncomingMessage {
    pub fn new(
        id: impl Into<String>,
        chat: ChatId,
        sender: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            chat,
            sender: sender.into(),
            body: body.into(),
            timestamp_ms: crate::types::now_millis(),
        }
    }
}

// ----------------------------------------------------------------------------
// Inbound Event
// ----------------------------------------------------------------------------

/// One occurrence reported by the Transport; consumed exactly once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InboundEvent {
    /// Conversation message received
    Message(IncomingMessage),
    /// Session established with the network
    Connected { identity: Option<DeviceIdentity> },
    /// Link dropped (remote close or network failure)
    ConnectionLost { reason: String },
    /// A new pairing artifact was issued, superseding earlier ones
    PairingCode(PairingArtifact),
    /// Operator confirmed pairing on the primary device
    PairingConfirmed {
        identity: DeviceIdentity,
        credential: DeviceCredential,
    },
    /// Pairing was aborted by the network or the operator
    PairingCancelled { reason: String },
    /// The network replaced the session material; the stored row must be overwritten
    CredentialRotated { credential: DeviceCredential },
    /// The stored session is no longer valid (logged out remotely, revoked)
    CredentialRevoked { reason: String },
    /// Anything the core does not model
    Unknown { kind: String },
}

/// Discriminant of [`InboundEvent`], used for handler routing and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Message,
    Connected,
    ConnectionLost,
    PairingCode,
    PairingConfirmed,
    PairingCancelled,
    CredentialRotated,
    CredentialRevoked,
    Unknown,
}

impl InboundEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            InboundEvent::Message(_) => EventKind::Message,
            InboundEvent::Connected { .. } => EventKind::Connected,
            InboundEvent::ConnectionLost { .. } => EventKind::ConnectionLost,
            InboundEvent::PairingCode(_) => EventKind::PairingCode,
            InboundEvent::PairingConfirmed { .. } => EventKind::PairingConfirmed,
            InboundEvent::PairingCancelled { .. } => EventKind::PairingCancelled,
            InboundEvent::CredentialRotated { .. } => EventKind::CredentialRotated,
            InboundEvent::CredentialRevoked { .. } => EventKind::CredentialRevoked,
            InboundEvent::Unknown { .. } => EventKind::Unknown,
        }
    }

    /// Whether this event ends the current connection epoch
    pub fn ends_epoch(&self) -> bool {
        matches!(
            self,
            InboundEvent::ConnectionLost { .. } | InboundEvent::CredentialRevoked { .. }
        )
    }
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Message => "message",
            EventKind::Connected => "connected",
            EventKind::ConnectionLost => "connection_lost",
            EventKind::PairingCode => "pairing_code",
            EventKind::PairingConfirmed => "pairing_confirmed",
            EventKind::PairingCancelled => "pairing_cancelled",
            EventKind::CredentialRotated => "credential_rotated",
            EventKind::CredentialRevoked => "credential_revoked",
            EventKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
