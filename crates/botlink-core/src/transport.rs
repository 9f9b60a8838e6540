//! Transport Trait Definition
//!
//! The wire protocol, end-to-end encryption, and multi-device fan-out all live behind
//! this trait. Concrete implementations are supplied by applications (the console
//! transport in `botlink-cli`, the mock in `botlink-harness`).

use tokio::sync::mpsc;

use crate::{
    errors::{ConnectError, SendError},
    event::InboundEvent,
    types::{DeviceCredential, DeviceIdentity, OutboundReply, PairingArtifact},
};

// ----------------------------------------------------------------------------
// Inbound Event Sequence
// ----------------------------------------------------------------------------

/// Producer half handed to the transport's reader for one session
pub type EventSink = mpsc::Sender<InboundEvent>;

/// Lazy, unbounded sequence of inbound events for one session
///
/// Not restartable: once `next` returns `None` the session is over and a new sequence
/// is obtained from the next `connect`.
#[derive(Debug)]
pub struct InboundEvents {
    receiver: mpsc::Receiver<InboundEvent>,
}

impl InboundEvents {
    /// Create a linked sink/sequence pair
    pub fn channel(capacity: usize) -> (EventSink, InboundEvents) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (sender, InboundEvents { receiver })
    }

    pub fn from_receiver(receiver: mpsc::Receiver<InboundEvent>) -> Self {
        Self { receiver }
    }

    /// Wait for the next event; `None` once the transport closed the session
    pub async fn next(&mut self) -> Option<InboundEvent> {
        self.receiver.recv().await
    }

    /// Take an already buffered event without waiting
    pub fn try_next(&mut self) -> Option<InboundEvent> {
        self.receiver.try_recv().ok()
    }

    /// Stop accepting new events; already buffered ones can still be read
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

// ----------------------------------------------------------------------------
// Session
// ----------------------------------------------------------------------------

/// A live transport session
///
/// Owned by the lifecycle manager and lent to the dispatcher for one epoch.
#[derive(Debug)]
pub struct Session {
    /// Assigned identity; `None` for a pairing session that has not been confirmed yet
    pub identity: Option<DeviceIdentity>,
    /// Inbound events for this session only
    pub events: InboundEvents,
}

impl Session {
    pub fn new(identity: Option<DeviceIdentity>, events: InboundEvents) -> Self {
        Self { identity, events }
    }
}

// ----------------------------------------------------------------------------
// Transport Trait
// ----------------------------------------------------------------------------

/// Messaging network collaborator
///
/// ## Contract
///
/// - `connect(None)` opens a pairing session: the sequence yields `PairingCode` events
///   until `PairingConfirmed` (after which the same session carries normal traffic),
///   `PairingCancelled`, or the caller gives up.
/// - `connect(Some(credential))` resumes a paired device. A revoked credential fails
///   with `ConnectError::CredentialRevoked`.
/// - The runtime holds at most one session at a time and calls `disconnect` before
///   abandoning one that may still be open.
/// - `send` is fire-and-forget from the runtime's perspective; acknowledgements are the
///   transport's concern.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Establish a session, resuming with `credential` when present
    async fn connect(&self, credential: Option<&DeviceCredential>)
        -> Result<Session, ConnectError>;

    /// Close the live session, if any
    async fn disconnect(&self);

    /// Submit one reply for delivery
    async fn send(&self, reply: &OutboundReply) -> Result<(), SendError>;

    /// Request a fresh pairing artifact for the current pairing session
    async fn issue_pairing_artifact(&self) -> Result<PairingArtifact, ConnectError>;

    /// Short name for log lines
    fn name(&self) -> &str {
        "transport"
    }
}
