//! botlink Runtime Engine
//!
//! This crate drives a paired messaging device through its whole life:
//! - `LifecycleManager`: the connect / disconnect / reconnect state machine
//! - `PairingHandshake`: first-run pairing against a rotating pairing code
//! - `Dispatcher`: routes inbound events to application handlers, one epoch at a time
//! - `ShutdownCoordinator`: turns signals into a single cooperative stop
//!
//! `botlink-core` provides the stable types and collaborator traits; this crate is the
//! engine that wires them together. Use [`RuntimeBuilder`] to assemble one.

pub mod backoff;
pub mod builder;
pub mod dispatcher;
pub mod handlers;
pub mod managers;
pub mod pairing;
pub mod shutdown;

pub use backoff::Backoff;
pub use builder::{Runtime, RuntimeBuilder, RuntimeHandle};
pub use dispatcher::{DispatchCounters, DispatchStats, Dispatcher, EpochEnd};
pub use handlers::{EchoHandler, EventHandler, HandlerError, HandlerRegistry, MessageHandler};
pub use managers::{
    AuditTrail, CredentialVault, LifecycleManager, RunReport, StateChange, WriteOutcome,
};
pub use pairing::{
    ArtifactCell, LogRenderer, PairingHandshake, PairingOutcome, PairingRenderer,
};
pub use shutdown::{listen_for_signals, ShutdownCoordinator, ShutdownSignal, ShutdownTrigger};

// Re-export core types for convenience
pub use botlink_core::{
    BotlinkConfig, BotlinkError, BotlinkResult, ChatId, ConnectionState, CredentialStore,
    DeviceCredential, DeviceIdentity, EventKind, InboundEvent, IncomingMessage, OutboundReply,
    PairingArtifact, Transport,
};
