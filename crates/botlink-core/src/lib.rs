//! botlink Core
//!
//! Foundational types for a paired-device messaging bot client: the device identity and
//! credential model, the inbound event union, the lifecycle state machine, the error
//! taxonomy, and the two collaborator traits the runtime consumes (`Transport` and
//! `CredentialStore`).
//!
//! Nothing in this crate performs I/O on its own. The runtime engine lives in
//! `botlink-runtime`; concrete transports and stores are supplied by applications.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod errors;
pub mod event;
pub mod state;
pub mod store;
pub mod transport;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{BackoffConfig, BotlinkConfig, ConnectionConfig, DispatchConfig, PairingConfig};
pub use errors::{
    BotlinkError, BotlinkResult, ConnectError, HandlerFailure, SendError, StateTransitionError,
    StoreError,
};
pub use event::{EventKind, IncomingMessage, InboundEvent};
pub use state::{AuditEntry, ConnectionState, LifecycleEvent, StateTransition};
pub use store::{ConnectionString, CredentialStore, MemoryCredentialStore, StoreConfig};
pub use transport::{EventSink, InboundEvents, Session, Transport};
pub use types::{
    ChatId, DeviceCredential, DeviceIdentity, OutboundReply, PairingArtifact, ReplyPayload,
};
