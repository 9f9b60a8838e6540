//! Managers for the runtime
//!
//! The lifecycle manager owns the connection state machine; the credential vault is
//! its adapter over the durable store.

pub mod credentials;
pub mod lifecycle;

pub use credentials::{CredentialVault, WriteOutcome};
pub use lifecycle::{
    AuditTrail, LifecycleManager, RunReport, StateChange, StateChannels, AUDIT_CAPACITY,
};
