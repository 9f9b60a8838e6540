//! Pairing Handshake
//!
//! First-run device authorization. Opens a pairing session on the transport, keeps the
//! latest pairing artifact in a single-slot cell that the renderer reads from, and waits
//! for confirmation, cancellation, the overall timeout, or shutdown. The credential is
//! persisted before the handshake reports success.

use std::{sync::Arc, time::Duration};

use botlink_core::{
    DeviceCredential, DeviceIdentity, InboundEvent, PairingArtifact, PairingConfig, Session,
    Transport,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    managers::credentials::{CredentialVault, WriteOutcome},
    shutdown::ShutdownSignal,
};

// ----------------------------------------------------------------------------
// Rendering
// ----------------------------------------------------------------------------

/// Operator-facing surface for pairing artifacts
pub trait PairingRenderer: Send + Sync {
    /// Present `artifact`; called only with the most recent artifact
    fn render(&self, artifact: &PairingArtifact);

    /// Pairing completed
    fn paired(&self, identity: &DeviceIdentity) {
        let _ = identity;
    }
}

/// Writes pairing codes to the log
#[derive(Debug, Clone, Default)]
pub struct LogRenderer;

impl PairingRenderer for LogRenderer {
    fn render(&self, artifact: &PairingArtifact) {
        info!(
            sequence = artifact.sequence,
            valid_for_secs = artifact.valid_for.as_secs(),
            "Pairing code: {}",
            artifact.code
        );
    }

    fn paired(&self, identity: &DeviceIdentity) {
        info!(identity = %identity, "Device paired");
    }
}

// ----------------------------------------------------------------------------
// Latest Artifact Cell
// ----------------------------------------------------------------------------

/// Single-slot holder for the newest pairing artifact
///
/// Offers carrying a sequence at or below the current one are rejected, so readers can
/// never observe a superseded artifact after a newer one was stored.
#[derive(Debug, Clone)]
pub struct ArtifactCell {
    sender: watch::Sender<Option<PairingArtifact>>,
}

impl ArtifactCell {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self { sender }
    }

    /// Store `artifact` if it supersedes the current one; returns whether it was stored
    pub fn offer(&self, artifact: PairingArtifact) -> bool {
        self.sender.send_if_modified(|slot| {
            let stale = slot
                .as_ref()
                .is_some_and(|current| !artifact.supersedes(current));
            if stale {
                return false;
            }
            *slot = Some(artifact);
            true
        })
    }

    /// Forget the current artifact (new pairing session)
    pub fn clear(&self) {
        self.sender.send_replace(None);
    }

    pub fn latest(&self) -> Option<PairingArtifact> {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<PairingArtifact>> {
        self.sender.subscribe()
    }
}

impl Default for ArtifactCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Render whatever is newest each time the cell changes
async fn render_latest(
    mut receiver: watch::Receiver<Option<PairingArtifact>>,
    renderer: Arc<dyn PairingRenderer>,
) {
    loop {
        let latest = receiver.borrow_and_update().clone();
        if let Some(artifact) = latest {
            renderer.render(&artifact);
        }
        if receiver.changed().await.is_err() {
            return;
        }
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// ----------------------------------------------------------------------------
// Handshake
// ----------------------------------------------------------------------------

/// How one handshake attempt ended
#[derive(Debug)]
pub enum PairingOutcome {
    /// Confirmed and persisted; the pairing session continues as the live session
    Paired {
        identity: DeviceIdentity,
        credential: DeviceCredential,
        session: Session,
    },
    /// Overall pairing timeout elapsed
    TimedOut,
    /// Cancelled by the network or operator, or the pairing session ended
    Cancelled { reason: String },
    /// The transport could not open a pairing session
    ///
    /// `abandoned` is set when the connect attempt was given up in flight, so the
    /// transport may still hold a half-open session.
    ConnectFailed { reason: String, abandoned: bool },
    /// Shutdown was requested; `session_opened` unless it came before any connect began
    Interrupted { session_opened: bool },
}

impl PairingOutcome {
    /// Whether the transport may hold a session that must be closed
    pub fn holds_link(&self) -> bool {
        match self {
            PairingOutcome::Paired { .. }
            | PairingOutcome::TimedOut
            | PairingOutcome::Cancelled { .. } => true,
            PairingOutcome::ConnectFailed { abandoned, .. } => *abandoned,
            PairingOutcome::Interrupted { session_opened } => *session_opened,
        }
    }
}

/// Drives one pairing attempt at a time
pub struct PairingHandshake {
    transport: Arc<dyn Transport>,
    vault: Arc<CredentialVault>,
    renderer: Arc<dyn PairingRenderer>,
    config: PairingConfig,
    connect_timeout: Duration,
    cell: ArtifactCell,
}

impl PairingHandshake {
    pub fn new(
        transport: Arc<dyn Transport>,
        vault: Arc<CredentialVault>,
        renderer: Arc<dyn PairingRenderer>,
        config: PairingConfig,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            vault,
            renderer,
            config,
            connect_timeout,
            cell: ArtifactCell::new(),
        }
    }

    /// Latest-artifact cell shared with the renderer
    pub fn artifacts(&self) -> &ArtifactCell {
        &self.cell
    }

    /// Run one handshake attempt to completion
    pub async fn run(&self, shutdown: &ShutdownSignal) -> PairingOutcome {
        let mut signal = shutdown.clone();
        self.cell.clear();
        if signal.is_triggered() {
            return PairingOutcome::Interrupted {
                session_opened: false,
            };
        }

        let connect = tokio::select! {
            biased;
            _ = signal.wait() => return PairingOutcome::Interrupted { session_opened: true },
            result = tokio::time::timeout(self.connect_timeout, self.transport.connect(None)) => result,
        };
        let mut session = match connect {
            Ok(Ok(session)) => session,
            Ok(Err(err)) => {
                return PairingOutcome::ConnectFailed {
                    reason: err.to_string(),
                    abandoned: false,
                }
            }
            Err(_) => {
                return PairingOutcome::ConnectFailed {
                    reason: format!(
                        "pairing session not opened within {}ms",
                        self.connect_timeout.as_millis()
                    ),
                    abandoned: true,
                }
            }
        };

        let _render_task = AbortOnDrop(tokio::spawn(render_latest(
            self.cell.subscribe(),
            self.renderer.clone(),
        )));

        match self.transport.issue_pairing_artifact().await {
            Ok(artifact) => self.accept_artifact(artifact),
            Err(err) => warn!("Transport did not issue a pairing artifact: {}", err),
        }

        let deadline = tokio::time::sleep(self.config.timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = signal.wait() => return PairingOutcome::Interrupted { session_opened: true },
                _ = &mut deadline => {
                    warn!(
                        timeout_secs = self.config.timeout.as_secs(),
                        "Pairing was not confirmed in time"
                    );
                    return PairingOutcome::TimedOut;
                }
                event = session.events.next() => match event {
                    Some(InboundEvent::PairingCode(artifact)) => self.accept_artifact(artifact),
                    Some(InboundEvent::PairingConfirmed { identity, credential }) => {
                        info!(identity = %identity, "Pairing confirmed; persisting credential");
                        return match self.vault.persist_with_retry(&credential, &signal).await {
                            WriteOutcome::Committed => {
                                self.renderer.paired(&identity);
                                session.identity = Some(identity.clone());
                                PairingOutcome::Paired { identity, credential, session }
                            }
                            WriteOutcome::Interrupted => {
                                PairingOutcome::Interrupted { session_opened: true }
                            }
                        };
                    }
                    Some(InboundEvent::PairingCancelled { reason })
                    | Some(InboundEvent::ConnectionLost { reason }) => {
                        warn!("Pairing cancelled: {}", reason);
                        return PairingOutcome::Cancelled { reason };
                    }
                    Some(other) => {
                        debug!(kind = %other.kind(), "Ignoring event during pairing");
                    }
                    None => {
                        return PairingOutcome::Cancelled {
                            reason: "pairing session closed".to_string(),
                        }
                    }
                },
            }
        }
    }

    fn accept_artifact(&self, artifact: PairingArtifact) {
        let sequence = artifact.sequence;
        if !self.cell.offer(artifact) {
            debug!(sequence, "Discarding superseded pairing artifact");
        }
    }
}
