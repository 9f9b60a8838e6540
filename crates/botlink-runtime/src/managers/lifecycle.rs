//! Connection Lifecycle Manager
//!
//! Sole owner of the device's `ConnectionState`. Drives pairing, connecting, serving an
//! epoch through the dispatcher, and reconnecting under backoff, until shutdown moves it
//! to `Terminated`. The live session is owned here and lent to the dispatcher for one
//! epoch at a time.

use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
};

use botlink_core::{
    types::now_millis, AuditEntry, BotlinkConfig, BotlinkResult, ConnectError, ConnectionState,
    DeviceCredential, DeviceIdentity, InboundEvent, LifecycleEvent, Session, StateTransition,
    Transport,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::{
    backoff::Backoff,
    dispatcher::{DispatchCounters, Dispatcher, EpochEnd},
    managers::credentials::{CredentialVault, WriteOutcome},
    pairing::{PairingHandshake, PairingOutcome},
    shutdown::ShutdownSignal,
};

/// Transition notification published to subscribers
pub type StateChange = StateTransition;

/// Transitions kept in the audit trail
pub const AUDIT_CAPACITY: usize = 256;

/// Capacity of the transition broadcast channel
pub const CHANGE_CHANNEL_CAPACITY: usize = 256;

// ----------------------------------------------------------------------------
// Audit Trail
// ----------------------------------------------------------------------------

/// Bounded history of state transitions, newest last
#[derive(Debug, Clone, Default)]
pub struct AuditTrail {
    entries: Arc<Mutex<VecDeque<AuditEntry>>>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, entry: AuditEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            if entries.len() == AUDIT_CAPACITY {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ----------------------------------------------------------------------------
// Run Report
// ----------------------------------------------------------------------------

/// Summary returned when the lifecycle manager terminates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub final_state: ConnectionState,
    /// Connected epochs served
    pub epochs: u64,
    /// Backoff waits taken before reconnecting
    pub reconnect_attempts: u64,
    /// Pairing handshakes completed
    pub pairings: u64,
    /// Credentials revoked by the network
    pub revocations: u64,
    /// Credential rotations persisted
    pub rotations: u64,
    pub dispatch: DispatchCounters,
}

// ----------------------------------------------------------------------------
// Observation Channels
// ----------------------------------------------------------------------------

/// Publishers for state observers
#[derive(Debug, Clone)]
pub struct StateChannels {
    pub state: watch::Sender<ConnectionState>,
    pub changes: broadcast::Sender<StateChange>,
    pub audit: AuditTrail,
}

impl StateChannels {
    pub fn new(initial: ConnectionState) -> Self {
        let (state, _) = watch::channel(initial);
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            state,
            changes,
            audit: AuditTrail::new(),
        }
    }
}

type PendingWrite = Pin<Box<dyn Future<Output = WriteOutcome> + Send>>;

// ----------------------------------------------------------------------------
// Lifecycle Manager
// ----------------------------------------------------------------------------

/// Owns the connection state machine and the live session
pub struct LifecycleManager {
    transport: Arc<dyn Transport>,
    vault: Arc<CredentialVault>,
    pairing: PairingHandshake,
    dispatcher: Dispatcher,
    config: BotlinkConfig,
    channels: StateChannels,
    backoff: Backoff,

    state: ConnectionState,
    credential: Option<DeviceCredential>,
    identity: Option<DeviceIdentity>,
    session: Option<Session>,
    link_open: bool,

    epochs: u64,
    reconnect_attempts: u64,
    pairings: u64,
    revocations: u64,
    rotations: u64,
}

impl LifecycleManager {
    /// Create a manager whose initial state follows from `stored`
    pub fn new(
        transport: Arc<dyn Transport>,
        vault: Arc<CredentialVault>,
        pairing: PairingHandshake,
        dispatcher: Dispatcher,
        config: BotlinkConfig,
        channels: StateChannels,
        stored: Option<DeviceCredential>,
    ) -> Self {
        let state = ConnectionState::initial(stored.is_some());
        channels.state.send_replace(state);

        Self {
            transport,
            vault,
            pairing,
            dispatcher,
            backoff: Backoff::new(config.backoff.clone()),
            config,
            channels,
            state,
            credential: stored,
            identity: None,
            session: None,
            link_open: false,
            epochs: 0,
            reconnect_attempts: 0,
            pairings: 0,
            revocations: 0,
            rotations: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Drive the state machine until shutdown
    pub async fn run(mut self, shutdown: ShutdownSignal) -> BotlinkResult<RunReport> {
        info!(
            state = %self.state,
            store = %self.vault.describe(),
            transport = %self.transport.name(),
            "Lifecycle manager starting"
        );

        loop {
            if shutdown.is_triggered() {
                self.terminate().await;
            }

            match self.state {
                ConnectionState::Terminated => break,
                ConnectionState::Unpaired | ConnectionState::AwaitingPairing => {
                    self.pair(&shutdown).await
                }
                ConnectionState::Connecting => self.connect(&shutdown).await,
                ConnectionState::Connected => self.serve(&shutdown).await,
                ConnectionState::Disconnected => self.apply(LifecycleEvent::BeginReconnect),
                ConnectionState::Reconnecting => self.wait_backoff(&shutdown).await,
            }
        }

        let report = self.report();
        info!(
            epochs = report.epochs,
            reconnects = report.reconnect_attempts,
            pairings = report.pairings,
            "Lifecycle manager terminated"
        );
        Ok(report)
    }

    // ------------------------------------------------------------------------
    // Pairing
    // ------------------------------------------------------------------------

    async fn pair(&mut self, shutdown: &ShutdownSignal) {
        if self.state == ConnectionState::Unpaired {
            self.apply(LifecycleEvent::BeginPairing);
        }
        let outcome = self.pairing.run(shutdown).await;
        self.link_open = outcome.holds_link();

        match outcome {
            PairingOutcome::Paired {
                identity,
                credential,
                session,
            } => {
                self.pairings += 1;
                self.credential = Some(credential);
                self.identity = Some(identity);
                self.session = Some(session);
                self.apply(LifecycleEvent::PairingConfirmed);
            }
            PairingOutcome::TimedOut => {
                self.close_link().await;
                self.apply(LifecycleEvent::PairingTimedOut);
                self.pause_before_pairing(shutdown).await;
            }
            PairingOutcome::Cancelled { reason } => {
                info!(reason = %reason, "Pairing cancelled; a new code will be issued");
                self.close_link().await;
                self.apply(LifecycleEvent::PairingCancelled);
                self.pause_before_pairing(shutdown).await;
            }
            PairingOutcome::ConnectFailed { reason, .. } => {
                warn!(reason = %reason, "Could not open a pairing session");
                self.close_link().await;
                self.apply(LifecycleEvent::ConnectFailed);
                self.pause_before_pairing(shutdown).await;
            }
            PairingOutcome::Interrupted { .. } => self.terminate().await,
        }
    }

    async fn pause_before_pairing(&self, shutdown: &ShutdownSignal) {
        let mut signal = shutdown.clone();
        tokio::select! {
            _ = signal.wait() => {}
            _ = tokio::time::sleep(self.config.pairing.retry_delay) => {}
        }
    }

    // ------------------------------------------------------------------------
    // Connecting
    // ------------------------------------------------------------------------

    async fn connect(&mut self, shutdown: &ShutdownSignal) {
        // A confirmed pairing session carries on as the live session
        if self.session.is_some() {
            self.session_established();
            return;
        }

        let Some(credential) = self.credential.clone() else {
            error!("Connecting without a credential; pairing required");
            self.apply(LifecycleEvent::CredentialRevoked);
            return;
        };

        let timeout = self.config.connection.connect_timeout;
        let mut signal = shutdown.clone();
        self.link_open = true;

        let attempt = tokio::select! {
            biased;
            _ = signal.wait() => {
                self.terminate().await;
                return;
            }
            attempt = tokio::time::timeout(timeout, self.transport.connect(Some(&credential))) => attempt,
        };

        match attempt {
            Ok(Ok(session)) => {
                if let Some(identity) = session.identity.clone() {
                    self.identity = Some(identity);
                }
                self.session = Some(session);
                self.session_established();
            }
            Ok(Err(ConnectError::CredentialRevoked { reason })) => {
                self.link_open = false;
                self.revoke(&reason, shutdown).await;
            }
            Ok(Err(err)) => {
                self.link_open = false;
                warn!(error = %err, "Connect attempt failed");
                self.apply(LifecycleEvent::ConnectFailed);
            }
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Connect attempt timed out"
                );
                self.close_link().await;
                self.apply(LifecycleEvent::ConnectFailed);
            }
        }
    }

    fn session_established(&mut self) {
        self.backoff.reset();
        self.apply(LifecycleEvent::SessionEstablished);
        match &self.identity {
            Some(identity) => info!(identity = %identity, "Connected"),
            None => info!("Connected"),
        }
    }

    // ------------------------------------------------------------------------
    // Connected
    // ------------------------------------------------------------------------

    async fn serve(&mut self, shutdown: &ShutdownSignal) {
        let Some(mut session) = self.session.take() else {
            warn!("Connected without a live session");
            self.close_link().await;
            self.apply(LifecycleEvent::LinkLost);
            return;
        };

        self.epochs += 1;
        let epoch = self.epochs;
        let (rotations, mut rotated) = mpsc::unbounded_channel();
        let mut pending: Option<PendingWrite> = None;
        let mut unsaved = false;

        let end = {
            let serving =
                self.dispatcher
                    .run_epoch(epoch, &mut session.events, shutdown, &rotations);
            tokio::pin!(serving);

            loop {
                tokio::select! {
                    end = &mut serving => break end,
                    Some(credential) = rotated.recv() => {
                        info!(
                            epoch,
                            fingerprint = %credential.fingerprint(),
                            "Credential rotated by the network"
                        );
                        self.credential = Some(credential.clone());
                        unsaved = true;
                        let vault = self.vault.clone();
                        let signal = shutdown.clone();
                        // Replacing an unfinished write drops it; only the newest row matters
                        pending = Some(Box::pin(async move {
                            vault.persist_with_retry(&credential, &signal).await
                        }));
                    }
                    outcome = async {
                        match pending.as_mut() {
                            Some(write) => write.await,
                            None => std::future::pending().await,
                        }
                    }, if pending.is_some() => {
                        pending = None;
                        if outcome == WriteOutcome::Committed {
                            self.rotations += 1;
                            unsaved = false;
                        }
                    }
                }
            }
        };

        // Rotations handed off after the loop last polled the channel
        let mut newest = None;
        while let Ok(credential) = rotated.try_recv() {
            newest = Some(credential);
        }
        if matches!(end, EpochEnd::Shutdown) {
            while let Some(event) = session.events.try_next() {
                if let InboundEvent::CredentialRotated { credential } = event {
                    newest = Some(credential);
                }
            }
        }
        if let Some(credential) = newest {
            unsaved = true;
            info!(
                epoch,
                fingerprint = %credential.fingerprint(),
                "Credential rotated by the network"
            );
            self.credential = Some(credential.clone());
            let vault = self.vault.clone();
            let signal = shutdown.clone();
            pending = Some(Box::pin(async move {
                vault.persist_with_retry(&credential, &signal).await
            }));
        }

        match end {
            EpochEnd::Shutdown => {
                drop(pending);
                if unsaved {
                    self.persist_before_exit().await;
                }
                self.terminate().await;
            }
            EpochEnd::LinkLost { reason } => {
                if let Some(write) = pending {
                    match write.await {
                        WriteOutcome::Committed => self.rotations += 1,
                        WriteOutcome::Interrupted => self.persist_before_exit().await,
                    }
                }
                warn!(epoch, reason = %reason, "Connection lost");
                self.close_link().await;
                self.apply(LifecycleEvent::LinkLost);
            }
            EpochEnd::Revoked { reason } => {
                drop(pending);
                self.revoke(&reason, shutdown).await;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Reconnecting
    // ------------------------------------------------------------------------

    async fn wait_backoff(&mut self, shutdown: &ShutdownSignal) {
        let delay = self.backoff.next_delay();
        self.reconnect_attempts += 1;
        info!(
            attempt = self.backoff.attempts(),
            delay_ms = delay.as_millis() as u64,
            "Reconnecting after backoff"
        );

        let mut signal = shutdown.clone();
        tokio::select! {
            biased;
            _ = signal.wait() => self.terminate().await,
            _ = tokio::time::sleep(delay) => self.apply(LifecycleEvent::RetryConnect),
        }
    }

    // ------------------------------------------------------------------------
    // Revocation and Shutdown
    // ------------------------------------------------------------------------

    async fn revoke(&mut self, reason: &str, shutdown: &ShutdownSignal) {
        error!(
            reason = %reason,
            "Session credential revoked by the network; discarding it, pairing required"
        );
        self.revocations += 1;
        self.close_link().await;
        self.credential = None;
        self.identity = None;

        match self.vault.discard_with_retry(shutdown).await {
            WriteOutcome::Committed => self.apply(LifecycleEvent::CredentialRevoked),
            WriteOutcome::Interrupted => self.terminate().await,
        }
    }

    /// One bounded write of a rotated credential once shutdown has begun
    async fn persist_before_exit(&mut self) {
        let Some(credential) = self.credential.clone() else {
            return;
        };
        let limit = self.config.dispatch.drain_timeout;
        match tokio::time::timeout(limit, self.vault.persist(&credential)).await {
            Ok(Ok(())) => {
                self.rotations += 1;
                info!(
                    fingerprint = %credential.fingerprint(),
                    "Rotated credential persisted before shutdown"
                );
            }
            Ok(Err(err)) => error!(
                fingerprint = %credential.fingerprint(),
                "Rotated credential not persisted before shutdown: {}",
                err
            ),
            Err(_) => error!(
                fingerprint = %credential.fingerprint(),
                timeout_ms = limit.as_millis() as u64,
                "Rotated credential not persisted before shutdown: store did not answer"
            ),
        }
    }

    async fn close_link(&mut self) {
        self.session = None;
        if self.link_open {
            self.link_open = false;
            self.transport.disconnect().await;
            debug!("Transport session closed");
        }
    }

    /// Release the live connection, if any, and enter `Terminated`
    async fn terminate(&mut self) {
        if self.state.is_terminated() {
            return;
        }
        self.close_link().await;
        self.apply(LifecycleEvent::Shutdown);
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    fn apply(&mut self, event: LifecycleEvent) {
        match self.state.transition(event) {
            Ok(transition) => {
                if !transition.changed() {
                    return;
                }
                self.state = transition.to;
                self.channels.audit.record(transition.audit_entry(now_millis()));
                self.channels.state.send_replace(transition.to);
                let _ = self.channels.changes.send(transition);
                info!(
                    from = %transition.from,
                    to = %transition.to,
                    event = %transition.event,
                    "State transition"
                );
            }
            Err(err) => error!("Rejected lifecycle transition: {}", err),
        }
    }

    fn report(&self) -> RunReport {
        RunReport {
            final_state: self.state,
            epochs: self.epochs,
            reconnect_attempts: self.reconnect_attempts,
            pairings: self.pairings,
            revocations: self.revocations,
            rotations: self.rotations,
            dispatch: self.dispatcher.stats().snapshot(),
        }
    }
}
