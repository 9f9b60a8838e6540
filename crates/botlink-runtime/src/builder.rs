//! Runtime Builder API
//!
//! Builder-style assembly for consumers (CLI, tests): register a transport, a credential
//! store, handlers and a pairing renderer, then run the runtime in place or spawn it and
//! keep a handle for observing state and requesting shutdown.

use std::{sync::Arc, time::Duration};

use botlink_core::{
    AuditEntry, BotlinkConfig, BotlinkError, BotlinkResult, ConnectionState, CredentialStore,
    EventKind, PairingArtifact, Transport,
};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::info;

use crate::{
    dispatcher::Dispatcher,
    handlers::{EventHandler, HandlerRegistry, MessageHandler},
    managers::{
        credentials::CredentialVault,
        lifecycle::{AuditTrail, LifecycleManager, RunReport, StateChange, StateChannels},
    },
    pairing::{ArtifactCell, LogRenderer, PairingHandshake, PairingRenderer},
    shutdown::{ShutdownCoordinator, ShutdownTrigger},
};

// ----------------------------------------------------------------------------
// Runtime Builder
// ----------------------------------------------------------------------------

/// Builder for a botlink runtime
pub struct RuntimeBuilder {
    transport: Arc<dyn Transport>,
    store: Arc<dyn CredentialStore>,
    config: BotlinkConfig,
    registry: HandlerRegistry,
    renderer: Arc<dyn PairingRenderer>,
    coordinator: Option<ShutdownCoordinator>,
}

impl RuntimeBuilder {
    /// Create a new runtime builder
    pub fn new(transport: Arc<dyn Transport>, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            transport,
            store,
            config: BotlinkConfig::default(),
            registry: HandlerRegistry::new(),
            renderer: Arc::new(LogRenderer),
            coordinator: None,
        }
    }

    /// Set the runtime configuration
    pub fn with_config(mut self, config: BotlinkConfig) -> Self {
        self.config = config;
        self
    }

    /// Register the message handler
    pub fn on_message<H>(mut self, handler: H) -> Self
    where
        H: MessageHandler + 'static,
    {
        self.registry.set_message_handler(Arc::new(handler));
        self
    }

    /// Register an observer for a non-message event kind
    pub fn on_event<H>(mut self, kind: EventKind, handler: H) -> Self
    where
        H: EventHandler + 'static,
    {
        self.registry.set_event_handler(kind, Arc::new(handler));
        self
    }

    /// Set the operator-facing pairing renderer
    pub fn with_renderer(mut self, renderer: Arc<dyn PairingRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Use an externally owned shutdown coordinator (e.g. one wired to OS signals)
    pub fn with_shutdown(mut self, coordinator: ShutdownCoordinator) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Validate configuration and read the stored credential
    ///
    /// Fails with `StoreUnavailable` when the store cannot be reached; callers treat that
    /// as a fatal startup error.
    pub async fn build(self) -> BotlinkResult<Runtime> {
        self.config
            .validate()
            .map_err(BotlinkError::configuration)?;

        let vault = Arc::new(CredentialVault::new(
            self.store.clone(),
            self.config.backoff.clone(),
        ));
        let stored = vault.load().await?;

        info!(
            transport = %self.transport.name(),
            store = %vault.describe(),
            paired = stored.is_some(),
            handlers = ?self.registry.registered_kinds(),
            "Building botlink runtime"
        );

        let channels = StateChannels::new(ConnectionState::initial(stored.is_some()));
        let pairing = PairingHandshake::new(
            self.transport.clone(),
            vault.clone(),
            self.renderer,
            self.config.pairing.clone(),
            self.config.connection.connect_timeout,
        );
        let artifacts = pairing.artifacts().clone();
        let dispatcher = Dispatcher::new(
            self.transport.clone(),
            Arc::new(self.registry),
            self.config.dispatch.clone(),
        );

        let state = channels.state.subscribe();
        let changes = channels.changes.clone();
        let audit = channels.audit.clone();
        let manager = LifecycleManager::new(
            self.transport,
            vault,
            pairing,
            dispatcher,
            self.config,
            channels,
            stored,
        );

        Ok(Runtime {
            manager,
            coordinator: self.coordinator.unwrap_or_default(),
            observers: Observers {
                state,
                changes,
                audit,
                artifacts,
            },
        })
    }

    /// Build and spawn the runtime onto the current tokio runtime
    pub async fn start(self) -> BotlinkResult<RuntimeHandle> {
        Ok(self.build().await?.spawn())
    }
}

// ----------------------------------------------------------------------------
// Runtime
// ----------------------------------------------------------------------------

#[derive(Clone)]
struct Observers {
    state: watch::Receiver<ConnectionState>,
    changes: broadcast::Sender<StateChange>,
    audit: AuditTrail,
    artifacts: ArtifactCell,
}

/// A built runtime that has not started yet
pub struct Runtime {
    manager: LifecycleManager,
    coordinator: ShutdownCoordinator,
    observers: Observers,
}

impl Runtime {
    /// State the runtime will start in
    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        self.coordinator.trigger()
    }

    /// Subscribe to transitions; subscribe before `run` to observe every one
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.observers.changes.subscribe()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.observers.state.clone()
    }

    /// Run until shutdown is requested
    pub async fn run(self) -> BotlinkResult<RunReport> {
        let Runtime {
            manager,
            coordinator,
            ..
        } = self;
        manager.run(coordinator.signal()).await
    }

    /// Run on a background task
    pub fn spawn(self) -> RuntimeHandle {
        let trigger = self.coordinator.trigger();
        let observers = self.observers.clone();
        let task = tokio::spawn(self.run());

        RuntimeHandle {
            trigger,
            observers,
            task: Some(task),
        }
    }
}

// ----------------------------------------------------------------------------
// Runtime Handle
// ----------------------------------------------------------------------------

/// Handle to a running runtime instance
pub struct RuntimeHandle {
    trigger: ShutdownTrigger,
    observers: Observers,
    task: Option<JoinHandle<BotlinkResult<RunReport>>>,
}

impl RuntimeHandle {
    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.observers.state.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.observers.state.clone()
    }

    /// Subscribe to transitions from now on
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.observers.changes.subscribe()
    }

    /// Recent transitions, oldest first
    pub fn audit_trail(&self) -> Vec<AuditEntry> {
        self.observers.audit.entries()
    }

    /// Newest pairing artifact of the current pairing session, if any
    pub fn pairing_artifact(&self) -> Option<PairingArtifact> {
        self.observers.artifacts.latest()
    }

    /// Wait until the state satisfies `predicate`; `None` on timeout or termination
    pub async fn wait_for_state<F>(&self, timeout: Duration, mut predicate: F) -> Option<ConnectionState>
    where
        F: FnMut(ConnectionState) -> bool,
    {
        let mut receiver = self.observers.state.clone();
        let waited = tokio::time::timeout(timeout, receiver.wait_for(|state| predicate(*state))).await;
        match waited {
            Ok(Ok(state)) => Some(*state),
            _ => None,
        }
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        self.trigger.clone()
    }

    /// Request shutdown; returns `false` if it was already requested
    pub fn shutdown(&self) -> bool {
        self.trigger.request("shutdown requested through runtime handle")
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Wait for the runtime to finish
    pub async fn join(mut self) -> BotlinkResult<RunReport> {
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| BotlinkError::task(format!("lifecycle task failed: {}", e)))?,
            None => Err(BotlinkError::task("runtime already joined")),
        }
    }

    /// Request shutdown and wait for termination
    pub async fn stop(self) -> BotlinkResult<RunReport> {
        self.shutdown();
        self.join().await
    }
}

impl Drop for RuntimeHandle {
    fn drop(&mut self) {
        if self.task.as_ref().is_some_and(|task| !task.is_finished()) {
            self.trigger.request("runtime handle dropped");
        }
    }
}
