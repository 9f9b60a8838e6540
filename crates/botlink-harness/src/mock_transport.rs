//! Mock Transport for Testing
//!
//! A scriptable in-process transport. Tests hold a [`MockController`] to push inbound
//! events into the live session, script connect outcomes, drop the link, and inspect
//! every call the runtime made.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use botlink_core::{
    ConnectError, DeviceCredential, DeviceIdentity, EventSink, InboundEvent, InboundEvents,
    OutboundReply, PairingArtifact, SendError, Session, Transport,
};
use tokio::time::{sleep, Instant};
use tracing::debug;

// ----------------------------------------------------------------------------
// Mock Transport Configuration
// ----------------------------------------------------------------------------

/// Configuration for mock transport behavior
#[derive(Debug, Clone)]
pub struct MockTransportConfig {
    /// Identity reported for resumed sessions
    pub identity: DeviceIdentity,
    /// Simulated send latency range (min, max) in milliseconds
    pub send_latency_ms: (u64, u64),
    /// Inbound buffer per session
    pub event_buffer: usize,
    /// Validity window of issued pairing artifacts
    pub artifact_validity: Duration,
}

impl Default for MockTransportConfig {
    fn default() -> Self {
        Self {
            identity: DeviceIdentity::new("mock-device:1"),
            send_latency_ms: (0, 0),
            event_buffer: 64,
            artifact_validity: Duration::from_secs(20),
        }
    }
}

impl MockTransportConfig {
    /// Sends take a few random milliseconds
    pub fn with_latency(min_ms: u64, max_ms: u64) -> Self {
        Self {
            send_latency_ms: (min_ms, max_ms.max(min_ms)),
            ..Self::default()
        }
    }
}

/// Scripted outcome of one `connect` call
#[derive(Debug, Clone)]
pub enum ConnectBehavior {
    /// Open a session
    Succeed,
    /// Fail with the given error
    Fail(ConnectError),
    /// Never complete; the caller's connect timeout fires
    Hang,
}

// ----------------------------------------------------------------------------
// Shared State
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MockState {
    script: VecDeque<ConnectBehavior>,
    sink: Option<EventSink>,
    session_open: bool,
    overlapping_sessions: u64,
    connect_calls: Vec<Option<DeviceCredential>>,
    disconnects: u64,
    sent: Vec<OutboundReply>,
    send_failure: Option<SendError>,
    artifact_sequence: u64,
}

#[derive(Debug)]
struct Shared {
    config: MockTransportConfig,
    state: Mutex<MockState>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ----------------------------------------------------------------------------
// Mock Transport Implementation
// ----------------------------------------------------------------------------

/// Mock transport for deterministic testing
#[derive(Debug, Clone)]
pub struct MockTransport {
    shared: Arc<Shared>,
}

impl MockTransport {
    /// Create a transport and the controller that drives it
    pub fn new() -> (Arc<Self>, MockController) {
        Self::with_config(MockTransportConfig::default())
    }

    pub fn with_config(config: MockTransportConfig) -> (Arc<Self>, MockController) {
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(MockState::default()),
        });
        (
            Arc::new(Self {
                shared: shared.clone(),
            }),
            MockController { shared },
        )
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        credential: Option<&DeviceCredential>,
    ) -> Result<Session, ConnectError> {
        let behavior = {
            let mut state = self.shared.state();
            state.connect_calls.push(credential.cloned());
            state.script.pop_front().unwrap_or(ConnectBehavior::Succeed)
        };
        debug!(pairing = credential.is_none(), ?behavior, "Mock connect");

        match behavior {
            ConnectBehavior::Succeed => {
                let (sink, events) = InboundEvents::channel(self.shared.config.event_buffer);
                let mut state = self.shared.state();
                if state.session_open {
                    state.overlapping_sessions += 1;
                }
                state.session_open = true;
                state.sink = Some(sink);

                let identity = credential.map(|_| self.shared.config.identity.clone());
                Ok(Session::new(identity, events))
            }
            ConnectBehavior::Fail(err) => Err(err),
            ConnectBehavior::Hang => std::future::pending().await,
        }
    }

    async fn disconnect(&self) {
        let mut state = self.shared.state();
        state.disconnects += 1;
        state.session_open = false;
        state.sink = None;
    }

    async fn send(&self, reply: &OutboundReply) -> Result<(), SendError> {
        let (min, max) = self.shared.config.send_latency_ms;
        if max > 0 {
            sleep(Duration::from_millis(fastrand::u64(min..=max))).await;
        }

        let mut state = self.shared.state();
        if !state.session_open {
            return Err(SendError::NotConnected);
        }
        if let Some(err) = state.send_failure.clone() {
            return Err(err);
        }
        state.sent.push(reply.clone());
        Ok(())
    }

    async fn issue_pairing_artifact(&self) -> Result<PairingArtifact, ConnectError> {
        let mut state = self.shared.state();
        if !state.session_open {
            return Err(ConnectError::Rejected {
                reason: "no pairing session".to_string(),
            });
        }
        state.artifact_sequence += 1;
        let sequence = state.artifact_sequence;
        Ok(PairingArtifact::new(
            format!("PAIR-{}", sequence),
            sequence,
            self.shared.config.artifact_validity,
        ))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

// ----------------------------------------------------------------------------
// Controller
// ----------------------------------------------------------------------------

/// Test-side handle to a [`MockTransport`]
#[derive(Debug, Clone)]
pub struct MockController {
    shared: Arc<Shared>,
}

impl MockController {
    /// Queue the outcome of a future `connect` call; unscripted calls succeed
    pub fn script_connect(&self, behavior: ConnectBehavior) {
        self.shared.state().script.push_back(behavior);
    }

    /// Push an event into the live session; `false` if there is none
    pub async fn emit(&self, event: InboundEvent) -> bool {
        let sink = self.shared.state().sink.clone();
        match sink {
            Some(sink) => sink.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Issue the next pairing code on the live session
    pub async fn emit_pairing_code(&self) -> Option<PairingArtifact> {
        let artifact = {
            let mut state = self.shared.state();
            state.sink.as_ref()?;
            state.artifact_sequence += 1;
            PairingArtifact::new(
                format!("PAIR-{}", state.artifact_sequence),
                state.artifact_sequence,
                self.shared.config.artifact_validity,
            )
        };
        self.emit(InboundEvent::PairingCode(artifact.clone()))
            .await
            .then_some(artifact)
    }

    /// Confirm the pairing session with the given credential
    pub async fn confirm_pairing(&self, credential: DeviceCredential) -> bool {
        self.emit(InboundEvent::PairingConfirmed {
            identity: self.shared.config.identity.clone(),
            credential,
        })
        .await
    }

    /// Report link loss and end the session's event stream
    pub async fn drop_link(&self, reason: &str) -> bool {
        let emitted = self
            .emit(InboundEvent::ConnectionLost {
                reason: reason.to_string(),
            })
            .await;
        self.close_stream();
        emitted
    }

    /// End the session's event stream without a final event
    pub fn close_stream(&self) {
        self.shared.state().sink = None;
    }

    /// Make every subsequent send fail with `err` (`None` restores success)
    pub fn fail_sends(&self, err: Option<SendError>) {
        self.shared.state().send_failure = err;
    }

    pub fn sent(&self) -> Vec<OutboundReply> {
        self.shared.state().sent.clone()
    }

    /// Credential passed to each `connect` call, in order
    pub fn connect_calls(&self) -> Vec<Option<DeviceCredential>> {
        self.shared.state().connect_calls.clone()
    }

    pub fn disconnects(&self) -> u64 {
        self.shared.state().disconnects
    }

    /// Connects made while a previous session was still open
    pub fn overlapping_sessions(&self) -> u64 {
        self.shared.state().overlapping_sessions
    }

    pub fn has_session(&self) -> bool {
        self.shared.state().sink.is_some()
    }

    pub fn artifacts_issued(&self) -> u64 {
        self.shared.state().artifact_sequence
    }

    /// Wait until at least `count` connect calls were made
    pub async fn wait_for_connects(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.connect_calls.len() >= count)
            .await
    }

    /// Wait until at least `count` replies were accepted
    pub async fn wait_for_sent(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.sent.len() >= count).await
    }

    /// Wait until a session with a live event stream exists
    pub async fn wait_for_session(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.sink.is_some()).await
    }

    async fn wait_until<F>(&self, timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut(&MockState) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if condition(&*self.shared.state()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(5)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use botlink_core::ChatId;

    #[tokio::test]
    async fn test_scripted_connects() {
        let (transport, controller) = MockTransport::new();
        controller.script_connect(ConnectBehavior::Fail(ConnectError::Unreachable {
            reason: "offline".to_string(),
        }));

        let credential = DeviceCredential::new(vec![1]);
        assert!(transport.connect(Some(&credential)).await.is_err());

        let session = transport.connect(Some(&credential)).await.unwrap();
        assert_eq!(session.identity, Some(DeviceIdentity::new("mock-device:1")));
        assert_eq!(controller.connect_calls().len(), 2);
        assert!(controller.has_session());
    }

    #[tokio::test]
    async fn test_emit_reaches_session_and_drop_ends_it() {
        let (transport, controller) = MockTransport::new();
        let mut session = transport.connect(None).await.unwrap();
        assert!(session.identity.is_none());

        assert!(controller.emit(InboundEvent::Connected { identity: None }).await);
        assert!(controller.drop_link("reset").await);

        assert!(matches!(
            session.events.next().await,
            Some(InboundEvent::Connected { .. })
        ));
        assert!(matches!(
            session.events.next().await,
            Some(InboundEvent::ConnectionLost { .. })
        ));
        assert!(session.events.next().await.is_none());
        assert!(!controller.emit(InboundEvent::Connected { identity: None }).await);
    }

    #[tokio::test]
    async fn test_send_recording_and_failures() {
        let (transport, controller) = MockTransport::new();
        let reply = OutboundReply::text(ChatId::new("C"), "hi");

        assert_eq!(transport.send(&reply).await, Err(SendError::NotConnected));

        let _session = transport.connect(None).await.unwrap();
        transport.send(&reply).await.unwrap();
        controller.fail_sends(Some(SendError::Io {
            reason: "broken pipe".to_string(),
        }));
        assert!(transport.send(&reply).await.is_err());

        assert_eq!(controller.sent(), vec![reply]);
    }

    #[tokio::test]
    async fn test_overlapping_sessions_are_detected() {
        let (transport, controller) = MockTransport::new();
        let _first = transport.connect(None).await.unwrap();
        let _second = transport.connect(None).await.unwrap();
        assert_eq!(controller.overlapping_sessions(), 1);

        transport.disconnect().await;
        let _third = transport.connect(None).await.unwrap();
        assert_eq!(controller.overlapping_sessions(), 1);
        assert_eq!(controller.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_pairing_artifacts_increase() {
        let (transport, controller) = MockTransport::new();
        let _session = transport.connect(None).await.unwrap();

        let first = transport.issue_pairing_artifact().await.unwrap();
        let second = controller.emit_pairing_code().await.unwrap();
        assert!(second.supersedes(&first));
        assert_eq!(controller.artifacts_issued(), 2);
    }
}
