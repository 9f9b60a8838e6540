//! Console Transport
//!
//! A line-oriented stand-in for the messaging network, so the binary can be operated
//! locally. The operator plays both the primary device and the chat partners:
//!
//! - `/pair <code>` confirms the newest pairing code (older codes are refused)
//! - `<chat>: <text>` delivers a message from `<chat>`; a bare line uses the default chat
//! - `/drop`, `/revoke`, `/rotate`, `/cancel` simulate link loss, revocation, credential
//!   rotation and pairing cancellation
//! - `/quit` requests shutdown

use std::{
    collections::HashSet,
    io::Write,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use botlink_core::{
    ChatId, ConnectError, DeviceCredential, DeviceIdentity, EventSink, InboundEvent,
    InboundEvents, IncomingMessage, OutboundReply, PairingArtifact, SendError, Session,
    Transport,
};
use botlink_runtime::ShutdownTrigger;

use crate::config::ConsoleConfig;

const EVENT_BUFFER: usize = 64;

const HELP: &str = "\
Commands:
  <chat>: <text>   message from <chat>
  <text>           message from the default chat
  /pair <code>     confirm pairing with the newest code
  /cancel          cancel the pairing session
  /drop            drop the link
  /revoke          revoke the session credential
  /rotate          rotate the session credential
  /quit            shut down";

/// What the reader loop should do after a line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    Continue,
    Quit,
}

// ----------------------------------------------------------------------------
// Session State
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ConsoleState {
    sink: Option<EventSink>,
    pairing: bool,
    sequence: u64,
    latest: Option<PairingArtifact>,
    issued: HashSet<String>,
    credential: Option<DeviceCredential>,
    revoked: HashSet<String>,
    rotation_task: Option<JoinHandle<()>>,
}

impl ConsoleState {
    fn next_artifact(&mut self, valid_for: Duration) -> PairingArtifact {
        self.sequence += 1;
        let code = Uuid::new_v4().simple().to_string()[..8].to_uppercase();
        let artifact = PairingArtifact::new(code, self.sequence, valid_for);
        self.issued.insert(artifact.code.clone());
        self.latest = Some(artifact.clone());
        artifact
    }

    fn close(&mut self) {
        self.sink = None;
        self.pairing = false;
        if let Some(task) = self.rotation_task.take() {
            task.abort();
        }
    }
}

fn lock(state: &Mutex<ConsoleState>) -> MutexGuard<'_, ConsoleState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn fresh_credential() -> DeviceCredential {
    let mut bytes = Uuid::new_v4().as_bytes().to_vec();
    bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    DeviceCredential::new(bytes)
}

fn identity_for(credential: &DeviceCredential) -> DeviceIdentity {
    DeviceIdentity::new(format!("console:{}", credential.fingerprint()))
}

/// Re-issue pairing codes until the pairing session ends
async fn rotate_codes(state: Arc<Mutex<ConsoleState>>, sink: EventSink, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let artifact = {
            let mut state = lock(&state);
            if !state.pairing {
                return;
            }
            state.next_artifact(interval)
        };
        debug!(sequence = artifact.sequence, "Rotating pairing code");
        if sink.send(InboundEvent::PairingCode(artifact)).await.is_err() {
            return;
        }
    }
}

// ----------------------------------------------------------------------------
// Console Transport
// ----------------------------------------------------------------------------

/// Transport driven by operator input, writing replies to `W`
pub struct ConsoleTransport<W = std::io::Stdout> {
    rotation: Duration,
    default_chat: ChatId,
    state: Arc<Mutex<ConsoleState>>,
    output: Mutex<W>,
}

impl ConsoleTransport<std::io::Stdout> {
    pub fn stdout(config: &ConsoleConfig) -> Arc<Self> {
        Self::with_output(config, std::io::stdout())
    }
}

impl<W: Write + Send + 'static> ConsoleTransport<W> {
    pub fn with_output(config: &ConsoleConfig, output: W) -> Arc<Self> {
        Arc::new(Self {
            rotation: Duration::from_secs(config.code_rotation_secs),
            default_chat: ChatId::new(config.default_chat.clone()),
            state: Arc::new(Mutex::new(ConsoleState::default())),
            output: Mutex::new(output),
        })
    }

    /// Feed lines from `input` until it ends or the operator quits
    pub fn spawn_reader<R>(self: &Arc<Self>, input: R, trigger: ShutdownTrigger) -> JoinHandle<()>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let transport = self.clone();
        tokio::spawn(async move {
            let mut lines = input.lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if transport.handle_line(&line).await == LineOutcome::Quit {
                            trigger.request("quit requested from console");
                            return;
                        }
                    }
                    Ok(None) => {
                        debug!("Console input closed");
                        return;
                    }
                    Err(err) => {
                        warn!("Console input failed: {}", err);
                        return;
                    }
                }
            }
        })
    }

    /// Interpret one line of operator input
    pub async fn handle_line(&self, line: &str) -> LineOutcome {
        let line = line.trim();
        if line.is_empty() {
            return LineOutcome::Continue;
        }

        let (command, argument) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };

        match command {
            "/quit" | "/exit" => return LineOutcome::Quit,
            "/help" => self.say(HELP),
            "/pair" => self.confirm_pairing(argument).await,
            "/cancel" => {
                if lock(&self.state).pairing {
                    self.emit(InboundEvent::PairingCancelled {
                        reason: "cancelled from console".to_string(),
                    })
                    .await;
                } else {
                    self.say("No pairing in progress");
                }
            }
            "/drop" => {
                let sent = self
                    .emit(InboundEvent::ConnectionLost {
                        reason: "dropped from console".to_string(),
                    })
                    .await;
                lock(&self.state).sink = None;
                if sent {
                    self.say("Link dropped");
                }
            }
            "/revoke" => {
                let fingerprint = {
                    let mut state = lock(&self.state);
                    let fingerprint = state.credential.take().map(|c| c.fingerprint());
                    if let Some(fp) = &fingerprint {
                        state.revoked.insert(fp.clone());
                    }
                    fingerprint
                };
                match fingerprint {
                    Some(fingerprint) => {
                        info!(fingerprint = %fingerprint, "Revoking console credential");
                        self.emit(InboundEvent::CredentialRevoked {
                            reason: "revoked from console".to_string(),
                        })
                        .await;
                    }
                    None => self.say("No paired session to revoke"),
                }
            }
            "/rotate" => {
                let rotated = {
                    let mut state = lock(&self.state);
                    match (&state.sink, &state.credential) {
                        (Some(_), Some(_)) => {
                            let credential = fresh_credential();
                            state.credential = Some(credential.clone());
                            Some(credential)
                        }
                        _ => None,
                    }
                };
                match rotated {
                    Some(credential) => {
                        self.emit(InboundEvent::CredentialRotated { credential })
                            .await;
                    }
                    None => self.say("No paired session to rotate"),
                }
            }
            other if other.starts_with('/') => {
                self.say(&format!("Unknown command {}; try /help", other));
            }
            _ => self.deliver_message(line).await,
        }
        LineOutcome::Continue
    }

    async fn confirm_pairing(&self, code: &str) {
        enum Verdict {
            Confirm(DeviceCredential),
            NotPairing,
            Expired,
            Unknown,
        }

        let verdict = {
            let mut state = lock(&self.state);
            let latest = state.latest.as_ref().map(|a| a.code.clone());
            if !state.pairing {
                Verdict::NotPairing
            } else if latest.is_some_and(|latest| latest.eq_ignore_ascii_case(code)) {
                let credential = fresh_credential();
                state.pairing = false;
                state.credential = Some(credential.clone());
                Verdict::Confirm(credential)
            } else if state.issued.iter().any(|c| c.eq_ignore_ascii_case(code)) {
                Verdict::Expired
            } else {
                Verdict::Unknown
            }
        };

        match verdict {
            Verdict::Confirm(credential) => {
                self.emit(InboundEvent::PairingConfirmed {
                    identity: identity_for(&credential),
                    credential,
                })
                .await;
            }
            Verdict::NotPairing => self.say("No pairing in progress"),
            Verdict::Expired => self.say("That code was superseded; use the newest code"),
            Verdict::Unknown => self.say("Unknown pairing code"),
        }
    }

    async fn deliver_message(&self, line: &str) {
        let (chat, body) = match line.split_once(':') {
            Some((chat, body)) if !chat.is_empty() && !chat.contains(char::is_whitespace) => {
                (ChatId::new(chat), body.trim())
            }
            _ => (self.default_chat.clone(), line),
        };
        let message = IncomingMessage::new(Uuid::new_v4().to_string(), chat, "operator", body);
        if !self.emit(InboundEvent::Message(message)).await {
            self.say("Not connected; message discarded");
        }
    }

    async fn emit(&self, event: InboundEvent) -> bool {
        let sink = lock(&self.state).sink.clone();
        match sink {
            Some(sink) => sink.send(event).await.is_ok(),
            None => false,
        }
    }

    fn say(&self, text: &str) {
        let mut output = self
            .output
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let _ = writeln!(output, "{}", text);
        let _ = output.flush();
    }
}

#[async_trait]
impl<W: Write + Send + 'static> Transport for ConsoleTransport<W> {
    async fn connect(
        &self,
        credential: Option<&DeviceCredential>,
    ) -> Result<Session, ConnectError> {
        let (sink, events) = InboundEvents::channel(EVENT_BUFFER);
        let identity = {
            let mut state = lock(&self.state);
            if let Some(credential) = credential {
                if state.revoked.contains(&credential.fingerprint()) {
                    return Err(ConnectError::CredentialRevoked {
                        reason: "credential was revoked from the console".to_string(),
                    });
                }
            }

            state.close();
            state.sink = Some(sink.clone());
            state.credential = credential.cloned();
            state.pairing = credential.is_none();
            if state.pairing {
                state.rotation_task = Some(tokio::spawn(rotate_codes(
                    self.state.clone(),
                    sink,
                    self.rotation,
                )));
            }
            credential.map(identity_for)
        };

        match &identity {
            Some(identity) => self.say(&format!("Connected as {}", identity)),
            None => self.say("Pairing session open; type /help for commands"),
        }
        Ok(Session::new(identity, events))
    }

    async fn disconnect(&self) {
        lock(&self.state).close();
        self.say("Disconnected");
    }

    async fn send(&self, reply: &OutboundReply) -> Result<(), SendError> {
        if lock(&self.state).sink.is_none() {
            return Err(SendError::NotConnected);
        }
        self.say(&format!("[{}] bot: {}", reply.recipient, reply.payload.preview()));
        Ok(())
    }

    async fn issue_pairing_artifact(&self) -> Result<PairingArtifact, ConnectError> {
        let mut state = lock(&self.state);
        if !state.pairing {
            return Err(ConnectError::Rejected {
                reason: "no pairing session".to_string(),
            });
        }
        Ok(state.next_artifact(self.rotation))
    }

    fn name(&self) -> &str {
        "console"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct Transcript(Arc<Mutex<Vec<u8>>>);

    impl Write for Transcript {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Transcript {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    fn console() -> (Arc<ConsoleTransport<Transcript>>, Transcript) {
        let transcript = Transcript::default();
        let config = ConsoleConfig {
            code_rotation_secs: 3600,
            ..ConsoleConfig::default()
        };
        (ConsoleTransport::with_output(&config, transcript.clone()), transcript)
    }

    async fn no_event(events: &mut InboundEvents) -> bool {
        tokio::time::timeout(Duration::from_millis(50), events.next())
            .await
            .is_err()
    }

    #[tokio::test]
    async fn test_pairing_accepts_only_newest_code() {
        let (console, transcript) = console();
        let mut session = console.connect(None).await.unwrap();
        assert!(session.identity.is_none());

        let first = console.issue_pairing_artifact().await.unwrap();
        let second = console.issue_pairing_artifact().await.unwrap();
        assert!(second.supersedes(&first));

        console.handle_line(&format!("/pair {}", first.code)).await;
        assert!(transcript.text().contains("superseded"));
        console.handle_line("/pair NOPE").await;
        assert!(transcript.text().contains("Unknown pairing code"));
        assert!(no_event(&mut session.events).await);

        console
            .handle_line(&format!("/pair {}", second.code.to_lowercase()))
            .await;
        let credential = match session.events.next().await {
            Some(InboundEvent::PairingConfirmed { identity, credential }) => {
                assert_eq!(identity, identity_for(&credential));
                credential
            }
            other => panic!("expected confirmation, got {:?}", other),
        };

        // Confirmed sessions cannot be confirmed again
        console.handle_line(&format!("/pair {}", second.code)).await;
        assert!(transcript.text().contains("No pairing in progress"));
        assert!(console.issue_pairing_artifact().await.is_err());

        console.disconnect().await;
        let resumed = console.connect(Some(&credential)).await.unwrap();
        assert_eq!(resumed.identity, Some(identity_for(&credential)));
    }

    #[tokio::test]
    async fn test_lines_become_messages() {
        let (console, _) = console();
        let credential = fresh_credential();
        let mut session = console.connect(Some(&credential)).await.unwrap();

        console.handle_line("support: hi there").await;
        console.handle_line("just text, no chat").await;

        match session.events.next().await {
            Some(InboundEvent::Message(msg)) => {
                assert_eq!(msg.chat, ChatId::new("support"));
                assert_eq!(msg.body, "hi there");
            }
            other => panic!("unexpected {:?}", other),
        }
        match session.events.next().await {
            Some(InboundEvent::Message(msg)) => {
                assert_eq!(msg.chat, ChatId::new("console"));
                assert_eq!(msg.body, "just text, no chat");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_revoked_credential_cannot_reconnect() {
        let (console, _) = console();
        let credential = fresh_credential();
        let mut session = console.connect(Some(&credential)).await.unwrap();

        console.handle_line("/revoke").await;
        assert!(matches!(
            session.events.next().await,
            Some(InboundEvent::CredentialRevoked { .. })
        ));

        console.disconnect().await;
        assert!(matches!(
            console.connect(Some(&credential)).await,
            Err(ConnectError::CredentialRevoked { .. })
        ));
    }

    #[tokio::test]
    async fn test_rotate_and_drop() {
        let (console, _) = console();
        let credential = fresh_credential();
        let mut session = console.connect(Some(&credential)).await.unwrap();

        console.handle_line("/rotate").await;
        match session.events.next().await {
            Some(InboundEvent::CredentialRotated { credential: rotated }) => {
                assert_ne!(rotated, credential)
            }
            other => panic!("unexpected {:?}", other),
        }

        console.handle_line("/drop").await;
        assert!(matches!(
            session.events.next().await,
            Some(InboundEvent::ConnectionLost { .. })
        ));
        assert!(session.events.next().await.is_none());
    }

    #[tokio::test]
    async fn test_send_requires_session() {
        let (console, transcript) = console();
        let reply = OutboundReply::text(ChatId::new("C"), "Received: hello");
        assert_eq!(console.send(&reply).await, Err(SendError::NotConnected));

        let _session = console.connect(Some(&fresh_credential())).await.unwrap();
        console.send(&reply).await.unwrap();
        assert!(transcript.text().contains("[C] bot: Received: hello"));

        assert_eq!(console.handle_line("/quit").await, LineOutcome::Quit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_codes_rotate_during_pairing() {
        let transcript = Transcript::default();
        let config = ConsoleConfig {
            code_rotation_secs: 5,
            ..ConsoleConfig::default()
        };
        let console = ConsoleTransport::with_output(&config, transcript);
        let mut session = console.connect(None).await.unwrap();
        let issued = console.issue_pairing_artifact().await.unwrap();

        let mut last = issued.sequence;
        for _ in 0..3 {
            match session.events.next().await {
                Some(InboundEvent::PairingCode(artifact)) => {
                    assert!(artifact.sequence > last);
                    last = artifact.sequence;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }
}
