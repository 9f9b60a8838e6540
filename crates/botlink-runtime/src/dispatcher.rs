//! Event Dispatcher
//!
//! Consumes one connection epoch's inbound events and routes each to its registered
//! handler. Reading and handling are decoupled: the reader forwards events over a bounded
//! queue to a single worker, which runs handlers on the blocking pool one at a time so a
//! slow handler never stalls the reader and arrival order is preserved.
//!
//! Events that end the epoch (link loss, revocation) and credential rotations are
//! returned to the lifecycle manager instead of being interpreted here.

use std::{
    any::Any,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use botlink_core::{
    DeviceCredential, DispatchConfig, HandlerFailure, InboundEvent, InboundEvents, OutboundReply,
    Transport,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    handlers::{HandlerRegistry, Route},
    shutdown::ShutdownSignal,
};

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

/// Live dispatch counters, shared between the reader and the worker
#[derive(Debug, Default)]
pub struct DispatchStats {
    received: AtomicU64,
    dispatched: AtomicU64,
    dropped: AtomicU64,
    handler_failures: AtomicU64,
    replies_sent: AtomicU64,
    send_failures: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchCounters {
    /// Events read from the transport
    pub received: u64,
    /// Events handed to a handler
    pub dispatched: u64,
    /// Events with no handler, or discarded on shutdown
    pub dropped: u64,
    /// Handlers that returned an error or panicked
    pub handler_failures: u64,
    /// Replies accepted by the transport
    pub replies_sent: u64,
    /// Replies the transport refused
    pub send_failures: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchCounters {
        DispatchCounters {
            received: self.received.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            replies_sent: self.replies_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ----------------------------------------------------------------------------
// Epoch
// ----------------------------------------------------------------------------

/// Why an epoch ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EpochEnd {
    /// Transport-level close (remote close, network failure, stream ended)
    LinkLost { reason: String },
    /// The transport reported the stored session invalid
    Revoked { reason: String },
    /// Shutdown was requested
    Shutdown,
}

/// Routes inbound events to application handlers
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    registry: Arc<HandlerRegistry>,
    config: DispatchConfig,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<HandlerRegistry>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            transport,
            registry,
            config,
            stats: Arc::new(DispatchStats::default()),
        }
    }

    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    /// Consume `events` until the epoch ends
    ///
    /// Credential rotations are forwarded on `rotations`. Events still queued when the
    /// link drops are handled before returning; events queued when shutdown begins are
    /// discarded, but a handler already running is allowed to finish.
    pub async fn run_epoch(
        &self,
        epoch: u64,
        events: &mut InboundEvents,
        shutdown: &ShutdownSignal,
        rotations: &mpsc::UnboundedSender<DeviceCredential>,
    ) -> EpochEnd {
        let mut signal = shutdown.clone();
        let (queue, queued) = mpsc::channel(self.config.queue_capacity.max(1));

        let worker = tokio::spawn(dispatch_worker(
            epoch,
            queued,
            self.transport.clone(),
            self.registry.clone(),
            self.stats.clone(),
            shutdown.clone(),
        ));

        debug!(epoch, "Dispatcher started");

        let end = loop {
            let event = tokio::select! {
                biased;
                _ = signal.wait() => break EpochEnd::Shutdown,
                event = events.next() => event,
            };

            let Some(event) = event else {
                break EpochEnd::LinkLost {
                    reason: "inbound event stream ended".to_string(),
                };
            };
            DispatchStats::bump(&self.stats.received);

            let end = match &event {
                InboundEvent::CredentialRotated { credential } => {
                    if rotations.send(credential.clone()).is_err() {
                        warn!(epoch, "Credential rotation could not be handed off");
                    }
                    continue;
                }
                InboundEvent::ConnectionLost { reason } => Some(EpochEnd::LinkLost {
                    reason: reason.clone(),
                }),
                InboundEvent::CredentialRevoked { reason } => Some(EpochEnd::Revoked {
                    reason: reason.clone(),
                }),
                _ => None,
            };

            // Observers of link loss and revocation see them after everything before them
            tokio::select! {
                biased;
                _ = signal.wait() => break EpochEnd::Shutdown,
                result = queue.send(event) => {
                    if result.is_err() {
                        warn!(epoch, "Dispatch worker stopped unexpectedly");
                        break EpochEnd::LinkLost {
                            reason: "dispatch worker stopped".to_string(),
                        };
                    }
                }
            }

            if let Some(end) = end {
                break end;
            }
        };

        drop(queue);
        self.drain(epoch, worker).await;
        debug!(epoch, end = ?end, "Dispatcher stopped");
        end
    }

    async fn drain(&self, epoch: u64, worker: tokio::task::JoinHandle<()>) {
        let abort = worker.abort_handle();
        match tokio::time::timeout(self.config.drain_timeout, worker).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(epoch, "Dispatch worker failed: {}", err),
            Err(_) => {
                warn!(
                    epoch,
                    drain_timeout_ms = self.config.drain_timeout.as_millis() as u64,
                    "Dispatch worker did not finish in time; abandoning remaining events"
                );
                abort.abort();
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Worker
// ----------------------------------------------------------------------------

async fn dispatch_worker(
    epoch: u64,
    mut queued: mpsc::Receiver<InboundEvent>,
    transport: Arc<dyn Transport>,
    registry: Arc<HandlerRegistry>,
    stats: Arc<DispatchStats>,
    shutdown: ShutdownSignal,
) {
    let mut discarded = 0u64;

    while let Some(event) = queued.recv().await {
        if shutdown.is_triggered() {
            discarded += 1;
            DispatchStats::bump(&stats.dropped);
            continue;
        }

        let kind = event.kind();
        if registry.route(&event).is_none() {
            debug!(epoch, kind = %kind, "No handler registered; dropping event");
            DispatchStats::bump(&stats.dropped);
            continue;
        }

        DispatchStats::bump(&stats.dispatched);
        match invoke(registry.clone(), event).await {
            Ok(Some(reply)) => match transport.send(&reply).await {
                Ok(()) => {
                    DispatchStats::bump(&stats.replies_sent);
                    debug!(epoch, recipient = %reply.recipient, "Reply submitted");
                }
                Err(err) => {
                    DispatchStats::bump(&stats.send_failures);
                    warn!(
                        epoch,
                        recipient = %reply.recipient,
                        "Dropping reply, send failed: {}",
                        err
                    );
                }
            },
            Ok(None) => {}
            Err(failure) => {
                DispatchStats::bump(&stats.handler_failures);
                warn!(epoch, kind = %kind, "{}", failure);
            }
        }
    }

    if discarded > 0 {
        info!(epoch, discarded, "Discarded queued events on shutdown");
    }
}

/// Run the routed handler on the blocking pool, isolating errors and panics
async fn invoke(
    registry: Arc<HandlerRegistry>,
    event: InboundEvent,
) -> Result<Option<OutboundReply>, HandlerFailure> {
    let outcome = tokio::task::spawn_blocking(move || match registry.route(&event) {
        Some(Route::Message(message, handler)) => handler.handle(message),
        Some(Route::Event(handler)) => handler.handle(&event).map(|()| None),
        None => Ok(None),
    })
    .await;

    match outcome {
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(err)) => Err(HandlerFailure::Error(err.to_string())),
        Err(join) if join.is_panic() => Err(HandlerFailure::Panicked(panic_message(
            join.into_panic(),
        ))),
        Err(join) => Err(HandlerFailure::Error(join.to_string())),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Mutex, time::Duration};

    use async_trait::async_trait;
    use botlink_core::{
        ChatId, ConnectError, EventKind, IncomingMessage, PairingArtifact, SendError, Session,
    };

    use crate::{
        handlers::{EchoHandler, HandlerError},
        shutdown::ShutdownCoordinator,
    };

    #[derive(Default)]
    struct SinkTransport {
        sent: Mutex<Vec<OutboundReply>>,
        fail_sends: bool,
    }

    #[async_trait]
    impl Transport for SinkTransport {
        async fn connect(
            &self,
            _credential: Option<&DeviceCredential>,
        ) -> Result<Session, ConnectError> {
            Err(ConnectError::Unreachable {
                reason: "not used".to_string(),
            })
        }

        async fn disconnect(&self) {}

        async fn send(&self, reply: &OutboundReply) -> Result<(), SendError> {
            if self.fail_sends {
                return Err(SendError::Io {
                    reason: "socket closed".to_string(),
                });
            }
            self.sent.lock().unwrap().push(reply.clone());
            Ok(())
        }

        async fn issue_pairing_artifact(&self) -> Result<PairingArtifact, ConnectError> {
            Err(ConnectError::Rejected {
                reason: "not used".to_string(),
            })
        }
    }

    fn message(id: &str, body: &str) -> InboundEvent {
        InboundEvent::Message(IncomingMessage::new(id, ChatId::new("C"), "alice", body))
    }

    fn echo_registry() -> Arc<HandlerRegistry> {
        let mut registry = HandlerRegistry::new();
        registry.set_message_handler(Arc::new(EchoHandler::new()));
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_echo_reply_sent_once_and_link_loss_ends_epoch() {
        let transport = Arc::new(SinkTransport::default());
        let dispatcher = Dispatcher::new(
            transport.clone(),
            echo_registry(),
            DispatchConfig::testing(),
        );
        let coordinator = ShutdownCoordinator::new();
        let (rotations, _rotated) = mpsc::unbounded_channel();
        let (sink, mut events) = InboundEvents::channel(8);

        sink.send(message("m1", "hello")).await.unwrap();
        sink.send(InboundEvent::ConnectionLost {
            reason: "reset".to_string(),
        })
        .await
        .unwrap();

        let end = dispatcher
            .run_epoch(1, &mut events, &coordinator.signal(), &rotations)
            .await;
        assert_eq!(
            end,
            EpochEnd::LinkLost {
                reason: "reset".to_string()
            }
        );

        let sent = transport.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![OutboundReply::text(ChatId::new("C"), "Received: hello")]);

        let counters = dispatcher.stats().snapshot();
        assert_eq!(counters.received, 2);
        assert_eq!(counters.dispatched, 1);
        assert_eq!(counters.replies_sent, 1);
        // Nobody observes ConnectionLost here
        assert_eq!(counters.dropped, 1);
    }

    #[tokio::test]
    async fn test_handler_failures_are_isolated_and_order_kept() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        {
            let seen = seen.clone();
            registry.set_message_handler(Arc::new(
                move |msg: &IncomingMessage| -> Result<Option<OutboundReply>, HandlerError> {
                    seen.lock().unwrap().push(msg.id.clone());
                    match msg.body.as_str() {
                        "panic" => panic!("handler exploded"),
                        "error" => Err("bad input".into()),
                        _ => Ok(None),
                    }
                },
            ));
        }

        let dispatcher = Dispatcher::new(
            Arc::new(SinkTransport::default()),
            Arc::new(registry),
            DispatchConfig::testing(),
        );
        let coordinator = ShutdownCoordinator::new();
        let (rotations, _rotated) = mpsc::unbounded_channel();
        let (sink, mut events) = InboundEvents::channel(16);

        for (id, body) in [("1", "ok"), ("2", "panic"), ("3", "ok"), ("4", "error"), ("5", "ok")] {
            sink.send(message(id, body)).await.unwrap();
        }
        drop(sink);

        let end = dispatcher
            .run_epoch(1, &mut events, &coordinator.signal(), &rotations)
            .await;
        assert!(matches!(end, EpochEnd::LinkLost { .. }));

        assert_eq!(*seen.lock().unwrap(), vec!["1", "2", "3", "4", "5"]);
        let counters = dispatcher.stats().snapshot();
        assert_eq!(counters.dispatched, 5);
        assert_eq!(counters.handler_failures, 2);
    }

    #[tokio::test]
    async fn test_send_failure_is_counted_and_dropped() {
        let transport = Arc::new(SinkTransport {
            fail_sends: true,
            ..Default::default()
        });
        let dispatcher = Dispatcher::new(transport, echo_registry(), DispatchConfig::testing());
        let coordinator = ShutdownCoordinator::new();
        let (rotations, _rotated) = mpsc::unbounded_channel();
        let (sink, mut events) = InboundEvents::channel(8);

        sink.send(message("m1", "hello")).await.unwrap();
        drop(sink);

        dispatcher
            .run_epoch(1, &mut events, &coordinator.signal(), &rotations)
            .await;
        let counters = dispatcher.stats().snapshot();
        assert_eq!(counters.send_failures, 1);
        assert_eq!(counters.replies_sent, 0);
    }

    #[tokio::test]
    async fn test_rotation_and_revocation_are_returned() {
        let dispatcher = Dispatcher::new(
            Arc::new(SinkTransport::default()),
            echo_registry(),
            DispatchConfig::testing(),
        );
        let coordinator = ShutdownCoordinator::new();
        let (rotations, mut rotated) = mpsc::unbounded_channel();
        let (sink, mut events) = InboundEvents::channel(8);

        let fresh = DeviceCredential::new(vec![9, 9, 9]);
        sink.send(InboundEvent::CredentialRotated {
            credential: fresh.clone(),
        })
        .await
        .unwrap();
        sink.send(InboundEvent::CredentialRevoked {
            reason: "logged out".to_string(),
        })
        .await
        .unwrap();

        let end = dispatcher
            .run_epoch(1, &mut events, &coordinator.signal(), &rotations)
            .await;
        assert!(matches!(end, EpochEnd::Revoked { .. }));
        assert_eq!(rotated.try_recv().unwrap(), fresh);
    }

    #[tokio::test]
    async fn test_shutdown_discards_queue_but_finishes_in_flight() {
        let started = Arc::new(tokio::sync::Notify::new());
        let finished = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        {
            let started = started.clone();
            let finished = finished.clone();
            registry.set_message_handler(Arc::new(
                move |msg: &IncomingMessage| -> Result<Option<OutboundReply>, HandlerError> {
                    started.notify_one();
                    std::thread::sleep(Duration::from_millis(100));
                    finished.lock().unwrap().push(msg.id.clone());
                    Ok(None)
                },
            ));
        }

        let dispatcher = Dispatcher::new(
            Arc::new(SinkTransport::default()),
            Arc::new(registry),
            DispatchConfig::testing(),
        );
        let coordinator = ShutdownCoordinator::new();
        let trigger = coordinator.trigger();
        let (rotations, _rotated) = mpsc::unbounded_channel();
        let (sink, mut events) = InboundEvents::channel(8);

        for id in ["1", "2", "3"] {
            sink.send(message(id, "slow")).await.unwrap();
        }

        let stopper = {
            let started = started.clone();
            tokio::spawn(async move {
                started.notified().await;
                trigger.request("test");
            })
        };

        let end = dispatcher
            .run_epoch(1, &mut events, &coordinator.signal(), &rotations)
            .await;
        stopper.await.unwrap();

        assert_eq!(end, EpochEnd::Shutdown);
        assert_eq!(*finished.lock().unwrap(), vec!["1"]);
        let counters = dispatcher.stats().snapshot();
        assert_eq!(counters.dispatched, 1);
        assert!(counters.dropped <= 2);
        drop(sink);
    }

    #[tokio::test]
    async fn test_observer_handlers_and_unknown_kinds() {
        let observed = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        {
            let observed = observed.clone();
            registry.set_event_handler(
                EventKind::Connected,
                Arc::new(move |event: &InboundEvent| -> Result<(), HandlerError> {
                    observed.lock().unwrap().push(event.kind());
                    Ok(())
                }),
            );
        }

        let dispatcher = Dispatcher::new(
            Arc::new(SinkTransport::default()),
            Arc::new(registry),
            DispatchConfig::testing(),
        );
        let coordinator = ShutdownCoordinator::new();
        let (rotations, _rotated) = mpsc::unbounded_channel();
        let (sink, mut events) = InboundEvents::channel(8);

        sink.send(InboundEvent::Connected { identity: None })
            .await
            .unwrap();
        sink.send(InboundEvent::Unknown {
            kind: "typing".to_string(),
        })
        .await
        .unwrap();
        sink.send(message("m1", "no message handler")).await.unwrap();
        drop(sink);

        dispatcher
            .run_epoch(1, &mut events, &coordinator.signal(), &rotations)
            .await;

        assert_eq!(*observed.lock().unwrap(), vec![EventKind::Connected]);
        let counters = dispatcher.stats().snapshot();
        assert_eq!(counters.dispatched, 1);
        assert_eq!(counters.dropped, 2);
    }
}
