//! Shutdown Coordinator
//!
//! Turns external stop requests (SIGINT, SIGTERM, or a programmatic call) into a single
//! cooperative cancellation signal. Requests after the first are ignored.

use tokio::sync::watch;
use tracing::{debug, info, warn};

// ----------------------------------------------------------------------------
// Coordinator
// ----------------------------------------------------------------------------

/// Owner of the process-wide stop flag
#[derive(Debug)]
pub struct ShutdownCoordinator {
    trigger: ShutdownTrigger,
    signal: ShutdownSignal,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            trigger: ShutdownTrigger { sender },
            signal: ShutdownSignal { receiver },
        }
    }

    /// Cloneable handle for requesting shutdown
    pub fn trigger(&self) -> ShutdownTrigger {
        self.trigger.clone()
    }

    /// Cloneable handle for observing shutdown
    pub fn signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Trigger
// ----------------------------------------------------------------------------

/// Requests shutdown; idempotent
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    sender: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Request shutdown. Returns `true` only for the request that actually flipped the flag.
    pub fn request(&self, reason: &str) -> bool {
        let first = self.sender.send_if_modified(|triggered| {
            if *triggered {
                false
            } else {
                *triggered = true;
                true
            }
        });

        if first {
            info!(reason = %reason, "Shutdown requested");
        } else {
            debug!(reason = %reason, "Shutdown already requested; ignoring");
        }
        first
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }
}

// ----------------------------------------------------------------------------
// Signal
// ----------------------------------------------------------------------------

/// Observes the stop flag from any task
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve once shutdown has been requested
    ///
    /// Never resolves if every trigger is dropped without requesting shutdown.
    pub async fn wait(&mut self) {
        if self.receiver.wait_for(|triggered| *triggered).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// ----------------------------------------------------------------------------
// OS Signals
// ----------------------------------------------------------------------------

/// Forward SIGINT and SIGTERM to `trigger` until shutdown is requested
pub async fn listen_for_signals(trigger: ShutdownTrigger) {
    let mut signal = ShutdownSignal {
        receiver: trigger.sender.subscribe(),
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};

        let mut sigterm = match unix_signal(SignalKind::terminate()) {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                None
            }
        };

        loop {
            tokio::select! {
                _ = signal.wait() => return,
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        warn!("Failed to listen for Ctrl+C: {}", e);
                        signal.wait().await;
                        return;
                    }
                    trigger.request("interrupt signal");
                }
                Some(()) = async {
                    match sigterm.as_mut() {
                        Some(stream) => stream.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    trigger.request("terminate signal");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        loop {
            tokio::select! {
                _ = signal.wait() => return,
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        warn!("Failed to listen for Ctrl+C: {}", e);
                        signal.wait().await;
                        return;
                    }
                    trigger.request("interrupt signal");
                }
            }
        }
    }
}
