//! Credential Store Adapter
//!
//! Narrow translation layer between the lifecycle manager and the durable store. Maps
//! store failures into the error taxonomy, serializes mutations of the single credential
//! row, and retries mid-run writes under backoff.

use std::sync::Arc;

use botlink_core::{
    BackoffConfig, BotlinkError, BotlinkResult, CredentialStore, DeviceCredential, StoreError,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::{backoff::Backoff, shutdown::ShutdownSignal};

/// Result of a retried store mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The mutation reached the store
    Committed,
    /// Shutdown was requested before the store accepted the mutation
    Interrupted,
}

/// Adapter over a [`CredentialStore`]
pub struct CredentialVault {
    store: Arc<dyn CredentialStore>,
    write_lock: Mutex<()>,
    retry: BackoffConfig,
}

impl CredentialVault {
    pub fn new(store: Arc<dyn CredentialStore>, retry: BackoffConfig) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
            retry,
        }
    }

    pub fn describe(&self) -> String {
        self.store.describe()
    }

    /// Load the stored credential
    ///
    /// An unreachable store is `StoreUnavailable`. An unreadable row is logged, cleared
    /// and reported as absent so the device re-pairs.
    pub async fn load(&self) -> BotlinkResult<Option<DeviceCredential>> {
        match self.store.get().await {
            Ok(Some(credential)) => {
                debug!(
                    store = %self.store.describe(),
                    fingerprint = %credential.fingerprint(),
                    "Loaded stored credential"
                );
                Ok(Some(credential))
            }
            Ok(None) => {
                debug!(store = %self.store.describe(), "No stored credential");
                Ok(None)
            }
            Err(StoreError::Corrupt { reason }) => {
                error!(
                    store = %self.store.describe(),
                    "Stored credential is unreadable ({}); discarding it, pairing required",
                    reason
                );
                let _guard = self.write_lock.lock().await;
                self.store.clear().await.map_err(BotlinkError::from)?;
                Ok(None)
            }
            Err(err) => Err(BotlinkError::from(err)),
        }
    }

    /// Single attempt at overwriting the credential row
    pub async fn persist(&self, credential: &DeviceCredential) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.store.put(credential).await
    }

    /// Single attempt at removing the credential row
    pub async fn discard(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.store.clear().await
    }

    /// Overwrite the credential row, retrying under backoff until it succeeds
    pub async fn persist_with_retry(
        &self,
        credential: &DeviceCredential,
        shutdown: &ShutdownSignal,
    ) -> WriteOutcome {
        let outcome = self
            .retry_write("persist", shutdown, || self.persist(credential))
            .await;
        if outcome == WriteOutcome::Committed {
            info!(
                store = %self.store.describe(),
                fingerprint = %credential.fingerprint(),
                "Credential persisted"
            );
        }
        outcome
    }

    /// Remove the credential row, retrying under backoff until it succeeds
    pub async fn discard_with_retry(&self, shutdown: &ShutdownSignal) -> WriteOutcome {
        let outcome = self
            .retry_write("discard", shutdown, || self.discard())
            .await;
        if outcome == WriteOutcome::Committed {
            info!(store = %self.store.describe(), "Stored credential discarded");
        }
        outcome
    }

    async fn retry_write<F, Fut>(
        &self,
        operation: &str,
        shutdown: &ShutdownSignal,
        mut attempt: F,
    ) -> WriteOutcome
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<(), StoreError>>,
    {
        let mut backoff = Backoff::new(self.retry.clone());
        let mut signal = shutdown.clone();

        loop {
            if signal.is_triggered() {
                warn!(operation, "Shutdown requested before credential write completed");
                return WriteOutcome::Interrupted;
            }

            match attempt().await {
                Ok(()) => return WriteOutcome::Committed,
                Err(err) => {
                    let delay = backoff.next_delay();
                    warn!(
                        operation,
                        attempt = backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "Credential store write failed: {}; retrying",
                        err
                    );
                    tokio::select! {
                        _ = signal.wait() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}
