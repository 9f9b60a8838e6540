//! Command implementations for the botlink binary

use std::{fmt, sync::Arc};

use serde::Serialize;
use tokio::io::BufReader;
use tracing::{info, warn};

use botlink_core::{CredentialStore, MemoryCredentialStore, StoreError};
use botlink_runtime::{
    listen_for_signals, EchoHandler, RunReport, RuntimeBuilder, ShutdownCoordinator,
};

use crate::{
    config::{AppConfig, StoreBackend},
    console::ConsoleTransport,
    error::Result,
    render::TerminalRenderer,
    store::FileCredentialStore,
};

// ----------------------------------------------------------------------------
// Credential Store Selection
// ----------------------------------------------------------------------------

/// Open the configured credential store
pub fn open_store(config: &AppConfig) -> Result<Arc<dyn CredentialStore>> {
    match config.storage.backend {
        StoreBackend::File => {
            let connection = config.connection_string()?;
            let store = FileCredentialStore::for_connection(&config.data_dir(), &connection);
            info!(connection = %connection, path = %store.path().display(), "Using file credential store");
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            warn!("Using in-memory credential store; pairing will not survive a restart");
            Ok(Arc::new(MemoryCredentialStore::new()))
        }
    }
}

// ----------------------------------------------------------------------------
// Run
// ----------------------------------------------------------------------------

/// Pair if needed, then serve console traffic until a signal or `/quit`
pub async fn run(config: &AppConfig) -> Result<RunReport> {
    let store = open_store(config)?;
    let transport = ConsoleTransport::stdout(&config.console);
    let coordinator = ShutdownCoordinator::new();

    let signals = tokio::spawn(listen_for_signals(coordinator.trigger()));
    let reader = transport.spawn_reader(BufReader::new(tokio::io::stdin()), coordinator.trigger());

    let built = RuntimeBuilder::new(transport, store)
        .with_config(config.to_runtime_config())
        .on_message(EchoHandler::new())
        .with_renderer(Arc::new(TerminalRenderer::new(config.console.qr)))
        .with_shutdown(coordinator)
        .build()
        .await;

    let outcome = match built {
        Ok(runtime) => runtime.run().await,
        Err(err) => Err(err),
    };
    signals.abort();
    reader.abort();

    let report = outcome?;
    info!(
        epochs = report.epochs,
        reconnects = report.reconnect_attempts,
        replies = report.dispatch.replies_sent,
        "botlink stopped"
    );
    Ok(report)
}

// ----------------------------------------------------------------------------
// Status and Unpair
// ----------------------------------------------------------------------------

/// What `botlink status` reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub backend: StoreBackend,
    pub location: String,
    pub connection: String,
    pub paired: bool,
    pub fingerprint: Option<String>,
    pub problem: Option<String>,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "store:      {}", self.location)?;
        writeln!(f, "connection: {}", self.connection)?;
        match (&self.fingerprint, &self.problem) {
            (Some(fingerprint), _) => write!(f, "paired:     yes ({})", fingerprint),
            (None, Some(problem)) => write!(f, "paired:     no ({})", problem),
            (None, None) => write!(f, "paired:     no"),
        }
    }
}

/// Inspect the stored credential without connecting
pub async fn status(config: &AppConfig) -> Result<StatusReport> {
    let connection = config.connection_string()?;
    let store = open_store(config)?;

    let (fingerprint, problem) = match store.get().await {
        Ok(credential) => (credential.map(|c| c.fingerprint()), None),
        Err(StoreError::Corrupt { reason }) => (None, Some(format!("stored row unreadable: {}", reason))),
        Err(err) => return Err(err.into()),
    };

    Ok(StatusReport {
        backend: config.storage.backend,
        location: store.describe(),
        connection: connection.to_string(),
        paired: fingerprint.is_some(),
        fingerprint,
        problem,
    })
}

/// Delete the stored credential; returns whether anything was paired
pub async fn unpair(config: &AppConfig) -> Result<bool> {
    let store = open_store(config)?;
    let was_paired = match store.get().await {
        Ok(credential) => credential.is_some(),
        Err(StoreError::Corrupt { .. }) => true,
        Err(err) => return Err(err.into()),
    };
    store.clear().await?;
    info!(store = %store.describe(), was_paired, "Stored credential removed");
    Ok(was_paired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CliError;
    use botlink_core::DeviceCredential;

    fn config_in(dir: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.storage.data_dir = Some(dir.to_path_buf());
        config.store.password = "hunter2".to_string();
        config
    }

    #[tokio::test]
    async fn test_status_then_unpair() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());

        let report = status(&config).await.unwrap();
        assert!(!report.paired);
        assert!(!report.connection.contains("hunter2"));
        assert!(report.location.ends_with("botlink-botlink.credential.json"));

        let store = open_store(&config).unwrap();
        let credential = DeviceCredential::new(b"paired".to_vec());
        store.put(&credential).await.unwrap();

        let report = status(&config).await.unwrap();
        assert!(report.paired);
        assert_eq!(report.fingerprint, Some(credential.fingerprint()));
        assert!(report.to_string().contains("paired:     yes"));

        assert!(unpair(&config).await.unwrap());
        assert!(!unpair(&config).await.unwrap());
        assert!(!status(&config).await.unwrap().paired);
    }

    #[tokio::test]
    async fn test_status_reports_corrupt_row() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        std::fs::write(dir.path().join("botlink-botlink.credential.json"), b"garbage").unwrap();

        let report = status(&config).await.unwrap();
        assert!(!report.paired);
        assert!(report.problem.unwrap().contains("unreadable"));

        // An unreadable row still counts as something to remove
        assert!(unpair(&config).await.unwrap());
        assert!(!unpair(&config).await.unwrap());
    }

    #[tokio::test]
    async fn test_unpair_fails_when_store_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let blocked = dir.path().join("not-a-directory");
        std::fs::write(&blocked, b"").unwrap();
        let config = config_in(&blocked);

        let err = unpair(&config).await.err().expect("unreachable store must fail");
        assert!(matches!(err, CliError::Store(StoreError::Unavailable { .. })));
    }
}
