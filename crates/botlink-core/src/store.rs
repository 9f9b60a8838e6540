//! Credential store abstraction
//!
//! The durable backing store holds exactly one credential row per device. Backends
//! implement [`CredentialStore`]; the runtime wraps it in a narrow adapter that maps
//! failures into the error taxonomy and serializes mutations.

use core::fmt;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Mutex,
};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use url::Url;

use crate::{
    errors::{BotlinkError, StoreError},
    types::DeviceCredential,
};

// ----------------------------------------------------------------------------
// Storage Trait
// ----------------------------------------------------------------------------

/// Durable key-value storage for the device credential
///
/// `get` returning `Ok(None)` means "not paired yet" and is not an error. `put` must
/// replace the row atomically: a concurrent `get` sees either the old or the new
/// credential, never a partial write.
#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load the stored credential, if any
    async fn get(&self) -> Result<Option<DeviceCredential>, StoreError>;

    /// Insert or atomically overwrite the credential row
    async fn put(&self, credential: &DeviceCredential) -> Result<(), StoreError>;

    /// Remove the credential row (revocation, unpair)
    async fn clear(&self) -> Result<(), StoreError>;

    /// Human-readable location for log lines; must not include secrets
    fn describe(&self) -> String;
}

// ----------------------------------------------------------------------------
// Connection Configuration
// ----------------------------------------------------------------------------

/// Externally supplied parameters for the backing database
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub sslmode: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "botlink".to_string(),
            user: "botlink".to_string(),
            password: String::new(),
            sslmode: "disable".to_string(),
        }
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"***")
            .field("sslmode", &self.sslmode)
            .finish()
    }
}

impl StoreConfig {
    /// Build the connection string for the configured database
    pub fn resolve_connection_string(&self) -> Result<ConnectionString, BotlinkError> {
        if self.host.trim().is_empty() {
            return Err(BotlinkError::configuration("Store host must not be empty"));
        }
        if self.port == 0 {
            return Err(BotlinkError::configuration("Store port must be non-zero"));
        }
        if self.database.trim().is_empty() {
            return Err(BotlinkError::configuration("Store database name must not be empty"));
        }
        if self.user.trim().is_empty() {
            return Err(BotlinkError::configuration("Store user must not be empty"));
        }

        let invalid = |what: &str| BotlinkError::configuration(format!("Invalid store {}", what));

        let mut url = Url::parse("postgres://localhost")
            .map_err(|e| BotlinkError::configuration(e.to_string()))?;
        url.set_host(Some(self.host.trim()))
            .map_err(|e| BotlinkError::configuration(format!("Invalid store host: {}", e)))?;
        url.set_port(Some(self.port)).map_err(|_| invalid("port"))?;
        url.set_username(&self.user).map_err(|_| invalid("user"))?;
        if !self.password.is_empty() {
            url.set_password(Some(&self.password))
                .map_err(|_| invalid("password"))?;
        }
        url.set_path(&self.database);
        if !self.sslmode.is_empty() {
            url.query_pairs_mut().append_pair("sslmode", &self.sslmode);
        }

        Ok(ConnectionString { url })
    }
}

/// Resolved connection handle for the backing store
///
/// `Display` and `Debug` redact the password; use [`ConnectionString::expose`] only when
/// handing the string to a driver.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    url: Url,
}

impl ConnectionString {
    pub fn parse(raw: &str) -> Result<Self, BotlinkError> {
        let url = Url::parse(raw)
            .map_err(|e| BotlinkError::configuration(format!("Invalid connection string: {}", e)))?;
        Ok(Self { url })
    }

    /// Full connection string including the password
    pub fn expose(&self) -> &str {
        self.url.as_str()
    }

    pub fn redacted(&self) -> String {
        let mut url = self.url.clone();
        if url.password().is_some() {
            let _ = url.set_password(Some("***"));
        }
        url.to_string()
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> Option<u16> {
        self.url.port()
    }

    pub fn database(&self) -> &str {
        self.url.path().trim_start_matches('/')
    }

    pub fn user(&self) -> &str {
        self.url.username()
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionString")
            .field(&self.redacted())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Memory Storage Implementation
// ----------------------------------------------------------------------------

/// In-memory store for tests and ephemeral runs
///
/// Availability can be toggled and a one-shot `get` error injected to exercise the
/// runtime's failure paths.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    row: RwLock<Option<DeviceCredential>>,
    unavailable: AtomicBool,
    injected_get_error: Mutex<Option<StoreError>>,
    puts: AtomicU64,
    clears: AtomicU64,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds a credential (a previously paired device)
    pub fn with_credential(credential: DeviceCredential) -> Self {
        Self {
            row: RwLock::new(Some(credential)),
            ..Self::default()
        }
    }

    /// Simulate the backing store going away (`false`) or coming back (`true`)
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Make the next `get` fail with `error`
    pub fn inject_get_error(&self, error: StoreError) {
        if let Ok(mut slot) = self.injected_get_error.lock() {
            *slot = Some(error);
        }
    }

    /// Number of successful `put` calls
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    /// Number of successful `clear` calls
    pub fn clear_count(&self) -> u64 {
        self.clears.load(Ordering::SeqCst)
    }

    /// Current row without going through the availability check
    pub async fn snapshot(&self) -> Option<DeviceCredential> {
        self.row.read().await.clone()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                reason: "memory store marked unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self) -> Result<Option<DeviceCredential>, StoreError> {
        self.check_available()?;
        let injected = self
            .injected_get_error
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(error) = injected {
            return Err(error);
        }
        Ok(self.row.read().await.clone())
    }

    async fn put(&self, credential: &DeviceCredential) -> Result<(), StoreError> {
        self.check_available()?;
        *self.row.write().await = Some(credential.clone());
        self.puts.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(fingerprint = %credential.fingerprint(), "Memory store row replaced");
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.check_available()?;
        *self.row.write().await = None;
        self.clears.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Memory store row cleared");
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
