//! botlink CLI Configuration Management
//!
//! Configuration is layered with figment, lowest priority first:
//! - built-in defaults
//! - `botlink.toml` in the working directory
//! - an explicit `--config` file
//! - `BOTLINK_`-prefixed environment variables (`__` separates sections, e.g.
//!   `BOTLINK_STORE__HOST`)
//! - command line flags

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use botlink_core::{
    BackoffConfig, BotlinkConfig, ConnectionConfig, ConnectionString, DispatchConfig,
    PairingConfig, StoreConfig,
};

use crate::cli::{Cli, Commands};

/// Configuration file picked up from the working directory
pub const DEFAULT_CONFIG_FILE: &str = "botlink.toml";

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "BOTLINK_";

// ----------------------------------------------------------------------------
// CLI Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the botlink binary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Backing database parameters (resolved into the connection string)
    pub store: StoreConfig,

    /// Where and how the credential row is kept
    pub storage: StorageConfig,

    /// Lifecycle timing and dispatch tuning
    pub runtime: RuntimeSettings,

    /// Local console surface
    pub console: ConsoleConfig,
}

/// Credential storage backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// JSON file under the data directory
    #[default]
    File,
    /// Process memory; every start pairs again
    Memory,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StoreBackend,

    /// Defaults to the platform data directory
    pub data_dir: Option<PathBuf>,
}

/// Lifecycle tuning, in operator-friendly units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    pub reconnect_base_ms: u64,
    pub reconnect_max_secs: u64,
    pub reconnect_multiplier: f64,
    pub reconnect_jitter: f64,
    pub pairing_timeout_secs: u64,
    pub pairing_retry_secs: u64,
    pub connect_timeout_secs: u64,
    pub queue_capacity: usize,
    pub drain_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleConfig {
    /// Render pairing codes as terminal QR codes
    pub qr: bool,

    /// Seconds between pairing code rotations
    pub code_rotation_secs: u64,

    /// Conversation used for lines typed without a `chat:` prefix
    pub default_chat: String,
}

// ----------------------------------------------------------------------------
// Default Implementations
// ----------------------------------------------------------------------------

impl Default for RuntimeSettings {
    fn default() -> Self {
        let core = BotlinkConfig::default();
        Self {
            reconnect_base_ms: core.backoff.base_delay.as_millis() as u64,
            reconnect_max_secs: core.backoff.max_delay.as_secs(),
            reconnect_multiplier: core.backoff.multiplier,
            reconnect_jitter: core.backoff.jitter,
            pairing_timeout_secs: core.pairing.timeout.as_secs(),
            pairing_retry_secs: core.pairing.retry_delay.as_secs(),
            connect_timeout_secs: core.connection.connect_timeout.as_secs(),
            queue_capacity: core.dispatch.queue_capacity,
            drain_timeout_secs: core.dispatch.drain_timeout.as_secs(),
        }
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            qr: true,
            code_rotation_secs: 20,
            default_chat: "console".to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Loading Logic
// ----------------------------------------------------------------------------

impl AppConfig {
    /// Layered provider chain without command line overrides
    pub fn figment(explicit: Option<&Path>) -> Figment {
        let mut figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(DEFAULT_CONFIG_FILE));
        if let Some(path) = explicit {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load configuration the way the binary does, flags winning over everything else
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        if let Some(path) = &cli.config {
            if !path.is_file() {
                return Err(ConfigError::Loading(format!(
                    "Configuration file not found: {}",
                    path.display()
                )));
            }
        }
        Self::from_figment(Self::with_overrides(
            Self::figment(cli.config.as_deref()),
            cli,
        ))
    }

    /// Apply command line flags on top of `figment`
    pub fn with_overrides(mut figment: Figment, cli: &Cli) -> Figment {
        if let Some(dir) = &cli.data_dir {
            figment = figment.merge(("storage.data_dir", dir));
        }
        if cli.memory_store {
            figment = figment.merge(("storage.backend", StoreBackend::Memory));
        }
        if let Commands::Run { no_qr: true } = cli.command() {
            figment = figment.merge(("console.qr", false));
        }
        figment
    }

    /// Extract and validate
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: AppConfig = figment
            .extract()
            .map_err(|e| ConfigError::Loading(format!("Failed to load configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.to_runtime_config()
            .validate()
            .map_err(ConfigError::Validation)?;
        self.connection_string()?;

        if self.console.code_rotation_secs == 0 {
            return Err(ConfigError::Validation(
                "Pairing code rotation interval must be greater than 0".to_string(),
            ));
        }
        if self.console.default_chat.trim().is_empty() {
            return Err(ConfigError::Validation(
                "Default chat must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Core runtime configuration
    pub fn to_runtime_config(&self) -> BotlinkConfig {
        let r = &self.runtime;
        BotlinkConfig {
            backoff: BackoffConfig {
                base_delay: Duration::from_millis(r.reconnect_base_ms),
                max_delay: Duration::from_secs(r.reconnect_max_secs),
                multiplier: r.reconnect_multiplier,
                jitter: r.reconnect_jitter,
            },
            pairing: PairingConfig {
                timeout: Duration::from_secs(r.pairing_timeout_secs),
                retry_delay: Duration::from_secs(r.pairing_retry_secs),
            },
            connection: ConnectionConfig {
                connect_timeout: Duration::from_secs(r.connect_timeout_secs),
            },
            dispatch: DispatchConfig {
                queue_capacity: r.queue_capacity,
                drain_timeout: Duration::from_secs(r.drain_timeout_secs),
            },
        }
    }

    pub fn connection_string(&self) -> Result<ConnectionString, ConfigError> {
        self.store
            .resolve_connection_string()
            .map_err(|e| ConfigError::Validation(e.to_string()))
    }

    /// Directory holding the credential file
    pub fn data_dir(&self) -> PathBuf {
        self.storage.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|dir| dir.join("botlink"))
                .unwrap_or_else(|| PathBuf::from(".botlink"))
        })
    }

    /// Create example configuration file content
    pub fn example_config() -> String {
        let example = AppConfig {
            store: StoreConfig {
                host: "db.internal".to_string(),
                database: "botlink".to_string(),
                user: "bot".to_string(),
                password: "change-me".to_string(),
                sslmode: "require".to_string(),
                ..StoreConfig::default()
            },
            storage: StorageConfig {
                backend: StoreBackend::File,
                data_dir: Some(PathBuf::from("/var/lib/botlink")),
            },
            ..Default::default()
        };

        toml::to_string_pretty(&example)
            .unwrap_or_else(|e| format!("# Failed to generate example config: {}\n", e))
    }
}

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Configuration-related errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration loading error: {0}")]
    Loading(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn layered(toml: &str) -> Result<AppConfig, ConfigError> {
        AppConfig::from_figment(
            Figment::new()
                .merge(Serialized::defaults(AppConfig::default()))
                .merge(Toml::string(toml)),
        )
    }

    #[test]
    fn test_default_config_matches_core_defaults() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.to_runtime_config(), BotlinkConfig::default());
        assert_eq!(config.storage.backend, StoreBackend::File);
        assert!(config.console.qr);
    }

    #[test]
    fn test_partial_file_overrides_defaults() {
        let config = layered(
            r#"
            [store]
            host = "db.example"
            port = 6543

            [runtime]
            pairing_timeout_secs = 30
            reconnect_jitter = 0.0
            "#,
        )
        .unwrap();

        assert_eq!(config.store.host, "db.example");
        assert_eq!(config.store.database, "botlink");
        let runtime = config.to_runtime_config();
        assert_eq!(runtime.pairing.timeout, Duration::from_secs(30));
        assert_eq!(runtime.backoff.jitter, 0.0);
        assert_eq!(runtime.connection.connect_timeout, Duration::from_secs(30));

        let conn = config.connection_string().unwrap();
        assert_eq!(conn.host(), "db.example");
        assert_eq!(conn.port(), Some(6543));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(layered("[runtime]\nqueue_capacity = 0").is_err());
        assert!(layered("[runtime]\nreconnect_multiplier = 0.5").is_err());
        assert!(layered("[store]\nhost = \"\"").is_err());
        assert!(layered("[console]\ncode_rotation_secs = 0").is_err());
        assert!(layered("[storage]\nbackend = \"sqlite\"").is_err());
    }

    #[test]
    fn test_flags_override_layers() {
        let cli = Cli::parse_from([
            "botlink",
            "run",
            "--no-qr",
            "--memory-store",
            "--data-dir",
            "/srv/botlink",
        ]);
        let base = Figment::new()
            .merge(Serialized::defaults(AppConfig::default()))
            .merge(Toml::string("[storage]\ndata_dir = \"/etc/ignored\""));
        let config = AppConfig::from_figment(AppConfig::with_overrides(base, &cli)).unwrap();

        assert_eq!(config.storage.backend, StoreBackend::Memory);
        assert_eq!(config.data_dir(), PathBuf::from("/srv/botlink"));
        assert!(!config.console.qr);
    }

    #[test]
    fn test_example_config_round_trips() {
        let example = AppConfig::example_config();
        assert!(example.contains("[store]"));
        assert!(example.contains("[storage]"));
        assert!(example.contains("[runtime]"));
        assert!(example.contains("[console]"));

        let parsed = layered(&example).unwrap();
        assert_eq!(parsed.store.host, "db.internal");
        assert_eq!(parsed.data_dir(), PathBuf::from("/var/lib/botlink"));
    }
}
