//! botlink Configuration
//!
//! Tunables for reconnect backoff, pairing, connect timeouts, and event dispatch,
//! with presets for production and for fast tests.

use core::time::Duration;
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Backoff Configuration
// ----------------------------------------------------------------------------

/// Bounded exponential backoff between reconnect attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry, and after any successful connection
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor between consecutive failures
    pub multiplier: f64,
    /// Random extra delay as a fraction of the nominal delay (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl BackoffConfig {
    /// Create configuration optimized for testing (fast, no jitter)
    pub fn testing() -> Self {
        Self {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(80),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.base_delay.is_zero() {
            return Err("Backoff base delay must be greater than zero".into());
        }
        if self.base_delay > self.max_delay {
            return Err("Backoff base delay cannot exceed the maximum delay".into());
        }
        if !(self.multiplier >= 1.0) {
            return Err("Backoff multiplier must be at least 1.0".into());
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err("Backoff jitter must be between 0.0 and 1.0".into());
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Pairing Configuration
// ----------------------------------------------------------------------------

/// First-run pairing behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairingConfig {
    /// Overall time allowed for the operator to confirm
    pub timeout: Duration,
    /// Pause before retrying after a timeout or cancellation
    pub retry_delay: Duration,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl PairingConfig {
    pub fn testing() -> Self {
        Self {
            timeout: Duration::from_millis(500),
            retry_delay: Duration::from_millis(20),
        }
    }
}

// ----------------------------------------------------------------------------
// Connection Configuration
// ----------------------------------------------------------------------------

/// Transport connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Upper bound on a single connect attempt
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl ConnectionConfig {
    pub fn testing() -> Self {
        Self {
            connect_timeout: Duration::from_millis(200),
        }
    }
}

// ----------------------------------------------------------------------------
// Dispatch Configuration
// ----------------------------------------------------------------------------

/// Event dispatcher settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Events buffered between the reader and the handler worker
    pub queue_capacity: usize,
    /// How long shutdown waits for an in-flight handler to finish
    pub drain_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            drain_timeout: Duration::from_secs(10),
        }
    }
}

impl DispatchConfig {
    pub fn testing() -> Self {
        Self {
            queue_capacity: 16,
            drain_timeout: Duration::from_secs(2),
        }
    }
}

// ----------------------------------------------------------------------------
// Aggregate Configuration
// ----------------------------------------------------------------------------

/// Complete runtime configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BotlinkConfig {
    pub backoff: BackoffConfig,
    pub pairing: PairingConfig,
    pub connection: ConnectionConfig,
    pub dispatch: DispatchConfig,
}

impl BotlinkConfig {
    /// Create configuration optimized for testing
    pub fn testing() -> Self {
        Self {
            backoff: BackoffConfig::testing(),
            pairing: PairingConfig::testing(),
            connection: ConnectionConfig::testing(),
            dispatch: DispatchConfig::testing(),
        }
    }

    /// Validate configuration values for consistency
    pub fn validate(&self) -> Result<(), String> {
        self.backoff.validate()?;

        if self.pairing.timeout.is_zero() {
            return Err("Pairing timeout must be greater than zero".into());
        }
        if self.connection.connect_timeout.is_zero() {
            return Err("Connect timeout must be greater than zero".into());
        }
        if self.dispatch.queue_capacity == 0 {
            return Err("Dispatch queue capacity cannot be zero".into());
        }

        Ok(())
    }
}
