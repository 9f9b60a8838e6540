//! botlink Harness
//!
//! Test support for the botlink runtime: a scriptable [`MockTransport`] and its
//! [`MockController`].

pub mod mock_transport;

pub use mock_transport::{ConnectBehavior, MockController, MockTransport, MockTransportConfig};
