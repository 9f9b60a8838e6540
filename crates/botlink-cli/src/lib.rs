//! botlink CLI library
//!
//! Components behind the `botlink` binary: layered configuration, a file-backed
//! credential store, the interactive console transport and terminal pairing renderer.

pub mod app;
pub mod cli;
pub mod config;
pub mod console;
pub mod error;
pub mod render;
pub mod store;

pub use cli::{Cli, Commands};
pub use config::AppConfig;
pub use console::ConsoleTransport;
pub use error::{CliError, Result};
pub use store::FileCredentialStore;
