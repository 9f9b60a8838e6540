//! Command-line interface definitions and parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Data directory for the credential file
    #[arg(short, long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Keep the credential in memory only (nothing survives a restart)
    #[arg(long, global = true)]
    pub memory_store: bool,
}

impl Cli {
    /// Subcommand to execute; `run` when none was given
    pub fn command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Run { no_qr: false })
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Pair if needed, then serve messages until interrupted
    Run {
        /// Print pairing codes as text only
        #[arg(long)]
        no_qr: bool,
    },
    /// Show whether a credential is stored and where
    Status {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete the stored credential so the next run pairs again
    Unpair,
    /// Print an example configuration file
    ExampleConfig,
}
