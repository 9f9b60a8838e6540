//! botlink - paired-device messaging bot

use std::{process::ExitCode, time::Duration};

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use botlink_cli::{
    app,
    cli::{Cli, Commands},
    config::AppConfig,
    error::Result,
};

/// How long blocking tasks (stdin) may linger after the runtime stops
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let outcome = runtime.block_on(execute(cli));
    runtime.shutdown_timeout(SHUTDOWN_GRACE);

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("botlink failed: {}", e);
            e.exit_code()
        }
    }
}

async fn execute(cli: Cli) -> Result<()> {
    let command = cli.command();
    if command == Commands::ExampleConfig {
        print!("{}", AppConfig::example_config());
        return Ok(());
    }

    let config = AppConfig::load(&cli)?;

    match command {
        Commands::Run { .. } => {
            info!(backend = ?config.storage.backend, "Starting botlink");
            app::run(&config).await?;
        }
        Commands::Status { json } => {
            let report = app::status(&config).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report);
            }
        }
        Commands::Unpair => {
            if app::unpair(&config).await? {
                println!("Stored credential removed; the next run will pair again");
            } else {
                println!("No stored credential");
            }
        }
        Commands::ExampleConfig => {}
    }
    Ok(())
}

/// Setup logging based on verbosity level; `RUST_LOG` wins when set
fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();
}
