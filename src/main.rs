//! lucid-dm - display/session manager daemon
//!
//! Entry point for the daemon binary.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lucid_dm::config::DaemonConfig;
use lucid_dm::session::SessionController;

/// Command-line arguments for lucid-dm
#[derive(Parser, Debug)]
#[command(name = "lucid-dm")]
#[command(version, about = "Display/session manager daemon", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/lucid-dm/config.toml")]
    pub config: String,

    /// Authentication service to converse with (overrides config)
    #[arg(short, long, env = "LUCID_SERVICE")]
    pub service: Option<String>,

    /// Verbose logging (can be specified multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log format (json|pretty|compact)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,

    /// Write logs to file (in addition to stdout)
    #[arg(long)]
    pub log_file: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!("lucid-dm v{}", env!("CARGO_PKG_VERSION"));

    let config = DaemonConfig::load(&args.config).unwrap_or_else(|e| {
        warn!("Failed to load config: {:#}, using defaults", e);
        DaemonConfig::default()
    });

    let service = args
        .service
        .clone()
        .unwrap_or_else(|| config.session.service.clone());

    info!("Initializing session controller");
    let (mut controller, mut outcomes) = SessionController::new(Arc::new(config))?;
    info!("Control channel at {}", controller.server_address());

    if let Err(e) = controller.start_conversation(&service).await {
        warn!("Could not start {} conversation: {}", service, e);
    }

    loop {
        tokio::select! {
            event = controller.next_event() => match event {
                Some(event) => controller.dispatch(event),
                None => break,
            },
            outcome = outcomes.recv() => {
                if let Some(outcome) = outcome {
                    info!("Session outcome: {:?}", outcome);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                controller.close().await;
                break;
            }
        }
    }

    info!("lucid-dm shut down");
    Ok(())
}

fn init_logging(args: &Args) -> Result<()> {
    use std::fs::File;

    let log_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("lucid_dm={log_level},warn")));

    // If log file is specified, write to both stdout and file
    if let Some(log_file_path) = &args.log_file {
        let file = File::create(log_file_path)?;

        match args.log_format.as_str() {
            "json" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_writer(std::io::stdout),
                    )
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_writer(file)
                            .with_ansi(false),
                    )
                    .init();
            }
            "compact" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .compact()
                            .with_writer(std::io::stdout),
                    )
                    .with(
                        tracing_subscriber::fmt::layer()
                            .compact()
                            .with_writer(file)
                            .with_ansi(false),
                    )
                    .init();
            }
            _ => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .pretty()
                            .with_writer(std::io::stdout),
                    )
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_writer(file)
                            .with_ansi(false),
                    )
                    .init();
            }
        }
        info!("Logging to file: {}", log_file_path);
    } else {
        match args.log_format.as_str() {
            "json" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().json())
                    .init();
            }
            "compact" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().compact())
                    .init();
            }
            _ => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().pretty())
                    .init();
            }
        }
    }

    Ok(())
}
