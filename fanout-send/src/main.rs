//! fanout-send - dispatcher daemon for scheduled publishing
//!
//! Polls the job queue and publishes due posts at the right time: claims
//! jobs, runs them through the publish executor, applies retry backoff,
//! and reclaims jobs left running by a crashed worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use libfanout::vault::NoRefresher;
use libfanout::{Config, FanoutService, FanoutError, Result};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "fanout-send")]
#[command(version)]
#[command(about = "Dispatcher daemon for scheduled publishing")]
#[command(long_about = "\
fanout-send - dispatcher daemon for scheduled publishing

DESCRIPTION:
    fanout-send is a long-running daemon that polls the Fanout job queue
    and publishes scheduled posts when they come due.

    Each tick atomically claims due jobs, resolves provider credentials
    through the vault, applies rate limits, calls the provider adapter,
    and re-arms or fails jobs according to the retry policy. Multiple
    daemon instances may share one database; job claims are conditional,
    so each job runs at most once per attempt.

USAGE:
    # Run in foreground (logs to stderr)
    fanout-send

    # Run with a custom poll interval
    fanout-send --poll-interval 10

    # Process due jobs once and exit
    fanout-send --once

SIGNALS:
    SIGTERM, SIGINT - graceful shutdown (finishes the current tick)

CONFIGURATION:
    Configuration file: ~/.config/fanout/config.toml (or $FANOUT_CONFIG)
    Vault secret:       $FANOUT_VAULT_SECRET

EXIT CODES:
    0 - clean shutdown
    1 - runtime error
    2 - configuration error
")]
struct Cli {
    /// Poll interval in seconds (overrides config)
    #[arg(long, value_name = "SECONDS")]
    #[arg(help = "How often to check for due jobs (default: 30)")]
    poll_interval: Option<u64>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Run one tick and exit (for testing)
    #[arg(long, hide = true)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        libfanout::logging::LoggingConfig::new(
            libfanout::logging::LogFormat::Text,
            "debug".to_string(),
            true,
        )
        .init();
    } else {
        libfanout::logging::init_default();
    }

    if let Err(e) = run(cli).await {
        error!("{}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(seconds) = cli.poll_interval {
        config.dispatcher.poll_interval = format!("{}s", seconds);
    }

    let service = FanoutService::from_config(config, Arc::new(NoRefresher)).await?;
    let dispatcher = service.dispatcher();

    info!("fanout-send daemon starting");

    if cli.once {
        let now = chrono::Utc::now().timestamp();
        let processed = dispatcher.tick(now).await?;
        info!(processed, "fanout-send: processed due jobs once, exiting");
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    dispatcher.run(shutdown).await?;

    info!("fanout-send daemon stopped");
    Ok(())
}

/// Set up signal handlers for graceful shutdown.
#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])
        .map_err(|e| FanoutError::InvalidInput(format!("Signal setup failed: {}", e)))?;

    std::thread::spawn(move || {
        for sig in signals.forever() {
            match sig {
                SIGTERM | SIGINT => {
                    info!("Received shutdown signal, stopping gracefully...");
                    shutdown.store(true, Ordering::Relaxed);
                    break;
                }
                _ => {}
            }
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(_shutdown: Arc<AtomicBool>) -> Result<()> {
    Ok(())
}
