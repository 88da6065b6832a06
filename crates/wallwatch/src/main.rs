//! wallwatch: order-book wall monitor.
//!
//! Usage:
//!   wallwatch --symbols SBER,GAZP --replay capture.jsonl [OPTIONS]
//!
//! Options:
//!   -s, --symbols <SYMBOLS>   Comma-separated symbols (overrides config)
//!   -c, --config <FILE>       Config file path (default: config/wallwatch.toml)
//!   --replay <FILE>           JSONL market-data capture to stream from
//!   --speed <SPEED>           Replay pacing (0 = max speed, 1.0 = recorded pace)
//!   --depth <DEPTH>           Top-N depth override
//!
//! Exit codes: 0 clean shutdown, 2 config error, 3 auth/resolver error,
//! 4 unrecoverable transport error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use wallwatch::config::{ConfigError, WatchConfig};
use wallwatch::sink::{spawn_sink_worker, ConsoleSink};
use wallwatch::stream::replay::ReplayFeed;
use wallwatch::stream::supervisor::{Supervisor, SupervisorError, SupervisorHandle};
use wallwatch::stream::StaticResolver;

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "wallwatch")]
#[command(about = "Order-book wall monitor")]
#[command(version)]
struct Args {
    /// Comma-separated symbols to watch (overrides config)
    #[arg(short, long, value_delimiter = ',')]
    symbols: Option<Vec<String>>,

    /// Config file path
    #[arg(short, long, default_value = "config/wallwatch.toml")]
    config: PathBuf,

    /// JSONL market-data capture to stream from
    #[arg(long)]
    replay: PathBuf,

    /// Replay pacing multiplier (0 = max speed, 1.0 = recorded pace)
    #[arg(long, default_value_t = 0.0)]
    speed: f64,

    /// Top-N depth override
    #[arg(long)]
    depth: Option<usize>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

/// Map fatal errors onto the documented exit codes.
fn exit_code_for(error: &anyhow::Error) -> u8 {
    if error.downcast_ref::<ConfigError>().is_some() {
        return 2;
    }
    match error.downcast_ref::<SupervisorError>() {
        Some(SupervisorError::Resolve(_)) | Some(SupervisorError::AuthRejected(_)) => 3,
        Some(SupervisorError::Transport(_)) => 4,
        None => 1,
    }
}

async fn run() -> Result<()> {
    // Load environment variables from .env file (if present).
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            eprintln!("Warning: failed to load .env file: {e}");
        }
    }

    let args = Args::parse();

    let mut config = if args.config.exists() {
        WatchConfig::from_file(&args.config)
            .with_context(|| format!("failed to load config from {:?}", args.config))?
    } else {
        warn!("config file not found at {:?}, using defaults", args.config);
        WatchConfig::default()
    };
    config.apply_env_overrides()?;

    if let Some(symbols) = args.symbols {
        config.symbols = symbols;
    }
    if let Some(depth) = args.depth {
        config.detector.depth = depth;
    }

    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set global tracing subscriber")?;

    config.validate()?;
    if config.normalized_symbols().is_empty() {
        return Err(ConfigError::Invalid(
            "no symbols configured; pass --symbols or set them in the config".into(),
        )
        .into());
    }

    info!("starting wallwatch");
    info!(symbols = ?config.normalized_symbols(), depth = config.detector.depth, "watch list");
    info!(capture = %args.replay.display(), speed = args.speed, "replay transport");

    let resolver = Arc::new(StaticResolver::new(
        config.instruments.iter().map(|entry| entry.to_info()),
    ));
    let feed = Arc::new(ReplayFeed::new(&args.replay, args.speed));

    let (supervisor, handle) = Supervisor::new(resolver, feed, &config);

    // Sinks subscribe before the supervisor starts so no event is missed.
    let console_worker = spawn_sink_worker(
        Arc::new(ConsoleSink),
        supervisor.events(),
        shutdown_receiver(&handle),
    );

    spawn_signal_handler(handle.clone());

    let result = supervisor.run().await;

    // The event channel is closed once the supervisor is gone; let the sink
    // drain whatever is still buffered.
    match console_worker.await {
        Ok(stats) => info!(
            delivered = stats.delivered,
            dropped = stats.dropped,
            "console sink drained"
        ),
        Err(e) => error!(error = %e, "console sink worker panicked"),
    }

    result.context("supervisor terminated")?;
    info!("clean shutdown");
    Ok(())
}

fn shutdown_receiver(handle: &SupervisorHandle) -> tokio::sync::broadcast::Receiver<()> {
    // Piggyback on the supervisor's shutdown channel for sink workers.
    handle.shutdown_subscribe()
}

fn spawn_signal_handler(handle: SupervisorHandle) {
    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            error!(error = %e, "signal handler failed");
            return;
        }
        info!("shutdown signal received");
        handle.shutdown();
    });
}

/// Wait for Ctrl+C or SIGTERM.
async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c().await?;
        info!("received Ctrl+C");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let args = Args::try_parse_from(["wallwatch", "--replay", "capture.jsonl"]).unwrap();
        assert_eq!(args.config.to_str().unwrap(), "config/wallwatch.toml");
        assert!(args.symbols.is_none());
        assert_eq!(args.speed, 0.0);
    }

    #[test]
    fn test_cli_symbols_split() {
        let args = Args::try_parse_from([
            "wallwatch",
            "--replay",
            "capture.jsonl",
            "--symbols",
            "SBER,GAZP",
        ])
        .unwrap();
        assert_eq!(
            args.symbols,
            Some(vec!["SBER".to_string(), "GAZP".to_string()])
        );
    }

    #[test]
    fn test_cli_requires_replay() {
        assert!(Args::try_parse_from(["wallwatch"]).is_err());
    }

    #[test]
    fn test_exit_code_mapping() {
        let config: anyhow::Error = ConfigError::Invalid("bad".into()).into();
        assert_eq!(exit_code_for(&config), 2);

        let auth: anyhow::Error = SupervisorError::AuthRejected("denied".into()).into();
        assert_eq!(exit_code_for(&auth), 3);

        let transport: anyhow::Error = SupervisorError::Transport("gone".into()).into();
        assert_eq!(exit_code_for(&transport), 4);

        let other = anyhow::anyhow!("misc");
        assert_eq!(exit_code_for(&other), 1);

        // Context wrapping keeps the downcast working.
        let wrapped = transport.context("supervisor terminated");
        assert_eq!(exit_code_for(&wrapped), 4);
    }
}
