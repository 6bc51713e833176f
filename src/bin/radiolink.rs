//! radiolink CLI binary.
//!
//! # Commands
//!
//! - `simulate` - Run one session against the in-process simulated radio
//! - `config` - Print the effective configuration as TOML

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use radiolink::{
    protocol::EndpointRole,
    transport::{SimPeerProfile, SimTransport},
    Config, LinkClient, SessionEnd, VERSION,
};

#[derive(Parser)]
#[command(name = "radiolink")]
#[command(version = VERSION)]
#[command(about = "Radio-link session state machine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a session against the simulated radio
    Simulate {
        /// Config file (default: user config dir, then RADIOLINK_* env)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Empty reads the peer serves after the handshake write
        #[arg(long, default_value = "1")]
        empty_reads: usize,

        /// Frames to deliver once the session is ready
        #[arg(long, default_value = "3")]
        frames: usize,

        /// Notifications to spread the frames over
        #[arg(long, default_value = "1")]
        notify: usize,

        /// Hide a characteristic from discovery (write, read, notify)
        #[arg(long)]
        drop_endpoint: Option<EndpointRole>,

        /// Print diagnostic events as JSON lines
        #[arg(long)]
        json_events: bool,

        /// Verbose logging
        #[arg(short, long)]
        verbose: bool,
    },

    /// Print configuration
    Config {
        /// Print built-in defaults instead of the effective configuration
        #[arg(long)]
        default: bool,

        /// Config file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            config,
            empty_reads,
            frames,
            notify,
            drop_endpoint,
            json_events,
            verbose,
        } => cmd_simulate(
            config,
            empty_reads,
            frames,
            notify,
            drop_endpoint,
            json_events,
            verbose,
        ),

        Commands::Config { default, config } => cmd_config(default, config),
    }
}

/// Explicit file, else the default location if it exists, else environment.
fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    if let Some(path) = path {
        return Config::from_file(&path)
            .with_context(|| format!("loading config from {}", path.display()));
    }
    match Config::default_path() {
        Some(path) if path.exists() => Ok(Config::from_file(path)?),
        _ => {
            let config = Config::from_env();
            config.validate()?;
            Ok(config)
        },
    }
}

fn cmd_config(default: bool, path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = if default {
        Config::default()
    } else {
        load_config(path)?
    };
    print!("{}", config.to_toml()?);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_simulate(
    config: Option<PathBuf>,
    empty_reads: usize,
    frames: usize,
    notify: usize,
    drop_endpoint: Option<EndpointRole>,
    json_events: bool,
    verbose: bool,
) -> anyhow::Result<()> {
    // Initialize logging
    let log_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(config)?;
    let profile = SimPeerProfile {
        ids: config.link,
        missing: drop_endpoint.into_iter().collect(),
        empty_reads_before_config: empty_reads,
        config_frames: vec![Bytes::from_static(b"\x0a\x06config")],
        ..Default::default()
    };
    let sim = Arc::new(SimTransport::new(profile));
    let client = LinkClient::new(Arc::clone(&sim), config);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        if json_events {
            let mut events = client.subscribe();
            tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    if let Ok(line) = serde_json::to_string(&event) {
                        println!("{line}");
                    }
                }
            });
        }

        let mut session = client.open();
        let mut stream = session
            .take_frames()
            .context("frame stream already taken")?;

        match session.wait_ready().await {
            Ok(()) => {
                tracing::info!("session ready; delivering {} frames", frames);
                let signals = notify.max(1);
                let per_signal = frames.div_ceil(signals).max(1);
                let payloads: Vec<Bytes> = (0..frames)
                    .map(|i| Bytes::from(format!("frame-{i}")))
                    .collect();
                for chunk in payloads.chunks(per_signal) {
                    sim.deliver(chunk.to_vec());
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                // Let the last drain cycle finish
                tokio::time::sleep(Duration::from_millis(50)).await;
                session.close();
            },
            Err(e) => tracing::warn!("session never became ready: {}", e),
        }

        let outcome = session.join().await?;
        while let Some(frame) = stream.next().await {
            let hex: String = frame.payload.iter().map(|b| format!("{b:02x}")).collect();
            eprintln!(
                "frame #{} ({}) {} bytes: {}",
                frame.sequence,
                frame.generation,
                frame.payload.len(),
                hex
            );
        }

        let stats = &outcome.stats;
        eprintln!("session {} ended: {:?}", outcome.session, outcome.end);
        eprintln!("  final state:        {}", outcome.final_state);
        eprintln!("  handshake attempts: {}", stats.handshake_attempts);
        eprintln!("  reads issued:       {}", stats.reads_issued);
        eprintln!("  empty reads:        {}", stats.empty_reads);
        eprintln!("  frames delivered:   {}", stats.frames_delivered);
        eprintln!(
            "  notifications:      {} ({} coalesced)",
            stats.notifications, stats.notifications_coalesced
        );
        eprintln!("  pulls:              {}", stats.pulls);
        if let Some(error) = &outcome.error {
            eprintln!("  error:              {error}");
        }

        match outcome.end {
            SessionEnd::Failed(kind) => Err(anyhow::anyhow!("session failed: {kind}")),
            SessionEnd::Closed | SessionEnd::PeerDisconnected => Ok(()),
        }
    })
}
