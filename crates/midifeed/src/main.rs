//! midifeed - MIDI input normalizer and live event feed
//!
//! Subcommands:
//! - `midifeed devices` - List MIDI input ports
//! - `midifeed listen` - Print, check or capture events from a device
//! - `midifeed serve` - Publish normalized events over SSE
//! - `midifeed config` - Print the effective configuration

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use feedconf::FeedConfig;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use midifeed::capture::CaptureWriter;
use midifeed::check::{plain_line, CheckLog};
use midifeed::source::{list_input_ports, MidiSource};
use midifeed::{run_session, server, telemetry, RawMessageEvent, SessionHandler, StatusRecord};

#[derive(Parser)]
#[command(name = "midifeed")]
#[command(about = "MIDI input normalizer with a live SSE feed")]
#[command(version)]
struct Cli {
    /// Config file (overrides ./midifeed.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List MIDI input devices
    Devices,

    /// Listen to a device and print, check or capture its events
    Listen {
        /// Device name keyword (case-insensitive substring)
        #[arg(short, long)]
        device: Option<String>,

        /// Print numbered press/release lines with hold times
        #[arg(long)]
        check: bool,

        /// Write events to a JSONL capture file
        #[arg(long)]
        capture: bool,

        /// Capture clock and other non-musical messages too
        #[arg(long)]
        capture_all: bool,

        /// Capture file name prefix
        #[arg(long)]
        capture_prefix: Option<String>,

        /// Seconds a note must be held to count as long
        #[arg(long)]
        hold_threshold: Option<f64>,

        /// Print every event, even with --check or --capture
        #[arg(short, long)]
        verbose: bool,
    },

    /// Serve normalized events over SSE
    Serve {
        /// HTTP port to bind
        #[arg(short, long)]
        port: Option<u16>,

        /// Publish clock and other non-musical messages too
        #[arg(long)]
        all: bool,

        /// Device name keyword (case-insensitive substring)
        #[arg(short, long)]
        device: Option<String>,

        /// Seconds a note must be held to count as long
        #[arg(long)]
        hold_threshold: Option<f64>,

        /// OTLP gRPC endpoint for span export (e.g., "localhost:4317")
        #[arg(long)]
        otlp_endpoint: Option<String>,

        /// Print every published event to stdout
        #[arg(short, long)]
        verbose: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (mut config, sources) = FeedConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Devices => {
            let _telemetry = telemetry::init(&config.telemetry.log_level, None)?;
            list_devices()
        }
        Commands::Listen {
            device,
            check,
            capture,
            capture_all,
            capture_prefix,
            hold_threshold,
            verbose,
        } => {
            if let Some(device) = device {
                config.device.keywords = vec![device];
            }
            if let Some(prefix) = capture_prefix {
                config.capture.prefix = prefix;
            }
            if let Some(threshold) = hold_threshold {
                config.normalize.hold_threshold_s = threshold;
            }
            config.capture.capture_all |= capture_all;
            config.verbose |= verbose;

            let _telemetry = telemetry::init(&config.telemetry.log_level, None)?;
            listen(&config, check, capture).await
        }
        Commands::Serve {
            port,
            all,
            device,
            hold_threshold,
            otlp_endpoint,
            verbose,
        } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(device) = device {
                config.device.keywords = vec![device];
            }
            if let Some(threshold) = hold_threshold {
                config.normalize.hold_threshold_s = threshold;
            }
            if otlp_endpoint.is_some() {
                config.telemetry.otlp_endpoint = otlp_endpoint;
            }
            config.server.include_all |= all;
            config.verbose |= verbose;

            let _telemetry = telemetry::init(
                &config.telemetry.log_level,
                config.telemetry.otlp_endpoint.as_deref(),
            )?;
            for file in &sources.files {
                info!("Loaded config: {}", file.display());
            }

            let cancel = CancellationToken::new();
            tokio::spawn(shutdown_signal(cancel.clone()));
            server::run(&config, cancel).await
        }
        Commands::Config => {
            for file in &sources.files {
                eprintln!("# from {}", file.display());
            }
            for var in &sources.env_overrides {
                eprintln!("# env {}", var);
            }
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn list_devices() -> Result<()> {
    let ports = list_input_ports()?;
    if ports.is_empty() {
        println!("No MIDI input devices found");
        return Ok(());
    }
    println!("MIDI input devices:");
    for port in ports {
        println!("- {}", port);
    }
    Ok(())
}

/// Console and file sinks for `listen`.
struct ListenHandler {
    capture: Option<CaptureWriter>,
    check: Option<CheckLog>,
    verbose: bool,
}

impl SessionHandler for ListenHandler {
    fn on_open(&mut self, device: &str) {
        println!("Listening: {}", device);
    }

    fn on_event(&mut self, event: RawMessageEvent) {
        if let Some(capture) = self.capture.as_mut() {
            if let Err(e) = capture.write_event(&event) {
                warn!("Capture write failed: {:#}", e);
            }
        }

        if let Some(check) = self.check.as_mut() {
            match check.observe(&event) {
                Ok(Some(line)) => println!("{}", line),
                Ok(None) => {}
                Err(e) => warn!("Check log write failed: {:#}", e),
            }
        }

        if self.verbose || (self.check.is_none() && self.capture.is_none()) {
            println!("{}", plain_line(&event));
        }
    }

    fn on_status(&mut self, status: StatusRecord) {
        info!(level = ?status.level, "{}", status.message);
    }
}

async fn listen(config: &FeedConfig, check: bool, capture: bool) -> Result<()> {
    list_devices()?;

    let threshold = config.normalize.hold_threshold_s;
    let check = if check {
        let log = CheckLog::create(&config.capture.dir, threshold)?;
        if let Some(path) = log.path() {
            println!("Check mode on, log: {}", path.display());
        }
        println!("Long-hold threshold: {:.3}s (set with --hold-threshold)", threshold);
        Some(log)
    } else {
        None
    };

    let capture = if capture {
        let writer = CaptureWriter::create(
            &config.capture.dir,
            &config.capture.prefix,
            threshold,
            config.capture.capture_all,
        )?;
        println!("Capture mode on, log: {}", writer.path().display());
        println!(
            "Capturing: {} (toggle with --capture-all)",
            if writer.captures_all() {
                "all events"
            } else {
                "useful events only (clock etc. filtered)"
            }
        );
        Some(writer)
    } else {
        None
    };

    let mut handler = ListenHandler {
        capture,
        check,
        verbose: config.verbose,
    };
    let mut source = MidiSource::new(config.device.keywords.clone());
    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    run_session(
        &mut source,
        &mut handler,
        Duration::from_millis(config.device.retry_ms),
        cancel,
    )
    .await;

    if let Some(capture) = &handler.capture {
        info!("Captured {} events to {}", capture.count(), capture.path().display());
    }
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!("Failed to listen for SIGTERM: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
    cancel.cancel();
}
