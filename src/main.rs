//! SEB Session — exam client connection session server
//!
//! Tracks every SEB client connection of running exams: the connection
//! lifecycle, liveness pings, queued instructions, pending notifications,
//! and proctoring room assignment. Exposed as JSON-RPC 2.0 over HTTP.
//!
//! Usage:
//!   seb-session                                  # Default port 8080
//!   seb-session --port 9090                      # Custom port
//!   seb-session --config session.json            # Exams and tuning from a file
//!   seb-session --ping-threshold-ms 10000        # Override the missing-ping threshold

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use seb_protocol::MonitoringEvent;
use seb_server::{InstructionCleanupJob, PingSweepJob, RoomReconcileJob, Scheduler, SessionServer};
use seb_services::{SessionConfig, SessionManager};
use seb_transport::server::{TransportConfig, TransportServer};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "seb-session", about = "SEB Session — exam client connection session server")]
struct Cli {
    /// Port to listen on (0 for OS-assigned)
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Hostname to bind to
    #[arg(long, default_value = "127.0.0.1")]
    hostname: String,

    /// Session configuration file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Missing-ping threshold in milliseconds (overrides the config file)
    #[arg(long)]
    ping_threshold_ms: Option<u64>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Write logs to a file (defaults to ./logs/seb-session.log if no path given)
    #[arg(long, default_missing_value = "DEFAULT", num_args = 0..=1)]
    log_file: Option<String>,

    /// Allow cross-origin requests (monitoring console served elsewhere)
    #[arg(long)]
    enable_cors: bool,
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    if let Some(ref log_file_arg) = cli.log_file {
        let log_path = if log_file_arg == "DEFAULT" {
            PathBuf::from("logs/seb-session.log")
        } else {
            PathBuf::from(log_file_arg)
        };

        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();

        eprintln!("Logging to {}", log_path.display());
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

/// Log every monitoring event and forward it to event-stream subscribers.
fn spawn_monitoring_forwarder(
    mut events: broadcast::Receiver<MonitoringEvent>,
    server: Arc<SessionServer>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    match &event {
                        MonitoringEvent::MissingPing { token, last_ping, .. } => {
                            warn!("Incident: {} missing ping since {}", token, last_ping)
                        }
                        MonitoringEvent::PingRecovered { token, .. } => info!("Incident cleared: {}", token),
                        MonitoringEvent::StatusChanged { .. } => {}
                    }
                    server.emit_monitoring(&event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Monitoring forwarder lagged, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    let mut config = match &cli.config {
        Some(path) => SessionConfig::load(path).with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(threshold) = cli.ping_threshold_ms {
        config.ping_threshold_ms = threshold;
    }

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                      SEB Session Server                      ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    println!("  Port:            {}", cli.port);
    println!("  Binding:         {}", cli.hostname);
    println!("  Exams:           {}", config.exams.len());
    println!("  Ping threshold:  {} ms", config.ping_threshold_ms);
    match &config.minimum_seb_version {
        Some(v) => println!("  Minimum SEB:     {v}"),
        None => println!("  Minimum SEB:     any"),
    }
    println!();

    let manager = Arc::new(SessionManager::in_memory(config));
    manager.restore().context("Failed to restore queued instructions")?;

    // Shared notification channel — monitoring events for /events subscribers
    let (notification_tx, _) = broadcast::channel::<String>(1024);

    let mut session_server = SessionServer::with_session_services(manager.clone());
    session_server.set_notification_sender(notification_tx.clone());
    session_server
        .initialize()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize session server: {e}"))?;
    let session_server = Arc::new(session_server);

    let forwarder = spawn_monitoring_forwarder(manager.subscribe(), session_server.clone());

    // Registration order is execution order when several jobs are due.
    let mut scheduler = Scheduler::new();
    scheduler.register(PingSweepJob::new(manager.clone()));
    scheduler.register(RoomReconcileJob::new(manager.clone()));
    scheduler.register(InstructionCleanupJob::new(manager.clone()));
    let scheduler = scheduler.start();

    let transport_config = TransportConfig {
        port: cli.port,
        hostname: cli.hostname.clone(),
        enable_cors: cli.enable_cors,
        verbose_logging: cli.verbose,
    };
    let mut transport = TransportServer::start_with_sender(transport_config, session_server, notification_tx)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start transport: {e}"))?;

    println!("────────────────────────────────────────────────────────────────");
    println!();
    println!("  Server running!");
    println!();
    println!("  JSON-RPC endpoint:");
    println!("    http://{}:{}/rpc", cli.hostname, transport.port());
    println!("  Monitoring events:");
    println!("    http://{}:{}/events", cli.hostname, transport.port());
    println!();
    println!("  Press Ctrl+C to stop.");
    println!();

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;

    println!();
    println!("  Shutting down...");
    transport.stop().await;
    scheduler.stop().await;
    forwarder.abort();
    println!("  Server stopped.");
    Ok(())
}
