use anyhow::Context;
use clap::Parser;
use mbroker_core::{BrokerAuditLogger, BrokerConfig, EventSink, SqliteStore, create_audit_logger};
use mbroker_peer::{HttpPeerClient, PermissionSynchronizer};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mbroker-peer")]
#[command(about = "Synchronise project permissions to a remote peer instance")]
struct Args {
    /// Base URL of the peer API
    #[arg(long)]
    peer_url: String,

    /// API token for the peer
    #[arg(long, env = "MBROKER_PEER_TOKEN", hide_env_values = true)]
    peer_token: String,

    /// Peer customer new projects are created under
    #[arg(long, default_value = "default")]
    peer_customer: String,

    /// SQLite database holding projects and permissions
    #[arg(short, long, default_value = "/var/lib/mbroker/broker.db")]
    database: String,

    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds between runs, overrides the config
    #[arg(long)]
    interval: Option<u64>,

    /// Log service endpoint for audit logging
    #[arg(long)]
    log_endpoint: Option<String>,

    /// Run a single sync and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("mbroker_peer=info,mbroker_engine=info,mbroker_core=info,reqwest=warn")
            }),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => BrokerConfig::load(path)?,
        None => BrokerConfig::default(),
    };
    let period = Duration::from_secs(args.interval.unwrap_or(config.reconcile_interval_secs).max(1));

    let store = Arc::new(
        SqliteStore::open(&args.database)
            .await
            .with_context(|| format!("failed to open database {}", args.database))?,
    );
    let client = Arc::new(HttpPeerClient::new(&args.peer_url, &args.peer_token)?);
    let audit = match &args.log_endpoint {
        Some(endpoint) => create_audit_logger(endpoint, "mbroker-peer"),
        None => Arc::new(BrokerAuditLogger::new_noop()),
    };

    let synchronizer = PermissionSynchronizer::new(
        client,
        store,
        EventSink::new(audit),
        config.blacklisted_usernames.clone(),
        args.peer_customer.clone(),
    );

    info!(peer = %args.peer_url, database = %args.database, period_secs = period.as_secs(), "Starting mbroker-peer");

    if args.once {
        synchronizer.sync_all().await?;
        return Ok(());
    }

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = synchronizer.sync_all().await {
                    error!(error = %e, "Peer sync run failed");
                }
            }
            _ = signal::ctrl_c() => {
                info!("Received SIGINT");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                break;
            }
        }
    }

    info!("Shutdown complete");
    Ok(())
}
