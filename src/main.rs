use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use peer_keeper::p2p::{
    classify, load_keeper_config, run_connection_maintainer, ConnectionMaintainer,
    CountingTransport, KeeperConfig, LoopbackTransport,
};

// ========= CLI =========

#[derive(Parser, Debug)]
#[command(name = "peer-keeper", version, about = "Keeps a node connected to its peer registry")]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a config and print what the first check would do (JSON)
    Check {
        /// Path to the keeper config (TOML)
        #[arg(long)]
        config: PathBuf,
    },

    /// Run the maintainer against the in-memory transport
    Run {
        /// Path to the keeper config (TOML)
        #[arg(long)]
        config: PathBuf,

        /// Stop after this many checks
        #[arg(long)]
        ticks: Option<u64>,

        /// How often the loop wakes up, in milliseconds
        #[arg(long = "poll-ms", default_value_t = 1000)]
        poll_ms: u64,
    },
}

fn init_tracing() {
    // init tracing from env PEER_KEEPER_LOG or RUST_LOG
    let filter = std::env::var("PEER_KEEPER_LOG")
        .unwrap_or_else(|_| std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()));
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

fn plan(config: &KeeperConfig) -> serde_json::Value {
    let maintainer = ConnectionMaintainer::new(config.clone(), LoopbackTransport::new());
    let rec = classify(maintainer.registry(), &[]);

    let dial_now: Vec<&String> = rec
        .missing
        .iter()
        .filter(|name| !rec.ambiguous.contains(*name) && !maintainer.nice_peers().contains(*name))
        .collect();

    serde_json::json!({
        "node": config.node_name,
        "peers": maintainer.registry(),
        "check_interval_secs": config.check_interval().as_secs(),
        "nice_window_secs": config.reconnect_to_missing_in_secs,
        "waits_for": maintainer.nice_peers(),
        "dials_first": dial_now,
        "ambiguous": rec.ambiguous,
        "faults": rec.faults.iter().map(|f| f.to_string()).collect::<Vec<_>>(),
    })
}

async fn run(config: KeeperConfig, ticks: Option<u64>, poll_every: Duration) -> Result<()> {
    // every registered peer answers on the loopback transport
    let mut transport = LoopbackTransport::new();
    for (name, address) in config.registry.iter() {
        transport.add_peer(name, address.clone());
    }

    let maintainer = ConnectionMaintainer::new(config, CountingTransport::new(transport));
    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    let maintainer = run_connection_maintainer(maintainer, poll_every, ticks, shutdown).await;

    let summary = serde_json::json!({
        "node": maintainer.node_name(),
        "stats": maintainer.stats(),
        "handshakes": {
            "joins": maintainer.transport().counters().joins,
            "allows": maintainer.transport().counters().allows,
            "failures": maintainer.transport().counters().failures,
        },
        "not_connected": maintainer.not_connected_peers(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Check { config } => {
            let config = load_keeper_config(&config)?;
            println!("{}", serde_json::to_string_pretty(&plan(&config))?);
        }
        Commands::Run {
            config,
            ticks,
            poll_ms,
        } => {
            let config = load_keeper_config(&config)?;
            info!(node = %config.node_name, "peer-keeper starting up");

            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("Failed to build tokio runtime")?;
            let local = tokio::task::LocalSet::new();
            local.block_on(&rt, run(config, ticks, Duration::from_millis(poll_ms)))?;
        }
    }

    Ok(())
}
