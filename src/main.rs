//! rangedb server and inspection binary

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rangedb::config::StoreConfig;
use rangedb::hlc::{Clock, HlcClock};
use rangedb::raft::{CommandApplier, RaftNode};
use rangedb::replica::ClockClosedTimestamps;
use rangedb::storage::{Engine, WalConfig};
use rangedb::store::Store;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rangedb")]
struct Args {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run a single-node store.
    Start(StartArgs),
    /// Offline inspection tools.
    #[command(subcommand)]
    Debug(DebugCmd),
}

#[derive(Parser, Debug)]
struct StartArgs {
    #[arg(long, env = "RANGEDB_NODE_ID", default_value_t = 1)]
    node_id: u64,

    #[arg(long, env = "RANGEDB_STORE_ID", default_value_t = 1)]
    store_id: u64,

    #[arg(long, env = "RANGEDB_RAFT_ADDR", default_value = "127.0.0.1:5000")]
    raft_addr: SocketAddr,

    #[arg(long, env = "RANGEDB_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// How far closed timestamps trail the clock.
    #[arg(long, env = "RANGEDB_CLOSED_TS_LAG_MS", default_value_t = 3000)]
    closed_ts_lag_ms: u64,

    /// Interval between closed timestamp updates to rangefeeds.
    #[arg(long, env = "RANGEDB_CLOSED_TS_INTERVAL_MS", default_value_t = 200)]
    closed_ts_interval_ms: u64,
}

#[derive(Subcommand, Debug)]
enum DebugCmd {
    /// Decode a hex-encoded engine key and value.
    Print { key: String, value: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match args.cmd {
        Cmd::Start(args) => match run_start(args).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!(error = %e, "rangedb exited with error");
                ExitCode::FAILURE
            }
        },
        Cmd::Debug(DebugCmd::Print { key, value }) => debug_print(&key, &value),
    }
}

fn debug_print(key: &str, value: &str) -> ExitCode {
    let decoded = hex::decode(key.trim())
        .map_err(|e| format!("key: {e}"))
        .and_then(|k| {
            hex::decode(value.trim())
                .map(|v| (k, v))
                .map_err(|e| format!("value: {e}"))
        });
    let (key, value) = match decoded {
        Ok(kv) => kv,
        Err(e) => {
            eprintln!("invalid hex {e}");
            return ExitCode::FAILURE;
        }
    };
    match rangedb::print::print_kv(&key, &value) {
        Ok(s) => {
            println!("{s}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{e}");
            println!("{}", rangedb::print::sprint_kv(&key, &value));
            ExitCode::FAILURE
        }
    }
}

async fn run_start(args: StartArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(
        node_id = args.node_id,
        store_id = args.store_id,
        raft_addr = %args.raft_addr,
        data_dir = ?args.data_dir,
        "starting rangedb"
    );

    std::fs::create_dir_all(&args.data_dir)?;
    let engine = Engine::open(&args.data_dir, WalConfig::default())?;
    let clock: Arc<dyn Clock> = Arc::new(HlcClock::new());
    let store = Store::open(
        args.node_id,
        args.store_id,
        engine.clone(),
        clock.clone(),
        StoreConfig::from_env(),
    )?;
    store.bootstrap()?;

    let applier: Arc<dyn CommandApplier> = store.clone();
    let raft_node = Arc::new(
        RaftNode::new(args.node_id, args.raft_addr, engine.clone(), Arc::downgrade(&applier)).await?,
    );
    let rpc_addr = raft_node.start_rpc_server().await?;
    raft_node.bootstrap_single_node().await?;
    store.set_proposer(raft_node.clone());
    store.set_closed_timestamp_source(Arc::new(ClockClosedTimestamps::new(
        clock,
        Duration::from_millis(args.closed_ts_lag_ms),
    )));

    let cancel = CancellationToken::new();
    let ticker = store.spawn_closed_timestamp_updates(
        Duration::from_millis(args.closed_ts_interval_ms),
        cancel.clone(),
    );
    tracing::info!(%rpc_addr, ranges = store.replicas().len(), "rangedb started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    cancel.cancel();
    let _ = ticker.await;
    raft_node.shutdown().await?;
    engine.checkpoint()?;
    engine.close();
    Ok(())
}
