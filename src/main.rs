use bt_leech::Config;
use clap::Parser;
use std::path::PathBuf;
use tokio::signal;
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

/// Download a single torrent to a local directory.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to the .torrent file.
    torrent: PathBuf,

    /// Directory the output file is written into.
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Maximum number of concurrent peer sessions.
    #[arg(long, env = "BT_LEECH_MAX_PEERS", default_value_t = 32)]
    max_peers: usize,

    /// Local TCP port advertised to the tracker.
    #[arg(short, long, env = "BT_LEECH_PORT", default_value_t = 6881)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let args = Args::parse();
    let config = Config {
        download_dir: args.output,
        max_peers: args.max_peers,
        listen_port: args.port,
        ..Config::default()
    };

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        let _ = shutdown_tx.send(());
    });

    bt_leech::run(&args.torrent, config, shutdown_rx).await?;
    Ok(())
}
