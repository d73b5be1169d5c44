//! PeerShare CLI: host a JSON state, join a host, or run an in-process demo.
//!
//! ```text
//! peershare host --listen 0.0.0.0:7000 --state board.json   # stdin lines = new states
//! peershare join "https://app.example/?share=ws://10.0.0.2:7000"
//! peershare demo
//! ```
//!
//! Every session event is printed to stdout as one JSON line; logs go to
//! stderr through `env_logger` (`RUST_LOG=peershare_sync=debug`).

mod events;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use url::Url;

use peershare_sync::{
    host_from_url, FileStorage, MemoryNetwork, SessionEvent, SessionStatus, ShareSession, SyncConfig, TransmissionMode,
    WsTransport,
};

#[derive(Parser)]
#[command(name = "peershare", version, about = "Peer-to-peer state sharing")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Share a JSON state; each line on stdin replaces it
    Host(HostArgs),
    /// View a host's state, given a share link or host id
    Join(JoinArgs),
    /// Host and two viewers on an in-memory network
    Demo,
}

#[derive(Args)]
struct TuningArgs {
    /// JSON file with a full `SyncConfig`
    #[arg(long, env = "PEERSHARE_CONFIG")]
    config: Option<PathBuf>,

    /// Send structural deltas instead of full snapshots
    #[arg(long, env = "PEERSHARE_DELTA")]
    delta: bool,

    /// Compress canvas-shaped states before sending
    #[arg(long, env = "PEERSHARE_COMPRESS")]
    compress: bool,
}

#[derive(Args)]
struct HostArgs {
    #[arg(long, env = "PEERSHARE_LISTEN", default_value = "127.0.0.1:7000")]
    listen: SocketAddr,

    /// Initial state (JSON file)
    #[arg(long)]
    state: Option<PathBuf>,

    #[arg(long, env = "PEERSHARE_VIEWER_CAP")]
    viewer_cap: Option<usize>,

    /// Base URL the share link is built on
    #[arg(long, env = "PEERSHARE_BASE_URL", default_value = "http://localhost/")]
    base_url: Url,

    /// Directory for session metadata
    #[arg(long, env = "PEERSHARE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(flatten)]
    tuning: TuningArgs,
}

#[derive(Args)]
struct JoinArgs {
    /// Share link, `ws://` host id or bare id
    target: String,

    #[command(flatten)]
    tuning: TuningArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Host(args) => host(args).await,
        Command::Join(args) => join(args).await,
        Command::Demo => demo().await,
    }
}

fn load_config(args: &TuningArgs) -> Result<SyncConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?
        }
        None => SyncConfig::default(),
    };
    if args.delta {
        config.transmission = TransmissionMode::Delta;
    }
    if args.compress {
        config.compression = true;
    }
    Ok(config)
}

async fn host(args: HostArgs) -> Result<()> {
    let mut config = load_config(&args.tuning)?;
    if let Some(cap) = args.viewer_cap {
        config = config.with_viewer_cap(cap);
    }

    let initial = match &args.state {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading state {}", path.display()))?;
            Some(serde_json::from_str::<Value>(&raw).context("state file is not JSON")?)
        }
        None => None,
    };

    let mut session = ShareSession::new(Arc::new(WsTransport::listening(args.listen)), config);
    if let Some(dir) = &args.data_dir {
        let storage = FileStorage::open(dir).with_context(|| format!("opening {}", dir.display()))?;
        session = session.with_storage(Arc::new(storage));
    }
    let mut event_rx = session
        .take_event_rx()
        .context("event receiver already taken")?;

    let id = session.create_share(initial.as_ref()).await?;
    if let Some(link) = session.share_link(&args.base_url).await {
        info!("Share link: {link}");
        println!("{}", json!({"event": "shared", "id": id.as_str(), "link": link.as_str()}));
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match serde_json::from_str::<Value>(&line) {
                    Ok(state) => {
                        let outcome = session.sync_data(&state).await?;
                        log::debug!("sync_data: {outcome:?}");
                    }
                    Err(e) => log::warn!("Ignoring non-JSON input: {e}"),
                },
                None => stdin_open = false,
            },
            Some(event) = event_rx.recv() => events::print(None, &event),
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.stop_sharing().await;
    Ok(())
}

async fn join(args: JoinArgs) -> Result<()> {
    let config = load_config(&args.tuning)?;
    let Some(target) = host_from_url(&args.target) else {
        bail!("no host id in {:?}", args.target);
    };

    let mut session = ShareSession::new(Arc::new(WsTransport::client()), config);
    let mut event_rx = session
        .take_event_rx()
        .context("event receiver already taken")?;
    session.join_share(target.clone()).await?;
    info!("Joining {target}");

    loop {
        tokio::select! {
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                events::print(None, &event);
                if event == SessionEvent::StatusChanged(SessionStatus::Error) {
                    bail!("could not reach host {target}");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.stop_sharing().await;
    Ok(())
}

/// Host plus two viewers on one in-memory network, driving a few updates.
async fn demo() -> Result<()> {
    let network = MemoryNetwork::new();
    let config = SyncConfig::default().with_viewer_warmup(Duration::from_millis(100));

    let mut host = ShareSession::new(Arc::new(network.transport()), config.clone()).with_peer_id("host");
    let host_id = host.create_share(Some(&json!({"text": "hello"}))).await?;

    let mut viewers = Vec::new();
    for name in ["alice", "bob"] {
        let mut viewer = ShareSession::new(Arc::new(network.transport()), config.clone()).with_peer_id(name);
        let mut rx = viewer
            .take_event_rx()
            .context("event receiver already taken")?;
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                events::print(Some(name), &event);
            }
        });
        viewer.join_share(host_id.clone()).await?;
        viewers.push(viewer);
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    for text in ["hello world", "hello world!", "hello, world!"] {
        host.sync_data(&json!({"text": text})).await?;
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    for viewer in &viewers {
        println!(
            "{}",
            json!({"event": "final", "viewer": viewer.local_id().await.map(|id| id.to_string()),
                   "state": viewer.viewer_state().await})
        );
    }
    println!("{}", json!({"event": "metrics", "metrics": host.metrics()}));

    host.stop_sharing().await;
    Ok(())
}
