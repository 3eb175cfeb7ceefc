// fxfer: serve a directory over a byte-stream link, or list/hash/send against a peer.

mod config;
mod link;
mod storage;

use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::Context;
use clap::{Parser, Subcommand};
use fxfer_core::{Fault, Progress, Pump, XferCore};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::HostConfig;
use crate::link::LinkSpec;
use crate::storage::DirStorage;

type Core = XferCore<Box<dyn Write + Send>, DirStorage>;

#[derive(Parser)]
#[command(name = "fxfer", version, about = "Point-to-point file transfer over TCP or serial links")]
struct Cli {
    /// Config file (default: ~/.config/fxfer/config.toml, then /etc/fxfer/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Link: tcp://host:port, listen://addr:port or a device path
    #[arg(long, global = true)]
    link: Option<String>,

    /// Directory to serve and receive into
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer peer requests until Ctrl+C, SIGTERM or disconnect
    Serve,
    /// List the peer's files
    List,
    /// Print the CRC32 of a peer file
    Hash { name: String },
    /// Send a local file to the peer
    Send { path: PathBuf },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    let mut cfg = config::load(cli.config.as_deref())?;
    if let Some(link) = cli.link {
        cfg.link = link;
    }
    if let Some(root) = cli.root {
        cfg.root = root;
    }

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(run(cli.command, cfg));
    // The pump thread may still be blocked on the link; do not wait for it.
    rt.shutdown_background();
    result
}

async fn run(command: Command, mut cfg: HostConfig) -> anyhow::Result<()> {
    let name = match &command {
        Command::Send { path } => {
            let (root, name) = split_send_path(&cfg.root, path)?;
            cfg.root = root;
            Some(name)
        }
        _ => None,
    };
    let spec: LinkSpec = cfg.link.parse()?;
    let storage = DirStorage::open(&cfg.root)
        .with_context(|| format!("opening root {}", cfg.root.display()))?;
    debug!("serving {}", storage.root().display());

    let link = tokio::task::spawn_blocking(move || link::open(&spec)).await??;
    info!("link up: {}", link.peer);
    let core: Core = XferCore::new(cfg.protocol.clone(), link.writer, storage)?;
    let mut pump_done = spawn_pump(core.pump(link.reader));

    match command {
        Command::Serve => {
            tokio::select! {
                r = shutdown_signal() => {
                    r?;
                    info!("shutting down");
                }
                _ = &mut pump_done => info!("peer disconnected"),
            }
        }
        Command::List => {
            let names = blocking(&core, |c| {
                handshake(c)?;
                Ok(c.request_file_list()?)
            })
            .await?;
            for name in &names.names {
                println!("{}", name);
            }
        }
        Command::Hash { name } => {
            let (hash, name) = blocking(&core, move |c| {
                handshake(c)?;
                Ok((c.request_file_hash(&name)?, name))
            })
            .await?;
            println!("{:08x}  {}", hash, name);
        }
        Command::Send { .. } => {
            let name = name.context("send without a file name")?;
            let sent = blocking(&core, move |c| {
                handshake(c)?;
                Ok(c.send_file(&name)?)
            })
            .await?;
            println!("sent {} bytes", sent);
        }
    }
    Ok(())
}

fn handshake(core: &Core) -> anyhow::Result<()> {
    core.initiate_handshake(core.config().window_size)
        .context("handshake")?;
    info!("handshake done, peer window {}", core.peer_window());
    Ok(())
}

/// Run a blocking request off the async runtime.
async fn blocking<T, F>(core: &Core, f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Core) -> anyhow::Result<T> + Send + 'static,
{
    let core = core.clone();
    tokio::task::spawn_blocking(move || f(&core)).await?
}

/// Drive the pump on its own thread until the link closes. The receiver fires when it stops.
fn spawn_pump(
    mut pump: Pump<Box<dyn Read + Send>, Box<dyn Write + Send>, DirStorage>,
) -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    thread::spawn(move || {
        loop {
            let Progress::Fault(Fault::Read(e)) = pump.step() else {
                continue;
            };
            match e.kind() {
                ErrorKind::UnexpectedEof => {
                    debug!("link closed");
                    break;
                }
                // Serial devices configured with a read timeout.
                ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => {}
                _ => {
                    warn!("link read failed: {}", e);
                    break;
                }
            }
        }
        let _ = tx.send(());
    });
    rx
}

/// `send <path>`: a bare name is taken from the root; a path serves its own directory.
fn split_send_path(root: &Path, path: &Path) -> anyhow::Result<(PathBuf, String)> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{} has no usable file name", path.display()))?
        .to_owned();
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => root.to_path_buf(),
    };
    Ok((dir, name))
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
