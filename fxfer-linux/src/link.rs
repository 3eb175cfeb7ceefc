//! Opening the byte stream the protocol runs over.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{IsTerminal, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use nix::sys::termios::{self, SetArg, SpecialCharacterIndices};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSpec {
    /// `tcp://host:port`: connect to a listening peer.
    Connect(String),
    /// `listen://addr:port`: accept one peer.
    Listen(String),
    /// Anything else: a character device or FIFO opened read/write (e.g. `/dev/ttyUSB0`).
    /// Terminals are switched to raw mode; the line speed is left as configured (`stty`).
    Device(PathBuf),
}

impl FromStr for LinkSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(addr) = s.strip_prefix("tcp://") {
            anyhow::ensure!(!addr.is_empty(), "missing address in {:?}", s);
            return Ok(Self::Connect(addr.to_owned()));
        }
        if let Some(addr) = s.strip_prefix("listen://") {
            anyhow::ensure!(!addr.is_empty(), "missing address in {:?}", s);
            return Ok(Self::Listen(addr.to_owned()));
        }
        anyhow::ensure!(!s.is_empty() && !s.contains("://"), "unsupported link {:?}", s);
        Ok(Self::Device(PathBuf::from(s)))
    }
}

impl fmt::Display for LinkSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(addr) => write!(f, "tcp://{}", addr),
            Self::Listen(addr) => write!(f, "listen://{}", addr),
            Self::Device(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Read and write halves of an open link.
pub struct Link {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub peer: String,
}

/// Open the link. Blocks until connected (or until a peer connects, for `listen://`).
pub fn open(spec: &LinkSpec) -> anyhow::Result<Link> {
    match spec {
        LinkSpec::Connect(addr) => {
            let stream =
                TcpStream::connect(addr).with_context(|| format!("connecting to {}", addr))?;
            tcp_link(stream)
        }
        LinkSpec::Listen(addr) => {
            let listener =
                TcpListener::bind(addr).with_context(|| format!("binding {}", addr))?;
            info!("waiting for peer on {}", listener.local_addr()?);
            let (stream, _) = listener.accept().context("accepting peer")?;
            tcp_link(stream)
        }
        LinkSpec::Device(path) => {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .with_context(|| format!("opening {}", path.display()))?;
            if file.is_terminal() {
                make_raw(&file)
                    .with_context(|| format!("setting raw mode on {}", path.display()))?;
                debug!("{} in raw mode", path.display());
            }
            let reader = file.try_clone()?;
            Ok(Link {
                reader: Box::new(reader),
                writer: Box::new(file),
                peer: path.display().to_string(),
            })
        }
    }
}

/// Binary-clean terminal: no line editing, echo, signal keys, flow control or CR/LF mapping.
/// Reads block until at least one byte arrives.
fn make_raw(file: &File) -> nix::Result<()> {
    let mut attrs = termios::tcgetattr(file)?;
    termios::cfmakeraw(&mut attrs);
    attrs.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    attrs.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
    termios::tcsetattr(file, SetArg::TCSANOW, &attrs)
}

fn tcp_link(stream: TcpStream) -> anyhow::Result<Link> {
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr()?.to_string();
    let reader = stream.try_clone()?;
    Ok(Link {
        reader: Box::new(reader),
        writer: Box::new(stream),
        peer,
    })
}
