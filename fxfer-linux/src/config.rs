//! Load config from file and environment.

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Host configuration. File: ~/.config/fxfer/config.toml or /etc/fxfer/config.toml.
/// Env overrides: FXFER_LINK, FXFER_ROOT, FXFER_WINDOW, FXFER_TIMEOUT_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    /// `tcp://host:port`, `listen://addr:port` or a device path (default `tcp://127.0.0.1:45700`).
    #[serde(default = "default_link")]
    pub link: String,
    /// Directory served to the peer and receiving its files (default `.`).
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Protocol tunables (`[protocol]` table).
    #[serde(default)]
    pub protocol: fxfer_core::Config,
}

fn default_link() -> String {
    "tcp://127.0.0.1:45700".into()
}
fn default_root() -> PathBuf {
    PathBuf::from(".")
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            link: default_link(),
            root: default_root(),
            protocol: fxfer_core::Config::default(),
        }
    }
}

/// Load config: default, then config file (`explicit`, or the first standard path that exists),
/// then env vars. An explicit file that cannot be read or parsed is an error.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<HostConfig> {
    let mut c = match explicit {
        Some(path) => read_file(path)?,
        None => load_file().unwrap_or_default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    c.protocol.validate().context("invalid [protocol] settings")?;
    Ok(c)
}

fn apply_env(c: &mut HostConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("FXFER_LINK") {
        c.link = s;
    }
    if let Some(s) = var("FXFER_ROOT") {
        c.root = PathBuf::from(s);
    }
    if let Some(s) = var("FXFER_WINDOW") {
        if let Ok(w) = s.parse::<u16>() {
            c.protocol.window_size = w;
        }
    }
    if let Some(s) = var("FXFER_TIMEOUT_MS") {
        if let Ok(ms) = s.parse::<u64>() {
            c.protocol.response_timeout_ms = ms;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/fxfer/config.toml"));
    }
    out.push(PathBuf::from("/etc/fxfer/config.toml"));
    out
}

fn load_file() -> Option<HostConfig> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match read_file(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!("ignoring {}: {:#}", path.display(), e);
            None
        }
    }
}

fn read_file(path: &Path) -> anyhow::Result<HostConfig> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}
