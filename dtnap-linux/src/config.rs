//! Daemon configuration: defaults, then a TOML file, then environment overrides.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

/// File: `--config <path>`, else ~/.config/dtnap/config.toml or /etc/dtnap/config.toml.
/// Env overrides: DTNAP_NODE, DTNAP_STORE_CAPACITY, DTNAP_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Node number (default 1).
    #[serde(default = "default_node")]
    pub node: u64,
    /// Store capacity in bytes (default 4 MiB).
    #[serde(default = "default_store_capacity")]
    pub store_capacity: usize,
    /// LTP engine number; defaults to the node number.
    #[serde(default)]
    pub ltp_engine: Option<u64>,
    #[serde(default)]
    pub cfdp_segment_size: Option<u32>,
    /// `env_logger` filter used when RUST_LOG is unset (default "info").
    #[serde(default = "default_log")]
    pub log: String,
    /// Absolute `yyyy/mm/dd-hh:mm:ss` anchor for relative `+secs` times; start-up time if unset.
    #[serde(default)]
    pub reference_time: Option<String>,
    /// Diagnostic bundle activity trace.
    #[serde(default)]
    pub bp_watch: bool,
    /// Seconds between store usage reports; 0 disables them.
    #[serde(default = "default_usage_report_secs")]
    pub usage_report_secs: u64,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub contacts: Vec<ContactConfig>,
    #[serde(default)]
    pub ranges: Vec<RangeConfig>,
    #[serde(default)]
    pub spans: Vec<SpanConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    pub eid: String,
    /// Drop bundles for this endpoint while nothing is bound to it.
    #[serde(default)]
    pub discard: bool,
    #[serde(default)]
    pub detained: bool,
    #[serde(default)]
    pub admission_control: bool,
    /// Send every received payload back to its source.
    #[serde(default)]
    pub echo: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContactConfig {
    #[serde(default)]
    pub region: u32,
    pub from: u64,
    pub to: u64,
    pub start: String,
    pub end: String,
    pub rate_bps: u64,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RangeConfig {
    pub from: u64,
    pub to: u64,
    pub start: String,
    pub end: String,
    pub owlt: u32,
}

/// LTP span over UDP to a peer engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpanConfig {
    pub engine: u64,
    pub max_segment_size: u32,
    /// Peer link service input, `ip:port`.
    pub peer: SocketAddr,
    #[serde(default)]
    pub udp_rate: u32,
    #[serde(default = "default_sessions")]
    pub max_export_sessions: u32,
    #[serde(default = "default_sessions")]
    pub max_import_sessions: u32,
}

fn default_sessions() -> u32 {
    1
}
fn default_node() -> u64 {
    1
}
fn default_store_capacity() -> usize {
    4 << 20
}
fn default_log() -> String {
    "info".into()
}
fn default_usage_report_secs() -> u64 {
    60
}
fn default_confidence() -> f32 {
    1.0
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: default_node(),
            store_capacity: default_store_capacity(),
            ltp_engine: None,
            cfdp_segment_size: None,
            log: default_log(),
            reference_time: None,
            bp_watch: false,
            usage_report_secs: default_usage_report_secs(),
            endpoints: Vec::new(),
            contacts: Vec::new(),
            ranges: Vec::new(),
            spans: Vec::new(),
        }
    }
}

/// Load config: defaults, then the config file (explicit or first found), then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let file = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => config_paths().into_iter().find(|p| p.exists()),
    };
    let mut c = match file {
        Some(path) => parse_file(&path)?,
        None => Config::default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/dtnap/config.toml"));
    }
    out.push(PathBuf::from("/etc/dtnap/config.toml"));
    out
}

fn parse_file(path: &Path) -> anyhow::Result<Config> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(n) = var("DTNAP_NODE").and_then(|s| s.parse().ok()) {
        c.node = n;
    }
    if let Some(n) = var("DTNAP_STORE_CAPACITY").and_then(|s| s.parse().ok()) {
        c.store_capacity = n;
    }
    if let Some(filter) = var("DTNAP_LOG") {
        c.log = filter;
    }
}
