use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::session::SessionConfig;

/// Agent configuration, loadable from CLI or YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Network interface the XDP program is attached to.
    #[serde(default = "default_ifname")]
    pub ifname: String,

    /// Coordinator `host:port`.
    #[serde(default = "default_coordinator")]
    pub coordinator: String,

    /// Compiled eBPF object loaded at startup.
    #[serde(default = "default_bpf_object")]
    pub bpf_object: PathBuf,

    /// Verbose logging, including packet hex dumps.
    #[serde(default)]
    pub debug: bool,

    /// Status API port. The API is not served when unset.
    #[serde(default)]
    pub api_port: Option<u16>,

    /// List of CIDRs allowed to access the API (empty = allow all).
    #[serde(default)]
    pub allowed_ips: Vec<String>,

    #[serde(default = "default_hello_interval_secs")]
    pub hello_interval_secs: u64,

    /// Session fails when the coordinator is silent this long.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,

    /// Mismatched hellos tolerated between two periodic hellos.
    #[serde(default = "default_loop_guard_limit")]
    pub loop_guard_limit: u32,

    #[serde(default = "default_ready_poll_millis")]
    pub ready_poll_millis: u64,
}

fn default_ifname() -> String {
    "eth0".to_string()
}

fn default_coordinator() -> String {
    "coldgate-coordinator:3030".to_string()
}

fn default_bpf_object() -> PathBuf {
    PathBuf::from("/usr/lib/coldgate/coldgate.bpf.o")
}

fn default_hello_interval_secs() -> u64 {
    30
}

fn default_read_timeout_secs() -> u64 {
    90
}

fn default_loop_guard_limit() -> u32 {
    30
}

fn default_ready_poll_millis() -> u64 {
    100
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ifname: default_ifname(),
            coordinator: default_coordinator(),
            bpf_object: default_bpf_object(),
            debug: false,
            api_port: None,
            allowed_ips: Vec::new(),
            hello_interval_secs: default_hello_interval_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            loop_guard_limit: default_loop_guard_limit(),
            ready_poll_millis: default_ready_poll_millis(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// Merge CLI args into config (CLI takes precedence).
    pub fn merge_cli(&mut self, cli: &CliArgs) {
        if let Some(ref ifname) = cli.ifname {
            self.ifname = ifname.clone();
        }
        if let Some(ref coordinator) = cli.coordinator {
            self.coordinator = coordinator.clone();
        }
        if let Some(ref object) = cli.bpf_object {
            self.bpf_object = object.clone();
        }
        if cli.debug {
            self.debug = true;
        }
        if cli.api_port.is_some() {
            self.api_port = cli.api_port;
        }
        if !cli.allowed_ips.is_empty() {
            self.allowed_ips = cli.allowed_ips.clone();
        }
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            coordinator: self.coordinator.clone(),
            hello_interval: Duration::from_secs(self.hello_interval_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            loop_guard_limit: self.loop_guard_limit,
        }
    }

    pub fn ready_poll(&self) -> Duration {
        Duration::from_millis(self.ready_poll_millis)
    }
}

use clap::Parser;

/// coldgate: scale-to-zero edge agent
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// Enable debug logging.
    #[arg(long)]
    pub debug: bool,

    /// Network interface to attach the XDP program to [default: eth0].
    #[arg(long)]
    pub ifname: Option<String>,

    /// Path to YAML config file.
    #[arg(short, long)]
    pub config: Option<String>,

    /// Coordinator address as host:port.
    #[arg(long)]
    pub coordinator: Option<String>,

    /// Compiled eBPF object to load.
    #[arg(long)]
    pub bpf_object: Option<PathBuf>,

    /// Serve the status API on this port.
    #[arg(long)]
    pub api_port: Option<u16>,

    /// IP CIDRs allowed to access the API (e.g., 10.0.0.0/8). Repeat for multiple.
    #[arg(long)]
    pub allowed_ips: Vec<String>,
}
