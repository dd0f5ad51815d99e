use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::validate::RoutePolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunboxConfig {
    pub execution: ExecutionConfig,
    pub remote: RemoteConfig,
    pub server: ServerConfig,
    /// Per-route validation policies. A route absent from this map is
    /// rejected outright.
    pub routes: BTreeMap<String, RoutePolicy>,
}

/// Which external isolation tool wraps sandboxed commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IsolationKind {
    /// No isolation wrapper (resource limits still apply if configured)
    None,
    /// The firejail setuid sandbox
    Firejail,
    /// systemd-run transient units
    Systemd,
    /// Pick the first tool found on the system
    #[default]
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Which isolation tool to use
    pub isolation: IsolationKind,
    /// Launcher script enforcing ulimit/cgroup resource limits
    pub limit_script: Option<PathBuf>,
    /// Cgroup directory the launcher script joins before exec
    pub cgroup_dir: Option<PathBuf>,
    /// Path to the firejail binary (auto-detected if not set)
    pub firejail_path: Option<PathBuf>,
    /// Path to systemd-run (auto-detected if not set)
    pub systemd_run_path: Option<PathBuf>,
    /// Apply firejail's default seccomp set when a command names no syscalls
    pub default_seccomp: bool,
    /// Permit URL-backed input and output files
    pub allow_url_files: bool,
    /// Base directory for private working directories (system tmp if unset)
    pub work_dir: Option<PathBuf>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationKind::default(),
            limit_script: None,
            cgroup_dir: None,
            firejail_path: None,
            systemd_run_path: None,
            default_seccomp: true,
            allow_url_files: false,
            work_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL of the execution server
    pub server_url: Option<String>,
    /// Connection timeout in seconds
    pub connect_timeout_seconds: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            connect_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for the execution server
    pub bind: String,
    /// Maximum size of one inbound request body in bytes
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8372".to_string(),
            max_upload_bytes: 256 * 1024 * 1024,
        }
    }
}
