//! Command wrappers.
//!
//! A wrapper rewrites a command's invocation to add resource limits or
//! OS-level isolation. Wrappers are independent and composable: each one has
//! an integer priority, and a [`WrapperChain`] applies them in ascending
//! order (lower = innermost, applied first). Every execution wraps a fresh
//! clone of the caller's command, never the original.

mod firejail;
mod rlimit;
mod systemd;
mod windows;

pub use firejail::FirejailWrapper;
pub use rlimit::RlimitWrapper;
pub use systemd::SystemdRunWrapper;
pub use windows::WindowsShellWrapper;

use tracing::debug;

use crate::command::Command;
use crate::config::types::{ExecutionConfig, IsolationKind};
use crate::error::{Result, RunboxError};

/// Priority of the resource-limit wrapper (innermost).
pub const PRIORITY_RLIMIT: i32 = 10;
/// Priority of the setuid-sandbox wrapper.
pub const PRIORITY_SANDBOX: i32 = 20;
/// Priority of the service-manager wrapper.
pub const PRIORITY_SERVICE: i32 = 30;
/// Priority of the platform-shell wrapper (outermost).
pub const PRIORITY_PLATFORM_SHELL: i32 = 100;

/// A stateless transformation of a command's invocation.
pub trait CommandWrapper: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lower priorities are applied first and end up innermost.
    fn priority(&self) -> i32;

    /// Rewrite the command in place. A wrapper that does not apply to this
    /// command must leave it untouched and return `Ok`.
    fn wrap(&self, command: &mut Command) -> Result<()>;
}

/// A priority-ordered set of wrappers.
#[derive(Default)]
pub struct WrapperChain {
    wrappers: Vec<Box<dyn CommandWrapper>>,
}

impl WrapperChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a wrapper, keeping the chain sorted by ascending priority.
    pub fn push(&mut self, wrapper: Box<dyn CommandWrapper>) {
        self.wrappers.push(wrapper);
        self.wrappers.sort_by_key(|w| w.priority());
    }

    pub fn is_empty(&self) -> bool {
        self.wrappers.is_empty()
    }

    /// Apply every wrapper to the command, innermost first.
    pub fn apply(&self, command: &mut Command) -> Result<()> {
        for wrapper in &self.wrappers {
            wrapper.wrap(command)?;
            debug!(
                wrapper = wrapper.name(),
                command = command.text(),
                "Wrapper applied"
            );
        }
        Ok(())
    }

    /// Build the chain described by the execution configuration.
    ///
    /// Mirrors the isolation selection the caller asked for; `Auto` picks
    /// the first sandboxing tool present on the system.
    pub fn from_config(config: &ExecutionConfig) -> Result<Self> {
        let mut chain = Self::new();

        if let Some(script) = &config.limit_script {
            chain.push(Box::new(RlimitWrapper::new(
                script.clone(),
                config.cgroup_dir.clone(),
            )));
        }

        match resolve_isolation(config)? {
            ResolvedIsolation::Firejail(path) => {
                chain.push(Box::new(FirejailWrapper::new(path, config.default_seccomp)));
            }
            ResolvedIsolation::Systemd(path) => {
                chain.push(Box::new(SystemdRunWrapper::new(path)));
            }
            ResolvedIsolation::None => {}
        }

        if cfg!(windows) {
            chain.push(Box::new(WindowsShellWrapper::new()));
        }

        Ok(chain)
    }
}

enum ResolvedIsolation {
    Firejail(std::path::PathBuf),
    Systemd(std::path::PathBuf),
    None,
}

fn resolve_isolation(config: &ExecutionConfig) -> Result<ResolvedIsolation> {
    match config.isolation {
        IsolationKind::None => Ok(ResolvedIsolation::None),
        IsolationKind::Firejail => {
            let path = match &config.firejail_path {
                Some(path) => path.clone(),
                None => which::which("firejail").map_err(|_| {
                    RunboxError::Config(
                        "firejail isolation requested but the binary was not found".to_string(),
                    )
                })?,
            };
            Ok(ResolvedIsolation::Firejail(path))
        }
        IsolationKind::Systemd => {
            let path = match &config.systemd_run_path {
                Some(path) => path.clone(),
                None => which::which("systemd-run").map_err(|_| {
                    RunboxError::Config(
                        "systemd isolation requested but systemd-run was not found".to_string(),
                    )
                })?,
            };
            Ok(ResolvedIsolation::Systemd(path))
        }
        IsolationKind::Auto => {
            if let Some(path) = config
                .firejail_path
                .clone()
                .or_else(|| which::which("firejail").ok())
            {
                return Ok(ResolvedIsolation::Firejail(path));
            }
            if let Some(path) = config
                .systemd_run_path
                .clone()
                .or_else(|| which::which("systemd-run").ok())
            {
                return Ok(ResolvedIsolation::Systemd(path));
            }
            Ok(ResolvedIsolation::None)
        }
    }
}
