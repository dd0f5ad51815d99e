use std::path::PathBuf;

use crate::command::Command;
use crate::error::{Result, RunboxError};
use crate::syntax;
use crate::wrap::{CommandWrapper, PRIORITY_SANDBOX};

/// Syscall a shell needs to start the target program. When the caller denies
/// it, the sandbox must exec the program itself.
const EXEC_SYSCALL: &str = "execve";

/// Rewrites a command to run under the firejail setuid sandbox.
///
/// Path allow/deny lists, namespace and device isolation, the seccomp filter
/// and per-variable environment all become firejail flags. A command that
/// explicitly disabled sandboxing is left untouched so it does not pay the
/// sandbox's startup cost.
pub struct FirejailWrapper {
    binary: PathBuf,
    /// Apply firejail's default seccomp set when the command names no
    /// syscalls of its own.
    default_seccomp: bool,
}

impl FirejailWrapper {
    pub fn new(binary: impl Into<PathBuf>, default_seccomp: bool) -> Self {
        Self {
            binary: binary.into(),
            default_seccomp,
        }
    }
}

impl CommandWrapper for FirejailWrapper {
    fn name(&self) -> &'static str {
        "firejail"
    }

    fn priority(&self) -> i32 {
        PRIORITY_SANDBOX
    }

    fn wrap(&self, command: &mut Command) -> Result<()> {
        if command.disable_sandbox {
            return Ok(());
        }

        let mut argv: Vec<String> = vec![
            self.binary.display().to_string(),
            "--quiet".to_string(),
            "--noprofile".to_string(),
        ];

        for path in &command.allowed_paths {
            if path.as_os_str() == "/home" {
                // Whitelisting all of /home has its own flag.
                argv.push("--allusers".to_string());
            } else {
                argv.push(format!("--whitelist={}", path.display()));
            }
        }
        for path in &command.disallowed_paths {
            argv.push(format!("--blacklist={}", path.display()));
        }

        if command.private_namespace {
            argv.push("--private".to_string());
        }
        if command.no_new_privs {
            argv.push("--nonewprivs".to_string());
        }

        if !command.disabled_syscalls.is_empty() {
            argv.push(format!("--seccomp={}", command.disabled_syscalls.join(",")));
        } else if self.default_seccomp {
            argv.push("--seccomp".to_string());
        }

        if command.private_dev {
            argv.push("--private-dev".to_string());
        }
        if command.disable_network {
            argv.push("--net=none".to_string());
        }
        for (key, value) in &command.env {
            argv.push(format!("--env={}={}", key, value));
        }

        argv.push("--".to_string());

        if command.disabled_syscalls.iter().any(|s| s == EXEC_SYSCALL) {
            // The filter would kill the shell the moment it tried to start
            // the target, so the sandbox has to exec it directly. That is
            // only possible for a command with no shell constructs.
            let info = syntax::parse(command.text());
            match info.literal_argv {
                Some(literal) => argv.extend(literal),
                None => {
                    let features: Vec<&str> =
                        info.features.iter().map(|f| f.as_str()).collect();
                    return Err(RunboxError::NonLiteralCommand {
                        wrapper: "firejail".to_string(),
                        reason: format!(
                            "execve is denied but the command uses shell features: {}",
                            features.join(", ")
                        ),
                    });
                }
            }
        } else {
            argv.push("/bin/sh".to_string());
            argv.push("-c".to_string());
            argv.push(command.text().to_string());
        }

        command.replace_text(shell_words::join(argv.iter().map(String::as_str)));
        Ok(())
    }
}
