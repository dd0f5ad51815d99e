use std::path::PathBuf;

use crate::command::Command;
use crate::error::{Result, RunboxError};
use crate::syntax;
use crate::wrap::{CommandWrapper, PRIORITY_SERVICE};

const EXEC_SYSCALL: &str = "execve";

/// Rewrites a command into a `systemd-run` transient unit.
///
/// Each limit, path rule and isolation toggle becomes one `-p` property
/// flag. The unit runs on the invoking user's bus, which requires the
/// runtime directory derived from the current uid.
pub struct SystemdRunWrapper {
    binary: PathBuf,
}

impl SystemdRunWrapper {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[cfg(unix)]
fn current_uid() -> u32 {
    nix::unistd::Uid::effective().as_raw()
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}

impl CommandWrapper for SystemdRunWrapper {
    fn name(&self) -> &'static str {
        "systemd-run"
    }

    fn priority(&self) -> i32 {
        PRIORITY_SERVICE
    }

    fn wrap(&self, command: &mut Command) -> Result<()> {
        if command.disable_sandbox {
            return Ok(());
        }

        let mut argv: Vec<String> = vec![
            self.binary.display().to_string(),
            "--user".to_string(),
            "--pipe".to_string(),
            "--wait".to_string(),
            "--collect".to_string(),
            "--quiet".to_string(),
        ];

        let prop = |p: String| format!("--property={}", p);

        if let Some(cpu) = command.cpu_limit {
            argv.push(prop(format!("LimitCPU={}", cpu)));
        }
        if let Some(wall) = command.wall_limit {
            argv.push(prop(format!("RuntimeMaxSec={}", wall)));
        }
        if let Some(mem) = command.memory_limit {
            argv.push(prop(format!("MemoryMax={}K", mem)));
        }
        if let Some(fsize) = command.file_size_limit {
            argv.push(prop(format!("LimitFSIZE={}", fsize * 1024)));
        }
        if command.disable_network {
            argv.push(prop("PrivateNetwork=yes".to_string()));
        }
        if command.no_new_privs {
            argv.push(prop("NoNewPrivileges=yes".to_string()));
        }
        if command.private_namespace {
            argv.push(prop("PrivateUsers=yes".to_string()));
        }
        if command.private_dev {
            argv.push(prop("PrivateDevices=yes".to_string()));
        }
        for path in &command.allowed_paths {
            argv.push(prop(format!("ReadWritePaths={}", path.display())));
        }
        for path in &command.disallowed_paths {
            argv.push(prop(format!("InaccessiblePaths={}", path.display())));
        }
        if !command.disabled_syscalls.is_empty() {
            argv.push(prop(format!(
                "SystemCallFilter=~{}",
                command.disabled_syscalls.join(" ")
            )));
        }
        for (key, value) in &command.env {
            argv.push(prop(format!("Environment={}={}", key, value)));
        }

        if command.disabled_syscalls.iter().any(|s| s == EXEC_SYSCALL) {
            // Same constraint as the setuid sandbox: the unit cannot go
            // through a shell when the filter denies exec.
            let info = syntax::parse(command.text());
            match info.literal_argv {
                Some(literal) => argv.extend(literal),
                None => {
                    let features: Vec<&str> =
                        info.features.iter().map(|f| f.as_str()).collect();
                    return Err(RunboxError::NonLiteralCommand {
                        wrapper: "systemd-run".to_string(),
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

        // The user bus lives under the per-uid runtime directory; without it
        // systemd-run cannot reach the manager from a detached context.
        let uid = current_uid();
        command
            .env
            .entry("XDG_RUNTIME_DIR".to_string())
            .or_insert_with(|| format!("/run/user/{}", uid));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrapper() -> SystemdRunWrapper {
        SystemdRunWrapper::new("/usr/bin/systemd-run")
    }

    #[test]
    fn limits_become_properties() {
        let mut cmd = Command::new()
            .arg("convert")
            .arg("a.png")
            .cpu_time_limit(5)
            .memory_limit_kb(262144)
            .file_size_limit_kb(1)
            .no_network();
        wrapper().wrap(&mut cmd).unwrap();

        let argv = shell_words::split(cmd.text()).unwrap();
        assert_eq!(argv[0], "/usr/bin/systemd-run");
        assert!(argv.contains(&"--property=LimitCPU=5".to_string()));
        assert!(argv.contains(&"--property=MemoryMax=262144K".to_string()));
        assert!(argv.contains(&"--property=LimitFSIZE=1024".to_string()));
        assert!(argv.contains(&"--property=PrivateNetwork=yes".to_string()));
        assert_eq!(argv[argv.len() - 2], "-c");
    }

    #[test]
    fn runtime_dir_is_derived_from_uid() {
        let mut cmd = Command::new().arg("true").wall_time_limit(2);
        wrapper().wrap(&mut cmd).unwrap();
        let dir = cmd.env.get("XDG_RUNTIME_DIR").unwrap();
        assert!(dir.starts_with("/run/user/"));
    }

    #[test]
    fn caller_runtime_dir_is_preserved() {
        let mut cmd = Command::new()
            .arg("true")
            .environment([("XDG_RUNTIME_DIR", "/run/user/1234")]);
        wrapper().wrap(&mut cmd).unwrap();
        assert_eq!(cmd.env.get("XDG_RUNTIME_DIR").unwrap(), "/run/user/1234");
    }

    #[test]
    fn denied_execve_appends_literal_argv() {
        let mut cmd = Command::new()
            .arg("echo")
            .arg("hi")
            .disable_syscalls(["execve"]);
        wrapper().wrap(&mut cmd).unwrap();
        let argv = shell_words::split(cmd.text()).unwrap();
        assert!(!argv.contains(&"/bin/sh".to_string()));
        assert!(argv.contains(&"--property=SystemCallFilter=~execve".to_string()));
    }
}
