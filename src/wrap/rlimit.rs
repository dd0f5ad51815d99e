use std::path::PathBuf;

use crate::command::Command;
use crate::error::Result;
use crate::exec::LOG_PIPE_FD;
use crate::wrap::{CommandWrapper, PRIORITY_RLIMIT};

/// Rewrites a limited command to run under the ulimit/cgroup launcher script.
///
/// The script receives the limits as `KEY=value` arguments followed by the
/// original command line as a single argument, applies `ulimit` (and joins
/// the cgroup directory when one is configured), and execs the command. Its
/// diagnostics go to the side-channel log pipe so they never mix with the
/// command's own stdout/stderr.
pub struct RlimitWrapper {
    script: PathBuf,
    cgroup_dir: Option<PathBuf>,
}

impl RlimitWrapper {
    pub fn new(script: impl Into<PathBuf>, cgroup_dir: Option<PathBuf>) -> Self {
        Self {
            script: script.into(),
            cgroup_dir,
        }
    }
}

impl CommandWrapper for RlimitWrapper {
    fn name(&self) -> &'static str {
        "rlimit"
    }

    fn priority(&self) -> i32 {
        PRIORITY_RLIMIT
    }

    fn wrap(&self, command: &mut Command) -> Result<()> {
        if !command.has_limits() {
            // Unrestricted commands skip the launcher entirely.
            return Ok(());
        }

        let mut argv: Vec<String> = vec![self.script.display().to_string()];

        if let Some(cpu) = command.cpu_limit {
            argv.push(format!("RB_CPU={}", cpu));
        }
        if let Some(wall) = command.wall_limit {
            argv.push(format!("RB_WALL={}", wall));
        }
        if let Some(mem) = command.memory_limit {
            argv.push(format!("RB_MEM={}", mem));
        }
        if let Some(fsize) = command.file_size_limit {
            argv.push(format!("RB_FSIZE={}", fsize));
        }
        if let Some(cgroup) = &self.cgroup_dir {
            argv.push(format!("RB_CGROUP={}", cgroup.display()));
        }
        argv.push(format!("RB_LOG_FD={}", LOG_PIPE_FD));

        let wrapped = format!(
            "{} {}",
            shell_words::join(argv.iter().map(String::as_str)),
            shell_words::quote(command.text())
        );
        command.replace_text(wrapped);
        command.enable_log_pipe();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_become_key_value_pairs() {
        let wrapper = RlimitWrapper::new("/opt/runbox-limit.sh", Some("/sys/fs/cgroup/runbox".into()));
        let mut cmd = Command::new()
            .arg("sleep")
            .arg("1")
            .cpu_time_limit(5)
            .file_size_limit_kb(1024);
        wrapper.wrap(&mut cmd).unwrap();

        assert!(cmd.text().starts_with("/opt/runbox-limit.sh "));
        assert!(cmd.text().contains("RB_CPU=5"));
        assert!(cmd.text().contains("RB_FSIZE=1024"));
        assert!(cmd.text().contains("RB_CGROUP=/sys/fs/cgroup/runbox"));
        assert!(cmd.text().ends_with("'sleep 1'"));
        assert!(cmd.has_log_pipe());
    }

    #[test]
    fn original_command_is_one_escaped_argument() {
        let wrapper = RlimitWrapper::new("/opt/runbox-limit.sh", None);
        let mut cmd = Command::new().arg("echo").arg("a b").wall_time_limit(3);
        wrapper.wrap(&mut cmd).unwrap();

        let argv = shell_words::split(cmd.text()).unwrap();
        assert_eq!(argv.last().unwrap(), "echo 'a b'");
    }
}
