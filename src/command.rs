use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// What to do with the child's stderr stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StderrPolicy {
    /// Capture into the result's stderr buffer (default).
    #[default]
    Capture,
    /// Interleave into the stdout buffer as chunks arrive.
    Merge,
    /// Capture, and additionally copy chunks to the host's own stderr.
    Forward,
    /// Capture, and promote a non-empty buffer to an error-level log entry.
    Log,
}

/// A command to be executed, together with its resource limits and sandbox
/// restrictions.
///
/// The command string is opaque to everything except the wrapper chain. It
/// grows only through [`Command::arg`]/[`Command::args`] (which escape shell
/// metacharacters) or [`Command::unsafe_append`], which the caller is
/// responsible for proving safe. Wrappers may replace the whole string via
/// [`Command::replace_text`].
#[derive(Debug, Clone, Default)]
pub struct Command {
    text: String,

    /// CPU time limit in seconds. Zero or `None` means unlimited.
    pub cpu_limit: Option<u64>,
    /// Wall clock limit in seconds.
    pub wall_limit: Option<u64>,
    /// Address space limit in KiB.
    pub memory_limit: Option<u64>,
    /// Maximum size of any created file, in KiB.
    pub file_size_limit: Option<u64>,

    /// Extra environment variables for the child.
    pub env: BTreeMap<String, String>,
    /// Bytes written to the child's stdin.
    pub stdin: Option<Vec<u8>>,
    /// Let the child inherit the host's stdin instead of a pipe.
    pub pass_stdin: bool,
    pub stderr_policy: StderrPolicy,
    /// Working directory for the child. Boxed execution always overrides this.
    pub working_dir: Option<PathBuf>,

    /// Deny all network access inside the sandbox.
    pub disable_network: bool,
    /// Syscalls to deny via the sandbox's seccomp filter.
    pub disabled_syscalls: Vec<String>,
    pub no_new_privs: bool,
    /// Run in a private user/PID namespace.
    pub private_namespace: bool,
    /// Mount a minimal private /dev.
    pub private_dev: bool,
    /// Paths the sandboxed process may access.
    pub allowed_paths: Vec<PathBuf>,
    /// Paths hidden from the sandboxed process.
    pub disallowed_paths: Vec<PathBuf>,
    /// Skip the sandbox wrapper entirely. Unrestricted commands should not
    /// pay the sandbox's startup overhead.
    pub disable_sandbox: bool,

    /// When false, the executor splits the command string itself instead of
    /// handing it to `/bin/sh -c`. Set by wrappers that already produced a
    /// fully-quoted argv.
    pub(crate) use_shell: bool,
    /// Give the child a side-channel pipe on fd 3 for launcher diagnostics.
    pub(crate) use_log_pipe: bool,
}

impl Command {
    pub fn new() -> Self {
        Self {
            use_shell: true,
            ..Self::default()
        }
    }

    /// The current command line.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Append one argument, escaped so it is passed to the program verbatim.
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.push_word(arg.as_ref());
        self
    }

    /// Append several escaped arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.push_word(arg.as_ref());
        }
        self
    }

    /// Append raw shell syntax without escaping.
    ///
    /// The caller must guarantee the fragment cannot be influenced by
    /// untrusted input; this is the only way shell metacharacters enter a
    /// command.
    pub fn unsafe_append(mut self, fragment: &str) -> Self {
        if !self.text.is_empty() {
            self.text.push(' ');
        }
        self.text.push_str(fragment);
        self
    }

    fn push_word(&mut self, word: &str) {
        if !self.text.is_empty() {
            self.text.push(' ');
        }
        self.text.push_str(&shell_words::quote(word));
    }

    /// Replace the entire command line. Intended for wrappers only.
    pub fn replace_text(&mut self, text: String) {
        self.text = text;
    }

    /// Disable shell interpretation of the command line. Intended for
    /// wrappers that produced a fully-quoted argv.
    pub fn set_direct_exec(&mut self) {
        self.use_shell = false;
    }

    /// Request the launcher diagnostics pipe on fd 3.
    pub fn enable_log_pipe(&mut self) {
        self.use_log_pipe = true;
    }

    pub fn uses_shell(&self) -> bool {
        self.use_shell
    }

    pub fn has_log_pipe(&self) -> bool {
        self.use_log_pipe
    }

    // Builder conveniences, in the order callers typically use them.

    pub fn cpu_time_limit(mut self, seconds: u64) -> Self {
        self.cpu_limit = (seconds > 0).then_some(seconds);
        self
    }

    pub fn wall_time_limit(mut self, seconds: u64) -> Self {
        self.wall_limit = (seconds > 0).then_some(seconds);
        self
    }

    pub fn memory_limit_kb(mut self, kib: u64) -> Self {
        self.memory_limit = (kib > 0).then_some(kib);
        self
    }

    pub fn file_size_limit_kb(mut self, kib: u64) -> Self {
        self.file_size_limit = (kib > 0).then_some(kib);
        self
    }

    pub fn environment<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn stdin_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    pub fn pass_stdin(mut self) -> Self {
        self.pass_stdin = true;
        self
    }

    pub fn stderr_policy(mut self, policy: StderrPolicy) -> Self {
        self.stderr_policy = policy;
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn no_network(mut self) -> Self {
        self.disable_network = true;
        self
    }

    pub fn disable_syscalls<I, S>(mut self, syscalls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.disabled_syscalls
            .extend(syscalls.into_iter().map(Into::into));
        self
    }

    pub fn no_new_privileges(mut self) -> Self {
        self.no_new_privs = true;
        self
    }

    pub fn private_namespace(mut self) -> Self {
        self.private_namespace = true;
        self
    }

    pub fn private_dev(mut self) -> Self {
        self.private_dev = true;
        self
    }

    pub fn allow_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.allowed_paths.push(path.into());
        self
    }

    pub fn disallow_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.disallowed_paths.push(path.into());
        self
    }

    pub fn no_sandbox(mut self) -> Self {
        self.disable_sandbox = true;
        self
    }

    /// True when any resource limit is set.
    pub fn has_limits(&self) -> bool {
        self.cpu_limit.is_some()
            || self.wall_limit.is_some()
            || self.memory_limit.is_some()
            || self.file_size_limit.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_are_escaped() {
        let cmd = Command::new().arg("echo").arg("two words").arg("$HOME");
        assert_eq!(cmd.text(), "echo 'two words' '$HOME'");
    }

    #[test]
    fn unsafe_append_is_verbatim() {
        let cmd = Command::new().arg("cat").unsafe_append("| wc -l");
        assert_eq!(cmd.text(), "cat | wc -l");
    }

    #[test]
    fn zero_limit_means_unset() {
        let cmd = Command::new().arg("true").cpu_time_limit(5).memory_limit_kb(0);
        assert_eq!(cmd.cpu_limit, Some(5));
        assert_eq!(cmd.memory_limit, None);
        assert!(cmd.has_limits());
    }

    #[test]
    fn fresh_command_uses_shell() {
        assert!(Command::new().uses_shell());
        assert!(!Command::new().has_log_pipe());
    }
}
