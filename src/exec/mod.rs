//! Unboxed command execution.
//!
//! Spawns one OS process for an already-wrapped [`Command`] and drains its
//! pipes until the process exits. Stdin, stdout, stderr and the optional
//! launcher log pipe are driven as concurrent tasks; the call itself is
//! synchronous from the caller's point of view and holds no timeout of its
//! own — wall-clock and CPU limits are the wrappers' job.

use std::process::Stdio;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::command::{Command, StderrPolicy};
use crate::error::{Result, RunboxError};

/// File descriptor the launcher script writes diagnostics to.
pub const LOG_PIPE_FD: i32 = 3;

/// Bounded read/write unit for every pipe.
const CHUNK_SIZE: usize = 8192;

/// One diagnostic line, from the launcher's log pipe or from the engine
/// itself. Forwarded verbatim over the wire protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: String,
    pub message: String,
    pub context: String,
}

impl LogEntry {
    /// Parse one launcher line. Lines may carry a `level:` prefix
    /// (`warn:out of pids`); anything else is informational.
    fn from_launcher_line(line: &str) -> Self {
        let (level, message) = match line.split_once(':') {
            Some((level, rest)) if matches!(level, "debug" | "info" | "warn" | "error") => {
                (level, rest.trim_start())
            }
            _ => ("info", line),
        };
        Self {
            level: level.to_string(),
            message: message.to_string(),
            context: "launcher".to_string(),
        }
    }

    /// Replay the entry into the host's own logger.
    pub fn emit(&self) {
        match self.level.as_str() {
            "error" => error!(context = %self.context, "{}", self.message),
            "warn" => warn!(context = %self.context, "{}", self.message),
            _ => debug!(context = %self.context, "{}", self.message),
        }
    }
}

/// Result of one unboxed execution.
#[derive(Debug, Default)]
pub struct UnboxedResult {
    /// Exit code of the process; `None` only while the command is running.
    /// Signal death is folded in as 128 + signal number.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Lines the launcher wrote to the side-channel log pipe.
    pub log: Vec<LogEntry>,
}

impl UnboxedResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Default)]
pub struct UnboxedExecutor;

impl UnboxedExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Run the command and drain all of its pipes.
    ///
    /// A refused spawn is the only hard error here: non-zero exit, signal
    /// death and stderr output are data in the result, and the caller
    /// decides what they mean.
    pub async fn execute(&self, command: &Command) -> Result<UnboxedResult> {
        let mut builder = build_process(command)?;

        #[cfg(unix)]
        let log_write_end = if command.has_log_pipe() {
            Some(attach_log_pipe(&mut builder)?)
        } else {
            None
        };

        debug!(command = command.text(), "Spawning process");
        let mut child = builder
            .spawn()
            .map_err(|source| RunboxError::Spawn {
                command: command.text().to_string(),
                source,
            })?;

        // The child owns its copy now; keeping ours open would hold the
        // pipe's EOF back forever.
        #[cfg(unix)]
        let log_reader = match log_write_end {
            Some(ends) => {
                drop(ends.write);
                Some(tokio::net::unix::pipe::Receiver::from_owned_fd(ends.read)?)
            }
            None => None,
        };

        let stdin_pipe = child.stdin.take();
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();

        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        // Merged stderr interleaves into the stdout buffer chunk by chunk.
        let stderr_buf = match command.stderr_policy {
            StderrPolicy::Merge => stdout_buf.clone(),
            _ => Arc::new(Mutex::new(Vec::new())),
        };

        let stdin_bytes = command.stdin.clone().unwrap_or_default();
        let forward = command.stderr_policy == StderrPolicy::Forward;

        #[cfg(unix)]
        let log_task = drain_log_pipe(log_reader);
        #[cfg(not(unix))]
        let log_task = async { Vec::new() };

        let (_, _, _, log) = tokio::join!(
            feed_stdin(stdin_pipe, stdin_bytes),
            drain_reader(stdout_pipe, stdout_buf.clone(), false),
            drain_reader(stderr_pipe, stderr_buf.clone(), forward),
            log_task,
        );

        let status = child.wait().await?;
        let exit_code = derive_exit_code(status);

        let stdout = String::from_utf8_lossy(&stdout_buf.lock().await).into_owned();
        let stderr = if command.stderr_policy == StderrPolicy::Merge {
            String::new()
        } else {
            String::from_utf8_lossy(&stderr_buf.lock().await).into_owned()
        };

        if command.stderr_policy == StderrPolicy::Log && !stderr.is_empty() {
            error!(command = command.text(), stderr = %stderr, "Command wrote to stderr");
        }

        debug!(
            exit_code = exit_code,
            stdout_len = stdout.len(),
            stderr_len = stderr.len(),
            "Command completed"
        );

        Ok(UnboxedResult {
            exit_code: Some(exit_code),
            stdout,
            stderr,
            log,
        })
    }
}

fn build_process(command: &Command) -> Result<tokio::process::Command> {
    let mut builder = if command.uses_shell() {
        let mut builder = tokio::process::Command::new("/bin/sh");
        builder.arg("-c").arg(command.text());
        builder
    } else {
        // A wrapper already produced a fully-quoted argv.
        let argv = shell_words::split(command.text()).map_err(|e| {
            RunboxError::Config(format!(
                "cannot split command for direct execution: {}",
                e
            ))
        })?;
        let (program, args) = argv.split_first().ok_or_else(|| {
            RunboxError::Config("empty command after wrapping".to_string())
        })?;
        let mut builder = tokio::process::Command::new(program);
        builder.args(args);
        builder
    };

    builder.envs(&command.env);
    if let Some(dir) = &command.working_dir {
        builder.current_dir(dir);
    }

    builder.stdin(if command.pass_stdin {
        Stdio::inherit()
    } else {
        Stdio::piped()
    });
    builder.stdout(Stdio::piped());
    builder.stderr(Stdio::piped());
    builder.kill_on_drop(true);

    Ok(builder)
}

#[cfg(unix)]
struct PipeEnds {
    read: std::os::fd::OwnedFd,
    write: std::os::fd::OwnedFd,
}

/// Create the log pipe and make its write end appear as fd 3 in the child.
///
/// Both ends are close-on-exec in this process; the dup2 in the child clears
/// the flag on the one descriptor the launcher is meant to see.
#[cfg(unix)]
fn attach_log_pipe(builder: &mut tokio::process::Command) -> Result<PipeEnds> {
    use std::os::fd::AsRawFd;

    let (read, write) =
        nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).map_err(std::io::Error::from)?;
    let raw_write = write.as_raw_fd();
    unsafe {
        builder.pre_exec(move || {
            if libc::dup2(raw_write, LOG_PIPE_FD) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    Ok(PipeEnds { read, write })
}

/// Write buffered stdin in bounded chunks, then close the pipe.
///
/// Write errors are expected when the child exits without reading (EPIPE)
/// and never fail the execution.
async fn feed_stdin(pipe: Option<tokio::process::ChildStdin>, bytes: Vec<u8>) {
    let Some(mut pipe) = pipe else { return };
    for chunk in bytes.chunks(CHUNK_SIZE) {
        if let Err(e) = pipe.write_all(chunk).await {
            debug!(error = %e, "Stopped feeding stdin");
            return;
        }
    }
    if let Err(e) = pipe.shutdown().await {
        debug!(error = %e, "Failed to close stdin");
    }
}

/// Read one pipe to EOF in bounded chunks, appending to `buf`; optionally
/// copy each chunk to the host's own stderr as it arrives.
async fn drain_reader(
    pipe: Option<impl AsyncRead + Unpin>,
    buf: Arc<Mutex<Vec<u8>>>,
    forward: bool,
) {
    let Some(mut pipe) = pipe else { return };
    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                buf.lock().await.extend_from_slice(&chunk[..n]);
                if forward {
                    let mut host = tokio::io::stderr();
                    let _ = host.write_all(&chunk[..n]).await;
                    let _ = host.flush().await;
                }
            }
            Err(e) => {
                debug!(error = %e, "Pipe read failed");
                break;
            }
        }
    }
}

/// Read the log pipe to EOF, splitting on newlines and carrying a partial
/// line across reads. Each complete line becomes one structured entry.
#[cfg(unix)]
async fn drain_log_pipe(pipe: Option<tokio::net::unix::pipe::Receiver>) -> Vec<LogEntry> {
    let Some(mut pipe) = pipe else {
        return Vec::new();
    };
    let mut entries = Vec::new();
    let mut partial = Vec::new();
    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                partial.extend_from_slice(&chunk[..n]);
                while let Some(pos) = partial.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = partial.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line[..line.len() - 1]);
                    if !line.is_empty() {
                        entries.push(LogEntry::from_launcher_line(&line));
                    }
                }
            }
            Err(e) => {
                debug!(error = %e, "Log pipe read failed");
                break;
            }
        }
    }
    if !partial.is_empty() {
        let line = String::from_utf8_lossy(&partial);
        entries.push(LogEntry::from_launcher_line(&line));
    }
    entries
}

fn derive_exit_code(status: std::process::ExitStatus) -> i32 {
    match status.code() {
        Some(127) => {
            warn!("Exit code 127, likely missing executable");
            127
        }
        Some(code) => code,
        None => {
            // Killed by a signal; fold into an exit code the way a shell
            // reports it.
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                let signal = status.signal().unwrap_or(0);
                warn!(signal = signal, "Process killed by signal");
                128 + signal
            }
            #[cfg(not(unix))]
            {
                warn!("Process terminated without an exit code");
                1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;

    #[tokio::test]
    async fn stdin_reaches_stdout() {
        let cmd = Command::new().arg("cat").stdin_bytes("hello");
        let result = UnboxedExecutor::new().execute(&cmd).await.unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout, "hello");
    }

    #[tokio::test]
    async fn limits_do_not_change_semantics() {
        // Limits only matter once a wrapper consumes them; the executor
        // itself runs the command as-is.
        let cmd = Command::new()
            .arg("cat")
            .stdin_bytes("hello")
            .cpu_time_limit(5)
            .memory_limit_kb(0);
        let result = UnboxedExecutor::new().execute(&cmd).await.unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout, "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn signal_death_becomes_128_plus_signo() {
        let cmd = Command::new().unsafe_append("kill -9 $$");
        let result = UnboxedExecutor::new().execute(&cmd).await.unwrap();
        assert_eq!(result.exit_code, Some(137));
    }

    #[tokio::test]
    async fn missing_executable_is_data_not_error() {
        let cmd = Command::new().arg("/nonexistent/program");
        let result = UnboxedExecutor::new().execute(&cmd).await.unwrap();
        assert_eq!(result.exit_code, Some(127));
    }

    #[tokio::test]
    async fn merged_stderr_lands_in_stdout() {
        let cmd = Command::new()
            .unsafe_append("echo out; echo err >&2")
            .stderr_policy(StderrPolicy::Merge);
        let result = UnboxedExecutor::new().execute(&cmd).await.unwrap();
        assert!(result.stdout.contains("out"));
        assert!(result.stdout.contains("err"));
        assert!(result.stderr.is_empty());
    }

    #[tokio::test]
    async fn stderr_is_captured_separately_by_default() {
        let cmd = Command::new().unsafe_append("echo oops >&2; exit 3");
        let result = UnboxedExecutor::new().execute(&cmd).await.unwrap();
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stderr.trim(), "oops");
        assert!(result.stdout.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn log_pipe_lines_become_entries() {
        let mut cmd = Command::new().unsafe_append(&format!(
            "echo 'warn: nearly out of pids' >&{fd}; echo 'plain line' >&{fd}; echo payload",
            fd = LOG_PIPE_FD
        ));
        cmd.enable_log_pipe();
        let result = UnboxedExecutor::new().execute(&cmd).await.unwrap();
        assert_eq!(result.stdout.trim(), "payload");
        assert_eq!(result.log.len(), 2);
        assert_eq!(result.log[0].level, "warn");
        assert_eq!(result.log[0].message, "nearly out of pids");
        assert_eq!(result.log[1].level, "info");
        assert_eq!(result.log[1].message, "plain line");
    }

    #[tokio::test]
    async fn environment_is_passed_through() {
        let cmd = Command::new()
            .unsafe_append("printf '%s' \"$GREETING\"")
            .environment([("GREETING", "hi there")]);
        let result = UnboxedExecutor::new().execute(&cmd).await.unwrap();
        assert_eq!(result.stdout, "hi there");
    }
}
