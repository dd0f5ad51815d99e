use crate::command::Command;
use crate::error::Result;
use crate::wrap::{CommandWrapper, PRIORITY_PLATFORM_SHELL};

/// Re-quotes the whole command for `cmd.exe`.
///
/// Process creation on Windows re-parses a single command-line string, and
/// the default per-argument quoting misparses unescaped metacharacters once
/// a shell string has been wrapped by other layers. This wrapper hands the
/// interpreter one `/s /c` payload and turns off shell handling in the
/// executor so nothing re-quotes it.
pub struct WindowsShellWrapper;

impl WindowsShellWrapper {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WindowsShellWrapper {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandWrapper for WindowsShellWrapper {
    fn name(&self) -> &'static str {
        "windows-shell"
    }

    fn priority(&self) -> i32 {
        PRIORITY_PLATFORM_SHELL
    }

    fn wrap(&self, command: &mut Command) -> Result<()> {
        let payload = format!("\"{}\"", command.text());
        command.replace_text(shell_words::join(["cmd", "/s", "/c", &payload]));
        command.set_direct_exec();
        Ok(())
    }
}
