//! Boxed command execution.
//!
//! A boxed command runs inside a private, initially empty working directory
//! with declared input and output files. The route name is an opaque label
//! used for server-side policy lookup; everything else extends the plain
//! [`Command`] model.

pub mod executor;
pub mod files;
pub mod path;

pub use executor::BoxedExecutor;
pub use files::{ByteSink, ByteStream, InputFile, OutputFile, OutputGlob, OutputSink};
pub use path::BoxedPath;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use url::Url;

use crate::command::Command;
use crate::error::{Result, RunboxError};
use crate::exec::LogEntry;

/// Trait for boxed execution backends.
///
/// Local and remote execution are interchangeable behind this: the caller
/// hands over a boxed command and gets the same result shape back, with the
/// realized output files inside.
#[async_trait]
pub trait ExecutorBackend: Send + Sync {
    /// Returns the backend name (e.g., "local", "remote")
    fn name(&self) -> &str;

    /// Execute a boxed command and realize its declared output files.
    async fn execute(&self, command: BoxedCommand) -> Result<BoxedResult>;
}

/// A command scoped to a private working directory with declared files.
#[derive(Debug)]
pub struct BoxedCommand {
    pub command: Command,
    route: String,
    inputs: BTreeMap<BoxedPath, InputFile>,
    outputs: BTreeMap<BoxedPath, OutputFile>,
    globs: BTreeMap<String, OutputGlob>,
}

impl BoxedCommand {
    pub fn new(route: impl Into<String>, command: Command) -> Result<Self> {
        let route = route.into();
        if route.is_empty() {
            return Err(RunboxError::Config("empty route name".to_string()));
        }
        Ok(Self {
            command,
            route,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            globs: BTreeMap::new(),
        })
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn inputs(&self) -> &BTreeMap<BoxedPath, InputFile> {
        &self.inputs
    }

    pub fn outputs(&self) -> &BTreeMap<BoxedPath, OutputFile> {
        &self.outputs
    }

    pub fn globs(&self) -> &BTreeMap<String, OutputGlob> {
        &self.globs
    }

    /// Register one input file. The path is normalized here, before any
    /// file or network I/O can happen.
    pub fn input(mut self, path: impl AsRef<str>, input: InputFile) -> Result<Self> {
        let path = BoxedPath::new(path)?;
        if self.inputs.contains_key(&path) {
            return Err(RunboxError::Config(format!(
                "input file '{}' registered twice",
                path
            )));
        }
        self.inputs.insert(path, input);
        Ok(self)
    }

    pub fn input_bytes(self, path: impl AsRef<str>, bytes: impl Into<Vec<u8>>) -> Result<Self> {
        self.input(path, InputFile::Bytes(bytes.into()))
    }

    pub fn input_local_file(self, path: impl AsRef<str>, source: impl Into<PathBuf>) -> Result<Self> {
        self.input(path, InputFile::LocalFile(source.into()))
    }

    pub fn input_stream(self, path: impl AsRef<str>, stream: ByteStream) -> Result<Self> {
        self.input(path, InputFile::Stream(stream))
    }

    pub fn input_url(self, path: impl AsRef<str>, url: Url) -> Result<Self> {
        self.input(path, InputFile::Url(url))
    }

    /// Register one output file under its normalized path.
    pub fn output(mut self, path: impl AsRef<str>, output: OutputFile) -> Result<Self> {
        let path = BoxedPath::new(path)?;
        if self.outputs.contains_key(&path) {
            return Err(RunboxError::Config(format!(
                "output file '{}' registered twice",
                path
            )));
        }
        self.outputs.insert(path, output);
        Ok(self)
    }

    pub fn output_capture(self, path: impl AsRef<str>) -> Result<Self> {
        self.output(path, OutputFile::to_capture())
    }

    pub fn output_local_file(
        self,
        path: impl AsRef<str>,
        dest: impl Into<PathBuf>,
    ) -> Result<Self> {
        self.output(path, OutputFile::to_local_file(dest))
    }

    pub fn output_stream(self, path: impl AsRef<str>, sink: ByteSink) -> Result<Self> {
        self.output(path, OutputFile::to_stream(sink))
    }

    pub fn output_url(self, path: impl AsRef<str>, url: Url) -> Result<Self> {
        self.output(path, OutputFile::to_url(url))
    }

    pub fn output_placeholder(self, path: impl AsRef<str>) -> Result<Self> {
        self.output(path, OutputFile::placeholder())
    }

    /// Register a pre-built output glob under a caller-chosen id.
    pub fn glob(mut self, id: impl Into<String>, glob: OutputGlob) -> Result<Self> {
        let id = id.into();
        if self.globs.contains_key(&id) {
            return Err(RunboxError::Config(format!(
                "output glob '{}' registered twice",
                id
            )));
        }
        self.globs.insert(id, glob);
        Ok(self)
    }

    /// Register an output glob under a caller-chosen id.
    pub fn output_glob(
        self,
        id: impl Into<String>,
        prefix: impl AsRef<str>,
        extension: impl Into<String>,
        factory: impl Fn(&BoxedPath) -> OutputFile + Send + Sync + 'static,
    ) -> Result<Self> {
        let glob = OutputGlob::new(BoxedPath::new(prefix)?, extension, factory)?;
        self.glob(id, glob)
    }

    /// True when any declared file is URL-backed. Such commands need the
    /// local configuration's explicit opt-in before any network activity.
    pub fn has_url_files(&self) -> bool {
        self.inputs.values().any(InputFile::is_url)
            || self.outputs.values().any(OutputFile::is_url)
    }

    /// Split into the plain command and the file maps. Executors consume
    /// the boxed command this way; the realized outputs later move into the
    /// result.
    pub fn into_parts(
        self,
    ) -> (
        Command,
        BTreeMap<BoxedPath, InputFile>,
        BTreeMap<BoxedPath, OutputFile>,
        BTreeMap<String, OutputGlob>,
    ) {
        (self.command, self.inputs, self.outputs, self.globs)
    }
}

/// Result of one boxed execution: the plain result plus the realized
/// output files, queryable by boxed name.
#[derive(Debug)]
pub struct BoxedResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub log: Vec<LogEntry>,
    outputs: BTreeMap<BoxedPath, OutputFile>,
}

impl BoxedResult {
    pub(crate) fn new(
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
        log: Vec<LogEntry>,
        outputs: BTreeMap<BoxedPath, OutputFile>,
    ) -> Self {
        Self {
            exit_code,
            stdout,
            stderr,
            log,
            outputs,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn output(&self, name: &str) -> Option<&OutputFile> {
        let path = BoxedPath::new(name).ok()?;
        self.outputs.get(&path)
    }

    /// Did the command produce this declared file?
    pub fn was_received(&self, name: &str) -> bool {
        self.output(name).is_some_and(OutputFile::was_received)
    }

    /// Captured bytes of a string-sink output.
    pub fn file_contents(&self, name: &str) -> Option<&[u8]> {
        self.output(name).and_then(OutputFile::contents)
    }

    pub fn file_contents_str(&self, name: &str) -> Option<String> {
        self.output(name).and_then(OutputFile::contents_str)
    }

    /// Names of every realized output, declared and glob-minted.
    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.keys().map(BoxedPath::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_registration_is_rejected() {
        let boxed = BoxedCommand::new("route", Command::new().arg("true"))
            .unwrap()
            .input_bytes("in.txt", "a")
            .unwrap();
        assert!(boxed.input_bytes("in.txt", "b").is_err());
    }

    #[test]
    fn traversal_is_rejected_at_registration() {
        let boxed = BoxedCommand::new("route", Command::new().arg("true")).unwrap();
        let err = boxed.input_bytes("../escape.txt", "x").unwrap_err();
        assert!(matches!(err, RunboxError::BadBoxedPath { .. }));
    }

    #[test]
    fn url_files_are_detected() {
        let plain = BoxedCommand::new("route", Command::new().arg("true"))
            .unwrap()
            .input_bytes("in.txt", "a")
            .unwrap();
        assert!(!plain.has_url_files());

        let with_url = BoxedCommand::new("route", Command::new().arg("true"))
            .unwrap()
            .input_url("in.txt", "https://example.com/in.txt".parse().unwrap())
            .unwrap();
        assert!(with_url.has_url_files());
    }

    #[test]
    fn empty_route_is_rejected() {
        assert!(BoxedCommand::new("", Command::new().arg("true")).is_err());
    }
}
