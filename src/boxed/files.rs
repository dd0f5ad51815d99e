//! Declared input and output files of a boxed command.
//!
//! An [`InputFile`] describes how to materialize one file before execution;
//! an [`OutputFile`] describes where its bytes go afterwards. Both are
//! variants over the same four endpoints (inline bytes, local file, stream,
//! URL), so moving a file is always one `copy_to`/`receive` call switching
//! over the tag.

use std::fmt;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;
use url::Url;

use crate::boxed::path::BoxedPath;
use crate::error::{Result, RunboxError};

pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;
pub type ByteSink = Box<dyn AsyncWrite + Send + Unpin>;

/// How to materialize one input file in the working directory.
pub enum InputFile {
    Bytes(Vec<u8>),
    LocalFile(PathBuf),
    Stream(ByteStream),
    Url(Url),
}

impl InputFile {
    pub fn is_url(&self) -> bool {
        matches!(self, Self::Url(_))
    }

    pub fn url(&self) -> Option<&Url> {
        match self {
            Self::Url(url) => Some(url),
            _ => None,
        }
    }

    /// Write the file's bytes to `dest`.
    pub async fn copy_to(&mut self, dest: &Path, http: &reqwest::Client) -> Result<()> {
        match self {
            Self::Bytes(bytes) => {
                tokio::fs::write(dest, bytes).await?;
            }
            Self::LocalFile(source) => {
                tokio::fs::copy(&source, dest).await?;
            }
            Self::Stream(stream) => {
                let mut file = tokio::fs::File::create(dest).await?;
                tokio::io::copy(stream, &mut file).await?;
                file.flush().await?;
            }
            Self::Url(url) => {
                let response = http.get(url.clone()).send().await?.error_for_status()?;
                let mut file = tokio::fs::File::create(dest).await?;
                let mut body = response.bytes_stream();
                use futures_util::StreamExt;
                while let Some(chunk) = body.next().await {
                    file.write_all(&chunk?).await?;
                }
                file.flush().await?;
            }
        }
        Ok(())
    }

    /// Drain the file into memory, for shipping as one multipart part.
    /// URL inputs stay out-of-band; the server fetches those itself.
    pub async fn read_bytes(&mut self) -> Result<Vec<u8>> {
        match self {
            Self::Bytes(bytes) => Ok(bytes.clone()),
            Self::LocalFile(source) => Ok(tokio::fs::read(&source).await?),
            Self::Stream(stream) => {
                let mut bytes = Vec::new();
                stream.read_to_end(&mut bytes).await?;
                Ok(bytes)
            }
            Self::Url(url) => Err(RunboxError::Config(format!(
                "URL input '{}' cannot be shipped inline",
                url
            ))),
        }
    }
}

impl fmt::Debug for InputFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => write!(f, "InputFile::Bytes({} bytes)", bytes.len()),
            Self::LocalFile(path) => write!(f, "InputFile::LocalFile({})", path.display()),
            Self::Stream(_) => write!(f, "InputFile::Stream"),
            Self::Url(url) => write!(f, "InputFile::Url({})", url),
        }
    }
}

/// Where one produced file's bytes are sent.
pub enum OutputSink {
    /// Keep the bytes in memory, readable from the result.
    Capture,
    LocalFile(PathBuf),
    Stream(ByteSink),
    Url(Url),
    /// Track existence only; the bytes go nowhere.
    Discard,
}

impl fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capture => write!(f, "Capture"),
            Self::LocalFile(path) => write!(f, "LocalFile({})", path.display()),
            Self::Stream(_) => write!(f, "Stream"),
            Self::Url(url) => write!(f, "Url({})", url),
            Self::Discard => write!(f, "Discard"),
        }
    }
}

/// A declared output file.
///
/// Created "not received"; populated at most once after execution, when the
/// command actually produced the file and the exit-code gate (if any)
/// passed. Absence is queryable, never an error.
pub struct OutputFile {
    sink: OutputSink,
    only_if_exit_code: Option<i32>,
    on_received: Option<Box<dyn FnOnce() + Send>>,
    received: bool,
    contents: Option<Vec<u8>>,
}

impl OutputFile {
    fn with_sink(sink: OutputSink) -> Self {
        Self {
            sink,
            only_if_exit_code: None,
            on_received: None,
            received: false,
            contents: None,
        }
    }

    pub fn to_capture() -> Self {
        Self::with_sink(OutputSink::Capture)
    }

    pub fn to_local_file(path: impl Into<PathBuf>) -> Self {
        Self::with_sink(OutputSink::LocalFile(path.into()))
    }

    pub fn to_stream(sink: ByteSink) -> Self {
        Self::with_sink(OutputSink::Stream(sink))
    }

    pub fn to_url(url: Url) -> Self {
        Self::with_sink(OutputSink::Url(url))
    }

    pub fn placeholder() -> Self {
        Self::with_sink(OutputSink::Discard)
    }

    /// Only harvest the file when the command exited with `code`.
    pub fn only_if_exit_code(mut self, code: i32) -> Self {
        self.only_if_exit_code = Some(code);
        self
    }

    /// Run `hook` once, right after the file has been received.
    pub fn on_received(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_received = Some(Box::new(hook));
        self
    }

    pub fn gate_allows(&self, exit_code: Option<i32>) -> bool {
        match self.only_if_exit_code {
            Some(required) => exit_code == Some(required),
            None => true,
        }
    }

    pub fn exit_code_gate(&self) -> Option<i32> {
        self.only_if_exit_code
    }

    pub fn is_url(&self) -> bool {
        matches!(self.sink, OutputSink::Url(_))
    }

    pub fn url(&self) -> Option<&Url> {
        match &self.sink {
            OutputSink::Url(url) => Some(url),
            _ => None,
        }
    }

    pub fn was_received(&self) -> bool {
        self.received
    }

    /// Captured bytes, for the capture sink only.
    pub fn contents(&self) -> Option<&[u8]> {
        self.contents.as_deref()
    }

    pub fn contents_str(&self) -> Option<String> {
        self.contents
            .as_ref()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Route the produced file at `source` to the declared sink.
    pub async fn receive_path(&mut self, source: &Path, http: &reqwest::Client) -> Result<()> {
        if self.received {
            return Ok(());
        }
        match &mut self.sink {
            OutputSink::Capture => {
                self.contents = Some(tokio::fs::read(source).await?);
            }
            OutputSink::LocalFile(dest) => {
                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::copy(source, &dest).await?;
            }
            OutputSink::Stream(sink) => {
                let mut file = tokio::fs::File::open(source).await?;
                tokio::io::copy(&mut file, sink).await?;
                sink.flush().await?;
            }
            OutputSink::Url(url) => {
                let bytes = tokio::fs::read(source).await?;
                http.put(url.clone())
                    .body(bytes)
                    .send()
                    .await?
                    .error_for_status()?;
            }
            OutputSink::Discard => {}
        }
        self.mark_received();
        Ok(())
    }

    /// Route bytes that arrived over the wire to the declared sink.
    pub async fn receive_bytes(&mut self, bytes: Vec<u8>, http: &reqwest::Client) -> Result<()> {
        if self.received {
            return Ok(());
        }
        match &mut self.sink {
            OutputSink::Capture => {
                self.contents = Some(bytes);
            }
            OutputSink::LocalFile(dest) => {
                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&dest, &bytes).await?;
            }
            OutputSink::Stream(sink) => {
                sink.write_all(&bytes).await?;
                sink.flush().await?;
            }
            OutputSink::Url(url) => {
                http.put(url.clone())
                    .body(bytes)
                    .send()
                    .await?
                    .error_for_status()?;
            }
            OutputSink::Discard => {}
        }
        self.mark_received();
        Ok(())
    }

    /// Mark received without any bytes: a remote server reports it already
    /// delivered the file to its URL sink on our behalf.
    pub fn mark_received(&mut self) {
        self.received = true;
        if let Some(hook) = self.on_received.take() {
            hook();
        }
    }
}

impl fmt::Debug for OutputFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputFile")
            .field("sink", &self.sink)
            .field("only_if_exit_code", &self.only_if_exit_code)
            .field("received", &self.received)
            .finish_non_exhaustive()
    }
}

/// A declared file-name pattern collecting an unknown number of generated
/// files: every file in the prefix's directory whose name starts with the
/// prefix and carries the extension. One [`OutputFile`] is minted per match.
pub struct OutputGlob {
    prefix: BoxedPath,
    extension: String,
    factory: Box<dyn Fn(&BoxedPath) -> OutputFile + Send + Sync>,
    /// URL prefix matches are uploaded under when execution is remote.
    url_base: Option<Url>,
}

impl OutputGlob {
    pub fn new(
        prefix: BoxedPath,
        extension: impl Into<String>,
        factory: impl Fn(&BoxedPath) -> OutputFile + Send + Sync + 'static,
    ) -> Result<Self> {
        let extension = extension.into();
        if extension.is_empty() || extension.contains(['/', '.']) {
            return Err(RunboxError::Config(format!(
                "invalid glob extension '{}'",
                extension
            )));
        }
        Ok(Self {
            prefix,
            extension,
            factory: Box::new(factory),
            url_base: None,
        })
    }

    /// Declare that matches of this glob go to `base/<file name>`. A remote
    /// server uploads them directly instead of returning them inline.
    pub fn with_url_base(mut self, base: Url) -> Self {
        self.url_base = Some(base);
        self
    }

    pub fn url_base(&self) -> Option<&Url> {
        self.url_base.as_ref()
    }

    pub fn prefix(&self) -> &BoxedPath {
        &self.prefix
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// The pattern in its `prefix*.ext` notation, as policies spell it.
    pub fn pattern(&self) -> String {
        format!("{}*.{}", self.prefix, self.extension)
    }

    /// Does a file name (without directory) in the glob's directory match?
    pub fn matches(&self, file_name: &str) -> bool {
        file_name.starts_with(self.prefix.file_name())
            && file_name
                .strip_suffix(&self.extension)
                .and_then(|stem| stem.strip_suffix('.'))
                .is_some()
    }

    pub fn mint(&self, path: &BoxedPath) -> OutputFile {
        (self.factory)(path)
    }

    /// Boxed paths of every matching file currently present under `root`.
    pub fn discover(&self, root: &Path) -> Result<Vec<BoxedPath>> {
        let dir_rel = self.prefix.parent();
        let dir_abs = match dir_rel {
            Some(dir) => root.join(dir),
            None => root.to_path_buf(),
        };
        if !dir_abs.is_dir() {
            return Ok(Vec::new());
        }

        let mut matches = Vec::new();
        for entry in std::fs::read_dir(&dir_abs)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !self.matches(name) {
                continue;
            }
            let rel = match dir_rel {
                Some(dir) => format!("{}/{}", dir, name),
                None => name.to_string(),
            };
            matches.push(BoxedPath::new(rel)?);
        }
        matches.sort();
        debug!(pattern = %self.pattern(), count = matches.len(), "Glob discovery");
        Ok(matches)
    }
}

impl fmt::Debug for OutputGlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutputGlob({})", self.pattern())
    }
}
