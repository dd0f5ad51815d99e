//! Client side of remote execution.
//!
//! Serializes a boxed command into a multipart POST, ships inline input
//! files, and routes the multipart response back into the caller's declared
//! output sinks. Validation runs before the first byte leaves the process.

use std::collections::BTreeMap;
use std::time::Duration;

use futures_util::TryStreamExt;
use tracing::{debug, info, warn};

use crate::boxed::{BoxedCommand, BoxedPath, BoxedResult, OutputFile, OutputGlob};
use crate::config::types::RunboxConfig;
use crate::error::{Result, RunboxError};
use crate::remote::wire::{
    self, RequestEnvelope, ResponseMeta, WireCommand, JSON_PART_NAME, STDIN_PART_NAME,
};
use crate::validate::{self, RoutePolicy};

pub struct RemoteExecutor {
    base_url: String,
    routes: BTreeMap<String, RoutePolicy>,
    allow_url_files: bool,
    http: reqwest::Client,
}

impl RemoteExecutor {
    pub fn new(base_url: impl Into<String>, config: &RunboxConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.remote.connect_timeout_seconds))
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            routes: config.routes.clone(),
            allow_url_files: config.execution.allow_url_files,
            http,
        })
    }

    /// Execute the boxed command on the remote server.
    ///
    /// Consumes the command; realized outputs move into the result exactly
    /// as in local execution.
    pub async fn execute(&self, boxed: BoxedCommand) -> Result<BoxedResult> {
        if boxed.has_url_files() && !self.allow_url_files {
            return Err(RunboxError::UrlFilesNotAllowed);
        }
        validate::validate(&boxed, &self.routes)?;

        let envelope = RequestEnvelope::shell(WireCommand::from_boxed(&boxed));
        let route = boxed.route().to_string();
        let (command, inputs, mut outputs, globs) = boxed.into_parts();

        let mut form = reqwest::multipart::Form::new().part(
            JSON_PART_NAME,
            reqwest::multipart::Part::text(serde_json::to_string(&envelope)?)
                .mime_str("application/json")?,
        );
        for (path, mut input) in inputs {
            if input.is_url() {
                // The server fetches these itself.
                continue;
            }
            let bytes = input.read_bytes().await?;
            debug!(file = %path, size = bytes.len(), "Attaching input file");
            form = form.part(
                path.as_str().to_string(),
                reqwest::multipart::Part::bytes(bytes).file_name(path.file_name().to_string()),
            );
        }
        if let Some(stdin) = command.stdin {
            form = form.part(STDIN_PART_NAME, reqwest::multipart::Part::bytes(stdin));
        }

        let url = format!("{}/exec/{}", self.base_url, route);
        info!(url = %url, "Dispatching boxed command");
        let response = self.http.post(&url).multipart(form).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RunboxError::ServerStatus {
                status: status.as_u16(),
                body,
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                RunboxError::Protocol("response has no content type".to_string())
            })?;
        let boundary = multer::parse_boundary(content_type)?;
        let multipart = multer::Multipart::new(
            response.bytes_stream().map_err(std::io::Error::other),
            boundary,
        );

        let meta = consume_response(multipart, &mut outputs, &globs, &self.http).await?;

        // Server log entries are replayed into our logger verbatim.
        for entry in &meta.log {
            entry.emit();
        }

        let exit_code = meta.exit_code.ok_or(RunboxError::MissingExitCode)?;
        Ok(BoxedResult::new(
            Some(exit_code),
            meta.stdout.unwrap_or_default(),
            meta.stderr.unwrap_or_default(),
            meta.log,
            outputs,
        ))
    }
}

#[async_trait::async_trait]
impl crate::boxed::ExecutorBackend for RemoteExecutor {
    fn name(&self) -> &str {
        "remote"
    }

    async fn execute(&self, command: BoxedCommand) -> Result<BoxedResult> {
        RemoteExecutor::execute(self, command).await
    }
}

/// Drain a multipart response: the leading `json-data` part, then one part
/// per returned output file. The metadata's exit code is checked by the
/// caller before any result is built.
async fn consume_response<'a>(
    mut multipart: multer::Multipart<'a>,
    outputs: &mut BTreeMap<BoxedPath, OutputFile>,
    globs: &BTreeMap<String, OutputGlob>,
    http: &reqwest::Client,
) -> Result<ResponseMeta> {
    let first = multipart
        .next_field()
        .await?
        .ok_or_else(|| RunboxError::Protocol("empty multipart response".to_string()))?;
    if first.name() != Some(JSON_PART_NAME) {
        return Err(RunboxError::Protocol(format!(
            "expected leading '{}' part, got {:?}",
            JSON_PART_NAME,
            first.name()
        )));
    }
    let meta: ResponseMeta = serde_json::from_slice(&first.bytes().await?)?;

    while let Some(field) = multipart.next_field().await? {
        let Some(name) = field.name().map(str::to_string) else {
            warn!("Skipping unnamed response part");
            continue;
        };
        let path = BoxedPath::new(&name)?;
        let bytes = field.bytes().await?.to_vec();

        if !outputs.contains_key(&path) {
            match wire::glob_for_part(globs, &path) {
                Some(glob) => {
                    outputs.insert(path.clone(), glob.mint(&path));
                }
                None => {
                    warn!(part = %path, "Server returned an undeclared file");
                    continue;
                }
            }
        }
        let output = outputs.get_mut(&path).expect("inserted above");
        debug!(file = %path, size = bytes.len(), "Receiving output file");
        output.receive_bytes(bytes, http).await?;
    }

    // Files the server already delivered to their URL sinks.
    for name in &meta.uploaded_files {
        let path = BoxedPath::new(name)?;
        if !outputs.contains_key(&path) {
            if let Some(glob) = wire::glob_for_part(globs, &path) {
                outputs.insert(path.clone(), glob.mint(&path));
            }
        }
        match outputs.get_mut(&path) {
            Some(output) => output.mark_received(),
            None => warn!(file = %path, "Server uploaded an undeclared file"),
        }
    }

    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::convert::Infallible;

    const BOUNDARY: &str = "test-boundary";

    fn multipart_body(parts: &[(&str, &str, &[u8])]) -> Bytes {
        let mut body = Vec::new();
        for (name, content_type, payload) in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{}\"\r\n", name).as_bytes(),
            );
            body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
            body.extend_from_slice(payload);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        Bytes::from(body)
    }

    fn parse(body: Bytes) -> multer::Multipart<'static> {
        let stream = futures_util::stream::once(async move { Ok::<_, Infallible>(body) });
        multer::Multipart::new(stream, BOUNDARY)
    }

    #[tokio::test]
    async fn response_parts_land_in_declared_sinks() {
        let body = multipart_body(&[
            (
                JSON_PART_NAME,
                "application/json",
                br#"{"exitCode": 0, "stdout": "done"}"#,
            ),
            ("out.txt", "application/octet-stream", b"abc"),
        ]);

        let mut outputs = BTreeMap::from([(
            BoxedPath::new("out.txt").unwrap(),
            OutputFile::to_capture(),
        )]);
        let globs = BTreeMap::new();
        let meta = consume_response(parse(body), &mut outputs, &globs, &reqwest::Client::new())
            .await
            .unwrap();

        assert_eq!(meta.exit_code, Some(0));
        let out = &outputs[&BoxedPath::new("out.txt").unwrap()];
        assert!(out.was_received());
        assert_eq!(out.contents(), Some(&b"abc"[..]));
    }

    #[tokio::test]
    async fn missing_exit_code_is_a_protocol_error() {
        let body = multipart_body(&[(
            JSON_PART_NAME,
            "application/json",
            br#"{"stdout": "no code"}"#,
        )]);
        let mut outputs = BTreeMap::new();
        let globs = BTreeMap::new();
        let meta = consume_response(parse(body), &mut outputs, &globs, &reqwest::Client::new())
            .await
            .unwrap();
        // The caller turns this into MissingExitCode before building a result.
        assert!(meta.exit_code.is_none());
    }

    #[tokio::test]
    async fn response_without_leading_json_part_is_rejected() {
        let body = multipart_body(&[("out.txt", "application/octet-stream", b"abc")]);
        let mut outputs = BTreeMap::new();
        let globs = BTreeMap::new();
        let err = consume_response(parse(body), &mut outputs, &globs, &reqwest::Client::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RunboxError::Protocol(_)));
    }

    #[tokio::test]
    async fn uploaded_files_are_marked_without_bytes() {
        let body = multipart_body(&[(
            JSON_PART_NAME,
            "application/json",
            br#"{"exitCode": 0, "uploadedFiles": ["remote.bin"]}"#,
        )]);
        let mut outputs = BTreeMap::from([(
            BoxedPath::new("remote.bin").unwrap(),
            OutputFile::to_url("https://example.com/up".parse().unwrap()),
        )]);
        let globs = BTreeMap::new();
        consume_response(parse(body), &mut outputs, &globs, &reqwest::Client::new())
            .await
            .unwrap();

        let out = &outputs[&BoxedPath::new("remote.bin").unwrap()];
        assert!(out.was_received());
        assert!(out.contents().is_none());
    }

    #[tokio::test]
    async fn glob_parts_are_minted_on_the_fly() {
        let body = multipart_body(&[
            (JSON_PART_NAME, "application/json", br#"{"exitCode": 0}"#),
            ("frames/f_1.txt", "application/octet-stream", b"one"),
        ]);
        let mut outputs = BTreeMap::new();
        let globs = BTreeMap::from([(
            "frames".to_string(),
            OutputGlob::new(BoxedPath::new("frames/f_").unwrap(), "txt", |_| {
                OutputFile::to_capture()
            })
            .unwrap(),
        )]);
        consume_response(parse(body), &mut outputs, &globs, &reqwest::Client::new())
            .await
            .unwrap();

        let out = &outputs[&BoxedPath::new("frames/f_1.txt").unwrap()];
        assert_eq!(out.contents(), Some(&b"one"[..]));
    }
}
