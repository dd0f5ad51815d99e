//! The server side of boxed execution.
//!
//! Differs from the local pipeline only in how files move: ordinary input
//! files stream straight from the inbound request into the working
//! directory, URL inputs are fetched here, and URL outputs are uploaded
//! here instead of being embedded in the response.

use std::collections::BTreeSet;

use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

use runbox::boxed::executor::harvest_outputs;
use runbox::boxed::{BoxedCommand, BoxedPath, OutputFile, OutputGlob};
use runbox::error::{Result, RunboxError};
use runbox::exec::UnboxedExecutor;
use runbox::remote::wire::{
    RequestEnvelope, ResponseMeta, WireCommand, ACTION_SHELL, JSON_PART_NAME, STDIN_PART_NAME,
};
use runbox::validate;
use runbox::workdir::WorkDir;

use crate::app::AppState;

const RESPONSE_BOUNDARY: &str = "runbox-response-3f9d7c";

pub async fn exec_handler(
    State(state): State<AppState>,
    Path(route): Path<String>,
    multipart: Multipart,
) -> Response {
    match run(&state, &route, multipart).await {
        Ok(response) => response,
        Err(error) => error_response(error),
    }
}

fn error_response(error: RunboxError) -> Response {
    let status = if error.is_validation() {
        StatusCode::FORBIDDEN
    } else if error.is_configuration() {
        StatusCode::BAD_REQUEST
    } else {
        match error {
            RunboxError::Protocol(_) | RunboxError::Multipart(_) | RunboxError::Json(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    };
    warn!(status = %status, error = %error, "Request rejected");
    (status, error.to_string()).into_response()
}

fn proto(error: axum::extract::multipart::MultipartError) -> RunboxError {
    RunboxError::Protocol(error.to_string())
}

async fn run(state: &AppState, route: &str, mut multipart: Multipart) -> Result<Response> {
    // The metadata part leads; everything about the command is known
    // before the first file byte is read.
    let first = multipart
        .next_field()
        .await
        .map_err(proto)?
        .ok_or_else(|| RunboxError::Protocol("empty request body".to_string()))?;
    if first.name() != Some(JSON_PART_NAME) {
        return Err(RunboxError::Protocol(format!(
            "expected leading '{}' part, got {:?}",
            JSON_PART_NAME,
            first.name()
        )));
    }
    let envelope: RequestEnvelope = serde_json::from_slice(&first.bytes().await.map_err(proto)?)?;
    if envelope.action != ACTION_SHELL {
        return Err(RunboxError::Protocol(format!(
            "unsupported action '{}'",
            envelope.action
        )));
    }
    let wire = envelope.command;
    if wire.route != route {
        return Err(RunboxError::Protocol(format!(
            "route mismatch: path says '{}', body says '{}'",
            route, wire.route
        )));
    }

    if wire.has_url_files() && !state.config.execution.allow_url_files {
        return Err(RunboxError::UrlFilesNotAllowed);
    }

    let boxed = boxed_from_wire(route, &wire)?;
    validate::validate(&boxed, &state.config.routes)?;

    let workdir = WorkDir::create(state.config.execution.work_dir.as_deref())?;
    let (mut command, _inputs, mut outputs, globs) = boxed.into_parts();

    // Ordinary input files stream straight from the request to disk.
    let declared: BTreeSet<&str> = wire.inline_input_names().collect();
    while let Some(mut field) = multipart.next_field().await.map_err(proto)? {
        let Some(name) = field.name().map(str::to_string) else {
            warn!("Skipping unnamed request part");
            continue;
        };
        if name == STDIN_PART_NAME {
            command.stdin = Some(field.bytes().await.map_err(proto)?.to_vec());
            continue;
        }
        if !declared.contains(name.as_str()) {
            return Err(RunboxError::Validation {
                route: route.to_string(),
                reason: format!("undeclared input part '{}'", name),
            });
        }
        let path = BoxedPath::new(&name)?;
        let dest = workdir.prepare(&path)?;
        debug!(file = %path, "Staging input file from request");
        let mut file = tokio::fs::File::create(&dest).await?;
        while let Some(chunk) = field.chunk().await.map_err(proto)? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
    }

    // URL inputs are fetched here, not by the client.
    for input in wire.url_inputs() {
        let source = input.url.as_deref().unwrap_or_default();
        let url: Url = source.parse().map_err(|e| {
            RunboxError::Config(format!("invalid input URL '{}': {}", source, e))
        })?;
        let path = BoxedPath::new(&input.name)?;
        let dest = workdir.prepare(&path)?;
        debug!(file = %path, url = %url, "Fetching input file");
        let response = state.http.get(url).send().await?.error_for_status()?;
        let mut file = tokio::fs::File::create(&dest).await?;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
    }

    for path in outputs.keys() {
        workdir.prepare(path)?;
    }
    for glob in globs.values() {
        workdir.prepare(glob.prefix())?;
    }

    command.pass_stdin = false;
    command.working_dir = Some(workdir.root().to_path_buf());
    state.chain.apply(&mut command)?;

    info!(route = %route, "Executing boxed command");
    let result = UnboxedExecutor::new().execute(&command).await?;

    harvest_outputs(
        &mut outputs,
        &globs,
        workdir.root(),
        result.exit_code,
        &state.http,
    )
    .await?;

    let mut uploaded_files = Vec::new();
    let mut received_files = Vec::new();
    let mut inline_parts: Vec<(String, Vec<u8>)> = Vec::new();
    for (path, output) in &outputs {
        if !output.was_received() {
            continue;
        }
        received_files.push(path.as_str().to_string());
        if output.is_url() {
            uploaded_files.push(path.as_str().to_string());
        } else if let Some(bytes) = output.contents() {
            inline_parts.push((path.as_str().to_string(), bytes.to_vec()));
        }
    }

    let meta = ResponseMeta {
        exit_code: result.exit_code,
        stdout: Some(result.stdout),
        stderr: Some(result.stderr),
        log: result.log,
        uploaded_files,
        received_files,
    };
    let body = assemble_response(&meta, &inline_parts)?;

    // The directory outlives harvesting and response assembly, nothing
    // more.
    workdir.teardown()?;

    Ok((
        [(
            header::CONTENT_TYPE,
            format!("multipart/mixed; boundary={}", RESPONSE_BOUNDARY),
        )],
        body,
    )
        .into_response())
}

/// Rebuild the boxed command the client described. Inline inputs get
/// placeholder bytes; their real contents stream in from the request.
fn boxed_from_wire(route: &str, wire: &WireCommand) -> Result<BoxedCommand> {
    let mut boxed = BoxedCommand::new(route, wire.to_command())?;

    for input in &wire.input_files {
        boxed = match &input.url {
            Some(url) => {
                let url: Url = url.parse().map_err(|e| {
                    RunboxError::Config(format!("invalid input URL '{}': {}", url, e))
                })?;
                boxed.input_url(&input.name, url)?
            }
            None => boxed.input_bytes(&input.name, Vec::new())?,
        };
    }

    for output in &wire.output_files {
        let mut file = match &output.url {
            Some(url) => {
                let url: Url = url.parse().map_err(|e| {
                    RunboxError::Config(format!("invalid output URL '{}': {}", url, e))
                })?;
                OutputFile::to_url(url)
            }
            None => OutputFile::to_capture(),
        };
        if let Some(code) = output.only_if_exit_code {
            file = file.only_if_exit_code(code);
        }
        boxed = boxed.output(&output.name, file)?;
    }

    for glob in &wire.output_globs {
        let built = match &glob.url_base {
            Some(base) => {
                let base: Url = base.parse().map_err(|e| {
                    RunboxError::Config(format!("invalid glob URL base '{}': {}", base, e))
                })?;
                let factory_base = base.clone();
                OutputGlob::new(
                    BoxedPath::new(&glob.prefix)?,
                    glob.extension.clone(),
                    move |path| {
                        let target = format!(
                            "{}/{}",
                            factory_base.as_str().trim_end_matches('/'),
                            path.file_name()
                        );
                        match target.parse() {
                            Ok(url) => OutputFile::to_url(url),
                            Err(_) => {
                                warn!(file = %path, "Glob match has no valid upload URL");
                                OutputFile::placeholder()
                            }
                        }
                    },
                )?
                .with_url_base(base)
            }
            None => OutputGlob::new(BoxedPath::new(&glob.prefix)?, glob.extension.clone(), |_| {
                OutputFile::to_capture()
            })?,
        };
        boxed = boxed.glob(&glob.id, built)?;
    }

    Ok(boxed)
}

/// Assemble the multipart/mixed response by hand: the metadata part first,
/// then one part per inline output file.
fn assemble_response(meta: &ResponseMeta, parts: &[(String, Vec<u8>)]) -> Result<Vec<u8>> {
    let mut body = Vec::new();

    push_part_header(&mut body, JSON_PART_NAME, "application/json");
    body.extend_from_slice(&serde_json::to_vec(meta)?);
    body.extend_from_slice(b"\r\n");

    for (name, bytes) in parts {
        push_part_header(&mut body, name, "application/octet-stream");
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }

    body.extend_from_slice(format!("--{}--\r\n", RESPONSE_BOUNDARY).as_bytes());
    Ok(body)
}

fn push_part_header(body: &mut Vec<u8>, name: &str, content_type: &str) {
    body.extend_from_slice(format!("--{}\r\n", RESPONSE_BOUNDARY).as_bytes());
    body.extend_from_slice(
        format!("Content-Disposition: form-data; name=\"{}\"\r\n", name).as_bytes(),
    );
    body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_command_rebuilds_outputs_and_globs() {
        let wire = WireCommand {
            route: "thumb".to_string(),
            text: "convert in.png out.png".to_string(),
            input_files: vec![runbox::remote::WireInput {
                name: "in.png".to_string(),
                url: None,
            }],
            output_files: vec![runbox::remote::WireOutput {
                name: "out.png".to_string(),
                url: None,
                only_if_exit_code: Some(0),
            }],
            output_globs: vec![runbox::remote::WireGlob {
                id: "extra".to_string(),
                prefix: "pages/p_".to_string(),
                extension: "png".to_string(),
                url_base: None,
            }],
            ..Default::default()
        };

        let boxed = boxed_from_wire("thumb", &wire).unwrap();
        assert_eq!(boxed.inputs().len(), 1);
        let out = &boxed.outputs()[&BoxedPath::new("out.png").unwrap()];
        assert!(out.gate_allows(Some(0)));
        assert!(!out.gate_allows(Some(1)));
        assert_eq!(boxed.globs()["extra"].pattern(), "pages/p_*.png");
    }

    #[test]
    fn bad_paths_from_the_wire_are_rejected() {
        let wire = WireCommand {
            route: "r".to_string(),
            text: "true".to_string(),
            input_files: vec![runbox::remote::WireInput {
                name: "../escape".to_string(),
                url: None,
            }],
            ..Default::default()
        };
        assert!(matches!(
            boxed_from_wire("r", &wire).unwrap_err(),
            RunboxError::BadBoxedPath { .. }
        ));
    }

    #[test]
    fn response_body_is_parseable_multipart() {
        let meta = ResponseMeta {
            exit_code: Some(0),
            stdout: Some("hi".to_string()),
            ..Default::default()
        };
        let body = assemble_response(&meta, &[("out.txt".to_string(), b"abc".to_vec())]).unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(text.starts_with(&format!("--{}\r\n", RESPONSE_BOUNDARY)));
        assert!(text.contains("name=\"json-data\""));
        assert!(text.contains("\"exitCode\":0"));
        assert!(text.contains("name=\"out.txt\""));
        assert!(text.ends_with(&format!("--{}--\r\n", RESPONSE_BOUNDARY)));
    }
}
