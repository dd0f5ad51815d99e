//! Wire format of the remote execution protocol.
//!
//! A request is one multipart body: a `json-data` part carrying the
//! envelope below, one binary part per inline input file keyed by its boxed
//! path, and an optional `stdin` part. The response mirrors it: a
//! `json-data` metadata part (the exit code is mandatory there) followed by
//! one part per returned output file.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::boxed::{BoxedCommand, OutputGlob};
use crate::command::Command;
use crate::exec::LogEntry;

pub const ACTION_SHELL: &str = "shell";
pub const JSON_PART_NAME: &str = "json-data";
pub const STDIN_PART_NAME: &str = "stdin";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub action: String,
    pub command: WireCommand,
}

impl RequestEnvelope {
    pub fn shell(command: WireCommand) -> Self {
        Self {
            action: ACTION_SHELL.to_string(),
            command,
        }
    }
}

/// The serializable view of a boxed command: the command line, limits and
/// toggles, plus declared-but-not-yet-filled file name lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WireCommand {
    pub route: String,
    pub text: String,
    pub cpu_limit: Option<u64>,
    pub wall_limit: Option<u64>,
    pub memory_limit: Option<u64>,
    pub file_size_limit: Option<u64>,
    pub env: BTreeMap<String, String>,
    pub has_stdin: bool,
    pub disable_network: bool,
    pub disabled_syscalls: Vec<String>,
    pub no_new_privileges: bool,
    pub private_namespace: bool,
    pub private_dev: bool,
    pub disable_sandbox: bool,
    pub input_files: Vec<WireInput>,
    pub output_files: Vec<WireOutput>,
    pub output_globs: Vec<WireGlob>,
}

/// A declared input file. Inline files travel as multipart parts; URL files
/// carry their source here and are fetched by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireInput {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A declared output file. URL files are uploaded by the server and only
/// reported back by name; everything else returns as a response part.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireOutput {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub only_if_exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireGlob {
    pub id: String,
    pub prefix: String,
    pub extension: String,
    /// When set, the server PUTs each match to `url_base/<file name>`
    /// instead of returning it inline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_base: Option<String>,
}

impl WireCommand {
    pub fn from_boxed(boxed: &BoxedCommand) -> Self {
        let command = &boxed.command;
        Self {
            route: boxed.route().to_string(),
            text: command.text().to_string(),
            cpu_limit: command.cpu_limit,
            wall_limit: command.wall_limit,
            memory_limit: command.memory_limit,
            file_size_limit: command.file_size_limit,
            env: command.env.clone(),
            has_stdin: command.stdin.is_some(),
            disable_network: command.disable_network,
            disabled_syscalls: command.disabled_syscalls.clone(),
            no_new_privileges: command.no_new_privs,
            private_namespace: command.private_namespace,
            private_dev: command.private_dev,
            disable_sandbox: command.disable_sandbox,
            input_files: boxed
                .inputs()
                .iter()
                .map(|(path, input)| WireInput {
                    name: path.as_str().to_string(),
                    url: input.url().map(|u| u.to_string()),
                })
                .collect(),
            output_files: boxed
                .outputs()
                .iter()
                .map(|(path, output)| WireOutput {
                    name: path.as_str().to_string(),
                    url: output.url().map(|u| u.to_string()),
                    only_if_exit_code: output.exit_code_gate(),
                })
                .collect(),
            output_globs: boxed
                .globs()
                .iter()
                .map(|(id, glob)| WireGlob {
                    id: id.clone(),
                    prefix: glob.prefix().as_str().to_string(),
                    extension: glob.extension().to_string(),
                    url_base: glob.url_base().map(|u| u.to_string()),
                })
                .collect(),
        }
    }

    /// Rebuild the plain command model on the receiving side. File staging
    /// happens separately, from the request parts and the URL list.
    pub fn to_command(&self) -> Command {
        let mut command = Command::new();
        command.replace_text(self.text.clone());
        command.cpu_limit = self.cpu_limit.filter(|&v| v > 0);
        command.wall_limit = self.wall_limit.filter(|&v| v > 0);
        command.memory_limit = self.memory_limit.filter(|&v| v > 0);
        command.file_size_limit = self.file_size_limit.filter(|&v| v > 0);
        command.env = self.env.clone();
        command.disable_network = self.disable_network;
        command.disabled_syscalls = self.disabled_syscalls.clone();
        command.no_new_privs = self.no_new_privileges;
        command.private_namespace = self.private_namespace;
        command.private_dev = self.private_dev;
        command.disable_sandbox = self.disable_sandbox;
        command
    }

    pub fn url_inputs(&self) -> impl Iterator<Item = &WireInput> {
        self.input_files.iter().filter(|input| input.url.is_some())
    }

    pub fn inline_input_names(&self) -> impl Iterator<Item = &str> {
        self.input_files
            .iter()
            .filter(|input| input.url.is_none())
            .map(|input| input.name.as_str())
    }

    pub fn has_url_files(&self) -> bool {
        self.input_files.iter().any(|i| i.url.is_some())
            || self.output_files.iter().any(|o| o.url.is_some())
            || self.output_globs.iter().any(|g| g.url_base.is_some())
    }
}

/// The metadata part of a response. `exitCode` is the one mandatory field;
/// a response without it is a protocol error, not a result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResponseMeta {
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub log: Vec<LogEntry>,
    /// Boxed names the server delivered straight to their URL sinks.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub uploaded_files: Vec<String>,
    /// Boxed names the command actually produced.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub received_files: Vec<String>,
}

/// Does a response part name belong to one of the declared globs?
pub fn glob_for_part<'a>(
    globs: &'a BTreeMap<String, OutputGlob>,
    name: &crate::boxed::BoxedPath,
) -> Option<&'a OutputGlob> {
    globs
        .values()
        .find(|glob| glob.prefix().parent() == name.parent() && glob.matches(name.file_name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxed::OutputFile;

    #[test]
    fn boxed_command_serializes_names_not_contents() {
        let boxed = BoxedCommand::new("thumb", Command::new().arg("convert").arg("in.png"))
            .unwrap()
            .input_bytes("in.png", vec![1, 2, 3])
            .unwrap()
            .output_capture("out.png")
            .unwrap();
        let wire = WireCommand::from_boxed(&boxed);
        let json = serde_json::to_value(&wire).unwrap();

        assert_eq!(json["route"], "thumb");
        assert_eq!(json["inputFiles"][0]["name"], "in.png");
        assert!(json["inputFiles"][0].get("url").is_none());
        assert_eq!(json["outputFiles"][0]["name"], "out.png");
    }

    #[test]
    fn command_round_trips_through_wire_form() {
        let boxed = BoxedCommand::new(
            "route",
            Command::new()
                .arg("prog")
                .cpu_time_limit(5)
                .no_network()
                .environment([("LANG", "C")]),
        )
        .unwrap();
        let wire = WireCommand::from_boxed(&boxed);
        let rebuilt = wire.to_command();

        assert_eq!(rebuilt.text(), boxed.command.text());
        assert_eq!(rebuilt.cpu_limit, Some(5));
        assert!(rebuilt.disable_network);
        assert_eq!(rebuilt.env.get("LANG").map(String::as_str), Some("C"));
    }

    #[test]
    fn missing_exit_code_is_observable() {
        let meta: ResponseMeta = serde_json::from_str(r#"{"stdout": "hi"}"#).unwrap();
        assert!(meta.exit_code.is_none());

        let meta: ResponseMeta = serde_json::from_str(r#"{"exitCode": 0}"#).unwrap();
        assert_eq!(meta.exit_code, Some(0));
    }

    #[test]
    fn glob_lookup_matches_directory_and_pattern() {
        let boxed = BoxedCommand::new("route", Command::new().arg("true"))
            .unwrap()
            .output_glob("g", "frames/f_", "png", |_| OutputFile::to_capture())
            .unwrap();
        let globs = boxed.globs();

        let hit = crate::boxed::BoxedPath::new("frames/f_1.png").unwrap();
        assert!(glob_for_part(globs, &hit).is_some());

        let wrong_dir = crate::boxed::BoxedPath::new("f_1.png").unwrap();
        assert!(glob_for_part(globs, &wrong_dir).is_none());
    }
}
