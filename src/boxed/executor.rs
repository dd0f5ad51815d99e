//! Local boxed execution pipeline.
//!
//! Stages declared inputs into a fresh private directory, runs the wrapped
//! command there, harvests declared outputs and glob matches, and tears the
//! directory down. One directory per execution, never shared, removed
//! regardless of outcome.

use std::collections::BTreeMap;

use tracing::{debug, info};

use async_trait::async_trait;

use crate::boxed::files::OutputFile;
use crate::boxed::path::BoxedPath;
use crate::boxed::{BoxedCommand, BoxedResult, ExecutorBackend};
use crate::command::StderrPolicy;
use crate::config::types::ExecutionConfig;
use crate::error::{Result, RunboxError};
use crate::exec::UnboxedExecutor;
use crate::workdir::WorkDir;
use crate::wrap::WrapperChain;

pub struct BoxedExecutor {
    config: ExecutionConfig,
    chain: WrapperChain,
    http: reqwest::Client,
}

impl BoxedExecutor {
    /// Build an executor with the wrapper chain the configuration describes.
    pub fn new(config: ExecutionConfig) -> Result<Self> {
        let chain = WrapperChain::from_config(&config)?;
        Ok(Self::with_chain(config, chain))
    }

    pub fn with_chain(config: ExecutionConfig, chain: WrapperChain) -> Self {
        Self {
            config,
            chain,
            http: reqwest::Client::new(),
        }
    }

    /// Run the boxed command locally.
    ///
    /// Consumes the command; the realized output files move into the result.
    pub async fn execute(&self, boxed: BoxedCommand) -> Result<BoxedResult> {
        if boxed.has_url_files() && !self.config.allow_url_files {
            return Err(RunboxError::UrlFilesNotAllowed);
        }

        let route = boxed.route().to_string();
        let workdir = WorkDir::create(self.config.work_dir.as_deref())?;
        let (mut command, inputs, mut outputs, globs) = boxed.into_parts();

        // Boxed runs are never interactive.
        command.pass_stdin = false;
        if command.stderr_policy == StderrPolicy::Forward {
            command.stderr_policy = StderrPolicy::Capture;
        }
        command.working_dir = Some(workdir.root().to_path_buf());

        for (path, mut input) in inputs {
            let dest = workdir.prepare(&path)?;
            debug!(file = %path, "Staging input file");
            input.copy_to(&dest, &self.http).await?;
        }

        // Pre-create directories declared outputs will be written into, so
        // the command does not have to mkdir its own output tree.
        for path in outputs.keys() {
            workdir.prepare(path)?;
        }
        for glob in globs.values() {
            workdir.prepare(glob.prefix())?;
        }

        self.chain.apply(&mut command)?;

        info!(route = %route, "Executing boxed command");
        let result = UnboxedExecutor::new().execute(&command).await?;

        harvest_outputs(
            &mut outputs,
            &globs,
            workdir.root(),
            result.exit_code,
            &self.http,
        )
        .await?;

        workdir.teardown()?;

        Ok(BoxedResult::new(
            result.exit_code,
            result.stdout,
            result.stderr,
            result.log,
            outputs,
        ))
    }
}

#[async_trait]
impl ExecutorBackend for BoxedExecutor {
    fn name(&self) -> &str {
        "local"
    }

    async fn execute(&self, command: BoxedCommand) -> Result<BoxedResult> {
        BoxedExecutor::execute(self, command).await
    }
}

/// Harvest declared outputs and glob matches from an already-populated
/// working directory. Shared between the local pipeline above and the
/// execution server, which stages inputs its own way.
pub async fn harvest_outputs(
    outputs: &mut BTreeMap<BoxedPath, OutputFile>,
    globs: &BTreeMap<String, crate::boxed::OutputGlob>,
    root: &std::path::Path,
    exit_code: Option<i32>,
    http: &reqwest::Client,
) -> Result<()> {
    for (path, output) in outputs.iter_mut() {
        if !output.gate_allows(exit_code) {
            continue;
        }
        let absolute = path.under(root);
        if absolute.is_file() {
            debug!(file = %path, "Harvesting output file");
            output.receive_path(&absolute, http).await?;
        }
    }
    for glob in globs.values() {
        for path in glob.discover(root)? {
            if outputs.contains_key(&path) {
                continue;
            }
            let mut output = glob.mint(&path);
            if !output.gate_allows(exit_code) {
                continue;
            }
            debug!(file = %path, "Harvesting glob match");
            output.receive_path(&path.under(root), http).await?;
            outputs.insert(path, output);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;

    fn executor() -> BoxedExecutor {
        // No wrappers: these tests exercise staging and harvesting, not
        // sandboxing.
        BoxedExecutor::with_chain(ExecutionConfig::default(), WrapperChain::new())
    }

    #[tokio::test]
    async fn input_is_staged_and_output_harvested() {
        let boxed = BoxedCommand::new(
            "copy",
            Command::new().unsafe_append("cp in.txt out.txt"),
        )
        .unwrap()
        .input_bytes("in.txt", "abc")
        .unwrap()
        .output_capture("out.txt")
        .unwrap();

        let result = executor().execute(boxed).await.unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert!(result.was_received("out.txt"));
        assert_eq!(result.file_contents_str("out.txt").unwrap(), "abc");
    }

    #[tokio::test]
    async fn absent_output_is_not_an_error() {
        let boxed = BoxedCommand::new("noop", Command::new().arg("true"))
            .unwrap()
            .output_capture("never.txt")
            .unwrap();

        let result = executor().execute(boxed).await.unwrap();
        assert!(result.success());
        assert!(!result.was_received("never.txt"));
        assert!(result.file_contents("never.txt").is_none());
    }

    #[tokio::test]
    async fn output_parent_directories_exist_before_execution() {
        let boxed = BoxedCommand::new(
            "nested",
            Command::new().unsafe_append("printf deep > sub/dir/out.txt"),
        )
        .unwrap()
        .output_capture("sub/dir/out.txt")
        .unwrap();

        let result = executor().execute(boxed).await.unwrap();
        assert_eq!(result.file_contents_str("sub/dir/out.txt").unwrap(), "deep");
    }

    #[tokio::test]
    async fn glob_matches_are_minted_per_file() {
        let boxed = BoxedCommand::new(
            "burst",
            Command::new()
                .unsafe_append("mkdir -p frames; printf 1 > frames/f_1.txt; printf 2 > frames/f_2.txt"),
        )
        .unwrap()
        .output_glob("frames", "frames/f_", "txt", |_| OutputFile::to_capture())
        .unwrap();

        let result = executor().execute(boxed).await.unwrap();
        let names: Vec<&str> = result.output_names().collect();
        assert_eq!(names, ["frames/f_1.txt", "frames/f_2.txt"]);
        assert_eq!(result.file_contents_str("frames/f_2.txt").unwrap(), "2");
    }

    #[tokio::test]
    async fn exit_code_gate_blocks_harvest() {
        let boxed = BoxedCommand::new(
            "gated",
            Command::new().unsafe_append("printf x > out.txt; exit 1"),
        )
        .unwrap()
        .output("out.txt", OutputFile::to_capture().only_if_exit_code(0))
        .unwrap();

        let result = executor().execute(boxed).await.unwrap();
        assert_eq!(result.exit_code, Some(1));
        assert!(!result.was_received("out.txt"));
    }

    #[tokio::test]
    async fn url_files_require_opt_in() {
        let boxed = BoxedCommand::new("fetch", Command::new().arg("true"))
            .unwrap()
            .input_url("in.bin", "https://example.com/in.bin".parse().unwrap())
            .unwrap();

        let err = executor().execute(boxed).await.unwrap_err();
        assert!(matches!(err, RunboxError::UrlFilesNotAllowed));
    }

    #[tokio::test]
    async fn workdir_is_private_and_empty() {
        let boxed = BoxedCommand::new("ls", Command::new().unsafe_append("ls -A"))
            .unwrap()
            .input_bytes("only.txt", "x")
            .unwrap();

        let result = executor().execute(boxed).await.unwrap();
        assert_eq!(result.stdout.trim(), "only.txt");
    }

    #[tokio::test]
    async fn local_file_sink_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("copied/out.txt");
        let boxed = BoxedCommand::new(
            "copy",
            Command::new().unsafe_append("cp in.txt out.txt"),
        )
        .unwrap()
        .input_bytes("in.txt", "abc")
        .unwrap()
        .output_local_file("out.txt", &dest)
        .unwrap();

        let result = executor().execute(boxed).await.unwrap();
        assert!(result.was_received("out.txt"));
        assert_eq!(std::fs::read(&dest).unwrap(), b"abc");
    }
}
