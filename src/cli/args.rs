use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::types::IsolationKind;

#[derive(Parser, Debug)]
#[clap(name = "runbox")]
#[clap(version, about = "Boxed command execution under resource limits and sandboxing")]
#[clap(propagate_version = true)]
pub struct Cli {
    #[clap(flatten)]
    pub global_opts: GlobalOpts,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalOpts {
    /// Configuration file path
    #[clap(short, long, global = true, env = "RUNBOX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[clap(long, global = true, default_value = "text", value_enum)]
    pub format: OutputFormat,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute a command locally
    Exec(ExecArgs),

    /// Execute a command on a remote execution server
    Remote(RemoteArgs),

    /// Validate a command against the configured route policies
    Check(CheckArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

/// Limits, sandbox toggles and boxed file staging shared by `exec` and
/// `remote`.
#[derive(Args, Debug)]
pub struct CommandOpts {
    /// The command line to execute
    pub command: String,

    /// Route name, used for policy lookup
    #[clap(long, default_value = "cli")]
    pub route: String,

    /// CPU time limit in seconds
    #[clap(long)]
    pub cpu_limit: Option<u64>,

    /// Wall clock limit in seconds
    #[clap(long)]
    pub wall_limit: Option<u64>,

    /// Memory limit in KiB
    #[clap(long)]
    pub memory_limit: Option<u64>,

    /// Maximum created-file size in KiB
    #[clap(long)]
    pub file_size_limit: Option<u64>,

    /// Environment variables to set (KEY=VALUE)
    #[clap(long = "env", short = 'e', value_parser = parse_env_var)]
    pub env_vars: Vec<(String, String)>,

    /// File whose bytes become the command's stdin
    #[clap(long)]
    pub stdin_file: Option<PathBuf>,

    /// Deny network access inside the sandbox
    #[clap(long)]
    pub no_network: bool,

    /// Skip the sandbox wrapper entirely
    #[clap(long)]
    pub no_sandbox: bool,

    /// Stage a local file into the box (boxed_name=host_path)
    #[clap(long = "input", short = 'i', value_parser = parse_file_spec)]
    pub inputs: Vec<(String, PathBuf)>,

    /// Collect a produced file out of the box (boxed_name=host_path)
    #[clap(long = "output", short = 'o', value_parser = parse_file_spec)]
    pub outputs: Vec<(String, PathBuf)>,
}

#[derive(Args, Debug)]
pub struct ExecArgs {
    #[clap(flatten)]
    pub opts: CommandOpts,

    /// Isolation tool override
    #[clap(long, value_enum)]
    pub isolation: Option<IsolationKind>,
}

#[derive(Args, Debug)]
pub struct RemoteArgs {
    #[clap(flatten)]
    pub opts: CommandOpts,

    /// Execution server base URL (falls back to the configured one)
    #[clap(long, env = "RUNBOX_SERVER")]
    pub server: Option<String>,
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Route name to validate against
    pub route: String,

    /// The command line to validate
    pub command: String,

    /// Declared input file names
    #[clap(long = "input", short = 'i')]
    pub inputs: Vec<String>,

    /// Declared output file names
    #[clap(long = "output", short = 'o')]
    pub outputs: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[clap(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,
    /// Show configuration file path
    Path,
}

fn parse_env_var(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| "Environment variable format: KEY=VALUE".to_string())
}

fn parse_file_spec(s: &str) -> Result<(String, PathBuf), String> {
    s.split_once('=')
        .map(|(name, path)| (name.to_string(), PathBuf::from(path)))
        .ok_or_else(|| "File format: boxed_name=host_path".to_string())
}

#[derive(Debug, Clone, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}
