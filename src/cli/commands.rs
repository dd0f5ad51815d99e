use tracing::info;

use crate::boxed::{BoxedCommand, BoxedExecutor, BoxedResult, OutputFile};
use crate::cli::args::{
    CheckArgs, CommandOpts, ConfigAction, ConfigArgs, ExecArgs, OutputFormat, RemoteArgs,
};
use crate::command::Command;
use crate::config::loader::get_config_path;
use crate::config::types::RunboxConfig;
use crate::error::{Result, RunboxError};
use crate::remote::RemoteExecutor;
use crate::validate;

/// Execute a command locally, boxed when any files are staged.
pub async fn exec(args: ExecArgs, mut config: RunboxConfig, format: OutputFormat) -> Result<i32> {
    if let Some(isolation) = args.isolation {
        config.execution.isolation = isolation;
    }

    let boxed = build_boxed(&args.opts).await?;
    info!(route = %boxed.route(), "Executing locally");

    let executor = BoxedExecutor::new(config.execution)?;
    let result = executor.execute(boxed).await?;
    output_result(&result, format);
    Ok(result.exit_code.unwrap_or(1))
}

/// Execute a command on the configured remote server.
pub async fn remote(args: RemoteArgs, config: RunboxConfig, format: OutputFormat) -> Result<i32> {
    let server = args
        .server
        .clone()
        .or_else(|| config.remote.server_url.clone())
        .ok_or_else(|| {
            RunboxError::Config("no server URL given and none configured".to_string())
        })?;

    let boxed = build_boxed(&args.opts).await?;
    info!(route = %boxed.route(), server = %server, "Executing remotely");

    let executor = RemoteExecutor::new(server, &config)?;
    let result = executor.execute(boxed).await?;
    output_result(&result, format);
    Ok(result.exit_code.unwrap_or(1))
}

/// Validate a command against the configured route policies.
pub async fn check(args: CheckArgs, config: RunboxConfig, format: OutputFormat) -> Result<i32> {
    let mut boxed = BoxedCommand::new(
        &args.route,
        Command::new().unsafe_append(&args.command),
    )?;
    for name in &args.inputs {
        boxed = boxed.input_bytes(name, Vec::new())?;
    }
    for name in &args.outputs {
        boxed = boxed.output_placeholder(name)?;
    }

    let verdict = validate::validate(&boxed, &config.routes);
    match format {
        OutputFormat::Text => match &verdict {
            Ok(()) => println!("ok"),
            Err(e) => println!("rejected: {}", e),
        },
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "route": args.route,
                    "valid": verdict.is_ok(),
                    "reason": verdict.as_ref().err().map(ToString::to_string),
                })
            );
        }
    }
    Ok(if verdict.is_ok() { 0 } else { 1 })
}

/// Show configuration or its path
pub async fn config(args: ConfigArgs, config: RunboxConfig) -> Result<i32> {
    match args.action {
        ConfigAction::Show => {
            let toml = toml::to_string_pretty(&config)
                .map_err(|e| RunboxError::Config(e.to_string()))?;
            print!("{}", toml);
        }
        ConfigAction::Path => {
            println!("{}", get_config_path().display());
        }
    }
    Ok(0)
}

/// Translate CLI options into a boxed command.
async fn build_boxed(opts: &CommandOpts) -> Result<BoxedCommand> {
    let mut command = Command::new().unsafe_append(&opts.command);
    if let Some(cpu) = opts.cpu_limit {
        command = command.cpu_time_limit(cpu);
    }
    if let Some(wall) = opts.wall_limit {
        command = command.wall_time_limit(wall);
    }
    if let Some(mem) = opts.memory_limit {
        command = command.memory_limit_kb(mem);
    }
    if let Some(fsize) = opts.file_size_limit {
        command = command.file_size_limit_kb(fsize);
    }
    command = command.environment(opts.env_vars.iter().cloned());
    if let Some(stdin_file) = &opts.stdin_file {
        command = command.stdin_bytes(tokio::fs::read(stdin_file).await?);
    }
    if opts.no_network {
        command = command.no_network();
    }
    if opts.no_sandbox {
        command = command.no_sandbox();
    }

    let mut boxed = BoxedCommand::new(&opts.route, command)?;
    for (name, path) in &opts.inputs {
        boxed = boxed.input_local_file(name, path)?;
    }
    for (name, path) in &opts.outputs {
        boxed = boxed.output(name, OutputFile::to_local_file(path))?;
    }
    Ok(boxed)
}

fn output_result(result: &BoxedResult, format: OutputFormat) {
    match format {
        OutputFormat::Text => {
            print!("{}", result.stdout);
            eprint!("{}", result.stderr);
        }
        OutputFormat::Json => {
            let received: Vec<&str> = result
                .output_names()
                .filter(|name| result.was_received(name))
                .collect();
            println!(
                "{}",
                serde_json::json!({
                    "exit_code": result.exit_code,
                    "stdout": result.stdout,
                    "stderr": result.stderr,
                    "received_files": received,
                })
            );
        }
    }
}
