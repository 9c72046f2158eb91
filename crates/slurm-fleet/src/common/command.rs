use anyhow::Context;
use bstr::ByteSlice;
use std::ffi::OsStr;
use std::process::Output;
use thiserror::Error;
use tokio::process::Command;

/// A command that was started successfully but exited with a non-zero code.
#[derive(Debug, Error)]
#[error("`{program}` exited with code {code}\nStderr: {stderr}\nStdout: {stdout}")]
pub struct CommandError {
    pub program: String,
    pub code: i32,
    pub stderr: String,
    pub stdout: String,
}

fn create_command<S: AsRef<OsStr>>(program: S, arguments: &[String]) -> Command {
    let mut command = Command::new(program);
    command.args(arguments);
    command.kill_on_drop(true);
    command
}

/// Runs the command to completion and returns its output, regardless of the exit code.
async fn run_command<S: AsRef<OsStr>>(
    program: S,
    arguments: &[String],
) -> anyhow::Result<Output> {
    let program = program.as_ref();
    log::debug!(
        "Running command `{} {}`",
        program.to_string_lossy(),
        arguments.join(" ")
    );
    let mut command = create_command(program, arguments);
    command
        .output()
        .await
        .with_context(|| format!("{} start failed", program.to_string_lossy()))
}

fn check_command_output(program: &str, output: Output) -> Result<Output, CommandError> {
    let status = output.status;
    if !status.success() {
        return Err(CommandError {
            program: program.to_string(),
            code: status.code().unwrap_or(-1),
            stderr: output.stderr.to_str_lossy().trim().to_string(),
            stdout: output.stdout.to_str_lossy().trim().to_string(),
        });
    }
    Ok(output)
}

fn stdout_to_string(program: &str, output: &Output) -> anyhow::Result<String> {
    output
        .stdout
        .to_str()
        .map(|s| s.to_string())
        .map_err(|e| anyhow::anyhow!("Invalid UTF-8 {program} output: {e:?}"))
}

/// Runs the command, fails if it exits with a non-zero code and returns its standard output.
pub async fn execute_command<S: AsRef<OsStr>>(
    program: S,
    arguments: &[String],
) -> anyhow::Result<String> {
    let program_name = program.as_ref().to_string_lossy().to_string();
    let output = run_command(program, arguments).await?;
    let output = check_command_output(&program_name, output)
        .with_context(|| format!("{program_name} execution failed"))?;
    stdout_to_string(&program_name, &output)
}
