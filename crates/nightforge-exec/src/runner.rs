use std::path::Path;

/// Captured output of a finished process.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    /// Both streams, stdout first. Used for build-log capture.
    pub fn combined(&self) -> String {
        let mut text = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        text.push_str(&self.stdout);
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&self.stderr);
        }
        text
    }
}

/// Abstraction over external command execution for testability.
///
/// Production code uses [`RealRunner`], tests use mockall-generated mocks.
#[allow(async_fn_in_trait)]
pub trait ProcessRunner: Send + Sync {
    /// Execute a program and capture its output.
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> Result<RunOutput, RunnerError>;

    /// Execute a program, streaming output to the terminal.
    async fn run_streaming(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> Result<(), RunnerError>;

    /// Execute a command line through the shell, capturing output.
    async fn run_shell(&self, command: &str, cwd: &Path) -> Result<RunOutput, RunnerError>;
}

/// Real process runner over `tokio::process`.
pub struct RealRunner;

impl RealRunner {
    async fn capture(
        mut command: tokio::process::Command,
        program: &str,
        args: &[String],
    ) -> Result<RunOutput, RunnerError> {
        use std::process::Stdio;

        let output = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| RunnerError::Spawn {
                program: program.to_owned(),
                source: e,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let run_output = RunOutput { stdout, stderr };

        if output.status.success() {
            Ok(run_output)
        } else {
            Err(RunnerError::CommandFailed {
                program: program.to_owned(),
                args: args.to_vec(),
                code: output.status.code(),
                output: run_output.combined(),
            })
        }
    }
}

impl ProcessRunner for RealRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> Result<RunOutput, RunnerError> {
        tracing::debug!(program, ?args, "exec");
        let mut command = tokio::process::Command::new(program);
        command.args(args);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }
        Self::capture(command, program, args).await
    }

    async fn run_streaming(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> Result<(), RunnerError> {
        use std::process::Stdio;

        tracing::debug!(program, ?args, "exec (streaming)");
        let mut command = tokio::process::Command::new(program);
        command.args(args).stdout(Stdio::inherit()).stderr(Stdio::inherit());
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }
        let status = command.status().await.map_err(|e| RunnerError::Spawn {
            program: program.to_owned(),
            source: e,
        })?;

        if status.success() {
            Ok(())
        } else {
            Err(RunnerError::CommandFailed {
                program: program.to_owned(),
                args: args.to_vec(),
                code: status.code(),
                output: format!("exit status: {status}"),
            })
        }
    }

    async fn run_shell(&self, command_line: &str, cwd: &Path) -> Result<RunOutput, RunnerError> {
        tracing::debug!(command_line, "exec (shell)");
        let mut command = tokio::process::Command::new("sh");
        command.arg("-c").arg(command_line).current_dir(cwd);
        Self::capture(command, "sh", &["-c".to_owned(), command_line.to_owned()]).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to spawn '{program}' — is it installed and on PATH?")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    // Captured output is surfaced through [`Self::output`], not the message.
    #[error("'{program}' failed (exit code {code:?}): {args:?}")]
    CommandFailed {
        program: String,
        args: Vec<String>,
        code: Option<i32>,
        output: String,
    },
}

impl RunnerError {
    /// Captured output of the failed attempt, for build-log accumulation.
    pub fn output(&self) -> &str {
        match self {
            RunnerError::CommandFailed { output, .. } => output,
            RunnerError::Spawn { .. } => "",
        }
    }
}
