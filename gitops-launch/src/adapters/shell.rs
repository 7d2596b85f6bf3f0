//! External command execution via `duct`

use crate::error::{CommandFailedSnafu, CommandSpawnSnafu, Result};
use duct::cmd;
use snafu::ResultExt;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A command line to run to completion, capturing its output.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    program: String,
    args: Vec<OsString>,
    dir: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl ShellCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            dir: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn dir(mut self, dir: &Path) -> Self {
        self.dir = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Command line for logs and error messages. Environment values are
    /// left out since they may carry credentials.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }

    /// Run to completion off the async runtime; stdout on success.
    pub async fn run(self) -> Result<String> {
        let command = self.display();
        let mut expression = cmd(self.program.as_str(), &self.args)
            .stdout_capture()
            .stderr_capture()
            .unchecked();
        if let Some(dir) = &self.dir {
            expression = expression.dir(dir);
        }
        for (key, value) in &self.env {
            expression = expression.env(key, value);
        }

        debug!(command = %command, "running");
        let output = tokio::task::spawn_blocking(move || expression.run())
            .await
            .map_err(std::io::Error::other)
            .context(CommandSpawnSnafu { command: &command })?
            .context(CommandSpawnSnafu { command: &command })?;

        if !output.status.success() {
            return CommandFailedSnafu {
                command,
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .fail();
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_display_omits_env() {
        let command = ShellCommand::new("terraform")
            .args(["apply", "-auto-approve"])
            .env("VAULT_TOKEN", "s3cret");
        assert_eq!(command.display(), "terraform apply -auto-approve");
    }

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let out = ShellCommand::new("sh")
            .args(["-c", "echo hello"])
            .run()
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_command_failed() {
        let err = ShellCommand::new("sh")
            .args(["-c", "echo broken >&2; exit 3"])
            .run()
            .await
            .unwrap_err();
        match err {
            Error::CommandFailed { code, stderr, .. } => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let err = ShellCommand::new("definitely-not-a-real-binary-4f1c")
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CommandSpawn { .. }));
    }
}
