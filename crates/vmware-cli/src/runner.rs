use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::{Error, Result};

/// One external program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Program name plus first argument, e.g. `vmrun clone`.
    pub fn display(&self) -> String {
        let program = self
            .program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string());
        match self.args.iter().find(|a| !a.starts_with('-')) {
            Some(sub) => format!("{program} {sub}"),
            None => program,
        }
    }
}

/// Captured result of a finished (or killed) invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.code == Some(0)
    }

    /// Stderr when the program wrote any, stdout otherwise.
    pub fn diagnostics(&self) -> &str {
        if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }

    /// Turn a non-zero exit or a timeout into an error.
    pub fn into_result(self, spec: &CommandSpec) -> Result<Self> {
        if self.timed_out {
            return Err(Error::TimedOut {
                command: spec.display(),
                secs: spec.timeout.as_secs(),
            });
        }
        if self.code != Some(0) {
            return Err(Error::CommandFailed {
                command: spec.display(),
                code: self.code,
                stderr: self.diagnostics().trim().to_string(),
            });
        }
        Ok(self)
    }
}

/// Seam between the CLI wrappers and the operating system.
#[async_trait]
pub trait CommandRunner: Send + Sync + 'static {
    /// Run to completion or until `spec.timeout`. Only a failure to spawn is an `Err`.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Start a program without waiting for it (GUI launchers).
    async fn spawn_detached(&self, spec: &CommandSpec) -> Result<()>;
}

/// Runs programs with `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    fn command(spec: &CommandSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd
    }

    fn spawn_error(spec: &CommandSpec, source: std::io::Error) -> Error {
        Error::Spawn {
            program: spec.program.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let mut cmd = Self::command(spec);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| Self::spawn_error(spec, e))?;
        debug!(command = %spec.display(), timeout_secs = spec.timeout.as_secs(), "spawned");

        // Dropping the wait future on timeout drops the child, which kills it.
        match tokio::time::timeout(spec.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                timed_out: false,
            }),
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => {
                warn!(
                    command = %spec.display(),
                    timeout_secs = spec.timeout.as_secs(),
                    "command timed out, process killed"
                );
                Ok(CommandOutput {
                    code: None,
                    stdout: String::new(),
                    stderr: format!(
                        "{} timed out after {}s",
                        spec.display(),
                        spec.timeout.as_secs()
                    ),
                    timed_out: true,
                })
            }
        }
    }

    async fn spawn_detached(&self, spec: &CommandSpec) -> Result<()> {
        let mut cmd = Self::command(spec);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd.spawn().map_err(|e| Self::spawn_error(spec, e))?;
        Ok(())
    }
}
