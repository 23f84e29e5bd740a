//! Seam for invoking external tools (dump utilities, `tar`, `sendmail`).
//!
//! Jobs never build a [`std::process::Command`] themselves. They describe the
//! invocation as an [`ExternalCommand`] and hand it to a [`CommandRunner`],
//! which is a real process spawner in production and a recorder in tests.

use std::ffi::OsString;
use std::fmt;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::OnceLock;

use derive_more::{Display, Error};
use regex::Regex;

/// Description of one external process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalCommand {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(String, String)>,
    stdin: Option<Vec<u8>>,
}

impl ExternalCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            stdin: None,
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

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Bytes written to the process' stdin before waiting on it.
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    pub fn get_args(&self) -> impl Iterator<Item = String> + '_ {
        self.args.iter().map(|a| a.to_string_lossy().into_owned())
    }

    /// Value of an environment variable set on the command.
    pub fn get_env(&self, key: &str) -> Option<&str> {
        self.envs
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_stdin(&self) -> Option<&[u8]> {
        self.stdin.as_deref()
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        command
    }
}

impl fmt::Display for ExternalCommand {
    /// Shell-like rendering with credentials masked, suitable for logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut line = self.program.display().to_string();
        for arg in self.get_args() {
            line.push(' ');
            line.push_str(&arg);
        }
        f.write_str(&redact(&line))
    }
}

/// Masks passwords in command lines and connection URLs.
pub fn redact(line: &str) -> String {
    static PASSWORD_ARG: OnceLock<Regex> = OnceLock::new();
    static URL_CREDENTIALS: OnceLock<Regex> = OnceLock::new();

    let password_arg = PASSWORD_ARG
        .get_or_init(|| Regex::new(r"(--password=)\S+").expect("valid password regex"));
    let url_credentials = URL_CREDENTIALS.get_or_init(|| {
        Regex::new(r"(://[^:/@\s]+:)\S*@").expect("valid url credential regex")
    });

    let line = password_arg.replace_all(line, "${1}***");
    url_credentials.replace_all(&line, "${1}***@").into_owned()
}

/// Result of a finished external process.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub success: bool,
    /// Captured stdout. Empty when stdout was streamed into a sink.
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    fn from_parts(status: ExitStatus, stdout: &[u8], stderr: &[u8]) -> Self {
        Self {
            status: status.code(),
            success: status.success(),
            stdout: String::from_utf8_lossy(stdout).into_owned(),
            stderr: String::from_utf8_lossy(stderr).into_owned(),
        }
    }

    /// Turns a non-zero exit into [CommandError::Failed].
    pub fn check(self, command: &ExternalCommand) -> Result<Self, CommandError> {
        if self.success {
            Ok(self)
        } else {
            Err(CommandError::Failed {
                command: command.to_string(),
                status: self.status,
                stderr: self.stderr.trim_end().to_string(),
            })
        }
    }
}

#[derive(Debug, Display, Error)]
pub enum CommandError {
    /// The process could not be started (binary missing, not executable).
    #[display("failed to run `{command}`: {source}")]
    NotRun {
        command: String,
        source: io::Error,
    },
    /// The process ran but exited unsuccessfully.
    #[display("`{command}` exited with status {}: {stderr}", status.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    Failed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    /// Reading from or writing to the process' pipes failed.
    #[display("i/o with `{command}` failed: {source}")]
    Pipe {
        command: String,
        source: io::Error,
    },
}

/// Synchronous "run a command and capture its output" capability.
pub trait CommandRunner {
    /// Runs the command to completion, capturing stdout and stderr.
    fn run(&self, command: &ExternalCommand) -> Result<CommandOutput, CommandError>;

    /// Runs the command to completion, streaming stdout into `sink`.
    fn run_into(
        &self,
        command: &ExternalCommand,
        sink: &mut dyn Write,
    ) -> Result<CommandOutput, CommandError>;
}

/// [CommandRunner] spawning real processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, command: &ExternalCommand) -> Result<CommandOutput, CommandError> {
        log::debug!(target: "command", "Running: {command}");

        let mut process = command.to_command();
        process
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = process.spawn().map_err(|source| CommandError::NotRun {
            command: command.to_string(),
            source,
        })?;

        if let (Some(input), Some(mut stdin)) = (command.stdin.as_deref(), child.stdin.take()) {
            stdin.write_all(input).map_err(|source| CommandError::Pipe {
                command: command.to_string(),
                source,
            })?;
            // stdin is closed on drop so the child sees EOF
        }

        let output = child
            .wait_with_output()
            .map_err(|source| CommandError::Pipe {
                command: command.to_string(),
                source,
            })?;

        let output = CommandOutput::from_parts(output.status, &output.stdout, &output.stderr);
        if !output.stderr.is_empty() {
            log::warn!(target: "command", "{}", output.stderr.trim_end());
        }
        Ok(output)
    }

    fn run_into(
        &self,
        command: &ExternalCommand,
        sink: &mut dyn Write,
    ) -> Result<CommandOutput, CommandError> {
        log::debug!(target: "command", "Running: {command}");

        let mut child = command
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| CommandError::NotRun {
                command: command.to_string(),
                source,
            })?;

        let pipe_error = |source| CommandError::Pipe {
            command: command.to_string(),
            source,
        };

        // drain stderr on a helper thread so a chatty tool can't deadlock on a full pipe
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = io::Read::read_to_end(&mut stderr, &mut buf);
                buf
            })
        });

        if let Some(mut stdout) = child.stdout.take() {
            if let Err(e) = io::copy(&mut stdout, sink) {
                drop(stdout);
                let _ = child.kill();
                let _ = child.wait();
                if let Some(handle) = stderr_reader {
                    let _ = handle.join();
                }
                return Err(pipe_error(e));
            }
        }
        let status = child.wait().map_err(pipe_error)?;
        let stderr = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        let output = CommandOutput::from_parts(status, &[], &stderr);
        if !output.stderr.is_empty() {
            log::warn!(target: "command", "{}", output.stderr.trim_end());
        }
        Ok(output)
    }
}
