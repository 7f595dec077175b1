//! External command execution
//!
//! Every external program the setup touches (systemctl, mount, wall, mysql,
//! hook scripts, ...) runs through a [`CommandRunner`]. Each call blocks
//! until the child exits or its timeout fires.

pub mod mock;

use crate::SetupError;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::debug;

/// Timeout applied to service manager and broadcast calls
pub const SERVICE_TIMEOUT: Duration = Duration::from_secs(30);

/// A command to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
    /// Run `program` through `sh -c` instead of exec'ing it directly
    pub shell: bool,
    pub timeout: Option<Duration>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            shell: false,
            timeout: None,
        }
    }

    /// A shell pipeline, run via `sh -c`
    pub fn shell(script: impl Into<String>) -> Self {
        Self {
            shell: true,
            ..Self::new(script)
        }
    }

    /// `systemctl <args>` with the service timeout
    pub fn systemctl<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new("systemctl").args(args).timeout(SERVICE_TIMEOUT)
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

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set or clear the timeout
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Turn a non-zero exit into [`SetupError::CommandFailed`]
    pub fn check(self, cmd: &CommandLine) -> Result<Self, SetupError> {
        if self.success() {
            Ok(self)
        } else {
            Err(SetupError::CommandFailed {
                command: cmd.to_string(),
                code: self.code,
                stdout: self.stdout,
                stderr: self.stderr,
            })
        }
    }
}

/// Trait for running external commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion.
    ///
    /// A non-zero exit is returned as an output, not an error. Errors are a
    /// failure to start the program or an expired timeout.
    async fn run(&self, cmd: &CommandLine) -> Result<CommandOutput, SetupError>;

    /// Run a command and fail on a non-zero exit
    async fn run_checked(&self, cmd: &CommandLine) -> Result<CommandOutput, SetupError> {
        self.run(cmd).await?.check(cmd)
    }
}

/// Runs commands on the host with tokio::process
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

type Captured = Arc<Mutex<Vec<u8>>>;

fn snapshot(buf: &Captured) -> String {
    let bytes = match buf.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Copy a pipe into a shared buffer so partial output survives a kill
fn capture<R>(pipe: Option<R>, buf: Captured) -> Option<JoinHandle<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut pipe = pipe?;
    Some(tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => match buf.lock() {
                    Ok(mut guard) => guard.extend_from_slice(&chunk[..n]),
                    Err(poisoned) => poisoned.into_inner().extend_from_slice(&chunk[..n]),
                },
            }
        }
    }))
}

fn spawn_error(cmd: &CommandLine, e: std::io::Error) -> SetupError {
    match e.kind() {
        ErrorKind::PermissionDenied => {
            SetupError::resource(&cmd.program, format!("not executable: {}", e))
        }
        ErrorKind::NotFound => SetupError::resource(&cmd.program, format!("not found: {}", e)),
        _ => SetupError::resource(&cmd.program, format!("failed to start: {}", e)),
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, cmd: &CommandLine) -> Result<CommandOutput, SetupError> {
        debug!("Running command: {} (timeout={:?})", cmd, cmd.timeout);

        let mut command = if cmd.shell {
            let mut c = tokio::process::Command::new("sh");
            c.args(["-c", &cmd.program]);
            c
        } else {
            let mut c = tokio::process::Command::new(&cmd.program);
            c.args(&cmd.args);
            c
        };
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| spawn_error(cmd, e))?;

        let stdout: Captured = Arc::default();
        let stderr: Captured = Arc::default();
        let mut readers: Vec<JoinHandle<()>> = [
            capture(child.stdout.take(), stdout.clone()),
            capture(child.stderr.take(), stderr.clone()),
        ]
        .into_iter()
        .flatten()
        .collect();

        // the pipes stay open while anything the command started still holds
        // them, so draining counts against the timeout too
        let completion = async {
            let status = child.wait().await?;
            for reader in readers.iter_mut() {
                let _ = reader.await;
            }
            Ok::<_, std::io::Error>(status)
        };

        let status = match cmd.timeout {
            Some(limit) => {
                let finished = tokio::time::timeout(limit, completion).await;
                match finished {
                    Ok(status) => status?,
                    Err(_) => {
                        let _ = child.kill().await;
                        for reader in &readers {
                            reader.abort();
                        }
                        return Err(SetupError::CommandTimeout {
                            command: cmd.to_string(),
                            timeout: limit,
                            stdout: snapshot(&stdout),
                            stderr: snapshot(&stderr),
                        });
                    }
                }
            }
            None => completion.await?,
        };

        Ok(CommandOutput {
            code: status.code(),
            stdout: snapshot(&stdout),
            stderr: snapshot(&stderr),
        })
    }
}
