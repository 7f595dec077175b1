//! Recording command runner for testing
//!
//! Records every command line and answers with scripted responses, so whole
//! provisioning runs can be checked without touching the host.

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

use super::{CommandLine, CommandOutput, CommandRunner};
use crate::SetupError;

/// Scripted response for matching commands
#[derive(Debug, Clone)]
pub enum MockResponse {
    Output(CommandOutput),
    Timeout,
    NotExecutable,
}

impl MockResponse {
    /// Exit with `code` and the given stdout
    pub fn exit(code: i32, stdout: &str) -> Self {
        Self::Output(CommandOutput {
            code: Some(code),
            stdout: stdout.to_string(),
            stderr: String::new(),
        })
    }
}

/// Mock command runner
///
/// # Example
/// ```
/// use slurm_node_setup::exec::mock::{MockResponse, MockRunner};
///
/// let runner = MockRunner::new().respond("sacctmgr", MockResponse::exit(1, "already exists"));
/// assert!(runner.commands().is_empty());
/// ```
#[derive(Default)]
pub struct MockRunner {
    responses: Vec<(String, MockResponse)>,
    log: Mutex<Vec<CommandLine>>,
}

impl MockRunner {
    /// Every command succeeds with empty output unless scripted otherwise
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands whose rendered line contains `pattern`.
    /// Earlier registrations win.
    pub fn respond(mut self, pattern: &str, response: MockResponse) -> Self {
        self.responses.push((pattern.to_string(), response));
        self
    }

    /// Command lines run so far, rendered as strings
    pub fn commands(&self) -> Vec<String> {
        self.lines().iter().map(ToString::to_string).collect()
    }

    /// Command lines run so far
    pub fn lines(&self) -> Vec<CommandLine> {
        match self.log.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Position of the first command containing `pattern`
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.commands().iter().position(|c| c.contains(pattern))
    }

    /// Whether any command containing `pattern` ran
    pub fn ran(&self, pattern: &str) -> bool {
        self.position(pattern).is_some()
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, cmd: &CommandLine) -> Result<CommandOutput, SetupError> {
        match self.log.lock() {
            Ok(mut guard) => guard.push(cmd.clone()),
            Err(poisoned) => poisoned.into_inner().push(cmd.clone()),
        }

        let rendered = cmd.to_string();
        let response = self
            .responses
            .iter()
            .find(|(pattern, _)| rendered.contains(pattern.as_str()))
            .map(|(_, response)| response.clone());

        match response {
            None => Ok(CommandOutput {
                code: Some(0),
                ..Default::default()
            }),
            Some(MockResponse::Output(output)) => Ok(output),
            Some(MockResponse::Timeout) => Err(SetupError::CommandTimeout {
                command: rendered,
                timeout: cmd.timeout.unwrap_or(Duration::ZERO),
                stdout: String::new(),
                stderr: String::new(),
            }),
            Some(MockResponse::NotExecutable) => Err(SetupError::resource(
                &cmd.program,
                "not executable: permission denied",
            )),
        }
    }
}
