//! External command execution for the link backends

use async_trait::async_trait;
use meshlink_common::{Error, Result};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, error};

/// A command line plus extra environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
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
}

impl std::fmt::Display for Cmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Runs external commands. Backends never spawn processes directly.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. Errors only when the program cannot be spawned.
    async fn output(&self, cmd: &Cmd) -> Result<CommandOutput>;

    /// Run and map a non-zero exit to `Fatal`
    async fn run(&self, cmd: &Cmd) -> Result<String> {
        let output = self.output(cmd).await?;
        if !output.success {
            error!("{} failed: {}", cmd.program, output.stderr.trim());
            return Err(Error::Fatal(format!(
                "`{}` failed: {}",
                cmd,
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

/// Executes commands on the host with `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn output(&self, cmd: &Cmd) -> Result<CommandOutput> {
        debug!("exec: {}", cmd);

        let output = Command::new(&cmd.program)
            .args(&cmd.args)
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::PermissionDenied => {
                    Error::PermissionDenied(format!("{}: {}", cmd.program, e))
                }
                _ => Error::Fatal(format!("failed to execute {}: {}", cmd.program, e)),
            })?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Scripted runner for backend tests
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};

    /// Replies keyed by the full command line. The last queued reply for a
    /// command repeats; unknown commands succeed with empty output.
    #[derive(Default)]
    pub struct FakeRunner {
        replies: Mutex<HashMap<String, VecDeque<CommandOutput>>>,
        calls: Mutex<Vec<Cmd>>,
    }

    impl FakeRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn reply(&self, line: &str, output: CommandOutput) {
            self.replies
                .lock()
                .entry(line.to_string())
                .or_default()
                .push_back(output);
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().iter().map(|c| c.to_string()).collect()
        }

        pub fn last_call(&self) -> Option<Cmd> {
            self.calls.lock().last().cloned()
        }
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn output(&self, cmd: &Cmd) -> Result<CommandOutput> {
            self.calls.lock().push(cmd.clone());

            let mut replies = self.replies.lock();
            let Some(queue) = replies.get_mut(&cmd.to_string()) else {
                return Ok(CommandOutput::ok(""));
            };
            let reply = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
            Ok(reply.unwrap_or_default())
        }
    }
}
