//! In-memory [`Launcher`] for unit tests.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Child;

use super::launcher::{CommandOutput, Invocation, Launcher, SystemLauncher};
use crate::error::{Error, Result};

/// Records every invocation and answers `run` with a canned output.
///
/// `spawn` runs `spawn_script` through `sh -c` when one is set, so capture
/// tests get a real child process with a real stdout pipe.
#[derive(Debug, Default)]
pub(crate) struct RecordingLauncher {
    calls: Mutex<Vec<(Invocation, Option<Duration>)>>,
    reply: CommandOutput,
    spawn_script: Option<String>,
}

impl RecordingLauncher {
    pub(crate) fn with_stdout(stdout: &[u8]) -> Self {
        Self {
            reply: CommandOutput {
                status: Some(0),
                stdout: stdout.to_vec(),
                stderr: Vec::new(),
            },
            ..Self::default()
        }
    }

    pub(crate) fn with_status(status: i32) -> Self {
        Self {
            reply: CommandOutput {
                status: Some(status),
                ..CommandOutput::default()
            },
            ..Self::default()
        }
    }

    pub(crate) fn spawning(script: &str) -> Self {
        Self {
            spawn_script: Some(script.to_string()),
            ..Self::default()
        }
    }

    /// Argument lines in call order.
    pub(crate) fn commands(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(inv, _)| inv.args_line())
            .collect()
    }

    pub(crate) fn programs(&self) -> Vec<PathBuf> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(inv, _)| inv.program().to_path_buf())
            .collect()
    }

    /// Environment of every call, in call order.
    pub(crate) fn envs(&self) -> Vec<Vec<(String, String)>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(inv, _)| inv.env().to_vec())
            .collect()
    }

    /// Timeouts passed to `run`, in call order.
    pub(crate) fn timeouts(&self) -> Vec<Duration> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, t)| *t)
            .collect()
    }
}

#[async_trait]
impl Launcher for RecordingLauncher {
    async fn run(&self, invocation: &Invocation, timeout: Duration) -> Result<CommandOutput> {
        self.calls
            .lock()
            .unwrap()
            .push((invocation.clone(), Some(timeout)));
        let mut reply = self.reply.clone();
        if reply.status.is_none() {
            reply.status = Some(0);
        }
        Ok(reply)
    }

    fn spawn(&self, invocation: &Invocation) -> Result<Child> {
        self.calls.lock().unwrap().push((invocation.clone(), None));
        match &self.spawn_script {
            Some(script) => {
                SystemLauncher.spawn(&Invocation::new("sh").args(["-c", script.as_str()]))
            }
            None => Err(Error::execution("no spawn script configured")),
        }
    }
}
