//! Process launch capability.
//!
//! [`Launcher`] is the seam between device logic and the OS: run a command
//! to completion under a deadline, or spawn one that streams its stdout.
//! [`SystemLauncher`] is the real implementation on top of `tokio::process`;
//! tests substitute recorders.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

use crate::error::{Error, ErrorKind, Result};

/// A fully specified external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl Invocation {
    /// Command running `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Append arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append environment variables.
    #[must_use]
    pub fn envs<I>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.env.extend(env);
        self
    }

    /// Program path.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Extra environment.
    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    /// Arguments joined with single spaces (`"-s 10.0.0.1:5555 logcat -v time"`).
    pub fn args_line(&self) -> String {
        self.args.join(" ")
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Split a command string into words.
///
/// Whitespace separates words; single or double quotes group a run of text
/// (quotes themselves are dropped). There is no escape character.
pub fn tokenize(command: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for c in command.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

/// Result of a command that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` if the process was killed by a signal.
    pub status: Option<i32>,
    /// Captured stdout.
    pub stdout: Vec<u8>,
    /// Captured stderr.
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    /// Exited with code 0.
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Stdout decoded lossily as UTF-8.
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Runs external commands on behalf of a device channel.
#[async_trait]
pub trait Launcher: Send + Sync + fmt::Debug {
    /// Run `invocation` to completion, capturing stdout and stderr.
    ///
    /// Fails with `CommandTimeout` if it does not finish within `timeout`; the
    /// process is killed and reaped before the error is returned.
    async fn run(&self, invocation: &Invocation, timeout: Duration) -> Result<CommandOutput>;

    /// Start `invocation` with stdout piped and return without waiting.
    fn spawn(&self, invocation: &Invocation) -> Result<Child>;
}

fn launch_error(invocation: &Invocation, e: std::io::Error) -> Error {
    Error::execution(format!("failed to launch {invocation}")).with_source(e)
}

/// [`Launcher`] backed by `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

#[async_trait]
impl Launcher for SystemLauncher {
    async fn run(&self, invocation: &Invocation, timeout: Duration) -> Result<CommandOutput> {
        let mut child = invocation
            .command()
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| launch_error(invocation, e))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let finished = tokio::time::timeout(timeout, async {
            let (out, err, status) = tokio::join!(drain(stdout), drain(stderr), child.wait());
            (out, err, status)
        })
        .await;

        match finished {
            Ok((out, err, status)) => {
                let status = status.map_err(|e| {
                    Error::execution(format!("failed waiting for {invocation}")).with_source(e)
                })?;
                let stdout = out.map_err(|e| {
                    Error::execution(format!("failed reading stdout of {invocation}"))
                        .with_source(e)
                })?;
                Ok(CommandOutput {
                    status: status.code(),
                    stdout,
                    // stderr is diagnostic only; a read error there is not fatal
                    stderr: err.unwrap_or_default(),
                })
            }
            Err(_) => {
                log::warn!(
                    "[Launcher] '{}' exceeded {}ms, killing",
                    invocation,
                    timeout.as_millis()
                );
                if let Err(e) = child.kill().await {
                    log::warn!("[Launcher] Failed to kill '{}': {}", invocation, e);
                }
                Err(Error::new(
                    ErrorKind::CommandTimeout,
                    format!("'{}' did not finish within {}ms", invocation, timeout.as_millis()),
                ))
            }
        }
    }

    fn spawn(&self, invocation: &Invocation) -> Result<Child> {
        invocation
            .command()
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| launch_error(invocation, e))
    }
}
