//! adb command channel bound to one device serial.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::task::JoinHandle;

use super::address::DeviceAddress;
use super::launcher::{tokenize, CommandOutput, Invocation, Launcher};
use crate::capture::normalizer::LineEndingNormalizer;
use crate::constants::{DEFAULT_COMMAND_TIMEOUT, KEY_MENU, KEY_POWER};
use crate::error::{Error, Result};
use crate::sdk::{Sdk, Tool};
use crate::status::SharedStatus;

/// Runs adb commands against a single reserved device.
///
/// Every call carries a deadline; a command that overruns it is killed before
/// `CommandTimeout` is returned. The channel owns the serial for the life of
/// a session.
#[derive(Debug, Clone)]
pub struct DeviceCommandChannel {
    address: DeviceAddress,
    adb: PathBuf,
    env: Vec<(String, String)>,
    command_timeout: Duration,
    launcher: Arc<dyn Launcher>,
    status: SharedStatus,
}

impl DeviceCommandChannel {
    /// Channel for `address` using the adb from `sdk`.
    pub fn new(
        address: DeviceAddress,
        sdk: &Sdk,
        launcher: Arc<dyn Launcher>,
        status: SharedStatus,
    ) -> Self {
        Self {
            address,
            adb: sdk.tool_path(Tool::Adb),
            env: sdk.env(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            launcher,
            status,
        }
    }

    /// Override the timeout used by the convenience commands.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Device this channel talks to.
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    /// adb serial (`ip:port`).
    pub fn serial(&self) -> &str {
        self.address.serial()
    }

    fn invocation(&self, args: Vec<String>) -> Invocation {
        Invocation::new(&self.adb).args(args).envs(self.env.clone())
    }

    /// Run `adb <command>` and capture its output.
    ///
    /// A non-zero exit is logged but not treated as an error: adb reports most
    /// failures (unreachable device, refused connection) on stdout with status
    /// 0 anyway. Use [`send_command_checked`](Self::send_command_checked) when
    /// the status matters.
    pub async fn send_command(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        let invocation = self.invocation(tokenize(command));
        log::debug!("[DeviceChannel] Running: {}", invocation);

        let output = self.launcher.run(&invocation, timeout).await?;
        let stdout = output.stdout_lossy();
        if !stdout.trim().is_empty() {
            log::debug!("[DeviceChannel] adb {}: {}", command, stdout.trim_end());
        }
        if !output.success() {
            log::warn!(
                "[DeviceChannel] adb {} exited with {:?}: {}",
                command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim_end()
            );
        }
        Ok(output)
    }

    /// Like [`send_command`](Self::send_command), but a non-zero exit is a
    /// `CommandExecutionFailure`.
    pub async fn send_command_checked(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let output = self.send_command(command, timeout).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(Error::execution(format!(
                "adb {} exited with {:?}",
                command, output.status
            )))
        }
    }

    /// Run `adb -s <serial> shell <command>`.
    pub async fn send_shell_command(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        self.send_command(&self.shell_command(command), timeout).await
    }

    fn shell_command(&self, command: &str) -> String {
        format!("-s {} shell {}", self.serial(), command)
    }

    /// `adb connect <serial>` with the default timeout.
    pub async fn connect(&self) -> Result<()> {
        self.connect_with_timeout(self.command_timeout).await
    }

    /// `adb connect <serial>`.
    pub async fn connect_with_timeout(&self, timeout: Duration) -> Result<()> {
        let output = self
            .send_command(&format!("connect {}", self.serial()), timeout)
            .await?;
        self.report(&output);
        Ok(())
    }

    /// `adb disconnect <serial>`.
    pub async fn disconnect(&self) -> Result<()> {
        let output = self
            .send_command(&format!("disconnect {}", self.serial()), self.command_timeout)
            .await?;
        self.report(&output);
        Ok(())
    }

    fn report(&self, output: &CommandOutput) {
        let text = output.stdout_lossy();
        if !text.trim().is_empty() {
            self.status.status(&text);
        }
    }

    /// Press the power key.
    pub async fn power_on(&self) -> Result<()> {
        self.send_key(KEY_POWER).await
    }

    /// Press the menu key, which dismisses the lock screen.
    pub async fn unlock_screen(&self) -> Result<()> {
        self.send_key(KEY_MENU).await
    }

    async fn send_key(&self, code: u32) -> Result<()> {
        self.send_shell_command(&format!("input keyevent {code}"), self.command_timeout)
            .await?;
        Ok(())
    }

    /// `adb devices` output.
    pub async fn list_devices(&self) -> Result<String> {
        let output = self.send_command("devices", self.command_timeout).await?;
        Ok(output.stdout_lossy())
    }

    /// Grab a PNG of the screen with `screencap -p`.
    ///
    /// The shell transport mangles line endings on some devices, so the bytes
    /// are normalized before they are returned.
    pub async fn capture_screen(&self, timeout: Duration) -> Result<Vec<u8>> {
        let output = self
            .send_command_checked(&self.shell_command("screencap -p"), timeout)
            .await?;
        if output.stdout.is_empty() {
            return Err(Error::execution("screencap produced no output"));
        }
        Ok(LineEndingNormalizer::normalize(&output.stdout))
    }

    /// Start `adb -s <serial> logcat -v time` and pump its stdout into `sink`.
    ///
    /// Returns as soon as the process is running. The sink is shut down when
    /// the stream ends.
    pub fn start_log_stream<W>(&self, sink: W) -> Result<LogStream>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let command = format!("-s {} logcat -v time", self.serial());
        let invocation = self.invocation(tokenize(&command));
        log::info!("[DeviceChannel] Starting log stream: {}", invocation);

        let mut child = self.launcher.spawn(&invocation)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::execution("logcat started without a stdout pipe"))?;

        let pump = tokio::spawn(async move {
            let mut stdout = stdout;
            let mut sink = sink;
            let copied = tokio::io::copy(&mut stdout, &mut sink).await;
            let closed = sink.shutdown().await;
            let copied = copied?;
            closed?;
            Ok(copied)
        });

        Ok(LogStream { child, pump })
    }
}

/// A running log stream: the process plus the task copying its output.
#[derive(Debug)]
pub struct LogStream {
    child: Child,
    pump: JoinHandle<std::io::Result<u64>>,
}

impl LogStream {
    /// Split into the process and the pump task.
    pub fn into_parts(self) -> (Child, JoinHandle<std::io::Result<u64>>) {
        (self.child, self.pump)
    }
}
