//! One reserved device, from reservation to release.
//!
//! [`Session::open`] reserves a device, brings it up (adb connect, wake,
//! unlock) and starts log capture. [`Session::close`] undoes all of it in
//! reverse. Any setup step that fails tears down whatever was already
//! established before the error is returned.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::capture::{CaptureOutcome, CaptureState, LogCapture};
use crate::config::Config;
use crate::constants::{LOGCAT_ARTIFACT, SCREENCAP_ARTIFACT, SCREENCAP_TIMEOUT};
use crate::device::{DeviceCommandChannel, Launcher};
use crate::error::{Error, Result};
use crate::farm::{RemoteDevice, ReservationClient, ReservationRequest};
use crate::status::{messages, SharedStatus};

/// Env var carrying the device IP.
pub const ANDROID_IP: &str = "ANDROID_IP";
/// Env var carrying the device port.
pub const ANDROID_PORT: &str = "ANDROID_PORT";
/// Env var carrying the adb serial.
pub const ANDROID_SERIAL: &str = "ANDROID_SERIAL";

/// How a job that used the farm ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobResult {
    /// The job ran and succeeded.
    Success,
    /// The job ran, or device setup failed, and it did not succeed.
    Failure,
    /// The farm could not provide a device; the job never ran.
    NotCompleted,
}

impl JobResult {
    /// Classify a terminal error.
    pub fn from_error(err: &Error) -> Self {
        if err.kind().is_infrastructure() {
            Self::NotCompleted
        } else {
            Self::Failure
        }
    }

    /// Classify a job's exit code.
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            Self::Success
        } else {
            Self::Failure
        }
    }
}

/// What teardown did. Teardown never fails; problems are listed here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    /// Where the final screenshot was written, if one was taken.
    pub screencap: Option<PathBuf>,
    /// What happened to the device log.
    pub logcat: CaptureOutcome,
    /// One line per step that failed.
    pub errors: Vec<String>,
}

impl TeardownReport {
    fn new() -> Self {
        Self {
            screencap: None,
            logcat: CaptureOutcome::NotStarted,
            errors: Vec::new(),
        }
    }

    /// Every step succeeded.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Exclusive use of one reserved device.
#[derive(Debug)]
pub struct Session {
    client: ReservationClient,
    device: RemoteDevice,
    channel: DeviceCommandChannel,
    capture: LogCapture,
    artifacts_dir: PathBuf,
    kill_timeout: Duration,
    capture_screen: bool,
    status: SharedStatus,
    closed: bool,
}

impl Session {
    /// Reserve a device and bring it up.
    ///
    /// Returns `Ok(None)` if `cancel` fires while waiting for the farm.
    pub async fn open(
        config: &Config,
        request: &ReservationRequest,
        launcher: Arc<dyn Launcher>,
        status: SharedStatus,
        cancel: &CancellationToken,
    ) -> Result<Option<Self>> {
        let mut client = ReservationClient::connect(
            &config.api_url,
            request,
            config.connect_timeout(),
            Arc::clone(&status),
        )
        .await
        .inspect_err(|e| status.status(&messages::failure(e)))?;

        let device = match client
            .await_reservation(config.reservation_timeout(), config.poll_interval(), cancel)
            .await
        {
            Ok(Some(device)) => device,
            Ok(None) => {
                client.release().await;
                return Ok(None);
            }
            Err(e) => {
                status.status(&messages::failure(&e));
                client.release().await;
                return Err(e);
            }
        };

        let channel = DeviceCommandChannel::new(
            device.address().clone(),
            &config.sdk(),
            launcher,
            Arc::clone(&status),
        )
        .with_command_timeout(config.command_timeout());

        let mut session = Self {
            client,
            device,
            channel,
            capture: LogCapture::new(&config.artifacts_dir),
            artifacts_dir: config.artifacts_dir.clone(),
            kill_timeout: config.kill_timeout(),
            capture_screen: config.capture_screen,
            status,
            closed: false,
        };

        if let Err(e) = session.bring_up().await {
            log::error!("[Session] Device setup failed: {}", e);
            session.status.status(&messages::failure(&e));
            session.teardown(false).await;
            return Err(e);
        }
        Ok(Some(session))
    }

    async fn bring_up(&mut self) -> Result<()> {
        self.channel.connect().await?;
        self.channel.power_on().await?;
        self.channel.unlock_screen().await?;

        if let Err(e) = self.capture.start(&self.channel) {
            log::warn!("[Session] Log capture unavailable: {}", e);
        }
        Ok(())
    }

    /// The reserved device.
    pub fn device(&self) -> &RemoteDevice {
        &self.device
    }

    /// Command channel for the device.
    pub fn channel(&self) -> &DeviceCommandChannel {
        &self.channel
    }

    /// Log capture state.
    pub fn capture_state(&self) -> CaptureState {
        self.capture.state()
    }

    /// Variables that tell a job which device it has.
    pub fn env(&self) -> Vec<(String, String)> {
        let address = self.device.address();
        vec![
            (ANDROID_IP.to_string(), address.ip_literal().to_string()),
            (ANDROID_PORT.to_string(), address.port().to_string()),
            (ANDROID_SERIAL.to_string(), address.serial().to_string()),
        ]
    }

    /// Screenshot, archive the log, disconnect and release the device.
    pub async fn close(mut self) -> TeardownReport {
        let screen = self.capture_screen;
        self.teardown(screen).await
    }

    async fn teardown(&mut self, screen: bool) -> TeardownReport {
        let mut report = TeardownReport::new();
        if self.closed {
            return report;
        }
        self.closed = true;
        log::info!("[Session] Tearing down {}", self.device.serial());

        if screen {
            match self.save_screencap().await {
                Ok(path) => report.screencap = Some(path),
                Err(e) => {
                    log::warn!("[Session] Screen capture failed: {}", e);
                    report.errors.push(format!("screencap: {e}"));
                }
            }
        }

        report.logcat = self.capture.stop(self.kill_timeout, LOGCAT_ARTIFACT).await;

        if let Err(e) = self.channel.disconnect().await {
            log::warn!("[Session] Disconnect failed: {}", e);
            report.errors.push(format!("disconnect: {e}"));
        }

        self.client.release().await;
        report
    }

    async fn save_screencap(&self) -> Result<PathBuf> {
        let png = self.channel.capture_screen(SCREENCAP_TIMEOUT).await?;
        tokio::fs::create_dir_all(&self.artifacts_dir)
            .await
            .map_err(|e| Error::io(format!("creating {}", self.artifacts_dir.display()), e))?;
        let path = self.artifacts_dir.join(SCREENCAP_ARTIFACT);
        tokio::fs::write(&path, png)
            .await
            .map_err(|e| Error::io(format!("writing {}", path.display()), e))?;
        Ok(path)
    }
}
