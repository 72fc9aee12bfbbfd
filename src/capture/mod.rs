//! Device log capture.
//!
//! [`LogCapture`] spools `logcat` output to a temp file through the
//! line-ending normalizer, then on [`stop`](LogCapture::stop) kills the
//! process and keeps the file as an artifact if anything was captured.
//!
//! ```text
//! Idle -> Capturing -> Stopping -> Archived | Discarded
//! ```

pub mod killer;
pub mod normalizer;

use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempPath;

use crate::constants::{CAPTURE_DRAIN_TIMEOUT, CAPTURE_GRACE_PERIOD};
use crate::device::{DeviceCommandChannel, LogStream};
use crate::error::{Error, Result};
use killer::Killable;
use normalizer::NormalizingWriter;

/// Where a capture is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// Not started.
    Idle,
    /// logcat is running and being spooled.
    Capturing,
    /// Teardown in progress.
    Stopping,
    /// The log was copied to the artifact directory.
    Archived,
    /// Nothing worth keeping was captured, or archiving failed.
    Discarded,
}

/// What [`LogCapture::stop`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// The capture was never started; nothing to do.
    NotStarted,
    /// The log was archived at this path.
    Archived(PathBuf),
    /// The log was empty or could not be archived.
    Discarded,
}

struct CaptureSession {
    stream: LogStream,
    spool: TempPath,
}

/// Captures one device's log for the duration of a session.
pub struct LogCapture {
    state: CaptureState,
    session: Option<CaptureSession>,
    artifacts_dir: PathBuf,
    grace_period: Duration,
    drain_timeout: Duration,
}

impl std::fmt::Debug for LogCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogCapture")
            .field("state", &self.state)
            .field("spool", &self.spool_path())
            .field("artifacts_dir", &self.artifacts_dir)
            .finish_non_exhaustive()
    }
}

impl LogCapture {
    /// Capture that archives into `artifacts_dir`.
    pub fn new(artifacts_dir: impl Into<PathBuf>) -> Self {
        Self {
            state: CaptureState::Idle,
            session: None,
            artifacts_dir: artifacts_dir.into(),
            grace_period: CAPTURE_GRACE_PERIOD,
            drain_timeout: CAPTURE_DRAIN_TIMEOUT,
        }
    }

    /// Override how long a running logcat gets to exit before it is killed.
    #[must_use]
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Temp file the log is being spooled to, while capturing.
    pub fn spool_path(&self) -> Option<&Path> {
        self.session.as_ref().map(|s| &*s.spool)
    }

    /// Start `logcat` on `channel`, spooling into a fresh temp file.
    ///
    /// Calling this on a capture that is not idle does nothing.
    pub fn start(&mut self, channel: &DeviceCommandChannel) -> Result<()> {
        if self.state != CaptureState::Idle {
            log::warn!("[LogCapture] start() ignored in state {:?}", self.state);
            return Ok(());
        }

        let (file, spool) = tempfile::Builder::new()
            .prefix("device-farm-logcat-")
            .suffix(".txt")
            .tempfile()
            .map_err(|e| Error::io("creating log spool file", e))?
            .into_parts();
        let sink = NormalizingWriter::new(tokio::fs::File::from_std(file));
        let stream = channel.start_log_stream(sink)?;

        log::info!(
            "[LogCapture] Capturing {} into {}",
            channel.serial(),
            spool.display()
        );
        self.session = Some(CaptureSession { stream, spool });
        self.state = CaptureState::Capturing;
        Ok(())
    }

    /// Stop the capture and archive the log as `destination_name`.
    ///
    /// Never fails. Each step is attempted independently and failures are
    /// logged; the spool file is always removed.
    pub async fn stop(&mut self, kill_timeout: Duration, destination_name: &str) -> CaptureOutcome {
        let Some(CaptureSession { stream, spool }) = self.session.take() else {
            return CaptureOutcome::NotStarted;
        };
        self.state = CaptureState::Stopping;

        let (mut child, mut pump) = stream.into_parts();
        if child.is_alive()
            && tokio::time::timeout(self.grace_period, child.wait())
                .await
                .is_err()
            && !killer::kill(&mut child, kill_timeout).await
        {
            log::warn!("[LogCapture] logcat may still be running (pid {:?})", child.id());
        }

        match tokio::time::timeout(self.drain_timeout, &mut pump).await {
            Ok(Ok(Ok(bytes))) => log::debug!("[LogCapture] Spooled {} bytes", bytes),
            Ok(Ok(Err(e))) => log::warn!("[LogCapture] Error closing log stream: {}", e),
            Ok(Err(e)) => log::warn!("[LogCapture] Log pump task failed: {}", e),
            Err(_) => {
                log::warn!("[LogCapture] Log pump did not drain in time");
                pump.abort();
            }
        }

        let outcome = archive(&spool, &self.artifacts_dir, destination_name).await;
        if let Err(e) = spool.close() {
            log::warn!("[LogCapture] Failed to remove spool file: {}", e);
        }

        self.state = match outcome {
            CaptureOutcome::Archived(_) => CaptureState::Archived,
            _ => CaptureState::Discarded,
        };
        outcome
    }
}

async fn archive(spool: &Path, artifacts_dir: &Path, name: &str) -> CaptureOutcome {
    let len = match tokio::fs::metadata(spool).await {
        Ok(meta) => meta.len(),
        Err(e) => {
            log::warn!("[LogCapture] Cannot stat spool {}: {}", spool.display(), e);
            return CaptureOutcome::Discarded;
        }
    };
    if len == 0 {
        log::info!("[LogCapture] Log is empty, not archiving");
        return CaptureOutcome::Discarded;
    }

    if let Err(e) = tokio::fs::create_dir_all(artifacts_dir).await {
        log::warn!(
            "[LogCapture] Cannot create artifact dir {}: {}",
            artifacts_dir.display(),
            e
        );
        return CaptureOutcome::Discarded;
    }
    let destination = artifacts_dir.join(name);
    match tokio::fs::copy(spool, &destination).await {
        Ok(_) => {
            log::info!("[LogCapture] Archived log to {}", destination.display());
            CaptureOutcome::Archived(destination)
        }
        Err(e) => {
            log::warn!(
                "[LogCapture] Failed to archive log to {}: {}",
                destination.display(),
                e
            );
            CaptureOutcome::Discarded
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::constants::LOGCAT_ARTIFACT;
    use crate::device::testing::RecordingLauncher;
    use crate::device::DeviceAddress;
    use crate::sdk::Sdk;
    use crate::status::NullStatus;

    fn channel(script: &str) -> (DeviceCommandChannel, Arc<RecordingLauncher>) {
        let launcher = Arc::new(RecordingLauncher::spawning(script));
        let channel = DeviceCommandChannel::new(
            DeviceAddress::new("10.20.30.40", 8888).unwrap(),
            &Sdk::default(),
            launcher.clone(),
            Arc::new(NullStatus),
        );
        (channel, launcher)
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut capture = LogCapture::new(dir.path());
        let outcome = capture.stop(Duration::from_secs(1), LOGCAT_ARTIFACT).await;
        assert_eq!(outcome, CaptureOutcome::NotStarted);
        assert_eq!(capture.state(), CaptureState::Idle);
    }

    #[tokio::test]
    async fn test_log_is_normalized_and_archived() {
        let dir = tempfile::tempdir().unwrap();
        let (channel, launcher) = channel("printf 'first\\r\\nsecond\\r\\n'");
        let mut capture = LogCapture::new(dir.path()).with_grace_period(Duration::from_millis(500));

        capture.start(&channel).unwrap();
        assert_eq!(capture.state(), CaptureState::Capturing);
        assert_eq!(launcher.commands(), vec!["-s 10.20.30.40:8888 logcat -v time"]);
        let spool = capture.spool_path().unwrap().to_path_buf();

        let outcome = capture.stop(Duration::from_secs(1), LOGCAT_ARTIFACT).await;
        let archived = dir.path().join(LOGCAT_ARTIFACT);
        assert_eq!(outcome, CaptureOutcome::Archived(archived.clone()));
        assert_eq!(capture.state(), CaptureState::Archived);
        assert_eq!(std::fs::read(&archived).unwrap(), b"first\nsecond\n");
        assert!(!spool.exists());
    }

    #[tokio::test]
    async fn test_empty_log_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let (channel, _) = channel("true");
        let mut capture = LogCapture::new(dir.path()).with_grace_period(Duration::from_millis(500));

        capture.start(&channel).unwrap();
        let outcome = capture.stop(Duration::from_secs(1), LOGCAT_ARTIFACT).await;
        assert_eq!(outcome, CaptureOutcome::Discarded);
        assert_eq!(capture.state(), CaptureState::Discarded);
        assert!(!dir.path().join(LOGCAT_ARTIFACT).exists());
    }

    #[tokio::test]
    async fn test_running_logcat_is_killed_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let (channel, _) = channel("printf 'alive\\n'; exec sleep 30");
        let mut capture = LogCapture::new(dir.path()).with_grace_period(Duration::from_millis(100));

        capture.start(&channel).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let start = std::time::Instant::now();
        let outcome = capture.stop(Duration::from_secs(2), LOGCAT_ARTIFACT).await;
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(matches!(outcome, CaptureOutcome::Archived(_)));
        assert_eq!(
            std::fs::read(dir.path().join(LOGCAT_ARTIFACT)).unwrap(),
            b"alive\n"
        );
    }

    #[tokio::test]
    async fn test_start_twice_keeps_first_session() {
        let dir = tempfile::tempdir().unwrap();
        let (channel, launcher) = channel("exec sleep 30");
        let mut capture = LogCapture::new(dir.path()).with_grace_period(Duration::from_millis(50));

        capture.start(&channel).unwrap();
        capture.start(&channel).unwrap();
        assert_eq!(launcher.commands().len(), 1);
        capture.stop(Duration::from_secs(2), LOGCAT_ARTIFACT).await;
    }
}
