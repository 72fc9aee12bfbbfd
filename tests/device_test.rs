//! Device channel, log capture and session against a stand-in `adb`.
//!
//! The stand-in is a shell script placed at `<sdk>/platform-tools/adb` that
//! appends its arguments to a log file and answers the handful of commands
//! a session issues.

#![cfg(unix)]

mod common;

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{FakeFarm, Script};
use device_farm::error::ErrorKind;
use device_farm::session::{ANDROID_IP, ANDROID_PORT, ANDROID_SERIAL};
use device_farm::status::messages;
use device_farm::{
    CaptureOutcome, CaptureState, Config, DeviceAddress, DeviceCommandChannel, LogCapture,
    RecordingStatus, ReservationRequest, Sdk, Session, SharedStatus, SystemLauncher,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const SERIAL: &str = "10.20.30.40:8888";
const GRANT: &str =
    r#"42["svc_device","{\"ip\":\"10.20.30.40\",\"port\":\"8888\",\"tag\":\"TEST-365\"}"]"#;

struct FakeAdb {
    dir: TempDir,
}

impl FakeAdb {
    /// `extra` holds `case` arms that take precedence over the defaults.
    fn install(extra: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let tools = dir.path().join("platform-tools");
        std::fs::create_dir_all(&tools).unwrap();

        let log = dir.path().join("adb.log");
        let pid = dir.path().join("hang.pid");
        let script = format!(
            r#"#!/bin/sh
echo "$*" >> '{log}'
case "$*" in
{extra}
  connect*) echo "connected to $2" ;;
  disconnect*) echo "disconnected $2" ;;
  *"shell screencap -p") printf '\211PNG\r\n\032\r\n' ;;
  *" logcat -v time") printf 'I/Tag( 1): one\r\nI/Tag( 1): two\r\n' ;;
  *" shell hang") echo $$ > '{pid}'; exec sleep 30 ;;
esac
"#,
            log = log.display(),
            pid = pid.display(),
        );
        let adb = tools.join("adb");
        std::fs::write(&adb, script).unwrap();
        std::fs::set_permissions(&adb, std::fs::Permissions::from_mode(0o755)).unwrap();
        Self { dir }
    }

    fn sdk(&self) -> Sdk {
        Sdk::new(Some(self.dir.path().to_path_buf()), None)
    }

    fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join("adb.log"))
            .unwrap_or_default()
            .lines()
            .map(ToString::to_string)
            .collect()
    }

    fn hang_pid(&self) -> String {
        std::fs::read_to_string(self.dir.path().join("hang.pid"))
            .unwrap()
            .trim()
            .to_string()
    }

    fn artifacts(&self) -> PathBuf {
        self.dir.path().join("artifacts")
    }
}

fn channel(adb: &FakeAdb, status: SharedStatus) -> DeviceCommandChannel {
    DeviceCommandChannel::new(
        DeviceAddress::new("10.20.30.40", 8888).unwrap(),
        &adb.sdk(),
        Arc::new(SystemLauncher),
        status,
    )
    .with_command_timeout(Duration::from_secs(5))
}

fn is_running(pid: &str) -> bool {
    std::process::Command::new("sh")
        .arg("-c")
        .arg(format!("kill -0 {pid} 2>/dev/null"))
        .status()
        .unwrap()
        .success()
}

fn position(calls: &[String], needle: &str) -> usize {
    calls
        .iter()
        .position(|c| c == needle)
        .unwrap_or_else(|| panic!("'{needle}' not in {calls:?}"))
}

#[tokio::test]
async fn test_control_commands_reach_adb() {
    let adb = FakeAdb::install("");
    let status = Arc::new(RecordingStatus::default());
    let channel = channel(&adb, Arc::clone(&status) as SharedStatus);

    channel.connect().await.unwrap();
    channel.power_on().await.unwrap();
    channel.unlock_screen().await.unwrap();
    channel.disconnect().await.unwrap();

    assert_eq!(
        adb.calls(),
        vec![
            format!("connect {SERIAL}"),
            format!("-s {SERIAL} shell input keyevent 26"),
            format!("-s {SERIAL} shell input keyevent 82"),
            format!("disconnect {SERIAL}"),
        ]
    );
    assert!(status.lines().contains(&format!("connected to {SERIAL}\n")));
}

#[tokio::test]
async fn test_hanging_command_is_killed() {
    let adb = FakeAdb::install("");
    let channel = channel(&adb, Arc::new(device_farm::NullStatus));

    let started = Instant::now();
    let err = channel
        .send_shell_command("hang", Duration::from_millis(500))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::CommandTimeout);
    assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());
    assert!(!is_running(&adb.hang_pid()), "hung adb survived the timeout");
}

#[tokio::test]
async fn test_screencap_is_normalized() {
    let adb = FakeAdb::install("");
    let channel = channel(&adb, Arc::new(device_farm::NullStatus));

    let png = channel.capture_screen(Duration::from_secs(5)).await.unwrap();
    assert_eq!(png, b"\x89PNG\n\x1a\n");
}

#[tokio::test]
async fn test_failed_screencap_is_an_error() {
    let adb = FakeAdb::install(r#"  *"shell screencap -p") exit 1 ;;"#);
    let channel = channel(&adb, Arc::new(device_farm::NullStatus));

    let err = channel.capture_screen(Duration::from_secs(5)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CommandExecutionFailure);
}

#[tokio::test]
async fn test_running_logcat_is_killed_and_archived() {
    let adb = FakeAdb::install(
        r#"  *" logcat -v time") printf 'I/Tag( 1): one\r\nI/Tag( 1): two\r\n'; exec sleep 30 ;;"#,
    );
    let channel = channel(&adb, Arc::new(device_farm::NullStatus));
    let mut capture =
        LogCapture::new(adb.artifacts()).with_grace_period(Duration::from_millis(200));

    capture.start(&channel).unwrap();
    assert_eq!(capture.state(), CaptureState::Capturing);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    let outcome = capture.stop(Duration::from_secs(2), "logcat.txt").await;
    assert!(started.elapsed() < Duration::from_secs(3));

    let archived = adb.artifacts().join("logcat.txt");
    assert_eq!(outcome, CaptureOutcome::Archived(archived.clone()));
    assert_eq!(
        std::fs::read_to_string(&archived).unwrap(),
        "I/Tag( 1): one\nI/Tag( 1): two\n"
    );
}

#[tokio::test]
async fn test_silent_logcat_is_discarded() {
    let adb = FakeAdb::install(r#"  *" logcat -v time") exit 0 ;;"#);
    let channel = channel(&adb, Arc::new(device_farm::NullStatus));
    let mut capture = LogCapture::new(adb.artifacts());

    capture.start(&channel).unwrap();
    let outcome = capture.stop(Duration::from_secs(2), "logcat.txt").await;

    assert_eq!(outcome, CaptureOutcome::Discarded);
    assert_eq!(capture.state(), CaptureState::Discarded);
    assert!(!adb.artifacts().join("logcat.txt").exists());
}

fn config(farm: &FakeFarm, adb: &FakeAdb) -> Config {
    Config {
        api_url: farm.endpoint.clone(),
        tag: "TEST-365".to_string(),
        sdk_root: adb.sdk().root().map(Path::to_path_buf),
        artifacts_dir: adb.artifacts(),
        connect_timeout: 2,
        reservation_timeout: 5,
        poll_interval: 1,
        command_timeout_ms: 2_000,
        kill_timeout: 2,
        ..Config::default()
    }
}

#[tokio::test]
async fn test_session_runs_setup_and_teardown_in_order() {
    let farm = FakeFarm::start(Script::grant(&[GRANT])).await;
    let adb = FakeAdb::install("");
    let status = Arc::new(RecordingStatus::default());

    let session = Session::open(
        &config(&farm, &adb),
        &ReservationRequest::new("TEST-365", "job-1"),
        Arc::new(SystemLauncher),
        Arc::clone(&status) as SharedStatus,
        &CancellationToken::new(),
    )
    .await
    .unwrap()
    .expect("session");

    assert_eq!(session.device().serial(), SERIAL);
    assert_eq!(session.channel().serial(), SERIAL);
    assert_eq!(session.capture_state(), CaptureState::Capturing);
    let env = session.env();
    assert!(env.contains(&(ANDROID_IP.to_string(), "10.20.30.40".to_string())));
    assert!(env.contains(&(ANDROID_PORT.to_string(), "8888".to_string())));
    assert!(env.contains(&(ANDROID_SERIAL.to_string(), SERIAL.to_string())));

    let report = session.close().await;
    assert!(report.is_clean(), "{:?}", report.errors);
    assert_eq!(report.screencap, Some(adb.artifacts().join("screencap.png")));
    assert_eq!(
        report.logcat,
        CaptureOutcome::Archived(adb.artifacts().join("logcat.txt"))
    );

    let calls = adb.calls();
    let connect = position(&calls, &format!("connect {SERIAL}"));
    let wake = position(&calls, &format!("-s {SERIAL} shell input keyevent 26"));
    let unlock = position(&calls, &format!("-s {SERIAL} shell input keyevent 82"));
    let screencap = position(&calls, &format!("-s {SERIAL} shell screencap -p"));
    let disconnect = position(&calls, &format!("disconnect {SERIAL}"));
    position(&calls, &format!("-s {SERIAL} logcat -v time"));
    assert!(connect < wake && wake < unlock && unlock < screencap && screencap < disconnect);

    assert!(farm.wait_for_frame(r#"42["jen_out","bye"]"#).await);
    assert!(farm.wait_for_frame("41").await);
}

#[tokio::test]
async fn test_failed_bring_up_releases_the_device() {
    let farm = FakeFarm::start(Script::grant(&[GRANT])).await;
    let adb = FakeAdb::install("  connect*) exec sleep 30 ;;");
    let mut config = config(&farm, &adb);
    config.command_timeout_ms = 300;

    let err = Session::open(
        &config,
        &ReservationRequest::new("TEST-365", "job-2"),
        Arc::new(SystemLauncher),
        Arc::new(RecordingStatus::default()),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::CommandTimeout);
    assert!(farm.wait_for_frame(r#"42["jen_out","bye"]"#).await);
    // teardown still tried to disconnect; no screenshot on a failed bring-up
    let calls = adb.calls();
    assert!(calls.contains(&format!("disconnect {SERIAL}")), "{calls:?}");
    assert!(!calls.iter().any(|c| c.contains("screencap")), "{calls:?}");
}

async fn open_failure_lines(script: Script) -> (ErrorKind, Vec<String>) {
    let farm = FakeFarm::start(script).await;
    let adb = FakeAdb::install("");
    let status = Arc::new(RecordingStatus::default());

    let err = Session::open(
        &config(&farm, &adb),
        &ReservationRequest::new("TEST-365", "job-3"),
        Arc::new(SystemLauncher),
        Arc::clone(&status) as SharedStatus,
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    let lines = status
        .lines()
        .into_iter()
        .filter(|l| l != messages::WAITING_FOR_DEVICE)
        .collect();
    (err.kind(), lines)
}

#[tokio::test]
async fn test_malformed_reservation_reports_one_line() {
    let (kind, lines) = open_failure_lines(Script::grant(&[
        r#"42["svc_device","{\"ip\":\"10.20.30.40\",\"poXXXXrt\":\"8888\"}"]"#,
    ]))
    .await;

    assert_eq!(kind, ErrorKind::MalformedResponse);
    assert_eq!(
        lines,
        vec!["Failed to parse the device farm response (reservation is missing 'port')"]
    );
}

#[tokio::test]
async fn test_coordinator_hang_up_reports_one_line() {
    let mut script = Script::idle();
    script.delay = Duration::from_millis(100);
    script.hang_up = true;
    let (kind, lines) = open_failure_lines(script).await;

    assert_eq!(kind, ErrorKind::ConnectionFailure);
    assert_eq!(lines.len(), 1, "{lines:?}");
    assert!(lines[0].starts_with("Device farm connection failed"), "{lines:?}");
}
