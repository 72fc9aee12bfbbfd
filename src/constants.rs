//! Application-wide constants for device-farm.
//!
//! Centralizes the timeouts, key codes and artifact names used across the
//! crate. Constants are grouped by domain.

use std::time::Duration;

// ============================================================================
// Timeouts
// ============================================================================

/// Default deadline for a single device command (`adb connect`, key events).
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(15_000);

/// Default budget for reaching the coordinator and completing the handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default overall wait for the coordinator to grant a device.
pub const DEFAULT_RESERVATION_TIMEOUT: Duration = Duration::from_secs(300);

/// Default interval between "waiting for device" progress lines.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default budget for forcefully killing the log capture process.
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a still-running capture process gets to exit on its own.
///
/// logcat normally dies when the device connection drops, so this is only
/// a last chance before the kill.
pub const CAPTURE_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// How long teardown waits for the capture pump to drain and close its file.
pub const CAPTURE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `release()` waits for the farewell packets to go out.
pub const RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadline for `screencap -p`.
pub const SCREENCAP_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Device key codes
// ============================================================================

/// `KEYCODE_POWER`.
pub const KEY_POWER: u32 = 26;

/// `KEYCODE_MENU`, which dismisses the lock screen.
pub const KEY_MENU: u32 = 82;

// ============================================================================
// Artifacts
// ============================================================================

/// Archived name of the captured device log.
pub const LOGCAT_ARTIFACT: &str = "logcat.txt";

/// Archived name of the final screen capture.
pub const SCREENCAP_ARTIFACT: &str = "screencap.png";

/// Prefix prepended to every user-visible status line.
pub const STATUS_PREFIX: &str = "[android] ";
