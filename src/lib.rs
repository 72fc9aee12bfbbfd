//! device-farm - reserve a shared Android device and drive it over adb.
//!
//! This crate provides the core functionality for the `device-farm` CLI:
//! asking a farm coordinator for a device, connecting to it with adb, and
//! capturing its log for the duration of a job.
//!
//! # Architecture
//!
//! - **Session** - Orchestrator, owns one reserved device from reservation
//!   to release
//! - **Farm** - Socket.IO client for the coordinator
//! - **Device** - adb command channel with per-call deadlines
//! - **Capture** - logcat spooling, line-ending repair, timed kill
//!
//! # Modules
//!
//! - [`farm`] - Reservation protocol
//! - [`device`] - Device address, process launcher, command channel
//! - [`capture`] - Log capture and the line-ending normalizer
//! - [`session`] - Setup and teardown of one device
//! - [`config`] - Configuration loading/saving

// Library modules
pub mod capture;
pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod farm;
pub mod sdk;
pub mod session;
pub mod status;

// Re-export commonly used types
pub use capture::normalizer::{LineEndingNormalizer, NormalizingWriter};
pub use capture::{CaptureOutcome, CaptureState, LogCapture};
pub use config::Config;
pub use device::{DeviceAddress, DeviceCommandChannel, Launcher, SystemLauncher};
pub use error::{Error, ErrorKind, Result};
pub use farm::{RemoteDevice, ReservationClient, ReservationRequest};
pub use sdk::{Sdk, Tool};
pub use session::{JobResult, Session, TeardownReport};
pub use status::{ConsoleStatus, NullStatus, RecordingStatus, SharedStatus, StatusSink};
