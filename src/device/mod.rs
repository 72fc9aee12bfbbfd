//! Talking to a reserved device: its address, the process launcher, and the
//! adb command channel.

pub mod address;
pub mod channel;
pub mod launcher;

#[cfg(test)]
pub(crate) mod testing;

pub use address::DeviceAddress;
pub use channel::{DeviceCommandChannel, LogStream};
pub use launcher::{CommandOutput, Invocation, Launcher, SystemLauncher};
