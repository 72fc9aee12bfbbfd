//! Network address of a reserved device.

use std::fmt;
use std::net::IpAddr;

use crate::error::{Error, ErrorKind, Result};

/// `ip:port` of a device plus the serial adb uses to address it.
///
/// The IP is validated when the address is built, so a bad coordinator
/// payload fails here instead of surfacing later as a confusing adb error.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceAddress {
    ip: IpAddr,
    ip_literal: String,
    port: u16,
    serial: String,
}

impl DeviceAddress {
    /// Validate `ip` and `port` and derive the serial.
    pub fn new(ip: &str, port: u16) -> Result<Self> {
        let ip_literal = ip.trim();
        let parsed: IpAddr = ip_literal.parse().map_err(|e| {
            Error::new(
                ErrorKind::InvalidAddress,
                format!("'{ip}' is not an IPv4 or IPv6 literal"),
            )
            .with_source(e)
        })?;
        if port == 0 {
            return Err(Error::new(
                ErrorKind::InvalidAddress,
                "port must be a positive integer",
            ));
        }
        Ok(Self {
            ip: parsed,
            ip_literal: ip_literal.to_string(),
            port,
            // adb matches the serial literally, so keep the caller's spelling.
            serial: format!("{ip_literal}:{port}"),
        })
    }

    /// Parsed IP.
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// IP exactly as the coordinator sent it.
    pub fn ip_literal(&self) -> &str {
        &self.ip_literal
    }

    /// Device port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `"{ip}:{port}"`.
    pub fn serial(&self) -> &str {
        &self.serial
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serial)
    }
}
