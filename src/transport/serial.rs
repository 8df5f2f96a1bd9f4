//! Serial port transport, standing in for the USCI UART of the vendor
//! samples.
use std::io::{Read, Write};
use std::time::Duration;

use anyhow::{Error, Result};
use serialport::SerialPort;

use super::Transport;

/// Short enough that the session loop re-checks the trigger pin at a
/// useful rate while no traffic arrives.
const POLL_TIMEOUT_MS: u64 = 20;

pub const DEFAULT_BAUDRATE: u32 = 115200;

pub struct SerialTransport {
    serial_port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn scan_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    pub fn open(port: &str, baudrate: u32) -> Result<Self> {
        log::info!("Opening serial port \"{}\" @ {} baud", port, baudrate);
        let port = serialport::new(port, baudrate)
            .timeout(Duration::from_millis(POLL_TIMEOUT_MS))
            .open()?;
        Ok(SerialTransport { serial_port: port })
    }

    pub fn open_nth(nth: usize, baudrate: u32) -> Result<Self> {
        let ports = serialport::available_ports()?;

        match ports.get(nth) {
            Some(port) => Self::open(&port.port_name, baudrate),
            None => Err(Error::msg("No serial ports found!")),
        }
    }

    pub fn open_any() -> Result<Self> {
        Self::open_nth(0, DEFAULT_BAUDRATE)
    }
}

impl Transport for SerialTransport {
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.serial_port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn send(&mut self, raw: &[u8]) -> Result<()> {
        self.serial_port.write_all(raw)?;
        self.serial_port.flush()?;
        Ok(())
    }
}
