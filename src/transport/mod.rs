//! Abstract byte transports between the bootloader and the host.
use anyhow::Result;

pub use self::mailbox::{MailboxHost, MailboxTransport};
pub use self::serial::SerialTransport;

pub mod mailbox;
mod serial;

/// Device-side view of the wire. Might be a serial port, a USB endpoint
/// pair, or an in-process mailbox.
pub trait Transport {
    /// Fetches pending bytes into `buf`, returning how many arrived.
    /// Returning 0 means nothing showed up within the poll window, so the
    /// session loop can go back to sampling the trigger pin.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Writes one reply packet.
    fn send(&mut self, raw: &[u8]) -> Result<()>;
}
