//! Nuvoton ISP bootloader protocol implementation.
//!
//! The command-driven flash update loop of the vendor ISP samples, with the
//! hardware behind three seams: [`Transport`] for the wire, [`FlashOps`] for
//! the flash controller, and [`session::Platform`] for the trigger pin,
//! watchdog and exit paths.

pub mod constants;
pub mod device;
pub mod dispatch;
pub mod flash;
pub mod framer;
pub mod protocol;
pub mod session;
pub mod transport;

pub use self::device::PartDb;
pub use self::dispatch::{DeviceInfo, Dispatcher};
pub use self::flash::{FlashGeometry, FlashOps, MemFlash};
pub use self::framer::Framer;
pub use self::protocol::{Packet, Reply, Request, Status};
pub use self::session::{ExitAction, Session, SessionState};
pub use self::transport::Transport;
