//! The underlying binary packet protocol of the ISP bootloader.
//!
//! Every wire unit is one 64-byte packet in both directions:
//!
//! | offset | size | field                                    |
//! |--------|------|------------------------------------------|
//! | 0      | 1    | command code                             |
//! | 1      | 1    | status (0 in requests)                   |
//! | 2      | 2    | sequence number, LE                      |
//! | 4      | 2    | checksum, LE: byte sum of bytes 6..64    |
//! | 6      | 58   | payload, command-specific                |
//!
//! Addresses and lengths are 4-byte little-endian, matching the flash
//! addressing width of the target parts.

use std::fmt;

use anyhow::Result;
use scroll::Pwrite;

use crate::constants::{
    FIRST_CHUNK, MAX_PACKET_SIZE, MAX_PAYLOAD, commands, offsets, status,
};

/// Wrapping byte sum used in the checksum header field.
pub fn checksum(payload: &[u8]) -> u16 {
    payload
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(b as u16))
}

/// One fixed-size wire packet.
///
/// Created per transport event, consumed by the dispatcher within one loop
/// iteration, then discarded.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    raw: [u8; MAX_PACKET_SIZE],
}

impl Packet {
    /// Builds a packet from whatever the transport delivered. Short reports
    /// are zero-padded, oversized ones clipped at 64 bytes; the dispatcher
    /// length-validates the payload afterwards.
    pub fn from_raw(data: &[u8]) -> Packet {
        let mut raw = [0u8; MAX_PACKET_SIZE];
        let n = data.len().min(MAX_PACKET_SIZE);
        raw[..n].copy_from_slice(&data[..n]);
        Packet { raw }
    }

    pub fn cmd(&self) -> u8 {
        self.raw[offsets::CMD]
    }

    pub fn seq(&self) -> u16 {
        u16::from_le_bytes([self.raw[offsets::SEQ], self.raw[offsets::SEQ + 1]])
    }

    /// Checksum carried in the header.
    pub fn claimed_checksum(&self) -> u16 {
        u16::from_le_bytes([self.raw[offsets::CHECKSUM], self.raw[offsets::CHECKSUM + 1]])
    }

    pub fn payload(&self) -> &[u8] {
        &self.raw[offsets::PAYLOAD..]
    }

    pub fn checksum_ok(&self) -> bool {
        self.claimed_checksum() == checksum(self.payload())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    fn payload_u32(&self, off: usize) -> u32 {
        let p = offsets::PAYLOAD + off;
        u32::from_le_bytes([self.raw[p], self.raw[p + 1], self.raw[p + 2], self.raw[p + 3]])
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Packet[{}]", hex::encode(self.raw))
    }
}

/// Reply status byte. All variants are recoverable from the device's point
/// of view; the host decides whether to resend or abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Status {
    Ok,
    UnknownCommand,
    OutOfRange,
    FlashFailed,
    ChecksumMismatch,
    TransportTimeout,
}

impl Status {
    pub fn code(self) -> u8 {
        match self {
            Status::Ok => status::OK,
            Status::UnknownCommand => status::UNKNOWN_COMMAND,
            Status::OutOfRange => status::OUT_OF_RANGE,
            Status::FlashFailed => status::FLASH_FAILED,
            Status::ChecksumMismatch => status::CHECKSUM_MISMATCH,
            Status::TransportTimeout => status::TRANSPORT_TIMEOUT,
        }
    }

    pub fn from_code(code: u8) -> Option<Status> {
        match code {
            status::OK => Some(Status::Ok),
            status::UNKNOWN_COMMAND => Some(Status::UnknownCommand),
            status::OUT_OF_RANGE => Some(Status::OutOfRange),
            status::FLASH_FAILED => Some(Status::FlashFailed),
            status::CHECKSUM_MISMATCH => Some(Status::ChecksumMismatch),
            status::TRANSPORT_TIMEOUT => Some(Status::TransportTimeout),
            _ => None,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

/// A decoded ISP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Start a session. Reply carries device identification and the flash
    /// geometry so the host learns the programmable ranges.
    Connect,
    /// Read the two user config words.
    ReadConfig,
    /// Overwrite the two user config words.
    WriteConfig { config: [u32; 2] },
    /// Erase `len` bytes of flash starting at `addr`. Both must be
    /// page-aligned and inside APROM or Data Flash.
    Erase { addr: u32, len: u32 },
    /// Program `total_len` bytes starting at `addr`. Data beyond the first
    /// chunk arrives in `Continue` packets.
    Program {
        addr: u32,
        total_len: u32,
        data: Vec<u8>,
    },
    /// Read `len` bytes starting at `addr`. Replies beyond the first chunk
    /// are pulled with `Continue` packets.
    Read { addr: u32, len: u32 },
    /// End the session. `reset` selects a full system reset instead of a
    /// branch to the application image.
    ResetOrRun { reset: bool },
    /// Data phase of an in-progress program or read transfer.
    Continue { data: Vec<u8> },
}

impl Request {
    /// Decodes a wire packet. Protocol-level problems are reported as the
    /// `Status` the reply must carry, never as a process error.
    pub fn from_packet(pkt: &Packet) -> Result<Request, Status> {
        if !pkt.checksum_ok() {
            return Err(Status::ChecksumMismatch);
        }
        match pkt.cmd() {
            commands::CONNECT => Ok(Request::Connect),
            commands::READ_CONFIG => Ok(Request::ReadConfig),
            commands::WRITE_CONFIG => Ok(Request::WriteConfig {
                config: [pkt.payload_u32(0), pkt.payload_u32(4)],
            }),
            commands::ERASE => Ok(Request::Erase {
                addr: pkt.payload_u32(0),
                len: pkt.payload_u32(4),
            }),
            commands::PROGRAM => {
                let total_len = pkt.payload_u32(4);
                let first = (total_len as usize).min(FIRST_CHUNK);
                Ok(Request::Program {
                    addr: pkt.payload_u32(0),
                    total_len,
                    data: pkt.payload()[8..8 + first].to_vec(),
                })
            }
            commands::READ => Ok(Request::Read {
                addr: pkt.payload_u32(0),
                len: pkt.payload_u32(4),
            }),
            commands::RESET_OR_RUN => Ok(Request::ResetOrRun {
                reset: pkt.payload()[0] != 0,
            }),
            commands::CONTINUE => Ok(Request::Continue {
                data: pkt.payload().to_vec(),
            }),
            _ => Err(Status::UnknownCommand),
        }
    }

    /// Host-side encoding, used by the demo mode and by tests driving a
    /// session through a transport.
    pub fn into_raw(self, seq: u16) -> Result<[u8; MAX_PACKET_SIZE]> {
        let (cmd, payload) = match self {
            Request::Connect => (commands::CONNECT, Vec::new()),
            Request::ReadConfig => (commands::READ_CONFIG, Vec::new()),
            Request::WriteConfig { config } => {
                let mut p = vec![0u8; 8];
                p.pwrite_with(config[0], 0, scroll::LE)?;
                p.pwrite_with(config[1], 4, scroll::LE)?;
                (commands::WRITE_CONFIG, p)
            }
            Request::Erase { addr, len } => {
                let mut p = vec![0u8; 8];
                p.pwrite_with(addr, 0, scroll::LE)?;
                p.pwrite_with(len, 4, scroll::LE)?;
                (commands::ERASE, p)
            }
            Request::Program {
                addr,
                total_len,
                data,
            } => {
                anyhow::ensure!(data.len() <= FIRST_CHUNK, "first program chunk too long");
                let mut p = vec![0u8; 8 + data.len()];
                p.pwrite_with(addr, 0, scroll::LE)?;
                p.pwrite_with(total_len, 4, scroll::LE)?;
                p[8..].copy_from_slice(&data);
                (commands::PROGRAM, p)
            }
            Request::Read { addr, len } => {
                let mut p = vec![0u8; 8];
                p.pwrite_with(addr, 0, scroll::LE)?;
                p.pwrite_with(len, 4, scroll::LE)?;
                (commands::READ, p)
            }
            Request::ResetOrRun { reset } => (commands::RESET_OR_RUN, vec![reset as u8]),
            Request::Continue { data } => (commands::CONTINUE, data),
        };
        encode(cmd, 0, seq, &payload)
    }
}

/// Reply to one request packet.
#[derive(Clone, PartialEq, Eq)]
pub struct Reply {
    cmd: u8,
    status: Status,
    seq: u16,
    payload: Vec<u8>,
}

impl Reply {
    pub fn ok(cmd: u8, seq: u16) -> Reply {
        Reply::with_payload(cmd, seq, Vec::new())
    }

    pub fn with_payload(cmd: u8, seq: u16, payload: Vec<u8>) -> Reply {
        Reply {
            cmd,
            status: Status::Ok,
            seq,
            payload,
        }
    }

    pub fn err(cmd: u8, seq: u16, status: Status) -> Reply {
        Reply {
            cmd,
            status,
            seq,
            payload: Vec::new(),
        }
    }

    pub fn cmd(&self) -> u8 {
        self.cmd
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn seq(&self) -> u16 {
        self.seq
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn to_raw(&self) -> Result<[u8; MAX_PACKET_SIZE]> {
        encode(self.cmd, self.status.code(), self.seq, &self.payload)
    }

    /// Host-side decoding of a reply packet.
    pub fn from_raw(raw: &[u8]) -> Result<Reply> {
        let pkt = Packet::from_raw(raw);
        anyhow::ensure!(pkt.checksum_ok(), "reply checksum mismatch");
        let status = Status::from_code(pkt.raw[offsets::STATUS])
            .ok_or_else(|| anyhow::anyhow!("unknown status code 0x{:02x}", pkt.raw[1]))?;
        Ok(Reply {
            cmd: pkt.cmd(),
            status,
            seq: pkt.seq(),
            payload: pkt.payload().to_vec(),
        })
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Status::Ok => write!(f, "OK[{}]", hex::encode(&self.payload)),
            s => write!(f, "ERROR({:?})", s),
        }
    }
}

fn encode(cmd: u8, status: u8, seq: u16, payload: &[u8]) -> Result<[u8; MAX_PACKET_SIZE]> {
    anyhow::ensure!(
        payload.len() <= MAX_PAYLOAD,
        "payload of {} bytes exceeds packet capacity",
        payload.len()
    );
    let mut raw = [0u8; MAX_PACKET_SIZE];
    raw[offsets::CMD] = cmd;
    raw[offsets::STATUS] = status;
    raw.pwrite_with(seq, offsets::SEQ, scroll::LE)?;
    raw[offsets::PAYLOAD..offsets::PAYLOAD + payload.len()].copy_from_slice(payload);
    let sum = checksum(&raw[offsets::PAYLOAD..]);
    raw.pwrite_with(sum, offsets::CHECKSUM, scroll::LE)?;
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erase_fields_are_little_endian() {
        let raw = Request::Erase {
            addr: 0x0001_1000,
            len: 0x200,
        }
        .into_raw(7)
        .unwrap();
        assert_eq!(raw[0], commands::ERASE);
        assert_eq!(&raw[2..4], &7u16.to_le_bytes());
        assert_eq!(&raw[6..10], &0x0001_1000u32.to_le_bytes());
        assert_eq!(&raw[10..14], &0x200u32.to_le_bytes());

        let pkt = Packet::from_raw(&raw);
        assert_eq!(
            Request::from_packet(&pkt),
            Ok(Request::Erase {
                addr: 0x0001_1000,
                len: 0x200
            })
        );
    }

    #[test]
    fn corrupted_payload_is_a_checksum_mismatch() {
        let mut raw = Request::Erase { addr: 0, len: 64 }.into_raw(1).unwrap();
        raw[10] ^= 0xff;
        let pkt = Packet::from_raw(&raw);
        assert_eq!(Request::from_packet(&pkt), Err(Status::ChecksumMismatch));
    }

    #[test]
    fn unknown_command_code_is_rejected() {
        let mut raw = [0u8; MAX_PACKET_SIZE];
        raw[0] = 0xff;
        let pkt = Packet::from_raw(&raw);
        assert_eq!(Request::from_packet(&pkt), Err(Status::UnknownCommand));
    }

    #[test]
    fn program_first_chunk_is_clipped_to_total_len() {
        let raw = Request::Program {
            addr: 0x1000,
            total_len: 4,
            data: vec![0xaa; 4],
        }
        .into_raw(2)
        .unwrap();
        let pkt = Packet::from_raw(&raw);
        match Request::from_packet(&pkt).unwrap() {
            Request::Program {
                addr,
                total_len,
                data,
            } => {
                assert_eq!(addr, 0x1000);
                assert_eq!(total_len, 4);
                assert_eq!(data, vec![0xaa; 4]);
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn short_report_is_zero_padded() {
        let pkt = Packet::from_raw(&[commands::CONNECT, 0, 0, 0, 0, 0]);
        assert_eq!(pkt.as_bytes().len(), MAX_PACKET_SIZE);
        assert_eq!(Request::from_packet(&pkt), Ok(Request::Connect));
    }

    #[test]
    fn reply_round_trips_through_raw() {
        let reply = Reply::with_payload(commands::READ, 3, vec![1, 2, 3]);
        let raw = reply.to_raw().unwrap();
        let back = Reply::from_raw(&raw).unwrap();
        assert_eq!(back.cmd(), commands::READ);
        assert_eq!(back.seq(), 3);
        assert!(back.status().is_ok());
        assert_eq!(&back.payload()[..3], &[1, 2, 3]);
    }
}
