//! Command dispatch: one request packet in, one reply packet out, flash
//! mutation and the recorded exit action as the only other effects.

use crate::constants::MAX_PAYLOAD;
use crate::flash::{FlashGeometry, FlashOps};
use crate::protocol::{Packet, Reply, Request, Status};
use crate::session::ExitAction;

/// Identification returned by `Connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: u32,
    pub firmware_version: u32,
}

/// A program or read spanning more than one packet. A new non-Continue
/// command aborts whatever was in flight.
enum Transfer {
    Program {
        cursor: u32,
        remaining: usize,
        /// Sub-word tail carried between chunks so flash programming stays
        /// 4-byte aligned.
        pending: Vec<u8>,
    },
    Read {
        cursor: u32,
        remaining: usize,
    },
}

impl Transfer {
    fn remaining(&self) -> usize {
        match self {
            Transfer::Program { remaining, .. } => *remaining,
            Transfer::Read { remaining, .. } => *remaining,
        }
    }
}

pub struct Dispatcher<F: FlashOps> {
    flash: F,
    info: DeviceInfo,
    geometry: FlashGeometry,
    transfer: Option<Transfer>,
    exit: Option<ExitAction>,
}

impl<F: FlashOps> Dispatcher<F> {
    pub fn new(flash: F, info: DeviceInfo) -> Self {
        let geometry = flash.geometry();
        Dispatcher {
            flash,
            info,
            geometry,
            transfer: None,
            exit: None,
        }
    }

    /// Exit action requested by a `ResetOrRun`, if any. The session loop
    /// reads this only after the final reply went out.
    pub fn take_exit(&mut self) -> Option<ExitAction> {
        self.exit.take()
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn into_flash(self) -> F {
        self.flash
    }

    pub fn dispatch(&mut self, pkt: &Packet) -> Reply {
        let cmd = pkt.cmd();
        let seq = pkt.seq();
        let req = match Request::from_packet(pkt) {
            Ok(req) => req,
            Err(status) => {
                log::warn!("rejecting packet cmd=0x{:02x}: {:?}", cmd, status);
                return Reply::err(cmd, seq, status);
            }
        };

        if !matches!(req, Request::Continue { .. }) {
            self.transfer = None;
        }

        match req {
            Request::Connect => {
                log::info!("host connected, device 0x{:08x}", self.info.device_id);
                let mut payload = Vec::with_capacity(28);
                payload.extend_from_slice(&self.info.device_id.to_le_bytes());
                payload.extend_from_slice(&self.info.firmware_version.to_le_bytes());
                payload.extend_from_slice(&self.geometry.aprom.base.to_le_bytes());
                payload.extend_from_slice(&self.geometry.aprom.size.to_le_bytes());
                payload.extend_from_slice(&self.geometry.data_flash.base.to_le_bytes());
                payload.extend_from_slice(&self.geometry.data_flash.size.to_le_bytes());
                payload.extend_from_slice(&self.geometry.page_size.to_le_bytes());
                Reply::with_payload(cmd, seq, payload)
            }
            Request::ReadConfig => match self.flash.read_config() {
                Ok(cfg) => Reply::with_payload(cmd, seq, config_payload(cfg)),
                Err(e) => {
                    log::error!("read_config failed: {:#}", e);
                    Reply::err(cmd, seq, Status::FlashFailed)
                }
            },
            Request::WriteConfig { config } => match self.flash.write_config(config) {
                Ok(()) => Reply::with_payload(cmd, seq, config_payload(config)),
                Err(e) => {
                    log::error!("write_config failed: {:#}", e);
                    Reply::err(cmd, seq, Status::FlashFailed)
                }
            },
            Request::Erase { addr, len } => match self.erase(addr, len) {
                Ok(()) => Reply::ok(cmd, seq),
                Err(status) => Reply::err(cmd, seq, status),
            },
            Request::Program {
                addr,
                total_len,
                data,
            } => match self.start_program(addr, total_len, data) {
                Ok(()) => Reply::ok(cmd, seq),
                Err(status) => Reply::err(cmd, seq, status),
            },
            Request::Read { addr, len } => match self.start_read(addr, len) {
                Ok(chunk) => Reply::with_payload(cmd, seq, chunk),
                Err(status) => Reply::err(cmd, seq, status),
            },
            Request::ResetOrRun { reset } => {
                let action = if reset {
                    ExitAction::SystemReset
                } else {
                    ExitAction::RunApplication
                };
                log::info!("host requested session end: {:?}", action);
                self.exit = Some(action);
                Reply::ok(cmd, seq)
            }
            Request::Continue { data } => match self.continue_transfer(&data) {
                Ok(chunk) => Reply::with_payload(cmd, seq, chunk),
                Err(status) => {
                    self.transfer = None;
                    Reply::err(cmd, seq, status)
                }
            },
        }
    }

    fn erase(&mut self, addr: u32, len: u32) -> Result<(), Status> {
        // A zero-length erase touches nothing but still has to name a real
        // page, so the address is validated either way.
        if !self.geometry.page_aligned(addr)
            || !self.geometry.page_aligned(len)
            || !self.geometry.covers(addr, len.max(1))
        {
            log::warn!("erase 0x{:08x}+0x{:x} out of range", addr, len);
            return Err(Status::OutOfRange);
        }
        // Stepping by offset keeps `addr + len` out of the loop condition;
        // for a region ending at the top of the address space it would wrap.
        let mut offset = 0;
        while offset < len {
            let page = addr + offset;
            self.flash.erase_page(page).map_err(|e| {
                log::error!("erase of page 0x{:08x} failed: {:#}", page, e);
                Status::FlashFailed
            })?;
            offset += self.geometry.page_size;
        }
        Ok(())
    }

    fn start_program(&mut self, addr: u32, total_len: u32, data: Vec<u8>) -> Result<(), Status> {
        if addr % 4 != 0 || !self.geometry.covers(addr, total_len) {
            log::warn!("program 0x{:08x}+0x{:x} out of range", addr, total_len);
            return Err(Status::OutOfRange);
        }
        let mut transfer = Transfer::Program {
            cursor: addr,
            remaining: total_len as usize,
            pending: Vec::new(),
        };
        self.feed_program(&mut transfer, &data)?;
        if transfer.remaining() > 0 {
            self.transfer = Some(transfer);
        }
        Ok(())
    }

    fn start_read(&mut self, addr: u32, len: u32) -> Result<Vec<u8>, Status> {
        if !self.geometry.covers(addr, len) {
            log::warn!("read 0x{:08x}+0x{:x} out of range", addr, len);
            return Err(Status::OutOfRange);
        }
        let mut transfer = Transfer::Read {
            cursor: addr,
            remaining: len as usize,
        };
        let chunk = self.read_chunk(&mut transfer)?;
        if transfer.remaining() > 0 {
            self.transfer = Some(transfer);
        }
        Ok(chunk)
    }

    fn continue_transfer(&mut self, data: &[u8]) -> Result<Vec<u8>, Status> {
        let mut transfer = match self.transfer.take() {
            Some(t) => t,
            // Nothing in flight: a Continue here is as alien as any
            // unassigned command code.
            None => return Err(Status::UnknownCommand),
        };
        let out = if matches!(transfer, Transfer::Program { .. }) {
            let take = transfer.remaining().min(data.len());
            self.feed_program(&mut transfer, &data[..take])?;
            Vec::new()
        } else {
            self.read_chunk(&mut transfer)?
        };
        if transfer.remaining() > 0 {
            self.transfer = Some(transfer);
        }
        Ok(out)
    }

    /// Programs the word-aligned prefix of the buffered data, keeping any
    /// sub-word tail for the next chunk. The tail is flushed 0xFF-padded
    /// when the transfer completes.
    fn feed_program(&mut self, transfer: &mut Transfer, data: &[u8]) -> Result<(), Status> {
        let Transfer::Program {
            cursor,
            remaining,
            pending,
        } = transfer
        else {
            return Err(Status::UnknownCommand);
        };
        pending.extend_from_slice(data);
        *remaining -= data.len();

        let aligned = pending.len() & !3;
        if aligned > 0 {
            self.flash.program(*cursor, &pending[..aligned]).map_err(|e| {
                log::error!("program at 0x{:08x} failed: {:#}", cursor, e);
                Status::FlashFailed
            })?;
            *cursor += aligned as u32;
            pending.drain(..aligned);
        }

        if *remaining == 0 && !pending.is_empty() {
            let mut tail = pending.clone();
            tail.resize(4, 0xff);
            self.flash.program(*cursor, &tail).map_err(|e| {
                log::error!("program at 0x{:08x} failed: {:#}", cursor, e);
                Status::FlashFailed
            })?;
            *cursor += 4;
            pending.clear();
        }
        Ok(())
    }

    fn read_chunk(&mut self, transfer: &mut Transfer) -> Result<Vec<u8>, Status> {
        let Transfer::Read { cursor, remaining } = transfer else {
            return Err(Status::UnknownCommand);
        };
        let take = (*remaining).min(MAX_PAYLOAD);
        let mut chunk = vec![0u8; take];
        self.flash.read(*cursor, &mut chunk).map_err(|e| {
            log::error!("read at 0x{:08x} failed: {:#}", cursor, e);
            Status::FlashFailed
        })?;
        *cursor += take as u32;
        *remaining -= take;
        Ok(chunk)
    }
}

fn config_payload(cfg: [u32; 2]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8);
    payload.extend_from_slice(&cfg[0].to_le_bytes());
    payload.extend_from_slice(&cfg[1].to_le_bytes());
    payload
}
