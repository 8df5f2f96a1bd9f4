//! Single-slot in-process transport, modeling the USB HID endpoint pair.
//!
//! The original firmware's receive interrupt stores one report into a shared
//! buffer and raises a data-ready flag; if the main loop has not consumed
//! the previous report yet, the newest report wins. This module reproduces
//! that shape with one mailbox per direction: a mutex-guarded slot plus an
//! atomic ready flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;

use super::Transport;
use crate::constants::MAX_PACKET_SIZE;
use crate::protocol::{Reply, Request};

const DEVICE_POLL: Duration = Duration::from_millis(20);

struct Mailbox {
    slot: Mutex<Option<[u8; MAX_PACKET_SIZE]>>,
    ready: AtomicBool,
    bell: Condvar,
}

impl Mailbox {
    fn new() -> Arc<Mailbox> {
        Arc::new(Mailbox {
            slot: Mutex::new(None),
            ready: AtomicBool::new(false),
            bell: Condvar::new(),
        })
    }

    /// Stores a report, replacing any unconsumed one.
    fn put(&self, report: [u8; MAX_PACKET_SIZE]) -> Result<()> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| anyhow::anyhow!("mailbox poisoned"))?;
        if slot.is_some() {
            log::debug!("mailbox overwriting an unconsumed report");
        }
        *slot = Some(report);
        self.ready.store(true, Ordering::Release);
        self.bell.notify_all();
        Ok(())
    }

    /// Takes the pending report, waiting up to `timeout` for one to arrive.
    fn take(&self, timeout: Duration) -> Result<Option<[u8; MAX_PACKET_SIZE]>> {
        if !self.ready.load(Ordering::Acquire) && timeout.is_zero() {
            return Ok(None);
        }
        let deadline = Instant::now() + timeout;
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| anyhow::anyhow!("mailbox poisoned"))?;
        // Condvar waits can wake spuriously; keep waiting until a report
        // lands or the deadline passes.
        while slot.is_none() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            let (guard, _) = self
                .bell
                .wait_timeout(slot, left)
                .map_err(|_| anyhow::anyhow!("mailbox poisoned"))?;
            slot = guard;
        }
        let report = slot.take();
        if report.is_some() {
            self.ready.store(false, Ordering::Release);
        }
        Ok(report)
    }
}

/// Creates a connected device/host transport pair.
pub fn pair() -> (MailboxTransport, MailboxHost) {
    let to_device = Mailbox::new();
    let to_host = Mailbox::new();
    (
        MailboxTransport {
            rx: to_device.clone(),
            tx: to_host.clone(),
        },
        MailboxHost {
            tx: to_device,
            rx: to_host,
        },
    )
}

/// Device end: polled by the session loop.
pub struct MailboxTransport {
    rx: Arc<Mailbox>,
    tx: Arc<Mailbox>,
}

impl Transport for MailboxTransport {
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.rx.take(DEVICE_POLL)? {
            Some(report) => {
                let n = report.len().min(buf.len());
                buf[..n].copy_from_slice(&report[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    fn send(&mut self, raw: &[u8]) -> Result<()> {
        let mut report = [0u8; MAX_PACKET_SIZE];
        let n = raw.len().min(MAX_PACKET_SIZE);
        report[..n].copy_from_slice(&raw[..n]);
        self.tx.put(report)
    }
}

/// Host end, used by the demo mode and by tests driving a session.
pub struct MailboxHost {
    tx: Arc<Mailbox>,
    rx: Arc<Mailbox>,
}

impl MailboxHost {
    pub fn send_report(&self, raw: &[u8]) -> Result<()> {
        let mut report = [0u8; MAX_PACKET_SIZE];
        let n = raw.len().min(MAX_PACKET_SIZE);
        report[..n].copy_from_slice(&raw[..n]);
        self.tx.put(report)
    }

    pub fn recv_reply(&self, timeout: Duration) -> Result<[u8; MAX_PACKET_SIZE]> {
        self.rx
            .take(timeout)?
            .ok_or_else(|| anyhow::anyhow!("no reply within {:?}", timeout))
    }

    /// Request/reply round trip with command echo validation.
    pub fn transfer(&self, req: Request, seq: u16) -> Result<Reply> {
        let raw = req.into_raw(seq)?;
        log::debug!("=> {}", hex::encode(raw));
        self.send_report(&raw)?;

        let resp = self.recv_reply(Duration::from_secs(2))?;
        log::debug!("<= {}", hex::encode(resp));
        let reply = Reply::from_raw(&resp)?;
        anyhow::ensure!(raw[0] == reply.cmd(), "reply command type mismatch");
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newest_report_wins_when_unconsumed() {
        let (mut device, host) = pair();
        host.send_report(&[1u8; 8]).unwrap();
        host.send_report(&[2u8; 8]).unwrap();

        let mut buf = [0u8; MAX_PACKET_SIZE];
        let n = device.recv(&mut buf).unwrap();
        assert_eq!(n, MAX_PACKET_SIZE);
        assert_eq!(buf[0], 2);
        // Slot is empty again.
        assert_eq!(device.recv(&mut [0u8; 64]).unwrap(), 0);
    }

    #[test]
    fn recv_waits_out_a_late_reply() {
        let (mut device, host) = pair();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            device.send(&[0x42u8; 2]).unwrap();
        });
        let reply = host.recv_reply(Duration::from_secs(2)).unwrap();
        assert_eq!(reply[0], 0x42);
        worker.join().unwrap();
    }

    #[test]
    fn replies_cross_the_other_way() {
        let (mut device, host) = pair();
        device.send(&[0xabu8; 4]).unwrap();
        let reply = host.recv_reply(Duration::from_millis(100)).unwrap();
        assert_eq!(reply[0], 0xab);
        assert_eq!(reply[4], 0); // zero-padded to a full report
    }
}
