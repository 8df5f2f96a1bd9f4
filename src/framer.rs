//! Accumulation of transport bytes into fixed-size packets.

use std::time::{Duration, Instant};

use crate::constants::MAX_PACKET_SIZE;
use crate::protocol::Packet;

/// How long a partially received packet may sit in the buffer before the
/// framer gives up on it. The vendor firmware would wait forever; see the
/// timeout handling in the session loop.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(500);

/// Collects incoming bytes into 64-byte packets.
///
/// A UART delivers single bytes through [`Framer::feed`]; a HID-style
/// endpoint delivers whole reports through [`Framer::feed_report`]. Either
/// way a packet is complete once 64 bytes have accumulated; shorter reports
/// are zero-padded and left to the dispatcher to length-validate.
pub struct Framer {
    buf: [u8; MAX_PACKET_SIZE],
    head: usize,
    started_at: Option<Instant>,
    idle_timeout: Duration,
}

impl Default for Framer {
    fn default() -> Self {
        Framer::new(DEFAULT_IDLE_TIMEOUT)
    }
}

impl Framer {
    pub fn new(idle_timeout: Duration) -> Framer {
        Framer {
            buf: [0u8; MAX_PACKET_SIZE],
            head: 0,
            started_at: None,
            idle_timeout,
        }
    }

    /// Consumes one transport byte; returns the packet once complete.
    pub fn feed(&mut self, byte: u8) -> Option<Packet> {
        if self.head == 0 {
            self.started_at = Some(Instant::now());
        }
        self.buf[self.head] = byte;
        self.head += 1;
        if self.head == MAX_PACKET_SIZE {
            Some(self.take())
        } else {
            None
        }
    }

    /// Consumes a burst of bytes, as delivered by a whole-report transport.
    pub fn feed_report(&mut self, data: &[u8]) -> Option<Packet> {
        let mut done = None;
        for &b in data {
            if let Some(pkt) = self.feed(b) {
                done = Some(pkt);
                // Anything past a packet boundary belongs to the next one.
            }
        }
        done
    }

    /// True while a partial packet is buffered.
    pub fn mid_packet(&self) -> bool {
        self.head > 0
    }

    /// Checks whether a partial packet has been sitting longer than the idle
    /// window. On expiry the partial bytes are discarded and the caller is
    /// expected to report `TransportTimeout` to the host.
    pub fn poll_timeout(&mut self) -> bool {
        match self.started_at {
            Some(t0) if self.head > 0 && t0.elapsed() >= self.idle_timeout => {
                log::warn!("discarding {} stale bytes of a partial packet", self.head);
                self.reset();
                true
            }
            _ => false,
        }
    }

    pub fn reset(&mut self) {
        self.head = 0;
        self.started_at = None;
    }

    fn take(&mut self) -> Packet {
        let pkt = Packet::from_raw(&self.buf);
        self.reset();
        pkt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::commands;

    #[test]
    fn bytes_accumulate_into_one_packet() {
        let mut framer = Framer::default();
        let mut raw = [0u8; MAX_PACKET_SIZE];
        raw[0] = commands::CONNECT;
        for &b in &raw[..MAX_PACKET_SIZE - 1] {
            assert!(framer.feed(b).is_none());
        }
        let pkt = framer.feed(raw[MAX_PACKET_SIZE - 1]).unwrap();
        assert_eq!(pkt.cmd(), commands::CONNECT);
        assert!(!framer.mid_packet());
    }

    #[test]
    fn report_longer_than_a_packet_keeps_the_tail() {
        let mut framer = Framer::default();
        let mut report = vec![0u8; MAX_PACKET_SIZE + 3];
        report[0] = commands::READ_CONFIG;
        let pkt = framer.feed_report(&report).unwrap();
        assert_eq!(pkt.cmd(), commands::READ_CONFIG);
        assert_eq!(framer.mid_packet(), true);
    }

    #[test]
    fn stale_partial_packet_times_out() {
        let mut framer = Framer::new(Duration::from_millis(0));
        assert!(framer.feed(0xaa).is_none());
        assert!(framer.poll_timeout());
        assert!(!framer.mid_packet());
        // Nothing buffered, nothing to time out.
        assert!(!framer.poll_timeout());
    }
}
