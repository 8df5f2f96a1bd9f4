//! The bootloader main loop: trigger detection, packet dispatch, and the
//! terminal handoff to the application or a system reset.

use anyhow::Result;

use crate::constants::{MAX_PACKET_SIZE, commands};
use crate::dispatch::Dispatcher;
use crate::flash::FlashOps;
use crate::framer::Framer;
use crate::protocol::{Reply, Status};
use crate::transport::Transport;

/// The two ways out of ISP mode. Executed by the [`Platform`], never by the
/// state machine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    /// Branch to the application image in APROM.
    RunApplication,
    /// Force a full MCU reset through the system control block.
    SystemReset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingCommand,
    Executing,
    RepliedWaitingAck,
    Exiting,
}

/// Everything hardware-specific the loop needs: the trigger pin, the
/// watchdog, and the exit paths.
pub trait Platform {
    /// ISP trigger pin, sampled every loop iteration. ISP mode is entered
    /// while the pin is held active at boot and left as soon as it drops.
    fn trigger_active(&mut self) -> bool;

    /// Re-arms the hardware watchdog before each command execution, so a
    /// stalled flash operation ends in a clean reset instead of a hang.
    fn feed_watchdog(&mut self) {}

    /// Executes the terminal transition.
    fn exit(&mut self, action: ExitAction) -> Result<()>;
}

pub struct Session<T: Transport, F: FlashOps, P: Platform> {
    transport: T,
    dispatcher: Dispatcher<F>,
    platform: P,
    framer: Framer,
    state: SessionState,
}

impl<T: Transport, F: FlashOps, P: Platform> Session<T, F, P> {
    pub fn new(transport: T, dispatcher: Dispatcher<F>, platform: P) -> Self {
        Session::with_framer(transport, dispatcher, platform, Framer::default())
    }

    pub fn with_framer(
        transport: T,
        dispatcher: Dispatcher<F>,
        platform: P,
        framer: Framer,
    ) -> Self {
        Session {
            transport,
            dispatcher,
            platform,
            framer,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn dispatcher(&self) -> &Dispatcher<F> {
        &self.dispatcher
    }

    pub fn into_parts(self) -> (T, Dispatcher<F>, P) {
        (self.transport, self.dispatcher, self.platform)
    }

    /// Runs the ISP loop until an exit condition and returns the action to
    /// take. The reply to a `ResetOrRun` is written to the transport before
    /// this returns, so the host always sees the acknowledgment.
    pub fn run(&mut self) -> Result<ExitAction> {
        if !self.platform.trigger_active() {
            log::info!("trigger pin inactive, handing over to the application");
            self.state = SessionState::Exiting;
            return Ok(ExitAction::RunApplication);
        }

        log::info!("trigger pin active, entering ISP mode");
        self.state = SessionState::AwaitingCommand;
        let mut buf = [0u8; MAX_PACKET_SIZE];

        loop {
            if !self.platform.trigger_active() {
                log::info!("trigger released, leaving ISP mode");
                self.state = SessionState::Exiting;
                return Ok(ExitAction::RunApplication);
            }

            let n = self.transport.recv(&mut buf)?;
            let pkt = if n > 0 {
                self.framer.feed_report(&buf[..n])
            } else {
                None
            };

            match pkt {
                Some(pkt) => {
                    self.platform.feed_watchdog();
                    self.state = SessionState::Executing;
                    log::debug!("=> {}", hex::encode(pkt.as_bytes()));
                    let reply = self.dispatcher.dispatch(&pkt);
                    self.state = SessionState::RepliedWaitingAck;
                    self.send_reply(&reply)?;
                    self.state = SessionState::AwaitingCommand;

                    if let Some(action) = self.dispatcher.take_exit() {
                        self.state = SessionState::Exiting;
                        return Ok(action);
                    }
                }
                None => {
                    // The host stalled mid-packet: answer in the slot it is
                    // waiting on instead of hanging forever.
                    if self.framer.poll_timeout() {
                        let reply = Reply::err(commands::CONTINUE, 0, Status::TransportTimeout);
                        self.send_reply(&reply)?;
                    }
                }
            }
        }
    }

    /// Runs the loop and hands the exit action to the platform.
    pub fn run_to_exit(mut self) -> Result<()> {
        let action = self.run()?;
        self.platform.exit(action)
    }

    fn send_reply(&mut self, reply: &Reply) -> Result<()> {
        let raw = reply.to_raw()?;
        log::debug!("<= {}", hex::encode(raw));
        self.transport.send(&raw)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use super::*;
    use crate::constants::status;
    use crate::dispatch::DeviceInfo;
    use crate::flash::{FlashGeometry, MemFlash, Region};
    use crate::protocol::Request;

    /// Replays a scripted list of incoming reports and records every reply.
    struct ScriptTransport {
        incoming: VecDeque<Vec<u8>>,
        sent: Vec<Vec<u8>>,
    }

    impl ScriptTransport {
        fn new(reports: Vec<Vec<u8>>) -> Self {
            ScriptTransport {
                incoming: reports.into(),
                sent: Vec::new(),
            }
        }
    }

    impl Transport for ScriptTransport {
        fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
            match self.incoming.pop_front() {
                Some(report) => {
                    let n = report.len().min(buf.len());
                    buf[..n].copy_from_slice(&report[..n]);
                    Ok(n)
                }
                None => Ok(0),
            }
        }

        fn send(&mut self, raw: &[u8]) -> Result<()> {
            self.sent.push(raw.to_vec());
            Ok(())
        }
    }

    /// Trigger stays active for a fixed number of samples.
    struct TestPlatform {
        trigger_samples: usize,
        watchdog_feeds: usize,
    }

    impl TestPlatform {
        fn active_for(samples: usize) -> Self {
            TestPlatform {
                trigger_samples: samples,
                watchdog_feeds: 0,
            }
        }
    }

    impl Platform for TestPlatform {
        fn trigger_active(&mut self) -> bool {
            if self.trigger_samples == 0 {
                return false;
            }
            self.trigger_samples -= 1;
            true
        }

        fn feed_watchdog(&mut self) {
            self.watchdog_feeds += 1;
        }

        fn exit(&mut self, _action: ExitAction) -> Result<()> {
            Ok(())
        }
    }

    fn session(
        reports: Vec<Vec<u8>>,
        platform: TestPlatform,
    ) -> Session<ScriptTransport, MemFlash, TestPlatform> {
        let geometry = FlashGeometry {
            aprom: Region {
                base: 0,
                size: 0x8000,
            },
            data_flash: Region {
                base: 0x1f000,
                size: 0x1000,
            },
            page_size: 0x200,
        };
        let dispatcher = Dispatcher::new(
            MemFlash::new(geometry),
            DeviceInfo {
                device_id: 0x1234,
                firmware_version: 1,
            },
        );
        Session::new(ScriptTransport::new(reports), dispatcher, platform)
    }

    fn raw(req: Request, seq: u16) -> Vec<u8> {
        req.into_raw(seq).unwrap().to_vec()
    }

    #[test]
    fn inactive_trigger_skips_isp_mode_entirely() {
        let mut s = session(vec![raw(Request::Connect, 1)], TestPlatform::active_for(0));
        let action = s.run().unwrap();
        assert_eq!(action, ExitAction::RunApplication);
        assert_eq!(s.state(), SessionState::Exiting);
        let (transport, _, platform) = s.into_parts();
        // Never even looked at the wire.
        assert!(transport.sent.is_empty());
        assert_eq!(transport.incoming.len(), 1);
        assert_eq!(platform.watchdog_feeds, 0);
    }

    #[test]
    fn reset_reply_is_sent_before_the_session_ends() {
        let mut s = session(
            vec![
                raw(Request::Connect, 1),
                raw(Request::ResetOrRun { reset: true }, 2),
            ],
            TestPlatform::active_for(100),
        );
        let action = s.run().unwrap();
        assert_eq!(action, ExitAction::SystemReset);

        let (transport, _, platform) = s.into_parts();
        assert_eq!(transport.sent.len(), 2);
        let last = transport.sent.last().unwrap();
        assert_eq!(last[1], status::OK);
        assert_eq!(platform.watchdog_feeds, 2);
    }

    #[test]
    fn released_trigger_hands_over_to_the_application() {
        let mut s = session(
            vec![raw(Request::Connect, 1)],
            TestPlatform::active_for(3), // entry check + two loop iterations
        );
        let action = s.run().unwrap();
        assert_eq!(action, ExitAction::RunApplication);
        let (transport, _, _) = s.into_parts();
        assert_eq!(transport.sent.len(), 1); // the connect got its reply
    }

    #[test]
    fn unknown_command_keeps_the_session_alive() {
        let mut bogus = vec![0u8; MAX_PACKET_SIZE];
        bogus[0] = 0xff;
        let mut s = session(
            vec![
                bogus,
                raw(Request::ResetOrRun { reset: false }, 2),
            ],
            TestPlatform::active_for(100),
        );
        let action = s.run().unwrap();
        assert_eq!(action, ExitAction::RunApplication);
        let (transport, _, _) = s.into_parts();
        assert_eq!(transport.sent.len(), 2);
        assert_eq!(transport.sent[0][1], status::UNKNOWN_COMMAND);
    }

    #[test]
    fn stalled_partial_packet_is_answered_with_a_timeout() {
        let mut s = Session::with_framer(
            ScriptTransport::new(vec![vec![0xaa; 10]]), // 10 of 64 bytes, then silence
            Dispatcher::new(
                MemFlash::new(FlashGeometry {
                    aprom: Region {
                        base: 0,
                        size: 0x8000,
                    },
                    data_flash: Region {
                        base: 0x1f000,
                        size: 0x1000,
                    },
                    page_size: 0x200,
                }),
                DeviceInfo {
                    device_id: 0x1234,
                    firmware_version: 1,
                },
            ),
            TestPlatform::active_for(4),
            Framer::new(Duration::from_millis(0)),
        );
        let action = s.run().unwrap();
        assert_eq!(action, ExitAction::RunApplication);
        let (transport, _, _) = s.into_parts();
        assert_eq!(transport.sent.len(), 1);
        assert_eq!(transport.sent[0][1], status::TRANSPORT_TIMEOUT);
    }

    #[test]
    fn run_to_exit_hands_the_action_to_the_platform() {
        let s = session(
            vec![raw(Request::ResetOrRun { reset: true }, 1)],
            TestPlatform::active_for(100),
        );
        s.run_to_exit().unwrap();
    }
}
