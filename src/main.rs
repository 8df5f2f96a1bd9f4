use std::path::PathBuf;
use std::thread;

use anyhow::Result;
use clap::Parser;

use nuisp::constants::{FIRMWARE_VERSION, FIRST_CHUNK, MAX_PAYLOAD};
use nuisp::session::Platform;
use nuisp::transport::{SerialTransport, mailbox};
use nuisp::{DeviceInfo, Dispatcher, ExitAction, MemFlash, PartDb, Request, Session};

#[derive(clap::Parser)]
#[clap(
    name = "nuisp",
    about = "Nuvoton ISP bootloader protocol, runnable off-hardware"
)]
enum Cli {
    /// Serve the ISP protocol on a serial port against an emulated flash
    Serve {
        /// Serial port device, e.g. /dev/ttyUSB0
        port: String,
        #[clap(long, default_value_t = 115200)]
        baudrate: u32,
        /// Part name from the device database
        #[clap(long, default_value = "NUC126")]
        part: String,
        /// APROM backing file, loaded at start and flushed back at exit
        #[clap(long)]
        image: Option<PathBuf>,
    },
    /// List the parts in the device database
    Parts {},
    /// Run a scripted host/device exchange over the in-process transport
    Demo {},
}

/// Platform for running off-hardware: the trigger is considered held active
/// (ISP mode requested) until the host ends the session, the watchdog is a
/// no-op, and the exit paths only get logged.
struct HostPlatform;

impl Platform for HostPlatform {
    fn trigger_active(&mut self) -> bool {
        true
    }

    fn exit(&mut self, action: ExitAction) -> Result<()> {
        match action {
            ExitAction::RunApplication => log::info!("would branch to the APROM image"),
            ExitAction::SystemReset => log::info!("would pull the system reset"),
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    let _ = simplelog::TermLogger::init(
        simplelog::LevelFilter::Debug,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    match Cli::parse() {
        Cli::Serve {
            port,
            baudrate,
            part,
            image,
        } => serve(&port, baudrate, &part, image),
        Cli::Parts {} => {
            let db = PartDb::load()?;
            for family in &db.families {
                println!("{}: {}", family.name, family.description);
                for part in &family.parts {
                    println!(
                        "  {} (APROM {}K, page {}B)",
                        part,
                        part.aprom_size / 1024,
                        part.page_size
                    );
                }
            }
            Ok(())
        }
        Cli::Demo {} => demo(),
    }
}

fn serve(port: &str, baudrate: u32, part_name: &str, image: Option<PathBuf>) -> Result<()> {
    let part = PartDb::find(part_name)?;
    log::info!("serving ISP session as {}", part);

    let flash = match &image {
        Some(path) if path.exists() => {
            let raw = std::fs::read(path)?;
            log::info!("seeded APROM with {} bytes from {}", raw.len(), path.display());
            MemFlash::with_image(part.geometry(), &raw)
        }
        _ => MemFlash::new(part.geometry()),
    };
    let dispatcher = Dispatcher::new(
        flash,
        DeviceInfo {
            device_id: part.device_id,
            firmware_version: FIRMWARE_VERSION,
        },
    );
    let transport = SerialTransport::open(port, baudrate)?;

    let mut session = Session::new(transport, dispatcher, HostPlatform);
    let action = session.run()?;
    log::info!("session ended: {:?}", action);

    let (_, dispatcher, mut platform) = session.into_parts();
    if let Some(path) = image {
        std::fs::write(&path, dispatcher.flash().aprom_image())?;
        log::info!("APROM image flushed to {}", path.display());
    }
    platform.exit(action)
}

fn demo() -> Result<()> {
    let part = PartDb::find("NUC126")?;
    let (device, host) = mailbox::pair();
    let dispatcher = Dispatcher::new(
        MemFlash::new(part.geometry()),
        DeviceInfo {
            device_id: part.device_id,
            firmware_version: FIRMWARE_VERSION,
        },
    );
    let session = Session::new(device, dispatcher, HostPlatform);
    let worker = thread::spawn(move || session.run_to_exit());

    let reply = host.transfer(Request::Connect, 1)?;
    anyhow::ensure!(reply.status().is_ok(), "connect failed: {:?}", reply);
    log::info!("connected: {:?}", reply);

    let reply = host.transfer(
        Request::Erase {
            addr: 0x1000,
            len: 0x200,
        },
        2,
    )?;
    anyhow::ensure!(reply.status().is_ok(), "erase failed: {:?}", reply);

    let image = vec![0xaa; 64];
    let reply = host.transfer(
        Request::Program {
            addr: 0x1000,
            total_len: image.len() as u32,
            data: image[..FIRST_CHUNK].to_vec(),
        },
        3,
    )?;
    anyhow::ensure!(reply.status().is_ok(), "program failed: {:?}", reply);
    let reply = host.transfer(
        Request::Continue {
            data: image[FIRST_CHUNK..].to_vec(),
        },
        4,
    )?;
    anyhow::ensure!(reply.status().is_ok(), "program data phase failed: {:?}", reply);

    let reply = host.transfer(
        Request::Read {
            addr: 0x1000,
            len: image.len() as u32,
        },
        5,
    )?;
    anyhow::ensure!(reply.status().is_ok(), "read failed: {:?}", reply);
    let mut readback = reply.payload()[..MAX_PAYLOAD.min(image.len())].to_vec();
    let reply = host.transfer(Request::Continue { data: Vec::new() }, 6)?;
    anyhow::ensure!(reply.status().is_ok(), "read data phase failed: {:?}", reply);
    readback.extend_from_slice(&reply.payload()[..image.len() - MAX_PAYLOAD]);
    anyhow::ensure!(readback == image, "read back different data than programmed");
    log::info!("programmed and verified {} bytes at 0x1000", image.len());

    let reply = host.transfer(Request::ResetOrRun { reset: false }, 7)?;
    anyhow::ensure!(reply.status().is_ok(), "reset_or_run failed: {:?}", reply);

    worker
        .join()
        .map_err(|_| anyhow::anyhow!("session thread panicked"))??;
    log::info!("demo finished");
    Ok(())
}
