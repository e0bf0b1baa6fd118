#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use indicatif::{ProgressBar, ProgressStyle};

use stk500v2_boot::sim::SimDevice;
use stk500v2_boot::{Bootloader, DeviceConfig, Exit, Operation, Options, StatusDisplay};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to serve the bootloader on
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    /// Emulated part (atmega2560, atmega1284p, atmega328p)
    #[structopt(long, default_value = "atmega2560")]
    device: String,

    /// Raw flash image, loaded at start and saved after each session
    #[structopt(long)]
    flash: Option<PathBuf>,

    /// Raw EEPROM image, loaded at start and saved after each session
    #[structopt(long)]
    eeprom: Option<PathBuf>,

    /// Start as if from a watchdog reset
    #[structopt(long)]
    watchdog: bool,

    /// Exit after the first session instead of simulating a reset
    #[structopt(long)]
    once: bool,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

/// Console status display, progress is shown on a progress bar
#[derive(Default)]
struct ConsoleDisplay {
    bar: Option<(Operation, ProgressBar)>,
}

impl ConsoleDisplay {
    fn finish(&mut self) {
        if let Some((_, bar)) = self.bar.take() {
            bar.finish();
        }
    }
}

impl StatusDisplay for ConsoleDisplay {
    fn show_splash(&mut self) {
        info!("Bootloader waiting for host");
    }

    fn show_updating_banner(&mut self) {
        info!("Do not disconnect, upgrading firmware");
    }

    fn show_idle_animation_frame(&mut self, frame: u8) {
        trace!("Idle frame {}", frame);
    }

    fn show_progress(&mut self, kind: Operation, percent: u8) {
        match &self.bar {
            Some((k, _)) if *k == kind => (),
            _ => {
                self.finish();

                let bar = ProgressBar::new(100);
                bar.set_style(ProgressStyle::default_bar().template("{msg:8} [{bar:40}] {pos:>3}%"));
                bar.set_message(match kind {
                    Operation::Verify => "Verify",
                    _ => "Write",
                });

                self.bar = Some((kind, bar));
            }
        }

        if let Some((_, bar)) = &self.bar {
            bar.set_position(percent as u64);
        }
    }
}

fn load_image(path: &Path) -> anyhow::Result<Option<Vec<u8>>> {
    if !path.exists() {
        return Ok(None);
    }

    let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    info!("Loaded {} from {}", bytefmt::format(data.len() as u64), path.display());

    Ok(Some(data))
}

fn save_images(args: &Args, device: &SimDevice) -> anyhow::Result<()> {
    if let Some(p) = &args.flash {
        let app = &device.flash()[..device.config().protection_boundary() as usize];
        fs::write(p, app).with_context(|| format!("writing {}", p.display()))?;
        debug!("Saved flash image to {}", p.display());
    }

    if let Some(p) = &args.eeprom {
        fs::write(p, device.eeprom()).with_context(|| format!("writing {}", p.display()))?;
        debug!("Saved EEPROM image to {}", p.display());
    }

    Ok(())
}

fn run(args: Args) -> anyhow::Result<()> {
    let config = DeviceConfig::by_name(&args.device)
        .ok_or_else(|| anyhow!("unknown device '{}'", args.device))?;

    info!(
        "Emulating {} ({} flash, {} boot section, {} EEPROM)",
        args.device,
        bytefmt::format(config.flash_size as u64),
        bytefmt::format(config.boot_size as u64),
        bytefmt::format(config.eeprom_size as u64)
    );

    let mut device = SimDevice::new(config).with_bootloader_image();

    if let Some(p) = &args.flash {
        if let Some(data) = load_image(p)? {
            device.load_application(&data);
        }
    }

    if let Some(p) = &args.eeprom {
        if let Some(data) = load_image(p)? {
            device.load_eeprom(&data);
        }
    }

    if args.watchdog {
        device.watchdog_reset();
    }

    info!("Opening serial port {}", args.port);

    let mut b = Bootloader::linux(&args.port, args.baud, device, ConsoleDisplay::default(), args.options.clone())?;

    loop {
        let exit = b.start().map_err(|e| anyhow!("bootloader error: {:?}", e))?;

        match exit {
            Exit::BootTimeout => debug!("No host, simulating reset"),
            _ => info!("Session ended: {:?}", exit),
        }

        save_images(&args, b.mcu())?;

        if b.application_present() {
            info!("Application reset vector: {}", hex::encode(&b.mcu().flash()[..4]));
        } else {
            info!("No application present");
        }

        if args.once {
            break;
        }
    }

    Ok(())
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if let Err(e) = run(o) {
        error!("{:?}", e);
    }
}
