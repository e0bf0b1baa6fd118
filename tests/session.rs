//! End to end sessions over a scripted serial port

use std::convert::Infallible;

use stk500v2_boot::sim::{NoDelay, ScriptedPort, SimDevice, SimLed};
use stk500v2_boot::{
    Bootloader, Decoder, DeviceConfig, Exit, Frame, Operation, Options, ReplayOutcome, RetainedMemory,
    SelfUpdateDescriptor, StatusDisplay, UpdateFlags,
};

#[derive(Debug, Default)]
struct RecordingDisplay {
    splash: u32,
    banner: u32,
    frames: Vec<u8>,
    progress: Vec<(Operation, u8)>,
}

impl StatusDisplay for RecordingDisplay {
    fn show_splash(&mut self) {
        self.splash += 1;
    }

    fn show_updating_banner(&mut self) {
        self.banner += 1;
    }

    fn show_idle_animation_frame(&mut self, frame: u8) {
        self.frames.push(frame);
    }

    fn show_progress(&mut self, kind: Operation, percent: u8) {
        self.progress.push((kind, percent));
    }
}

type TestBootloader = Bootloader<ScriptedPort, NoDelay, SimDevice, SimLed, RecordingDisplay, Infallible>;

fn options() -> Options {
    Options {
        poll_delay_us: 1000,
        boot_timeout_ms: 20,
        blink_period_ms: 5,
        receive_timeout_ms: 10,
        exit_delay_ms: 0,
    }
}

fn bootloader(port: ScriptedPort, mcu: SimDevice) -> TestBootloader {
    let config = mcu.config().clone();
    Bootloader::new(port, NoDelay, mcu, SimLed::default(), RecordingDisplay::default(), config, options())
}

/// Host side of a session, frames requests with increasing sequence numbers
struct Host {
    seq: u8,
    port: ScriptedPort,
}

impl Host {
    fn new() -> Self {
        Self {
            seq: 0,
            port: ScriptedPort::new(),
        }
    }

    fn send(&mut self, payload: &[u8]) -> &mut Self {
        self.seq = self.seq.wrapping_add(1);
        self.port.push(&Frame::new(self.seq, payload.to_vec()).encode());
        self
    }

    fn load_address(&mut self, byte_address: u32) -> &mut Self {
        let w = (byte_address >> 1).to_be_bytes();
        self.send(&[0x06, w[0], w[1], w[2], w[3]])
    }

    fn program_flash(&mut self, data: &[u8]) -> &mut Self {
        let len = (data.len() as u16).to_be_bytes();
        let mut r = vec![0x13, len[0], len[1], 0xC1, 0x0A, 0x40, 0x4C, 0x20, 0x00, 0x00];
        r.extend_from_slice(data);
        self.send(&r)
    }

    fn read_flash(&mut self, len: u16) -> &mut Self {
        let len = len.to_be_bytes();
        self.send(&[0x14, len[0], len[1], 0x20])
    }

    fn upload_size(&mut self, size: u32) -> &mut Self {
        let s = size.to_le_bytes();
        self.send(&[0x55, s[0], s[1], s[2]])
    }

    fn leave(&mut self) -> ScriptedPort {
        self.send(&[0x11, 0x01, 0x01]);
        std::mem::take(&mut self.port)
    }
}

fn replies(tx: &[u8]) -> Vec<Frame> {
    let mut d = Decoder::new();
    tx.iter().filter_map(|b| d.feed(*b)).collect()
}

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 256) as u8).collect()
}

#[test]
fn sign_on_and_unknown_opcode() {
    let mut host = Host::new();
    host.send(&[0x01]).send(&[0x7F, 0x01, 0x02]);
    let port = host.leave();

    let mut b = bootloader(port, SimDevice::new(DeviceConfig::atmega2560()));
    assert_eq!(b.start().unwrap(), Exit::Leave);

    let r = replies(&b.port().tx);
    assert_eq!(r.len(), 3);
    assert_eq!(r[0], Frame::new(1, b"\x01\x00\x08AVRISP_2".to_vec()));
    assert_eq!(r[1], Frame::new(2, vec![0x7F, 0xC0]));
    assert_eq!(r[2], Frame::new(3, vec![0x11, 0x00]));

    assert_eq!(b.display().splash, 1);
    assert_eq!(b.display().banner, 1);
}

#[test]
fn noise_and_corrupt_frames_get_no_reply() {
    let mut port = ScriptedPort::new();
    port.push(&[0x00, 0x55, 0xFF]);

    let mut bad = Frame::new(1, vec![0x01]).encode();
    let last = bad.len() - 1;
    bad[last] ^= 0x01;
    port.push(&bad);

    port.push(&Frame::new(2, vec![0x01]).encode());
    port.push(&Frame::new(3, vec![0x11]).encode());

    let mut b = bootloader(port, SimDevice::new(DeviceConfig::atmega328p()));
    assert_eq!(b.start().unwrap(), Exit::Leave);

    let r = replies(&b.port().tx);
    assert_eq!(r.len(), 2);
    assert_eq!(r[0].sequence, 2);
    assert_eq!(r[1].sequence, 3);
}

#[test]
fn full_application_write_and_verify() {
    let dev = SimDevice::new(DeviceConfig::atmega328p()).with_bootloader_image();
    let config = dev.config().clone();
    let boundary = config.protection_boundary() as usize;
    let page = config.page_size as usize;
    let boot = dev.flash()[boundary..].to_vec();

    let app = image(boundary);

    let mut host = Host::new();
    host.send(&[0x01]).send(&[0x10]).upload_size(app.len() as u32);

    for (i, chunk) in app.chunks(page).enumerate() {
        host.load_address((i * page) as u32).program_flash(chunk);
    }
    for i in 0..app.len() / page {
        host.load_address((i * page) as u32).read_flash(page as u16);
    }

    // One packet straight at the bootloader section
    host.load_address(boundary as u32).program_flash(&vec![0u8; page]);

    let port = host.leave();

    let mut b = bootloader(port, dev);
    assert_eq!(b.start().unwrap(), Exit::Leave);

    let r = replies(&b.port().tx);
    assert!(r.iter().all(|f| f.payload[1] == 0x00));

    let read_back: Vec<u8> = r
        .iter()
        .filter(|f| f.payload[0] == 0x14)
        .flat_map(|f| f.payload[2..f.payload.len() - 1].to_vec())
        .collect();
    assert_eq!(read_back, app);

    assert_eq!(&b.mcu().flash()[..boundary], &app[..]);
    assert_eq!(&b.mcu().flash()[boundary..], &boot[..]);
    assert!(b.application_present());

    let progress = &b.display().progress;
    assert_eq!(progress.first(), Some(&(Operation::Write, 0)));
    assert!(progress.contains(&(Operation::Write, 100)));
    assert_eq!(progress.last(), Some(&(Operation::Verify, 100)));
    assert!(b.display().frames.is_empty());
}

#[test]
fn idle_animation_without_upload_size() {
    let mut host = Host::new();
    for _ in 0..23 {
        host.send(&[0x03, 0x90]);
    }
    let port = host.leave();

    let mut b = bootloader(port, SimDevice::new(DeviceConfig::atmega328p()));
    assert_eq!(b.start().unwrap(), Exit::Leave);

    assert_eq!(b.display().frames, vec![1, 2]);
    assert!(b.display().progress.is_empty());
}

#[test]
fn watchdog_reset_applies_staged_update_then_boots_normally() {
    let mut dev = SimDevice::new(DeviceConfig::atmega328p()).with_bootloader_image();
    let config = dev.config().clone();

    let update = image(256);
    dev.write_ram(0x300, &update);
    SelfUpdateDescriptor::stage(0x300, 0x1000, 256, UpdateFlags::ERASE | UpdateFlags::COPY)
        .store(&mut dev, &config);
    dev.watchdog_reset();

    let mut b = bootloader(ScriptedPort::new(), dev);

    assert_eq!(b.start().unwrap(), Exit::Watchdog(ReplayOutcome::Applied { pages: 2 }));
    assert_eq!(&b.mcu().flash()[0x1000..0x1100], &update[..]);
    assert_eq!(b.port().polls, 0);

    // Descriptor is consumed, the next reset goes through the normal path
    assert!(!SelfUpdateDescriptor::load(b.mcu(), &config).is_valid());
    assert_eq!(b.start().unwrap(), Exit::BootTimeout);
}

#[test]
fn deferred_update_is_left_for_the_application() {
    let mut dev = SimDevice::new(DeviceConfig::atmega2560());
    let config = dev.config().clone();

    let staged = SelfUpdateDescriptor::stage(0x300, 0, 256, UpdateFlags::COPY | UpdateFlags::DEFER_RUN);
    staged.store(&mut dev, &config);
    dev.watchdog_reset();

    let mut b = bootloader(ScriptedPort::new(), dev);
    assert_eq!(b.start().unwrap(), Exit::Watchdog(ReplayOutcome::Deferred));
    assert_eq!(SelfUpdateDescriptor::load(b.mcu(), &config), staged);
    assert!(b.mcu().written_pages().is_empty());
}
