//! Simulated device
//!
//! An in-memory AVR with page-buffered flash, EEPROM, fuses, retained RAM and
//! a watchdog reset flag. Flash writes behave like the real part: a page write
//! can only clear bits, so writing without erasing first corrupts data.
//! Used by the test suite and by the host side emulator.

use std::collections::VecDeque;
use std::convert::Infallible;

use embedded_hal::blocking::delay::{DelayMs, DelayUs};
use embedded_hal::digital::v2::{OutputPin, ToggleableOutputPin};
use embedded_hal::serial::{Read, Write};

use crate::config::DeviceConfig;
use crate::hal::{ResetControl, RetainedMemory, SelfProgramming};
use crate::protocol::FuseSelector;

pub struct SimDevice {
    config: DeviceConfig,
    flash: Vec<u8>,
    page_buffer: Vec<u8>,
    eeprom: Vec<u8>,
    ram: Vec<u8>,
    /// Low fuse, lock bits, extended fuse, high fuse
    fuses: [u8; 4],
    watchdog_reset: bool,
    watchdog_enabled: bool,
    erased_pages: Vec<u32>,
    written_pages: Vec<u32>,
}

impl SimDevice {
    /// Create a blank device, flash and EEPROM erased
    pub fn new(config: DeviceConfig) -> Self {
        let page_size = config.page_size as usize;

        Self {
            flash: vec![0xFF; config.flash_size as usize],
            page_buffer: vec![0xFF; page_size],
            eeprom: vec![0xFF; config.eeprom_size as usize],
            ram: vec![0x00; config.ram_end as usize],
            fuses: [0xFF, 0xFF, 0xFD, 0xD8],
            watchdog_reset: false,
            watchdog_enabled: false,
            erased_pages: vec![],
            written_pages: vec![],
            config,
        }
    }

    /// Fill the boot section with a recognisable image
    pub fn with_bootloader_image(mut self) -> Self {
        let boundary = self.config.protection_boundary() as usize;
        for (i, b) in self.flash[boundary..].iter_mut().enumerate() {
            *b = (i as u8) ^ 0xB0;
        }
        self
    }

    /// Place an application image at address zero, bypassing the SPM model
    pub fn load_application(&mut self, image: &[u8]) {
        let len = image.len().min(self.config.protection_boundary() as usize);
        self.flash[..len].copy_from_slice(&image[..len]);
    }

    /// Replace EEPROM contents
    pub fn load_eeprom(&mut self, image: &[u8]) {
        let len = image.len().min(self.eeprom.len());
        self.eeprom[..len].copy_from_slice(&image[..len]);
    }

    /// Simulate a power cycle, retained RAM is lost
    pub fn power_cycle(&mut self) {
        self.ram.iter_mut().for_each(|b| *b = 0);
        self.watchdog_reset = false;
        self.watchdog_enabled = false;
    }

    /// Simulate a watchdog reset, retained RAM survives and the watchdog
    /// stays armed until the bootloader clears it
    pub fn watchdog_reset(&mut self) {
        self.watchdog_reset = true;
        self.watchdog_enabled = true;
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn flash(&self) -> &[u8] {
        &self.flash
    }

    pub fn eeprom(&self) -> &[u8] {
        &self.eeprom
    }

    pub fn lock_bits(&self) -> u8 {
        self.fuses[FuseSelector::LockBits as usize]
    }

    pub fn set_fuse(&mut self, selector: FuseSelector, value: u8) {
        self.fuses[selector as usize] = value;
    }

    pub fn watchdog_enabled(&self) -> bool {
        self.watchdog_enabled
    }

    /// Page addresses erased so far, in order
    pub fn erased_pages(&self) -> &[u32] {
        &self.erased_pages
    }

    /// Page addresses written so far, in order
    pub fn written_pages(&self) -> &[u32] {
        &self.written_pages
    }

    fn page_range(&self, address: u32) -> Option<std::ops::Range<usize>> {
        let base = self.config.page_base(address) as usize;
        let end = base + self.config.page_size as usize;
        if end <= self.flash.len() {
            Some(base..end)
        } else {
            None
        }
    }
}

impl SelfProgramming for SimDevice {
    fn page_erase(&mut self, address: u32) {
        if let Some(r) = self.page_range(address) {
            self.erased_pages.push(r.start as u32);
            self.flash[r].iter_mut().for_each(|b| *b = 0xFF);
        }
    }

    fn page_fill(&mut self, address: u32, word: u16) {
        let offset = (address % self.config.page_size) as usize & !1;
        let [lo, hi] = word.to_le_bytes();
        self.page_buffer[offset] = lo;
        self.page_buffer[offset + 1] = hi;
    }

    fn page_write(&mut self, address: u32) {
        if let Some(r) = self.page_range(address) {
            self.written_pages.push(r.start as u32);
            for (f, b) in self.flash[r].iter_mut().zip(self.page_buffer.iter()) {
                *f &= *b;
            }
        }
        self.page_buffer.iter_mut().for_each(|b| *b = 0xFF);
    }

    fn busy_wait(&mut self) {}

    fn rww_enable(&mut self) {}

    fn read_program_word(&mut self, address: u32) -> u16 {
        let a = address as usize;
        match (self.flash.get(a), a.checked_add(1).and_then(|b| self.flash.get(b))) {
            (Some(lo), Some(hi)) => u16::from_le_bytes([*lo, *hi]),
            _ => 0xFFFF,
        }
    }

    fn read_fuse(&mut self, selector: FuseSelector) -> u8 {
        self.fuses[selector as usize]
    }

    fn set_lock_bits(&mut self, bits: u8) {
        // Programming a lock bit clears it, nothing is ever set back to 1
        self.fuses[FuseSelector::LockBits as usize] &= !bits;
    }

    fn eeprom_read(&mut self, address: u16) -> u8 {
        self.eeprom.get(address as usize).copied().unwrap_or(0xFF)
    }

    fn eeprom_write(&mut self, address: u16, value: u8) {
        if let Some(b) = self.eeprom.get_mut(address as usize) {
            *b = value;
        }
    }
}

impl ResetControl for SimDevice {
    fn was_watchdog_reset(&mut self) -> bool {
        self.watchdog_reset
    }

    fn clear_watchdog(&mut self) {
        self.watchdog_reset = false;
        self.watchdog_enabled = false;
    }

    fn jump_to_application(&mut self) -> ! {
        info!("Simulated device jumping to application, exiting");
        std::process::exit(0)
    }
}

impl RetainedMemory for SimDevice {
    fn read_ram(&mut self, address: u32, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = (address as usize)
                .checked_add(i)
                .and_then(|a| self.ram.get(a))
                .copied()
                .unwrap_or(0);
        }
    }

    fn write_ram(&mut self, address: u32, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            if let Some(r) = (address as usize).checked_add(i).and_then(|a| self.ram.get_mut(a)) {
                *r = *b;
            }
        }
    }
}

/// Status LED stand-in counting its toggles
#[derive(Debug, Default)]
pub struct SimLed {
    pub on: bool,
    pub toggles: u32,
}

impl OutputPin for SimLed {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.on = false;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.on = true;
        Ok(())
    }
}

impl ToggleableOutputPin for SimLed {
    type Error = Infallible;

    fn toggle(&mut self) -> Result<(), Self::Error> {
        self.on = !self.on;
        self.toggles += 1;
        Ok(())
    }
}

/// Delay that returns immediately
#[derive(Debug, Default, Copy, Clone)]
pub struct NoDelay;

impl DelayUs<u32> for NoDelay {
    fn delay_us(&mut self, _us: u32) {}
}

impl DelayMs<u32> for NoDelay {
    fn delay_ms(&mut self, _ms: u32) {}
}

/// Serial port replaying a fixed receive script and capturing transmitted bytes
///
/// `None` entries in the script are idle polls (`WouldBlock`), once the script
/// is exhausted every read blocks.
#[derive(Debug, Default)]
pub struct ScriptedPort {
    rx: VecDeque<Option<u8>>,
    pub tx: Vec<u8>,
    pub polls: u64,
}

impl ScriptedPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes for the bootloader to receive
    pub fn push(&mut self, data: &[u8]) {
        self.rx.extend(data.iter().map(|b| Some(*b)));
    }

    /// Queue `n` idle polls
    pub fn idle(&mut self, n: usize) {
        self.rx.extend(std::iter::repeat(None).take(n));
    }

}

impl Read<u8> for ScriptedPort {
    type Error = Infallible;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        self.polls += 1;
        match self.rx.pop_front() {
            Some(Some(b)) => Ok(b),
            _ => Err(nb::Error::WouldBlock),
        }
    }
}

impl Write<u8> for ScriptedPort {
    type Error = Infallible;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        self.tx.push(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_write_without_erase_only_clears_bits() {
        let config = DeviceConfig::atmega328p();
        let mut d = SimDevice::new(config);

        d.page_fill(0, 0x0F0F);
        d.page_write(0);
        assert_eq!(d.read_program_word(0), 0x0F0F);

        d.page_fill(0, 0xF0FF);
        d.page_write(0);
        assert_eq!(d.read_program_word(0), 0x000F);

        d.page_erase(0);
        assert_eq!(d.read_program_word(0), 0xFFFF);
    }

    #[test]
    fn lock_bits_only_narrow() {
        let mut d = SimDevice::new(DeviceConfig::atmega328p());
        d.set_lock_bits(0x0C);
        assert_eq!(d.lock_bits(), 0xF3);

        d.set_lock_bits(0x00);
        assert_eq!(d.lock_bits(), 0xF3);
    }

    #[test]
    fn power_cycle_clears_retained_ram() {
        let mut d = SimDevice::new(DeviceConfig::atmega328p());
        d.write_ram(0x100, &[1, 2, 3]);
        d.watchdog_reset();
        assert!(d.watchdog_enabled());
        assert_eq!(d.read_ram_word(0x101), 0x0302);

        d.power_cycle();
        assert_eq!(d.read_ram_word(0x101), 0);
        assert!(!d.was_watchdog_reset());
        assert!(!d.watchdog_enabled());
    }

    #[test]
    fn scripted_port_blocks_on_idle_polls() {
        let mut p = ScriptedPort::new();
        p.push(&[1]);
        p.idle(1);
        p.push(&[2]);

        assert_eq!(p.read(), Ok(1));
        assert_eq!(p.read(), Err(nb::Error::WouldBlock));
        assert_eq!(p.read(), Ok(2));
        assert_eq!(p.read(), Err(nb::Error::WouldBlock));
    }
}
