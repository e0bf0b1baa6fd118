//! Hardware collaborators required by the bootloader core
//!
//! Everything board or chip specific lives behind these traits, the core
//! never touches a register directly.

use embedded_hal::serial::{Read, Write};

use crate::engine::Operation;
use crate::protocol::FuseSelector;

/// Byte transport to the host
///
/// `read` must return `WouldBlock` when no byte is pending, the bootloader
/// polls it to implement its timeouts. `flush` blocks until the last byte has
/// left the transmitter.
pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {}

impl<T, E> SerialPort<E> for T where T: Write<u8, Error = E> + Read<u8, Error = E> {}

/// The device's self-programming (SPM) hardware
///
/// All operations block until the hardware reports completion.
pub trait SelfProgramming {
    /// Erase the page containing `address`
    fn page_erase(&mut self, address: u32);

    /// Load one word into the temporary page buffer at `address`
    fn page_fill(&mut self, address: u32, word: u16);

    /// Commit the temporary page buffer to the page containing `address`
    fn page_write(&mut self, address: u32);

    /// Wait for any outstanding SPM operation
    fn busy_wait(&mut self);

    /// Re-enable the read-while-write section after an erase or write
    fn rww_enable(&mut self);

    /// Read a little-endian word from program memory, `address` may exceed 64K
    fn read_program_word(&mut self, address: u32) -> u16;

    /// Read a fuse or lock byte
    fn read_fuse(&mut self, selector: FuseSelector) -> u8;

    /// Program the lock bits, `bits` has already been masked
    fn set_lock_bits(&mut self, bits: u8);

    fn eeprom_read(&mut self, address: u16) -> u8;

    fn eeprom_write(&mut self, address: u16, value: u8);
}

/// Reset cause handling and the final hand-over to the application
pub trait ResetControl {
    /// Whether the last reset was caused by the watchdog
    fn was_watchdog_reset(&mut self) -> bool;

    /// Clear the reset cause flags and disable the watchdog
    fn clear_watchdog(&mut self);

    /// Transfer execution to the application reset vector, never returns
    fn jump_to_application(&mut self) -> !;
}

/// Reset-surviving RAM holding the self-update mailbox
pub trait RetainedMemory {
    /// Read `buf.len()` bytes of RAM starting at `address`
    fn read_ram(&mut self, address: u32, buf: &mut [u8]);

    /// Write `data` to RAM starting at `address`
    fn write_ram(&mut self, address: u32, data: &[u8]);

    /// Read a little-endian word of RAM, used as a self-update copy source
    fn read_ram_word(&mut self, address: u32) -> u16 {
        let mut b = [0u8; 2];
        self.read_ram(address, &mut b);
        u16::from_le_bytes(b)
    }
}

/// Purely cosmetic status output, every method defaults to doing nothing
pub trait StatusDisplay {
    /// Shown once at start-up, before waiting for the host
    fn show_splash(&mut self) {}

    /// Shown once when the first frame from the host arrives
    fn show_updating_banner(&mut self) {}

    /// Idle animation while no upload size has been declared
    fn show_idle_animation_frame(&mut self, _frame: u8) {}

    /// Upload or verify progress
    fn show_progress(&mut self, _kind: Operation, _percent: u8) {}
}

/// Display stand-in for boards without one
#[derive(Copy, Clone, Debug, Default)]
pub struct NoDisplay;

impl StatusDisplay for NoDisplay {}
