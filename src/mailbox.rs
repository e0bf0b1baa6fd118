//! Deferred self-update mailbox
//!
//! A running application can stage a block copy into program memory without
//! ever executing SPM instructions itself: it writes a [`SelfUpdateDescriptor`]
//! to the top of RAM and lets the watchdog reset the device. RAM is not
//! cleared by a warm reset, so on the next boot the bootloader finds the
//! descriptor, performs the copy and starts the application.
//!
//! The descriptor layout is an ABI shared with independently built
//! application firmware and must not change:
//!
//! ```text
//! offset  width  field
//!      0    u32  source address
//!      4    u32  destination address
//!      8    u16  remaining size in bytes
//!     10     u8  reserved
//!     11     u8  flags
//!     12    u32  magic (0x55AA55AA)
//! ```
//!
//! All fields are little-endian.

use byteorder::{ByteOrder, LittleEndian};

use crate::config::DeviceConfig;
use crate::hal::{RetainedMemory, SelfProgramming};

/// Size of the encoded descriptor
pub const DESCRIPTOR_LEN: usize = 16;

/// Sentinel marking a descriptor as valid
pub const DESCRIPTOR_MAGIC: u32 = 0x55AA_55AA;

bitflags! {
    pub struct UpdateFlags: u8 {
        /// Erase every destination page before it is written
        const ERASE = 0x01;
        /// Copy data from the source into the destination
        const COPY = 0x02;
        /// Source is program memory rather than RAM
        const SOURCE_FLASH = 0x04;
        /// Staged only, start the application without applying
        const DEFER_RUN = 0x08;
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub struct SelfUpdateDescriptor {
    pub source: u32,
    pub destination: u32,
    pub remaining: u16,
    pub reserved: u8,
    pub flags: UpdateFlags,
    pub magic: u32,
}

impl SelfUpdateDescriptor {
    /// Build a valid descriptor for a copy of `size` bytes
    pub fn stage(source: u32, destination: u32, size: u16, flags: UpdateFlags) -> Self {
        Self {
            source,
            destination,
            remaining: size,
            reserved: 0,
            flags,
            magic: DESCRIPTOR_MAGIC,
        }
    }

    pub fn from_bytes(b: &[u8; DESCRIPTOR_LEN]) -> Self {
        Self {
            source: LittleEndian::read_u32(&b[0..4]),
            destination: LittleEndian::read_u32(&b[4..8]),
            remaining: LittleEndian::read_u16(&b[8..10]),
            reserved: b[10],
            flags: UpdateFlags::from_bits_truncate(b[11]),
            magic: LittleEndian::read_u32(&b[12..16]),
        }
    }

    pub fn to_bytes(&self) -> [u8; DESCRIPTOR_LEN] {
        let mut b = [0u8; DESCRIPTOR_LEN];
        LittleEndian::write_u32(&mut b[0..4], self.source);
        LittleEndian::write_u32(&mut b[4..8], self.destination);
        LittleEndian::write_u16(&mut b[8..10], self.remaining);
        b[10] = self.reserved;
        b[11] = self.flags.bits();
        LittleEndian::write_u32(&mut b[12..16], self.magic);
        b
    }

    /// A descriptor is only trusted when its magic matches
    pub fn is_valid(&self) -> bool {
        self.magic == DESCRIPTOR_MAGIC
    }

    pub fn invalidate(&mut self) {
        self.magic = 0;
    }

    /// Read the descriptor from retained RAM
    pub fn load<R: RetainedMemory>(ram: &mut R, config: &DeviceConfig) -> Self {
        let mut b = [0u8; DESCRIPTOR_LEN];
        ram.read_ram(config.mailbox_address(), &mut b);
        Self::from_bytes(&b)
    }

    /// Write the descriptor to retained RAM
    pub fn store<R: RetainedMemory>(&self, ram: &mut R, config: &DeviceConfig) {
        ram.write_ram(config.mailbox_address(), &self.to_bytes());
    }
}

/// Result of checking the mailbox at boot
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum ReplayOutcome {
    /// No valid descriptor was present
    NoUpdate,
    /// A descriptor was staged with DEFER_RUN and left in place
    Deferred,
    /// The staged copy was carried out over this many pages
    Applied { pages: u32 },
}

/// Apply a pending self-update, if any
///
/// Pages at or beyond the protection boundary are skipped so a bad
/// descriptor cannot overwrite the bootloader. The descriptor is invalidated
/// once the copy is done.
pub fn replay<M>(mcu: &mut M, config: &DeviceConfig) -> ReplayOutcome
where
    M: SelfProgramming + RetainedMemory,
{
    let mut d = SelfUpdateDescriptor::load(mcu, config);

    if !d.is_valid() {
        debug!("No self-update pending (magic 0x{:08x})", d.magic);
        return ReplayOutcome::NoUpdate;
    }

    if d.flags.contains(UpdateFlags::DEFER_RUN) {
        debug!("Self-update staged with deferred run, leaving it in place");
        return ReplayOutcome::Deferred;
    }

    info!(
        "Applying self-update: {} bytes 0x{:05x} -> 0x{:05x} ({:?})",
        d.remaining, d.source, d.destination, d.flags
    );

    let page_size = config.page_size;
    let boundary = config.protection_boundary();

    let mut address = d.destination;
    let mut page = config.page_base(address);
    let mut pages = 0;

    while d.remaining > 0 {
        let next_page = page.checked_add(page_size);
        let writable = page < boundary;

        if writable && d.flags.contains(UpdateFlags::ERASE) {
            mcu.page_erase(page);
            mcu.busy_wait();
        }

        if d.flags.contains(UpdateFlags::COPY) {
            while d.remaining > 0 && next_page.map_or(true, |n| address < n) {
                let word = if d.flags.contains(UpdateFlags::SOURCE_FLASH) {
                    mcu.read_program_word(d.source)
                } else {
                    mcu.read_ram_word(d.source)
                };

                if writable {
                    mcu.page_fill(address, word);
                }

                d.remaining = d.remaining.saturating_sub(2);

                match (address.checked_add(2), d.source.checked_add(2)) {
                    (Some(a), Some(s)) => {
                        address = a;
                        d.source = s;
                    }
                    _ => {
                        warn!("Self-update copy reached the top of the address space");
                        d.remaining = 0;
                    }
                }
            }

            if writable {
                mcu.page_write(page);
                mcu.busy_wait();
                mcu.rww_enable();
            }
        } else {
            d.remaining = d.remaining.saturating_sub(page_size.min(u16::MAX as u32) as u16);
        }

        if !writable {
            warn!("Self-update skipped protected page 0x{:05x}", page);
        }

        pages += 1;

        match next_page {
            Some(n) => page = n,
            None => d.remaining = 0,
        }
    }

    d.invalidate();
    d.store(mcu, config);

    ReplayOutcome::Applied { pages }
}
