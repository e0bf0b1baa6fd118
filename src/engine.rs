//! Flash / EEPROM programming engine
//!
//! Program memory is erased one page ahead of the incoming data: every
//! PROGRAM_FLASH packet erases the page at the erase frontier and moves the
//! frontier on by one page. Hosts send page aligned packets in increasing
//! address order, so the frontier always stays ahead of the data.
//!
//! Nothing at or beyond [`DeviceConfig::protection_boundary`] is ever erased
//! or written, whatever address the host asks for.

use core::ops::Range;

use crate::config::DeviceConfig;
use crate::hal::SelfProgramming;

/// Value of erased program memory
pub const ERASED_WORD: u16 = 0xFFFF;

/// What the current transfer is doing, inferred from the command stream
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Operation {
    None,
    Write,
    Verify,
}

impl Default for Operation {
    fn default() -> Self {
        Operation::None
    }
}

/// Address and progress bookkeeping for one programming session
#[derive(Clone, PartialEq, Debug, Default)]
pub struct ProgrammingSession {
    /// Byte address used by the next memory command
    pub current_address: u32,
    /// Next page to be erased
    pub erase_frontier: u32,
    /// End of the highest block written this session
    pub high_water: u32,
    /// Total upload size declared by the host, zero when unknown
    pub total_upload_size: u32,
    /// Bytes written or verified so far
    pub bytes_transferred: u32,
    /// Start address of the previous PROGRAM_FLASH packet
    pub last_packet_address: u32,
    pub operation: Operation,
}

impl ProgrammingSession {
    /// Progress of the current operation in percent, if an upload size was declared
    pub fn percent(&self) -> Option<u8> {
        if self.total_upload_size == 0 || self.operation == Operation::None {
            return None;
        }

        let p = 100 * self.bytes_transferred as u64 / self.total_upload_size as u64;
        Some(p.min(100) as u8)
    }
}

pub struct Engine {
    config: DeviceConfig,
    session: ProgrammingSession,
}

impl Engine {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            session: ProgrammingSession::default(),
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn session(&self) -> &ProgrammingSession {
        &self.session
    }

    /// Set the current address from a host supplied word address
    pub fn load_address(&mut self, word_address: u32) {
        // Bit 31 is the host's "extended address" flag and shifts out here
        let mut address = word_address << 1;
        if !self.config.is_extended() {
            address &= 0xFFFF;
        }

        trace!("Load address 0x{:05x}", address);
        self.session.current_address = address;
    }

    /// Start a new transfer of `size` bytes
    pub fn set_upload_size(&mut self, size: u32) {
        debug!("Upload size {} bytes", size);

        self.session = ProgrammingSession {
            total_upload_size: size,
            ..ProgrammingSession::default()
        };
    }

    /// Restart erase and address bookkeeping
    pub fn reset_erase(&mut self) {
        self.session.erase_frontier = 0;
        self.session.high_water = 0;
        self.session.current_address = 0;
    }

    /// Program `data` at the current address
    pub fn program_flash<M: SelfProgramming>(&mut self, mcu: &mut M, data: &[u8]) {
        let start = self.session.current_address;
        let boundary = self.config.protection_boundary();
        let page_size = self.config.page_size;

        self.track_write(start, data.len() as u32);

        // Erase ahead, one page per packet
        let erased = self.session.erase_frontier;
        if erased < boundary {
            trace!("Erasing page 0x{:05x}", erased);
            mcu.page_erase(erased);
            mcu.busy_wait();
            self.session.erase_frontier += page_size;
        }

        let end = start.saturating_add((data.len() as u32 + 1) & !1);

        if start < boundary {
            let mut address = start;
            let mut page = None;

            for word in data.chunks(2) {
                if address >= boundary {
                    break;
                }

                let p = self.config.page_base(address);
                if page != Some(p) {
                    if let Some(prev) = page {
                        Self::commit(mcu, prev);
                    }

                    // Below the high-water mark the page may already hold data
                    // from this session, it has to be erased again
                    if address < self.session.high_water && p != erased {
                        self.reload_page(mcu, p, start..end);
                    }

                    page = Some(p);
                }

                let high = word.get(1).copied().unwrap_or(0xFF);
                mcu.page_fill(address, u16::from_le_bytes([word[0], high]));
                address += 2;
            }

            if let Some(p) = page {
                Self::commit(mcu, p);
            }
        } else {
            warn!(
                "Skipping write of {} bytes at protected address 0x{:05x}",
                data.len(),
                start
            );
        }

        self.session.current_address = end;
        self.session.high_water = self.session.high_water.max(end);
    }

    /// Write `data` to EEPROM at the current address
    pub fn program_eeprom<M: SelfProgramming>(&mut self, mcu: &mut M, data: &[u8]) {
        let mut ee = (self.session.current_address >> 1) as u16;

        for b in data {
            mcu.eeprom_write(ee, *b);
            ee = ee.wrapping_add(1);
        }

        self.session.current_address = self.session.current_address.saturating_add(2 * data.len() as u32);
    }

    /// Read `len` bytes of program memory from the current address into `out`
    pub fn read_flash<M: SelfProgramming>(&mut self, mcu: &mut M, len: usize, out: &mut Vec<u8>) {
        let mut address = self.session.current_address;

        self.track_read(address, len as u32);

        let mut remaining = len;
        while remaining > 0 {
            let [lo, hi] = mcu.read_program_word(address).to_le_bytes();
            out.push(lo);
            if remaining > 1 {
                out.push(hi);
            }

            address = address.saturating_add(2);
            remaining = remaining.saturating_sub(2);
        }

        self.session.current_address = address;
    }

    /// Read `len` bytes of EEPROM from the current address into `out`
    pub fn read_eeprom<M: SelfProgramming>(&mut self, mcu: &mut M, len: usize, out: &mut Vec<u8>) {
        let mut ee = (self.session.current_address >> 1) as u16;

        for _ in 0..len {
            out.push(mcu.eeprom_read(ee));
            ee = ee.wrapping_add(1);
        }

        self.session.current_address = self.session.current_address.saturating_add(2 * len as u32);
    }

    /// Erase `page`, then load everything it held outside `replaced` back into
    /// the page buffer
    fn reload_page<M: SelfProgramming>(&self, mcu: &mut M, page: u32, replaced: Range<u32>) {
        let kept: Vec<(u32, u16)> = (page..page + self.config.page_size)
            .step_by(2)
            .filter(|a| !replaced.contains(a))
            .map(|a| (a, mcu.read_program_word(a)))
            .filter(|(_, w)| *w != ERASED_WORD)
            .collect();

        debug!("Re-erasing page 0x{:05x} for re-sent block, keeping {} words", page, kept.len());
        mcu.page_erase(page);
        mcu.busy_wait();

        for (a, w) in kept {
            mcu.page_fill(a, w);
        }
    }

    fn commit<M: SelfProgramming>(mcu: &mut M, page: u32) {
        trace!("Writing page 0x{:05x}", page);
        mcu.page_write(page);
        mcu.busy_wait();
        mcu.rww_enable();
    }

    fn track_write(&mut self, address: u32, size: u32) {
        let s = &mut self.session;
        if s.total_upload_size == 0 {
            return;
        }

        if address == 0 {
            s.bytes_transferred = size;
            s.operation = Operation::Write;
        } else if address != s.last_packet_address {
            s.bytes_transferred = s.bytes_transferred.saturating_add(size);
        }
        s.last_packet_address = address;
    }

    fn track_read(&mut self, address: u32, size: u32) {
        let s = &mut self.session;
        if s.total_upload_size == 0 {
            return;
        }

        if address == 0 && s.operation == Operation::Write {
            s.operation = Operation::Verify;
            s.bytes_transferred = size;
        } else {
            s.bytes_transferred = s.bytes_transferred.saturating_add(size);
        }
    }
}
