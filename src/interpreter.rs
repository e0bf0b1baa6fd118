//! STK500v2 command interpreter
//!
//! Each decoded request maps to one handler, which reads the request payload
//! and builds an owned reply payload. Replies always start with the echoed
//! command byte followed by a status byte.

use core::convert::TryFrom;

use byteorder::{BigEndian, ByteOrder};

use crate::engine::Engine;
use crate::hal::SelfProgramming;
use crate::protocol::*;

/// Reply to a single request
#[derive(Clone, PartialEq, Debug)]
pub struct Reply {
    pub payload: Vec<u8>,
    /// Session ends once this reply has been sent
    pub leave: bool,
}

impl Reply {
    fn new(payload: Vec<u8>) -> Self {
        Self { payload, leave: false }
    }

    fn status(command: u8, status: u8) -> Self {
        Self::new(vec![command, status])
    }

    fn ok(command: u8) -> Self {
        Self::status(command, STATUS_CMD_OK)
    }

    fn failed(command: u8) -> Self {
        Self::status(command, STATUS_CMD_FAILED)
    }

    /// Status byte of the reply
    pub fn status_byte(&self) -> u8 {
        self.payload.get(1).copied().unwrap_or(STATUS_CMD_FAILED)
    }
}

/// Immutable view of a request payload, missing bytes read as zero
#[derive(Copy, Clone, Debug)]
struct Request<'a>(&'a [u8]);

impl<'a> Request<'a> {
    fn opcode(&self) -> u8 {
        self.byte(0)
    }

    fn byte(&self, i: usize) -> u8 {
        self.0.get(i).copied().unwrap_or(0)
    }

    /// Big-endian block size used by program and read commands
    fn block_size(&self) -> usize {
        BigEndian::read_u16(&[self.byte(1), self.byte(2)]) as usize
    }

    /// Program data following the command header
    fn data(&self, size: usize) -> Option<&'a [u8]> {
        self.0.get(PROGRAM_DATA_OFFSET..PROGRAM_DATA_OFFSET + size)
    }
}

pub struct Interpreter {
    engine: Engine,
}

impl Interpreter {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Execute one request
    pub fn handle<M: SelfProgramming>(&mut self, mcu: &mut M, payload: &[u8]) -> Reply {
        let req = Request(payload);
        let op = req.opcode();

        let command = match Command::try_from(op) {
            Ok(c) => c,
            Err(_) => {
                debug!("Unsupported command 0x{:02x}", op);
                return Reply::failed(op);
            }
        };

        trace!("Command {:?}", command);

        match command {
            Command::SignOn => self.sign_on(req),
            Command::GetParameter => self.get_parameter(req),
            Command::SetParameter | Command::EnterProgmode => Reply::ok(op),
            Command::LeaveProgmode => Reply {
                leave: true,
                ..Reply::ok(op)
            },
            Command::ReadSignature => self.read_signature(req),
            Command::ReadLock => self.read_lock(mcu, req),
            Command::ReadFuse => self.read_fuse(mcu, req),
            Command::ProgramLock => self.program_lock(mcu, req),
            Command::ChipErase => self.chip_erase(req),
            Command::LoadAddress => self.load_address(req),
            Command::SetUploadSize => self.set_upload_size(req),
            Command::ProgramFlash | Command::ProgramEeprom => self.program(mcu, command, req),
            Command::ReadFlash | Command::ReadEeprom => self.read(mcu, command, req),
            Command::SpiMulti => self.spi_multi(mcu, req),
        }
    }

    fn sign_on(&mut self, req: Request) -> Reply {
        let mut p = vec![req.opcode(), STATUS_CMD_OK, SIGN_ON_ID.len() as u8];
        p.extend_from_slice(SIGN_ON_ID);
        Reply::new(p)
    }

    fn get_parameter(&mut self, req: Request) -> Reply {
        let value = match req.byte(1) {
            PARAM_BUILD_NUMBER_LOW => CONFIG_BUILD_NUMBER_LOW,
            PARAM_BUILD_NUMBER_HIGH => CONFIG_BUILD_NUMBER_HIGH,
            PARAM_HW_VER => CONFIG_HW_VER,
            PARAM_SW_MAJOR => CONFIG_SW_MAJOR,
            PARAM_SW_MINOR => CONFIG_SW_MINOR,
            _ => 0,
        };

        Reply::new(vec![req.opcode(), STATUS_CMD_OK, value])
    }

    fn signature_byte(&self, index: u8) -> u8 {
        let sig = &self.engine.config().signature;
        match index {
            0 => sig[0],
            1 => sig[1],
            _ => sig[2],
        }
    }

    fn read_signature(&mut self, req: Request) -> Reply {
        let sig = self.signature_byte(req.byte(4));
        Reply::new(vec![req.opcode(), STATUS_CMD_OK, sig, STATUS_CMD_OK])
    }

    fn read_lock<M: SelfProgramming>(&mut self, mcu: &mut M, req: Request) -> Reply {
        let lock = mcu.read_fuse(FuseSelector::LockBits);
        Reply::new(vec![req.opcode(), STATUS_CMD_OK, lock, STATUS_CMD_OK])
    }

    fn read_fuse<M: SelfProgramming>(&mut self, mcu: &mut M, req: Request) -> Reply {
        let selector = match (req.byte(2), req.byte(3)) {
            (ISP_READ_LOW_FUSE, ISP_EXTENDED_SELECT) => FuseSelector::ExtendedFuse,
            (ISP_READ_LOW_FUSE, _) => FuseSelector::LowFuse,
            _ => FuseSelector::HighFuse,
        };

        let fuse = mcu.read_fuse(selector);
        Reply::new(vec![req.opcode(), STATUS_CMD_OK, fuse, STATUS_CMD_OK])
    }

    fn program_lock<M: SelfProgramming>(&mut self, mcu: &mut M, req: Request) -> Reply {
        // Only boot lock bits, and only ever towards more protection
        let bits = !req.byte(4) & LOCK_BITS_MASK;

        debug!("Programming lock bits 0x{:02x}", bits);
        mcu.set_lock_bits(bits);
        mcu.busy_wait();

        Reply::new(vec![req.opcode(), STATUS_CMD_OK, STATUS_CMD_OK])
    }

    fn chip_erase(&mut self, req: Request) -> Reply {
        // Erase happens implicitly while programming, hosts expect a failure here
        self.engine.reset_erase();
        Reply::failed(req.opcode())
    }

    fn load_address(&mut self, req: Request) -> Reply {
        let word = BigEndian::read_u32(&[req.byte(1), req.byte(2), req.byte(3), req.byte(4)]);
        self.engine.load_address(word);
        Reply::ok(req.opcode())
    }

    fn set_upload_size(&mut self, req: Request) -> Reply {
        let size = u32::from_le_bytes([req.byte(1), req.byte(2), req.byte(3), 0]);
        self.engine.set_upload_size(size);
        Reply::ok(req.opcode())
    }

    fn program<M: SelfProgramming>(&mut self, mcu: &mut M, command: Command, req: Request) -> Reply {
        let size = req.block_size();

        let data = match req.data(size) {
            Some(d) if size > 0 => d,
            _ => {
                warn!("Program request for {} bytes with {} byte payload", size, req.0.len());
                return Reply::failed(req.opcode());
            }
        };

        match command {
            Command::ProgramFlash => self.engine.program_flash(mcu, data),
            _ => self.engine.program_eeprom(mcu, data),
        }

        Reply::ok(req.opcode())
    }

    fn read<M: SelfProgramming>(&mut self, mcu: &mut M, command: Command, req: Request) -> Reply {
        let size = req.block_size();

        if size == 0 || size + 3 > MAX_PAYLOAD {
            warn!("Read request for {} bytes exceeds reply buffer", size);
            return Reply::failed(req.opcode());
        }

        let mut p = Vec::with_capacity(size + 3);
        p.push(req.opcode());
        p.push(STATUS_CMD_OK);

        match command {
            Command::ReadFlash => self.engine.read_flash(mcu, size, &mut p),
            _ => self.engine.read_eeprom(mcu, size, &mut p),
        }

        p.push(STATUS_CMD_OK);
        Reply::new(p)
    }

    fn spi_multi<M: SelfProgramming>(&mut self, mcu: &mut M, req: Request) -> Reply {
        let (tx0, tx1, tx2) = (req.byte(4), req.byte(5), req.byte(6));

        let answer = match (tx0, tx1) {
            (ISP_READ_SIGNATURE, _) => self.signature_byte(tx2),
            (ISP_READ_LOW_FUSE, ISP_EXTENDED_SELECT) => mcu.read_fuse(FuseSelector::ExtendedFuse),
            (ISP_READ_LOW_FUSE, _) => mcu.read_fuse(FuseSelector::LowFuse),
            (ISP_READ_HIGH_FUSE, ISP_EXTENDED_SELECT) => mcu.read_fuse(FuseSelector::HighFuse),
            (ISP_READ_HIGH_FUSE, _) => mcu.read_fuse(FuseSelector::LockBits),
            // Anything else gets a dummy answer so host tools carry on
            _ => 0,
        };

        Reply::new(vec![req.opcode(), STATUS_CMD_OK, 0, tx0, 0, answer, STATUS_CMD_OK])
    }
}
