//! STK500v2 wire constants, based on AVR068

use core::convert::TryFrom;

/// Start of message marker
pub const MESSAGE_START: u8 = 0x1B;
/// Token byte separating the header from the payload
pub const TOKEN: u8 = 0x0E;

pub const STATUS_CMD_OK: u8 = 0x00;
pub const STATUS_CMD_FAILED: u8 = 0xC0;

/// Largest payload the bootloader will accept or emit
pub const MAX_PAYLOAD: usize = 285;

/// Offset of program data within PROGRAM_FLASH / PROGRAM_EEPROM requests
pub const PROGRAM_DATA_OFFSET: usize = 10;

/// Identification string returned by sign-on
pub const SIGN_ON_ID: &[u8] = b"AVRISP_2";

pub const PARAM_BUILD_NUMBER_LOW: u8 = 0x80;
pub const PARAM_BUILD_NUMBER_HIGH: u8 = 0x81;
pub const PARAM_HW_VER: u8 = 0x90;
pub const PARAM_SW_MAJOR: u8 = 0x91;
pub const PARAM_SW_MINOR: u8 = 0x92;

pub const CONFIG_BUILD_NUMBER_LOW: u8 = 0;
pub const CONFIG_BUILD_NUMBER_HIGH: u8 = 0;
pub const CONFIG_HW_VER: u8 = 0x0F;
pub const CONFIG_SW_MAJOR: u8 = 2;
pub const CONFIG_SW_MINOR: u8 = 0x0A;

/// Mask of the boot lock bits (BLB0x / BLB1x) that may be programmed
pub const LOCK_BITS_MASK: u8 = 0x3C;

/// ISP instruction bytes recognised through SPI_MULTI and READ_FUSE
pub const ISP_READ_SIGNATURE: u8 = 0x30;
pub const ISP_READ_LOW_FUSE: u8 = 0x50;
pub const ISP_READ_HIGH_FUSE: u8 = 0x58;
pub const ISP_EXTENDED_SELECT: u8 = 0x08;

/// Selector passed to the self-programming hardware when reading fuses or locks
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum FuseSelector {
    LowFuse = 0x00,
    LockBits = 0x01,
    ExtendedFuse = 0x02,
    HighFuse = 0x03,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Command {
    /// Identify the programmer
    SignOn = 0x01,

    /// Set a programmer parameter (acknowledged only)
    SetParameter = 0x02,

    /// Read a programmer parameter
    GetParameter = 0x03,

    /// Load the word address used by subsequent memory commands
    LoadAddress = 0x06,

    /// Enter programming mode (acknowledged only)
    EnterProgmode = 0x10,

    /// Leave programming mode and start the application
    LeaveProgmode = 0x11,

    /// Erase the whole chip. Always reports failure, erase happens while programming.
    ChipErase = 0x12,

    /// Write a block of program memory at the current address
    ProgramFlash = 0x13,

    /// Read a block of program memory from the current address
    ReadFlash = 0x14,

    /// Write a block of EEPROM at the current address
    ProgramEeprom = 0x15,

    /// Read a block of EEPROM from the current address
    ReadEeprom = 0x16,

    /// Read a fuse byte
    ReadFuse = 0x18,

    /// Program the boot lock bits, protection may only be narrowed
    ProgramLock = 0x19,

    /// Read the lock bits
    ReadLock = 0x1A,

    /// Read one byte of the device signature
    ReadSignature = 0x1B,

    /// Raw ISP instruction passthrough, emulated for the few reads host tools issue
    SpiMulti = 0x1D,

    /// Declare the total size of the upcoming upload (vendor extension)
    SetUploadSize = 0x55,
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        let c = match v {
            0x01 => Command::SignOn,
            0x02 => Command::SetParameter,
            0x03 => Command::GetParameter,
            0x06 => Command::LoadAddress,
            0x10 => Command::EnterProgmode,
            0x11 => Command::LeaveProgmode,
            0x12 => Command::ChipErase,
            0x13 => Command::ProgramFlash,
            0x14 => Command::ReadFlash,
            0x15 => Command::ProgramEeprom,
            0x16 => Command::ReadEeprom,
            0x18 => Command::ReadFuse,
            0x19 => Command::ProgramLock,
            0x1A => Command::ReadLock,
            0x1B => Command::ReadSignature,
            0x1D => Command::SpiMulti,
            0x55 => Command::SetUploadSize,
            _ => return Err(v),
        };
        Ok(c)
    }
}
