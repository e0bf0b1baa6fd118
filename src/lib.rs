//! STK500v2 Serial Bootloader.
//!
//! Self-programming bootloader core for AVR class parts, speaking the
//! STK500v2 (AVR068) protocol used by avrdude's `wiring` / `stk500v2`
//! programmers. Hardware access is abstracted behind the traits in [`hal`],
//! so the same core runs on a device or against the simulated one in [`sim`].
//!
//! Based on AVR068

use core::fmt::Debug;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

#[macro_use]
extern crate bitflags;

extern crate embedded_hal;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

pub mod bootloader;
pub mod config;
pub mod engine;
pub mod frame;
pub mod hal;
pub mod interpreter;
pub mod mailbox;
pub mod protocol;
pub mod sim;

#[cfg(feature = "linux")]
pub mod linux;

pub use bootloader::{Bootloader, Exit};
pub use config::{DeviceConfig, Options};
pub use engine::{Engine, Operation, ProgrammingSession};
pub use frame::{Decoder, Frame};
pub use hal::{NoDisplay, ResetControl, RetainedMemory, SelfProgramming, SerialPort, StatusDisplay};
pub use interpreter::{Interpreter, Reply};
pub use mailbox::{ReplayOutcome, SelfUpdateDescriptor, UpdateFlags};

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError: Debug> {
    #[error("serial error: {0:?}")]
    Serial(SerialError),

    #[error("host stopped responding")]
    HostTimeout,
}

impl<SerialError: Debug> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}
