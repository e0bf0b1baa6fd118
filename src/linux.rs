use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use linux_embedded_hal::{Delay, Serial};
use serial_core::{
    BaudRate, CharSize, FlowControl, Parity, SerialDevice as _, SerialPortSettings as _, StopBits,
};

use crate::hal::StatusDisplay;
use crate::sim::{SimDevice, SimLed};
use crate::{Bootloader, Options};

/// Serial read timeout, reads return `WouldBlock` once it expires
const READ_TIMEOUT_MS: u64 = 1;

impl<V: StatusDisplay> Bootloader<Serial, Delay, SimDevice, SimLed, V, IoErrorKind> {
    /// Create a bootloader serving a simulated device over a linux serial port
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        device: SimDevice,
        display: V,
        options: Options,
    ) -> anyhow::Result<Self> {
        let path = port.as_ref();

        // Open port
        let mut port = Serial::open(path)
            .with_context(|| format!("opening serial port {}", path.display()))?;

        // Apply settings, 8N1 as expected by avrdude
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityNone);

        port.0.write_settings(&settings)?;
        port.0.set_timeout(Duration::from_millis(READ_TIMEOUT_MS))?;

        let config = device.config().clone();

        // Return instance
        Ok(Self::new(port, Delay {}, device, SimLed::default(), display, config, options))
    }
}
