//! Chip configuration and bootloader timing options

/// Chip and board description consumed by the bootloader core
#[derive(Clone, PartialEq, Debug)]
pub struct DeviceConfig {
    /// SPM page size in bytes
    pub page_size: u32,
    /// Total program memory in bytes
    pub flash_size: u32,
    /// Size of the boot section reserved for the bootloader, in bytes
    pub boot_size: u32,
    /// EEPROM size in bytes
    pub eeprom_size: u32,
    /// End of the RAM window shared with the application, the self-update
    /// descriptor occupies the 16 bytes just below it
    pub ram_end: u32,
    /// Device signature bytes, most significant first
    pub signature: [u8; 3],
}

impl DeviceConfig {
    /// ATmega2560, 256K flash with an 8K boot section
    pub fn atmega2560() -> Self {
        Self {
            page_size: 256,
            flash_size: 0x40000,
            boot_size: 0x2000,
            eeprom_size: 4096,
            ram_end: 0x2000,
            signature: [0x1E, 0x98, 0x01],
        }
    }

    /// ATmega1284P, 128K flash with an 8K boot section
    pub fn atmega1284p() -> Self {
        Self {
            page_size: 256,
            flash_size: 0x20000,
            boot_size: 0x2000,
            eeprom_size: 4096,
            ram_end: 0x4100,
            signature: [0x1E, 0x97, 0x05],
        }
    }

    /// ATmega328P, 32K flash with a 2K boot section
    pub fn atmega328p() -> Self {
        Self {
            page_size: 128,
            flash_size: 0x8000,
            boot_size: 0x800,
            eeprom_size: 1024,
            ram_end: 0x900,
            signature: [0x1E, 0x95, 0x0F],
        }
    }

    /// Look up a preset by part name
    pub fn by_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "atmega2560" | "m2560" => Some(Self::atmega2560()),
            "atmega1284p" | "m1284p" => Some(Self::atmega1284p()),
            "atmega328p" | "m328p" => Some(Self::atmega328p()),
            _ => None,
        }
    }

    /// First byte of the bootloader section, nothing at or beyond this is ever
    /// erased or written
    pub fn protection_boundary(&self) -> u32 {
        self.flash_size - self.boot_size
    }

    /// Whether program memory addresses need more than 16 bits
    pub fn is_extended(&self) -> bool {
        self.flash_size > 0x10000
    }

    /// Round `address` down to its page base
    pub fn page_base(&self, address: u32) -> u32 {
        address - (address % self.page_size)
    }

    /// Address of the self-update descriptor in retained RAM
    pub fn mailbox_address(&self) -> u32 {
        self.ram_end - crate::mailbox::DESCRIPTOR_LEN as u32
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::atmega2560()
    }
}

/// Bootloader timing options
#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Delay between polls of the serial port
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "50"))]
    pub poll_delay_us: u32,

    /// Time to wait for the host before starting the application
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1000"))]
    pub boot_timeout_ms: u32,

    /// Status LED toggle period while waiting for the host
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "150"))]
    pub blink_period_ms: u32,

    /// Silence mid-session after which a present application is started
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "4000"))]
    pub receive_timeout_ms: u32,

    /// Delay after switching the LED off before leaving the bootloader
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "50"))]
    pub exit_delay_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            poll_delay_us: 50,
            boot_timeout_ms: 1000,
            blink_period_ms: 150,
            receive_timeout_ms: 4000,
            exit_delay_ms: 50,
        }
    }
}

impl Options {
    fn polls(&self, ms: u32) -> u32 {
        let delay = self.poll_delay_us.max(1) as u64;
        ((ms as u64 * 1000) / delay).min(u32::MAX as u64) as u32
    }

    /// Number of polls before the initial wait gives up
    pub fn boot_timeout_polls(&self) -> u32 {
        self.polls(self.boot_timeout_ms)
    }

    /// Number of polls between LED toggles, never zero
    pub fn blink_polls(&self) -> u32 {
        self.polls(self.blink_period_ms).max(1)
    }

    /// Number of polls before a blocking receive checks for an application
    pub fn receive_timeout_polls(&self) -> u32 {
        self.polls(self.receive_timeout_ms)
    }
}
