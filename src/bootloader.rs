//! Boot arbitration and the main request / response loop

use core::fmt::Debug;
use core::marker::PhantomData;

use embedded_hal::blocking::delay::{DelayMs, DelayUs};
use embedded_hal::digital::v2::{OutputPin, ToggleableOutputPin};

use crate::config::{DeviceConfig, Options};
use crate::engine::{Engine, Operation, ProgrammingSession, ERASED_WORD};
use crate::frame::{Decoder, Frame};
use crate::hal::{ResetControl, RetainedMemory, SelfProgramming, SerialPort, StatusDisplay};
use crate::interpreter::Interpreter;
use crate::mailbox::{self, ReplayOutcome};
use crate::Error;

/// Frames between idle animation steps
const ANIMATION_INTERVAL: u16 = 10;
/// Number of idle animation frames
const ANIMATION_FRAMES: u8 = 6;

/// Why the bootloader is handing over to the application
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Exit {
    /// Watchdog reset, the self-update mailbox was checked and the serial
    /// protocol never started
    Watchdog(ReplayOutcome),
    /// No host showed up within the boot timeout
    BootTimeout,
    /// The host went quiet mid-session and an application is present
    HostTimeout,
    /// The host left programming mode
    Leave,
}

#[derive(Debug, Default)]
struct DisplayState {
    banner_shown: bool,
    animation_timer: u16,
    animation_frame: u8,
}

pub struct Bootloader<P, D, M, L, V, E> {
    options: Options,
    port: P,
    delay: D,
    mcu: M,
    led: L,
    display: V,
    decoder: Decoder,
    interpreter: Interpreter,
    display_state: DisplayState,
    _err: PhantomData<E>,
}

impl<P, D, M, L, V, E> Bootloader<P, D, M, L, V, E>
where
    P: SerialPort<E>,
    D: DelayUs<u32> + DelayMs<u32>,
    M: SelfProgramming + ResetControl + RetainedMemory,
    L: OutputPin + ToggleableOutputPin,
    <L as OutputPin>::Error: Debug,
    <L as ToggleableOutputPin>::Error: Debug,
    V: StatusDisplay,
    E: Debug,
{
    /// Create a new bootloader instance
    pub fn new(port: P, delay: D, mcu: M, led: L, display: V, config: DeviceConfig, options: Options) -> Self {
        Self {
            options,
            port,
            delay,
            mcu,
            led,
            display,
            decoder: Decoder::new(),
            interpreter: Interpreter::new(Engine::new(config)),
            display_state: DisplayState::default(),
            _err: PhantomData,
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        self.interpreter.engine().config()
    }

    /// Fetch the programming session state
    pub fn session(&self) -> &ProgrammingSession {
        self.interpreter.engine().session()
    }

    pub fn port(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn mcu(&mut self) -> &mut M {
        &mut self.mcu
    }

    pub fn led(&self) -> &L {
        &self.led
    }

    pub fn display(&self) -> &V {
        &self.display
    }

    /// Run the bootloader up to the point of starting the application
    ///
    /// A watchdog reset only replays a pending self-update. Otherwise the
    /// bootloader waits for a host and serves it until it leaves programming
    /// mode or goes quiet.
    pub fn start(&mut self) -> Result<Exit, Error<E>> {
        self.reset();

        let watchdog = self.mcu.was_watchdog_reset();
        self.mcu.clear_watchdog();

        if watchdog {
            let config = self.interpreter.engine().config().clone();
            let outcome = mailbox::replay(&mut self.mcu, &config);
            debug!("Watchdog reset, self-update outcome {:?}", outcome);
            return Ok(Exit::Watchdog(outcome));
        }

        self.set_led(true);
        self.display.show_splash();

        debug!("Awaiting host");

        let exit = match self.await_host() {
            Ok(Some(first)) => match self.serve(first) {
                Ok(()) => Ok(Exit::Leave),
                Err(Error::HostTimeout) => Ok(Exit::HostTimeout),
                Err(e) => Err(e),
            },
            Ok(None) => Ok(Exit::BootTimeout),
            Err(e) => Err(e),
        };

        self.set_led(false);
        self.delay.delay_ms(self.options.exit_delay_ms);

        exit
    }

    /// Run the bootloader and start the application, never returns
    pub fn boot(mut self) -> ! {
        match self.start() {
            Ok(exit) => info!("Leaving bootloader: {:?}", exit),
            Err(e) => error!("Bootloader error: {:?}", e),
        }

        self.transfer_control_to_application()
    }

    /// Hand execution to the application reset vector
    pub fn transfer_control_to_application(&mut self) -> ! {
        self.mcu.rww_enable();
        self.mcu.jump_to_application()
    }

    /// Whether the application reset vector has been programmed
    pub fn application_present(&mut self) -> bool {
        self.mcu.read_program_word(0) != ERASED_WORD
    }

    fn set_led(&mut self, on: bool) {
        let r = if on { self.led.set_high() } else { self.led.set_low() };
        if let Err(e) = r {
            warn!("Status LED error: {:?}", e);
        }
    }

    fn toggle_led(&mut self) {
        if let Err(e) = self.led.toggle() {
            warn!("Status LED error: {:?}", e);
        }
    }

    /// Return protocol state to power-on defaults
    fn reset(&mut self) {
        let config = self.interpreter.engine().config().clone();
        self.interpreter = Interpreter::new(Engine::new(config));
        self.decoder.reset();
        self.display_state = DisplayState::default();
    }

    /// Wait for the first byte from the host, blinking the LED
    fn await_host(&mut self) -> Result<Option<u8>, Error<E>> {
        let timeout = self.options.boot_timeout_polls();
        let blink = self.options.blink_polls();
        let mut timer: u32 = 0;

        loop {
            match self.port.read() {
                Ok(b) => return Ok(Some(b)),
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
            }

            timer += 1;
            if timer > timeout {
                debug!("No host within boot timeout");
                return Ok(None);
            }

            if timer % blink == 0 {
                self.toggle_led();
            }

            self.delay.delay_us(self.options.poll_delay_us);
        }
    }

    /// Blocking receive
    ///
    /// Gives up with `HostTimeout` once the receive timeout passes and an
    /// application is present, without one it keeps waiting.
    fn receive(&mut self) -> Result<u8, Error<E>> {
        let limit = self.options.receive_timeout_polls();
        let mut count: u32 = 0;

        loop {
            match self.port.read() {
                Ok(b) => return Ok(b),
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
            }

            count += 1;
            if count > limit {
                if self.application_present() {
                    debug!("Host timeout, application present");
                    return Err(Error::HostTimeout);
                }
                count = 0;
            }

            self.delay.delay_us(self.options.poll_delay_us);
        }
    }

    fn send(&mut self, frame: &Frame) -> Result<(), Error<E>> {
        for b in frame.encode() {
            block!(self.port.write(b))?;
            block!(self.port.flush())?;
        }
        Ok(())
    }

    /// Serve requests until the host leaves programming mode
    fn serve(&mut self, first: u8) -> Result<(), Error<E>> {
        let mut pending = Some(first);

        loop {
            let frame = loop {
                let b = match pending.take() {
                    Some(b) => b,
                    None => self.receive()?,
                };

                if let Some(f) = self.decoder.feed(b) {
                    break f;
                }
            };

            trace!("Request seq {} payload {:02x?}", frame.sequence, frame.payload);

            if !self.display_state.banner_shown {
                self.display.show_updating_banner();
                self.display_state.banner_shown = true;
            }

            let reply = self.interpreter.handle(&mut self.mcu, &frame.payload);

            self.update_display();

            trace!("Reply seq {} payload {:02x?}", frame.sequence, reply.payload);
            self.send(&Frame::new(frame.sequence, reply.payload))?;

            self.toggle_led();

            if reply.leave {
                debug!("Host left programming mode");
                return Ok(());
            }
        }
    }

    fn update_display(&mut self) {
        let session = self.interpreter.engine().session();
        let s = &mut self.display_state;

        if session.total_upload_size == 0 {
            s.animation_timer += 1;
            if s.animation_timer > ANIMATION_INTERVAL {
                s.animation_timer = 0;
                s.animation_frame = (s.animation_frame + 1) % ANIMATION_FRAMES;
                self.display.show_idle_animation_frame(s.animation_frame);
            }
        } else if session.operation != Operation::None {
            if let Some(p) = session.percent() {
                self.display.show_progress(session.operation, p);
            }
        }
    }
}
