//! The byte transport between the driver and the card socket.
//!
//! The protocol layers above only ever need five things: push a byte, clock
//! a byte back, wiggle chip-select, and switch the bus clock between the
//! bring-up rate and the operating rate. [`Transport`] is that capability;
//! [`SpiBusTransport`] binds it to an `embedded-hal` SPI bus and GPIO pin.
//! Tests supply their own implementation instead of real hardware.

use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;

/// The two clock rates the driver asks for.
///
/// Cards must be probed below 400 kHz; once initialization succeeds the
/// driver requests the fast rate for data transfer.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSpeed {
    /// Bring-up rate, at or below 400 kHz.
    Slow,
    /// Full operating rate.
    Fast,
}

/// Byte-level access to the card socket.
///
/// None of the operations return errors: the bus is assumed electrically
/// present, and anything wedged shows up as a timeout in the protocol
/// layers. Implementations talking to real registers should mask interrupts
/// for the duration of each byte exchange and restore the previous state
/// afterwards, so a tick interrupt cannot tear the register sequence.
pub trait Transport {
    /// Push one byte to the card.
    fn transmit(&mut self, byte: u8);

    /// Clock one byte out of the card by sending 0xFF filler.
    fn receive(&mut self) -> u8;

    /// Assert the chip-select line.
    fn select(&mut self);

    /// Release the chip-select line.
    fn deselect(&mut self);

    /// Switch the bus clock rate.
    fn set_clock(&mut self, speed: ClockSpeed);
}

/// A [`Transport`] over an `embedded-hal` SPI bus and chip-select pin.
///
/// `embedded-hal` has no portable way to re-clock a bus, so the divisor
/// switch is delegated to a caller-supplied hook that gets the bare bus and
/// the requested [`ClockSpeed`]. Pin multiplexing and peripheral bring-up
/// stay with whoever constructs the `SPI` and `CS` values.
pub struct SpiBusTransport<SPI, CS, F> {
    spi: SPI,
    cs: CS,
    reclock: F,
}

impl<SPI, CS, F> SpiBusTransport<SPI, CS, F>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    F: FnMut(&mut SPI, ClockSpeed),
{
    /// Wrap a bus, a chip-select pin and a re-clocking hook.
    pub fn new(spi: SPI, cs: CS, reclock: F) -> SpiBusTransport<SPI, CS, F> {
        SpiBusTransport { spi, cs, reclock }
    }

    /// Get the wrapped bus and pin back.
    pub fn free(self) -> (SPI, CS) {
        (self.spi, self.cs)
    }
}

impl<SPI, CS, F> Transport for SpiBusTransport<SPI, CS, F>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    F: FnMut(&mut SPI, ClockSpeed),
{
    fn transmit(&mut self, byte: u8) {
        critical_section::with(|_| {
            let _ = self.spi.write(&[byte]);
            let _ = self.spi.flush();
        });
    }

    fn receive(&mut self) -> u8 {
        critical_section::with(|_| {
            let mut buf = [0xFF];
            let _ = self.spi.transfer_in_place(&mut buf);
            let _ = self.spi.flush();
            buf[0]
        })
    }

    fn select(&mut self) {
        let _ = self.cs.set_low();
    }

    fn deselect(&mut self) {
        let _ = self.cs.set_high();
    }

    fn set_clock(&mut self, speed: ClockSpeed) {
        (self.reclock)(&mut self.spi, speed);
    }
}
