//! Chip-select session guard and command framer.
//!
//! A `Session` borrows the SPI bus, the chip-select pin, the clock and the
//! delay for the lifetime of one bus transaction. Constructing it asserts
//! chip-select; dropping it deasserts chip-select again. It deliberately does
//! *not* clock the trailing dummy byte the SD protocol wants after the final
//! deassertion of a public operation — that happens exactly once, at the
//! outer operation boundary, not at every inner select/deselect cycle a
//! multi-step command sequence may need (CMD58, for instance, requires a
//! deselect between its R1 response and its OCR data).
//!
//! `Session` only deals in protocol-generic outcomes (`CommandTimeout`,
//! `Timeout`, the token byte a write got back); it's the caller in
//! `sdmmc::mod` that knows whether a given failure means `ReadBlockFailed`
//! or `ReadBlocksFailed`.

use super::proto::*;
use super::retry::{poll_until_ms, retry_count};
use super::Error;
use crate::transport::Clock;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

#[cfg(feature = "log")]
use log::warn;

#[cfg(feature = "defmt-log")]
use defmt::warn;

fn raw_transfer<SPI: Transfer<u8>>(spi: &mut SPI, out: u8) -> Result<u8, Error> {
    spi.transfer(&mut [out])
        .map(|b| b[0])
        .map_err(|_| Error::Transport)
}

fn raw_receive<SPI: Transfer<u8>>(spi: &mut SPI) -> Result<u8, Error> {
    raw_transfer(spi, 0xFF)
}

fn raw_send<SPI: Transfer<u8>>(spi: &mut SPI, out: u8) -> Result<(), Error> {
    raw_transfer(spi, out).map(|_| ())
}

/// Assemble and send a six-byte command frame, then collect the R1 response
/// (up to [`MAX_RETRIES`] reads of a non-`0xFF` byte).
fn raw_command<SPI: Transfer<u8>>(spi: &mut SPI, cmd: u8, arg: u32) -> Result<u8, Error> {
    let crc = match cmd {
        CMD0 => CRC_CMD0,
        CMD8 => CRC_CMD8,
        _ => CRC_DISABLED,
    };
    let frame = [
        0x40 | cmd,
        (arg >> 24) as u8,
        (arg >> 16) as u8,
        (arg >> 8) as u8,
        arg as u8,
        crc,
    ];
    for b in frame.iter() {
        raw_send(spi, *b)?;
    }

    // CMD12 emits one stuff byte before its R1 response.
    if cmd == CMD12 {
        raw_receive(spi)?;
    }

    for _ in 0..MAX_RETRIES {
        let r = raw_receive(spi)?;
        if (r & 0x80) == 0 {
            return Ok(r);
        }
    }
    Err(Error::CommandTimeout)
}

pub(crate) struct Session<'a, SPI, CS, CLOCK, DELAY> {
    spi: &'a mut SPI,
    cs: &'a mut CS,
    clock: &'a mut CLOCK,
    delay: &'a mut DELAY,
}

impl<'a, SPI, CS, CLOCK, DELAY> Drop for Session<'a, SPI, CS, CLOCK, DELAY>
where
    CS: OutputPin,
{
    fn drop(&mut self) {
        // Infallible by construction: Drop can't propagate an error, and a
        // stuck CS pin will surface on the next operation's own select.
        let _ = self.cs.set_high();
    }
}

impl<'a, SPI, CS, CLOCK, DELAY> Session<'a, SPI, CS, CLOCK, DELAY>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    CLOCK: Clock,
    DELAY: DelayMs<u32>,
{
    /// Assert chip-select and open a new session.
    pub(crate) fn new(
        spi: &'a mut SPI,
        cs: &'a mut CS,
        clock: &'a mut CLOCK,
        delay: &'a mut DELAY,
    ) -> Result<Self, Error> {
        cs.set_low().map_err(|_| Error::GpioError)?;
        Ok(Session {
            spi,
            cs,
            clock,
            delay,
        })
    }

    /// Deassert chip-select early, without waiting for the guard to drop.
    /// Used mid-operation, e.g. between CMD58's R1 response and its OCR
    /// bytes, or before re-selecting for a later command in the same
    /// public operation.
    pub(crate) fn deselect(&mut self) -> Result<(), Error> {
        self.cs.set_high().map_err(|_| Error::GpioError)
    }

    /// Re-assert chip-select after an explicit [`Self::deselect`].
    pub(crate) fn reselect(&mut self) -> Result<(), Error> {
        self.cs.set_low().map_err(|_| Error::GpioError)
    }

    /// Block for `ms` milliseconds, for callers that need to pace retries
    /// of their own around several session calls.
    pub(crate) fn delay_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms);
    }

    /// Milliseconds elapsed since some arbitrary epoch, for callers that
    /// need to pace a deadline-bounded poll of their own.
    pub(crate) fn now_ms(&mut self) -> u32 {
        self.clock.now_ms()
    }

    /// Clock in one byte by driving 0xFF on the bus.
    pub(crate) fn receive(&mut self) -> Result<u8, Error> {
        raw_receive(self.spi)
    }

    /// Clock out one byte.
    pub(crate) fn send(&mut self, out: u8) -> Result<(), Error> {
        raw_send(self.spi, out)
    }

    /// Send one command frame and return its R1 response.
    pub(crate) fn command(&mut self, cmd: u8, arg: u32) -> Result<u8, Error> {
        raw_command(self.spi, cmd, arg)
    }

    /// Issue `CMD55` followed by an application-specific command.
    pub(crate) fn acommand(&mut self, cmd: u8, arg: u32) -> Result<u8, Error> {
        self.command(CMD55, 0)?;
        self.command(cmd, arg)
    }

    /// Retry a command (10 attempts, 10ms apart) until its R1 response
    /// equals [`R1_READY_STATE`].
    pub(crate) fn command_until_ready(&mut self, cmd: u8, arg: u32) -> Result<(), Error> {
        let spi = &mut *self.spi;
        let delay = &mut *self.delay;
        let ok = retry_count(MAX_RETRIES, RETRY_DELAY_MS, delay, || {
            match raw_command(spi, cmd, arg) {
                Ok(R1_READY_STATE) => Some(()),
                Ok(_r) => {
                    #[cfg(any(feature = "log", feature = "defmt-log"))]
                    warn!("command {:x} got response {:x}, retrying", cmd, _r);
                    None
                }
                Err(_) => None,
            }
        });
        ok.ok_or(Error::CommandTimeout)
    }

    /// Wait up to `timeout_ms` for a data-start token, then read `buffer`
    /// and discard the two trailing CRC bytes.
    pub(crate) fn read_data(&mut self, buffer: &mut [u8], timeout_ms: u32) -> Result<(), Error> {
        let spi = &mut *self.spi;
        let clock = &mut *self.clock;
        let delay = &mut *self.delay;
        let token = poll_until_ms(clock, delay, timeout_ms, 0, || match raw_receive(spi) {
            Ok(0xFF) => None,
            Ok(other) => Some(other),
            Err(_) => Some(0x00),
        });
        if token != Some(DATA_START_BLOCK) {
            return Err(Error::Timeout);
        }

        for b in buffer.iter_mut() {
            *b = self.receive()?;
        }
        // CRC bytes are consumed and discarded; the card's token already
        // told us whether the transfer was well-formed.
        self.receive()?;
        self.receive()?;
        Ok(())
    }

    /// Send a data block prefixed with `token`, followed by two dummy CRC
    /// bytes, and return the card's masked data-response token
    /// (`DATA_RES_ACCEPTED` on success). The card's CRC check is off along
    /// with everything else's, so the trailer value itself is never
    /// verified; the caller decides which public error a rejection becomes.
    pub(crate) fn write_data(&mut self, token: u8, buffer: &[u8]) -> Result<u8, Error> {
        self.send(token)?;
        for &b in buffer.iter() {
            self.send(b)?;
        }
        self.send(0xFF)?;
        self.send(0xFF)?;
        Ok(self.receive()? & DATA_RES_MASK)
    }

    /// Wait up to `timeout_ms` for the card to release busy (any non-zero
    /// byte while driving `0xFF`).
    pub(crate) fn wait_not_busy(&mut self, timeout_ms: u32) -> Result<(), Error> {
        let spi = &mut *self.spi;
        let clock = &mut *self.clock;
        let delay = &mut *self.delay;
        let ready = poll_until_ms(clock, delay, timeout_ms, 0, || match raw_receive(spi) {
            Ok(0x00) => None,
            Ok(_) => Some(()),
            Err(_) => None,
        });
        ready.ok_or(Error::Timeout)
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
