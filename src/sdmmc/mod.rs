//! sdspi-core - SPI-mode SD/MMC protocol core.
//!
//! Implements the command framing, initialization state machine, and block
//! transfer engine for SD and MMC cards talked to over a byte-oriented
//! serial bus in SPI mode. This is the hard part this crate exists for;
//! everything else (transport, pins, clock) is injected as a trait so the
//! core stays host-agnostic and testable against a mock.

mod session;
use session::Session;

pub mod proto;
use proto::*;

use crate::transport::{ActiveLevel, Clock};

use core::convert::TryInto;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::{InputPin, OutputPin};

#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

/// The possible errors this driver can return.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone)]
pub enum Error {
    /// The card-detect line didn't match the configured active level at `init`.
    CardNotPresent,
    /// The response framer exhausted its retries waiting for a non-`0xFF` byte.
    CommandTimeout,
    /// A command's R1 response was non-zero when zero was required.
    CommandFailed,
    /// A generic busy-wait exceeded its configured deadline.
    Timeout,
    /// Capacity negotiation or block-length setup failed during `init`.
    InitFailed,
    /// `write_block` failed: rejected after retries, a data-response token
    /// other than accepted, or a busy-wait timeout.
    WriteBlockFailed,
    /// `write_blocks` failed, for the same reasons as [`Error::WriteBlockFailed`].
    WriteBlocksFailed,
    /// `read_block` failed: rejected after retries, or no data-start token
    /// within the read timeout.
    ReadBlockFailed,
    /// `read_blocks` failed, for the same reasons as [`Error::ReadBlockFailed`].
    ReadBlocksFailed,
    /// One of CMD32/CMD33/CMD38 returned a non-zero R1 response.
    EraseBlocksFailed,
    /// The injected SPI transport returned an error.
    Transport,
    /// The chip-select or card-detect pin returned an error.
    GpioError,
}

/// The four valid combinations of card version, card type and addressing
/// mode, populated exactly once by [`SdMmc::init`].
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardVariant {
    /// MMC v3, byte-addressed.
    MmcV3,
    /// SD v1, byte-addressed.
    SdV1,
    /// SD v2 standard-capacity, byte-addressed.
    SdV2Sdsc,
    /// SD v2 high-capacity, block-addressed.
    SdV2Sdhc,
}

impl CardVariant {
    fn card_version(self) -> u8 {
        match self {
            CardVariant::MmcV3 | CardVariant::SdV1 => 1,
            CardVariant::SdV2Sdsc | CardVariant::SdV2Sdhc => 2,
        }
    }

    fn card_type(self) -> u8 {
        match self {
            CardVariant::MmcV3 => 3,
            CardVariant::SdV1 | CardVariant::SdV2Sdsc | CardVariant::SdV2Sdhc => 1,
        }
    }

    fn is_high_capacity(self) -> bool {
        matches!(self, CardVariant::SdV2Sdhc)
    }
}

/// A handle to an SD or MMC card attached over a byte-oriented serial bus in
/// SPI mode.
///
/// Generic over the SPI transport, the chip-select pin, the card-detect
/// pin, the monotonic clock and the blocking delay, so the core never
/// touches hardware directly and can be driven by a mock in tests.
pub struct SdMmc<SPI, CS, CD, CLOCK, DELAY>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    CD: InputPin,
{
    spi: SPI,
    cs: CS,
    cd: CD,
    cd_active: ActiveLevel,
    clock: CLOCK,
    delay: DELAY,
    variant: Option<CardVariant>,
}

impl<SPI, CS, CD, CLOCK, DELAY> SdMmc<SPI, CS, CD, CLOCK, DELAY>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    CD: InputPin,
    CLOCK: Clock,
    DELAY: DelayMs<u32>,
{
    /// Bind a new, uninitialized handle to the given collaborators. Call
    /// [`Self::init`] before issuing any block operation.
    pub fn new(spi: SPI, cs: CS, cd: CD, cd_active: ActiveLevel, clock: CLOCK, delay: DELAY) -> Self {
        SdMmc {
            spi,
            cs,
            cd,
            cd_active,
            clock,
            delay,
            variant: None,
        }
    }

    /// Whether [`Self::init`] has completed successfully.
    pub fn is_initialized(&self) -> bool {
        self.variant.is_some()
    }

    /// Whether the card addresses storage in 512-byte blocks (`true`) or
    /// bytes (`false`). Only meaningful once [`Self::is_initialized`].
    pub fn is_high_capacity(&self) -> bool {
        self.variant.map_or(false, CardVariant::is_high_capacity)
    }

    /// `1` for SD cards, `2` for SD v2 cards. Only meaningful once
    /// [`Self::is_initialized`].
    pub fn card_version(&self) -> u8 {
        self.variant.map_or(0, CardVariant::card_version)
    }

    /// `1` for SD cards, `3` for MMC cards. Only meaningful once
    /// [`Self::is_initialized`].
    pub fn card_type(&self) -> u8 {
        self.variant.map_or(0, CardVariant::card_type)
    }

    /// The card variant discovered during [`Self::init`], if any.
    pub fn variant(&self) -> Option<CardVariant> {
        self.variant
    }

    fn session(&mut self) -> Result<Session<'_, SPI, CS, CLOCK, DELAY>, Error> {
        Session::new(&mut self.spi, &mut self.cs, &mut self.clock, &mut self.delay)
    }

    /// Clock one dummy byte with chip-select deasserted. Called exactly
    /// once at the end of every public operation, regardless of how many
    /// internal select/deselect cycles the operation used.
    fn finish(&mut self) -> Result<(), Error> {
        self.cs.set_high().map_err(|_| Error::GpioError)?;
        self.spi
            .transfer(&mut [0xFF])
            .map(|_| ())
            .map_err(|_| Error::Transport)
    }

    fn address_arg(&self, lba: u32) -> u32 {
        if self.is_high_capacity() {
            lba
        } else {
            lba.wrapping_mul(512)
        }
    }

    /// Re-read the card-detect line against its configured active level.
    pub fn is_present(&mut self) -> bool {
        let level = self.cd.is_high();
        match (level, self.cd_active) {
            (Ok(true), ActiveLevel::High) => true,
            (Ok(false), ActiveLevel::Low) => true,
            _ => false,
        }
    }

    /// Briefly select then deselect the card, reporting whether it held the
    /// bus at `0x00` while selected (i.e. is mid-program/erase).
    pub fn is_busy(&mut self) -> bool {
        let busy = (|| -> Result<bool, Error> {
            let mut session = self.session()?;
            let byte = session.receive()?;
            Ok(byte == 0x00)
        })();
        let _ = self.finish();
        busy.unwrap_or(false)
    }

    /// Run the full initialization state machine: presence check, power-up
    /// clocking, reset, and card-type/capacity discovery.
    ///
    /// Idempotent (P6): calling this again on an already-initialized handle
    /// simply re-runs the sequence and repopulates [`CardVariant`].
    pub fn init(&mut self) -> Result<(), Error> {
        if !self.is_present() {
            return Err(Error::CardNotPresent);
        }

        trace!("power-up clocking");
        self.cs.set_high().map_err(|_| Error::GpioError)?;
        for _ in 0..15 {
            self.spi
                .transfer(&mut [0xFF])
                .map_err(|_| Error::Transport)?;
        }

        let result = self.init_inner();
        let _ = self.finish();
        result.map(|variant| {
            self.variant = Some(variant);
            debug!("init complete: {:?}", variant);
        })
    }

    fn init_inner(&mut self) -> Result<CardVariant, Error> {
        {
            let mut session = self.session()?;
            trace!("go idle");
            let mut went_idle = false;
            let mut attempt = 0;
            while !went_idle && attempt < MAX_RETRIES {
                went_idle = session
                    .command(CMD0, 0)
                    .map(|r| r == R1_IDLE_STATE)
                    .unwrap_or(false);
                attempt += 1;
                if !went_idle && attempt < MAX_RETRIES {
                    session.delay_ms(RETRY_DELAY_MS);
                }
            }
        }

        let mut session = self.session()?;

        trace!("probe interface condition");
        let cmd8 = session.command(CMD8, 0x0000_01AA)?;
        if cmd8 == R1_IDLE_STATE {
            // SD v2: read back the echoed check pattern.
            session.receive()?;
            session.receive()?;
            session.receive()?;
            session.receive()?;

            let ready = poll_ready(&mut session, |s| s.acommand(ACMD41, 0x4000_0000))?;
            if !ready {
                return Err(Error::InitFailed);
            }

            session.deselect()?;
            session.reselect()?;
            if session.command(CMD58, 0)? != R1_READY_STATE {
                return Err(Error::InitFailed);
            }
            let ocr0 = session.receive()?;
            session.receive()?;
            session.receive()?;
            session.receive()?;

            if (ocr0 & 0xC0) == 0xC0 {
                debug!("card is SDHC");
                Ok(CardVariant::SdV2Sdhc)
            } else {
                session.deselect()?;
                session.reselect()?;
                if session.command(CMD16, 512)? != R1_READY_STATE {
                    return Err(Error::InitFailed);
                }
                debug!("card is SD v2 SDSC");
                Ok(CardVariant::SdV2Sdsc)
            }
        } else {
            trace!("card rejected CMD8, probing SD v1 / MMC");
            let first = session.acommand(ACMD41, 0x4000_0000)?;
            let (variant, use_acmd41) = if first <= R1_IDLE_STATE {
                (CardVariant::SdV1, true)
            } else {
                (CardVariant::MmcV3, false)
            };

            let ready = if use_acmd41 {
                poll_ready(&mut session, |s| s.acommand(ACMD41, 0x4000_0000))?
            } else {
                poll_ready(&mut session, |s| s.command(CMD1, 0x4000_0000))?
            };
            if !ready {
                return Err(Error::InitFailed);
            }

            if session.command(CMD16, 512)? != R1_READY_STATE {
                return Err(Error::InitFailed);
            }
            debug!("card is {:?}", variant);
            Ok(variant)
        }
    }

    /// Read a single 512-byte block at `lba`.
    pub fn read_block(&mut self, lba: u32, out: &mut [u8; 512]) -> Result<(), Error> {
        let arg = self.address_arg(lba);
        let result = (|| -> Result<(), Error> {
            let mut session = self.session()?;
            if session.command_until_ready(CMD17, arg).is_err() {
                return Err(Error::ReadBlockFailed);
            }
            session
                .read_data(out, READ_TOKEN_TIMEOUT_MS)
                .map_err(|_| Error::ReadBlockFailed)
        })();
        self.finish()?;
        result
    }

    /// Read `count` (1..=128) consecutive 512-byte blocks starting at `lba`.
    pub fn read_blocks(&mut self, lba: u32, out: &mut [u8], count: u32) -> Result<(), Error> {
        debug_assert!((1..=128).contains(&count));
        let arg = self.address_arg(lba);
        let result = (|| -> Result<(), Error> {
            let mut session = self.session()?;
            if session.command_until_ready(CMD18, arg).is_err() {
                return Err(Error::ReadBlocksFailed);
            }

            let mut saw_timeout = false;
            for block in out.chunks_exact_mut(512).take(count as usize) {
                let buf: &mut [u8; 512] = block.try_into().unwrap();
                if session.read_data(buf, READ_TOKEN_TIMEOUT_MS).is_err() {
                    saw_timeout = true;
                    warn!("multi-block read: token timeout");
                }
            }

            // Always stop transmission, even after a token timeout, to
            // return the card to a known state.
            session.deselect()?;
            session.reselect()?;
            let _ = session.command(CMD12, 0);

            if saw_timeout {
                Err(Error::ReadBlocksFailed)
            } else {
                Ok(())
            }
        })();
        self.finish()?;
        result
    }

    /// Write a single 512-byte block at `lba`.
    pub fn write_block(&mut self, lba: u32, data: &[u8; 512]) -> Result<(), Error> {
        let arg = self.address_arg(lba);
        let result = (|| -> Result<(), Error> {
            let mut session = self.session()?;
            if session.command_until_ready(CMD24, arg).is_err() {
                return Err(Error::WriteBlockFailed);
            }
            let response = session
                .write_data(DATA_START_BLOCK, data)
                .map_err(|_| Error::WriteBlockFailed)?;
            if response != DATA_RES_ACCEPTED {
                warn!("write rejected, token {:x}", response);
                return Err(Error::WriteBlockFailed);
            }
            session
                .wait_not_busy(WRITE_BUSY_TIMEOUT_MS)
                .map_err(|_| Error::WriteBlockFailed)
        })();
        self.finish()?;
        result
    }

    /// Write `count` (1..=128) consecutive 512-byte blocks starting at `lba`.
    pub fn write_blocks(&mut self, lba: u32, data: &[u8], count: u32) -> Result<(), Error> {
        debug_assert!((1..=128).contains(&count));
        let arg = self.address_arg(lba);
        let high_capacity = self.is_high_capacity();
        let result = (|| -> Result<(), Error> {
            let mut session = self.session()?;

            if high_capacity {
                session
                    .acommand(ACMD23, count)
                    .map_err(|_| Error::WriteBlocksFailed)?;
            }

            if session.command_until_ready(CMD25, arg).is_err() {
                return Err(Error::WriteBlocksFailed);
            }

            for block in data.chunks_exact(512).take(count as usize) {
                let response = session
                    .write_data(WRITE_MULTIPLE_TOKEN, block)
                    .map_err(|_| Error::WriteBlocksFailed)?;
                if response != DATA_RES_ACCEPTED {
                    warn!("multi-block write rejected, token {:x}", response);
                    return Err(Error::WriteBlocksFailed);
                }
                session
                    .wait_not_busy(WRITE_BUSY_TIMEOUT_MS)
                    .map_err(|_| Error::WriteBlocksFailed)?;
            }

            session
                .wait_not_busy(WRITE_BUSY_TIMEOUT_MS)
                .map_err(|_| Error::WriteBlocksFailed)?;
            session
                .send(STOP_TRAN_TOKEN)
                .map_err(|_| Error::WriteBlocksFailed)
        })();
        self.finish()?;
        result
    }

    /// Erase `count` blocks starting at `lba`.
    pub fn erase_blocks(&mut self, lba: u32, count: u32) -> Result<(), Error> {
        let start = self.address_arg(lba);
        let end = self.address_arg(lba + count.saturating_sub(1));
        let result = (|| -> Result<(), Error> {
            let mut session = self.session()?;
            if session.command(CMD32, start)? != R1_READY_STATE {
                return Err(Error::EraseBlocksFailed);
            }
            if session.command(CMD33, end)? != R1_READY_STATE {
                return Err(Error::EraseBlocksFailed);
            }
            if session.command(CMD38, 0)? != R1_READY_STATE {
                return Err(Error::EraseBlocksFailed);
            }
            session
                .wait_not_busy(ERASE_BUSY_TIMEOUT_MS)
                .map_err(|_| Error::EraseBlocksFailed)
        })();
        self.finish()?;
        result
    }

    /// Read the CSD register and return the card's capacity in 512-byte
    /// sectors.
    pub fn sector_count(&mut self) -> Result<u32, Error> {
        let result = (|| -> Result<u32, Error> {
            let mut session = self.session()?;
            if session.command(CMD9, 0)? != R1_READY_STATE {
                return Err(Error::CommandFailed);
            }
            let mut raw = [0u8; 16];
            session
                .read_data(&mut raw, READ_TOKEN_TIMEOUT_MS)
                .map_err(|_| Error::Timeout)?;
            Ok(Csd::parse(raw).sector_count())
        })();
        self.finish()?;
        result
    }
}

/// Issue `step` repeatedly, 100ms apart, until it returns `R1_READY_STATE`
/// or `timeout_ms` has elapsed. Used for the ACMD41/CMD1 capacity poll.
fn poll_ready<SPI, CS, CLOCK, DELAY>(
    session: &mut Session<'_, SPI, CS, CLOCK, DELAY>,
    mut step: impl FnMut(&mut Session<'_, SPI, CS, CLOCK, DELAY>) -> Result<u8, Error>,
) -> Result<bool, Error>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    CLOCK: Clock,
    DELAY: DelayMs<u32>,
{
    let deadline = session.now_ms().wrapping_add(INIT_POLL_TIMEOUT_MS);
    loop {
        if step(session)? == R1_READY_STATE {
            return Ok(true);
        }
        if session.now_ms() >= deadline {
            return Ok(false);
        }
        session.delay_ms(INIT_POLL_DELAY_MS);
    }
}

#[cfg(test)]
mod test;

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
