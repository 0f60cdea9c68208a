//! # sdspi-core
//!
//! A block-level driver for SD and MMC memory cards attached over a
//! byte-oriented serial bus in SPI mode. It is written in pure Rust, is
//! `#![no_std]` and does not use `alloc`, for use on resource-constrained
//! microcontrollers with no operating system.
//!
//! This crate does not know anything about file systems — it hands back
//! raw 512-byte blocks. Layer a FAT (or other) implementation on top if you
//! need one.
//!
//! ```rust,ignore
//! # struct DummySpi;
//! # struct DummyPin;
//! # struct DummyClock;
//! # struct DummyDelay;
//! # impl embedded_hal::blocking::spi::Transfer<u8> for DummySpi {
//! #   type Error = ();
//! #   fn transfer<'w>(&mut self, data: &'w mut [u8]) -> Result<&'w [u8], ()> { Ok(data) }
//! # }
//! # impl embedded_hal::digital::v2::OutputPin for DummyPin {
//! #   type Error = ();
//! #   fn set_low(&mut self) -> Result<(), ()> { Ok(()) }
//! #   fn set_high(&mut self) -> Result<(), ()> { Ok(()) }
//! # }
//! # impl embedded_hal::digital::v2::InputPin for DummyPin {
//! #   type Error = ();
//! #   fn is_high(&self) -> Result<bool, ()> { Ok(true) }
//! #   fn is_low(&self) -> Result<bool, ()> { Ok(false) }
//! # }
//! # impl sdspi_core::Clock for DummyClock {
//! #   fn now_ms(&mut self) -> u32 { 0 }
//! # }
//! # impl embedded_hal::blocking::delay::DelayMs<u32> for DummyDelay {
//! #   fn delay_ms(&mut self, _ms: u32) {}
//! # }
//! # let (spi, cs, cd, clock, delay) = (DummySpi, DummyPin, DummyPin, DummyClock, DummyDelay);
//! let mut card = sdspi_core::SdMmc::new(spi, cs, cd, sdspi_core::ActiveLevel::Low, clock, delay);
//! card.init().unwrap();
//! let mut block = [0u8; 512];
//! card.read_block(0, &mut block).unwrap();
//! ```
//!
//! ## Features
//!
//! * `log` (default): log via the `log` crate.
//! * `defmt-log`: disable `log` and log via `defmt` instead.
//!
//! Make sure exactly one of `log` or `defmt-log` is enabled.

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod structure;

pub mod sdmmc;
pub mod transport;

pub use crate::sdmmc::{CardVariant, Error, SdMmc};
pub use crate::transport::{ActiveLevel, Clock};

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
