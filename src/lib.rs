//! # sdmmc-disk
//!
//! > An SPI-mode SD/MMC disk driver written in Embedded Rust
//!
//! This crate drives an SD or MMC card over a plain SPI bus and exposes the
//! low-level disk entry points a filesystem engine builds on: initialize,
//! status, read, write and ioctl. It speaks the SD/MMC SPI command protocol,
//! works out what kind of card is fitted (MMC, SDC v1, SDC v2 byte- or
//! block-addressed), frames single- and multi-block transfers, and bounds
//! every busy-wait with a tick-driven timeout. It is written in pure-Rust,
//! is `#![no_std]` and does not allocate.
//!
//! The driver knows nothing about file formats: it moves 512-byte sectors.
//! Mount a FAT (or any other) implementation on top of it.
//!
//! ## Using the crate
//!
//! You need three things: something that implements the byte [`Transport`]
//! to your card socket, a [`TickTimer`] that an external periodic timer
//! (nominally every 10 ms) advances, and a [`Timing`] describing your tick
//! period and timeout budgets.
//!
//! ```rust
//! use sdmmc_disk::{Block, DiskError, DiskStatus, SdDisk, TickTimer, Timing, Transport};
//!
//! fn dump_first_sector<T: Transport>(
//!     transport: T,
//!     ticks: &TickTimer,
//! ) -> Result<Block, DiskError> {
//!     let mut disk = SdDisk::new(transport, ticks, Timing::default());
//!     if disk.initialize(0).contains(DiskStatus::NOT_INITIALIZED) {
//!         return Err(DiskError::NotReady);
//!     }
//!     let mut block: Block = [0; sdmmc_disk::SECTOR_SIZE];
//!     disk.read(0, core::slice::from_mut(&mut block), 0)?;
//!     Ok(block)
//! }
//! ```
//!
//! The [`TickTimer`] is `Sync`, so a `static` one can be shared between the
//! driver and the timer interrupt handler that calls [`TickTimer::tick`].
//!
//! ## Features
//!
//! * `log`: Enabled by default. Generates log messages using the `log`
//!   crate.
//! * `defmt-log`: By turning off the default features and enabling the
//!   `defmt-log` feature you can configure this crate to log messages over
//!   defmt instead.
//!
//! You cannot enable both the `log` feature and the `defmt-log` feature.

#![cfg_attr(not(test), no_std)]

#[cfg(test)]
#[macro_use]
extern crate hex_literal;

#[macro_use]
mod structure;

pub mod disk;
pub mod proto;
pub mod timer;
pub mod transport;

pub use disk::{Block, CardType, DiskError, DiskStatus, Ioctl, PowerRequest, SdDisk, SECTOR_SIZE};
pub use timer::{TickTimer, Timing};
pub use transport::{ClockSpeed, SpiBusTransport, Transport};

#[cfg(all(feature = "defmt-log", feature = "log"))]
compile_error!("Cannot enable both log and defmt-log");

#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::debug! but does nothing at all
macro_rules! debug {
    ($($arg:tt)+) => {};
}

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::trace! but does nothing at all
macro_rules! trace {
    ($($arg:tt)+) => {};
}

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::warn! but does nothing at all
macro_rules! warn {
    ($($arg:tt)+) => {};
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
