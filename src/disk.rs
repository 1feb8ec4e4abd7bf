//! The SD/MMC disk driver proper.
//!
//! Implements the card initialization state machine, single- and multi-block
//! transfers, and the auxiliary control interface, on top of any byte
//! [`Transport`]. This is optimised for readability and debugability, not
//! performance.

use crate::proto::*;
use crate::timer::{TickTimer, Timing};
use crate::transport::{ClockSpeed, Transport};
use bitflags::bitflags;

use crate::{debug, trace, warn};

/// All sectors are 512 bytes. Cards with other native block lengths are
/// told to use 512 during initialization.
pub const SECTOR_SIZE: usize = 512;

/// One sector's worth of data, read or written in place. The driver never
/// buffers; it clocks bytes straight between the bus and these.
pub type Block = [u8; SECTOR_SIZE];

/// How many byte-times we allow for the R1 response after a command frame.
const RESPONSE_ATTEMPTS: usize = 10;

/// How many byte-times we scan for the response after stop-transmission.
const STOP_RESPONSE_WINDOW: usize = 10;

bitflags! {
    /// Condition flags for the logical drive.
    ///
    /// Several conditions can hold at once, so this is a flag set rather
    /// than an enum. A freshly constructed driver reports
    /// [`DiskStatus::NOT_INITIALIZED`] until an [`SdDisk::initialize`] call
    /// succeeds.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DiskStatus: u8 {
        /// The drive has not (or not successfully) been initialized.
        const NOT_INITIALIZED = 1 << 0;
        /// No card is present in the socket.
        const NO_MEDIA = 1 << 1;
        /// The card is write protected; writes are refused.
        const WRITE_PROTECTED = 1 << 2;
    }
}

#[cfg(feature = "defmt-log")]
impl defmt::Format for DiskStatus {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "DiskStatus({=u8})", self.bits())
    }
}

/// The ways a disk operation can fail.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskError {
    /// The drive index, block count or control request was not valid
    Parameter,
    /// The drive has not been initialized
    NotReady,
    /// The card is write protected
    WriteProtected,
    /// The card stayed busy past the poll deadline
    TimeoutWaitNotBusy,
    /// We didn't get a response when executing this command
    TimeoutCommand(u8),
    /// We didn't get a data token when reading from the card
    TimeoutReadBuffer,
    /// The card echoed the wrong voltage-check pattern
    VoltageCheck,
    /// We got a bad response from Command 58
    Cmd58Error,
    /// The card refused to select a 512 byte block length
    Cmd16Error,
    /// We failed to read a card register
    RegisterReadError,
    /// Error reading from the card
    ReadError,
    /// Error writing to the card
    WriteError,
    /// Couldn't find the card
    CardNotFound,
}

/// The kinds of card the initialization probe can discover.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardType {
    /// A MultiMediaCard.
    ///
    /// Byte addressed, and initialized with plain CMD1 rather than the SD
    /// application command sequence.
    Mmc,
    /// A standard-capacity SD card: v1, or v2 without the capacity bit set.
    ///
    /// Byte addressed, so limited to 2 GiB in size.
    Sd,
    /// A high-capacity 'SDHC' card.
    ///
    /// Block addressed, supporting capacities above 2 GiB.
    Sdhc,
}

impl CardType {
    /// Does this card take block indices (rather than byte offsets) as
    /// command arguments?
    pub fn is_block_addressed(self) -> bool {
        matches!(self, CardType::Sdhc)
    }

    /// Is this a card from the SD command family?
    pub fn is_sd(self) -> bool {
        matches!(self, CardType::Sd | CardType::Sdhc)
    }
}

/// Auxiliary queries and commands dispatched through [`SdDisk::ioctl`].
///
/// Requests that produce data carry the caller's buffer with them.
#[derive(Debug)]
pub enum Ioctl<'a> {
    /// Block until the card has finished any pending write.
    Sync,
    /// Fetch the number of 512-byte sectors on the card, decoded from the
    /// CSD register.
    SectorCount(&'a mut u32),
    /// Fetch the sector size. Always 512.
    SectorSize(&'a mut u16),
    /// Dump the raw 16-byte CSD register.
    ReadCsd(&'a mut [u8; 16]),
    /// Dump the raw 16-byte CID register.
    ReadCid(&'a mut [u8; 16]),
    /// Dump the raw 4-byte OCR register.
    ReadOcr(&'a mut [u8; 4]),
    /// Query or change the socket power state.
    Power(PowerRequest<'a>),
}

/// Sub-codes for [`Ioctl::Power`].
///
/// This socket has no switchable supply rail, so "off" stops further bus
/// activity and drops the flag rather than physically cutting power.
#[derive(Debug)]
pub enum PowerRequest<'a> {
    /// Mark the socket powered down.
    Off,
    /// Bring the bus up at the slow clock rate.
    On,
    /// Read back the power flag.
    Query(&'a mut bool),
}

/// Driver context for one SD/MMC card socket.
///
/// The caller owns this and passes `&mut self` into every operation: the
/// driver is deliberately not reentrant and must belong to a single caller
/// context at a time. The only thing shared with anyone else is the
/// [`TickTimer`], which a periodic interrupt advances while the driver
/// busy-waits.
///
/// Exactly one logical drive (index 0) exists; every entry point takes the
/// drive index anyway because that is the disk contract the filesystem
/// layer expects.
pub struct SdDisk<'t, T>
where
    T: Transport,
{
    transport: T,
    ticks: &'t TickTimer,
    timing: Timing,
    status: DiskStatus,
    card_type: Option<CardType>,
    powered: bool,
}

impl<'t, T> SdDisk<'t, T>
where
    T: Transport,
{
    /// Create a new driver over the given transport.
    ///
    /// Nothing touches the bus until [`SdDisk::initialize`]; the drive
    /// starts out [`DiskStatus::NOT_INITIALIZED`].
    pub fn new(transport: T, ticks: &'t TickTimer, timing: Timing) -> SdDisk<'t, T> {
        SdDisk {
            transport,
            ticks,
            timing,
            status: DiskStatus::NOT_INITIALIZED,
            card_type: None,
            powered: false,
        }
    }

    /// Get the current drive status flags.
    pub fn status(&self, drive: u8) -> DiskStatus {
        if drive != 0 {
            return DiskStatus::NOT_INITIALIZED;
        }
        self.status
    }

    /// The card type discovered by the last successful initialization, or
    /// `None` if the drive is not initialized.
    pub fn card_type(&self) -> Option<CardType> {
        self.card_type
    }

    /// Power the socket up and probe the card.
    ///
    /// On success the returned status has [`DiskStatus::NOT_INITIALIZED`]
    /// cleared and the bus runs at the fast clock. On any failure the
    /// socket is powered back down, the card type is forgotten, and the
    /// caller is expected to retry from the top.
    pub fn initialize(&mut self, drive: u8) -> DiskStatus {
        if drive != 0 {
            return DiskStatus::NOT_INITIALIZED;
        }
        if self.status.contains(DiskStatus::NO_MEDIA) {
            return self.status;
        }

        self.power_on();
        match self.with_select(|disk| disk.acquire()) {
            Ok(card) => {
                debug!("card type: {:?}", card);
                self.card_type = Some(card);
                self.status.remove(DiskStatus::NOT_INITIALIZED);
                self.transport.set_clock(ClockSpeed::Fast);
            }
            Err(_e) => {
                warn!("card probe failed: {:?}", _e);
                self.power_off();
            }
        }
        self.status
    }

    /// Read `blocks.len()` sectors starting at `sector` into `blocks`.
    pub fn read(&mut self, drive: u8, blocks: &mut [Block], sector: u32) -> Result<(), DiskError> {
        self.check_io(drive, blocks.len())?;
        debug!("read {} blocks @ {}", blocks.len(), sector);
        let address = self.byte_or_block_address(sector);
        self.with_select(|disk| {
            if blocks.len() == 1 {
                if disk.command(CMD17, address)? != R1_READY_STATE {
                    return Err(DiskError::ReadError);
                }
                disk.receive_block(&mut blocks[0])
            } else {
                if disk.command(CMD18, address)? != R1_READY_STATE {
                    return Err(DiskError::ReadError);
                }
                let mut outcome = Ok(());
                for block in blocks.iter_mut() {
                    if let Err(e) = disk.receive_block(block) {
                        outcome = Err(e);
                        break;
                    }
                }
                // The card streams until told to stop, even when a block
                // failed to frame on our side.
                let _ = disk.stop_transmission();
                outcome
            }
        })
    }

    /// Write `blocks.len()` sectors starting at `sector` from `blocks`.
    pub fn write(&mut self, drive: u8, blocks: &[Block], sector: u32) -> Result<(), DiskError> {
        self.check_io(drive, blocks.len())?;
        if self.status.contains(DiskStatus::WRITE_PROTECTED) {
            return Err(DiskError::WriteProtected);
        }
        debug!("write {} blocks @ {}", blocks.len(), sector);
        let address = self.byte_or_block_address(sector);
        self.with_select(|disk| {
            if blocks.len() == 1 {
                if disk.command(CMD24, address)? != R1_READY_STATE {
                    return Err(DiskError::WriteError);
                }
                disk.send_block(DATA_START_BLOCK, &blocks[0])
            } else {
                if matches!(disk.card_type, Some(card) if card.is_sd()) {
                    // Pre-erase hint; cards that ignore it still work
                    let _ = disk.command(CMD55, 0);
                    let _ = disk.command(ACMD23, blocks.len() as u32);
                }
                if disk.command(CMD25, address)? != R1_READY_STATE {
                    return Err(DiskError::WriteError);
                }
                let mut outcome = Ok(());
                for block in blocks.iter() {
                    if let Err(e) = disk.send_block(WRITE_MULTIPLE_TOKEN, block) {
                        outcome = Err(e);
                        break;
                    }
                }
                // Close the stream whether or not every block was taken
                let stop = disk.send_stop_token();
                outcome.and(stop)
            }
        })
    }

    /// Dispatch an auxiliary control request.
    pub fn ioctl(&mut self, drive: u8, request: Ioctl<'_>) -> Result<(), DiskError> {
        if drive != 0 {
            return Err(DiskError::Parameter);
        }

        // Power control works whatever state the drive is in
        let request = match request {
            Ioctl::Power(power) => {
                match power {
                    PowerRequest::Off => {
                        if self.powered {
                            self.power_off();
                        }
                    }
                    PowerRequest::On => self.power_on(),
                    PowerRequest::Query(state) => *state = self.powered,
                }
                return Ok(());
            }
            request => request,
        };

        if self.status.contains(DiskStatus::NOT_INITIALIZED) {
            return Err(DiskError::NotReady);
        }
        self.with_select(|disk| match request {
            Ioctl::Sync => disk.wait_ready(),
            Ioctl::SectorCount(count) => {
                if disk.command(CMD9, 0)? != R1_READY_STATE {
                    return Err(DiskError::RegisterReadError);
                }
                let mut raw = [0u8; 16];
                disk.receive_block(&mut raw)?;
                *count = Csd::parse(raw).card_capacity_blocks();
                Ok(())
            }
            Ioctl::SectorSize(size) => {
                *size = SECTOR_SIZE as u16;
                Ok(())
            }
            Ioctl::ReadCsd(buffer) => {
                if disk.command(CMD9, 0)? != R1_READY_STATE {
                    return Err(DiskError::RegisterReadError);
                }
                disk.receive_block(buffer)
            }
            Ioctl::ReadCid(buffer) => {
                if disk.command(CMD10, 0)? != R1_READY_STATE {
                    return Err(DiskError::RegisterReadError);
                }
                disk.receive_block(buffer)
            }
            Ioctl::ReadOcr(buffer) => {
                if disk.command(CMD58, 0)? != R1_READY_STATE {
                    return Err(DiskError::RegisterReadError);
                }
                for byte in buffer.iter_mut() {
                    *byte = disk.transport.receive();
                }
                Ok(())
            }
            // Power requests returned early above
            Ioctl::Power(_) => Err(DiskError::Parameter),
        })
    }

    /// Probe the card and bring it to the ready state.
    ///
    /// Runs with chip-select already asserted. The long counter bounds the
    /// whole sequence; each command additionally bounds its own busy-wait
    /// with the short counter.
    fn acquire(&mut self) -> Result<CardType, DiskError> {
        trace!("reset card");
        if self.command(CMD0, 0)? != R1_IDLE_STATE {
            return Err(DiskError::CardNotFound);
        }
        self.ticks.arm_long(self.timing.init_ticks());

        if self.command(CMD8, 0x1AA)? == R1_IDLE_STATE {
            // SDC v2: the card echoes the voltage-check pattern back
            let mut echo = [0u8; 4];
            for byte in echo.iter_mut() {
                *byte = self.transport.receive();
            }
            if echo[2] != 0x01 || echo[3] != 0xAA {
                return Err(DiskError::VoltageCheck);
            }
            loop {
                if self.command(CMD55, 0)? <= R1_IDLE_STATE
                    && self.command(ACMD41, 1 << 30)? == R1_READY_STATE
                {
                    break;
                }
                if self.ticks.long_expired() {
                    return Err(DiskError::TimeoutCommand(ACMD41));
                }
            }
            if self.command(CMD58, 0)? != R1_READY_STATE {
                return Err(DiskError::Cmd58Error);
            }
            let mut ocr = [0u8; 4];
            for byte in ocr.iter_mut() {
                *byte = self.transport.receive();
            }
            // The capacity bit tells us whether the card is block addressed
            if ocr[0] & 0x40 != 0 {
                Ok(CardType::Sdhc)
            } else {
                Ok(CardType::Sd)
            }
        } else {
            // SDC v1 or MMC: see which op-condition command is accepted
            let card = if self.command(CMD55, 0)? <= R1_IDLE_STATE
                && self.command(ACMD41, 0)? <= R1_IDLE_STATE
            {
                CardType::Sd
            } else {
                CardType::Mmc
            };
            loop {
                let ready = match card {
                    CardType::Sd => {
                        self.command(CMD55, 0)? <= R1_IDLE_STATE
                            && self.command(ACMD41, 0)? == R1_READY_STATE
                    }
                    _ => self.command(CMD1, 0)? == R1_READY_STATE,
                };
                if ready {
                    break;
                }
                if self.ticks.long_expired() {
                    return Err(DiskError::TimeoutCommand(match card {
                        CardType::Sd => ACMD41,
                        _ => CMD1,
                    }));
                }
            }
            // Legacy cards may default to another block length
            if self.command(CMD16, SECTOR_SIZE as u32)? != R1_READY_STATE {
                return Err(DiskError::Cmd16Error);
            }
            Ok(card)
        }
    }

    fn check_io(&self, drive: u8, count: usize) -> Result<(), DiskError> {
        if drive != 0 || count == 0 {
            return Err(DiskError::Parameter);
        }
        if self.status.contains(DiskStatus::NOT_INITIALIZED) {
            return Err(DiskError::NotReady);
        }
        Ok(())
    }

    /// Sectors become byte offsets on byte-addressed cards.
    fn byte_or_block_address(&self, sector: u32) -> u32 {
        match self.card_type {
            Some(card) if card.is_block_addressed() => sector,
            _ => sector * SECTOR_SIZE as u32,
        }
    }

    fn power_on(&mut self) {
        // Cards must be probed slowly, and need at least 74 clocks with
        // chip-select released before they will accept SPI commands.
        self.transport.set_clock(ClockSpeed::Slow);
        self.transport.deselect();
        for _ in 0..10 {
            self.transport.transmit(0xFF);
        }
        self.powered = true;
    }

    fn power_off(&mut self) {
        // No switchable supply rail on this socket: dropping the flag stops
        // further bus activity, and the drive must be re-initialized.
        self.powered = false;
        self.card_type = None;
        self.status.insert(DiskStatus::NOT_INITIALIZED);
    }

    /// Run `func` with the chip selected, then always release the select
    /// line and give the card one more clock to let go of its data-out pin.
    fn with_select<F, R>(&mut self, func: F) -> Result<R, DiskError>
    where
        F: FnOnce(&mut Self) -> Result<R, DiskError>,
    {
        self.transport.select();
        let result = func(self);
        self.transport.deselect();
        let _ = self.transport.receive();
        result
    }

    /// Spin until the card signals ready (0xFF), bounded by the short
    /// counter.
    fn wait_ready(&mut self) -> Result<(), DiskError> {
        self.ticks.arm_short(self.timing.ready_ticks());
        let _ = self.transport.receive();
        loop {
            if self.transport.receive() == 0xFF {
                return Ok(());
            }
            if self.ticks.short_expired() {
                return Err(DiskError::TimeoutWaitNotBusy);
            }
        }
    }

    /// Send a command frame and collect its R1 response.
    fn command(&mut self, command: u8, argument: u32) -> Result<u8, DiskError> {
        self.wait_ready()?;

        let frame = [
            0x40 | command,
            (argument >> 24) as u8,
            (argument >> 16) as u8,
            (argument >> 8) as u8,
            argument as u8,
            match command {
                // Only the two bootstrap commands need a real checksum;
                // after them the card runs with CRC checking off.
                CMD0 => CMD0_CHECKSUM,
                CMD8 => CMD8_CHECKSUM,
                _ => DUMMY_CHECKSUM,
            },
        ];
        for byte in frame {
            self.transport.transmit(byte);
        }

        // The response turns up within a few byte times, top bit clear
        for _ in 0..RESPONSE_ATTEMPTS {
            let response = self.transport.receive();
            if response & 0x80 == 0 {
                return Ok(response);
            }
        }
        Err(DiskError::TimeoutCommand(command))
    }

    /// Terminate a multi-block read.
    ///
    /// This is the one command sent while the card may still be streaming
    /// data at us, so it must not wait for ready first. Cards disagree on
    /// how many filler bytes precede the response; scan a fixed window and
    /// keep the last real byte seen.
    fn stop_transmission(&mut self) -> Result<u8, DiskError> {
        for byte in [0x40 | CMD12, 0, 0, 0, 0, DUMMY_CHECKSUM] {
            self.transport.transmit(byte);
        }
        let mut response = None;
        for _ in 0..STOP_RESPONSE_WINDOW {
            let byte = self.transport.receive();
            if byte != 0xFF {
                response = Some(byte);
            }
        }
        response.ok_or(DiskError::TimeoutCommand(CMD12))
    }

    /// Receive one token-framed data packet into `buffer`.
    fn receive_block(&mut self, buffer: &mut [u8]) -> Result<(), DiskError> {
        self.ticks.arm_short(self.timing.ready_ticks());
        let token = loop {
            let byte = self.transport.receive();
            if byte != 0xFF {
                break byte;
            }
            if self.ticks.short_expired() {
                return Err(DiskError::TimeoutReadBuffer);
            }
        };
        if token != DATA_START_BLOCK {
            return Err(DiskError::ReadError);
        }
        for byte in buffer.iter_mut() {
            *byte = self.transport.receive();
        }
        // Two CRC bytes are clocked through but never checked; the link is
        // trusted.
        let _ = self.transport.receive();
        let _ = self.transport.receive();
        Ok(())
    }

    /// Transmit one token-framed data packet and check the card took it.
    fn send_block(&mut self, token: u8, data: &[u8]) -> Result<(), DiskError> {
        self.wait_ready()?;
        self.transport.transmit(token);
        for &byte in data {
            self.transport.transmit(byte);
        }
        // Filler CRC; the card ignores it in SPI mode
        self.transport.transmit(DUMMY_CHECKSUM);
        self.transport.transmit(DUMMY_CHECKSUM);
        let response = self.transport.receive();
        if response & DATA_RES_MASK != DATA_RES_ACCEPTED {
            return Err(DiskError::WriteError);
        }
        Ok(())
    }

    /// Close a multi-block write stream.
    fn send_stop_token(&mut self) -> Result<(), DiskError> {
        self.wait_ready()?;
        self.transport.transmit(STOP_TRAN_TOKEN);
        Ok(())
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
