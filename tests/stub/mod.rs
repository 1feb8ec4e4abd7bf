//! A byte-level SD/MMC card model for driving the disk driver in tests.
//!
//! [`FakeCardBus`] implements the driver's [`Transport`] and feeds every
//! exchanged byte into [`FakeCard`], a small state machine that parses
//! command frames, serves token-framed data packets out of a sparse block
//! store, and accepts write payloads back into it. The bus also advances
//! the shared [`TickTimer`] once per byte, so every timeout in the driver
//! counts down deterministically with no real time involved.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use hex_literal::hex;
use sdmmc_disk::{ClockSpeed, TickTimer, Timing, Transport, SECTOR_SIZE};

/// Timing used by the tests.
///
/// One tick per millisecond of budget; the bus ticks once per byte, so the
/// default 500/1000 ms budgets translate to hundreds of byte-times, which
/// is roomy for every scripted exchange but still finite.
pub fn timing() -> Timing {
    Timing {
        tick_period_ms: 1,
        ready_timeout_ms: 500,
        init_timeout_ms: 1000,
    }
}

/// Which flavour of card the model pretends to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardVariant {
    /// Rejects CMD8 and the application command prefix; wants CMD1.
    Mmc,
    /// Rejects CMD8 but speaks the ACMD41 sequence.
    Sd1,
    /// Echoes the CMD8 voltage pattern; `high_capacity` drives the OCR
    /// capacity bit and block addressing.
    Sd2 { high_capacity: bool },
}

/// In-flight data transfer, if any.
enum Io {
    None,
    Read {
        next_block: u32,
        remaining: Option<u32>,
    },
    Write {
        target: u32,
        multi: bool,
        payload: Option<Vec<u8>>,
    },
}

/// The card model itself. Tests hold an `Rc<RefCell<FakeCard>>` alongside
/// the bus so they can program faults and inspect what the driver did.
pub struct FakeCard {
    pub variant: CardVariant,
    /// Sparse 512-byte block store, indexed by block number.
    pub blocks: HashMap<u32, [u8; SECTOR_SIZE]>,
    pub csd: [u8; 16],
    pub cid: [u8; 16],
    pub ocr: [u8; 4],
    /// Complete command frames the card saw, as (index, argument).
    pub commands: Vec<(u8, u32)>,
    /// Clock rates the driver asked the transport for.
    pub clock_requests: Vec<ClockSpeed>,
    /// Filler bytes clocked in while deselected (SPI-mode entry training).
    pub training_bytes: usize,
    /// Total byte exchanges attempted, selected or not.
    pub exchanges: usize,
    /// Op-condition polls answered "still idle" before reporting ready.
    pub busy_polls: u32,
    /// Answer every selected byte with 0x00 and accept nothing.
    pub stuck_busy: bool,
    /// Corrupt the CMD8 echo pattern.
    pub bad_voltage_echo: bool,
    /// Emit a data-error token instead of the n-th block of a read.
    pub fail_read_at: Option<usize>,
    /// Refuse the n-th written block with a CRC-error data response.
    pub reject_write_at: Option<usize>,
    /// A 0xFD stop token arrived since the last multi-block write began.
    pub saw_stop_token: bool,

    selected: bool,
    idle: bool,
    acmd: bool,
    frame: Vec<u8>,
    output: VecDeque<u8>,
    io: Io,
    blocks_read: usize,
    blocks_written: usize,
}

impl FakeCard {
    pub fn new(variant: CardVariant) -> FakeCard {
        let block_addressed = matches!(variant, CardVariant::Sd2 { high_capacity: true });
        FakeCard {
            variant,
            blocks: HashMap::new(),
            // Real register dumps: a 4 GB SDHC CSD and a 1 GB SD CSD
            csd: if matches!(variant, CardVariant::Sd2 { .. }) {
                hex!("40 0E 00 32 5B 59 00 00 1D 69 7F 80 0A 40 00 8B")
            } else {
                hex!("00 26 00 32 5F 59 83 C8 AD DB CF FF D2 40 40 A5")
            },
            cid: hex!("03 53 44 53 44 33 32 47 80 13 D8 65 01 00 97 2D"),
            ocr: if block_addressed {
                [0xC0, 0xFF, 0x80, 0x00]
            } else {
                [0x80, 0xFF, 0x80, 0x00]
            },
            commands: Vec::new(),
            clock_requests: Vec::new(),
            training_bytes: 0,
            exchanges: 0,
            busy_polls: 0,
            stuck_busy: false,
            bad_voltage_echo: false,
            fail_read_at: None,
            reject_write_at: None,
            saw_stop_token: false,
            selected: false,
            idle: false,
            acmd: false,
            frame: Vec::new(),
            output: VecDeque::new(),
            io: Io::None,
            blocks_read: 0,
            blocks_written: 0,
        }
    }

    pub fn mmc() -> FakeCard {
        FakeCard::new(CardVariant::Mmc)
    }

    pub fn sd1() -> FakeCard {
        FakeCard::new(CardVariant::Sd1)
    }

    pub fn sd2(high_capacity: bool) -> FakeCard {
        FakeCard::new(CardVariant::Sd2 { high_capacity })
    }

    /// How many times a given command index was seen.
    pub fn command_count(&self, index: u8) -> usize {
        self.commands.iter().filter(|c| c.0 == index).count()
    }

    /// Clock one byte in and one byte out, like the SPI shift register does.
    fn exchange(&mut self, mosi: u8) -> u8 {
        self.exchanges += 1;
        if !self.selected {
            if mosi == 0xFF {
                self.training_bytes += 1;
            }
            return 0xFF;
        }
        if self.stuck_busy {
            return 0x00;
        }
        if matches!(self.io, Io::Write { .. }) {
            return self.feed_write(mosi);
        }

        // Command frames start with the 0x40 marker bit; everything else on
        // an idle bus is filler.
        if self.frame.is_empty() {
            if (0x40..0x80).contains(&mosi) {
                self.frame.push(mosi);
            }
        } else {
            self.frame.push(mosi);
            if self.frame.len() == 6 {
                let index = self.frame[0] & 0x3F;
                let argument =
                    u32::from_be_bytes([self.frame[1], self.frame[2], self.frame[3], self.frame[4]]);
                self.frame.clear();
                self.dispatch(index, argument);
            }
        }

        if let Some(byte) = self.output.pop_front() {
            return byte;
        }
        if matches!(self.io, Io::Read { .. }) {
            self.refill_read();
            return self.output.pop_front().unwrap_or(0xFF);
        }
        0xFF
    }

    fn dispatch(&mut self, index: u8, argument: u32) {
        self.commands.push((index, argument));
        let was_acmd = self.acmd;
        self.acmd = index == 55;
        self.output.clear();
        self.io = Io::None;
        // One dead byte of command-response latency before R1
        self.output.push_back(0xFF);
        match index {
            0 => {
                self.idle = true;
                self.push(0x01);
            }
            8 => match self.variant {
                CardVariant::Sd2 { .. } => {
                    self.push(0x01);
                    let pattern = if self.bad_voltage_echo { 0x55 } else { 0xAA };
                    self.push_all(&[0x00, 0x00, 0x01, pattern]);
                }
                _ => self.push(0x05),
            },
            55 => match self.variant {
                CardVariant::Mmc => self.push(0x05),
                _ => self.push(if self.idle { 0x01 } else { 0x00 }),
            },
            41 if was_acmd && self.variant != CardVariant::Mmc => self.op_cond(),
            1 if self.variant == CardVariant::Mmc => self.op_cond(),
            16 => self.push(0x00),
            23 if was_acmd => self.push(0x00),
            58 => {
                self.push(0x00);
                let ocr = self.ocr;
                self.push_all(&ocr);
            }
            9 => {
                self.push(0x00);
                let csd = self.csd;
                self.push_packet(&csd);
            }
            10 => {
                self.push(0x00);
                let cid = self.cid;
                self.push_packet(&cid);
            }
            17 => {
                self.push(0x00);
                self.blocks_read = 0;
                self.io = Io::Read {
                    next_block: self.block_index(argument),
                    remaining: Some(1),
                };
            }
            18 => {
                self.push(0x00);
                self.blocks_read = 0;
                self.io = Io::Read {
                    next_block: self.block_index(argument),
                    remaining: None,
                };
            }
            24 => {
                self.push(0x00);
                self.io = Io::Write {
                    target: self.block_index(argument),
                    multi: false,
                    payload: None,
                };
            }
            25 => {
                self.push(0x00);
                self.saw_stop_token = false;
                self.io = Io::Write {
                    target: self.block_index(argument),
                    multi: true,
                    payload: None,
                };
            }
            12 => {
                // stuff byte, then R1
                self.push(0xFF);
                self.push(0x00);
            }
            _ => self.push(0x05),
        }
    }

    fn op_cond(&mut self) {
        if self.busy_polls > 0 {
            self.busy_polls -= 1;
            self.push(0x01);
        } else {
            self.idle = false;
            self.push(0x00);
        }
    }

    /// Writes own the input stream: tokens, payload bytes and CRC arrive
    /// interleaved with the driver polling for data responses.
    fn feed_write(&mut self, mosi: u8) -> u8 {
        let io = std::mem::replace(&mut self.io, Io::None);
        let Io::Write {
            target,
            multi,
            payload,
        } = io
        else {
            return self.output.pop_front().unwrap_or(0xFF);
        };
        let start_token = if multi { 0xFC } else { 0xFE };
        match payload {
            None => {
                match mosi {
                    0xFD if multi => {
                        self.saw_stop_token = true;
                        // busy while the card commits
                        self.output.push_back(0x00);
                    }
                    token if token == start_token => {
                        self.io = Io::Write {
                            target,
                            multi,
                            payload: Some(Vec::with_capacity(SECTOR_SIZE + 2)),
                        };
                    }
                    _ => {
                        self.io = Io::Write {
                            target,
                            multi,
                            payload: None,
                        };
                    }
                }
                self.output.pop_front().unwrap_or(0xFF)
            }
            Some(mut buffer) => {
                buffer.push(mosi);
                if buffer.len() == SECTOR_SIZE + 2 {
                    let written = self.blocks_written;
                    self.blocks_written += 1;
                    if self.reject_write_at == Some(written) {
                        // CRC-error data response; await the stop token
                        self.output.push_back(0x0B);
                        self.output.push_back(0x00);
                        if multi {
                            self.io = Io::Write {
                                target,
                                multi,
                                payload: None,
                            };
                        }
                    } else {
                        let mut block = [0u8; SECTOR_SIZE];
                        block.copy_from_slice(&buffer[..SECTOR_SIZE]);
                        self.blocks.insert(target, block);
                        self.output.push_back(0x05);
                        self.output.push_back(0x00);
                        if multi {
                            self.io = Io::Write {
                                target: target + 1,
                                multi,
                                payload: None,
                            };
                        }
                    }
                } else {
                    self.io = Io::Write {
                        target,
                        multi,
                        payload: Some(buffer),
                    };
                }
                0xFF
            }
        }
    }

    fn refill_read(&mut self) {
        let (next_block, remaining) = match &self.io {
            Io::Read {
                next_block,
                remaining,
            } => (*next_block, *remaining),
            _ => return,
        };
        if remaining == Some(0) {
            self.io = Io::None;
            return;
        }
        if self.fail_read_at == Some(self.blocks_read) {
            self.output.push_back(0xFF);
            self.output.push_back(0x08); // data error token
            self.io = Io::None;
            return;
        }
        let data = self
            .blocks
            .get(&next_block)
            .copied()
            .unwrap_or([0u8; SECTOR_SIZE]);
        self.blocks_read += 1;
        self.io = Io::Read {
            next_block: next_block + 1,
            remaining: remaining.map(|r| r - 1),
        };
        self.output.push_back(0xFF); // gap before the token
        self.output.push_back(0xFE);
        self.output.extend(data);
        self.output.push_back(0xAA); // CRC filler, never checked
        self.output.push_back(0xBB);
    }

    /// The card interprets command arguments per its own addressing mode.
    fn block_index(&self, argument: u32) -> u32 {
        match self.variant {
            CardVariant::Sd2 {
                high_capacity: true,
            } => argument,
            _ => argument / SECTOR_SIZE as u32,
        }
    }

    fn push(&mut self, byte: u8) {
        self.output.push_back(byte);
    }

    fn push_all(&mut self, bytes: &[u8]) {
        self.output.extend(bytes.iter().copied());
    }

    fn push_packet(&mut self, bytes: &[u8]) {
        self.output.push_back(0xFF);
        self.output.push_back(0xFE);
        self.output.extend(bytes.iter().copied());
        self.output.push_back(0xAA);
        self.output.push_back(0xBB);
    }
}

/// The [`Transport`] half: hands every byte to the shared card model and
/// advances the tick counters once per byte.
pub struct FakeCardBus<'a> {
    card: Rc<RefCell<FakeCard>>,
    ticks: &'a TickTimer,
}

impl<'a> FakeCardBus<'a> {
    pub fn new(card: FakeCard, ticks: &'a TickTimer) -> (FakeCardBus<'a>, Rc<RefCell<FakeCard>>) {
        let card = Rc::new(RefCell::new(card));
        (
            FakeCardBus {
                card: card.clone(),
                ticks,
            },
            card,
        )
    }
}

impl Transport for FakeCardBus<'_> {
    fn transmit(&mut self, byte: u8) {
        self.ticks.tick();
        self.card.borrow_mut().exchange(byte);
    }

    fn receive(&mut self) -> u8 {
        self.ticks.tick();
        self.card.borrow_mut().exchange(0xFF)
    }

    fn select(&mut self) {
        self.card.borrow_mut().selected = true;
    }

    fn deselect(&mut self) {
        self.card.borrow_mut().selected = false;
    }

    fn set_clock(&mut self, speed: ClockSpeed) {
        self.card.borrow_mut().clock_requests.push(speed);
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
