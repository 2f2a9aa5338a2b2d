// Copyright 2020-2021 VX Probe Project Developers
// Dual licensed under the Apache 2.0 and MIT licenses.

//! A bit-level simulated SWD target for the unit tests.
//!
//! [`SimTarget`] implements [`SwdIo`] and decodes the probe's traffic edge
//! by edge: request headers are sampled on rising clock edges while the
//! probe drives SWDIO, acknowledge and read-data bits are presented on
//! falling edges, and write data is collected and committed against a
//! small model of a SW-DP with one MEM-AP behind it (SELECT banking,
//! posted reads through RDBUFF, TAR auto-increment that carries only into
//! the low ten bits, sticky CTRL/STAT error bits cleared through ABORT).
//!
//! Tests can preload target memory, force WAIT/FAULT/garbage acknowledge
//! values or corrupted read parity, and inspect the recorded transaction
//! stream afterwards.

use std::collections::{BTreeMap, VecDeque};

use crate::io::SwdIo;
use crate::swd::{Direction, Port};

const ACK_OK: u8 = 0b001;
const ACK_FAULT: u8 = 0b100;

/// STICKYORUN, STICKYCMP, STICKYERR, WDATAERR.
const STICKY_MASK: u32 = (1 << 7) | (1 << 5) | (1 << 4) | (1 << 1);

/// A decoded, validated request header and how the target answered it.
#[derive(Copy, Clone, Debug)]
pub struct SeenRequest {
    pub port: Port,
    pub dir: Direction,
    pub a: u8,
    pub ack: u8,
}

struct PendingWrite {
    commit: bool,
    port: Port,
    a: u8,
    bits: u64,
    count: u8,
}

pub struct SimTarget {
    // Wire state.
    swclk: bool,
    host_drive: bool,
    host_level: bool,
    presenting: Option<bool>,
    drive_bits: VecDeque<bool>,
    turn_falls: u8,
    pending_write: Option<PendingWrite>,
    recv: Option<PendingWrite>,

    // Header decoding.
    collecting: bool,
    header: u8,
    header_bits: u8,
    ones_run: u32,
    shift16: u16,

    // Register model.
    pub idcode: u32,
    pub ctrlstat: u32,
    pub select: u32,
    pub csw: u32,
    pub tar: u32,
    rdbuff: u32,
    mem: BTreeMap<u32, u32>,

    // Fault scripting.
    pub force_acks: VecDeque<u8>,
    pub corrupt_read_parity: usize,

    // Records.
    pub requests: Vec<SeenRequest>,
    pub tar_writes: Vec<u32>,
    pub select_writes: Vec<u32>,
    pub abort_writes: Vec<u32>,
    pub line_resets: u32,
    pub jtag_to_swd_seqs: u32,
    pub reset_levels: Vec<bool>,
    pub led: Option<bool>,
}

impl SimTarget {
    pub fn new() -> Self {
        SimTarget {
            swclk: true,
            host_drive: false,
            host_level: true,
            presenting: None,
            drive_bits: VecDeque::new(),
            turn_falls: 0,
            pending_write: None,
            recv: None,
            collecting: false,
            header: 0,
            header_bits: 0,
            ones_run: 0,
            shift16: 0,
            idcode: 0x1BA0_1477,
            ctrlstat: 0,
            select: 0,
            csw: 0,
            tar: 0,
            rdbuff: 0,
            mem: BTreeMap::new(),
            force_acks: VecDeque::new(),
            corrupt_read_parity: 0,
            requests: Vec::new(),
            tar_writes: Vec::new(),
            select_writes: Vec::new(),
            abort_writes: Vec::new(),
            line_resets: 0,
            jtag_to_swd_seqs: 0,
            reset_levels: Vec::new(),
            led: None,
        }
    }

    pub fn poke(&mut self, addr: u32, value: u32) {
        self.mem.insert(addr, value);
    }

    pub fn peek(&self, addr: u32) -> u32 {
        self.mem.get(&addr).copied().unwrap_or(0)
    }

    /// Queue raw acknowledge values for the next headers, overriding the
    /// model. A forced FAULT also latches STICKYERR, like a real port.
    pub fn force_acks(&mut self, acks: &[u8]) {
        self.force_acks.extend(acks.iter().copied());
    }

    /// Forget the recorded traffic so a test can count only what its own
    /// operations put on the wire.
    pub fn clear_records(&mut self) {
        self.requests.clear();
        self.tar_writes.clear();
        self.select_writes.clear();
        self.abort_writes.clear();
        self.line_resets = 0;
        self.jtag_to_swd_seqs = 0;
    }

    fn apbank(&self) -> u8 {
        ((self.select >> 4) & 0xF) as u8
    }

    fn autoinc(&self) -> bool {
        self.csw & 0x30 == 0x10
    }

    fn bump_tar(&mut self) {
        if self.autoinc() {
            // The increment carries only into the low ten bits.
            self.tar = (self.tar & !0x3FF) | (self.tar.wrapping_add(4) & 0x3FF);
        }
    }

    fn ap_read(&mut self, addr: u8) -> u32 {
        match addr {
            0x00 => self.csw,
            0x04 => self.tar,
            0x0C => {
                let value = self.peek(self.tar);
                self.bump_tar();
                value
            }
            0xF8 => 0xE00F_F003,
            0xFC => 0x2477_0011,
            _ => 0,
        }
    }

    fn ap_write(&mut self, addr: u8, value: u32) {
        match addr {
            0x00 => self.csw = value,
            0x04 => {
                self.tar = value;
                self.tar_writes.push(value);
            }
            0x0C => {
                self.mem.insert(self.tar, value);
                self.bump_tar();
            }
            _ => {}
        }
    }

    fn read_register(&mut self, port: Port, a: u8) -> u32 {
        match (port, a) {
            (Port::Dp, 0) => self.idcode,
            (Port::Dp, 1) => self.ctrlstat,
            (Port::Dp, 2) | (Port::Dp, 3) => self.rdbuff,
            (Port::Dp, _) => 0,
            (Port::Ap, a) => {
                // AP reads are posted: this transaction returns the
                // previous result and queues the new one.
                let addr = (self.apbank() << 4) | ((a & 0b11) << 2);
                let previous = self.rdbuff;
                self.rdbuff = self.ap_read(addr);
                previous
            }
        }
    }

    fn apply_write(&mut self, port: Port, a: u8, value: u32) {
        match (port, a) {
            (Port::Dp, 0) => {
                self.abort_writes.push(value);
                if value & (1 << 1) != 0 {
                    self.ctrlstat &= !(1 << 4); // STKCMPCLR
                }
                if value & (1 << 2) != 0 {
                    self.ctrlstat &= !(1 << 5); // STKERRCLR
                }
                if value & (1 << 3) != 0 {
                    self.ctrlstat &= !(1 << 7); // WDERRCLR
                }
                if value & (1 << 4) != 0 {
                    self.ctrlstat &= !(1 << 1); // ORUNERRCLR
                }
            }
            (Port::Dp, 1) => {
                // Sticky bits survive CTRL/STAT writes; the power-up
                // acknowledge bits mirror the requests.
                let sticky = self.ctrlstat & STICKY_MASK;
                let mut value = value | sticky;
                if value & (1 << 28) != 0 {
                    value |= 1 << 29;
                }
                if value & (1 << 30) != 0 {
                    value |= 1 << 31;
                }
                self.ctrlstat = value;
            }
            (Port::Dp, 2) => {
                self.select = value;
                self.select_writes.push(value);
            }
            (Port::Dp, _) => {}
            (Port::Ap, a) => {
                let addr = (self.apbank() << 4) | ((a & 0b11) << 2);
                self.ap_write(addr, value);
            }
        }
    }

    fn handle_header(&mut self, header: u8) {
        let parity_ok = {
            let payload =
                (header >> 1 & 1) + (header >> 2 & 1) + (header >> 3 & 1) + (header >> 4 & 1);
            payload & 1 == (header >> 5) & 1
        };
        let framed = header & 1 == 1 && header & (1 << 6) == 0 && header & (1 << 7) != 0;
        if !framed || !parity_ok {
            // Not a request; nothing drives the line, the probe will see
            // the pull-up as an all-ones acknowledge.
            return;
        }

        let port = Port::from(header & (1 << 1) != 0);
        let dir = if header & (1 << 2) != 0 {
            Direction::Read
        } else {
            Direction::Write
        };
        let a = (header >> 3) & 0b11;

        let ack = if let Some(forced) = self.force_acks.pop_front() {
            if forced == ACK_FAULT {
                self.ctrlstat |= 1 << 5; // STICKYERR latches on a fault
            }
            forced
        } else if port == Port::Ap && self.ctrlstat & STICKY_MASK != 0 {
            // While a sticky error is latched the port faults every AP
            // transaction until ABORT clears it.
            ACK_FAULT
        } else {
            ACK_OK
        };

        self.requests.push(SeenRequest { port, dir, a, ack });

        self.turn_falls = 1;
        self.drive_bits.clear();
        for i in 0..3 {
            self.drive_bits.push_back(ack & (1 << i) != 0);
        }

        match dir {
            Direction::Read => {
                if ack == ACK_OK {
                    let value = self.read_register(port, a);
                    for i in 0..32 {
                        self.drive_bits.push_back(value & (1 << i) != 0);
                    }
                    let mut parity = value.count_ones() & 1 == 1;
                    if self.corrupt_read_parity > 0 {
                        self.corrupt_read_parity -= 1;
                        parity = !parity;
                    }
                    self.drive_bits.push_back(parity);
                }
            }
            Direction::Write => {
                // The probe clocks a data phase whatever the acknowledge;
                // only an OK transfer commits it.
                self.pending_write = Some(PendingWrite {
                    commit: ack == ACK_OK,
                    port,
                    a,
                    bits: 0,
                    count: 0,
                });
            }
        }
    }

    fn falling_edge(&mut self) {
        if self.turn_falls > 0 {
            self.turn_falls -= 1;
            self.presenting = None;
            return;
        }
        if let Some(bit) = self.drive_bits.pop_front() {
            self.presenting = Some(bit);
        } else {
            if self.presenting.take().is_some() || self.pending_write.is_some() {
                // The target's drive phase is over; if a write data phase
                // follows, start collecting it.
                if let Some(w) = self.pending_write.take() {
                    self.recv = Some(w);
                }
            }
        }
    }

    fn rising_edge(&mut self) {
        if !self.host_drive {
            return;
        }
        let bit = self.host_level;

        if let Some(w) = &mut self.recv {
            w.bits |= (bit as u64) << w.count;
            w.count += 1;
            if w.count == 33 {
                let w = self.recv.take().unwrap();
                let word = w.bits as u32;
                let parity = w.bits >> 32 != 0;
                if w.commit && parity == (word.count_ones() & 1 == 1) {
                    self.apply_write(w.port, w.a, word);
                }
            }
            return;
        }

        self.shift16 = (self.shift16 >> 1) | ((bit as u16) << 15);
        if self.shift16 == 0xE79E {
            self.jtag_to_swd_seqs += 1;
        }

        if bit {
            self.ones_run += 1;
        } else {
            if self.ones_run >= 50 {
                self.line_resets += 1;
                self.collecting = false;
            }
            self.ones_run = 0;
        }

        if self.collecting {
            self.header |= (bit as u8) << self.header_bits;
            self.header_bits += 1;
            if self.header_bits == 8 {
                self.collecting = false;
                let header = self.header;
                self.handle_header(header);
            }
        } else if bit {
            self.collecting = true;
            self.header = 1;
            self.header_bits = 1;
        }
    }
}

impl SwdIo for SimTarget {
    fn swdio_out(&mut self) {
        self.host_drive = true;
    }

    fn swdio_in(&mut self) {
        self.host_drive = false;
    }

    fn swdio_high(&mut self) {
        self.host_level = true;
    }

    fn swdio_low(&mut self) {
        self.host_level = false;
    }

    fn swdio_read(&mut self) -> bool {
        // Undriven, the line reads back through the pull-up.
        self.presenting.unwrap_or(true)
    }

    fn swclk_out(&mut self) {}

    fn swclk_high(&mut self) {
        if !self.swclk {
            self.swclk = true;
            self.rising_edge();
        }
    }

    fn swclk_low(&mut self) {
        if self.swclk {
            self.swclk = false;
            self.falling_edge();
        }
    }

    fn reset_drive(&mut self, level: bool) {
        self.reset_levels.push(level);
    }

    fn half_cycle_delay(&mut self) {}

    fn set_activity_led(&mut self, on: bool) {
        self.led = Some(on);
    }
}

/// Build a full-size request packet from a prefix.
pub fn packet(prefix: &[u8]) -> [u8; crate::dispatch::PACKET_SIZE] {
    let mut buf = [0u8; crate::dispatch::PACKET_SIZE];
    buf[..prefix.len()].copy_from_slice(prefix);
    buf
}
