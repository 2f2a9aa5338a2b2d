// Copyright 2020-2021 VX Probe Project Developers
// Dual licensed under the Apache 2.0 and MIT licenses.

//! The serial wire line engine: the primitive bit sequences every SWD
//! transaction is assembled from.
//!
//! Every sequence assumes that on entry SWDIO is configured as an output
//! and SWCLK is an output sitting high, and restores that state on exit,
//! except where noted (the header leaves SWDIO as an input so the
//! acknowledge and read data phases can follow).

use log::trace;

use crate::io::SwdIo;

/// Cycles driven high for a line reset; the protocol requires at least 50.
const RESET_HIGH_CYCLES: usize = 60;

/// Idle cycles clocked after the high phase of a line reset; at least one
/// is required.
const RESET_IDLE_CYCLES: usize = 16;

/// The 16-bit JTAG-to-SWD selection sequence, transmitted LSB first.
const JTAG_TO_SWD_SEQUENCE: u16 = 0xE79E;

pub struct LineEngine<IO> {
    io: IO,
}

impl<IO: SwdIo> LineEngine<IO> {
    pub fn new(io: IO) -> Self {
        LineEngine { io }
    }

    pub fn io(&self) -> &IO {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut IO {
        &mut self.io
    }

    /// Take ownership of the bus: SWDIO and SWCLK driven, both high.
    pub fn engage(&mut self) {
        self.io.swdio_out();
        self.io.swdio_high();
        self.io.swclk_out();
        self.io.swclk_high();
        self.io.half_cycle_delay();
    }

    /// Release SWDIO to the target (pull-up keeps the line defined).
    pub fn release(&mut self) {
        self.io.swdio_in();
    }

    /// Burn `n` half-cycle delays without touching the wires.
    pub fn settle(&mut self, n: u32) {
        for _ in 0..n {
            self.io.half_cycle_delay();
        }
    }

    /// Present one bit on the rising SWCLK edge.
    fn clock_out_bit(&mut self, bit: bool) {
        if bit {
            self.io.swdio_high();
        } else {
            self.io.swdio_low();
        }
        self.io.swclk_low();
        self.io.half_cycle_delay();
        self.io.swclk_high();
        self.io.half_cycle_delay();
    }

    /// Sample one bit at the settled value after the falling SWCLK edge.
    fn clock_in_bit(&mut self) -> bool {
        self.io.swclk_low();
        self.io.half_cycle_delay();
        let bit = self.io.swdio_read();
        self.io.swclk_high();
        self.io.half_cycle_delay();
        bit
    }

    /// One clock with both ends off the line, so drive direction can
    /// change safely.
    fn turnaround(&mut self) {
        self.io.swclk_low();
        self.io.half_cycle_delay();
        self.io.swclk_high();
        self.io.half_cycle_delay();
    }

    /// Shift an eight-bit request header out LSB first, then turn the line
    /// around and clock in the three-bit acknowledge.
    ///
    /// Returns the raw acknowledge field; the caller classifies it. SWDIO
    /// is left as an input, ready for a read data phase.
    pub fn clock_header_out_get_ack(&mut self, header: u8) -> u8 {
        let mut w = header;
        for _ in 0..8 {
            self.clock_out_bit(w & 1 != 0);
            w >>= 1;
        }

        self.io.swdio_in();
        self.turnaround();

        let mut ack = 0;
        for i in 0..3 {
            if self.clock_in_bit() {
                ack |= 1 << i;
            }
        }
        trace!("header {:#04x} -> ack {:#05b}", header, ack);
        ack
    }

    /// Clock in 32 data bits LSB first and the trailing parity bit, then
    /// turn the line around, reclaim SWDIO and clock one idle bit.
    ///
    /// The returned flag is false when the received parity disagrees with
    /// the even parity of the data bits.
    pub fn clock_word_and_parity_in(&mut self) -> (u32, bool) {
        let mut word: u32 = 0;
        for i in 0..32 {
            if self.clock_in_bit() {
                word |= 1 << i;
            }
        }
        let parity = self.clock_in_bit();
        let parity_ok = parity == (word.count_ones() & 1 == 1);

        let _ = self.clock_in_bit();
        self.io.swdio_out();
        self.clock_out_bit(false);

        (word, parity_ok)
    }

    /// Turn the line around, reclaim SWDIO, then clock out 32 data bits
    /// LSB first followed by their even parity bit.
    pub fn clock_word_and_parity_out(&mut self, word: u32) {
        let _ = self.clock_in_bit();
        self.io.swdio_out();

        let mut w = word;
        for _ in 0..32 {
            self.clock_out_bit(w & 1 != 0);
            w >>= 1;
        }
        self.clock_out_bit(word.count_ones() & 1 == 1);
    }

    /// Clock `n` cycles with SWDIO held low. The protocol requires idle
    /// cycles (or an immediate new transaction) after every data phase so
    /// the transfer propagates through the serial wire interface.
    pub fn insert_idle_cycles(&mut self, n: usize) {
        for _ in 0..n {
            self.clock_out_bit(false);
        }
    }

    /// The wire part of a bus reset: at least 50 cycles with SWDIO high,
    /// then idle cycles. The DAP core completes the reset by reading
    /// IDCODE and reloading SELECT and TAR.
    pub fn line_reset_sequence(&mut self) {
        trace!("line reset");
        for _ in 0..RESET_HIGH_CYCLES {
            self.clock_out_bit(true);
        }
        self.insert_idle_cycles(RESET_IDLE_CYCLES);
    }

    /// The JTAG-to-SWD selection: at least 50 high cycles, then the 16-bit
    /// selection magic. Must be followed by a bus reset before the target
    /// accepts requests.
    pub fn jtag_to_swd_sequence(&mut self) {
        trace!("jtag-to-swd selection sequence");
        for _ in 0..RESET_HIGH_CYCLES {
            self.clock_out_bit(true);
        }
        let mut w = JTAG_TO_SWD_SEQUENCE;
        for _ in 0..16 {
            self.clock_out_bit(w & 1 != 0);
            w >>= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimTarget;
    use crate::swd::{request_header, Direction, Port};

    #[test]
    fn header_then_ack_then_data() {
        let mut line = LineEngine::new(SimTarget::new());
        line.io_mut().idcode = 0xDEAD_BEEF;
        line.engage();

        let ack = line.clock_header_out_get_ack(request_header(Port::Dp, Direction::Read, 0));
        assert_eq!(ack, 0b001);

        let (word, parity_ok) = line.clock_word_and_parity_in();
        assert_eq!(word, 0xDEAD_BEEF);
        assert!(parity_ok);

        let seen = &line.io().requests;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].port, Port::Dp);
        assert_eq!(seen[0].dir, Direction::Read);
        assert_eq!(seen[0].a, 0);
    }

    #[test]
    fn bad_parity_is_detected() {
        let mut line = LineEngine::new(SimTarget::new());
        line.io_mut().corrupt_read_parity = 1;
        line.engage();

        let ack = line.clock_header_out_get_ack(request_header(Port::Dp, Direction::Read, 0));
        assert_eq!(ack, 0b001);
        let (_, parity_ok) = line.clock_word_and_parity_in();
        assert!(!parity_ok);
    }

    #[test]
    fn undriven_ack_reads_all_ones() {
        let mut line = LineEngine::new(SimTarget::new());
        line.engage();
        // A header with broken parity is not a request; nothing answers.
        let ack = line.clock_header_out_get_ack(0x21 | (1 << 7));
        assert_eq!(ack, 0b111);
        // Take the bus back so the postcondition holds for the next call.
        line.io_mut().swdio_out();
        line.insert_idle_cycles(10);
    }

    #[test]
    fn reset_and_switch_sequences_are_recognized() {
        let mut line = LineEngine::new(SimTarget::new());
        line.engage();
        line.line_reset_sequence();
        assert_eq!(line.io().line_resets, 1);

        line.jtag_to_swd_sequence();
        assert_eq!(line.io().jtag_to_swd_seqs, 1);
        line.line_reset_sequence();
        assert_eq!(line.io().line_resets, 3);
    }
}
