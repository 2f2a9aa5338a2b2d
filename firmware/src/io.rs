// Copyright 2020-2021 VX Probe Project Developers
// Dual licensed under the Apache 2.0 and MIT licenses.

//! The pin driver: vx-dap's [`SwdIo`] contract over the board's GPIOs.

use vx_dap::SwdIo;
use vx_probe_bsp::gpio::{MemoisedMode, Pins};

/// Default half-cycle busy delay, in core clock cycles. At 72 MHz this
/// clocks the wire at roughly 1 MHz.
const DEFAULT_HALF_CYCLE_CYCLES: u32 = 36;

pub struct ProbeIo<'a> {
    pins: &'a Pins<'a>,
    swdio_output: MemoisedMode,
    swdio_input: MemoisedMode,
    half_cycle: u32,
}

impl<'a> ProbeIo<'a> {
    pub fn new(pins: &'a Pins<'a>) -> Self {
        ProbeIo {
            pins,
            // Direction flips happen inside every transfer, so the MODER
            // writes are precomputed.
            swdio_output: pins.swdio.memoise_mode_output(),
            swdio_input: pins.swdio.memoise_mode_input(),
            half_cycle: DEFAULT_HALF_CYCLE_CYCLES,
        }
    }
}

impl<'a> SwdIo for ProbeIo<'a> {
    fn swdio_out(&mut self) {
        self.pins.swdio.apply_memoised_mode(self.swdio_output);
    }

    fn swdio_in(&mut self) {
        // The pull-up is configured once at pin setup, so the released
        // line reads back high.
        self.pins.swdio.apply_memoised_mode(self.swdio_input);
    }

    fn swdio_high(&mut self) {
        self.pins.swdio.set_high();
    }

    fn swdio_low(&mut self) {
        self.pins.swdio.set_low();
    }

    fn swdio_read(&mut self) -> bool {
        self.pins.swdio.is_high()
    }

    fn swclk_out(&mut self) {
        self.pins.swclk.set_high().set_mode_output();
    }

    fn swclk_high(&mut self) {
        self.pins.swclk.set_high();
    }

    fn swclk_low(&mut self) {
        self.pins.swclk.set_low();
    }

    fn reset_drive(&mut self, level: bool) {
        self.pins.reset.set_bool(level);
    }

    fn half_cycle_delay(&mut self) {
        cortex_m::asm::delay(self.half_cycle);
    }

    fn set_activity_led(&mut self, on: bool) {
        // Active low.
        self.pins.led.set_bool(!on);
    }
}
