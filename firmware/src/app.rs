// Copyright 2020-2021 VX Probe Project Developers
// Dual licensed under the Apache 2.0 and MIT licenses.

use crate::io::ProbeIo;
use crate::usb::USB;
use vx_dap::{Dispatcher, PACKET_SIZE};
use vx_probe_bsp as bsp;
use vx_probe_bsp::rcc::CoreFrequency;

pub enum Request {
    Suspend,
    DapCommand(([u8; PACKET_SIZE], usize)),
}

pub struct App<'a> {
    rcc: &'a bsp::rcc::RCC,
    pins: &'a bsp::gpio::Pins<'a>,
    usb: &'a mut USB,
    dap: &'a mut Dispatcher<ProbeIo<'a>>,
    resp_buf: [u8; PACKET_SIZE],
}

impl<'a> App<'a> {
    pub fn new(
        rcc: &'a bsp::rcc::RCC,
        pins: &'a bsp::gpio::Pins<'a>,
        usb: &'a mut USB,
        dap: &'a mut Dispatcher<ProbeIo<'a>>,
    ) -> Self {
        App {
            rcc,
            pins,
            usb,
            dap,
            resp_buf: [0; PACKET_SIZE],
        }
    }

    /// Unsafety: this function should be called from the main context.
    /// No other contexts should be active at the same time.
    pub unsafe fn setup(&mut self, serial: &'static str) {
        // Configure system clock
        let clocks = self.rcc.setup(CoreFrequency::F72MHz);

        // Configure GPIOs; target-facing pins stay released until the
        // host connects.
        self.pins.setup();
        self.pins.high_impedance_mode();

        // Configure USB peripheral and connect to host
        self.usb.setup(&clocks, serial);

        self.pins.led.set_low();
    }

    pub fn poll(&mut self) {
        if let Some(req) = self.usb.interrupt() {
            self.process_request(req);
        }
    }

    fn process_request(&mut self, req: Request) {
        match req {
            Request::DapCommand((report, n)) => {
                let len = self.dap.process_command(&report[..n], &mut self.resp_buf);
                if len > 0 {
                    self.usb.reply(&self.resp_buf[..len]);
                }
            }
            Request::Suspend => {
                self.pins.high_impedance_mode();
                self.pins.led.set_high();
            }
        }
    }
}
