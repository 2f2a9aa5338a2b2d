// Copyright 2020-2021 VX Probe Project Developers
// Dual licensed under the Apache 2.0 and MIT licenses.

#![no_std]
#![no_main]

mod app;
mod io;
mod logger;
mod usb;

use cortex_m_rt::entry;
use panic_rtt_target as _;
use rtt_target::{rprintln, rtt_init_print};

use git_version::git_version;

pub const GIT_VERSION: &str = git_version!(fallback = "v0.1.0");

#[entry]
fn main() -> ! {
    rtt_init_print!();
    logger::init();

    let rcc = vx_probe_bsp::rcc::RCC::new(stm32ral::rcc::RCC::take().unwrap());

    let usb_global = stm32ral::otg_fs_global::OTG_FS_GLOBAL::take().unwrap();
    let usb_device = stm32ral::otg_fs_device::OTG_FS_DEVICE::take().unwrap();
    let usb_pwrclk = stm32ral::otg_fs_pwrclk::OTG_FS_PWRCLK::take().unwrap();
    let mut usb = usb::USB::new(usb_global, usb_device, usb_pwrclk);

    let gpioa = vx_probe_bsp::gpio::GPIO::new(stm32ral::gpio::GPIOA::take().unwrap());
    let gpiob = vx_probe_bsp::gpio::GPIO::new(stm32ral::gpio::GPIOB::take().unwrap());
    let gpioc = vx_probe_bsp::gpio::GPIO::new(stm32ral::gpio::GPIOC::take().unwrap());

    let pins = vx_probe_bsp::gpio::Pins {
        led: gpioc.pin(10),
        reset: gpiob.pin(1),
        swclk: gpiob.pin(5),
        swdio: gpiob.pin(4),
        usb_dm: gpioa.pin(11),
        usb_dp: gpioa.pin(12),
    };

    let probe_io = io::ProbeIo::new(&pins);
    let mut dap = vx_dap::Dispatcher::new(probe_io, GIT_VERSION);

    let mut app = app::App::new(&rcc, &pins, &mut usb, &mut dap);

    rprintln!("vx-probe {}", GIT_VERSION);

    let serial = stm32_device_signature::device_id_hex();

    // Initialise application, including system peripherals
    unsafe { app.setup(serial) };

    loop {
        // Process events
        app.poll();
    }
}
