// Copyright 2020-2021 VX Probe Project Developers
// Dual licensed under the Apache 2.0 and MIT licenses.

//! USB device stack: one vendor-HID interface carrying 64-byte CMSIS-DAP
//! reports.

use crate::app::Request;
use usb_device::bus::UsbBusAllocator;
use usb_device::device::UsbDeviceState;
use usb_device::prelude::*;
use vx_probe_bsp::otg_fs::{UsbBus, UsbBusType};
use vx_probe_bsp::rcc::Clocks;

use stm32ral::{otg_fs_device, otg_fs_global, otg_fs_pwrclk};

mod hid;

use hid::CmsisDapHid;

/// Some host debuggers only recognize the probe with this exact device
/// release number.
const USB_BCD_DEVICE: u16 = 0x0100;

const USB_VID_PID: UsbVidPid = UsbVidPid(0x1AD4, 0xA000);

struct UninitializedUSB {
    global: otg_fs_global::Instance,
    device: otg_fs_device::Instance,
    pwrclk: otg_fs_pwrclk::Instance,
}

struct InitializedUSB {
    device: UsbDevice<'static, UsbBusType>,
    dap: CmsisDapHid<'static, UsbBusType>,
    was_configured: bool,
}

enum State {
    Uninitialized(UninitializedUSB),
    Initialized(InitializedUSB),
    Initializing,
}

impl State {
    pub fn as_initialized_mut(&mut self) -> &mut InitializedUSB {
        if let State::Initialized(initialized) = self {
            initialized
        } else {
            panic!("USB is not initialized yet");
        }
    }
}

static mut EP_MEMORY: [u32; 1024] = [0; 1024];
static mut USB_BUS: Option<UsbBusAllocator<UsbBusType>> = None;

/// USB stack interface
pub struct USB {
    state: State,
}

impl USB {
    /// Create a new USB object from the peripheral instance
    pub fn new(
        global: otg_fs_global::Instance,
        device: otg_fs_device::Instance,
        pwrclk: otg_fs_pwrclk::Instance,
    ) -> Self {
        let usb = UninitializedUSB {
            global,
            device,
            pwrclk,
        };
        USB {
            state: State::Uninitialized(usb),
        }
    }

    /// Initialise the USB peripheral ready to start processing packets
    pub fn setup(&mut self, clocks: &Clocks, serial: &'static str) {
        let state = core::mem::replace(&mut self.state, State::Initializing);
        if let State::Uninitialized(usb) = state {
            cortex_m::interrupt::free(|_| unsafe {
                let usb = vx_probe_bsp::otg_fs::USB {
                    usb_global: usb.global,
                    usb_device: usb.device,
                    usb_pwrclk: usb.pwrclk,
                    hclk: clocks.hclk(),
                };

                let usb_bus = UsbBus::new(usb, &mut EP_MEMORY);
                USB_BUS = Some(usb_bus);
                let usb_bus = USB_BUS.as_ref().unwrap();

                let dap = CmsisDapHid::new(usb_bus);

                let device = UsbDeviceBuilder::new(usb_bus, USB_VID_PID)
                    .manufacturer("VX")
                    .product("VX CMSIS-DAP debug probe")
                    .serial_number(serial)
                    .device_class(0)
                    .device_release(USB_BCD_DEVICE)
                    .build();

                let usb = InitializedUSB {
                    device,
                    dap,
                    was_configured: false,
                };
                self.state = State::Initialized(usb)
            });
        } else {
            panic!("Invalid state");
        }
    }

    /// Process a pending USB interrupt.
    ///
    /// Returns Some(Request) if a new request has been received from the
    /// host, or the device was just suspended.
    pub fn interrupt(&mut self) -> Option<Request> {
        let usb = self.state.as_initialized_mut();
        if usb.device.poll(&mut [&mut usb.dap]) {
            let r = usb.dap.process();
            if r.is_some() {
                return r;
            }
        }

        match usb.device.state() {
            UsbDeviceState::Configured => {
                usb.was_configured = true;
            }
            UsbDeviceState::Suspend => {
                if usb.was_configured {
                    usb.was_configured = false;
                    return Some(Request::Suspend);
                }
            }
            _ => {}
        }
        None
    }

    /// Transmit a DAP report back over the HID interface
    pub fn reply(&mut self, data: &[u8]) {
        let usb = self.state.as_initialized_mut();
        usb.dap.write_packet(data).expect("DAP EP write failed");
    }
}
