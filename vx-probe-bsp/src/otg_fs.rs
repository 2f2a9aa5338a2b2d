//! USB OTG full-speed peripheral

use stm32ral::modify_reg;
use stm32ral::{otg_fs_device, otg_fs_global, otg_fs_pwrclk, rcc};

use synopsys_usb_otg::UsbPeripheral;
pub use synopsys_usb_otg::UsbBus;

pub struct USB {
    pub usb_global: otg_fs_global::Instance,
    pub usb_device: otg_fs_device::Instance,
    pub usb_pwrclk: otg_fs_pwrclk::Instance,
    pub hclk: u32,
}

// We only store peripheral instances to enforce ownership,
// so it's safe to share the USB object
unsafe impl Send for USB {}
unsafe impl Sync for USB {}

unsafe impl UsbPeripheral for USB {
    const REGISTERS: *const () = otg_fs_global::OTG_FS_GLOBAL as *const ();

    const HIGH_SPEED: bool = false;
    const FIFO_DEPTH_WORDS: usize = 320;
    const ENDPOINT_COUNT: usize = 6;

    fn enable() {
        cortex_m::interrupt::free(|_| {
            let rcc = unsafe { &*rcc::RCC };

            // Enable USB peripheral
            modify_reg!(rcc, rcc, AHB2ENR, OTGFSEN: Enabled);

            // Reset USB peripheral
            modify_reg!(rcc, rcc, AHB2RSTR, OTGFSRST: Reset);
            modify_reg!(rcc, rcc, AHB2RSTR, OTGFSRST: 0);
        });
    }

    fn ahb_frequency_hz(&self) -> u32 {
        self.hclk
    }
}

pub type UsbBusType = UsbBus<USB>;
