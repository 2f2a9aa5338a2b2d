use stm32ral::gpio;
use stm32ral::{modify_reg, read_reg, write_reg};

pub struct GPIO {
    p: gpio::Instance,
}

impl<'a> GPIO {
    pub fn new(p: gpio::Instance) -> Self {
        GPIO { p }
    }

    pub fn pin(&'a self, n: u8) -> Pin<'a> {
        assert!(n < 16);
        let n = unsafe { core::mem::transmute(n) };
        Pin { n, port: self }
    }

    #[inline(always)]
    pub fn set_high(&'a self, n: PinIndex) -> &Self {
        write_reg!(gpio, self.p, BSRR, 1 << (n as u8));
        self
    }

    #[inline(always)]
    pub fn set_low(&'a self, n: PinIndex) -> &Self {
        write_reg!(gpio, self.p, BSRR, 1 << ((n as u8) + 16));
        self
    }

    #[inline]
    pub fn set_mode(&'a self, n: PinIndex, mode: u32) -> &Self {
        let offset = (n as u8) * 2;
        let mask = 0b11 << offset;
        let val = (mode << offset) & mask;
        modify_reg!(gpio, self.p, MODER, |r| (r & !mask) | val);
        self
    }

    pub const fn memoise_mode(n: PinIndex, mode: u32) -> MemoisedMode {
        let n = (n as u8) & 0xF;
        let offset = n * 2;
        let mask = 0b11 << offset;
        let value = (mode << offset) & mask;
        MemoisedMode { mask: !mask, value }
    }

    #[inline]
    pub fn apply_memoised_mode(&'a self, mode: MemoisedMode) -> &Self {
        modify_reg!(gpio, self.p, MODER, |r| (r & mode.mask) | mode.value);
        self
    }

    #[inline]
    pub fn set_mode_input(&'a self, n: PinIndex) -> &Self {
        self.set_mode(n, gpio::MODER::MODER0::RW::Input)
    }

    pub const fn memoise_mode_input(n: PinIndex) -> MemoisedMode {
        Self::memoise_mode(n, gpio::MODER::MODER0::RW::Input)
    }

    #[inline]
    pub fn set_mode_output(&'a self, n: PinIndex) -> &Self {
        self.set_mode(n, gpio::MODER::MODER0::RW::Output)
    }

    pub const fn memoise_mode_output(n: PinIndex) -> MemoisedMode {
        Self::memoise_mode(n, gpio::MODER::MODER0::RW::Output)
    }

    #[inline]
    pub fn set_mode_alternate(&'a self, n: PinIndex) -> &Self {
        self.set_mode(n, gpio::MODER::MODER0::RW::Alternate)
    }

    #[inline]
    pub fn set_otype(&'a self, n: PinIndex, otype: u32) -> &Self {
        let offset = n as u8;
        let mask = 0b1 << offset;
        let val = (otype << offset) & mask;
        modify_reg!(gpio, self.p, OTYPER, |r| (r & !mask) | val);
        self
    }

    #[inline]
    pub fn set_otype_opendrain(&'a self, n: PinIndex) -> &Self {
        self.set_otype(n, gpio::OTYPER::OT0::RW::OpenDrain)
    }

    #[inline]
    pub fn set_otype_pushpull(&'a self, n: PinIndex) -> &Self {
        self.set_otype(n, gpio::OTYPER::OT0::RW::PushPull)
    }

    #[inline]
    pub fn set_ospeed(&'a self, n: PinIndex, ospeed: u32) -> &Self {
        let offset = (n as u8) * 2;
        let mask = 0b11 << offset;
        let val = (ospeed << offset) & mask;
        modify_reg!(gpio, self.p, OSPEEDR, |r| (r & !mask) | val);
        self
    }

    #[inline]
    pub fn set_ospeed_low(&'a self, n: PinIndex) -> &Self {
        self.set_ospeed(n, gpio::OSPEEDR::OSPEEDR0::RW::LowSpeed)
    }

    #[inline]
    pub fn set_ospeed_veryhigh(&'a self, n: PinIndex) -> &Self {
        self.set_ospeed(n, gpio::OSPEEDR::OSPEEDR0::RW::VeryHighSpeed)
    }

    #[inline]
    pub fn set_af(&'a self, n: PinIndex, af: u32) -> &Self {
        let n = n as u8;
        if n < 8 {
            let offset = n * 4;
            let mask = 0b1111 << offset;
            let val = (af << offset) & mask;
            modify_reg!(gpio, self.p, AFRL, |r| (r & !mask) | val);
        } else {
            let offset = (n - 8) * 4;
            let mask = 0b1111 << offset;
            let val = (af << offset) & mask;
            modify_reg!(gpio, self.p, AFRH, |r| (r & !mask) | val);
        }
        self
    }

    #[inline]
    pub fn set_pull(&'a self, n: PinIndex, pull: u32) -> &Self {
        let offset = (n as u8) * 2;
        let mask = 0b11 << offset;
        let val = (pull << offset) & mask;
        modify_reg!(gpio, self.p, PUPDR, |r| (r & !mask) | val);
        self
    }

    #[inline]
    pub fn set_pull_floating(&'a self, n: PinIndex) -> &Self {
        self.set_pull(n, gpio::PUPDR::PUPDR0::RW::Floating)
    }

    #[inline]
    pub fn set_pull_up(&'a self, n: PinIndex) -> &Self {
        self.set_pull(n, gpio::PUPDR::PUPDR0::RW::PullUp)
    }

    #[inline]
    pub fn get_pin_idr(&'a self, n: PinIndex) -> u32 {
        let n = n as u8;
        (read_reg!(gpio, self.p, IDR) & (1 << n)) >> n
    }
}

/// Stores a pre-computed mask and value for quickly changing pin mode
#[derive(Copy, Clone)]
pub struct MemoisedMode {
    mask: u32,
    value: u32,
}

#[derive(Copy, Clone)]
#[repr(u8)]
pub enum PinIndex {
    Pin0 = 0,
    Pin1 = 1,
    Pin2 = 2,
    Pin3 = 3,
    Pin4 = 4,
    Pin5 = 5,
    Pin6 = 6,
    Pin7 = 7,
    Pin8 = 8,
    Pin9 = 9,
    Pin10 = 10,
    Pin11 = 11,
    Pin12 = 12,
    Pin13 = 13,
    Pin14 = 14,
    Pin15 = 15,
}

pub struct Pin<'a> {
    n: PinIndex,
    port: &'a GPIO,
}

impl<'a> Pin<'a> {
    #[inline(always)]
    pub fn set_high(&self) -> &Self {
        self.port.set_high(self.n);
        self
    }

    #[inline(always)]
    pub fn set_low(&self) -> &Self {
        self.port.set_low(self.n);
        self
    }

    #[inline(always)]
    pub fn set_bool(&self, state: bool) {
        match state {
            false => self.set_low(),
            true => self.set_high(),
        };
    }

    #[inline(always)]
    pub fn is_high(&self) -> bool {
        self.port.get_pin_idr(self.n) == 1
    }

    #[inline]
    pub fn set_mode_input(&'a self) -> &Self {
        self.port.set_mode_input(self.n);
        self
    }

    #[inline]
    pub fn set_mode_output(&'a self) -> &Self {
        self.port.set_mode_output(self.n);
        self
    }

    #[inline]
    pub fn set_mode_alternate(&'a self) -> &Self {
        self.port.set_mode_alternate(self.n);
        self
    }

    pub fn memoise_mode_input(&'a self) -> MemoisedMode {
        GPIO::memoise_mode_input(self.n)
    }

    pub fn memoise_mode_output(&'a self) -> MemoisedMode {
        GPIO::memoise_mode_output(self.n)
    }

    #[inline]
    pub fn apply_memoised_mode(&'a self, mode: MemoisedMode) -> &Self {
        self.port.apply_memoised_mode(mode);
        self
    }

    #[inline]
    pub fn set_otype_opendrain(&'a self) -> &Self {
        self.port.set_otype_opendrain(self.n);
        self
    }

    #[inline]
    pub fn set_otype_pushpull(&'a self) -> &Self {
        self.port.set_otype_pushpull(self.n);
        self
    }

    #[inline]
    pub fn set_ospeed_low(&'a self) -> &Self {
        self.port.set_ospeed_low(self.n);
        self
    }

    #[inline]
    pub fn set_ospeed_veryhigh(&'a self) -> &Self {
        self.port.set_ospeed_veryhigh(self.n);
        self
    }

    #[inline]
    pub fn set_af(&'a self, af: u32) -> &Self {
        self.port.set_af(self.n, af);
        self
    }

    #[inline]
    pub fn set_pull_floating(&'a self) -> &Self {
        self.port.set_pull_floating(self.n);
        self
    }

    #[inline]
    pub fn set_pull_up(&'a self) -> &Self {
        self.port.set_pull_up(self.n);
        self
    }
}

pub struct Pins<'a> {
    pub led: Pin<'a>,

    /// Target reset, open-drain, active low.
    pub reset: Pin<'a>,

    /// Serial wire clock, push-pull output while connected.
    pub swclk: Pin<'a>,

    /// Serial wire data, direction-switched between transfers.
    pub swdio: Pin<'a>,

    // USB FS
    pub usb_dm: Pin<'a>,
    pub usb_dp: Pin<'a>,
}

impl<'a> Pins<'a> {
    /// Configure I/O pins
    pub fn setup(&self) {
        // Open-drain output to LED (active low).
        self.led
            .set_high()
            .set_otype_opendrain()
            .set_ospeed_low()
            .set_mode_output();

        // Open-drain output to the target reset line (active low).
        self.reset
            .set_high()
            .set_otype_opendrain()
            .set_ospeed_veryhigh()
            .set_mode_output();

        // SWCLK push-pull driver. Starts high-impedance.
        self.swclk
            .set_high()
            .set_otype_pushpull()
            .set_ospeed_veryhigh()
            .set_pull_floating()
            .set_mode_input();

        // SWDIO push-pull driver, pulled up whenever it is an input so a
        // released line reads back high. Starts high-impedance.
        self.swdio
            .set_high()
            .set_otype_pushpull()
            .set_ospeed_veryhigh()
            .set_pull_up()
            .set_mode_input();

        // USB FS pins
        self.usb_dm
            .set_af(10)
            .set_otype_pushpull()
            .set_ospeed_veryhigh()
            .set_mode_alternate();
        self.usb_dp
            .set_af(10)
            .set_otype_pushpull()
            .set_ospeed_veryhigh()
            .set_mode_alternate();
    }

    /// Place target-facing pins into high-impedance mode
    #[inline]
    pub fn high_impedance_mode(&self) {
        self.reset.set_high().set_mode_output();
        self.swclk.set_mode_input();
        self.swdio.set_mode_input();
    }
}
