// Copyright 2020-2021 VX Probe Project Developers
// Dual licensed under the Apache 2.0 and MIT licenses.

//! The pin-driver contract the line engine bit-bangs through.

/// Direction-switchable bit driver for the SWDIO/SWCLK pair plus the
/// auxiliary target-reset pin.
///
/// Contract: switching SWDIO between input and output leaves SWCLK
/// untouched; all clock edges are driven by the line engine through
/// [`swclk_low`](SwdIo::swclk_low)/[`swclk_high`](SwdIo::swclk_high) with
/// one [`half_cycle_delay`](SwdIo::half_cycle_delay) between edges, so one
/// bit takes exactly two delays.
pub trait SwdIo {
    /// Drive SWDIO from the probe side.
    fn swdio_out(&mut self);

    /// Release SWDIO to the target; the pin reads back through a pull-up.
    fn swdio_in(&mut self);

    fn swdio_high(&mut self);
    fn swdio_low(&mut self);
    fn swdio_read(&mut self) -> bool;

    /// Configure SWCLK as a driven output; called once when the bus is
    /// claimed at connect.
    fn swclk_out(&mut self);

    fn swclk_high(&mut self);
    fn swclk_low(&mut self);

    /// Drive the target reset pin; the line itself is active low, so
    /// `true` deasserts reset.
    fn reset_drive(&mut self, level: bool);

    /// Busy-wait for half an SWCLK period. The implementation chooses the
    /// unit; this single knob sets the wire clock rate.
    fn half_cycle_delay(&mut self);

    /// Host-activity indicator; optional.
    fn set_activity_led(&mut self, _on: bool) {}
}
