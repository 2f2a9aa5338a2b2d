// Copyright 2020-2021 VX Probe Project Developers
// Dual licensed under the Apache 2.0 and MIT licenses.

//! Routes `log` records from the protocol engine to the RTT console.

use log::{LevelFilter, Metadata, Record};
use rtt_target::rprintln;

struct RttLogger;

static LOGGER: RttLogger = RttLogger;

impl log::Log for RttLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::Level::Debug
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            rprintln!("{} {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
}
