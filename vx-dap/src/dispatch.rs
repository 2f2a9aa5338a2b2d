// Copyright 2020-2021 VX Probe Project Developers
// Dual licensed under the Apache 2.0 and MIT licenses.

//! The CMSIS-DAP request dispatcher: parses 64-byte command packets,
//! sequences the requested transfers through the DAP core and formats the
//! 64-byte responses.

use core::convert::{TryFrom, TryInto};
use log::{debug, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::dap::DapCore;
use crate::io::SwdIo;
use crate::swd::{dp, Ack, Direction, Error, Port, Result, TransferRequest};

/// Every report is exactly this long in both directions; responses are
/// zero-padded.
pub const PACKET_SIZE: usize = 64;

/// Value-mismatch flag in a transfer response byte.
const RESPONSE_VALUE_MISMATCH: u8 = 1 << 4;

/// Protocol-error flag in a transfer response byte.
const RESPONSE_PROTOCOL_ERROR: u8 = 1 << 3;

/// Half-cycle delays granted after deasserting target reset, before the
/// interface is brought back up.
const RESET_SETTLE: u32 = 1000;

const DEFAULT_MATCH_RETRIES: usize = 5;

#[derive(Copy, Clone, TryFromPrimitive, PartialEq)]
#[allow(non_camel_case_types)]
#[repr(u8)]
enum Command {
    // General commands
    DAP_Info = 0x00,
    DAP_HostStatus = 0x01,
    DAP_Connect = 0x02,
    DAP_Disconnect = 0x03,
    DAP_WriteABORT = 0x08,
    DAP_Delay = 0x09,
    DAP_ResetTarget = 0x0A,

    // Common SWD/JTAG commands
    DAP_SWJ_Pins = 0x10,
    DAP_SWJ_Clock = 0x11,
    DAP_SWJ_Sequence = 0x12,

    // SWD commands
    DAP_SWD_Configure = 0x13,

    // Transfer commands
    DAP_TransferConfigure = 0x04,
    DAP_Transfer = 0x05,
    DAP_TransferBlock = 0x06,
    DAP_TransferAbort = 0x07,

    // Unimplemented command response
    Unimplemented = 0xFF,
}

#[derive(Copy, Clone, IntoPrimitive)]
#[allow(non_camel_case_types)]
#[repr(u8)]
enum ResponseStatus {
    DAP_OK = 0x00,
    DAP_ERROR = 0xFF,
}

#[derive(Copy, Clone, TryFromPrimitive)]
#[allow(non_camel_case_types)]
#[repr(u8)]
enum DAPInfoID {
    VendorID = 0x01,
    ProductID = 0x02,
    SerialNumber = 0x03,
    FirmwareVersion = 0x04,
    TargetVendor = 0x05,
    TargetName = 0x06,
    Capabilities = 0xF0,
    MaxPacketCount = 0xFE,
    MaxPacketSize = 0xFF,
}

#[derive(Copy, Clone, TryFromPrimitive)]
#[repr(u8)]
enum HostStatusType {
    Connect = 0,
    Running = 1,
}

#[derive(Copy, Clone, TryFromPrimitive)]
#[repr(u8)]
enum ConnectPort {
    Default = 0,
    SWD = 1,
    JTAG = 2,
}

#[repr(u8)]
enum ConnectPortResponse {
    Failed = 0,
    SWD = 1,
}

enum PollMatch {
    Matched,
    Mismatch,
    WireError,
}

struct Request<'a> {
    command: Command,
    data: &'a [u8],
}

impl<'a> Request<'a> {
    /// Returns None if the report is empty
    fn from_report(report: &'a [u8]) -> Option<Self> {
        let (command, data) = report.split_first()?;
        let command = (*command).try_into().unwrap_or(Command::Unimplemented);
        Some(Request { command, data })
    }

    fn next_u8(&mut self) -> u8 {
        let value = self.data[0];
        self.data = &self.data[1..];
        value
    }

    fn next_u16(&mut self) -> u16 {
        let value = u16::from_le_bytes(self.data[0..2].try_into().unwrap());
        self.data = &self.data[2..];
        value
    }

    fn next_u32(&mut self) -> u32 {
        let value = u32::from_le_bytes(self.data[0..4].try_into().unwrap());
        self.data = &self.data[4..];
        value
    }
}

struct ResponseWriter<'a> {
    buf: &'a mut [u8],
    idx: usize,
}

impl<'a> ResponseWriter<'a> {
    fn new(command: Command, buf: &'a mut [u8]) -> Self {
        buf[0] = command as u8;
        ResponseWriter { buf, idx: 1 }
    }

    fn write_u8(&mut self, value: u8) {
        self.buf[self.idx] = value;
        self.idx += 1;
    }

    fn write_u16(&mut self, value: u16) {
        let value = value.to_le_bytes();
        self.buf[self.idx..self.idx + 2].copy_from_slice(&value);
        self.idx += 2;
    }

    fn write_u32(&mut self, value: u32) {
        let value = value.to_le_bytes();
        self.buf[self.idx..self.idx + 4].copy_from_slice(&value);
        self.idx += 4;
    }

    fn write_slice(&mut self, data: &[u8]) {
        self.buf[self.idx..self.idx + data.len()].copy_from_slice(data);
        self.idx += data.len();
    }

    fn write_ok(&mut self) {
        self.write_u8(ResponseStatus::DAP_OK.into());
    }

    fn write_err(&mut self) {
        self.write_u8(ResponseStatus::DAP_ERROR.into());
    }

    fn write_u8_at(&mut self, idx: usize, value: u8) {
        self.buf[idx] = value;
    }

    fn write_u16_at(&mut self, idx: usize, value: u16) {
        let value = value.to_le_bytes();
        self.buf[idx..idx + 2].copy_from_slice(&value);
    }
}

/// The CMSIS-DAP command dispatcher, owning the DAP engine and the
/// request-scoped configuration the host hands us.
pub struct Dispatcher<IO> {
    core: DapCore<IO>,
    version: &'static str,
    connected: bool,
    /// Mask applied by value-match reads; set by match-mask writes and
    /// persistent across request packets.
    match_mask: u32,
    match_retries: usize,
}

impl<IO: SwdIo> Dispatcher<IO> {
    pub fn new(io: IO, version: &'static str) -> Self {
        Dispatcher {
            core: DapCore::new(io),
            version,
            connected: false,
            match_mask: 0xFFFF_FFFF,
            match_retries: DEFAULT_MATCH_RETRIES,
        }
    }

    pub fn core(&self) -> &DapCore<IO> {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut DapCore<IO> {
        &mut self.core
    }

    /// Process one CMSIS-DAP command from `report` into `rbuf`.
    ///
    /// Returns the number of bytes to send back: the full packet size, or
    /// zero when the command takes no response.
    pub fn process_command(&mut self, report: &[u8], rbuf: &mut [u8; PACKET_SIZE]) -> usize {
        *rbuf = [0; PACKET_SIZE];
        let req = match Request::from_report(report) {
            Some(req) => req,
            None => return 0,
        };

        let resp = &mut ResponseWriter::new(req.command, rbuf);
        match req.command {
            Command::DAP_Info => self.process_info(req, resp),
            Command::DAP_HostStatus => self.process_host_status(req, resp),
            Command::DAP_Connect => self.process_connect(req, resp),
            Command::DAP_Disconnect => self.process_disconnect(req, resp),
            Command::DAP_WriteABORT => self.process_write_abort(req, resp),
            Command::DAP_Delay => self.process_delay(req, resp),
            Command::DAP_ResetTarget => self.process_reset_target(req, resp),
            Command::DAP_SWJ_Pins => self.process_swj_pins(req, resp),
            Command::DAP_SWJ_Clock => self.process_swj_clock(req, resp),
            Command::DAP_SWJ_Sequence => self.process_swj_sequence(req, resp),
            Command::DAP_SWD_Configure => self.process_swd_configure(req, resp),
            Command::DAP_TransferConfigure => self.process_transfer_configure(req, resp),
            Command::DAP_Transfer => self.process_transfer(req, resp),
            Command::DAP_TransferBlock => self.process_transfer_block(req, resp),
            Command::DAP_TransferAbort => {
                // Accepted only at request boundaries, where nothing is
                // ever pending; no response is sent.
                return 0;
            }
            Command::Unimplemented => {}
        }

        PACKET_SIZE
    }

    fn process_info(&mut self, mut req: Request, resp: &mut ResponseWriter) {
        match DAPInfoID::try_from(req.next_u8()) {
            // Zero-length strings direct the host to the USB descriptors
            // for the probe identity, and mark the target as unknown.
            Ok(DAPInfoID::VendorID)
            | Ok(DAPInfoID::ProductID)
            | Ok(DAPInfoID::SerialNumber)
            | Ok(DAPInfoID::TargetVendor)
            | Ok(DAPInfoID::TargetName) => resp.write_u8(0),
            Ok(DAPInfoID::FirmwareVersion) => {
                resp.write_u8(self.version.len() as u8);
                resp.write_slice(self.version.as_bytes());
            }
            Ok(DAPInfoID::Capabilities) => {
                resp.write_u8(1);
                // Bit 0: SWD supported; no JTAG, no SWO.
                resp.write_u8(0x01);
            }
            Ok(DAPInfoID::MaxPacketCount) => {
                resp.write_u8(1);
                // One packet in flight: no request pipelining.
                resp.write_u8(1);
            }
            Ok(DAPInfoID::MaxPacketSize) => {
                resp.write_u8(2);
                resp.write_u16(PACKET_SIZE as u16);
            }
            _ => resp.write_u8(0),
        }
    }

    fn process_host_status(&mut self, mut req: Request, resp: &mut ResponseWriter) {
        let status_type = req.next_u8();
        let status = req.next_u8();
        if let Ok(HostStatusType::Connect) = HostStatusType::try_from(status_type) {
            self.core.io_mut().set_activity_led(status != 0);
        }
        resp.write_u8(0);
    }

    fn process_connect(&mut self, mut req: Request, resp: &mut ResponseWriter) {
        let port = req.next_u8();
        match ConnectPort::try_from(port) {
            Ok(ConnectPort::Default) | Ok(ConnectPort::SWD) => {
                match self.core.connect() {
                    Ok(()) => debug!("SWD connect complete"),
                    Err(e) => warn!("SWD connect failed: {:?}", e),
                }
                self.connected = true;
                resp.write_u8(ConnectPortResponse::SWD as u8);
            }
            _ => resp.write_u8(ConnectPortResponse::Failed as u8),
        }
    }

    fn process_disconnect(&mut self, _req: Request, resp: &mut ResponseWriter) {
        let c = self.core.counters();
        debug!(
            "disconnect: {} transfers, {} waits, {} faults, {} parity, {} protocol",
            c.transfers, c.waits, c.faults, c.parity_errors, c.protocol_errors
        );
        self.connected = false;
        self.core.release();
        resp.write_ok();
    }

    fn process_write_abort(&mut self, mut req: Request, resp: &mut ResponseWriter) {
        let _idx = req.next_u8();
        let value = req.next_u32();
        // A single raw ABORT write, nothing more: this command exists to
        // clear a latched sticky error, so it must not be gated on a
        // connection or followed by reads the port could fault.
        if let Err(e) = self.core.write_dp(dp::ABORT, value) {
            warn!("ABORT write failed: {:?}", e);
        }
        resp.write_ok();
    }

    fn process_delay(&mut self, mut req: Request, resp: &mut ResponseWriter) {
        let delay = req.next_u16();
        self.core.settle(delay as u32);
        resp.write_ok();
    }

    fn process_reset_target(&mut self, _req: Request, resp: &mut ResponseWriter) {
        resp.write_ok();
        // No device-specific reset sequence is implemented.
        resp.write_u8(0);
    }

    fn process_swj_pins(&mut self, mut req: Request, resp: &mut ResponseWriter) {
        let output = req.next_u8();
        let mask = req.next_u8();
        let _wait = req.next_u32();

        const NRESET_POS: u8 = 7;

        if mask & (1 << NRESET_POS) != 0 {
            let level = output & (1 << NRESET_POS) != 0;
            self.core.drive_reset(level);
            if level {
                // The target just came out of reset: bring the interface
                // back up and restore the boot memory mapping its loader
                // expects.
                self.core.settle(RESET_SETTLE);
                if let Err(e) = self.core.connect() {
                    warn!("reconnect after target reset failed: {:?}", e);
                }
                let _ = self.core.reg_write(Port::Ap, 1, 0x400F_C040);
                let _ = self.core.reg_write(Port::Ap, 3, 1);
            }
        }

        // The requested levels are reported back as the pin state.
        resp.write_u8(output);
    }

    fn process_swj_clock(&mut self, mut req: Request, resp: &mut ResponseWriter) {
        // The wire rate is fixed by the half-cycle delay; the requested
        // frequency is only a hint.
        let _clock = req.next_u32();
        resp.write_ok();
    }

    fn process_swj_sequence(&mut self, mut req: Request, resp: &mut ResponseWriter) {
        let _bits = req.next_u8();
        resp.write_ok();
    }

    fn process_swd_configure(&mut self, mut req: Request, resp: &mut ResponseWriter) {
        let _config = req.next_u8();
        resp.write_ok();
    }

    fn process_transfer_configure(&mut self, mut req: Request, resp: &mut ResponseWriter) {
        // Idle cycles are fixed; the retry counts are honored.
        let _idle_cycles = req.next_u8();
        self.core.set_wait_retries(req.next_u16() as usize);
        self.match_retries = req.next_u16() as usize;
        resp.write_ok();
    }

    fn process_transfer(&mut self, mut req: Request, resp: &mut ResponseWriter) {
        let _idx = req.next_u8();
        let count = req.next_u8();

        // Reserve the count and response-status bytes.
        resp.write_u16(0);

        let mut executed: u8 = 0;
        let mut ack: u8 = Ack::Ok.into();

        for _ in 0..count {
            let treq = TransferRequest(req.next_u8());
            match treq.direction() {
                Direction::Read => {
                    if treq.value_match() {
                        let expected = req.next_u32();
                        match self.poll_match(treq, expected, &mut ack) {
                            PollMatch::Matched => {}
                            PollMatch::Mismatch => {
                                executed += 1;
                                break;
                            }
                            PollMatch::WireError => break,
                        }
                    } else {
                        match self.core.reg_read(treq.port(), treq.a()).check(&mut ack) {
                            Some(value) => resp.write_u32(value),
                            None => break,
                        }
                    }
                }
                Direction::Write => {
                    if treq.match_mask() {
                        // The word updates the match mask; nothing goes on
                        // the wire.
                        self.match_mask = req.next_u32();
                    } else {
                        let value = req.next_u32();
                        if self
                            .core
                            .reg_write(treq.port(), treq.a(), value)
                            .check(&mut ack)
                            .is_none()
                        {
                            break;
                        }
                    }
                }
            }
            executed += 1;
        }

        resp.write_u8_at(1, executed);
        resp.write_u8_at(2, ack);
        self.resync_if_failed(ack);
    }

    /// Re-read a register until the masked value matches, bounded by the
    /// match-retry hint. On exhaustion the value-mismatch flag is set.
    fn poll_match(&mut self, treq: TransferRequest, expected: u32, ack: &mut u8) -> PollMatch {
        for _ in 0..self.match_retries + 1 {
            match self.core.reg_read(treq.port(), treq.a()).check(ack) {
                Some(value) => {
                    if value & self.match_mask == expected {
                        return PollMatch::Matched;
                    }
                }
                None => return PollMatch::WireError,
            }
        }
        *ack |= RESPONSE_VALUE_MISMATCH;
        PollMatch::Mismatch
    }

    fn process_transfer_block(&mut self, mut req: Request, resp: &mut ResponseWriter) {
        let _idx = req.next_u8();
        let count = req.next_u16();
        let treq = TransferRequest(req.next_u8());

        // Reserve the count and response-status bytes.
        resp.write_u16(0);
        resp.write_u8(0);

        let mut executed: u16 = 0;
        let mut ack: u8 = Ack::Ok.into();

        for _ in 0..count {
            // The failing transfer is included in the reported count so
            // the host can tell where the block stopped.
            executed += 1;
            match treq.direction() {
                Direction::Read => {
                    match self.core.reg_read(treq.port(), treq.a()).check(&mut ack) {
                        Some(value) => resp.write_u32(value),
                        None => break,
                    }
                }
                Direction::Write => {
                    let value = req.next_u32();
                    if self
                        .core
                        .reg_write(treq.port(), treq.a(), value)
                        .check(&mut ack)
                        .is_none()
                    {
                        break;
                    }
                }
            }
        }

        resp.write_u16_at(1, executed);
        resp.write_u8_at(3, ack);
        self.resync_if_failed(ack);
    }

    /// After a failed transfer batch the bus is assumed recoverable but in
    /// an unknown state; run the connect sequence again.
    fn resync_if_failed(&mut self, ack: u8) {
        if ack & 0b111 == Ack::Ok as u8 || !self.connected {
            return;
        }
        warn!("transfer batch failed (response {:#04x}); resynchronizing", ack);
        if let Err(e) = self.core.connect() {
            warn!("bus resynchronization failed: {:?}", e);
        }
    }
}

trait CheckResult<T> {
    /// Record the outcome of a transfer in the response status byte.
    ///
    /// Returns Some(T) on a successful transfer, None on error.
    fn check(self, ack: &mut u8) -> Option<T>;
}

impl<T> CheckResult<T> for Result<T> {
    fn check(self, ack: &mut u8) -> Option<T> {
        match self {
            Ok(v) => {
                *ack = Ack::Ok.into();
                Some(v)
            }
            Err(Error::AckWait) => {
                *ack = Ack::Wait.into();
                None
            }
            Err(Error::AckFault) => {
                *ack = Ack::Fault.into();
                None
            }
            Err(Error::AckProtocol) | Err(Error::BadParity) => {
                *ack = u8::from(Ack::Fault) | RESPONSE_PROTOCOL_ERROR;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{packet, SimTarget};

    const VERSION: &str = "v1.2-g8c0f";

    fn dispatcher() -> Dispatcher<SimTarget> {
        Dispatcher::new(SimTarget::new(), VERSION)
    }

    fn run(d: &mut Dispatcher<SimTarget>, prefix: &[u8]) -> (usize, [u8; PACKET_SIZE]) {
        let req = packet(prefix);
        let mut resp = [0u8; PACKET_SIZE];
        let n = d.process_command(&req, &mut resp);
        (n, resp)
    }

    fn connect(d: &mut Dispatcher<SimTarget>) {
        let (n, resp) = run(d, &[0x02, 0x01]);
        assert_eq!(n, PACKET_SIZE);
        assert_eq!(&resp[..2], &[0x02, 0x01]);
    }

    #[test]
    fn info_max_packet_size() {
        let mut d = dispatcher();
        let (n, resp) = run(&mut d, &[0x00, 0xFF]);
        assert_eq!(n, PACKET_SIZE);
        assert_eq!(&resp[..4], &[0x00, 0x02, 0x40, 0x00]);
        assert!(resp[4..].iter().all(|&b| b == 0), "zero padded");
    }

    #[test]
    fn info_max_packet_count() {
        let mut d = dispatcher();
        let (_, resp) = run(&mut d, &[0x00, 0xFE]);
        assert_eq!(&resp[..4], &[0x00, 0x01, 0x01, 0x00]);
    }

    #[test]
    fn info_identity_strings_defer_to_usb() {
        let mut d = dispatcher();
        for id in &[0x01u8, 0x02, 0x03, 0x05, 0x06] {
            let (_, resp) = run(&mut d, &[0x00, *id]);
            assert_eq!(&resp[..2], &[0x00, 0x00]);
        }
    }

    #[test]
    fn info_firmware_version_and_capabilities() {
        let mut d = dispatcher();
        let (_, resp) = run(&mut d, &[0x00, 0x04]);
        assert_eq!(resp[1] as usize, VERSION.len());
        assert_eq!(&resp[2..2 + VERSION.len()], VERSION.as_bytes());

        let (_, resp) = run(&mut d, &[0x00, 0xF0]);
        // SWD only: no JTAG, no SWO.
        assert_eq!(&resp[..3], &[0x00, 0x01, 0x01]);
    }

    #[test]
    fn connect_swd_runs_the_line_switch_and_reset() {
        let mut d = dispatcher();
        connect(&mut d);
        let sim = d.core().io();
        assert!(sim.jtag_to_swd_seqs >= 1);
        assert!(sim.line_resets >= 2);
    }

    #[test]
    fn connect_rejects_jtag() {
        let mut d = dispatcher();
        let (_, resp) = run(&mut d, &[0x02, 0x02]);
        assert_eq!(&resp[..2], &[0x02, 0x00]);
    }

    #[test]
    fn transfer_reads_idcode() {
        let mut d = dispatcher();
        connect(&mut d);
        let (_, resp) = run(&mut d, &[0x05, 0x00, 0x01, 0x02]);
        assert_eq!(&resp[..3], &[0x05, 0x01, 0x01]);
        assert_eq!(&resp[3..7], &0x1BA0_1477u32.to_le_bytes());
    }

    #[test]
    fn transfer_value_match_with_mask_from_a_prior_packet() {
        let mut d = dispatcher();
        connect(&mut d);
        d.core_mut().io_mut().idcode = 0;

        // Set the match mask to all ones; no wire activity.
        let (_, resp) = run(&mut d, &[0x05, 0x00, 0x01, 0x20, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(&resp[..3], &[0x05, 0x01, 0x01]);

        // Poll DP[0] for zero; the trailing zero bytes decode as one more
        // write transfer, so two transfers complete.
        let (_, resp) = run(&mut d, &[0x05, 0x00, 0x02, 0x12, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(&resp[..3], &[0x05, 0x02, 0x01]);
    }

    #[test]
    fn transfer_value_match_reports_mismatch() {
        let mut d = dispatcher();
        connect(&mut d);
        // Two match retries, plenty of wait retries.
        let (_, resp) = run(&mut d, &[0x04, 0x00, 0x08, 0x00, 0x02, 0x00]);
        assert_eq!(&resp[..2], &[0x04, 0x00]);

        // IDCODE is never zero, so the poll gives up and flags it.
        let (_, resp) = run(&mut d, &[0x05, 0x00, 0x01, 0x12, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(&resp[..3], &[0x05, 0x01, 0x01 | RESPONSE_VALUE_MISMATCH]);
    }

    #[test]
    fn write_abort() {
        let mut d = dispatcher();
        connect(&mut d);
        let (_, resp) = run(&mut d, &[0x08, 0x00, 0x1E, 0x00, 0x00, 0x00]);
        assert_eq!(&resp[..2], &[0x08, 0x00]);
        assert!(d.core().io().abort_writes.contains(&0x1E));
    }

    #[test]
    fn write_abort_clears_a_latched_sticky_error() {
        let mut d = dispatcher();
        connect(&mut d);
        d.core_mut().io_mut().ctrlstat |= 1 << 5;
        d.core_mut().io_mut().clear_records();

        let (_, resp) = run(&mut d, &[0x08, 0x00, 0x1E, 0x00, 0x00, 0x00]);
        assert_eq!(&resp[..2], &[0x08, 0x00]);
        let sim = d.core().io();
        assert_eq!(sim.ctrlstat & (1 << 5), 0);
        // Exactly one transaction on the wire: the ABORT write itself.
        assert_eq!(sim.requests.len(), 1);
    }

    #[test]
    fn transfer_block_round_trip() {
        let mut d = dispatcher();
        connect(&mut d);

        // Load the TAR through a plain AP write transfer.
        let (_, resp) = run(&mut d, &[0x05, 0x00, 0x01, 0x05, 0x40, 0x00, 0x00, 0x20]);
        assert_eq!(&resp[..3], &[0x05, 0x01, 0x01]);

        // Two words through DRW, auto-incrementing.
        let (_, resp) = run(
            &mut d,
            &[
                0x06, 0x00, 0x02, 0x00, 0x0D, 0x0D, 0xF0, 0xAD, 0x8B, 0xEF, 0xBE, 0xAD, 0xDE,
            ],
        );
        assert_eq!(&resp[..4], &[0x06, 0x02, 0x00, 0x01]);
        assert_eq!(d.core().io().peek(0x2000_0040), 0x8BAD_F00D);
        assert_eq!(d.core().io().peek(0x2000_0044), 0xDEAD_BEEF);

        // Rewind the TAR and read the words back.
        run(&mut d, &[0x05, 0x00, 0x01, 0x05, 0x40, 0x00, 0x00, 0x20]);
        let (_, resp) = run(&mut d, &[0x06, 0x00, 0x02, 0x00, 0x0F]);
        assert_eq!(&resp[..4], &[0x06, 0x02, 0x00, 0x01]);
        assert_eq!(&resp[4..8], &0x8BAD_F00Du32.to_le_bytes());
        assert_eq!(&resp[8..12], &0xDEAD_BEEFu32.to_le_bytes());
    }

    #[test]
    fn failed_transfer_stops_the_batch_and_resyncs() {
        let mut d = dispatcher();
        connect(&mut d);
        d.core_mut().io_mut().clear_records();
        d.core_mut().io_mut().force_acks(&[0b100]);

        // Two reads requested; the first faults, nothing executes after it.
        let (_, resp) = run(&mut d, &[0x05, 0x00, 0x02, 0x02, 0x02]);
        assert_eq!(&resp[..3], &[0x05, 0x00, 0x04]);
        // The dispatcher re-ran the connect sequence to resynchronize.
        assert!(d.core().io().jtag_to_swd_seqs >= 1);
    }

    #[test]
    fn protocol_errors_map_to_fault_plus_flag() {
        let mut d = dispatcher();
        connect(&mut d);
        d.core_mut().io_mut().force_acks(&[0b011]);

        let (_, resp) = run(&mut d, &[0x05, 0x00, 0x01, 0x02]);
        assert_eq!(&resp[..3], &[0x05, 0x00, 0x04 | RESPONSE_PROTOCOL_ERROR]);
    }

    #[test]
    fn swj_pins_deassert_reboots_the_interface() {
        let mut d = dispatcher();
        connect(&mut d);
        d.core_mut().io_mut().clear_records();

        let (_, resp) = run(&mut d, &[0x10, 0x80, 0x80, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(&resp[..2], &[0x10, 0x80]);
        let sim = d.core().io();
        assert_eq!(sim.reset_levels.last(), Some(&true));
        assert!(sim.jtag_to_swd_seqs >= 1);
        // The vendor boot mapping is restored through TAR/DRW.
        assert_eq!(sim.peek(0x400F_C040), 1);
    }

    #[test]
    fn swj_pins_assert_only_drives_the_pin() {
        let mut d = dispatcher();
        connect(&mut d);
        d.core_mut().io_mut().clear_records();

        let (_, resp) = run(&mut d, &[0x10, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(&resp[..2], &[0x10, 0x00]);
        let sim = d.core().io();
        assert_eq!(sim.reset_levels.last(), Some(&false));
        assert_eq!(sim.jtag_to_swd_seqs, 0);
    }

    #[test]
    fn host_status_drives_the_led() {
        let mut d = dispatcher();
        let (_, resp) = run(&mut d, &[0x01, 0x00, 0x01]);
        assert_eq!(&resp[..2], &[0x01, 0x00]);
        assert_eq!(d.core().io().led, Some(true));
    }

    #[test]
    fn housekeeping_commands_acknowledge() {
        let mut d = dispatcher();
        // Disconnect, SWJ_Clock, SWJ_Sequence, SWD_Configure, Delay.
        for prefix in &[
            &[0x03u8][..],
            &[0x11, 0x40, 0x42, 0x0F, 0x00][..],
            &[0x12, 0x08, 0xFF][..],
            &[0x13, 0x00][..],
            &[0x09, 0x10, 0x00][..],
        ] {
            let (n, resp) = run(&mut d, prefix);
            assert_eq!(n, PACKET_SIZE);
            assert_eq!(resp[0], prefix[0]);
            assert_eq!(resp[1], 0x00);
        }

        let (_, resp) = run(&mut d, &[0x0A]);
        assert_eq!(&resp[..3], &[0x0A, 0x00, 0x00]);
    }

    #[test]
    fn unknown_commands_get_a_generic_reply() {
        let mut d = dispatcher();
        let (n, resp) = run(&mut d, &[0x42, 0x01, 0x02]);
        assert_eq!(n, PACKET_SIZE);
        assert_eq!(resp[0], 0xFF);
        assert!(resp[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn transfer_abort_sends_no_response() {
        let mut d = dispatcher();
        let (n, _) = run(&mut d, &[0x07]);
        assert_eq!(n, 0);
    }

    #[test]
    fn empty_reports_are_ignored() {
        let mut d = dispatcher();
        let mut resp = [0u8; PACKET_SIZE];
        assert_eq!(d.process_command(&[], &mut resp), 0);
    }
}
