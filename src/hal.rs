//! Hardware abstraction seam (spec §1, §6: "external collaborators").
//!
//! Concrete MCU drivers (the character display, buttons, LEDs, persistent
//! configuration storage, USB CDC endpoint plumbing, bootloader entry) are
//! explicitly out of scope (spec §1). What *is* in scope is the shape of the
//! contract the bridge (C5) programs against, so it can be driven in tests
//! and simulation without real silicon — the same role `Transport` /
//! `Card` play in the teacher crate's `pcsc` module, trait seams with a
//! trivial in-memory/no-op implementation alongside the real one.

use crate::error::Result;
use crate::time::{CancellationToken, FracEtu, MaxWait};

/// One side's physical link: the I/O pin plus its own timing unit (card
/// clock timer, or terminal clock edge counter), bundled the way spec §3
/// describes `Side` ("a reference to its timing unit, and mutable I/O pin
/// state"). Concrete MCU backends drive a UART peripheral or bit-bang a
/// GPIO against a hardware timer; this trait is the seam the link layer
/// (`crate::link`) and ATR engine (`crate::atr`) program against.
pub trait SideIo {
    /// Blocks until `etus` have elapsed on this side's own clock, subject to
    /// `max_wait` (0 = indefinite) and cooperative cancellation.
    fn wait_etu(
        &mut self,
        etus: FracEtu,
        max_wait: MaxWait,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Blocks for an absolute duration independent of any ETU clock, used
    /// only during activation before the card clock is running (spec §4.3:
    /// "wait >=50us" before releasing I/O and starting the clock).
    fn wait_micros(&mut self, micros: u32, cancel: &CancellationToken) -> Result<()>;

    /// Sends a single raw bit-clocked octet (already convention-encoded and
    /// parity-computed by the caller) onto the wire, blocking until the
    /// stop bits have been held.
    fn send_raw(&mut self, wire_bits: u8, parity: bool) -> Result<()>;

    /// Samples the wire for one character, blocking up to `max_wait` clock
    /// cycles, honouring `cancel`. Returns the 8 wire-order data bits and
    /// the sampled parity bit.
    fn recv_raw(&mut self, max_wait: MaxWait, cancel: &CancellationToken) -> Result<(u8, bool)>;

    /// Pulls the line low for (approximately) `etus`, used both to emit a
    /// parity NACK (receive side) and to sense one (transmit side).
    fn pull_low(&mut self, etus: FracEtu) -> Result<()>;

    /// True if the line is currently observed low.
    fn is_low(&self) -> bool;

    /// Drives RST. `true` = high (active/running), `false` = low (reset
    /// asserted). No-op on the terminal side, which never drives RST.
    fn set_rst(&mut self, high: bool);

    /// Drives VCC. No-op on the terminal side.
    fn set_vcc(&mut self, high: bool);

    /// Starts/stops the side's own clock (card side only; the terminal
    /// side only ever observes the terminal's clock, it never drives it).
    fn set_clock_running(&mut self, running: bool);

    /// True if a card is mechanically present (card side only).
    fn card_present(&self) -> bool {
        true
    }

    /// True if RST is currently observed high. On the card side this
    /// reflects what `set_rst` last drove; on the terminal side it reflects
    /// the line as driven by the terminal itself, which the bridge only
    /// ever observes. Real MCU backends wait on the RST-rising interrupt
    /// directly; this poll-based default suits the in-memory fakes, whose
    /// callers set the field before invoking a session.
    fn rst_is_high(&self) -> bool {
        true
    }
}

/// Buttons exposed to the filter-GenerateAC (M2) approval flow (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    A,
    B,
    C,
    D,
}

pub trait ButtonPad {
    /// Returns the buttons currently observed pressed, if any.
    fn button_state(&self) -> Vec<Button>;
}

/// The character display (spec §6). The core only ever writes to it.
pub trait Display {
    fn show(&mut self, line: &str);
    fn display_available(&self) -> bool;
}

/// Hardware watchdog (spec §4.5). Must be stroked more often than its period
/// or the device resets; any wait longer than the watchdog period must
/// extend or disable it explicitly.
pub trait Watchdog {
    fn stroke(&mut self);
    fn disable(&mut self);
    fn enable(&mut self);
}

/// Byte-addressed non-volatile store backing the persisted log layout
/// (spec §6) and session-to-session configuration (last AID, warm-reset
/// flag, transaction counter).
pub trait NonVolatileStore {
    fn read(&self, addr: u16, buf: &mut [u8]) -> Result<()>;
    fn write(&mut self, addr: u16, buf: &[u8]) -> Result<()>;
    fn capacity(&self) -> u16;
}

/// Line-oriented USB CDC channel used by the host control channel (spec §6)
/// and by M5 (USB-emulated card).
pub trait UsbLineChannel {
    /// Blocks (subject to `max_wait`) for one CR/LF/CRLF-terminated line,
    /// without the terminator.
    fn read_line(&mut self, max_wait: MaxWait) -> Result<String>;

    /// Writes one line, appending CRLF.
    fn write_line(&mut self, line: &str) -> Result<()>;
}

/// Simple in-memory fakes of the above, used by tests and the host-side
/// simulation harness (never compiled against real hardware).
pub mod fake {
    use super::*;
    use std::collections::VecDeque;

    /// An in-memory half-duplex wire: queued inbound bytes, a log of
    /// outbound ones. No real electrical timing is modelled (waits are
    /// instantaneous no-ops); framing correctness is exercised by feeding
    /// it byte-at-a-time.
    #[derive(Debug, Default)]
    pub struct FakeSideIo {
        pub inbound: VecDeque<(u8, bool)>,
        pub outbound: Vec<(u8, bool)>,
        pub nack_next_send: bool,
        pub low: bool,
        pub rst_high: bool,
        pub vcc_high: bool,
        pub clock_running: bool,
        pub present: bool,
    }

    impl FakeSideIo {
        pub fn new() -> Self {
            Self {
                present: true,
                ..Default::default()
            }
        }
    }

    impl SideIo for FakeSideIo {
        fn wait_etu(
            &mut self,
            _etus: FracEtu,
            _max_wait: MaxWait,
            cancel: &CancellationToken,
        ) -> Result<()> {
            cancel.check()
        }

        fn wait_micros(&mut self, _micros: u32, cancel: &CancellationToken) -> Result<()> {
            cancel.check()
        }

        fn send_raw(&mut self, wire_bits: u8, parity: bool) -> Result<()> {
            self.outbound.push((wire_bits, parity));
            Ok(())
        }

        fn recv_raw(
            &mut self,
            _max_wait: MaxWait,
            cancel: &CancellationToken,
        ) -> Result<(u8, bool)> {
            cancel.check()?;
            self.inbound
                .pop_front()
                .ok_or(crate::error::Error::TimedOut)
        }

        fn pull_low(&mut self, _etus: FracEtu) -> Result<()> {
            self.low = true;
            Ok(())
        }

        fn is_low(&self) -> bool {
            self.low || self.nack_next_send
        }

        fn set_rst(&mut self, high: bool) {
            self.rst_high = high;
        }

        fn set_vcc(&mut self, high: bool) {
            self.vcc_high = high;
        }

        fn set_clock_running(&mut self, running: bool) {
            self.clock_running = running;
        }

        fn card_present(&self) -> bool {
            self.present
        }

        fn rst_is_high(&self) -> bool {
            self.rst_high
        }
    }

    #[derive(Debug, Default)]
    pub struct FakeNvStore {
        pub bytes: Vec<u8>,
    }

    impl FakeNvStore {
        pub fn new(size: u16) -> Self {
            Self {
                bytes: vec![0u8; size as usize],
            }
        }
    }

    impl NonVolatileStore for FakeNvStore {
        fn read(&self, addr: u16, buf: &mut [u8]) -> Result<()> {
            let start = addr as usize;
            let end = start + buf.len();
            if end > self.bytes.len() {
                return Err(crate::error::Error::OutOfSpace);
            }
            buf.copy_from_slice(&self.bytes[start..end]);
            Ok(())
        }

        fn write(&mut self, addr: u16, buf: &[u8]) -> Result<()> {
            let start = addr as usize;
            let end = start + buf.len();
            if end > self.bytes.len() {
                return Err(crate::error::Error::OutOfSpace);
            }
            self.bytes[start..end].copy_from_slice(buf);
            Ok(())
        }

        fn capacity(&self) -> u16 {
            self.bytes.len() as u16
        }
    }

    #[derive(Debug, Default)]
    pub struct FakeDisplay {
        pub lines: Vec<String>,
    }

    impl Display for FakeDisplay {
        fn show(&mut self, line: &str) {
            self.lines.push(line.to_string());
        }
        fn display_available(&self) -> bool {
            true
        }
    }

    #[derive(Debug, Default)]
    pub struct FakeButtonPad {
        pub pressed: Vec<Button>,
    }

    impl ButtonPad for FakeButtonPad {
        fn button_state(&self) -> Vec<Button> {
            self.pressed.clone()
        }
    }

    /// An in-memory line channel: queued inbound lines, a log of written
    /// ones. Used to drive the host control channel and M5 in tests without
    /// a real USB CDC endpoint.
    #[derive(Debug, Default)]
    pub struct FakeUsbLineChannel {
        pub inbound: VecDeque<String>,
        pub outbound: Vec<String>,
    }

    impl FakeUsbLineChannel {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl UsbLineChannel for FakeUsbLineChannel {
        fn read_line(&mut self, _max_wait: MaxWait) -> Result<String> {
            self.inbound
                .pop_front()
                .ok_or(crate::error::Error::TimedOut)
        }

        fn write_line(&mut self, line: &str) -> Result<()> {
            self.outbound.push(line.to_string());
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    pub struct FakeWatchdog {
        pub strokes: u32,
        pub enabled: bool,
    }

    impl Watchdog for FakeWatchdog {
        fn stroke(&mut self) {
            self.strokes += 1;
        }
        fn disable(&mut self) {
            self.enabled = false;
        }
        fn enable(&mut self) {
            self.enabled = true;
        }
    }
}
