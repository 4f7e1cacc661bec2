//! The ISO/IEC 7816-3 link layer, shared between the card-facing and
//! terminal-facing wires (spec §4.2, component C2).

pub mod convention;

pub use convention::Convention;

use crate::error::{Error, Result};
use crate::hal::SideIo;
use crate::time::{CancellationToken, FracEtu, MaxWait};

/// Which physical side a [`Side`] value speaks for (spec §3 data model).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideKind {
    Card,
    Terminal,
}

/// Extra guard time carried in the ATR's TC1 byte. `0..=254` add that many
/// ETUs to the baseline guard; `255` is the ISO 7816-3 special case meaning
/// "reduce the minimum guard time to 1 ETU" (rare enough that real-world T=0
/// cards never set it; treated here as equivalent to 0 beyond the baseline).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tc1(pub u8);

impl Tc1 {
    pub const DEFAULT: Tc1 = Tc1(0);

    fn extra_etus(self) -> u32 {
        if self.0 == 255 {
            0
        } else {
            self.0 as u32
        }
    }
}

/// One endpoint of the bridge's dual-endpoint link: a convention, a guard
/// time, and the I/O it's wired to (spec §3: "mutable I/O pin state").
pub struct Side<IO: SideIo> {
    pub kind: SideKind,
    pub convention: Convention,
    pub tc1: Tc1,
    pub io: IO,
    pub cancel: CancellationToken,
}

impl<IO: SideIo> Side<IO> {
    pub fn new(kind: SideKind, convention: Convention, tc1: Tc1, io: IO) -> Self {
        Self {
            kind,
            convention,
            tc1,
            io,
            cancel: CancellationToken::new(),
        }
    }

    fn wait(&mut self, etus: FracEtu) -> Result<()> {
        self.io.wait_etu(etus, MaxWait::FOREVER, &self.cancel)
    }

    /// Public ETU wait, used by the bridge for the inter-byte guard time it
    /// holds itself (spec §4.3's 2-ETU gap between republished ATR bytes).
    pub fn wait_etu(&mut self, etus: FracEtu) -> Result<()> {
        self.wait(etus)
    }

    /// Sends a single character with no parity retransmission handling;
    /// used only for the TS byte, which precedes any parity convention.
    pub fn send_byte_no_parity(&mut self, byte: u8) -> Result<()> {
        let wire_bits = self.convention.encode(byte);
        let parity = Convention::parity_of_wire_bits(wire_bits);
        self.io.send_raw(wire_bits, parity)
    }

    /// Sends one character with the full ISO 7816-3 parity/NACK protocol
    /// (spec §4.2): after sending, sample the line one ETU later; a low
    /// reading is a NACK, retried up to four times with a 2-ETU pre-delay,
    /// a fifth failure surfaces as [`Error::BadFrame`].
    pub fn send_byte_with_retry(&mut self, byte: u8) -> Result<()> {
        let wire_bits = self.convention.encode(byte);
        let parity = Convention::parity_of_wire_bits(wire_bits);

        for attempt in 0..5 {
            if attempt > 0 {
                self.wait(FracEtu::whole(2))?;
            }
            self.io.send_raw(wire_bits, parity)?;
            self.wait(FracEtu::whole(1))?;
            if !self.io.is_low() {
                self.hold_guard_time()?;
                return Ok(());
            }
        }
        Err(Error::BadFrame)
    }

    /// Receives one character with no parity checking (used only where the
    /// caller has its own recovery strategy, e.g. re-reading a procedure
    /// byte after a 0x60).
    pub fn recv_byte_no_parity(&mut self, max_wait: MaxWait) -> Result<u8> {
        let (wire_bits, _parity) = self.io.recv_raw(max_wait, &self.cancel)?;
        Ok(self.convention.decode(wire_bits))
    }

    /// Receives one character, NACKing bad parity by pulling the line low
    /// for >=1 ETU starting 10.5 ETU after the start bit, and expecting the
    /// sender to retransmit (spec §4.2). Gives up after four NACKs.
    pub fn recv_byte_with_retry(&mut self, max_wait: MaxWait) -> Result<u8> {
        for attempt in 0..5 {
            let (wire_bits, parity) = self.io.recv_raw(max_wait, &self.cancel)?;
            if parity == Convention::parity_of_wire_bits(wire_bits) {
                return Ok(self.convention.decode(wire_bits));
            }
            if attempt == 4 {
                return Err(Error::BadFrame);
            }
            // NACK: pull low for >=1 ETU, starting 10.5 ETU after the start
            // bit (i.e. ~1 ETU after the character's own framing ends).
            self.wait(FracEtu::half(10))?;
            self.io.pull_low(FracEtu::whole(1))?;
        }
        unreachable!("loop always returns by attempt 4")
    }

    /// Idle-level hold after a sent character: `2 + TC1` ETU (spec §6).
    fn hold_guard_time(&mut self) -> Result<()> {
        let extra = self.tc1.extra_etus();
        self.wait(FracEtu::whole(2 + extra))
    }

    /// Sends the remaining bytes of a command's data field back-to-back
    /// with `1 + TC1` ETU inter-byte guard (spec §4.4).
    pub fn send_data_chunk(&mut self, data: &[u8]) -> Result<()> {
        let extra = self.tc1.extra_etus();
        for (i, &b) in data.iter().enumerate() {
            if i > 0 {
                self.wait(FracEtu::whole(1 + extra))?;
            }
            self.send_byte_with_retry(b)?;
        }
        Ok(())
    }
}
