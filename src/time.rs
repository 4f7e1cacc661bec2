//! Timing primitives (spec §4.1, component C1).
//!
//! An ETU (Elementary Time Unit) is 372 clock cycles of the side's own clock
//! at the default conversion factor. The card side's clock is generated by
//! this core (`CardFrequency`); the terminal side's clock is merely observed
//! (`TerminalClock`). Both share the same `wait` shape: a maximum clock
//! count and a cooperative [`CancellationToken`] consulted at every wait
//! boundary, which is how an RST-falling-edge ISR unwinds a blocked call
//! without unsafe stack tricks (see spec §9, §5).

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Clock cycles making up one ETU at the default (F=372, D=1) conversion factor.
pub const CLOCKS_PER_ETU: u32 = 372;

/// Card-side clock frequency, selectable at startup (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardFrequency {
    F1Mhz,
    F2Mhz,
    F4Mhz,
}

impl CardFrequency {
    pub fn hz(self) -> u32 {
        match self {
            CardFrequency::F1Mhz => 1_000_000,
            CardFrequency::F2Mhz => 2_000_000,
            CardFrequency::F4Mhz => 4_000_000,
        }
    }

    /// Duration of one ETU on the card side, in nanoseconds.
    pub fn etu_nanos(self) -> u64 {
        (CLOCKS_PER_ETU as u64) * 1_000_000_000 / self.hz() as u64
    }
}

/// A (possibly fractional) number of ETUs, as numerator/denominator, rounded
/// to the nearest integer clock count when resolved against a frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FracEtu {
    pub num: u32,
    pub den: u32,
}

impl FracEtu {
    pub const fn whole(n: u32) -> Self {
        Self { num: n, den: 1 }
    }

    pub const fn half(n: u32) -> Self {
        Self {
            num: n * 2 + 1,
            den: 2,
        }
    }

    /// Resolves to a clock-cycle count (in units of the side's own clock,
    /// 372 per whole ETU), rounded to the nearest integer as spec §4.1
    /// requires. Independent of frequency: an ETU is always 372 clocks at
    /// the default conversion factor, regardless of how fast those clocks
    /// tick in real time.
    pub fn clocks(self) -> u32 {
        let total = CLOCKS_PER_ETU as u64 * self.num as u64;
        ((total + self.den as u64 / 2) / self.den as u64) as u32
    }
}

/// A maximum wait expressed in clock cycles. `0` means "wait indefinitely",
/// per spec §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxWait(pub u32);

impl MaxWait {
    pub const FOREVER: MaxWait = MaxWait(0);

    pub fn is_forever(self) -> bool {
        self.0 == 0
    }
}

/// Single-writer (ISR) / single-reader (foreground) cancellation flag.
///
/// The terminal-RST-falling-edge ISR calls [`CancellationToken::cancel`];
/// every blocking primitive in `link`/`t0`/`bridge` polls
/// [`CancellationToken::is_cancelled`] at wait boundaries and unwinds with
/// [`Error::ResetLow`] when set. This replaces the "rerun from `main`"
/// pattern of the original firmware (spec §9).
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Bails out of the current wait with [`Error::ResetLow`] if cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::ResetLow)
        } else {
            Ok(())
        }
    }
}

/// Counts edges of an externally-driven clock over a fixed sampling window.
/// Used to measure the terminal's clock frequency (spec §4.1): if exactly one
/// edge is observed in the window, the terminal clock is considered absent.
pub fn terminal_clock_present(edges_in_window: u32) -> bool {
    edges_in_window != 1
}
