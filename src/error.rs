//! Error taxonomy for the link, ATR, T=0 and bridge layers.
//!
//! This mirrors the outcome set a real ISO/IEC 7816-3 stack can surface: most
//! of these aren't "bugs", they're expected wire conditions (a terminal that
//! stopped clocking, a card that was pulled mid-transaction) that the bridge
//! maps onto a [`crate::bridge::SessionOutcome`].

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Why a parsed ATR failed a §4.3 validity rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BadAtrReason {
    #[error("TS byte is neither 0x3B nor 0x3F")]
    Ts,
    #[error("T0 byte malformed")]
    T0,
    #[error("TA2 present: specific mode not supported")]
    Ta2,
    #[error("TB2 present: voltage modifier deprecated, not supported")]
    Tb2,
    #[error("TC2 present but not 0x0A")]
    Tc2,
    #[error("TA3 out of range (must be >= 0x0F and != 0xFF)")]
    Ta3,
    #[error("TB3 out of range")]
    Tb3,
    #[error("TC3 present but not 0x00")]
    Tc3,
    #[error("TB1 present but not 0x00")]
    Tb1,
    #[error("TD1 indicates an unsupported protocol")]
    Td1,
    #[error("TCK checksum mismatch")]
    Tck,
}

#[derive(Debug, Error)]
pub enum Error {
    /// Caller passed a structurally invalid argument.
    #[error("parameter error: {0}")]
    Parameter(&'static str),

    /// A buffer or allocation could not grow to hold the request.
    #[error("memory exhausted")]
    MemoryExhausted,

    /// A blocking wait's maximum clock count elapsed with nothing observed.
    #[error("timed out waiting for byte/edge")]
    TimedOut,

    /// The terminal dropped RST mid-exchange (cooperative-cancellation path).
    #[error("terminal RST dropped low")]
    ResetLow,

    /// The terminal's clock stopped.
    #[error("no clock on terminal side")]
    NoClock,

    /// Framing or parity error unresolvable after the retry budget.
    #[error("bad frame (parity/framing failure after retries)")]
    BadFrame,

    /// A specific ATR interface-byte validity rule failed (§4.3).
    #[error("bad ATR: {0}")]
    BadAtr(BadAtrReason),

    /// The card's reply to command data bytes was none of INS/~INS/0x60.
    #[error("unexpected procedure byte 0x{0:02X}")]
    UnexpectedProcedureByte(u8),

    /// No card present where one was required.
    #[error("card absent")]
    CardAbsent,

    /// Cold/warm reset did not produce an ATR within the bounded window.
    #[error("card activation failed")]
    CardActivationFailed,

    /// The non-volatile log store is full; see §4.6 truncation behaviour.
    #[error("log store out of space")]
    OutOfSpace,

    /// A host AT-command line could not be parsed.
    #[error("malformed host command: {0}")]
    BadHostCommand(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Utf8(#[from] std::str::Utf8Error),

    #[error(transparent)]
    ParseInt(#[from] std::num::ParseIntError),

    #[error(transparent)]
    Hex(#[from] hex::FromHexError),
}
