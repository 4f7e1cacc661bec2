//! Bounded, length-tagged event log (spec §3 "Log entry"/"Log buffer", §4.6,
//! component C6).
//!
//! Distinct from the `tracing` calls sprinkled through the link/ATR/bridge
//! layers: this is the on-device, byte-for-byte record that gets flushed to
//! non-volatile storage and streamed back over the host control channel
//! (`AT+CGEE`). Its format is load-bearing (spec §8 invariants reference log
//! position monotonicity directly), so it is not a `tracing::Layer`.

use crate::error::{Error, Result};
use crate::hal::NonVolatileStore;

/// Spec §3: "implementation chooses, spec requires >=3.5 KiB".
pub const MIN_CAPACITY: usize = 3584;

/// Event categories (spec §4.6). Each carries 1..=4 payload bytes; the low
/// two bits of the encoded tag record `len - 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Event {
    ByteFromCard = 0,
    ByteToCard = 1,
    ByteFromTerminal = 2,
    ByteToTerminal = 3,
    ByteFromHost = 4,
    ByteToHost = 5,
    AtrByte = 6,
    ResetHigh = 7,
    ResetLow = 8,
    NoClock = 9,
    TimedOut = 10,
    ParityError = 11,
    MemoryError = 12,
    TimeMarker = 13,
}

impl Event {
    fn tag_high_bits(self) -> u8 {
        (self as u8) << 2
    }
}

/// A fixed-capacity, append-only ring that never overwrites: once full,
/// further writes fail with [`Error::OutOfSpace`] rather than wrapping.
/// "Ring" here names the persisted layout's role (a continuation pointer
/// into a circular non-volatile region), not in-RAM wraparound.
pub struct Logger {
    buf: Vec<u8>,
    capacity: usize,
    truncated: bool,
}

impl Logger {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
            truncated: false,
        }
    }

    /// Current write position; never decreases within a session (spec §8).
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    /// Resets the in-RAM buffer to empty. Called after a successful
    /// [`Logger::flush`]; the persisted continuation address is the caller's
    /// responsibility to carry forward.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.truncated = false;
    }

    /// Appends one entry: `event | (len-1)` followed by `data`. `data` must
    /// be 1..=4 bytes (spec §3 "Log entry").
    pub fn log(&mut self, event: Event, data: &[u8]) -> Result<()> {
        let len = data.len();
        if len == 0 || len > 4 {
            return Err(Error::Parameter("log entry carries 1..=4 bytes"));
        }
        if self.position() + 1 + len > self.capacity {
            if !self.truncated {
                self.truncated = true;
                // Best-effort marker: one more byte recording that bytes
                // past this point were dropped, if there's room for it.
                if self.position() + 1 <= self.capacity {
                    self.buf.push(Event::MemoryError.tag_high_bits());
                }
            }
            return Err(Error::OutOfSpace);
        }
        self.buf.push(event.tag_high_bits() | (len as u8 - 1));
        self.buf.extend_from_slice(data);
        Ok(())
    }

    pub fn log_byte(&mut self, event: Event, byte: u8) -> Result<()> {
        self.log(event, &[byte])
    }

    pub fn log_time_marker(&mut self, millis: u32) -> Result<()> {
        self.log(Event::TimeMarker, &millis.to_le_bytes())
    }

    /// Copies the in-RAM log to `store` starting at `continuation_addr`
    /// (spec §6 "non-volatile, byte-addressed ... flush() which copies from
    /// RAM to non-volatile storage starting at a persisted continuation
    /// address"). Bytes that don't fit are silently discarded, matching
    /// spec §4.6. Returns the new continuation address.
    pub fn flush(&mut self, store: &mut dyn NonVolatileStore, continuation_addr: u16) -> Result<u16> {
        let capacity = store.capacity();
        let available = capacity.saturating_sub(continuation_addr) as usize;
        let to_write = self.buf.len().min(available);
        if to_write > 0 {
            store.write(continuation_addr, &self.buf[..to_write])?;
        }
        let new_addr = continuation_addr + to_write as u16;
        self.reset();
        Ok(new_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::fake::FakeNvStore;

    #[test]
    fn log_entry_encodes_length_in_low_bits() {
        let mut log = Logger::new(MIN_CAPACITY);
        log.log(Event::ByteFromCard, &[0xA4]).unwrap();
        assert_eq!(log.position(), 2);
        log.log(Event::TimeMarker, &[1, 2, 3, 4]).unwrap();
        assert_eq!(log.position(), 2 + 5);
    }

    #[test]
    fn position_never_decreases_within_a_session() {
        let mut log = Logger::new(MIN_CAPACITY);
        let mut last = 0;
        for b in 0..16u8 {
            log.log_byte(Event::ByteToTerminal, b).unwrap();
            assert!(log.position() >= last);
            last = log.position();
        }
    }

    #[test]
    fn writes_past_capacity_fail_and_never_overwrite() {
        let mut log = Logger::new(4);
        log.log_byte(Event::ByteFromCard, 0x01).unwrap();
        let err = log.log(Event::TimeMarker, &[1, 2, 3, 4]).unwrap_err();
        assert!(matches!(err, Error::OutOfSpace));
        // The truncation marker (if it fit) is the only extra byte; the
        // rejected entry itself never lands in the buffer.
        assert!(log.position() <= 4);
    }

    #[test]
    fn flush_copies_ram_to_store_and_resets_position() {
        let mut log = Logger::new(MIN_CAPACITY);
        log.log_byte(Event::ByteFromCard, 0xA4).unwrap();
        log.log_byte(Event::ByteToCard, 0x90).unwrap();
        let mut store = FakeNvStore::new(0x1000);
        let new_addr = log.flush(&mut store, 0x80).unwrap();
        assert_eq!(new_addr, 0x80 + 4);
        assert_eq!(log.position(), 0);
        let mut buf = [0u8; 4];
        store.read(0x80, &mut buf).unwrap();
        assert_eq!(buf[0], Event::ByteFromCard.tag_high_bits());
        assert_eq!(buf[1], 0xA4);
    }

    #[test]
    fn flush_discards_bytes_that_dont_fit_the_store() {
        let mut log = Logger::new(MIN_CAPACITY);
        log.log_byte(Event::ByteFromCard, 0xA4).unwrap();
        log.log_byte(Event::ByteToCard, 0x90).unwrap();
        let mut store = FakeNvStore::new(0x82); // room for only the first entry
        let new_addr = log.flush(&mut store, 0x80).unwrap();
        assert_eq!(new_addr, 0x82);
    }
}
