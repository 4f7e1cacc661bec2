//! Persisted non-volatile layout (spec §6 "Persisted log layout").
//!
//! A thin read/write struct over whatever [`NonVolatileStore`] the platform
//! provides, at the fixed byte offsets spec §6 assigns. The log region itself
//! (0x80..max) is written by [`crate::log::Logger::flush`]; this module owns
//! only the small header fields around it.

use crate::error::Result;
use crate::hal::NonVolatileStore;
use byteorder::{BigEndian, ByteOrder};

pub const WARM_RESET_FLAG_ADDR: u16 = 0x00;
pub const LAST_AID_ADDR: u16 = 0x32;
/// The fixed layout leaves 0x32..0x40 (14 bytes) for this field: one
/// length-prefix byte plus 13 payload bytes. ISO 7816-5 AIDs run 5..16
/// bytes; the longest ones are truncated rather than overrunning the
/// transaction counter at 0x40.
pub const LAST_AID_MAX_LEN: usize = 14;
pub const TRANSACTION_COUNTER_ADDR: u16 = 0x40;
pub const NEXT_FREE_POINTER_ADDR: u16 = 0x48;
pub const LOG_REGION_ADDR: u16 = 0x80;
pub const DEFAULT_MAX_USABLE_ADDR: u16 = 0x0FE0;

pub const WARM_RESET_MARKER: u8 = 0xAA;
pub const COLD_RESET_MARKER: u8 = 0x00;

/// Reads and writes the fixed byte-addressed fields spec §6 assigns.
pub struct PersistedState<'a> {
    store: &'a mut dyn NonVolatileStore,
}

impl<'a> PersistedState<'a> {
    pub fn new(store: &'a mut dyn NonVolatileStore) -> Self {
        Self { store }
    }

    pub fn warm_reset_flag(&self) -> Result<bool> {
        let mut b = [0u8; 1];
        self.store.read(WARM_RESET_FLAG_ADDR, &mut b)?;
        Ok(b[0] == WARM_RESET_MARKER)
    }

    pub fn set_warm_reset_flag(&mut self, warm: bool) -> Result<()> {
        let marker = if warm {
            WARM_RESET_MARKER
        } else {
            COLD_RESET_MARKER
        };
        self.store.write(WARM_RESET_FLAG_ADDR, &[marker])
    }

    /// Stored as a length byte followed by up to `LAST_AID_MAX_LEN - 1`
    /// payload bytes: AIDs may themselves contain `0x00`, so a null
    /// terminator can't delimit them.
    pub fn last_aid(&self) -> Result<Vec<u8>> {
        let mut buf = [0u8; LAST_AID_MAX_LEN];
        self.store.read(LAST_AID_ADDR, &mut buf)?;
        let len = (buf[0] as usize).min(LAST_AID_MAX_LEN - 1);
        Ok(buf[1..1 + len].to_vec())
    }

    pub fn set_last_aid(&mut self, aid: &[u8]) -> Result<()> {
        let mut buf = [0u8; LAST_AID_MAX_LEN];
        let len = aid.len().min(LAST_AID_MAX_LEN - 1);
        buf[0] = len as u8;
        buf[1..1 + len].copy_from_slice(&aid[..len]);
        self.store.write(LAST_AID_ADDR, &buf)
    }

    pub fn transaction_counter(&self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.store.read(TRANSACTION_COUNTER_ADDR, &mut b)?;
        Ok(BigEndian::read_u32(&b))
    }

    pub fn increment_transaction_counter(&mut self) -> Result<u32> {
        let next = self.transaction_counter()?.wrapping_add(1);
        let mut b = [0u8; 4];
        BigEndian::write_u32(&mut b, next);
        self.store.write(TRANSACTION_COUNTER_ADDR, &b)?;
        Ok(next)
    }

    /// Big-endian 16-bit pointer into the log region (spec §6: "next free").
    pub fn next_free_log_pointer(&self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.store.read(NEXT_FREE_POINTER_ADDR, &mut b)?;
        Ok(BigEndian::read_u16(&b))
    }

    pub fn set_next_free_log_pointer(&mut self, addr: u16) -> Result<()> {
        let mut b = [0u8; 2];
        BigEndian::write_u16(&mut b, addr);
        self.store.write(NEXT_FREE_POINTER_ADDR, &b)
    }
}
