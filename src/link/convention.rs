//! Direct/Inverse convention framing (spec §4.2).

/// Electrical transmission convention, inferred from the ATR's TS byte
/// (0x3B -> Direct, 0x3F -> Inverse) on the card side, fixed by
/// configuration on the terminal side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convention {
    /// 1 data bit is `Direct`: LSB first, true logic levels.
    Direct,
    /// MSB first, inverted logic levels (bit-reversed and sense-inverted on
    /// the wire). Rare; deprecated by EMV but still valid ISO 7816.
    Inverse,
}

impl Convention {
    /// Parses TS per spec §4.2: any value other than 0x3B/0x3F fails.
    pub fn from_ts(ts: u8) -> Option<Self> {
        match ts {
            0x3B => Some(Convention::Direct),
            0x3F => Some(Convention::Inverse),
            _ => None,
        }
    }

    pub fn ts_byte(self) -> u8 {
        match self {
            Convention::Direct => 0x3B,
            Convention::Inverse => 0x3F,
        }
    }

    /// Transforms a logical byte into the bit pattern that should be clocked
    /// onto the wire LSB-first. For `Inverse`, this precomputes the
    /// bit-reversed, sense-inverted form before signalling starts, as spec
    /// §4.2 requires ("the implementation must precompute the inverted form
    /// before signalling starts").
    pub fn encode(self, byte: u8) -> u8 {
        match self {
            Convention::Direct => byte,
            Convention::Inverse => !byte.reverse_bits(),
        }
    }

    /// Inverse of [`Convention::encode`]: recovers the logical byte from the
    /// bit pattern observed on the wire.
    pub fn decode(self, wire_bits: u8) -> u8 {
        match self {
            Convention::Direct => wire_bits,
            Convention::Inverse => (!wire_bits).reverse_bits(),
        }
    }

    /// Even parity bit computed over the bits as they appear on the wire
    /// (i.e. over the already-encoded/inverted form for `Inverse`, per spec
    /// §4.2: "compute parity over the *inverted* bits").
    pub fn parity_of_wire_bits(wire_bits: u8) -> bool {
        wire_bits.count_ones() % 2 == 0
    }

    /// Convenience: parity bit for a logical byte under this convention.
    pub fn parity(self, byte: u8) -> bool {
        Self::parity_of_wire_bits(self.encode(byte))
    }
}
