//! M3 Dummy-PIN (spec §4.5).
//!
//! Runs the same per-APDU loop as M1, substituting a fixed dummy PIN block
//! into the first plaintext VERIFY it sees before forwarding — the PIN
//! itself never reaches the card.

use super::{run_loop, Bridge, HookOutcome, SessionOutcome};
use crate::error::Result;
use crate::hal::{SideIo, Watchdog};
use crate::log::Logger;
use crate::t0::CommandApdu;

const VERIFY_INS: u8 = 0x20;
const PLAINTEXT_PIN_P2: u8 = 0x80;

/// ISO 9564 format-2 PIN block nibble used to replace each real PIN digit.
/// Padding nibbles (0xF) and the length nibble are left untouched so the
/// block stays syntactically valid.
const DUMMY_DIGIT: u8 = 0x0;

/// Replaces the PIN digits of a format-2 PIN block with [`DUMMY_DIGIT`],
/// preserving the declared length and any trailing padding nibbles. The
/// first byte's low nibble holds the PIN length (spec §4.5: "length +
/// nibbles preserved to remain syntactically valid").
fn dummy_pin_block(block: &[u8]) -> Vec<u8> {
    if block.is_empty() {
        return block.to_vec();
    }
    let pin_len = (block[0] & 0x0F) as usize;
    let mut out = block.to_vec();
    out[0] = 0x20 | (pin_len as u8 & 0x0F);

    let mut nibbles_written = 0usize;
    'outer: for byte in out[1..].iter_mut() {
        let mut hi_nibble = (*byte & 0xF0) >> 4;
        let mut lo_nibble = *byte & 0x0F;
        if nibbles_written < pin_len {
            hi_nibble = DUMMY_DIGIT;
            nibbles_written += 1;
        }
        if nibbles_written < pin_len {
            lo_nibble = DUMMY_DIGIT;
            nibbles_written += 1;
        }
        *byte = (hi_nibble << 4) | lo_nibble;
        if nibbles_written >= pin_len {
            break 'outer;
        }
    }
    out
}

/// Runs spec §4.5 M3: forward everything, but substitute the PIN data of
/// the first plaintext VERIFY encountered.
pub fn run_dummy_pin<TIO, CIO>(
    bridge: &mut Bridge<TIO, CIO>,
    logger: &mut Logger,
    watchdog: &mut dyn Watchdog,
) -> Result<SessionOutcome>
where
    TIO: SideIo,
    CIO: SideIo,
{
    bridge.await_session_start()?;
    bridge.republish_atr(logger)?;

    let mut substituted = false;

    run_loop(
        bridge,
        logger,
        watchdog,
        |_bridge, mut cmd: CommandApdu| {
            if !substituted
                && cmd.cla == 0x00
                && cmd.ins == VERIFY_INS
                && cmd.p2 == PLAINTEXT_PIN_P2
                && !cmd.data.is_empty()
            {
                cmd.data = dummy_pin_block(&cmd.data);
                substituted = true;
            }
            Ok(HookOutcome::Forward(cmd))
        },
        |_bridge, _res| {},
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::fake::{FakeSideIo, FakeWatchdog};
    use crate::link::{Convention, Side, SideKind, Tc1};
    use crate::time::CardFrequency;

    fn push_byte(io: &mut FakeSideIo, byte: u8) {
        io.inbound
            .push_back((byte, Convention::parity_of_wire_bits(byte)));
    }

    #[test]
    fn dummy_pin_block_preserves_length_and_padding() {
        // Format-2, PIN length 4: "24 12 34 FF FF FF FF" (4 digits, 3 pad bytes).
        let block = [0x24, 0x12, 0x34, 0xFF, 0xFF, 0xFF, 0xFF];
        let out = dummy_pin_block(&block);
        assert_eq!(out[0] & 0x0F, 4);
        assert_eq!(out[1], 0x00);
        assert_eq!(out[2] & 0xF0, 0x00);
        // Padding bytes after the 4 PIN nibbles are untouched.
        assert_eq!(&out[3..], &block[3..]);
    }

    #[test]
    fn run_dummy_pin_substitutes_verify_data_before_forwarding() {
        let mut terminal_io = FakeSideIo::new();
        terminal_io.rst_high = true;
        let terminal = Side::new(SideKind::Terminal, Convention::Direct, Tc1::DEFAULT, terminal_io);
        let card = Side::new(SideKind::Card, Convention::Direct, Tc1::DEFAULT, FakeSideIo::new());
        let mut bridge = Bridge::new(terminal, card, CardFrequency::F4Mhz);

        push_byte(&mut bridge.card.io, 0x3B);
        push_byte(&mut bridge.card.io, 0x00);
        push_byte(&mut bridge.card.io, 0x00);

        // VERIFY(00 20 00 80), Lc=8, real PIN block.
        for &b in &[0x00u8, 0x20, 0x00, 0x80, 0x08] {
            push_byte(&mut bridge.terminal.io, b);
        }
        let real_block = [0x24u8, 0x12, 0x34, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];
        for &b in &real_block {
            push_byte(&mut bridge.terminal.io, b);
        }
        // Card sees the substituted data and replies 90 00.
        push_byte(&mut bridge.card.io, 0x20);
        push_byte(&mut bridge.card.io, 0x90);
        push_byte(&mut bridge.card.io, 0x00);

        let mut logger = Logger::new(crate::log::MIN_CAPACITY);
        let mut watchdog = FakeWatchdog::default();
        let outcome = run_dummy_pin(&mut bridge, &mut logger, &mut watchdog).unwrap();
        assert!(matches!(outcome, SessionOutcome::TerminalEnded));

        let card_out: Vec<u8> = bridge.card.io.outbound.iter().map(|(b, _)| *b).collect();
        // The real PIN digits (0x1,0x2,0x3,0x4) must not appear on the card wire.
        assert!(!card_out.contains(&0x12));
        assert_ne!(&card_out[5..13], &real_block[..]);
    }
}
