//! ATR (Answer-to-Reset) engine: cold/warm reset sequencing, parsing, and
//! republication toward the terminal (spec §4.3, component C3).
//!
//! Only T=0 is supported end-to-end (spec Non-goals: "No T=1 block
//! protocol"); any ATR that negotiates T=1 is rejected with
//! [`BadAtrReason::Td1`] rather than silently ignored, so the bridge never
//! drives a card it can't actually talk to.

use crate::error::{BadAtrReason, Error, Result};
use crate::hal::SideIo;
use crate::link::{Convention, Side};
use crate::time::{CardFrequency, FracEtu, MaxWait};

/// One TA/TB/TC/TD interface-byte group (spec §3: "up to four groups").
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceGroup {
    pub ta: Option<u8>,
    pub tb: Option<u8>,
    pub tc: Option<u8>,
    pub td: Option<u8>,
}

/// A parsed, validated T=0 ATR (spec §3 data model).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atr {
    pub convention: Convention,
    pub t0: u8,
    pub groups: [InterfaceGroup; 4],
    /// 16-bit presence bitmap in the order TA1,TB1,TC1,TD1,TA2,…,TD4,
    /// MSB first, per spec §4.3.
    pub selection_bitmap: u16,
    pub historical_bytes: Vec<u8>,
    /// Always `None`: T=0 ATRs carry no TCK (spec §3 invariant).
    pub tck: Option<u8>,
}

fn bit_for(group: usize, letter: usize) -> u16 {
    let position = group * 4 + letter;
    1u16 << (15 - position)
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn next(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or(Error::Parameter("ATR truncated"))?;
        self.pos += 1;
        Ok(b)
    }
}

/// Parses the byte stream following TS (exclusive) plus TS itself, i.e. a
/// complete ATR starting at TS.
pub fn parse(data: &[u8]) -> Result<Atr> {
    let mut c = Cursor { data, pos: 0 };

    let ts = c.next()?;
    let convention = Convention::from_ts(ts).ok_or(Error::BadAtr(BadAtrReason::Ts))?;

    let t0 = c.next()?;
    let k = t0 & 0x0F;
    let mask1 = (t0 & 0xF0) >> 4;

    let mut groups = [InterfaceGroup::default(); 4];
    let mut bitmap: u16 = 0;

    // Group 1 is special: TA1/TC1/TD1 follow the normal T0 presence bits,
    // but TB1 is unconditionally present (ISO 7816-3:1989 legacy
    // requirement, retained here: see DESIGN.md for why a bare `3B 00 00`
    // still carries a TB1 byte).
    if mask1 & 0b0001 != 0 {
        groups[0].ta = Some(c.next()?);
        bitmap |= bit_for(0, 0);
    }
    let tb1 = c.next()?;
    if tb1 != 0x00 {
        return Err(Error::BadAtr(BadAtrReason::Tb1));
    }
    groups[0].tb = Some(tb1);
    bitmap |= bit_for(0, 1);

    if mask1 & 0b0100 != 0 {
        groups[0].tc = Some(c.next()?);
        bitmap |= bit_for(0, 2);
    }

    let mut next_mask = 0u8;
    if mask1 & 0b1000 != 0 {
        let td1 = c.next()?;
        let protocol = td1 & 0x0F;
        if protocol != 0 {
            // T=1 (or anything else): unsupported by this core.
            return Err(Error::BadAtr(BadAtrReason::Td1));
        }
        groups[0].td = Some(td1);
        bitmap |= bit_for(0, 3);
        next_mask = (td1 & 0xF0) >> 4;
    }

    for group_idx in 1..4usize {
        if next_mask == 0 {
            break;
        }
        let mask = next_mask;
        next_mask = 0;

        if mask & 0b0001 != 0 {
            let ta = c.next()?;
            groups[group_idx].ta = Some(ta);
            bitmap |= bit_for(group_idx, 0);
            if group_idx == 1 {
                return Err(Error::BadAtr(BadAtrReason::Ta2));
            }
            if group_idx == 2 && !(ta >= 0x0F && ta != 0xFF) {
                return Err(Error::BadAtr(BadAtrReason::Ta3));
            }
        }
        if mask & 0b0010 != 0 {
            let tb = c.next()?;
            groups[group_idx].tb = Some(tb);
            bitmap |= bit_for(group_idx, 1);
            if group_idx == 1 {
                return Err(Error::BadAtr(BadAtrReason::Tb2));
            }
            if group_idx == 2 && !((tb & 0xF0) <= 0x40 && (tb & 0x0F) <= 5) {
                return Err(Error::BadAtr(BadAtrReason::Tb3));
            }
        }
        if mask & 0b0100 != 0 {
            let tc = c.next()?;
            groups[group_idx].tc = Some(tc);
            bitmap |= bit_for(group_idx, 2);
            if group_idx == 1 && tc != 0x0A {
                return Err(Error::BadAtr(BadAtrReason::Tc2));
            }
            if group_idx == 2 && tc != 0x00 {
                return Err(Error::BadAtr(BadAtrReason::Tc3));
            }
        }
        if mask & 0b1000 != 0 {
            let td = c.next()?;
            let protocol = td & 0x0F;
            if protocol != 0 {
                return Err(Error::BadAtr(BadAtrReason::Td1));
            }
            groups[group_idx].td = Some(td);
            bitmap |= bit_for(group_idx, 3);
            next_mask = (td & 0xF0) >> 4;
        }
    }

    let mut historical_bytes = Vec::with_capacity(k as usize);
    for _ in 0..k {
        historical_bytes.push(c.next()?);
    }

    Ok(Atr {
        convention,
        t0,
        groups,
        selection_bitmap: bitmap,
        historical_bytes,
        tck: None,
    })
}

impl Atr {
    /// Serializes back to the exact wire bytes, TS included. For any `Atr`
    /// produced by [`parse`], `parse(&atr.to_bytes()) == Ok(atr)` (spec §8
    /// round-trip property).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![self.convention.ts_byte(), self.t0];
        for group in &self.groups {
            if let Some(ta) = group.ta {
                out.push(ta);
            }
            if let Some(tb) = group.tb {
                out.push(tb);
            }
            if let Some(tc) = group.tc {
                out.push(tc);
            }
            if let Some(td) = group.td {
                out.push(td);
            }
        }
        out.extend_from_slice(&self.historical_bytes);
        out
    }

    /// Everything the bridge forwards toward the terminal during dual-ATR
    /// republication (spec §4.3): T0, the selected interface bytes in
    /// original order, and the historical bytes. TS is excluded — the
    /// bridge sends its own TS before the card is even activated.
    pub fn body_bytes(&self) -> Vec<u8> {
        self.to_bytes()[1..].to_vec()
    }
}

/// Bounded window to wait for TS after RST goes high (spec §4.3):
/// approximately `40ms + 42000 card-clock cycles`.
pub fn activation_window(freq: CardFrequency) -> MaxWait {
    let ms40_in_clocks = (freq.hz() as u64 * 40) / 1000;
    MaxWait((ms40_in_clocks + 42_000) as u32)
}

/// Drives the cold-reset sequence on the card side (spec §4.3) and parses
/// the resulting ATR. On failure to observe any data, retries once as a
/// warm reset before surfacing [`Error::CardActivationFailed`].
pub fn cold_reset<IO: SideIo>(side: &mut Side<IO>, freq: CardFrequency) -> Result<Atr> {
    reset(side, freq, false)
}

/// Drives a warm reset: VCC stays applied, only RST is pulsed.
pub fn warm_reset<IO: SideIo>(side: &mut Side<IO>, freq: CardFrequency) -> Result<Atr> {
    reset(side, freq, true)
}

fn reset<IO: SideIo>(side: &mut Side<IO>, freq: CardFrequency, warm: bool) -> Result<Atr> {
    if !side.io.card_present() {
        return Err(Error::CardAbsent);
    }

    if !warm {
        side.io.set_vcc(false);
    }
    side.io.set_rst(false);
    if !warm {
        side.io.set_clock_running(false);
        side.io.set_vcc(true);
        side.io.wait_micros(50, &side.cancel)?;
        side.io.set_clock_running(true);
    }
    side.io
        .wait_etu(FracEtu::whole(112), MaxWait::FOREVER, &side.cancel)?;
    side.io.set_rst(true);

    let window = activation_window(freq);
    match read_ts(side, window) {
        Ok(ts) => parse_rest(side, ts),
        Err(_) if !warm => reset(side, freq, true),
        Err(_) => Err(Error::CardActivationFailed),
    }
}

fn read_ts<IO: SideIo>(side: &mut Side<IO>, window: MaxWait) -> Result<u8> {
    let (wire_bits, _parity) = side.io.recv_raw(window, &side.cancel)?;
    Ok(wire_bits)
}

/// Parses the rest of the ATR once TS has been read off the wire, driving
/// further byte reads from `side` as the selection bitmap demands.
fn parse_rest<IO: SideIo>(side: &mut Side<IO>, ts: u8) -> Result<Atr> {
    let convention = Convention::from_ts(ts).ok_or(Error::BadAtr(BadAtrReason::Ts))?;
    side.convention = convention;

    // Read the remainder of the ATR one byte at a time (no parity retry:
    // ATR bytes are unprotected per ISO 7816-3) and hand the assembled
    // buffer to `parse`, which is also exercised standalone against
    // literal fixtures in spec §8.
    let mut buf = vec![ts];
    loop {
        match parse(&buf) {
            Ok(atr) => return Ok(atr),
            Err(Error::Parameter("ATR truncated")) => {
                let b = side.recv_byte_no_parity(MaxWait::FOREVER)?;
                buf.push(b);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{SideKind, Tc1};
    use crate::hal::fake::FakeSideIo;

    #[test]
    fn scenario_1_direct_convention_atr_minimum() {
        let atr = parse(&[0x3B, 0x00, 0x00]).unwrap();
        assert_eq!(atr.convention, Convention::Direct);
        assert_eq!(atr.t0, 0x00);
        assert_eq!(atr.groups[0].tc, None);
        assert!(atr.historical_bytes.is_empty());
        assert_eq!(atr.selection_bitmap, 0b0100_0000_0000_0000);
    }

    #[test]
    fn scenario_2_ta3_tb3_rejects_t1() {
        let err = parse(&[0x3B, 0xE0, 0x00, 0xFF, 0x81, 0x31, 0x20, 0x08]).unwrap_err();
        assert!(matches!(err, Error::BadAtr(BadAtrReason::Td1)));
    }

    #[test]
    fn scenario_3_inverse_convention_recognised() {
        let atr = parse(&[0x3F, 0x00, 0x00]).unwrap();
        assert_eq!(atr.convention, Convention::Inverse);
    }

    #[test]
    fn round_trip_preserves_selection_mask() {
        let original = [0x3B, 0xE0, 0x00, 0x0A, 0x00];
        let atr = parse(&original).unwrap();
        let bytes = atr.to_bytes();
        let reparsed = parse(&bytes).unwrap();
        assert_eq!(atr, reparsed);
    }

    #[test]
    fn body_bytes_excludes_ts() {
        let atr = parse(&[0x3B, 0x00, 0x00]).unwrap();
        assert_eq!(atr.body_bytes(), vec![0x00, 0x00]);
    }

    #[test]
    fn cold_reset_drives_rst_and_parses_atr() {
        let mut io = FakeSideIo::new();
        io.inbound.push_back((0x3B, true));
        io.inbound.push_back((0x00, true));
        io.inbound.push_back((0x00, true));
        let mut side = Side::new(SideKind::Card, Convention::Direct, Tc1::DEFAULT, io);
        let atr = cold_reset(&mut side, CardFrequency::F4Mhz).unwrap();
        assert_eq!(atr.convention, Convention::Direct);
        assert!(side.io.rst_high);
        assert!(side.io.vcc_high);
    }

    #[test]
    fn cold_reset_with_no_card_present_is_card_absent() {
        let mut io = FakeSideIo::new();
        io.present = false;
        let mut side = Side::new(SideKind::Card, Convention::Direct, Tc1::DEFAULT, io);
        let err = cold_reset(&mut side, CardFrequency::F4Mhz).unwrap_err();
        assert!(matches!(err, Error::CardAbsent));
    }
}
