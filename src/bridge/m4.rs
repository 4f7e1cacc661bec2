//! M4 Terminal-only (spec §4.5).
//!
//! The core drives the card alone: cold reset, SELECT an application off a
//! candidate AID list, GET PROCESSING OPTIONS, READ RECORD every entry its
//! AFL names, optionally VERIFY, then GENERATE AC with a configured amount.
//! There is no terminal wire in this mode; every step is a transaction
//! through [`crate::t0::terminal_send_t0_command`] against the card side
//! only.

use crate::atr::Atr;
use crate::error::{Error, Result};
use crate::hal::{SideIo, Watchdog};
use crate::link::Side;
use crate::log::{Event, Logger};
use crate::t0::{terminal_send_t0_command, CommandApdu, ResponseApdu};
use crate::time::CardFrequency;

const SELECT_INS: u8 = 0xA4;
const GPO_INS: u8 = 0xA8;
const READ_RECORD_INS: u8 = 0xB2;
const GET_DATA_INS: u8 = 0xCA;
const VERIFY_INS: u8 = 0x20;
const GENERATE_AC_INS: u8 = 0xAE;
const PIN_TRY_COUNTER_TAG: (u8, u8) = (0x9F, 0x17);

/// What a scripted M4 run needs that spec §4.1 leaves as "startup
/// parameter" (see `SPEC_FULL.md` §A.3 `Config`).
pub struct TerminalOnlyConfig {
    pub candidate_aids: Vec<Vec<u8>>,
    /// CDOL1-formatted data sent verbatim as GENERATE AC's command data.
    pub generate_ac_data: Vec<u8>,
    /// Present iff the scripted run should VERIFY before GENERATE AC.
    pub pin_block: Option<Vec<u8>>,
}

pub struct TerminalOnlyOutcome {
    pub atr: Atr,
    pub selected_aid: Vec<u8>,
    pub pin_try_counter: ResponseApdu,
    pub generate_ac_response: ResponseApdu,
}

/// Runs spec §4.5 M4 end to end against `card`.
pub fn run_terminal_only<IO: SideIo>(
    card: &mut Side<IO>,
    freq: CardFrequency,
    cfg: &TerminalOnlyConfig,
    logger: &mut Logger,
    watchdog: &mut dyn Watchdog,
) -> Result<TerminalOnlyOutcome> {
    watchdog.stroke();
    let atr = Atr::cold_reset(card, freq)?;
    for &b in atr.body_bytes().iter() {
        logger.log_byte(Event::AtrByte, b)?;
    }

    let (selected_aid, _select_res) = select_application(card, &cfg.candidate_aids)?;
    watchdog.stroke();

    let gpo_res = get_processing_options(card)?;
    if let Some(afl) = parse_afl(&gpo_res.data) {
        read_records(card, &afl)?;
    }
    watchdog.stroke();

    let pin_try_counter = get_pin_try_counter(card)?;

    if let Some(pin) = &cfg.pin_block {
        verify_pin(card, pin)?;
    }

    watchdog.stroke();
    let generate_ac_response = generate_ac(card, &cfg.generate_ac_data)?;

    Ok(TerminalOnlyOutcome {
        atr,
        selected_aid,
        pin_try_counter,
        generate_ac_response,
    })
}

/// Tries each candidate AID in order (spec §4.5: "selects an application
/// (by AID list)"), returning the first one the card accepts.
fn select_application<IO: SideIo>(
    card: &mut Side<IO>,
    candidate_aids: &[Vec<u8>],
) -> Result<(Vec<u8>, ResponseApdu)> {
    for aid in candidate_aids {
        let cmd = CommandApdu::new(0x00, SELECT_INS, 0x04, 0x00, aid.len() as u8, aid.clone());
        let res = terminal_send_t0_command(card, cmd)?;
        if res.is_success() {
            return Ok((aid.clone(), res));
        }
    }
    Err(Error::CardActivationFailed)
}

fn get_processing_options<IO: SideIo>(card: &mut Side<IO>) -> Result<ResponseApdu> {
    // Command Template (tag 0x83) with an empty PDOL value: this scripted
    // flow supplies no terminal data items.
    let cmd = CommandApdu::new(0x80, GPO_INS, 0x00, 0x00, 0x02, vec![0x83, 0x00]);
    terminal_send_t0_command(card, cmd)
}

/// Recovers the AFL bytes from a GPO response, in either the format-1
/// (bare tag 0x80, AIP followed by AFL) or format-2 (tag 0x77 template,
/// AFL under tag 0x94) shape. `None` if neither is present.
fn parse_afl(gpo_data: &[u8]) -> Option<Vec<u8>> {
    if gpo_data.first() == Some(&0x80) {
        let len = *gpo_data.get(1)? as usize;
        let value = gpo_data.get(2..2 + len)?;
        return Some(value.get(2..).unwrap_or(&[]).to_vec());
    }
    if gpo_data.first() == Some(&0x77) {
        return ber_find(gpo_data, 0x94).map(|v| v.to_vec());
    }
    None
}

/// One level of short-form BER-TLV scanning, descending into constructed
/// tags (bit 0x20 set) — the same narrow scan `bridge::m2` uses for CDOL1.
fn ber_find<'a>(data: &'a [u8], tag: u8) -> Option<&'a [u8]> {
    let mut pos = 0;
    while pos + 1 < data.len() {
        let t = data[pos];
        let len = data[pos + 1] as usize;
        let start = pos + 2;
        if start + len > data.len() {
            break;
        }
        let value = &data[start..start + len];
        if t == tag {
            return Some(value);
        }
        if t & 0x20 != 0 {
            if let Some(v) = ber_find(value, tag) {
                return Some(v);
            }
        }
        pos = start + len;
    }
    None
}

/// Reads every record an AFL entry names: 4-byte entries of (SFI<<3, first
/// record, last record, offline-auth record count) — only the first three
/// fields matter for reading.
fn read_records<IO: SideIo>(card: &mut Side<IO>, afl: &[u8]) -> Result<Vec<ResponseApdu>> {
    let mut out = Vec::new();
    for entry in afl.chunks(4) {
        if entry.len() < 4 {
            break;
        }
        let sfi = entry[0] >> 3;
        let (first, last) = (entry[1], entry[2]);
        for record_no in first..=last {
            let p2 = (sfi << 3) | 0x04;
            let cmd = CommandApdu::new(0x00, READ_RECORD_INS, record_no, p2, 0x00, Vec::new());
            out.push(terminal_send_t0_command(card, cmd)?);
        }
    }
    Ok(out)
}

fn get_pin_try_counter<IO: SideIo>(card: &mut Side<IO>) -> Result<ResponseApdu> {
    let cmd = CommandApdu::new(
        0x80,
        GET_DATA_INS,
        PIN_TRY_COUNTER_TAG.0,
        PIN_TRY_COUNTER_TAG.1,
        0x00,
        Vec::new(),
    );
    terminal_send_t0_command(card, cmd)
}

fn verify_pin<IO: SideIo>(card: &mut Side<IO>, pin_block: &[u8]) -> Result<ResponseApdu> {
    let cmd = CommandApdu::new(0x00, VERIFY_INS, 0x00, 0x80, pin_block.len() as u8, pin_block.to_vec());
    terminal_send_t0_command(card, cmd)
}

fn generate_ac<IO: SideIo>(card: &mut Side<IO>, data: &[u8]) -> Result<ResponseApdu> {
    let cmd = CommandApdu::new(0x80, GENERATE_AC_INS, 0x80, 0x00, data.len() as u8, data.to_vec());
    terminal_send_t0_command(card, cmd)
}
