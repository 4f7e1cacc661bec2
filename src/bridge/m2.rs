//! M2 Filter-GenerateAC (spec §4.5).
//!
//! Runs the same per-APDU loop as M1, watching READ RECORD responses for a
//! CDOL1 (tag 0x8C) so that when the first GENERATE AC arrives, the amount
//! bytes it carries can be shown to the user for approval before forwarding.
//!
//! The CDOL1/tag scan here is deliberately narrow — it only ever looks for
//! one specific tag inside another — not a general BER-TLV/EMV template
//! parser (those are out of scope; spec §1).

use super::{run_loop, send_wait_more_time, Bridge, HookOutcome, SessionOutcome};
use crate::error::Result;
use crate::hal::{Button, ButtonPad, Display, SideIo, Watchdog};
use crate::log::Logger;
use crate::t0::{CommandApdu, ResponseApdu};
use crate::time::FracEtu;

const CDOL1_TAG: u8 = 0x8C;
const AMOUNT_AUTHORISED_TAG: [u8; 2] = [0x9F, 0x02];
const GENERATE_AC_INS: u8 = 0xAE;

/// Buttons spec §4.5 leaves unnamed; this is the arbitrary but fixed choice
/// (see DESIGN.md).
pub const APPROVE_BUTTON: Button = Button::A;
pub const REJECT_BUTTON: Button = Button::B;

/// How often a 0x60 keep-alive is sent to the terminal while the user
/// decides (spec §4.5: "every 100 ms", approximated here in ETU units —
/// the exact ms-to-ETU conversion is a terminal-frequency concern already
/// owned by C1, not re-derived here).
const KEEPALIVE_INTERVAL: FracEtu = FracEtu::whole(400);

/// Walks one level of short-form BER-TLV (1-byte tag, 1-byte length),
/// descending into constructed tags (bit 0x20 set) to find `tag`.
fn find_tag<'a>(data: &'a [u8], tag: u8) -> Option<&'a [u8]> {
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
            if let Some(v) = find_tag(value, tag) {
                return Some(v);
            }
        }
        pos = start + len;
    }
    None
}

/// Scans a CDOL1's data-object-list value for `target_tag`, returning the
/// byte offset (into the data field a GENERATE AC built from this DOL would
/// carry) and length of that entry. DOL tags may be one or two bytes (BER
/// rule: a single-byte tag with the low five bits all set signals a second
/// tag byte follows); lengths here are always short-form.
fn cdol_offset_of_tag(cdol: &[u8], target_tag: &[u8]) -> Option<(usize, usize)> {
    let mut pos = 0usize;
    let mut offset = 0usize;
    while pos < cdol.len() {
        let tag_len = if cdol[pos] & 0x1F == 0x1F { 2 } else { 1 };
        if pos + tag_len >= cdol.len() {
            break;
        }
        let tag = &cdol[pos..pos + tag_len];
        pos += tag_len;
        let len = cdol[pos] as usize;
        pos += 1;
        if tag == target_tag {
            return Some((offset, len));
        }
        offset += len;
    }
    None
}

/// Renders amount bytes (BCD, per the card's CDOL1 field) for the approval
/// display: the last two decimal digits are treated as minor units.
fn format_amount_line(bytes: &[u8]) -> String {
    let digits: String = bytes.iter().map(|b| format!("{:02X}", b)).collect();
    let split = digits.len().saturating_sub(2);
    let (major, minor) = digits.split_at(split);
    let major = major.trim_start_matches('0');
    let major = if major.is_empty() { "0" } else { major };
    format!("Amt: {}.{}", major, minor)
}

/// Runs spec §4.5 M2. `display`/`buttons` are the approval UI; after the
/// first GENERATE AC, behaviour reverts to plain forward-and-log.
pub fn run_filter_generate_ac<TIO, CIO>(
    bridge: &mut Bridge<TIO, CIO>,
    logger: &mut Logger,
    watchdog: &mut dyn Watchdog,
    display: &mut dyn Display,
    buttons: &dyn ButtonPad,
) -> Result<SessionOutcome>
where
    TIO: SideIo,
    CIO: SideIo,
{
    bridge.await_session_start()?;
    bridge.republish_atr(logger)?;

    let mut amount_offset: Option<(usize, usize)> = None;
    let mut generate_ac_seen = false;

    run_loop(
        bridge,
        logger,
        watchdog,
        |bridge, cmd: CommandApdu| {
            if generate_ac_seen || cmd.cla & 0xF0 != 0x80 || cmd.ins != GENERATE_AC_INS {
                return Ok(HookOutcome::Forward(cmd));
            }
            generate_ac_seen = true;

            let (offset, len) = match amount_offset {
                Some(v) => v,
                None => return Ok(HookOutcome::Forward(cmd)),
            };
            if offset + len > cmd.data.len() {
                return Ok(HookOutcome::Forward(cmd));
            }

            display.show(&format_amount_line(&cmd.data[offset..offset + len]));
            let approved = wait_for_approval(bridge, watchdog, buttons)?;
            if approved {
                Ok(HookOutcome::Forward(cmd))
            } else {
                Ok(HookOutcome::Abort)
            }
        },
        |_bridge, res: &ResponseApdu| {
            if amount_offset.is_none() {
                if let Some(cdol1) = find_tag(&res.data, CDOL1_TAG) {
                    amount_offset = cdol_offset_of_tag(cdol1, &AMOUNT_AUTHORISED_TAG);
                }
            }
        },
    )
}

/// Blocks on the approve/reject buttons, co-emitting 0x60 to the terminal
/// every [`KEEPALIVE_INTERVAL`] so the terminal's work-waiting-time contract
/// isn't violated (spec §5 "Blocking caveat").
fn wait_for_approval<TIO, CIO>(
    bridge: &mut Bridge<TIO, CIO>,
    watchdog: &mut dyn Watchdog,
    buttons: &dyn ButtonPad,
) -> Result<bool>
where
    TIO: SideIo,
    CIO: SideIo,
{
    loop {
        let pressed = buttons.button_state();
        if pressed.contains(&APPROVE_BUTTON) {
            return Ok(true);
        }
        if pressed.contains(&REJECT_BUTTON) {
            return Ok(false);
        }
        watchdog.stroke();
        send_wait_more_time(&mut bridge.terminal)?;
        bridge.terminal.wait_etu(KEEPALIVE_INTERVAL)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cdol_offset_matches_scenario_5() {
        // CDOL1 entry list: tag 0x9A (1-byte tag) length 3, then tag 0x9F02
        // (2-byte tag) length 6 -- Amount-Authorised begins at offset 3.
        let cdol1 = [0x9A, 0x03, 0x9F, 0x02, 0x06];
        assert_eq!(
            cdol_offset_of_tag(&cdol1, &AMOUNT_AUTHORISED_TAG),
            Some((3, 6))
        );
    }

    #[test]
    fn find_tag_descends_into_constructed_template() {
        // 70 <len> [8C <len> <cdol1>]
        let cdol1 = [0x9F, 0x02, 0x06];
        let mut record = vec![0x70, (cdol1.len() + 2) as u8, 0x8C, cdol1.len() as u8];
        record.extend_from_slice(&cdol1);
        assert_eq!(find_tag(&record, CDOL1_TAG), Some(cdol1.as_slice()));
    }

    #[test]
    fn find_tag_returns_none_when_absent() {
        let record = [0x70, 0x02, 0x5A, 0x00];
        assert_eq!(find_tag(&record, CDOL1_TAG), None);
    }
}
