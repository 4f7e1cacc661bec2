//! The dual-endpoint bridge / policy engine (spec §4.5, component C5).
//!
//! This is the state machine that drives both link layers at once: the
//! per-APDU loop common to M1/M2/M3 is factored into [`run_loop`], with each
//! mode supplying hooks for what it does differently (spec §4.5: "Five
//! operating modes form a small state machine"). M4 and M5 only ever drive
//! one side, so they live in their own modules as standalone functions.

pub mod m2;
pub mod m3;
pub mod m4;
pub mod m5;

use crate::atr::Atr;
use crate::error::{Error, Result};
use crate::hal::{SideIo, Watchdog};
use crate::link::Side;
use crate::log::{Event, Logger};
use crate::t0::{transceive, CommandApdu, ResponseApdu};
use crate::time::{CardFrequency, FracEtu};
use tracing::{debug, warn};

/// The three outcomes spec §7's propagation policy names, given a type.
#[derive(Debug)]
pub enum SessionOutcome {
    /// The session ran its course with no link-layer error.
    Completed,
    /// Ended via `TimedOut`/`NoClock`/`ResetLow` — expected, not a fault.
    TerminalEnded,
    /// Any other error: log, flush, blink the error LED.
    Faulted(Error),
}

/// One endpoint pair: terminal-facing and card-facing links, bridged
/// together for the duration of a session (spec §3 "Side").
pub struct Bridge<TIO: SideIo, CIO: SideIo> {
    pub terminal: Side<TIO>,
    pub card: Side<CIO>,
    pub card_frequency: CardFrequency,
}

impl<TIO: SideIo, CIO: SideIo> Bridge<TIO, CIO> {
    pub fn new(terminal: Side<TIO>, card: Side<CIO>, card_frequency: CardFrequency) -> Self {
        Self {
            terminal,
            card,
            card_frequency,
        }
    }

    /// Spec §4.5 M1: "Wait for card insertion, then terminal clock + RST
    /// rising edge." Real MCU backends block on the card-detect and RST
    /// interrupts directly; this polls the HAL's instantaneous checks,
    /// which suffices for the in-memory fakes used in tests (callers set
    /// `card_present`/`rst_high` before starting a session).
    pub fn await_session_start(&mut self) -> Result<()> {
        loop {
            self.card.cancel.check()?;
            if self.card.io.card_present() {
                break;
            }
        }
        loop {
            self.terminal.cancel.check()?;
            if self.terminal.io.rst_is_high() {
                break;
            }
        }
        Ok(())
    }

    /// Dual-ATR republication (spec §4.3): send our own TS immediately,
    /// activate the card, then forward T0, the selected interface bytes (in
    /// original order) and the historical bytes, each followed by 2 ETU of
    /// guard time on the terminal side.
    pub fn republish_atr(&mut self, logger: &mut Logger) -> Result<Atr> {
        let ts = self.terminal.convention.ts_byte();
        self.terminal.send_byte_no_parity(ts)?;
        logger.log_byte(Event::AtrByte, ts)?;

        let atr = Atr::cold_reset(&mut self.card, self.card_frequency)?;
        for &b in atr.body_bytes().iter() {
            logger.log_byte(Event::AtrByte, b)?;
            self.terminal.send_byte_no_parity(b)?;
            self.terminal.wait_etu(FracEtu::whole(2))?;
        }
        Ok(atr)
    }

    /// Spec §4.5 M1 "Forward-and-log": after ATR republication, relay every
    /// command/response pair until the terminal side ends the session.
    pub fn run_forward_and_log(
        &mut self,
        logger: &mut Logger,
        watchdog: &mut dyn Watchdog,
    ) -> Result<SessionOutcome> {
        self.await_session_start()?;
        self.republish_atr(logger)?;
        run_loop(
            self,
            logger,
            watchdog,
            |_bridge, cmd| Ok(HookOutcome::Forward(cmd)),
            |_bridge, _res| {},
        )
    }
}

/// What a per-command hook decides to do with a command it inspected before
/// it reaches the card (spec §4.5 M2/M3).
pub enum HookOutcome {
    Forward(CommandApdu),
    Abort,
}

/// The per-APDU loop shared by M1/M2/M3 (spec §4.5: "Runs M1 until..."):
/// receive a command acting as the card toward the terminal, let
/// `before_forward` inspect/replace/abort it, forward it to the real card,
/// let `after_response` inspect the card's reply (M2 uses this to spot a
/// CDOL1 in a READ RECORD response), then relay the response back. Ends the
/// session on `TimedOut`/`NoClock`/`ResetLow` or a terminal RST falling edge
/// (spec §4.5 M1, §7 propagation policy).
pub fn run_loop<TIO, CIO>(
    bridge: &mut Bridge<TIO, CIO>,
    logger: &mut Logger,
    watchdog: &mut dyn Watchdog,
    mut before_forward: impl FnMut(&mut Bridge<TIO, CIO>, CommandApdu) -> Result<HookOutcome>,
    mut after_response: impl FnMut(&mut Bridge<TIO, CIO>, &ResponseApdu),
) -> Result<SessionOutcome>
where
    TIO: SideIo,
    CIO: SideIo,
{
    loop {
        watchdog.stroke();

        if !bridge.terminal.io.rst_is_high() {
            logger.log_byte(Event::ResetLow, 0xFF)?;
            return Ok(SessionOutcome::TerminalEnded);
        }

        let cmd = match read_command_from_terminal(&mut bridge.terminal) {
            Ok(cmd) => cmd,
            Err(Error::TimedOut) => {
                logger.log_byte(Event::TimedOut, 0xFF)?;
                return Ok(SessionOutcome::TerminalEnded);
            }
            Err(Error::NoClock) => {
                logger.log_byte(Event::NoClock, 0xFF)?;
                return Ok(SessionOutcome::TerminalEnded);
            }
            Err(Error::ResetLow) => {
                logger.log_byte(Event::ResetLow, 0xFF)?;
                return Ok(SessionOutcome::TerminalEnded);
            }
            Err(e) => {
                warn!(error = %e, "terminal command read failed");
                return Ok(SessionOutcome::Faulted(e));
            }
        };

        let cmd = match before_forward(bridge, cmd)? {
            HookOutcome::Forward(cmd) => cmd,
            HookOutcome::Abort => return Ok(SessionOutcome::Completed),
        };
        let ins = cmd.ins;

        debug!(cla = cmd.cla, ins = cmd.ins, "forwarding command to card");
        let res = match transceive(&mut bridge.card, &cmd) {
            Ok(res) => res,
            Err(e) => {
                warn!(error = %e, "card transaction failed");
                return Ok(SessionOutcome::Faulted(e));
            }
        };
        after_response(bridge, &res);

        send_response_to_terminal(&mut bridge.terminal, ins, &res)?;
    }
}

/// Reads one command off the terminal side, acting as the card would (spec
/// §4.4's "send command to card"/"receive response" mirrored for the callee
/// role): the 5-byte header, then for case 3/4 commands, `p3` data bytes —
/// requested all at once via the INS procedure byte, since the bridge has
/// no reason to drip-feed a card it is itself playing.
pub(crate) fn read_command_from_terminal<IO: SideIo>(
    terminal: &mut Side<IO>,
) -> Result<CommandApdu> {
    let cla = terminal.recv_byte_with_retry(crate::time::MaxWait::FOREVER)?;
    let ins = terminal.recv_byte_with_retry(crate::time::MaxWait::FOREVER)?;
    let p1 = terminal.recv_byte_with_retry(crate::time::MaxWait::FOREVER)?;
    let p2 = terminal.recv_byte_with_retry(crate::time::MaxWait::FOREVER)?;
    let p3 = terminal.recv_byte_with_retry(crate::time::MaxWait::FOREVER)?;

    let case = crate::t0::case_of(cla, ins);
    let data = if matches!(case, crate::t0::CommandCase::Case3 | crate::t0::CommandCase::Case4) {
        terminal.send_byte_with_retry(ins)?;
        let mut buf = Vec::with_capacity(p3 as usize);
        for _ in 0..p3 {
            buf.push(terminal.recv_byte_with_retry(crate::time::MaxWait::FOREVER)?);
        }
        buf
    } else {
        Vec::new()
    };

    Ok(CommandApdu::new(cla, ins, p1, p2, p3, data))
}

/// Replies to the terminal with `res`, acting as the card (mirror of
/// [`read_command_from_terminal`]): if there is data, announce it with the
/// INS procedure byte and send it as one block, then send SW1/SW2.
pub(crate) fn send_response_to_terminal<IO: SideIo>(
    terminal: &mut Side<IO>,
    ins: u8,
    res: &ResponseApdu,
) -> Result<()> {
    if !res.data.is_empty() {
        terminal.send_byte_with_retry(ins)?;
        terminal.send_data_chunk(&res.data)?;
    }
    terminal.send_byte_with_retry(res.sw1)?;
    terminal.send_byte_with_retry(res.sw2)?;
    Ok(())
}

/// Sends one 0x60 ("wait more time") procedure byte to the terminal, used
/// by M2 during user-approval waits and by M5 on `AT+CTWAIT` (spec §4.5,
/// §5 "Blocking caveat": must recur at most every 100 ms).
pub(crate) fn send_wait_more_time<IO: SideIo>(terminal: &mut Side<IO>) -> Result<()> {
    terminal.send_byte_with_retry(0x60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::fake::{FakeSideIo, FakeWatchdog};
    use crate::link::{Convention, SideKind, Tc1};
    use crate::t0::ResponseApdu;

    fn push_byte(io: &mut FakeSideIo, byte: u8) {
        io.inbound
            .push_back((byte, Convention::parity_of_wire_bits(byte)));
    }

    fn make_bridge() -> Bridge<FakeSideIo, FakeSideIo> {
        let mut terminal_io = FakeSideIo::new();
        terminal_io.rst_high = true;
        let terminal = Side::new(SideKind::Terminal, Convention::Direct, Tc1::DEFAULT, terminal_io);
        let card = Side::new(
            SideKind::Card,
            Convention::Direct,
            Tc1::DEFAULT,
            FakeSideIo::new(),
        );
        Bridge::new(terminal, card, CardFrequency::F4Mhz)
    }

    #[test]
    fn read_command_from_terminal_reads_case4_header_and_data() {
        let mut io = FakeSideIo::new();
        for &b in &[0x00u8, 0xA4, 0x04, 0x00, 0x02] {
            push_byte(&mut io, b);
        }
        push_byte(&mut io, 0x3F);
        push_byte(&mut io, 0x00);
        let mut side = Side::new(SideKind::Terminal, Convention::Direct, Tc1::DEFAULT, io);

        let cmd = read_command_from_terminal(&mut side).unwrap();
        assert_eq!(cmd.cla, 0x00);
        assert_eq!(cmd.ins, 0xA4);
        assert_eq!(cmd.data, vec![0x3F, 0x00]);
        // The bridge announced INS as the procedure byte before reading data.
        assert_eq!(side.io.outbound[0].0, 0xA4);
    }

    #[test]
    fn send_response_to_terminal_sends_data_then_status() {
        let mut side = Side::new(
            SideKind::Terminal,
            Convention::Direct,
            Tc1::DEFAULT,
            FakeSideIo::new(),
        );
        let res = ResponseApdu {
            data: vec![0x6F, 0x10],
            sw1: 0x90,
            sw2: 0x00,
        };
        send_response_to_terminal(&mut side, 0xA4, &res).unwrap();
        let bytes: Vec<u8> = side.io.outbound.iter().map(|(b, _)| *b).collect();
        assert_eq!(bytes, vec![0xA4, 0x6F, 0x10, 0x90, 0x00]);
    }

    #[test]
    fn run_forward_and_log_relays_one_apdu_then_ends_on_timeout() {
        let mut bridge = make_bridge();
        // Card ATR: minimal direct-convention ATR.
        push_byte(&mut bridge.card.io, 0x3B);
        push_byte(&mut bridge.card.io, 0x00);
        push_byte(&mut bridge.card.io, 0x00);
        bridge.card.io.rst_high = false; // irrelevant on the card side

        // One GET DATA command from the terminal (case 2, Le=2) — keeps
        // this test free of case-4 data-chunking detail.
        for &b in &[0x80u8, 0xCA, 0x9F, 0x17, 0x02] {
            push_byte(&mut bridge.terminal.io, b);
        }
        // Card's reply: GET DATA returns 2 data bytes then 90 00.
        push_byte(&mut bridge.card.io, 0xCA);
        push_byte(&mut bridge.card.io, 0x00);
        push_byte(&mut bridge.card.io, 0x03);
        push_byte(&mut bridge.card.io, 0x90);
        push_byte(&mut bridge.card.io, 0x00);

        let mut logger = Logger::new(crate::log::MIN_CAPACITY);
        let mut watchdog = FakeWatchdog::default();
        let outcome = bridge.run_forward_and_log(&mut logger, &mut watchdog).unwrap();
        assert!(matches!(outcome, SessionOutcome::TerminalEnded));
        assert!(watchdog.strokes > 0);

        let terminal_out: Vec<u8> = bridge.terminal.io.outbound.iter().map(|(b, _)| *b).collect();
        // TS, then the GET DATA response's data and status.
        assert_eq!(terminal_out[0], 0x3B);
        assert!(terminal_out.contains(&0x90));
    }

    #[test]
    fn run_loop_abort_hook_ends_session_as_completed() {
        let mut bridge = make_bridge();
        for &b in &[0x80u8, 0xAE, 0x00, 0x00, 0x02, 0x12, 0x34] {
            push_byte(&mut bridge.terminal.io, b);
        }
        let mut logger = Logger::new(crate::log::MIN_CAPACITY);
        let mut watchdog = FakeWatchdog::default();
        let outcome = run_loop(
            &mut bridge,
            &mut logger,
            &mut watchdog,
            |_b, _cmd| Ok(HookOutcome::Abort),
            |_b, _res| {},
        )
        .unwrap();
        assert!(matches!(outcome, SessionOutcome::Completed));
        assert!(bridge.card.io.outbound.is_empty());
    }
}
