//! M5 USB-emulated card (spec §4.5, §8 scenario 6).
//!
//! The core drives the terminal alone; the card's role is played by a host
//! over a line-oriented USB CDC channel. ATR bytes and procedure bytes
//! arrive from the host one `AT+UDATA=<hex>` line at a time and are
//! forwarded to the terminal as they come in (scenario 6); once a full
//! command has been read off the terminal it is sent to the host as one
//! plain hex line (no `AT+` prefix — only host-to-bridge lines are
//! commands), and the host's reply line carries the whole response
//! (data bytes followed by SW1/SW2) rather than the card's own
//! procedure-byte-at-a-time dance, which the host is not obliged to
//! reproduce.

use super::{read_command_from_terminal, send_response_to_terminal, send_wait_more_time, SessionOutcome};
use crate::atr;
use crate::error::{Error, Result};
use crate::hal::{SideIo, UsbLineChannel, Watchdog};
use crate::link::Side;
use crate::log::{Event, Logger};
use crate::t0::ResponseApdu;
use crate::time::MaxWait;
use crate::usb::{encode_data_line, parse_command, HostCommand, HostResponse};

/// Blocks for the next host line, transparently handling `AT+CTWAIT` by
/// co-emitting a 0x60 keep-alive to the terminal (spec §4.5 M5) and looping
/// rather than returning it to the caller.
fn next_host_command<TIO: SideIo, C: UsbLineChannel>(
    host: &mut C,
    terminal: &mut Side<TIO>,
    watchdog: &mut dyn Watchdog,
) -> Result<HostCommand> {
    loop {
        watchdog.stroke();
        let line = host.read_line(MaxWait::FOREVER)?;
        match parse_command(&line)? {
            HostCommand::WaitTell => send_wait_more_time(terminal)?,
            cmd => return Ok(cmd),
        }
    }
}

/// Assembles the ATR from host-supplied bytes, forwarding each to the
/// terminal as soon as it arrives (spec §8 scenario 6: "Host sends
/// AT+UDATA=3B ... Bridge sends 0x3B to terminal").
fn receive_atr_from_host<TIO: SideIo, C: UsbLineChannel>(
    terminal: &mut Side<TIO>,
    host: &mut C,
    logger: &mut Logger,
    watchdog: &mut dyn Watchdog,
) -> Result<()> {
    let mut buf = Vec::new();
    loop {
        let bytes = match next_host_command(host, terminal, watchdog)? {
            HostCommand::SupplyData(bytes) => bytes,
            other => {
                return Err(Error::BadHostCommand(format!(
                    "expected AT+UDATA during ATR, got {other:?}"
                )))
            }
        };
        for b in bytes {
            if buf.is_empty() {
                terminal.send_byte_no_parity(b)?;
            } else {
                terminal.send_byte_with_retry(b)?;
            }
            logger.log_byte(Event::AtrByte, b)?;
            buf.push(b);
        }
        match atr::parse(&buf) {
            Ok(_) => return Ok(()),
            Err(Error::Parameter(_)) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Splits a host-supplied response into data bytes and the trailing
/// SW1/SW2 (spec table: `AT+UDATA=<hex>` "Supply ... response bytes").
fn decode_response(bytes: &[u8]) -> Result<ResponseApdu> {
    if bytes.len() < 2 {
        return Err(Error::BadHostCommand(
            "host response shorter than SW1/SW2".to_string(),
        ));
    }
    let (data, sw) = bytes.split_at(bytes.len() - 2);
    Ok(ResponseApdu {
        data: data.to_vec(),
        sw1: sw[0],
        sw2: sw[1],
    })
}

/// Runs spec §4.5 M5 against `terminal`, with `host` supplying everything
/// the card side would otherwise answer.
pub fn run_usb_emulated_card<TIO: SideIo, C: UsbLineChannel>(
    terminal: &mut Side<TIO>,
    host: &mut C,
    logger: &mut Logger,
    watchdog: &mut dyn Watchdog,
) -> Result<SessionOutcome> {
    loop {
        terminal.cancel.check()?;
        if terminal.io.rst_is_high() {
            break;
        }
    }

    receive_atr_from_host(terminal, host, logger, watchdog)?;

    loop {
        watchdog.stroke();

        if !terminal.io.rst_is_high() {
            logger.log_byte(Event::ResetLow, 0xFF)?;
            let _ = host.write_line(HostResponse::TerminalReset.to_line());
            return Ok(SessionOutcome::TerminalEnded);
        }

        let cmd = match read_command_from_terminal(terminal) {
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
            Err(e) => return Ok(SessionOutcome::Faulted(e)),
        };

        host.write_line(&encode_data_line(&cmd.serialize()))?;

        let res = loop {
            match next_host_command(host, terminal, watchdog)? {
                HostCommand::SupplyData(bytes) => break decode_response(&bytes)?,
                HostCommand::EndSession => return Ok(SessionOutcome::Completed),
                other => {
                    return Err(Error::BadHostCommand(format!(
                        "expected AT+UDATA or AT+CCEND awaiting card response, got {other:?}"
                    )))
                }
            }
        };

        send_response_to_terminal(terminal, cmd.ins, &res)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::fake::{FakeSideIo, FakeUsbLineChannel, FakeWatchdog};
    use crate::link::{Convention, SideKind, Tc1};

    fn push_byte(io: &mut FakeSideIo, byte: u8) {
        io.inbound
            .push_back((byte, Convention::parity_of_wire_bits(byte)));
    }

    #[test]
    fn scenario_6_relays_atr_command_and_response() {
        let mut terminal_io = FakeSideIo::new();
        terminal_io.rst_high = true;
        // 00 A4 04 00 02 (case-2 GET DATA-shaped header; no data stage).
        for &b in &[0x80u8, 0xCA, 0x9F, 0x17, 0x02] {
            push_byte(&mut terminal_io, b);
        }
        let mut terminal = Side::new(SideKind::Terminal, Convention::Direct, Tc1::DEFAULT, terminal_io);

        let mut host = FakeUsbLineChannel::new();
        host.inbound.push_back("AT+UDATA=3B".to_string());
        host.inbound.push_back("AT+UDATA=00".to_string());
        host.inbound.push_back("AT+UDATA=00".to_string());
        host.inbound.push_back("AT+UDATA=119000".to_string());

        let mut logger = Logger::new(crate::log::MIN_CAPACITY);
        let mut watchdog = FakeWatchdog::default();

        let outcome = run_usb_emulated_card(&mut terminal, &mut host, &mut logger, &mut watchdog)
            .unwrap();
        assert!(matches!(outcome, SessionOutcome::TerminalEnded));

        // ATR bytes were relayed to the terminal as they arrived.
        let terminal_out: Vec<u8> = terminal.io.outbound.iter().map(|(b, _)| *b).collect();
        assert_eq!(&terminal_out[0..3], &[0x3B, 0x00, 0x00]);
        // The response (data 0x11, SW 90 00) was relayed after the command.
        assert!(terminal_out.ends_with(&[0xCA, 0x11, 0x90, 0x00]));

        // The command was forwarded to the host as a plain hex line.
        assert_eq!(host.outbound[0], "80CA9F1702");
    }

    #[test]
    fn host_ending_session_returns_completed() {
        let mut terminal_io = FakeSideIo::new();
        terminal_io.rst_high = true;
        for &b in &[0x80u8, 0xCA, 0x9F, 0x17, 0x02] {
            push_byte(&mut terminal_io, b);
        }
        let mut terminal = Side::new(SideKind::Terminal, Convention::Direct, Tc1::DEFAULT, terminal_io);

        let mut host = FakeUsbLineChannel::new();
        host.inbound.push_back("AT+UDATA=3B".to_string());
        host.inbound.push_back("AT+UDATA=00".to_string());
        host.inbound.push_back("AT+UDATA=00".to_string());
        host.inbound.push_back("AT+CCEND".to_string());

        let mut logger = Logger::new(crate::log::MIN_CAPACITY);
        let mut watchdog = FakeWatchdog::default();

        let outcome = run_usb_emulated_card(&mut terminal, &mut host, &mut logger, &mut watchdog)
            .unwrap();
        assert!(matches!(outcome, SessionOutcome::Completed));
    }
}
