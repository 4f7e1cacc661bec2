//! Host control channel: line-oriented AT-command parsing (spec §6).
//!
//! Grounded the same way `atr.rs`/`ber.rs` use `nom` for wire-format parsing,
//! applied here to the ASCII command table instead of binary ATR bytes.

use crate::error::{Error, Result};
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    combinator::{map, map_res, value},
    sequence::preceded,
    IResult,
};

/// One parsed line from the host (spec §6 command table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
    Reset,
    RunTerminalOnly,
    RunUsbEmulatedCard,
    RunForwardAndLog,
    RunDummyPin,
    DumpLogHex,
    EraseLog,
    JumpToBootloader,
    RunVirtualTerminal,
    SendApdu(Vec<u8>),
    SupplyData(Vec<u8>),
    WaitTell,
    EndSession,
}

/// One line the bridge sends back (spec §6: "Responses").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostResponse {
    Ok,
    Bad,
    TerminalReset,
}

impl HostResponse {
    pub fn to_line(self) -> &'static str {
        match self {
            HostResponse::Ok => "AT OK",
            HostResponse::Bad => "AT BAD",
            HostResponse::TerminalReset => "AT TRESET",
        }
    }
}

fn hex_payload(input: &str) -> IResult<&str, Vec<u8>> {
    map_res(take_while1(|c: char| c.is_ascii_hexdigit()), hex::decode)(input)
}

fn with_hex_payload(prefix: &'static str) -> impl Fn(&str) -> IResult<&str, Vec<u8>> {
    move |input| preceded(tag(prefix), hex_payload)(input)
}

fn parse_inner(input: &str) -> IResult<&str, HostCommand> {
    alt((
        value(HostCommand::Reset, tag("AT+CRST")),
        value(HostCommand::RunTerminalOnly, tag("AT+CTERM")),
        value(HostCommand::RunUsbEmulatedCard, tag("AT+CTUSB")),
        value(HostCommand::RunForwardAndLog, tag("AT+CLET")),
        value(HostCommand::RunDummyPin, tag("AT+CDPIN")),
        value(HostCommand::DumpLogHex, tag("AT+CGEE")),
        value(HostCommand::EraseLog, tag("AT+CEEE")),
        value(HostCommand::JumpToBootloader, tag("AT+CGBM")),
        value(HostCommand::RunVirtualTerminal, tag("AT+CCINIT")),
        map(with_hex_payload("AT+CCAPDU="), HostCommand::SendApdu),
        map(with_hex_payload("AT+UDATA="), HostCommand::SupplyData),
        value(HostCommand::WaitTell, tag("AT+CTWAIT")),
        value(HostCommand::EndSession, tag("AT+CCEND")),
    ))(input)
}

/// Parses one CR/LF/CRLF-terminated line (the terminator itself is assumed
/// already stripped by [`crate::hal::UsbLineChannel::read_line`]).
pub fn parse_command(line: &str) -> Result<HostCommand> {
    let line = line.trim();
    match parse_inner(line) {
        Ok((rest, cmd)) if rest.is_empty() => Ok(cmd),
        _ => Err(Error::BadHostCommand(line.to_string())),
    }
}

/// Encodes bytes the bridge relays to the host (terminal command/response
/// bytes in M5) as a plain uppercase hex line, with no `AT+` prefix — only
/// host-to-bridge lines are `AT+` commands (spec §8 scenario 6).
pub fn encode_data_line(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_commands() {
        assert_eq!(parse_command("AT+CRST").unwrap(), HostCommand::Reset);
        assert_eq!(parse_command("AT+CCEND").unwrap(), HostCommand::EndSession);
        assert_eq!(parse_command("AT+CTWAIT").unwrap(), HostCommand::WaitTell);
        assert_eq!(
            parse_command("AT+CTERM").unwrap(),
            HostCommand::RunTerminalOnly
        );
    }

    #[test]
    fn parses_hex_payload_commands() {
        assert_eq!(
            parse_command("AT+UDATA=3B").unwrap(),
            HostCommand::SupplyData(vec![0x3B])
        );
        assert_eq!(
            parse_command("AT+CCAPDU=00A4040011").unwrap(),
            HostCommand::SendApdu(vec![0x00, 0xA4, 0x04, 0x00, 0x11])
        );
    }

    #[test]
    fn trims_surrounding_whitespace() {
        assert_eq!(
            parse_command("  AT+CCEND  \r").unwrap(),
            HostCommand::EndSession
        );
    }

    #[test]
    fn rejects_unrecognised_lines() {
        let err = parse_command("AT+BOGUS").unwrap_err();
        assert!(matches!(err, Error::BadHostCommand(_)));
    }

    #[test]
    fn rejects_odd_length_hex() {
        let err = parse_command("AT+UDATA=3").unwrap_err();
        assert!(matches!(err, Error::BadHostCommand(_)));
    }

    #[test]
    fn data_line_has_no_at_prefix() {
        assert_eq!(encode_data_line(&[0x00, 0xA4, 0x04]), "00A404");
    }
}
