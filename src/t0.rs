//! T=0 command/response transaction layer (spec §4.4, component C4).

use crate::error::{Error, Result};
use crate::hal::SideIo;
use crate::link::Side;
use crate::time::{FracEtu, MaxWait};

/// The four ISO 7816-4 command shapes, derived from (CLA, INS) via the
/// fixed table in spec §4.4. Unrecognised pairs are `Unrecognised`: the
/// bridge forwards them transparently without case-based shortcuts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCase {
    Case1,
    Case2,
    Case3,
    Case4,
    Unrecognised,
}

/// Looks up a command's case via the spec §4.4 table.
pub fn case_of(cla: u8, ins: u8) -> CommandCase {
    use CommandCase::*;
    match (cla, ins) {
        (0x00, 0xC0) => Case2, // GET RESPONSE
        (0x00, 0xB2) => Case2, // READ RECORD
        (0x00, 0xA4) => Case4, // SELECT
        (0x00, 0x82) => Case3, // EXTERNAL AUTHENTICATE
        (0x00, 0x84) => Case2, // GET CHALLENGE
        (0x00, 0x88) => Case4, // INTERNAL AUTHENTICATE
        (0x00, 0x20) => Case3, // VERIFY
        (0x8C, 0x1E) | (0x84, 0x1E) => Case3, // APPLICATION BLOCK
        (0x8C, 0x18) | (0x84, 0x18) => Case3, // APPLICATION UNBLOCK
        (0x8C, 0x16) | (0x84, 0x16) => Case3, // CARD BLOCK
        (0x8C, 0x24) | (0x84, 0x24) => Case3, // PIN CHANGE/UNBLOCK
        (0x80, 0xAE) => Case4, // GENERATE AC
        (0x80, 0xCA) => Case2, // GET DATA
        (0x80, 0xA8) => Case4, // GET PROCESSING OPTIONS
        _ => Unrecognised,
    }
}

/// A command APDU (spec §3: header + optional data). `p3` doubles as `Lc`
/// (case 3/4, implied by `data.len()`) and `Le` (case 2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandApdu {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub p3: u8,
    pub data: Vec<u8>,
}

impl CommandApdu {
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8, p3: u8, data: Vec<u8>) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            p3,
            data,
        }
    }

    pub fn case(&self) -> CommandCase {
        case_of(self.cla, self.ins)
    }

    pub fn header(&self) -> [u8; 5] {
        [self.cla, self.ins, self.p1, self.p2, self.p3]
    }

    /// `serialize(cmd) == header(5) ++ data(n)` iff `cmd` has data of
    /// length `n` (spec §8 round-trip property).
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = self.header().to_vec();
        out.extend_from_slice(&self.data);
        out
    }
}

/// A response APDU (spec §3: optional data + SW1/SW2).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResponseApdu {
    pub data: Vec<u8>,
    pub sw1: u8,
    pub sw2: u8,
}

impl ResponseApdu {
    pub fn sw(&self) -> u16 {
        ((self.sw1 as u16) << 8) | self.sw2 as u16
    }

    pub fn is_success(&self) -> bool {
        self.sw1 == 0x90 && self.sw2 == 0x00
    }
}

/// Sends `cmd` to the card and reads its response, driving the full
/// procedure-byte handshake of spec §4.4 ("Send command to card" /
/// "Receive response from card"). For case 2 responses, `cmd.p3` is taken
/// as `Le`, the number of data bytes expected before SW1/SW2.
pub fn transceive<IO: SideIo>(side: &mut Side<IO>, cmd: &CommandApdu) -> Result<ResponseApdu> {
    for &b in &cmd.header() {
        side.send_byte_with_retry(b)?;
    }

    match cmd.case() {
        CommandCase::Case3 | CommandCase::Case4 => send_data_with_procedure_bytes(side, cmd),
        _ => recv_response(side, cmd.ins, cmd.p3),
    }
}

/// Implements the procedure-byte loop for case 3/4 commands (spec §4.4):
/// wait >=6 card-ETU, then read a procedure byte and act on it.
fn send_data_with_procedure_bytes<IO: SideIo>(
    side: &mut Side<IO>,
    cmd: &CommandApdu,
) -> Result<ResponseApdu> {
    let ins = cmd.ins;
    let not_ins = !ins;
    let mut remaining = cmd.data.as_slice();

    loop {
        side.io
            .wait_etu(FracEtu::whole(6), MaxWait::FOREVER, &side.cancel)?;
        let proc = side.recv_byte_with_retry(MaxWait::FOREVER)?;

        if proc == 0x60 {
            continue;
        }
        if proc == ins {
            side.send_data_chunk(remaining)?;
            return recv_final_status(side);
        }
        if proc == not_ins {
            if remaining.is_empty() {
                return Err(Error::UnexpectedProcedureByte(proc));
            }
            side.send_byte_with_retry(remaining[0])?;
            remaining = &remaining[1..];
            continue;
        }
        // Anything else: this is SW1 — spec §4.4: "read one more byte
        // (SW2) and surface UnexpectedProcedureByte".
        let _sw2 = side.recv_byte_with_retry(MaxWait::FOREVER)?;
        return Err(Error::UnexpectedProcedureByte(proc));
    }
}

fn recv_final_status<IO: SideIo>(side: &mut Side<IO>) -> Result<ResponseApdu> {
    let sw1 = side.recv_byte_with_retry(MaxWait::FOREVER)?;
    let sw2 = side.recv_byte_with_retry(MaxWait::FOREVER)?;
    Ok(ResponseApdu {
        data: Vec::new(),
        sw1,
        sw2,
    })
}

/// Implements "Receive response from card" (spec §4.4) for case 1/2/
/// unrecognised commands: read the first byte; 0x60 restarts; INS means
/// `le` data bytes follow then SW1/SW2; ~INS means exactly one data byte
/// follows then SW1/SW2; anything else is SW1 itself.
fn recv_response<IO: SideIo>(side: &mut Side<IO>, ins: u8, le: u8) -> Result<ResponseApdu> {
    let not_ins = !ins;
    loop {
        let first = side.recv_byte_with_retry(MaxWait::FOREVER)?;
        if first == 0x60 {
            continue;
        }
        if first == ins {
            let mut data = Vec::with_capacity(le as usize);
            for _ in 0..le {
                data.push(side.recv_byte_with_retry(MaxWait::FOREVER)?);
            }
            let mut resp = recv_final_status(side)?;
            resp.data = data;
            return Ok(resp);
        }
        if first == not_ins {
            let data_byte = side.recv_byte_with_retry(MaxWait::FOREVER)?;
            let mut resp = recv_final_status(side)?;
            resp.data = vec![data_byte];
            return Ok(resp);
        }
        let sw2 = side.recv_byte_with_retry(MaxWait::FOREVER)?;
        return Ok(ResponseApdu {
            data: Vec::new(),
            sw1: first,
            sw2,
        });
    }
}

/// Terminal-emulation chaining (spec §4.4 "Terminal-emulation chaining"):
/// drives `cmd` against the card and transparently chains GET RESPONSE /
/// re-sends on 61xx/6Cxx/62xx/63xx, merging all intermediate responses
/// into one logical APDU. Implemented as an iterative loop with an
/// explicit accumulator, per spec §9 (tail recursion reshaped as iteration
/// — behaviourally identical).
pub fn terminal_send_t0_command<IO: SideIo>(
    side: &mut Side<IO>,
    cmd: CommandApdu,
) -> Result<ResponseApdu> {
    let mut data = Vec::new();
    let mut current = cmd;
    let mut expected_data = !matches!(current.case(), CommandCase::Case1 | CommandCase::Case3);

    loop {
        let res = transceive(side, &current)?;
        match res.sw1 {
            0x61 => {
                data.extend_from_slice(&res.data);
                current = CommandApdu::new(0x00, 0xC0, 0x00, 0x00, res.sw2, Vec::new());
                expected_data = true;
            }
            0x6C => {
                data.extend_from_slice(&res.data);
                current.p3 = res.sw2;
            }
            0x62 | 0x63 if expected_data && data.is_empty() && res.data.is_empty() => {
                // Warning status with data still outstanding: chain one
                // GET RESPONSE, then stop regardless of its own SW1.
                let gr = CommandApdu::new(0x00, 0xC0, 0x00, 0x00, 0x00, Vec::new());
                let gr_res = transceive(side, &gr)?;
                return Ok(ResponseApdu {
                    data: gr_res.data,
                    sw1: res.sw1,
                    sw2: res.sw2,
                });
            }
            _ => {
                data.extend_from_slice(&res.data);
                return Ok(ResponseApdu {
                    data,
                    sw1: res.sw1,
                    sw2: res.sw2,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::fake::FakeSideIo;
    use crate::link::{Convention, SideKind, Tc1};

    fn side_with_inbound(bytes: Vec<u8>) -> Side<FakeSideIo> {
        let mut io = FakeSideIo::new();
        io.inbound = bytes
            .into_iter()
            .map(|b| (b, Convention::parity_of_wire_bits(b)))
            .collect();
        Side::new(SideKind::Card, Convention::Direct, Tc1::DEFAULT, io)
    }

    #[test]
    fn case_table_matches_spec() {
        assert_eq!(case_of(0x00, 0xA4), CommandCase::Case4); // SELECT
        assert_eq!(case_of(0x00, 0xB2), CommandCase::Case2); // READ RECORD
        assert_eq!(case_of(0x80, 0xAE), CommandCase::Case4); // GENERATE AC
        assert_eq!(case_of(0x00, 0x20), CommandCase::Case3); // VERIFY
        assert_eq!(case_of(0xFF, 0xFF), CommandCase::Unrecognised);
    }

    #[test]
    fn serialize_header_and_data() {
        let cmd = CommandApdu::new(0x00, 0xA4, 0x04, 0x00, 0x02, vec![0x3F, 0x00]);
        assert_eq!(
            cmd.serialize(),
            vec![0x00, 0xA4, 0x04, 0x00, 0x02, 0x3F, 0x00]
        );
    }

    #[test]
    fn scenario_4_select_with_procedure_byte_chunking_and_chaining() {
        // SELECT(A4 04 00 00 0E), 14 data bytes, card ACKs with INS once,
        // then replies 61 20, then GET RESPONSE(Le=0x20) returns 32 bytes +
        // 90 00.
        let select_data = vec![
            0x31, 0x50, 0x41, 0x59, 0x2E, 0x53, 0x59, 0x53, 0x2E, 0x44, 0x44, 0x46, 0x30, 0x31,
        ];
        let mut inbound = vec![0xA4]; // procedure byte == INS: send all data
        inbound.push(0x61);
        inbound.push(0x20);
        // GET RESPONSE(Le=0x20): procedure byte == INS(0xC0), 32 data bytes, 90 00.
        inbound.push(0xC0);
        inbound.extend(vec![0x5A; 32]);
        inbound.push(0x90);
        inbound.push(0x00);

        let mut side = side_with_inbound(inbound);
        let cmd = CommandApdu::new(0x00, 0xA4, 0x04, 0x00, 0x0E, select_data);
        let res = terminal_send_t0_command(&mut side, cmd).unwrap();
        assert_eq!(res.data.len(), 32);
        assert_eq!(res.sw1, 0x90);
        assert_eq!(res.sw2, 0x00);
    }

    #[test]
    fn not_ins_chunking_sends_one_byte_at_a_time() {
        // VERIFY (case 3): ins=0x20, not_ins=0xDF. Card asks for the first
        // two bytes one at a time, then signals INS to request everything
        // left (just the final byte) before returning status.
        let mut side = side_with_inbound(vec![0xDF, 0xDF, 0x20, 0x90, 0x00]);
        let cmd = CommandApdu::new(0x00, 0x20, 0x00, 0x00, 0x03, vec![0x01, 0x02, 0x03]);
        let res = transceive(&mut side, &cmd).unwrap();
        assert_eq!(res.sw1, 0x90);
        assert_eq!(res.sw2, 0x00);
    }

    fn push_byte(side: &mut Side<FakeSideIo>, byte: u8) {
        side.io
            .inbound
            .push_back((byte, Convention::parity_of_wire_bits(byte)));
    }

    #[test]
    fn sw1_6c_retries_with_corrected_le() {
        let mut side = side_with_inbound(vec![]);
        push_byte(&mut side, 0x6C);
        push_byte(&mut side, 0x04);
        push_byte(&mut side, 0xCA); // proc byte == ins on retry
        for _ in 0..4 {
            push_byte(&mut side, 0xAB);
        }
        push_byte(&mut side, 0x90);
        push_byte(&mut side, 0x00);

        let cmd = CommandApdu::new(0x80, 0xCA, 0x00, 0x00, 0x00, Vec::new());
        let res = terminal_send_t0_command(&mut side, cmd).unwrap();
        assert_eq!(res.data.len(), 4);
        assert!(res.is_success());
    }

    #[test]
    fn unexpected_procedure_byte_surfaces_as_error() {
        let mut side = side_with_inbound(vec![]);
        push_byte(&mut side, 0x42);
        push_byte(&mut side, 0x00);
        let cmd = CommandApdu::new(0x00, 0x20, 0x00, 0x80, 0x04, vec![0x24, 0x12, 0x34, 0xFF]);
        let err = transceive(&mut side, &cmd).unwrap_err();
        assert!(matches!(err, Error::UnexpectedProcedureByte(0x42)));
    }
}
