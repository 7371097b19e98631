//! Typed parsing of inbound packet payloads.
//!
//! The dispatcher keys on the first payload byte; the argument grammar of
//! each family is parsed here into a [`Command`] that the server matches
//! exhaustively. Anything that doesn't parse becomes [`Command::Unknown`]
//! and is answered with the empty packet.

use nom::bytes::complete::{tag, take_while1, take_while_m_n};
use nom::combinator::map_res;
use nom::IResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BreakpointKind {
    Software,
    Hardware,
}

/// Per-core action for a `vCont` resumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum ResumeAction {
    #[default]
    Continue,
    Step,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum XferObject {
    Features,
    MemoryMap,
    Threads,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    HaltReason,
    ReadRegisters,
    ReadRegister(u32),
    WriteRegister { reg: u32, value: u32 },
    ReadMemory { addr: u32, len: u32 },
    WriteMemory { addr: u32, data: Vec<u8> },
    /// `X<addr>,<len>:<bytes>` — binary memory write. A zero-length probe
    /// is how the host discovers support.
    WriteMemoryBinary { addr: u32, data: Vec<u8> },
    Detach,
    InsertBreakpoint { kind: BreakpointKind, addr: u32, size: u32 },
    RemoveBreakpoint { kind: BreakpointKind, addr: u32, size: u32 },
    /// `Hg<tid>`: select the core used for register/memory operations.
    SetThreadForOps(i64),
    /// `Hc<tid>`: deprecated step/continue thread selection, accepted.
    SetThreadForResume,
    ThreadAlive(i64),
    QueryCurrentThread,
    QueryAttached,
    QuerySupported,
    QueryOffsets,
    /// `qSymbol::` — the host offers symbol lookups.
    SymbolLookupReady,
    /// `qSymbol:<value>:<name>` — the host answers a lookup.
    SymbolValue { name: Vec<u8>, value: Option<u32> },
    Transfer { object: XferObject, offset: usize, length: usize },
    Monitor(Vec<u8>),
    StartNoAckMode,
    MustReplyEmpty,
    VContQuery,
    VCont([ResumeAction; 2]),
    FlashErase { addr: u32, len: u32 },
    FlashWrite { addr: u32, data: Vec<u8> },
    FlashDone,
    Unknown,
}

pub(crate) fn parse(payload: &[u8]) -> Command {
    match payload.first() {
        Some(b'?') => Command::HaltReason,
        Some(b'g') => Command::ReadRegisters,
        Some(b'p') => read_register(&payload[1..]),
        Some(b'P') => write_register(&payload[1..]),
        Some(b'm') => read_memory(&payload[1..]),
        Some(b'M') => write_memory(&payload[1..]),
        Some(b'X') => write_memory_binary(&payload[1..]),
        Some(b'D') => Command::Detach,
        Some(b'Z') => breakpoint(true, &payload[1..]),
        Some(b'z') => breakpoint(false, &payload[1..]),
        Some(b'H') => thread_select(&payload[1..]),
        Some(b'T') => thread_alive(&payload[1..]),
        Some(b'q') => query(&payload[1..]),
        Some(b'Q') if payload == b"QStartNoAckMode" => Command::StartNoAckMode,
        Some(b'v') => v_packet(&payload[1..]),
        _ => Command::Unknown,
    }
}

fn is_hex(byte: u8) -> bool {
    byte.is_ascii_hexdigit()
}

fn hex_u32(input: &[u8]) -> IResult<&[u8], u32> {
    map_res(take_while_m_n(1, 8, is_hex), |digits: &[u8]| {
        u32::from_str_radix(std::str::from_utf8(digits).unwrap_or(""), 16)
    })(input)
}

/// Decimal thread id, possibly negative ("all threads").
fn dec_tid(input: &[u8]) -> Option<i64> {
    std::str::from_utf8(input).ok()?.parse().ok()
}

/// A register value as transmitted: hex digit pairs in target
/// (little-endian) byte order.
fn hex_word_le(digits: &[u8]) -> Option<u32> {
    let bytes = hex::decode(digits).ok()?;
    if bytes.is_empty() || bytes.len() > 4 {
        return None;
    }
    let mut value = 0u32;
    for (i, byte) in bytes.iter().enumerate() {
        value |= u32::from(*byte) << (8 * i);
    }
    Some(value)
}

fn read_register(input: &[u8]) -> Command {
    match hex_u32(input) {
        Ok((rest, reg)) if rest.is_empty() => Command::ReadRegister(reg),
        _ => Command::Unknown,
    }
}

fn write_register_parts(input: &[u8]) -> IResult<&[u8], (u32, &[u8])> {
    let (input, reg) = hex_u32(input)?;
    let (input, _) = tag("=")(input)?;
    let (input, digits) = take_while1(is_hex)(input)?;
    Ok((input, (reg, digits)))
}

fn write_register(input: &[u8]) -> Command {
    match write_register_parts(input) {
        Ok((rest, (reg, digits))) if rest.is_empty() => match hex_word_le(digits) {
            Some(value) => Command::WriteRegister { reg, value },
            None => Command::Unknown,
        },
        _ => Command::Unknown,
    }
}

fn addr_len_pair(input: &[u8]) -> IResult<&[u8], (u32, u32)> {
    let (input, addr) = hex_u32(input)?;
    let (input, _) = tag(",")(input)?;
    let (input, len) = hex_u32(input)?;
    Ok((input, (addr, len)))
}

fn read_memory(input: &[u8]) -> Command {
    match addr_len_pair(input) {
        Ok((rest, (addr, len))) if rest.is_empty() => Command::ReadMemory { addr, len },
        _ => Command::Unknown,
    }
}

fn write_memory(input: &[u8]) -> Command {
    let Ok((rest, (addr, len))) = addr_len_pair(input) else {
        return Command::Unknown;
    };
    let Some(hex_data) = rest.strip_prefix(b":") else {
        return Command::Unknown;
    };
    match hex::decode(hex_data) {
        Ok(data) if data.len() == len as usize => Command::WriteMemory { addr, data },
        _ => Command::Unknown,
    }
}

fn write_memory_binary(input: &[u8]) -> Command {
    let Ok((rest, (addr, len))) = addr_len_pair(input) else {
        return Command::Unknown;
    };
    let Some(data) = rest.strip_prefix(b":") else {
        return Command::Unknown;
    };
    // The framer already unescaped the payload, so this must match.
    if data.len() != len as usize {
        return Command::Unknown;
    }
    Command::WriteMemoryBinary {
        addr,
        data: data.to_vec(),
    }
}

fn breakpoint(insert: bool, input: &[u8]) -> Command {
    let kind = match input.first() {
        Some(b'0') => BreakpointKind::Software,
        Some(b'1') => BreakpointKind::Hardware,
        // Watchpoints are not supported; empty reply.
        _ => return Command::Unknown,
    };
    let Some(rest) = input[1..].strip_prefix(b",") else {
        return Command::Unknown;
    };
    match addr_len_pair(rest) {
        Ok((rest, (addr, size))) if rest.is_empty() => {
            if insert {
                Command::InsertBreakpoint { kind, addr, size }
            } else {
                Command::RemoveBreakpoint { kind, addr, size }
            }
        }
        _ => Command::Unknown,
    }
}

fn thread_select(input: &[u8]) -> Command {
    match input.first() {
        Some(b'g') => match dec_tid(&input[1..]) {
            Some(tid) => Command::SetThreadForOps(tid),
            None => Command::Unknown,
        },
        Some(b'c') => Command::SetThreadForResume,
        _ => Command::Unknown,
    }
}

fn thread_alive(input: &[u8]) -> Command {
    match dec_tid(input) {
        Some(tid) => Command::ThreadAlive(tid),
        None => Command::Unknown,
    }
}

fn query(input: &[u8]) -> Command {
    if input == b"C" {
        return Command::QueryCurrentThread;
    }
    if input == b"Offsets" {
        return Command::QueryOffsets;
    }
    if input.starts_with(b"Supported") {
        return Command::QuerySupported;
    }
    if input.starts_with(b"Attached") {
        return Command::QueryAttached;
    }
    if let Some(rest) = input.strip_prefix(b"Symbol:") {
        return symbol(rest);
    }
    if let Some(rest) = input.strip_prefix(b"Rcmd,") {
        return match hex::decode(rest) {
            Ok(cmd) => Command::Monitor(cmd),
            Err(_) => Command::Unknown,
        };
    }
    if let Some(rest) = input.strip_prefix(b"Xfer:") {
        return transfer(rest);
    }
    Command::Unknown
}

fn symbol(input: &[u8]) -> Command {
    let Some(colon) = input.iter().position(|b| *b == b':') else {
        return Command::Unknown;
    };
    let (value_digits, name_hex) = (&input[..colon], &input[colon + 1..]);
    if name_hex.is_empty() {
        return Command::SymbolLookupReady;
    }
    let Ok(name) = hex::decode(name_hex) else {
        return Command::Unknown;
    };
    let value = if value_digits.is_empty() {
        None
    } else {
        match hex_u32(value_digits) {
            Ok((rest, v)) if rest.is_empty() => Some(v),
            _ => return Command::Unknown,
        }
    };
    Command::SymbolValue { name, value }
}

fn transfer(input: &[u8]) -> Command {
    let (object, rest) = if let Some(rest) = input.strip_prefix(b"features:read:") {
        (XferObject::Features, rest)
    } else if let Some(rest) = input.strip_prefix(b"memory-map:read:") {
        (XferObject::MemoryMap, rest)
    } else if let Some(rest) = input.strip_prefix(b"threads:read:") {
        (XferObject::Threads, rest)
    } else {
        return Command::Unknown;
    };

    // Skip the annex (may be empty, e.g. "target.xml" or "").
    let Some(colon) = rest.iter().position(|b| *b == b':') else {
        return Command::Unknown;
    };
    match addr_len_pair(&rest[colon + 1..]) {
        Ok((rest, (offset, length))) if rest.is_empty() => Command::Transfer {
            object,
            offset: offset as usize,
            length: length as usize,
        },
        _ => Command::Unknown,
    }
}

fn v_packet(input: &[u8]) -> Command {
    if input == b"MustReplyEmpty" {
        return Command::MustReplyEmpty;
    }
    if input == b"Cont?" {
        return Command::VContQuery;
    }
    if let Some(rest) = input.strip_prefix(b"Cont") {
        return vcont_actions(rest);
    }
    if let Some(rest) = input.strip_prefix(b"FlashErase:") {
        return match addr_len_pair(rest) {
            Ok((remaining, (addr, len))) if remaining.is_empty() => {
                Command::FlashErase { addr, len }
            }
            _ => Command::Unknown,
        };
    }
    if let Some(rest) = input.strip_prefix(b"FlashWrite:") {
        let Ok((after_addr, addr)) = hex_u32(rest) else {
            return Command::Unknown;
        };
        let Some(data) = after_addr.strip_prefix(b":") else {
            return Command::Unknown;
        };
        return Command::FlashWrite {
            addr,
            data: data.to_vec(),
        };
    }
    if input == b"FlashDone" {
        return Command::FlashDone;
    }
    Command::Unknown
}

/// `vCont` actions: the first matching action wins per core; cores
/// without one keep running alongside (both cores travel together on
/// this target).
fn vcont_actions(input: &[u8]) -> Command {
    let mut assigned: [Option<ResumeAction>; 2] = [None, None];

    for token in input.split(|b| *b == b';').skip(1) {
        if token.is_empty() {
            continue;
        }
        let action = match token[0] {
            b'c' | b'C' => ResumeAction::Continue,
            b's' | b'S' => ResumeAction::Step,
            _ => return Command::Unknown,
        };
        // C/S carry a signal number before the optional thread id.
        let rest = if token[0].is_ascii_uppercase() {
            let digits = token[1..].iter().take_while(|b| is_hex(**b)).count();
            &token[1 + digits..]
        } else {
            &token[1..]
        };

        match rest.strip_prefix(b":") {
            Some(tid_digits) => {
                let Ok((rest, tid)) = hex_u32(tid_digits) else {
                    return Command::Unknown;
                };
                if !rest.is_empty() {
                    return Command::Unknown;
                }
                match tid {
                    1 => assigned[0].get_or_insert(action),
                    2 => assigned[1].get_or_insert(action),
                    _ => return Command::Unknown,
                };
            }
            None if rest.is_empty() => {
                for slot in &mut assigned {
                    slot.get_or_insert(action);
                }
            }
            None => return Command::Unknown,
        }
    }

    Command::VCont([
        assigned[0].unwrap_or_default(),
        assigned[1].unwrap_or_default(),
    ])
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_simple_packets() {
        let cases: [(&[u8], Command); 6] = [
            (b"?", Command::HaltReason),
            (b"g", Command::ReadRegisters),
            (b"qSupported:multiprocess+;swbreak+", Command::QuerySupported),
            (b"qAttached", Command::QueryAttached),
            (b"vCont?", Command::VContQuery),
            (b"vMustReplyEmpty", Command::MustReplyEmpty),
        ];
        for (input, expected) in cases {
            assert_eq!(parse(input), expected, "parsing {:?}", input);
        }
    }

    #[test]
    fn parses_register_accesses() {
        assert_eq!(parse(b"p03"), Command::ReadRegister(3));
        assert_eq!(
            parse(b"P0f=78563412"),
            Command::WriteRegister {
                reg: 15,
                value: 0x1234_5678
            }
        );
    }

    #[test]
    fn parses_memory_accesses() {
        assert_eq!(
            parse(b"m20000000,4"),
            Command::ReadMemory {
                addr: 0x2000_0000,
                len: 4
            }
        );
        assert_eq!(
            parse(b"M20000400,2:beef"),
            Command::WriteMemory {
                addr: 0x2000_0400,
                data: vec![0xBE, 0xEF]
            }
        );
        // Length / data mismatch is rejected.
        assert_eq!(parse(b"M20000400,3:beef"), Command::Unknown);
    }

    #[test]
    fn parses_binary_memory_writes() {
        assert_eq!(
            parse(b"X20000400,3:\x01\x02\x03"),
            Command::WriteMemoryBinary {
                addr: 0x2000_0400,
                data: vec![1, 2, 3]
            }
        );
        // The zero-length support probe.
        assert_eq!(
            parse(b"X0,0:"),
            Command::WriteMemoryBinary {
                addr: 0,
                data: vec![]
            }
        );
        assert_eq!(parse(b"X20000400,4:\x01\x02"), Command::Unknown);
    }

    #[test]
    fn parses_breakpoints() {
        assert_eq!(
            parse(b"Z1,10001234,2"),
            Command::InsertBreakpoint {
                kind: BreakpointKind::Hardware,
                addr: 0x1000_1234,
                size: 2
            }
        );
        assert_eq!(
            parse(b"z0,456,4"),
            Command::RemoveBreakpoint {
                kind: BreakpointKind::Software,
                addr: 0x456,
                size: 4
            }
        );
        // Watchpoints fall through to the empty reply.
        assert_eq!(parse(b"Z2,1000,4"), Command::Unknown);
    }

    #[test]
    fn parses_thread_packets() {
        assert_eq!(parse(b"Hg2"), Command::SetThreadForOps(2));
        assert_eq!(parse(b"Hg-1"), Command::SetThreadForOps(-1));
        assert_eq!(parse(b"Hc0"), Command::SetThreadForResume);
        assert_eq!(parse(b"T1"), Command::ThreadAlive(1));
        assert_eq!(parse(b"qC"), Command::QueryCurrentThread);
    }

    #[test]
    fn parses_vcont_action_lists() {
        assert_eq!(
            parse(b"vCont;c"),
            Command::VCont([ResumeAction::Continue, ResumeAction::Continue])
        );
        assert_eq!(
            parse(b"vCont;s:1;c"),
            Command::VCont([ResumeAction::Step, ResumeAction::Continue])
        );
        assert_eq!(
            parse(b"vCont;s:2"),
            Command::VCont([ResumeAction::Continue, ResumeAction::Step])
        );
        assert_eq!(
            parse(b"vCont;C05:1;c"),
            Command::VCont([ResumeAction::Continue, ResumeAction::Continue])
        );
    }

    #[test]
    fn parses_transfer_requests() {
        assert_eq!(
            parse(b"qXfer:memory-map:read::0,2047"),
            Command::Transfer {
                object: XferObject::MemoryMap,
                offset: 0,
                length: 0x2047
            }
        );
        assert_eq!(
            parse(b"qXfer:features:read:target.xml:80,1f4"),
            Command::Transfer {
                object: XferObject::Features,
                offset: 0x80,
                length: 0x1F4
            }
        );
    }

    #[test]
    fn parses_monitor_and_symbols() {
        assert_eq!(
            parse(b"qRcmd,72657365742068616c74"),
            Command::Monitor(b"reset halt".to_vec())
        );
        assert_eq!(parse(b"qSymbol::"), Command::SymbolLookupReady);
        assert_eq!(
            parse(b"qSymbol:10000abc:6d61696e"),
            Command::SymbolValue {
                name: b"main".to_vec(),
                value: Some(0x1000_0ABC)
            }
        );
    }

    #[test]
    fn parses_flash_packets() {
        assert_eq!(
            parse(b"vFlashErase:10040000,1000"),
            Command::FlashErase {
                addr: 0x1004_0000,
                len: 0x1000
            }
        );
        assert_eq!(
            parse(b"vFlashWrite:10040000:\x01\x02\x03"),
            Command::FlashWrite {
                addr: 0x1004_0000,
                data: vec![1, 2, 3]
            }
        );
        assert_eq!(parse(b"vFlashDone"), Command::FlashDone);
    }

    #[test]
    fn garbage_is_unknown() {
        assert_eq!(parse(b""), Command::Unknown);
        assert_eq!(parse(b"x123"), Command::Unknown);
        assert_eq!(parse(b"m123"), Command::Unknown);
    }
}
