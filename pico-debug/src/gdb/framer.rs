//! Inbound packet framer.
//!
//! A byte-at-a-time state machine over the remote-serial-protocol
//! framing: `$<payload>#<checksum>`, with `}`-escapes inside the payload
//! and the bare bytes `+`, `-` and 0x03 outside of it.

use crate::io::{GdbTransport, IoEvent};

/// What the framer saw. `Running` simply means the transport ran dry
/// mid-frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FramerEvent {
    Ack,
    Nak,
    Interrupt,
    Packet,
    Corrupt,
    Garbage,
    ChecksumFail,
    Overflow,
    Disconnect,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Data,
    Escape,
    Csum1,
    Csum2,
}

pub(crate) struct Framer {
    state: State,
    buffer: Vec<u8>,
    capacity: usize,
    checksum: u8,
    supplied: u8,
}

impl Framer {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: State::Start,
            buffer: Vec::new(),
            capacity,
            checksum: 0,
            supplied: 0,
        }
    }

    /// Drop any partial frame and start over.
    pub fn reset(&mut self) {
        self.state = State::Start;
        self.buffer.clear();
        self.checksum = 0;
        self.supplied = 0;
    }

    /// The payload of the packet just completed.
    pub fn packet(&self) -> &[u8] {
        &self.buffer
    }

    /// Feed bytes from the transport until something happens or the
    /// transport runs dry.
    pub fn pump(&mut self, io: &mut impl GdbTransport) -> FramerEvent {
        loop {
            match io.read_byte() {
                IoEvent::Disconnected => {
                    self.reset();
                    return FramerEvent::Disconnect;
                }
                IoEvent::Empty => return FramerEvent::Running,
                IoEvent::Byte(byte) => {
                    if let Some(event) = self.feed(byte) {
                        return event;
                    }
                }
            }
        }
    }

    fn feed(&mut self, byte: u8) -> Option<FramerEvent> {
        match self.state {
            State::Start => match byte {
                b'+' => Some(FramerEvent::Ack),
                b'-' => Some(FramerEvent::Nak),
                0x03 => Some(FramerEvent::Interrupt),
                b'$' => {
                    self.buffer.clear();
                    self.checksum = 0;
                    self.state = State::Data;
                    None
                }
                _ => Some(FramerEvent::Garbage),
            },

            State::Data => {
                if byte == b'#' {
                    self.state = State::Csum1;
                    return None;
                }
                self.checksum = self.checksum.wrapping_add(byte);
                if byte == b'}' {
                    self.state = State::Escape;
                    return None;
                }
                self.push(byte)
            }

            State::Escape => {
                self.checksum = self.checksum.wrapping_add(byte);
                self.state = State::Data;
                self.push(byte ^ 0x20)
            }

            State::Csum1 => match hex_digit(byte) {
                Some(digit) => {
                    self.supplied = digit << 4;
                    self.state = State::Csum2;
                    None
                }
                None => {
                    self.reset();
                    Some(FramerEvent::Corrupt)
                }
            },

            State::Csum2 => match hex_digit(byte) {
                Some(digit) => {
                    self.supplied |= digit;
                    self.state = State::Start;
                    if self.supplied == self.checksum {
                        Some(FramerEvent::Packet)
                    } else {
                        tracing::debug!(
                            expected = self.checksum,
                            got = self.supplied,
                            "checksum mismatch"
                        );
                        Some(FramerEvent::ChecksumFail)
                    }
                }
                None => {
                    self.reset();
                    Some(FramerEvent::Corrupt)
                }
            },
        }
    }

    fn push(&mut self, byte: u8) -> Option<FramerEvent> {
        if self.buffer.len() == self.capacity {
            self.reset();
            return Some(FramerEvent::Overflow);
        }
        self.buffer.push(byte);
        None
    }
}

fn hex_digit(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
