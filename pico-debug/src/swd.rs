//! Bit-level SWD transceiver.
//!
//! This module owns the physical debug bus. It assembles the canonical
//! 8-bit request header, handles turn-around cycles, decodes the 3-bit
//! acknowledge and moves the 32-bit data phase with its parity bit, on top
//! of a clocked bit engine ([`WireEngine`]) that the firmware implements
//! with a PIO state machine.
//!
//! The transceiver performs exactly one transaction per call; WAIT
//! handling and retries belong to the transaction layer above.

/// Clocked bit engine on the two debug wires.
///
/// All bit values travel LSB-first. Implementations block cooperatively
/// when their FIFOs are full or empty; from the transceiver's point of
/// view every call completes.
pub trait WireEngine {
    /// Clock out `count` bits (1..=32) of `bits`, host driving the line.
    fn write_bits(&mut self, bits: u32, count: usize);

    /// Clock in `count` bits (1..=32) with the host listening; the result
    /// is right-justified.
    fn read_bits(&mut self, count: usize) -> u32;

    /// Configure the clock divider for the bus bit rate.
    fn set_clock_divider(&mut self, divider: u16);
}

/// Wire-level transaction outcome.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwdError {
    /// Target acknowledged with WAIT; the identical request must be retried.
    #[error("target issued a WAIT response")]
    Wait,
    /// Target acknowledged with FAULT; sticky error flags need clearing.
    #[error("target issued a FAULT response")]
    Fault,
    /// Read data failed its parity check and was discarded.
    #[error("parity mismatch on read data")]
    Parity,
    /// The acknowledge field was not one of OK/WAIT/FAULT, usually because
    /// nothing is driving the bus.
    #[error("no valid acknowledge on the bus")]
    Protocol,
}

/// Which port a transaction addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    /// Debug port registers.
    Dp,
    /// The currently selected access port.
    Ap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

// Acknowledge values as seen LSB-first on the wire.
const ACK_OK: u32 = 0b001;
const ACK_WAIT: u32 = 0b010;
const ACK_FAULT: u32 = 0b100;

// Line reset: 56 ones followed by 8 zeros, comfortably above the
// architectural minimum of 50 ones + 2 zeros.
const LINE_RESET_SEQ: [u32; 2] = [0xFFFF_FFFF, 0x00FF_FFFF];

// The 128-bit selection alert that wakes a dormant SW-DP.
const SELECTION_ALERT_SEQ: [u32; 4] = [0x6209_F392, 0x8685_2D95, 0xE3DD_AFE9, 0x19BC_0EA2];

// SWD activation code, sent after the alert and four zero bits.
const SWD_ACTIVATION_CODE: u32 = 0x1A;

// Request header for the TARGETSEL write (DP write, address 0xC).
const TARGETSEL_HEADER: u32 = 0x99;

/// Odd-bit parity of a 32-bit word.
pub fn parity32(value: u32) -> u32 {
    value.count_ones() & 1
}

/// The SWD transceiver. Owns the bus; everything above goes through here.
pub struct Swd<E: WireEngine> {
    engine: E,
}

impl<E: WireEngine> Swd<E> {
    /// Wrap a bit engine and configure its bit rate.
    pub fn new(mut engine: E, clock_divider: u16) -> Self {
        engine.set_clock_divider(clock_divider);
        Self { engine }
    }

    /// Clock out an arbitrary bit sequence, 32 bits per word, LSB-first.
    pub fn send_bits(&mut self, words: &[u32], mut bit_count: usize) {
        for word in words {
            if bit_count == 0 {
                break;
            }
            let n = bit_count.min(32);
            self.engine.write_bits(*word, n);
            bit_count -= n;
        }
    }

    /// Clock in up to 32 bits, right-justified.
    pub fn read_bits(&mut self, count: usize) -> u32 {
        self.engine.read_bits(count)
    }

    /// ≥50 ones followed by ≥2 zeros; resynchronizes the DP state machine.
    pub fn line_reset(&mut self) {
        tracing::trace!("line reset");
        self.send_bits(&LINE_RESET_SEQ, 64);
    }

    /// Wake the debug port from dormant state.
    ///
    /// Required once after power-up (and after a rescue reset): selection
    /// alert, four zero bits, the SWD activation code, some idle ones and
    /// a line reset.
    pub fn wake_from_dormant(&mut self) {
        tracing::debug!("dormant wake-up sequence");
        self.send_bits(&[0xFF], 8);
        self.send_bits(&SELECTION_ALERT_SEQ, 128);
        self.send_bits(&[0x0], 4);
        self.send_bits(&[SWD_ACTIVATION_CODE], 8);
        self.send_bits(&[0xFF], 8);
        self.line_reset();
    }

    /// Issue the multidrop TARGETSEL sequence for `target_id`.
    ///
    /// The target does not drive the acknowledge during TARGETSEL, so the
    /// ack bits are clocked but ignored.
    pub fn target_select(&mut self, target_id: u32) {
        tracing::debug!(targetsel = format_args!("{target_id:#010x}"), "target select");
        self.engine.write_bits(TARGETSEL_HEADER, 8);
        // trn + 3 undriven ack bits + trn
        let _ = self.engine.read_bits(5);
        self.engine.write_bits(target_id, 32);
        self.engine.write_bits(parity32(target_id), 1);
    }

    /// One read transaction. Returns the data word, or the decoded
    /// acknowledge as an error. WAIT is *not* retried here.
    pub fn raw_read(&mut self, port: Port, addr: u8) -> Result<u32, SwdError> {
        self.engine.write_bits(request_header(port, Direction::Read, addr), 8);

        // trn + ack
        let ack = self.engine.read_bits(4) >> 1;
        if let Err(e) = decode_ack(ack) {
            // Reclaim the line so the next request starts cleanly.
            self.engine.write_bits(0, 1);
            return Err(e);
        }

        let value = self.engine.read_bits(32);
        let parity = self.engine.read_bits(1);
        // trn back to the host
        self.engine.write_bits(0, 1);

        if parity != parity32(value) {
            tracing::debug!(addr, "read parity mismatch, discarding payload");
            return Err(SwdError::Parity);
        }
        Ok(value)
    }

    /// One write transaction. WAIT is *not* retried here.
    pub fn raw_write(&mut self, port: Port, addr: u8, value: u32) -> Result<(), SwdError> {
        self.engine.write_bits(request_header(port, Direction::Write, addr), 8);

        // trn + ack
        let ack = self.engine.read_bits(4) >> 1;
        if let Err(e) = decode_ack(ack) {
            self.engine.write_bits(0, 1);
            return Err(e);
        }

        // trn back to the host, then the data phase.
        let _ = self.engine.read_bits(1);
        self.engine.write_bits(value, 32);
        self.engine.write_bits(parity32(value), 1);
        Ok(())
    }

    pub(crate) fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }
}

fn decode_ack(ack: u32) -> Result<(), SwdError> {
    match ack & 0b111 {
        ACK_OK => Ok(()),
        ACK_WAIT => Err(SwdError::Wait),
        ACK_FAULT => Err(SwdError::Fault),
        other => {
            tracing::debug!(ack = other, "unexpected acknowledge");
            Err(SwdError::Protocol)
        }
    }
}

/// Assemble the 8-bit request: start, APnDP, RnW, A[2], A[3], parity,
/// stop, park — LSB first.
fn request_header(port: Port, direction: Direction, addr: u8) -> u32 {
    let apndp = matches!(port, Port::Ap) as u32;
    let rnw = matches!(direction, Direction::Read) as u32;
    let a = u32::from(addr) & 0xC;
    let parity = (apndp + rnw + ((a >> 2) & 1) + ((a >> 3) & 1)) & 1;

    1 | (apndp << 1) | (rnw << 2) | (a << 1) | (parity << 5) | (1 << 7)
}
