//! GDB remote-serial-protocol server.
//!
//! One [`GdbServer`] owns the framer, the reply path, the software
//! breakpoint set and the flash staging buffer, and drives the target
//! through the debug stack. [`GdbServer::poll`] is the cooperative entry
//! point: call it forever.

mod desc;
mod framer;
mod monitor;
mod packet;
mod reply;
mod resume;

use std::collections::BTreeMap;

use framer::{Framer, FramerEvent};
use packet::{BreakpointKind, Command, XferObject};
use reply::{reply_chunk, reply_empty, reply_error, reply_hex, reply_ok, reply_text, ReplyWriter};

use crate::adi::{RunState, Target};
use crate::flash::FlashStage;
use crate::io::GdbTransport;
use crate::swd::WireEngine;

/// Stop-packet signal numbers.
const SIGINT: u8 = 0x02;
const SIGTRAP: u8 = 0x05;

/// Registers reported by `g`: r0-r15 plus xPSR.
const G_PACKET_REGS: usize = 17;

/// The BKPT instruction, once per halfword.
const BKPT_CODE: [u8; 4] = [0x11, 0xBE, 0x11, 0xBE];

/// Feature tokens advertised in `qSupported`; the `qXfer` dispatch serves
/// exactly these objects.
const SUPPORTED_FEATURES: [&str; 5] = [
    "qXfer:memory-map:read+",
    "qXfer:features:read+",
    "qXfer:threads:read+",
    "QStartNoAckMode+",
    "vContSupported+",
];

fn stop_code(reason: crate::adi::HaltReason) -> u8 {
    match reason {
        crate::adi::HaltReason::DebugRequest => SIGINT,
        _ => SIGTRAP,
    }
}

#[derive(Debug, Clone, Copy)]
struct SwBreakpoint {
    orig: [u8; 4],
    size: usize,
}

/// The debug session: target access stack plus protocol state.
pub struct GdbServer<E: WireEngine, T: GdbTransport> {
    target: Target<E>,
    io: T,
    framer: Framer,
    no_ack: bool,
    was_connected: bool,
    swbps: BTreeMap<u32, SwBreakpoint>,
    stage: FlashStage,
    main_addr: Option<u32>,
}

impl<E: WireEngine, T: GdbTransport> GdbServer<E, T> {
    /// Wrap a target and a transport into a server.
    pub fn new(target: Target<E>, io: T) -> Self {
        let capacity = target.config.packet_buffer_size;
        Self {
            target,
            io,
            framer: Framer::new(capacity),
            no_ack: false,
            was_connected: false,
            swbps: BTreeMap::new(),
            stage: FlashStage::new(),
            main_addr: None,
        }
    }

    /// One cooperative scheduling slice: pump inbound bytes, handle at
    /// most one event, yield.
    pub fn poll(&mut self) {
        if !self.io.is_connected() {
            if self.was_connected {
                self.teardown();
            }
            self.io.poll_wait();
            return;
        }
        if !self.was_connected {
            self.on_connect();
        }

        match self.framer.pump(&mut self.io) {
            FramerEvent::Packet => self.process_packet(),
            FramerEvent::Ack => tracing::trace!("ack"),
            FramerEvent::Nak => tracing::debug!("nak from host"),
            // Stray 0x03 between packets: the cores are already stopped
            // (or about to be reported as such), nothing to do.
            FramerEvent::Interrupt => tracing::debug!("interrupt byte outside run loop"),
            FramerEvent::Garbage => tracing::debug!("garbage byte outside packet"),
            event @ (FramerEvent::Corrupt | FramerEvent::ChecksumFail | FramerEvent::Overflow) => {
                tracing::debug!(?event, "discarding inbound packet");
                if !self.no_ack {
                    self.io.write_byte(b'-');
                }
            }
            FramerEvent::Disconnect => self.teardown(),
            FramerEvent::Running => self.io.poll_wait(),
        }
    }

    fn on_connect(&mut self) {
        tracing::info!("new debug connection");
        self.was_connected = true;
        self.no_ack = false;
        self.main_addr = None;
        self.swbps.clear();
        self.stage.clear();

        if let Err(e) = self.attach() {
            tracing::error!("target attach failed: {e}");
        }
    }

    /// Bring the target up for a fresh session: connect the debug port
    /// and leave both cores reset-halted with core 0 selected.
    fn attach(&mut self) -> crate::Result<()> {
        self.target.connect()?;
        self.target.reset_halt()?;
        self.target.select_core(1)?;
        self.target.reset_halt()?;
        self.target.select_core(0)?;
        Ok(())
    }

    /// `D`: the host is done with us. Put the target back together and
    /// let it run free.
    fn detach(&mut self) {
        tracing::info!("host detached");

        let addrs: Vec<u32> = self.swbps.keys().copied().collect();
        for addr in addrs {
            if let Err(e) = self.remove_sw_breakpoint(addr) {
                tracing::warn!(addr = format_args!("{addr:#010x}"), "failed to restore code: {e}");
            }
        }

        let cur = self.target.current_core();
        for core in [1 - cur, cur] {
            let resumed = self
                .target
                .select_core(core)
                .and_then(|()| self.target.resume());
            if let Err(e) = resumed {
                tracing::warn!(core, "failed to resume on detach: {e}");
            }
        }
        reply_ok(&mut self.io);
    }

    fn teardown(&mut self) {
        tracing::info!("debug connection closed");
        self.was_connected = false;
        self.no_ack = false;
        self.main_addr = None;
        self.swbps.clear();
        self.stage.clear();
        self.framer.reset();
        self.halt_all();
    }

    fn send_stop_packet(&mut self, tid: usize, code: u8) {
        reply_text(&mut self.io, &format!("T{code:02x}thread:{tid};"));
    }

    fn process_packet(&mut self) {
        let payload = self.framer.packet().to_vec();
        if !self.no_ack {
            self.io.write_byte(b'+');
        }

        if payload.starts_with(b"vFlashWrite") {
            tracing::debug!(len = payload.len(), "packet [vFlashWrite]");
        } else {
            tracing::debug!(packet = %String::from_utf8_lossy(&payload), "packet");
        }

        match packet::parse(&payload) {
            Command::HaltReason => self.report_halt_reason(),
            Command::ReadRegisters => self.read_registers(),
            Command::ReadRegister(reg) => self.read_register(reg),
            Command::WriteRegister { reg, value } => self.write_register(reg, value),
            Command::ReadMemory { addr, len } => self.read_memory(addr, len),
            Command::WriteMemory { addr, data } => self.write_memory(addr, &data),
            Command::WriteMemoryBinary { addr, data } => {
                if data.is_empty() {
                    // Support probe.
                    reply_ok(&mut self.io);
                } else {
                    self.write_memory(addr, &data);
                }
            }
            Command::Detach => self.detach(),
            Command::InsertBreakpoint { kind, addr, size } => {
                self.insert_breakpoint(kind, addr, size)
            }
            Command::RemoveBreakpoint { kind, addr, .. } => self.remove_breakpoint(kind, addr),
            Command::SetThreadForOps(tid) => self.set_thread(tid),
            Command::SetThreadForResume => reply_ok(&mut self.io),
            Command::ThreadAlive(tid) => {
                if tid == 1 || tid == 2 {
                    reply_ok(&mut self.io);
                } else {
                    reply_error(&mut self.io, 1);
                }
            }
            Command::QueryCurrentThread => {
                let tid = self.target.current_core() + 1;
                reply_text(&mut self.io, &format!("QC00000000000000{tid:02}"));
            }
            Command::QueryAttached => reply_text(&mut self.io, "1"),
            Command::QuerySupported => {
                let features = SUPPORTED_FEATURES.join(";");
                let reply = format!(
                    "PacketSize={:x};{features}",
                    self.target.config.packet_buffer_size
                );
                reply_text(&mut self.io, &reply);
            }
            Command::QueryOffsets => reply_text(&mut self.io, "Text=0;Data=0;Bss=0"),
            Command::SymbolLookupReady => {
                // Ask the host for the one symbol we care about: main.
                let mut reply = ReplyWriter::begin(&mut self.io);
                reply.push_str("qSymbol:");
                reply.push_hex(b"main");
                reply.finish();
            }
            Command::SymbolValue { name, value } => {
                if name == b"main" {
                    if let Some(addr) = value {
                        tracing::debug!(addr = format_args!("{addr:#010x}"), "main resolved");
                        self.main_addr = Some(addr);
                    }
                }
                reply_ok(&mut self.io);
            }
            Command::Transfer {
                object,
                offset,
                length,
            } => self.transfer(object, offset, length),
            Command::Monitor(cmd) => self.handle_monitor(&cmd),
            Command::StartNoAckMode => {
                reply_ok(&mut self.io);
                self.no_ack = true;
            }
            Command::MustReplyEmpty => reply_empty(&mut self.io),
            Command::VContQuery => reply_text(&mut self.io, "vCont;c;C;s;S"),
            Command::VCont(actions) => self.handle_vcont(actions),
            Command::FlashErase { len, .. } => {
                // Erase happens as part of the programming sequence.
                if len == 0 {
                    reply_error(&mut self.io, 1);
                } else {
                    reply_ok(&mut self.io);
                }
            }
            Command::FlashWrite { addr, data } => self.flash_write(addr, &data),
            Command::FlashDone => self.flash_done(),
            Command::Unknown => {
                tracing::debug!("unsupported packet");
                reply_empty(&mut self.io);
            }
        }
    }

    // ---- stop state -----------------------------------------------------

    fn report_halt_reason(&mut self) {
        let core = self.target.current_core();
        let (state, reason) = self.target.core_status(core);
        let code = if state == RunState::Halted {
            stop_code(reason)
        } else {
            SIGTRAP
        };
        self.send_stop_packet(core + 1, code);
    }

    // ---- registers ------------------------------------------------------

    fn read_registers(&mut self) {
        let mut values = [0u32; G_PACKET_REGS];
        for (reg, slot) in values.iter_mut().enumerate() {
            match self.target.read_reg(reg) {
                Ok(value) => *slot = value,
                Err(e) => {
                    tracing::warn!(reg, "register read failed: {e}");
                    reply_error(&mut self.io, 1);
                    return;
                }
            }
        }

        let mut reply = ReplyWriter::begin(&mut self.io);
        for value in values {
            reply.push_hex(&value.to_le_bytes());
        }
        reply.finish();
    }

    fn read_register(&mut self, reg: u32) {
        if reg as usize >= crate::adi::REG_CACHE_SIZE {
            reply_error(&mut self.io, 1);
            return;
        }
        match self.target.read_reg(reg as usize) {
            Ok(value) => reply_hex(&mut self.io, &value.to_le_bytes()),
            Err(e) => {
                tracing::warn!(reg, "register read failed: {e}");
                reply_error(&mut self.io, 1);
            }
        }
    }

    fn write_register(&mut self, reg: u32, value: u32) {
        if reg as usize >= crate::adi::REG_CACHE_SIZE {
            reply_error(&mut self.io, 1);
            return;
        }
        match self.target.write_reg(reg as usize, value) {
            Ok(()) => reply_ok(&mut self.io),
            Err(e) => {
                tracing::warn!(reg, "register write failed: {e}");
                reply_error(&mut self.io, 1);
            }
        }
    }

    // ---- memory ---------------------------------------------------------

    fn read_memory(&mut self, addr: u32, len: u32) {
        let len = len as usize;
        if len > self.target.config.packet_buffer_size / 2 {
            reply_error(&mut self.io, 1);
            return;
        }
        let mut data = vec![0u8; len];
        match self.target.block_read(addr, &mut data) {
            Ok(()) => reply_hex(&mut self.io, &data),
            Err(e) => {
                tracing::warn!(addr = format_args!("{addr:#010x}"), "memory read failed: {e}");
                reply_error(&mut self.io, 1);
            }
        }
    }

    fn write_memory(&mut self, addr: u32, data: &[u8]) {
        match self.target.block_write(addr, data) {
            Ok(()) => reply_ok(&mut self.io),
            Err(e) => {
                tracing::warn!(addr = format_args!("{addr:#010x}"), "memory write failed: {e}");
                reply_error(&mut self.io, 1);
            }
        }
    }

    // ---- breakpoints ----------------------------------------------------

    fn insert_breakpoint(&mut self, kind: BreakpointKind, addr: u32, size: u32) {
        let result = match kind {
            BreakpointKind::Hardware => self.target.breakpoint_set(addr),
            BreakpointKind::Software => self.insert_sw_breakpoint(addr, size),
        };
        match result {
            Ok(()) => reply_ok(&mut self.io),
            Err(e) => {
                tracing::warn!(addr = format_args!("{addr:#010x}"), "breakpoint set failed: {e}");
                reply_error(&mut self.io, 1);
            }
        }
    }

    fn remove_breakpoint(&mut self, kind: BreakpointKind, addr: u32) {
        let result = match kind {
            BreakpointKind::Hardware => self.target.breakpoint_clear(addr),
            BreakpointKind::Software => self.remove_sw_breakpoint(addr),
        };
        match result {
            Ok(()) => reply_ok(&mut self.io),
            Err(e) => {
                tracing::warn!(addr = format_args!("{addr:#010x}"), "breakpoint clear failed: {e}");
                reply_error(&mut self.io, 1);
            }
        }
    }

    /// Swap the original instruction for BKPT opcodes. One entry per
    /// address, at most.
    fn insert_sw_breakpoint(&mut self, addr: u32, size: u32) -> crate::Result<()> {
        if self.swbps.contains_key(&addr) {
            return Ok(());
        }
        let size = if size == 4 { 4 } else { 2 };

        let mut orig = [0u8; 4];
        self.target.block_read(addr, &mut orig[..size])?;
        self.target.block_write(addr, &BKPT_CODE[..size])?;
        self.swbps.insert(addr, SwBreakpoint { orig, size });
        Ok(())
    }

    fn remove_sw_breakpoint(&mut self, addr: u32) -> crate::Result<()> {
        if let Some(bp) = self.swbps.remove(&addr) {
            self.target.block_write(addr, &bp.orig[..bp.size])?;
        }
        Ok(())
    }

    // ---- threads --------------------------------------------------------

    fn set_thread(&mut self, tid: i64) {
        let core = match tid {
            0 | 1 => 0,
            2 => 1,
            _ => {
                reply_error(&mut self.io, 1);
                return;
            }
        };
        match self.target.select_core(core) {
            Ok(()) => reply_ok(&mut self.io),
            Err(e) => {
                tracing::warn!(core, "core select failed: {e}");
                reply_error(&mut self.io, 1);
            }
        }
    }

    // ---- qXfer ----------------------------------------------------------

    fn transfer(&mut self, object: XferObject, offset: usize, length: usize) {
        let content: String = match object {
            XferObject::Features => desc::TARGET_XML.into(),
            XferObject::MemoryMap => desc::MEMORY_MAP_XML.into(),
            XferObject::Threads => desc::threads_xml([
                self.target.core_status(0),
                self.target.core_status(1),
            ]),
        };
        let content = content.as_bytes();

        if offset >= content.len() {
            reply_chunk(&mut self.io, true, b"");
            return;
        }
        let end = (offset + length).min(content.len());
        reply_chunk(&mut self.io, end == content.len(), &content[offset..end]);
    }

    // ---- flash ----------------------------------------------------------

    fn flash_write(&mut self, addr: u32, data: &[u8]) {
        let offset = addr & 0x00FF_FFFF;

        if !self.stage.accepts(offset) {
            let stage = std::mem::take(&mut self.stage);
            if let Err(e) = self.program_stage(&stage) {
                tracing::warn!("flash programming failed: {e}");
                reply_error(&mut self.io, 1);
                return;
            }
        }
        self.stage.append(offset, data);
        reply_ok(&mut self.io);
    }

    fn flash_done(&mut self) {
        let stage = std::mem::take(&mut self.stage);
        match self.program_stage(&stage) {
            Ok(()) => reply_ok(&mut self.io),
            Err(e) => {
                tracing::warn!("flash programming failed: {e}");
                reply_error(&mut self.io, 1);
            }
        }
    }

    /// Program a staged image, yielding to the transport pumps while the
    /// ROM routines run on the target.
    fn program_stage(&mut self, stage: &FlashStage) -> crate::Result<()> {
        let Self { target, io, .. } = self;
        target.program_flash(stage, &mut || io.poll_wait())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ProbeConfig;
    use crate::fake::FakeRp2040;
    use crate::io::testing::LoopbackTransport;
    use pretty_assertions::assert_eq;

    fn server() -> GdbServer<FakeRp2040, LoopbackTransport> {
        let target = Target::new(FakeRp2040::new(), ProbeConfig::default());
        GdbServer::new(target, LoopbackTransport::connected())
    }

    fn frame(payload: &str) -> String {
        let sum: u32 = payload.bytes().map(u32::from).sum();
        format!("${payload}#{:02x}", sum & 0xFF)
    }

    /// Push a packet and poll until the server has drained the input.
    fn roundtrip(server: &mut GdbServer<FakeRp2040, LoopbackTransport>, payload: &str) -> String {
        server.io.push_str(&frame(payload));
        for _ in 0..100 {
            if server.io.inbound.is_empty() {
                break;
            }
            server.poll();
        }
        server.io.take_output()
    }

    #[test]
    fn capability_exchange_advertises_the_feature_set() {
        let mut s = server();
        let out = roundtrip(&mut s, "qSupported:multiprocess+;swbreak+;hwbreak+");
        assert_eq!(
            out,
            format!(
                "+{}",
                frame(
                    "PacketSize=4000;qXfer:memory-map:read+;qXfer:features:read+;\
                     qXfer:threads:read+;QStartNoAckMode+;vContSupported+"
                )
            )
        );
    }

    #[test]
    fn no_ack_mode_suppresses_acks_both_ways() {
        let mut s = server();
        let out = roundtrip(&mut s, "QStartNoAckMode");
        assert_eq!(out, "+$OK#9a");

        // From here on no '+' leads the replies.
        let out = roundtrip(&mut s, "qOffsets");
        assert_eq!(out, frame("Text=0;Data=0;Bss=0"));
        assert!(!out.contains('+'));
    }

    #[test]
    fn thread_switch_selects_core1() {
        let mut s = server();
        let out = roundtrip(&mut s, "Hg2");
        assert_eq!(out, "+$OK#9a");
        assert_eq!(s.target.current_core(), 1);

        // And an invalid thread is refused.
        let out = roundtrip(&mut s, "Hg7");
        assert_eq!(out, "+$E01#a6");
    }

    #[test]
    fn memory_read_is_little_endian_hex() {
        let mut s = server();
        // Attach first so the fake is powered and halted.
        let _ = roundtrip(&mut s, "qSupported");
        s.target.swd.engine_mut().seed_word(0x2000_0000, 0xDEAD_BEEF);

        let out = roundtrip(&mut s, "m20000000,4");
        assert_eq!(out, format!("+{}", frame("efbeadde")));
    }

    #[test]
    fn memory_write_round_trips() {
        let mut s = server();
        let out = roundtrip(&mut s, "M20000100,4:0d0c0b0a");
        assert_eq!(out, "+$OK#9a");
        assert_eq!(s.target.swd.engine_mut().word(0x2000_0100), 0x0A0B_0C0D);
    }

    #[test]
    fn registers_travel_as_le_words() {
        let mut s = server();
        let _ = roundtrip(&mut s, "qSupported");
        s.target.swd.engine_mut().core_mut(0).set_reg(0, 0x1234_5678);

        let out = roundtrip(&mut s, "p0");
        assert_eq!(out, format!("+{}", frame("78563412")));

        let out = roundtrip(&mut s, "P0f=00020010");
        assert_eq!(out, "+$OK#9a");
        assert_eq!(s.target.swd.engine_mut().core(0).reg(15), 0x1000_0200);

        let out = roundtrip(&mut s, "g");
        // 17 registers, r0 first.
        assert!(out.contains("78563412"));
        assert_eq!(out.len(), 1 + 1 + 17 * 8 + 3);
    }

    #[test]
    fn binary_memory_write_takes_escaped_bytes() {
        let mut s = server();
        let _ = roundtrip(&mut s, "qSupported");

        // Payload bytes 0x7d 0x23 0x2a 0x24 all need escaping on the
        // wire; build the frame by hand.
        let wire: &[u8] = b"X20000104,4:}\x5d}\x03}\x0a}\x04";
        let sum: u32 = wire.iter().map(|b| u32::from(*b)).sum();
        s.io.inbound.extend(b"$");
        s.io.inbound.extend(wire);
        s.io.inbound.extend(format!("#{:02x}", sum & 0xFF).as_bytes());
        for _ in 0..10 {
            if s.io.inbound.is_empty() {
                break;
            }
            s.poll();
        }
        assert_eq!(s.io.take_output(), "+$OK#9a");
        assert_eq!(s.target.swd.engine_mut().word(0x2000_0104), 0x242A_237D);

        // The zero-length probe succeeds without touching the bus.
        let out = roundtrip(&mut s, "X0,0:");
        assert_eq!(out, "+$OK#9a");
    }

    #[test]
    fn detach_restores_code_and_resumes() {
        let mut s = server();
        let _ = roundtrip(&mut s, "qSupported");
        s.target.swd.engine_mut().seed_word(0x2000_0300, 0xB510_2100);
        let _ = roundtrip(&mut s, "Z0,20000300,2");

        let out = roundtrip(&mut s, "D");
        assert_eq!(out, "+$OK#9a");
        assert_eq!(s.target.swd.engine_mut().word(0x2000_0300), 0xB510_2100);
        assert!(!s.target.swd.engine_mut().core(0).halted());
        assert!(!s.target.swd.engine_mut().core(1).halted());
    }

    #[test]
    fn software_breakpoints_patch_and_restore_code() {
        let mut s = server();
        let _ = roundtrip(&mut s, "qSupported");
        s.target.swd.engine_mut().seed_word(0x2000_0200, 0x4770_2100);

        let out = roundtrip(&mut s, "Z0,20000200,2");
        assert_eq!(out, "+$OK#9a");
        // Low halfword replaced by BKPT, upper untouched.
        assert_eq!(s.target.swd.engine_mut().word(0x2000_0200), 0x4770_BE11);

        // Setting it again is a no-op.
        let _ = roundtrip(&mut s, "Z0,20000200,2");
        assert_eq!(s.swbps.len(), 1);

        let out = roundtrip(&mut s, "z0,20000200,2");
        assert_eq!(out, "+$OK#9a");
        assert_eq!(s.target.swd.engine_mut().word(0x2000_0200), 0x4770_2100);
        assert!(s.swbps.is_empty());
    }

    #[test]
    fn hw_breakpoint_continue_reports_the_hit() {
        let mut s = server();
        let out = roundtrip(&mut s, "Z1,10001234,2");
        assert_eq!(out, "+$OK#9a");

        // Core 0 "hits the breakpoint" a few status polls in.
        s.target.swd.engine_mut().script_halt_after(0, 3, 1 << 1);
        let out = roundtrip(&mut s, "vCont;c");
        assert_eq!(out, format!("+{}", frame("T05thread:1;")));
    }

    #[test]
    fn interrupt_during_run_reports_sigint() {
        let mut s = server();
        let _ = roundtrip(&mut s, "qSupported");

        s.io.push_str(&frame("vCont;c"));
        s.io.inbound.push_back(0x03);
        for _ in 0..100 {
            if s.io.inbound.is_empty() {
                break;
            }
            s.poll();
        }
        let out = s.io.take_output();
        assert!(out.contains(&frame("T02thread:1;")), "got: {out}");
        assert!(s.target.swd.engine_mut().core(0).halted());
        assert!(s.target.swd.engine_mut().core(1).halted());
    }

    #[test]
    fn vcont_step_steps_only_the_named_core() {
        let mut s = server();
        let _ = roundtrip(&mut s, "qSupported");
        let pc_before = s.target.swd.engine_mut().core(0).reg(15);

        let out = roundtrip(&mut s, "vCont;s:1;c");
        // The step completes immediately and wins the poll race.
        assert_eq!(out, format!("+{}", frame("T05thread:1;")));
        assert_eq!(
            s.target.swd.engine_mut().core(0).reg(15),
            pc_before.wrapping_add(2)
        );
    }

    #[test]
    fn disconnect_during_run_halts_everything() {
        let mut s = server();
        let _ = roundtrip(&mut s, "qSupported");

        s.io.push_str(&frame("vCont;c"));
        s.io.drop_when_drained = true;
        for _ in 0..10 {
            s.poll();
        }
        assert!(s.target.swd.engine_mut().core(0).halted());
        assert!(s.target.swd.engine_mut().core(1).halted());
        assert!(!s.was_connected);
    }

    #[test]
    fn xfer_reads_are_chunked() {
        let mut s = server();
        let out = roundtrip(&mut s, "qXfer:features:read:target.xml:0,20");
        assert!(out.starts_with("+$m<?xml"), "got: {out}");

        let out = roundtrip(&mut s, "qXfer:threads:read::0,4000");
        assert!(out.starts_with("+$l<?xml"), "got: {out}");
        assert!(out.contains("rp2040.core0"));
    }

    #[test]
    fn symbol_exchange_feeds_get_to_main() {
        let mut s = server();
        let _ = roundtrip(&mut s, "qSupported");

        let out = roundtrip(&mut s, "qSymbol::");
        assert_eq!(out, format!("+{}", frame("qSymbol:6d61696e")));

        let out = roundtrip(&mut s, "qSymbol:10000100:6d61696e");
        assert_eq!(out, "+$OK#9a");
        assert_eq!(s.main_addr, Some(0x1000_0100));

        // monitor get_to_main: runs until the fake halts at "main".
        s.target.swd.engine_mut().script_halt_after(0, 2, 1 << 1);
        let out = roundtrip(&mut s, "qRcmd,6765745f746f5f6d61696e");
        assert_eq!(out, "+$OK#9a");
    }

    #[test]
    fn monitor_reset_halt_resets_the_core() {
        let mut s = server();
        let out = roundtrip(&mut s, "qRcmd,72657365742068616c74");
        assert_eq!(out, "+$OK#9a");
        assert!(s.target.swd.engine_mut().core(0).halted());
    }

    #[test]
    fn flash_staging_programs_on_done() {
        let mut s = server();
        let _ = roundtrip(&mut s, "qSupported");

        let out = roundtrip(&mut s, "vFlashErase:10040000,1000");
        assert_eq!(out, "+$OK#9a");

        s.io.push_str("$vFlashWrite:10040000:abcd#");
        let sum: u32 = b"vFlashWrite:10040000:abcd".iter().map(|b| u32::from(*b)).sum();
        s.io.push_str(&format!("{:02x}", sum & 0xFF));
        for _ in 0..100 {
            if s.io.inbound.is_empty() {
                break;
            }
            s.poll();
        }
        assert_eq!(s.io.take_output(), "+$OK#9a");

        let out = roundtrip(&mut s, "vFlashDone");
        assert_eq!(out, "+$OK#9a");

        let fake = s.target.swd.engine_mut();
        let tags: Vec<[u8; 2]> = fake
            .rom_calls()
            .iter()
            .map(|c| fake.rom_func_tag(c.func))
            .collect();
        assert_eq!(tags, vec![*b"IF", *b"EX", *b"RE", *b"RP", *b"FC", *b"CX"]);
        // The staged bytes landed in the SRAM staging area.
        assert_eq!(fake.byte(0x2000_0000), b'a');
        assert_eq!(fake.byte(0x2000_0003), b'd');
    }

    #[test]
    fn unknown_commands_get_the_empty_reply() {
        let mut s = server();
        let out = roundtrip(&mut s, "vMustReplyEmpty");
        assert_eq!(out, "+$#00");

        let out = roundtrip(&mut s, "Qfantasy");
        assert_eq!(out, "+$#00");
    }

    #[test]
    fn corrupt_packets_draw_a_nak() {
        let mut s = server();
        s.io.push_str("$qC#00");
        for _ in 0..10 {
            s.poll();
            if s.io.inbound.is_empty() {
                break;
            }
        }
        assert_eq!(s.io.take_output(), "-");
    }

    #[test]
    fn halt_reason_query_reports_a_stop_packet() {
        let mut s = server();
        let out = roundtrip(&mut s, "?");
        // Both cores were reset-halted on attach; reason Reset maps to
        // SIGTRAP.
        assert_eq!(out, format!("+{}", frame("T05thread:1;")));
    }
}
