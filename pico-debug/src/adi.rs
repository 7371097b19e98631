//! DP/AP transaction layer.
//!
//! Typed access to debug-port and access-port registers on top of the raw
//! transceiver: SELECT/CSW caching, WAIT retries, debug-domain power-up
//! and the multidrop target-select dance that addresses the two RP2040
//! cores sharing one bus.

use bitfield::bitfield;

use crate::config::ProbeConfig;
use crate::rp2040;
use crate::swd::{Port, Swd, SwdError, WireEngine};
use crate::{Error, Result};

/// DPIDR (read) / ABORT (write) at address 0x0.
pub const DP_DPIDR: u8 = 0x00;
/// ABORT register (write only).
pub const DP_ABORT: u8 = 0x00;
/// CTRL/STAT, bank 0.
pub const DP_CTRL_STAT: u8 = 0x04;
/// SELECT register (write only).
pub const DP_SELECT: u8 = 0x08;
/// RDBUFF (read only): result of the previous AP read.
pub const DP_RDBUFF: u8 = 0x0C;
/// TARGETID, bank 2 of address 0x4.
pub const DP_TARGETID: u8 = 0x24;
/// DLPIDR, bank 3 of address 0x4; carries the multidrop instance id.
pub const DP_DLPIDR: u8 = 0x34;

bitfield! {
    /// DP ABORT register.
    #[derive(Clone, Copy)]
    pub struct Abort(u32);
    impl Debug;
    pub _, set_orunerrclr: 4;
    pub _, set_wderrclr: 3;
    pub _, set_stkerrclr: 2;
    pub _, set_stkcmpclr: 1;
    pub _, set_dapabort: 0;
}

impl Abort {
    /// The write-1-to-clear mask for every sticky error flag.
    pub fn clear_all() -> Self {
        let mut abort = Abort(0);
        abort.set_orunerrclr(true);
        abort.set_wderrclr(true);
        abort.set_stkerrclr(true);
        abort.set_stkcmpclr(true);
        abort
    }
}

bitfield! {
    /// DP CTRL/STAT register.
    #[derive(Clone, Copy)]
    pub struct Ctrl(u32);
    impl Debug;
    pub csyspwrupack, _: 31;
    pub csyspwrupreq, set_csyspwrupreq: 30;
    pub cdbgpwrupack, _: 29;
    pub cdbgpwrupreq, set_cdbgpwrupreq: 28;
    pub w_data_err, _: 7;
    pub sticky_err, _: 5;
    pub sticky_cmp, _: 4;
    pub sticky_orun, _: 1;
    pub orun_detect, set_orun_detect: 0;
}

impl Ctrl {
    fn any_sticky_error(&self) -> bool {
        self.sticky_err() || self.sticky_cmp() || self.sticky_orun() || self.w_data_err()
    }
}

bitfield! {
    /// DP SELECT register: active AP, AP bank and DP bank.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Select(u32);
    impl Debug;
    pub u8, ap_sel, set_ap_sel: 31, 24;
    pub u8, ap_bank_sel, set_ap_bank_sel: 7, 4;
    pub u8, dp_bank_sel, set_dp_bank_sel: 3, 0;
}

/// Run state of one target core, as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    /// Not yet observed since connect.
    #[default]
    Unknown,
    /// The core is executing instructions.
    Running,
    /// The core is in debug state.
    Halted,
}

/// Why a core last entered debug state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HaltReason {
    /// No recorded cause.
    #[default]
    Unknown,
    /// Halt requested over the debug port (or a host interrupt).
    DebugRequest,
    /// A breakpoint comparator or BKPT instruction fired.
    Breakpoint,
    /// A single step completed.
    Step,
    /// Reset vector catch.
    Reset,
    /// A watchpoint fired.
    Watchpoint,
    /// Some other architected vector catch.
    ExceptionCatch,
}

/// Sentinel for empty breakpoint slots and unseeded caches.
pub(crate) const SENTINEL: u32 = 0xFFFF_FFFF;

const MEM_CACHE_SIZE: usize = 4;
pub(crate) const REG_CACHE_SIZE: usize = 24;
pub(crate) const HW_BREAKPOINTS: usize = 4;

/// Per-core state: selection caches, register/memory caches and the
/// hardware breakpoint table. Exactly two exist, one per RP2040 core.
#[derive(Debug, Clone)]
pub(crate) struct CoreContext {
    pub state: RunState,
    pub reason: HaltReason,
    pub dp_select_cache: u32,
    pub ap_mem_csw_cache: u32,
    pub breakpoints: [u32; HW_BREAKPOINTS],
    pub bp_unit_enabled: bool,
    /// The last resume request was a single step; lets the halt-reason
    /// decode tell a completed step apart from a plain halt request.
    pub stepping: bool,
    pub reg_cache: [Option<u32>; REG_CACHE_SIZE],
    mem_cache: [(u32, u32); MEM_CACHE_SIZE],
    mem_cache_pos: usize,
}

impl CoreContext {
    fn new() -> Self {
        Self {
            state: RunState::Unknown,
            reason: HaltReason::Unknown,
            dp_select_cache: SENTINEL,
            ap_mem_csw_cache: SENTINEL,
            breakpoints: [SENTINEL; HW_BREAKPOINTS],
            bp_unit_enabled: false,
            stepping: false,
            reg_cache: [None; REG_CACHE_SIZE],
            mem_cache: [(SENTINEL, 0); MEM_CACHE_SIZE],
            mem_cache_pos: 0,
        }
    }

    pub fn mem_cache_find(&self, addr: u32) -> Option<u32> {
        self.mem_cache
            .iter()
            .find(|(a, _)| *a == addr)
            .map(|(_, v)| *v)
    }

    pub fn mem_cache_add(&mut self, addr: u32, value: u32) {
        self.mem_cache[self.mem_cache_pos] = (addr, value);
        self.mem_cache_pos = (self.mem_cache_pos + 1) % MEM_CACHE_SIZE;
    }

    pub fn mem_cache_clear(&mut self) {
        self.mem_cache = [(SENTINEL, 0); MEM_CACHE_SIZE];
        self.mem_cache_pos = 0;
    }

    pub fn reg_cache_clear(&mut self) {
        self.reg_cache = [None; REG_CACHE_SIZE];
    }
}

/// WAIT retry budget for a single transaction.
const WAIT_RETRIES: usize = 10;
/// Attempts for the power-up handshake.
const POWER_UP_RETRIES: usize = 10;
/// Attempts for the initial connect, the last one after a rescue reset.
const CONNECT_ATTEMPTS: usize = 3;

/// The remote RP2040 as seen through the debug bus.
///
/// Owns the transceiver, both [`CoreContext`]s and the current-core
/// pointer. The memory layer, CPU debug control and the ROM trampoline
/// are further `impl` blocks on this type in their own modules.
pub struct Target<E: WireEngine> {
    pub(crate) swd: Swd<E>,
    pub(crate) config: ProbeConfig,
    pub(crate) cores: [CoreContext; 2],
    pub(crate) trampoline: Option<rp2040::Trampoline>,
    current: usize,
    attached: bool,
}

impl<E: WireEngine> Target<E> {
    /// Wrap a wire engine. No bus traffic happens until [`Target::connect`].
    pub fn new(engine: E, config: ProbeConfig) -> Self {
        Self {
            swd: Swd::new(engine, config.clock_divider),
            config,
            cores: [CoreContext::new(), CoreContext::new()],
            trampoline: None,
            current: 0,
            attached: false,
        }
    }

    /// Index of the currently selected core.
    pub fn current_core(&self) -> usize {
        self.current
    }

    pub(crate) fn core(&mut self) -> &mut CoreContext {
        &mut self.cores[self.current]
    }

    /// Retry wrapper: WAIT responses are retried with an unchanged
    /// request up to the budget; everything else surfaces.
    fn swd_read(&mut self, port: Port, addr: u8) -> Result<u32> {
        for _ in 0..WAIT_RETRIES {
            match self.swd.raw_read(port, addr) {
                Err(SwdError::Wait) => continue,
                other => return other.map_err(Error::from),
            }
        }
        Err(Error::Swd(SwdError::Wait))
    }

    fn swd_write(&mut self, port: Port, addr: u8, value: u32) -> Result<()> {
        for _ in 0..WAIT_RETRIES {
            match self.swd.raw_write(port, addr, value) {
                Err(SwdError::Wait) => continue,
                other => return other.map_err(Error::from),
            }
        }
        Err(Error::Swd(SwdError::Wait))
    }

    /// Update DPBANKSEL if the cached SELECT disagrees.
    fn dp_select_bank(&mut self, bank: u8) -> Result<()> {
        let cached = self.core().dp_select_cache;
        if cached & 0xF != u32::from(bank) {
            let select = (cached & 0xFFFF_FFF0) | u32::from(bank);
            self.core().dp_select_cache = select;
            tracing::trace!(select = format_args!("{select:#010x}"), "updating DPBANKSEL");
            self.swd_write(Port::Dp, DP_SELECT, select)?;
        }
        Ok(())
    }

    /// Update APSEL and APBANKSEL if the cached SELECT disagrees.
    fn ap_select_with_bank(&mut self, ap: u8, bank_bits: u8) -> Result<()> {
        let cached = self.core().dp_select_cache;
        let wanted = (u32::from(ap) << 24) | u32::from(bank_bits);
        if cached & 0xFF00_00F0 != wanted {
            let select = wanted | (cached & 0xF);
            self.core().dp_select_cache = select;
            tracing::trace!(select = format_args!("{select:#010x}"), "updating AP select");
            self.swd_write(Port::Dp, DP_SELECT, select)?;
        }
        Ok(())
    }

    /// Read a DP register. Addresses with a low nibble of 4 are banked;
    /// bits [7:4] of `addr` carry the bank.
    pub fn dp_read(&mut self, addr: u8) -> Result<u32> {
        if addr & 0x0F == 4 {
            self.dp_select_bank(addr >> 4)?;
        }
        self.swd_read(Port::Dp, addr & 0xF)
    }

    /// Write a DP register, switching DPBANKSEL when needed.
    pub fn dp_write(&mut self, addr: u8, value: u32) -> Result<()> {
        if addr & 0x0F == 4 {
            self.dp_select_bank(addr >> 4)?;
        }
        self.swd_write(Port::Dp, addr & 0xF, value)
    }

    /// Read an AP register: select AP/bank, issue the access and fetch
    /// the latched result through RDBUFF.
    pub fn ap_read(&mut self, ap: u8, addr: u8) -> Result<u32> {
        self.ap_read_defer(ap, addr)?;
        self.ap_read_last()
    }

    /// Pipelined AP read: the returned word is the result of the
    /// *previous* AP read. Finish a run with [`Target::ap_read_last`].
    ///
    /// A pipeline abandoned mid-way (error return) leaves a stale word in
    /// RDBUFF; that is harmless because every fresh read sequence discards
    /// the first value it pulls.
    pub fn ap_read_defer(&mut self, ap: u8, addr: u8) -> Result<u32> {
        self.ap_select_with_bank(ap, addr & 0xF0)?;
        self.swd_read(Port::Ap, addr & 0xC)
    }

    /// Flush the deferred-read pipeline via RDBUFF.
    pub fn ap_read_last(&mut self) -> Result<u32> {
        self.swd_read(Port::Dp, DP_RDBUFF)
    }

    /// Write an AP register.
    pub fn ap_write(&mut self, ap: u8, addr: u8, value: u32) -> Result<()> {
        self.ap_select_with_bank(ap, addr & 0xF0)?;
        self.swd_write(Port::Ap, addr & 0xC, value)
    }

    /// Clear every sticky error flag via ABORT.
    pub fn clear_sticky_errors(&mut self) -> Result<()> {
        self.swd_write(Port::Dp, DP_ABORT, Abort::clear_all().0)
    }

    /// Power up the debug and system domains of the current core's DP.
    pub fn power_up(&mut self) -> Result<()> {
        self.clear_sticky_errors()?;

        for attempt in 0..POWER_UP_RETRIES {
            let mut req = Ctrl(0);
            req.set_cdbgpwrupreq(true);
            req.set_csyspwrupreq(true);
            if self.dp_write(DP_CTRL_STAT, req.0).is_err() {
                continue;
            }
            let Ok(stat) = self.dp_read(DP_CTRL_STAT) else {
                continue;
            };
            let stat = Ctrl(stat);
            if stat.any_sticky_error() {
                tracing::debug!(attempt, ctrl = format_args!("{:#010x}", stat.0), "sticky errors during power-up");
                let _ = self.clear_sticky_errors();
                continue;
            }
            if stat.cdbgpwrupack() && stat.csyspwrupack() {
                tracing::debug!("debug domains powered up");
                return Ok(());
            }
        }
        Err(Error::PowerUpFailed)
    }

    /// Select one of the two cores via the multidrop TARGETSEL sequence
    /// and validate the switch against DLPIDR.
    pub fn select_core(&mut self, index: usize) -> Result<()> {
        assert!(index < 2);
        if self.attached && self.current == index {
            return Ok(());
        }
        tracing::debug!(core = index, "selecting core");

        let targetsel = rp2040::CORE_TARGETSEL[index];
        self.swd.line_reset();
        self.swd.target_select(targetsel);

        // Reading DPIDR is what re-enables the interface after the reset.
        self.swd_read(Port::Dp, DP_DPIDR)?;
        self.swd_write(Port::Dp, DP_ABORT, Abort::clear_all().0)?;

        // The line reset above cleared DPBANKSEL on the target, so the
        // incoming core's SELECT cache must be reseeded.
        self.current = index;
        self.attached = true;
        self.core().dp_select_cache = SENTINEL;

        let dlpidr = self.dp_read(DP_DLPIDR)?;
        if dlpidr & 0xF000_0000 != targetsel & 0xF000_0000 {
            self.attached = false;
            return Err(Error::CoreSelectFailed { targetsel, dlpidr });
        }
        Ok(())
    }

    /// Drive a hardware reset through the rescue DP.
    pub fn rescue_reset(&mut self) -> Result<()> {
        tracing::info!("attempting rescue-DP reset");
        self.swd.wake_from_dormant();
        self.swd.line_reset();
        self.swd.target_select(rp2040::RESCUE_TARGETSEL);
        self.swd_read(Port::Dp, DP_DPIDR)?;

        // Toggling the debug power request through the rescue DP resets
        // the chip.
        let mut req = Ctrl(0);
        req.set_cdbgpwrupreq(true);
        self.swd_write(Port::Dp, DP_CTRL_STAT, req.0)?;
        self.swd_write(Port::Dp, DP_CTRL_STAT, 0)?;

        // Flush the write and give the part time to come back.
        self.swd.send_bits(&[0, 0, 0], 72);
        Ok(())
    }

    /// Full bring-up: wake from dormant, attach to core 0, power both
    /// cores' debug domains and enable halting debug on each, ending with
    /// core 0 selected. Falls back to a rescue reset on the last attempt.
    pub fn connect(&mut self) -> Result<()> {
        for core in &mut self.cores {
            *core = CoreContext::new();
        }
        self.current = 0;
        self.attached = false;
        self.trampoline = None;

        let mut last_err = Error::Swd(SwdError::Protocol);
        let mut connected = false;
        for attempt in 0..CONNECT_ATTEMPTS {
            if attempt == CONNECT_ATTEMPTS - 1 {
                if let Err(e) = self.rescue_reset() {
                    tracing::warn!("rescue reset failed: {e}");
                }
            }

            self.swd.wake_from_dormant();
            self.swd.line_reset();
            self.swd.target_select(rp2040::CORE_TARGETSEL[0]);

            let dpidr = match self.swd_read(Port::Dp, DP_DPIDR) {
                Ok(v) => v,
                Err(e) => {
                    tracing::debug!(attempt, "DPIDR read failed: {e}");
                    last_err = e;
                    continue;
                }
            };
            tracing::debug!(attempt, dpidr = format_args!("{dpidr:#010x}"), "attached");

            let brought_up = self
                .swd_write(Port::Dp, DP_ABORT, Abort::clear_all().0)
                .and_then(|()| self.swd_write(Port::Dp, DP_SELECT, 0))
                .and_then(|()| self.swd_read(Port::Dp, DP_CTRL_STAT));
            match brought_up {
                Ok(_) => {
                    connected = true;
                    break;
                }
                Err(e) => last_err = e,
            }
        }
        if !connected {
            return Err(last_err);
        }

        self.attached = true;
        self.cores[0].dp_select_cache = 0;

        self.power_up()?;
        self.enable_debug()?;
        self.select_core(1)?;
        self.power_up()?;
        self.enable_debug()?;
        self.select_core(0)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fake::FakeRp2040;
    use pretty_assertions::assert_eq;

    fn attached_target() -> Target<FakeRp2040> {
        let mut target = Target::new(FakeRp2040::new(), ProbeConfig::default());
        target.connect().expect("connect failed");
        target
    }

    #[test]
    fn connect_powers_up_both_cores_and_reselects_core0() {
        let mut target = attached_target();
        assert_eq!(target.current_core(), 0);

        let fake = target.swd.engine_mut();
        assert!(fake.dp(0).powered_up());
        assert!(fake.dp(1).powered_up());
        assert!(fake.core(0).debug_enabled());
        assert!(fake.core(1).debug_enabled());
    }

    #[test]
    fn select_writes_track_distinct_tuples_only() {
        let mut target = attached_target();
        target.swd.engine_mut().clear_log();

        // Several accesses within one (ap, ap-bank, dp-bank) tuple after
        // the first must not touch SELECT again.
        target.ap_write(0, 0x04, 0x2000_0000).unwrap();
        target.ap_write(0, 0x04, 0x2000_0004).unwrap();
        target.ap_read(0, 0x0C).unwrap();
        assert_eq!(target.swd.engine_mut().select_write_count(), 1);

        // Each change of DP bank costs exactly one SELECT update; AP
        // accesses in between don't, as long as the AP fields are stable.
        target.dp_read(DP_TARGETID).unwrap();
        target.ap_read(0, 0x0C).unwrap();
        target.dp_read(DP_DLPIDR).unwrap();
        target.ap_read(0, 0x0C).unwrap();
        assert_eq!(target.swd.engine_mut().select_write_count(), 3);
    }

    #[test]
    fn select_core_checks_dlpidr_instance() {
        let mut target = attached_target();

        target.select_core(1).unwrap();
        assert_eq!(target.current_core(), 1);

        // Re-selecting the same core is a pure cache hit.
        target.swd.engine_mut().clear_log();
        target.select_core(1).unwrap();
        assert_eq!(target.swd.engine_mut().transaction_count(), 0);

        // A target that answers with the wrong instance id is rejected.
        target.swd.engine_mut().corrupt_dlpidr(0);
        let err = target.select_core(0).unwrap_err();
        assert!(matches!(err, Error::CoreSelectFailed { .. }));
    }

    #[test]
    fn wait_responses_are_retried_with_a_budget() {
        let mut target = attached_target();

        // A handful of WAITs is absorbed by the retry loop.
        target.swd.engine_mut().inject_waits(4);
        assert!(target.dp_read(DP_CTRL_STAT).is_ok());

        // More WAITs than the budget surface as a bus error.
        target.swd.engine_mut().inject_waits(50);
        let err = target.dp_read(DP_CTRL_STAT).unwrap_err();
        assert!(matches!(err, Error::Swd(SwdError::Wait)));
    }
}
