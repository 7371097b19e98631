//! Cortex-M0+ debug control.
//!
//! Halting, stepping, register access through the debug communication
//! registers, the four-slot hardware breakpoint unit, reset-with-halt via
//! vector catch and the cross-core stop-the-world poll.

use bitfield::bitfield;

use crate::adi::{HaltReason, RunState, Target, SENTINEL};
use crate::swd::WireEngine;
use crate::{Error, Result};

bitfield! {
    /// Debug Halting Control and Status Register (armv6-M C1.6.3).
    ///
    /// Writes only take effect with the debug key set via
    /// [`Dhcsr::enable_write`].
    #[derive(Copy, Clone)]
    pub struct Dhcsr(u32);
    impl Debug;
    /// At least one reset since the last read; sticky, clears on read.
    pub s_reset_st, _: 25;
    /// The processor is locked up on an unrecoverable exception.
    pub s_lockup, _: 19;
    /// The processor is sleeping.
    pub s_sleep, _: 18;
    /// The processor is in debug state.
    pub s_halt, _: 17;
    /// Handshake flag for DCRSR/DCRDR transfers.
    pub s_regrdy, _: 16;
    /// Mask PendSV, SysTick and external interrupts while halted/stepping.
    pub c_maskints, set_c_maskints: 3;
    /// Single-step enable.
    pub c_step, set_c_step: 2;
    /// Halt request.
    pub c_halt, set_c_halt: 1;
    /// Halting-debug enable.
    pub c_debugen, set_c_debugen: 0;
}

impl Dhcsr {
    /// Place the debug key in bits [31:16]; without it writes are ignored.
    pub fn enable_write(&mut self) {
        self.0 = (self.0 & 0xFFFF) | (0xA05F << 16);
    }

    /// Debug register block base.
    pub const ADDRESS: u32 = 0xE000_EDF0;
}

/// Debug Core Register Selector register.
#[derive(Debug, Copy, Clone)]
pub struct Dcrsr;

impl Dcrsr {
    pub const ADDRESS: u32 = 0xE000_EDF4;
    /// Set for a register write, clear for a read.
    pub const REGWNR: u32 = 1 << 16;
}

/// Debug Core Register Data register.
#[derive(Debug, Copy, Clone)]
pub struct Dcrdr;

impl Dcrdr {
    pub const ADDRESS: u32 = 0xE000_EDF8;
}

bitfield! {
    /// Debug Exception and Monitor Control Register.
    #[derive(Copy, Clone)]
    pub struct Demcr(u32);
    impl Debug;
    /// Global DWT enable.
    pub dwtena, set_dwtena: 24;
    /// Halt on reset vector fetch.
    pub vc_corereset, set_vc_corereset: 0;
}

impl Demcr {
    pub const ADDRESS: u32 = 0xE000_EDFC;
}

bitfield! {
    /// Application Interrupt and Reset Control Register.
    #[derive(Copy, Clone)]
    pub struct Aircr(u32);
    impl Debug;
    get_vectkeystat, set_vectkey: 31, 16;
    /// Request a system reset.
    pub sysresetreq, set_sysresetreq: 2;
}

impl Aircr {
    pub const ADDRESS: u32 = 0xE000_ED0C;

    /// The key that must accompany every AIRCR write.
    pub fn vectkey(&mut self) {
        self.set_vectkey(0x05FA);
    }
}

bitfield! {
    /// Debug Fault Status Register; all bits are sticky, write-1-to-clear.
    #[derive(Copy, Clone)]
    pub struct Dfsr(u32);
    impl Debug;
    /// External debug request.
    pub external, _: 4;
    /// Vector catch triggered.
    pub vcatch, _: 3;
    /// DWT comparator match.
    pub dwttrap, _: 2;
    /// Breakpoint (BPU comparator or BKPT instruction).
    pub bkpt, _: 1;
    /// C_HALT or C_STEP request.
    pub halted, _: 0;
}

impl Dfsr {
    pub const ADDRESS: u32 = 0xE000_ED30;

    fn clear_all() -> u32 {
        0x1F
    }

    /// Map the sticky fault bits to a halt reason. `stepping` tells us a
    /// single step was the last resume request, which DFSR itself cannot
    /// distinguish from a plain halt.
    fn halt_reason(&self, stepping: bool) -> HaltReason {
        if self.bkpt() {
            HaltReason::Breakpoint
        } else if self.dwttrap() {
            HaltReason::Watchpoint
        } else if self.vcatch() {
            HaltReason::ExceptionCatch
        } else if self.halted() {
            if stepping {
                HaltReason::Step
            } else {
                HaltReason::DebugRequest
            }
        } else if self.external() {
            HaltReason::DebugRequest
        } else {
            HaltReason::Unknown
        }
    }
}

bitfield! {
    /// Breakpoint Control register.
    #[derive(Copy, Clone)]
    pub struct BpCtrl(u32);
    impl Debug;
    /// Number of implemented comparators.
    pub u8, num_code, _: 7, 4;
    /// Must be written as one for the write to take effect.
    pub key, set_key: 1;
    /// BPU global enable.
    pub enable, set_enable: 0;
}

impl BpCtrl {
    pub const ADDRESS: u32 = 0xE000_2000;
}

bitfield! {
    /// Breakpoint Comparator register.
    #[derive(Copy, Clone)]
    pub struct BpCompx(u32);
    impl Debug;
    /// 01: match lower halfword, 10: match upper halfword.
    pub u8, bp_match, set_bp_match: 31, 30;
    /// Bits [28:2] of the comparison address.
    pub comp, set_comp: 28, 2;
    /// Comparator enable.
    pub enable, set_enable: 0;
}

impl BpCompx {
    pub const ADDRESS: u32 = 0xE000_2008;

    /// Comparator word for a halfword-aligned code address.
    fn for_address(addr: u32) -> Self {
        let mut comp = BpCompx(0);
        comp.set_bp_match(if addr & 2 != 0 { 0b10 } else { 0b01 });
        comp.set_comp((addr >> 2) & 0x07FF_FFFF);
        comp.set_enable(true);
        comp
    }
}

/// Core register selector values for DCRSR.
pub const REG_PC: usize = 15;
pub const REG_LR: usize = 14;
pub const REG_XPSR: usize = 16;
pub const REG_MSP: usize = 17;

impl<E: WireEngine> Target<E> {
    fn write_dhcsr(&mut self, f: impl FnOnce(&mut Dhcsr)) -> Result<()> {
        let mut value = Dhcsr(0);
        value.set_c_debugen(true);
        f(&mut value);
        value.enable_write();
        self.write32(Dhcsr::ADDRESS, value.0)
    }

    fn invalidate_caches(&mut self) {
        self.core().reg_cache_clear();
        self.core().mem_cache_clear();
    }

    /// Enable halting debug on the current core.
    pub fn enable_debug(&mut self) -> Result<()> {
        self.write_dhcsr(|_| {})
    }

    /// Is the current core in debug state right now? Always hits the bus.
    pub fn is_halted(&mut self) -> Result<bool> {
        Ok(Dhcsr(self.read32(Dhcsr::ADDRESS)?).s_halt())
    }

    /// Halt the current core and wait for it to enter debug state.
    pub fn halt(&mut self) -> Result<()> {
        self.invalidate_caches();
        self.write_dhcsr(|d| {
            d.set_c_halt(true);
            d.set_c_maskints(true);
        })?;
        while !self.is_halted()? {}
        Ok(())
    }

    /// Let the current core run.
    pub fn resume(&mut self) -> Result<()> {
        tracing::debug!(core = self.current_core(), "resume");
        self.invalidate_caches();
        self.core().stepping = false;
        self.write_dhcsr(|_| {})?;
        self.core().state = RunState::Running;
        Ok(())
    }

    /// Let the current core run with PendSV/SysTick/external interrupts
    /// masked; used while executing ROM routines on the target.
    pub fn resume_with_masked_interrupts(&mut self) -> Result<()> {
        tracing::debug!(core = self.current_core(), "resume (interrupts masked)");
        self.invalidate_caches();
        self.core().stepping = false;
        self.write_dhcsr(|d| d.set_c_maskints(true))?;
        self.core().state = RunState::Running;
        Ok(())
    }

    /// Execute a single instruction. Does not wait for the step to
    /// complete; the caller polls.
    pub fn step(&mut self) -> Result<()> {
        tracing::debug!(core = self.current_core(), "step");
        self.invalidate_caches();
        self.core().stepping = true;
        self.write_dhcsr(|d| {
            d.set_c_step(true);
            d.set_c_maskints(true);
        })?;
        self.core().state = RunState::Running;
        Ok(())
    }

    /// Read a core register through DCRSR/DCRDR, with caching.
    pub fn read_reg(&mut self, reg: usize) -> Result<u32> {
        if let Some(value) = self.core().reg_cache[reg] {
            return Ok(value);
        }

        self.write32(Dcrsr::ADDRESS, (reg as u32) & 0x1F)?;
        while !Dhcsr(self.read32(Dhcsr::ADDRESS)?).s_regrdy() {}
        let value = self.read32(Dcrdr::ADDRESS)?;

        self.core().reg_cache[reg] = Some(value);
        Ok(value)
    }

    /// Write a core register through DCRSR/DCRDR.
    pub fn write_reg(&mut self, reg: usize, value: u32) -> Result<()> {
        self.write32(Dcrdr::ADDRESS, value)?;
        self.write32(Dcrsr::ADDRESS, Dcrsr::REGWNR | ((reg as u32) & 0x1F))?;
        while !Dhcsr(self.read32(Dhcsr::ADDRESS)?).s_regrdy() {}

        self.core().reg_cache[reg] = Some(value);
        Ok(())
    }

    fn bp_comp_address(slot: usize) -> u32 {
        BpCompx::ADDRESS + (slot as u32) * 4
    }

    fn breakpoint_slot(&mut self, addr: u32) -> Option<usize> {
        self.core().breakpoints.iter().position(|&a| a == addr)
    }

    /// Install a hardware breakpoint, first-free-slot assignment.
    /// Setting an address twice occupies a single slot.
    pub fn breakpoint_set(&mut self, addr: u32) -> Result<()> {
        if self.breakpoint_slot(addr).is_some() {
            return Ok(());
        }
        let Some(slot) = self.breakpoint_slot(SENTINEL) else {
            return Err(Error::BreakpointUnavailable);
        };

        tracing::debug!(addr = format_args!("{addr:#010x}"), slot, "set hw breakpoint");
        self.core().breakpoints[slot] = addr;
        self.write32(Self::bp_comp_address(slot), BpCompx::for_address(addr).0)?;

        if !self.core().bp_unit_enabled {
            let mut ctrl = BpCtrl(0);
            ctrl.set_key(true);
            ctrl.set_enable(true);
            self.write32(BpCtrl::ADDRESS, ctrl.0)?;
            self.core().bp_unit_enabled = true;
        }
        Ok(())
    }

    /// Remove a hardware breakpoint. Clearing an absent address is a
    /// no-op.
    pub fn breakpoint_clear(&mut self, addr: u32) -> Result<()> {
        let Some(slot) = self.breakpoint_slot(addr) else {
            return Ok(());
        };
        tracing::debug!(addr = format_args!("{addr:#010x}"), slot, "clear hw breakpoint");
        self.core().breakpoints[slot] = SENTINEL;

        let reg = Self::bp_comp_address(slot);
        self.write32(reg, 0)?;
        // The comparator occasionally needs a second nudge; confirm with
        // a read-back instead of blindly writing twice.
        if BpCompx(self.read32(reg)?).enable() {
            self.write32(reg, 0)?;
        }
        Ok(())
    }

    /// Is a hardware breakpoint installed at `addr`?
    pub fn is_breakpoint_set(&mut self, addr: u32) -> bool {
        self.breakpoint_slot(addr).is_some()
    }

    /// Single-step the current core even when a hardware breakpoint sits
    /// on the current PC: the comparator is disabled around the step and
    /// reinstated into the same slot.
    pub fn step_over_breakpoint(&mut self) -> Result<()> {
        let pc = self.read_reg(REG_PC)?;
        let slot = self.breakpoint_slot(pc);

        if let Some(slot) = slot {
            self.write32(Self::bp_comp_address(slot), 0)?;
        }
        self.step()?;
        if let Some(slot) = slot {
            let addr = self.cores[self.current_core()].breakpoints[slot];
            self.write32(Self::bp_comp_address(slot), BpCompx::for_address(addr).0)?;
        }
        Ok(())
    }

    /// Reset the current core and catch it at the reset vector.
    pub fn reset_halt(&mut self) -> Result<()> {
        tracing::info!(core = self.current_core(), "reset and halt");
        self.invalidate_caches();
        self.halt()?;

        let mut demcr = Demcr(0);
        demcr.set_dwtena(true);
        demcr.set_vc_corereset(true);
        self.write32(Demcr::ADDRESS, demcr.0)?;

        let mut aircr = Aircr(0);
        aircr.vectkey();
        aircr.set_sysresetreq(true);
        self.write32(Aircr::ADDRESS, aircr.0)?;

        // The reset flag asserts and then clears once the catch has
        // fired.
        while !Dhcsr(self.read32(Dhcsr::ADDRESS)?).s_reset_st() {}
        while Dhcsr(self.read32(Dhcsr::ADDRESS)?).s_reset_st() {}

        demcr.set_vc_corereset(false);
        self.write32(Demcr::ADDRESS, demcr.0)?;

        // The halt and catch left sticky fault bits behind; clear them so
        // the next halt decodes cleanly.
        self.write32(Dfsr::ADDRESS, Dfsr::clear_all())?;

        // The caches were flushed before the reset but the DCRSR poll
        // loop above may have repopulated the memory cache.
        self.invalidate_caches();
        let core = self.core();
        core.state = RunState::Halted;
        core.reason = HaltReason::Reset;
        core.stepping = false;
        Ok(())
    }

    /// Refresh the current core's observed run state, deriving a halt
    /// reason from DFSR on a running→halted transition.
    pub fn update_status(&mut self) -> Result<()> {
        let dhcsr = Dhcsr(self.read32(Dhcsr::ADDRESS)?);

        if !dhcsr.s_halt() {
            self.core().state = RunState::Running;
            return Ok(());
        }

        if self.core().state != RunState::Halted {
            let dfsr = Dfsr(self.read32(Dfsr::ADDRESS)?);
            self.write32(Dfsr::ADDRESS, Dfsr::clear_all())?;

            let stepping = self.core().stepping;
            let reason = dfsr.halt_reason(stepping);
            tracing::debug!(core = self.current_core(), ?reason, "core halted");

            let core = self.core();
            core.state = RunState::Halted;
            core.reason = reason;
            core.stepping = false;
            // Whatever ran before the halt may have changed memory.
            self.invalidate_caches();
        }
        Ok(())
    }

    /// Observed state and last halt reason of a core.
    pub fn core_status(&self, index: usize) -> (RunState, HaltReason) {
        (self.cores[index].state, self.cores[index].reason)
    }

    /// Poll both cores; when one has newly halted, halt the other as well
    /// so the debugger sees a consistent stopped world. Returns the index
    /// of the core that halted first. The originally selected core is
    /// reselected before returning.
    pub fn poll_cores(&mut self) -> Result<Option<usize>> {
        let cur = self.current_core();
        let other = 1 - cur;

        let before = self.core().state;
        self.update_status()?;
        let mut newly_halted =
            (self.core().state == RunState::Halted && before != RunState::Halted).then_some(cur);

        self.select_core(other)?;
        let before = self.core().state;
        self.update_status()?;
        if newly_halted.is_none()
            && self.core().state == RunState::Halted
            && before != RunState::Halted
        {
            newly_halted = Some(other);
        }

        if newly_halted.is_some() {
            if self.core().state != RunState::Halted {
                tracing::debug!(core = other, "halting to stop the world");
                self.halt()?;
                self.core().state = RunState::Halted;
            }
            self.select_core(cur)?;
            if self.core().state != RunState::Halted {
                tracing::debug!(core = cur, "halting to stop the world");
                self.halt()?;
                self.core().state = RunState::Halted;
            }
        } else {
            self.select_core(cur)?;
        }

        Ok(newly_halted)
    }
}
