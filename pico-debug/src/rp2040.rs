//! RP2040 specifics: multidrop target ids, the bootrom function table and
//! the debug trampoline used to run mask-ROM routines on the target.

use crate::adi::Target;
use crate::cortex::{REG_LR, REG_MSP, REG_PC, REG_XPSR};
use crate::swd::WireEngine;
use crate::{Error, Result};

/// TARGETSEL ids of the two processor cores.
pub const CORE_TARGETSEL: [u32; 2] = [0x0100_2927, 0x1100_2927];

/// TARGETSEL id of the rescue debug port.
pub const RESCUE_TARGETSEL: u32 = 0xF100_2927;

/// "Mu" + format version 1, found at [`BOOTROM_MAGIC_ADDR`].
const BOOTROM_MAGIC: u32 = 0x0001_754D;
const BOOTROM_MAGIC_ADDR: u32 = 0x0000_0010;
/// Halfword pointer to the function table lives right after the magic.
const BOOTROM_FUNC_TABLE_PTR: u32 = 0x0000_0014;

const XPSR_THUMB: u32 = 1 << 24;

/// How often a pending ROM routine is polled before giving up.
const ROM_CALL_POLLS: usize = 500;

/// One entry of the bootrom function table.
#[derive(Debug, Clone, Copy)]
pub struct RomFunc {
    /// Two-character lookup tag.
    pub tag: [u8; 2],
    /// Human-readable name, for errors and logs.
    pub name: &'static str,
}

pub const CONNECT_INTERNAL_FLASH: RomFunc = RomFunc { tag: *b"IF", name: "connect_internal_flash" };
pub const FLASH_EXIT_XIP: RomFunc = RomFunc { tag: *b"EX", name: "flash_exit_xip" };
pub const FLASH_RANGE_ERASE: RomFunc = RomFunc { tag: *b"RE", name: "flash_range_erase" };
pub const FLASH_RANGE_PROGRAM: RomFunc = RomFunc { tag: *b"RP", name: "flash_range_program" };
pub const FLASH_FLUSH_CACHE: RomFunc = RomFunc { tag: *b"FC", name: "flash_flush_cache" };
pub const FLASH_ENTER_CMD_XIP: RomFunc = RomFunc { tag: *b"CX", name: "flash_enter_cmd_xip" };
pub const DEBUG_TRAMPOLINE: RomFunc = RomFunc { tag: *b"DT", name: "debug_trampoline" };
pub const DEBUG_TRAMPOLINE_END: RomFunc = RomFunc { tag: *b"DE", name: "debug_trampoline_end" };

/// Cached trampoline entry/exit addresses, resolved once per session.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Trampoline {
    pub entry: u32,
    pub exit: u32,
}

impl<E: WireEngine> Target<E> {
    /// Look a routine up in the bootrom function table.
    pub fn find_rom_func(&mut self, func: RomFunc) -> Result<u32> {
        let magic = self.read32(BOOTROM_MAGIC_ADDR)?;
        if magic & 0x00FF_FFFF != BOOTROM_MAGIC {
            tracing::warn!(magic = format_args!("{magic:#010x}"), "bad bootrom magic");
            return Err(Error::RomFuncNotFound(func.name));
        }

        let tag = u16::from_le_bytes(func.tag);
        let mut entry = u32::from(self.read16(BOOTROM_FUNC_TABLE_PTR)?);
        loop {
            let candidate = self.read16(entry)?;
            if candidate == 0 {
                return Err(Error::RomFuncNotFound(func.name));
            }
            if candidate == tag {
                let addr = u32::from(self.read16(entry + 2)?);
                tracing::debug!(func = func.name, addr = format_args!("{addr:#06x}"), "rom func");
                return Ok(addr);
            }
            entry += 4;
        }
    }

    fn trampoline(&mut self) -> Result<Trampoline> {
        if let Some(t) = self.trampoline {
            return Ok(t);
        }
        let t = Trampoline {
            entry: self.find_rom_func(DEBUG_TRAMPOLINE)?,
            exit: self.find_rom_func(DEBUG_TRAMPOLINE_END)?,
        };
        self.trampoline = Some(t);
        Ok(t)
    }

    /// Invoke a ROM routine on the halted current core.
    ///
    /// Arguments land in r0..r3 and the routine address in r7; the
    /// trampoline calls through r7 and ends on a breakpoint at its exit
    /// tag, which brings the core back into debug state. `yield_now` is
    /// called between halt polls so the caller's I/O pumps keep running
    /// while the routine executes.
    pub fn call_function(
        &mut self,
        addr: u32,
        args: &[u32],
        yield_now: &mut dyn FnMut(),
    ) -> Result<()> {
        debug_assert!(args.len() <= 4);
        tracing::debug!(
            addr = format_args!("{addr:#010x}"),
            ?args,
            "calling rom routine"
        );

        let trampoline = self.trampoline()?;

        self.write_reg(7, addr)?;
        for (i, arg) in args.iter().enumerate() {
            self.write_reg(i, *arg)?;
        }
        self.write_reg(REG_PC, trampoline.entry)?;
        self.write_reg(REG_LR, trampoline.exit)?;
        let stack = self.config.trampoline_stack;
        self.write_reg(REG_MSP, stack)?;
        self.write_reg(REG_XPSR, XPSR_THUMB)?;

        self.resume_with_masked_interrupts()?;

        for _ in 0..ROM_CALL_POLLS {
            if self.is_halted()? {
                self.update_status()?;
                return Ok(());
            }
            yield_now();
        }
        Err(Error::FlashTimeout)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ProbeConfig;
    use crate::fake::FakeRp2040;
    use pretty_assertions::assert_eq;

    fn target() -> Target<FakeRp2040> {
        let mut target = Target::new(FakeRp2040::new(), ProbeConfig::default());
        target.connect().unwrap();
        target
    }

    #[test]
    fn rom_funcs_resolve_through_the_table() {
        let mut t = target();
        let addr = t.find_rom_func(CONNECT_INTERNAL_FLASH).unwrap();
        assert_eq!(addr, t.swd.engine_mut().rom_func_addr(*b"IF"));

        let missing = RomFunc { tag: *b"ZZ", name: "nonexistent" };
        assert!(matches!(
            t.find_rom_func(missing).unwrap_err(),
            Error::RomFuncNotFound("nonexistent")
        ));
    }

    #[test]
    fn call_function_stages_registers_and_returns_on_halt() {
        let mut t = target();
        t.halt().unwrap();

        t.call_function(0x1234, &[7, 8], &mut || {}).unwrap();

        let calls = t.swd.engine_mut().rom_calls().to_vec();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].func, 0x1234);
        assert_eq!(calls[0].args[..2], [7, 8]);
        assert_eq!(
            calls[0].stack,
            ProbeConfig::default().trampoline_stack
        );
        // Core is halted again at the trampoline end breakpoint.
        assert!(t.swd.engine_mut().core(0).halted());
    }
}
