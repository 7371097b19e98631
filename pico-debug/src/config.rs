//! Probe configuration.
//!
//! Everything the core needs to know that is board- or policy-specific
//! lives here. Persistence of these values (flash config store, shell
//! `set` commands) is owned by the surrounding firmware.

use serde::{Deserialize, Serialize};

/// Tunable parameters of the debug stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Clock divider handed to the wire engine. The resulting SWD bit rate
    /// is hardware dependent; the default is a safe speed for short leads.
    pub clock_divider: u16,
    /// Initial MSP value used when calling bootrom routines through the
    /// debug trampoline. Must point into target SRAM.
    pub trampoline_stack: u32,
    /// SRAM address used to stage data for flash programming.
    pub flash_staging_base: u32,
    /// Flash page size; programming length is rounded up to this.
    pub flash_page_size: u32,
    /// Flash sector size; erase length is rounded up to this.
    pub flash_sector_size: u32,
    /// Serial-flash erase opcode matching [`ProbeConfig::flash_sector_size`].
    pub flash_erase_opcode: u8,
    /// Size of the inbound GDB packet buffer, advertised via `qSupported`.
    pub packet_buffer_size: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            clock_divider: 10,
            trampoline_stack: 0x2004_0800,
            flash_staging_base: 0x2000_0000,
            flash_page_size: 256,
            flash_sector_size: 4096,
            flash_erase_opcode: 0x20,
            packet_buffer_size: 16 * 1024,
        }
    }
}
