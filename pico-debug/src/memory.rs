//! Memory access through the MEM-AP.
//!
//! Byte, halfword and word accesses with hardware lane steering, plus
//! auto-increment block transfers that re-seed TAR at every 1 KiB
//! boundary (the increment is only guaranteed over the low ten address
//! bits). Block reads ride the deferred AP read pipeline for throughput.

use bitfield::bitfield;
use scroll::{Pread, Pwrite, LE};

use crate::adi::Target;
use crate::swd::WireEngine;
use crate::Result;

/// MEM-AP register addresses (all in bank 0 of AP 0).
pub(crate) const MEM_AP: u8 = 0;
pub(crate) const AP_MEM_CSW: u8 = 0x00;
pub(crate) const AP_MEM_TAR: u8 = 0x04;
pub(crate) const AP_MEM_DRW: u8 = 0x0C;

/// Addresses below this are served from the small read cache; everything
/// above is peripheral space and must always hit the bus.
const MEM_CACHE_LIMIT: u32 = 0x3000_0000;

/// Auto-increment wraps at this boundary, so TAR must be rewritten there.
const TAR_WRAP: u32 = 0x400;

bitfield! {
    /// MEM-AP control/status word.
    #[derive(Clone, Copy)]
    pub struct Csw(u32);
    impl Debug;
    pub dbg_sw_enable, set_dbg_sw_enable: 31;
    pub master_debug, set_master_debug: 29;
    pub hprot1, set_hprot1: 25;
    pub u8, addr_inc, set_addr_inc: 5, 4;
    pub u8, size, set_size: 2, 0;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataSize {
    U8 = 0,
    U16 = 1,
    U32 = 2,
}

fn build_csw(size: DataSize, auto_increment: bool) -> Csw {
    let mut csw = Csw(0);
    csw.set_dbg_sw_enable(true);
    csw.set_master_debug(true);
    csw.set_hprot1(true);
    csw.set_addr_inc(auto_increment as u8);
    csw.set_size(size as u8);
    csw
}

impl<E: WireEngine> Target<E> {
    /// Update the MEM-AP CSW if the cached value disagrees.
    fn set_csw(&mut self, csw: Csw) -> Result<()> {
        if self.core().ap_mem_csw_cache != csw.0 {
            self.core().ap_mem_csw_cache = csw.0;
            self.ap_write(MEM_AP, AP_MEM_CSW, csw.0)?;
        }
        Ok(())
    }

    /// Read a 32-bit word. Word-aligned addresses below the cache limit
    /// are served from the read cache when possible.
    pub fn read32(&mut self, addr: u32) -> Result<u32> {
        if addr < MEM_CACHE_LIMIT {
            if let Some(value) = self.core().mem_cache_find(addr) {
                tracing::trace!(addr = format_args!("{addr:#010x}"), "memory cache hit");
                return Ok(value);
            }
        }

        self.set_csw(build_csw(DataSize::U32, false))?;
        self.ap_write(MEM_AP, AP_MEM_TAR, addr)?;
        let value = self.ap_read(MEM_AP, AP_MEM_DRW)?;

        if addr < MEM_CACHE_LIMIT {
            self.core().mem_cache_add(addr, value);
        }
        Ok(value)
    }

    /// Read a byte, via the aligned containing word.
    pub fn read8(&mut self, addr: u32) -> Result<u8> {
        let word = self.read32(addr & !0x3)?;
        Ok((word >> ((addr & 3) * 8)) as u8)
    }

    /// Read a halfword, via the aligned containing word.
    pub fn read16(&mut self, addr: u32) -> Result<u16> {
        let word = self.read32(addr & !0x3)?;
        Ok(if addr & 2 != 0 {
            (word >> 16) as u16
        } else {
            word as u16
        })
    }

    /// Write a 32-bit word.
    pub fn write32(&mut self, addr: u32, value: u32) -> Result<()> {
        self.set_csw(build_csw(DataSize::U32, false))?;
        self.ap_write(MEM_AP, AP_MEM_TAR, addr)?;
        self.ap_write(MEM_AP, AP_MEM_DRW, value)
    }

    /// Write a byte; the value is positioned on its byte lane.
    pub fn write8(&mut self, addr: u32, value: u8) -> Result<()> {
        self.set_csw(build_csw(DataSize::U8, false))?;
        self.ap_write(MEM_AP, AP_MEM_TAR, addr)?;
        self.ap_write(MEM_AP, AP_MEM_DRW, u32::from(value) << ((addr & 3) * 8))
    }

    /// Write a halfword; the address must be 2-byte aligned.
    pub fn write16(&mut self, addr: u32, value: u16) -> Result<()> {
        debug_assert_eq!(addr & 1, 0);
        self.set_csw(build_csw(DataSize::U16, false))?;
        self.ap_write(MEM_AP, AP_MEM_TAR, addr)?;
        let lane = if addr & 2 != 0 {
            u32::from(value) << 16
        } else {
            u32::from(value)
        };
        self.ap_write(MEM_AP, AP_MEM_DRW, lane)
    }

    /// Write an arbitrary byte range: head-align with byte/halfword
    /// writes, stream the body with auto-increment, then the tail.
    ///
    /// A failed call may have already changed target memory up to the
    /// point of the error.
    pub fn block_write(&mut self, mut addr: u32, mut data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        tracing::debug!(
            addr = format_args!("{addr:#010x}"),
            len = data.len(),
            "block write"
        );

        // Head alignment, up to three bytes.
        if addr & 1 != 0 {
            self.write8(addr, data[0])?;
            addr += 1;
            data = &data[1..];
        }
        if addr & 2 != 0 && data.len() >= 2 {
            self.write16(addr, data.pread_with(0, LE).expect("length checked"))?;
            addr += 2;
            data = &data[2..];
        }

        // 32-bit body with auto-increment.
        if data.len() >= 4 {
            self.set_csw(build_csw(DataSize::U32, true))?;
            self.ap_write(MEM_AP, AP_MEM_TAR, addr)?;

            let words = data.len() / 4;
            for i in 0..words {
                let value: u32 = data.pread_with(i * 4, LE).expect("length checked");
                self.ap_write(MEM_AP, AP_MEM_DRW, value)?;

                addr += 4;
                if addr % TAR_WRAP == 0 {
                    self.ap_write(MEM_AP, AP_MEM_TAR, addr)?;
                }
            }
            data = &data[words * 4..];
        }

        // Tail.
        if data.len() >= 2 {
            self.write16(addr, data.pread_with(0, LE).expect("length checked"))?;
            addr += 2;
            data = &data[2..];
        }
        if let Some(&last) = data.first() {
            self.write8(addr, last)?;
        }
        Ok(())
    }

    /// Read an arbitrary byte range using the deferred AP read pipeline.
    pub fn block_read(&mut self, mut addr: u32, out: &mut [u8]) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        tracing::debug!(
            addr = format_args!("{addr:#010x}"),
            len = out.len(),
            "block read"
        );

        let mut pos = 0usize;

        // Unaligned head: one word read, keep the relevant bytes.
        if addr & 3 != 0 {
            let word = self.read32(addr & !0x3)?.to_le_bytes();
            let skip = (addr & 3) as usize;
            let take = (4 - skip).min(out.len());
            out[..take].copy_from_slice(&word[skip..skip + take]);
            addr += take as u32;
            pos += take;
        }

        let words = (out.len() - pos) / 4;
        match words {
            0 => {}
            // A single word doesn't warrant the pipeline and may hit the
            // read cache.
            1 => {
                let word = self.read32(addr)?;
                out.pwrite_with(word, pos, LE).expect("length checked");
                addr += 4;
                pos += 4;
            }
            _ => {
                self.set_csw(build_csw(DataSize::U32, true))?;
                self.ap_write(MEM_AP, AP_MEM_TAR, addr)?;

                // The first deferred read primes the pipeline; its return
                // value is stale.
                self.ap_read_defer(MEM_AP, AP_MEM_DRW)?;
                for i in 0..words - 1 {
                    addr += 4;
                    if addr % TAR_WRAP == 0 {
                        self.ap_write(MEM_AP, AP_MEM_TAR, addr)?;
                    }
                    let value = self.ap_read_defer(MEM_AP, AP_MEM_DRW)?;
                    out.pwrite_with(value, pos + i * 4, LE).expect("length checked");
                }
                let value = self.ap_read_last()?;
                out.pwrite_with(value, pos + (words - 1) * 4, LE)
                    .expect("length checked");

                addr += 4;
                pos += words * 4;
            }
        }

        // Stragglers from one more word read.
        if pos < out.len() {
            let word = self.read32(addr)?.to_le_bytes();
            let n = out.len() - pos;
            out[pos..].copy_from_slice(&word[..n]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::adi::Target;
    use crate::config::ProbeConfig;
    use crate::fake::FakeRp2040;
    use pretty_assertions::assert_eq;

    fn target() -> Target<FakeRp2040> {
        let mut target = Target::new(FakeRp2040::new(), ProbeConfig::default());
        target.connect().unwrap();
        target
    }

    #[test]
    fn subword_reads_extract_the_right_lanes() {
        let mut t = target();
        t.swd.engine_mut().seed_word(0x2000_0000, 0xDDCC_BBAA);

        assert_eq!(t.read32(0x2000_0000).unwrap(), 0xDDCC_BBAA);
        assert_eq!(t.read8(0x2000_0000).unwrap(), 0xAA);
        assert_eq!(t.read8(0x2000_0003).unwrap(), 0xDD);
        assert_eq!(t.read16(0x2000_0000).unwrap(), 0xBBAA);
        assert_eq!(t.read16(0x2000_0002).unwrap(), 0xDDCC);
    }

    #[test]
    fn subword_writes_steer_the_byte_lanes() {
        let mut t = target();
        t.swd.engine_mut().seed_word(0x2000_0010, 0x0000_0000);

        t.write8(0x2000_0011, 0xAB).unwrap();
        t.write16(0x2000_0012, 0xCDEF).unwrap();
        assert_eq!(t.swd.engine_mut().word(0x2000_0010), 0xCDEF_AB00);
    }

    #[test]
    fn word_reads_hit_the_cache_until_a_run_state_change() {
        let mut t = target();
        t.swd.engine_mut().seed_word(0x1000_0100, 0x1234_5678);

        assert_eq!(t.read32(0x1000_0100).unwrap(), 0x1234_5678);
        t.swd.engine_mut().clear_log();
        assert_eq!(t.read32(0x1000_0100).unwrap(), 0x1234_5678);
        assert_eq!(t.swd.engine_mut().transaction_count(), 0);

        // The cache is only flushed on halt/resume/step/reset; until
        // then it serves the old word even if memory moved underneath.
        t.swd.engine_mut().seed_word(0x1000_0100, 0xA5A5_A5A5);
        assert_eq!(t.read32(0x1000_0100).unwrap(), 0x1234_5678);

        t.halt().unwrap();
        assert_eq!(t.read32(0x1000_0100).unwrap(), 0xA5A5_A5A5);
    }

    #[test]
    fn peripheral_space_is_never_cached() {
        let mut t = target();
        t.swd.engine_mut().seed_word(0x4005_8000, 0x1);

        assert_eq!(t.read32(0x4005_8000).unwrap(), 0x1);
        t.swd.engine_mut().seed_word(0x4005_8000, 0x2);
        assert_eq!(t.read32(0x4005_8000).unwrap(), 0x2);
    }

    #[test]
    fn block_write_handles_ragged_edges_and_crosses_1k_boundaries() {
        let mut t = target();

        // 0x200007f5..0x2000080e: unaligned head and tail, and the body
        // crosses the auto-increment wrap at 0x20000800.
        let data: Vec<u8> = (0..25u8).collect();
        let base = 0x2000_07F5;
        t.block_write(base, &data).unwrap();

        let fake = t.swd.engine_mut();
        for (i, expected) in data.iter().enumerate() {
            assert_eq!(fake.byte(base + i as u32), *expected, "byte {i}");
        }
        // The body was seeded at 0x200007f8, so a TAR write at the wrap
        // boundary can only come from the re-seed.
        assert!(fake.tar_writes().contains(&0x2000_0800));
    }

    #[test]
    fn block_read_is_symmetrical_and_reseeds_tar() {
        let mut t = target();
        let base = 0x2000_07FA;
        for i in 0..8u32 {
            t.swd
                .engine_mut()
                .seed_word(0x2000_07F8 + i * 4, 0x0101_0101u32.wrapping_mul(i + 1));
        }

        let mut out = [0u8; 21];
        t.block_read(base, &mut out).unwrap();

        let fake = t.swd.engine_mut();
        for (i, b) in out.iter().enumerate() {
            assert_eq!(*b, fake.byte(base + i as u32), "byte {i}");
        }
        assert!(fake.tar_writes().contains(&0x2000_0800));
    }
}
