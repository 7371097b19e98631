//! Flash programming through the bootrom.
//!
//! `vFlashWrite` data is accumulated in a staging buffer on the probe;
//! `vFlashDone` ships it to target SRAM in chunks and drives the bootrom
//! flash routines through the debug trampoline: connect the flash, leave
//! XIP, erase the range, program it, flush the XIP cache and re-enter
//! command XIP.

use crate::adi::Target;
use crate::rp2040::{
    CONNECT_INTERNAL_FLASH, FLASH_ENTER_CMD_XIP, FLASH_EXIT_XIP, FLASH_FLUSH_CACHE,
    FLASH_RANGE_ERASE, FLASH_RANGE_PROGRAM,
};
use crate::swd::WireEngine;
use crate::Result;

/// SRAM chunk shipped to the target per program call.
const STAGE_CHUNK: usize = 0x8000;

/// Accumulates host flash data between `vFlashWrite` and `vFlashDone`.
///
/// Offsets are flash offsets (the XIP address with its top byte masked
/// off). Writes are expected in ascending, contiguous order; anything
/// else must be flushed to the target first.
#[derive(Debug, Default)]
pub struct FlashStage {
    base: u32,
    data: Vec<u8>,
}

impl FlashStage {
    /// Fresh, empty stage.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Flash offset of the staged data.
    pub fn base(&self) -> u32 {
        self.base
    }

    /// The staged bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Can `offset` be appended without a flush?
    pub fn accepts(&self, offset: u32) -> bool {
        self.is_empty() || offset == self.base + self.data.len() as u32
    }

    /// Append a run of bytes. The caller has checked [`FlashStage::accepts`].
    pub fn append(&mut self, offset: u32, bytes: &[u8]) {
        if self.is_empty() {
            self.base = offset;
        }
        debug_assert_eq!(offset, self.base + self.data.len() as u32);
        self.data.extend_from_slice(bytes);
    }

    /// Drop the staged data.
    pub fn clear(&mut self) {
        self.base = 0;
        self.data.clear();
    }
}

fn round_up(value: u32, to: u32) -> u32 {
    value.div_ceil(to) * to
}

impl<E: WireEngine> Target<E> {
    /// Burn a staged image into flash via the bootrom routines. The
    /// current core must be halted. `yield_now` is passed through to the
    /// ROM-call polls so the caller's I/O pumps keep running.
    pub fn program_flash(
        &mut self,
        stage: &FlashStage,
        yield_now: &mut dyn FnMut(),
    ) -> Result<()> {
        if stage.is_empty() {
            return Ok(());
        }
        let sector = self.config.flash_sector_size;
        let page = self.config.flash_page_size;
        let sram = self.config.flash_staging_base;

        tracing::info!(
            offset = format_args!("{:#010x}", stage.base()),
            len = stage.data().len(),
            "programming flash"
        );

        let connect = self.find_rom_func(CONNECT_INTERNAL_FLASH)?;
        let exit_xip = self.find_rom_func(FLASH_EXIT_XIP)?;
        let erase = self.find_rom_func(FLASH_RANGE_ERASE)?;
        let program = self.find_rom_func(FLASH_RANGE_PROGRAM)?;
        let flush = self.find_rom_func(FLASH_FLUSH_CACHE)?;
        let enter_xip = self.find_rom_func(FLASH_ENTER_CMD_XIP)?;

        self.call_function(connect, &[], yield_now)?;
        self.call_function(exit_xip, &[], yield_now)?;

        let erase_len = round_up(stage.data().len() as u32, sector);
        self.call_function(
            erase,
            &[
                stage.base(),
                erase_len,
                sector,
                u32::from(self.config.flash_erase_opcode),
            ],
            yield_now,
        )?;

        // Pad the tail to a whole page so the final program call doesn't
        // drag in stale SRAM.
        let mut image = stage.data().to_vec();
        image.resize(round_up(image.len() as u32, page) as usize, 0xFF);

        for (i, chunk) in image.chunks(STAGE_CHUNK).enumerate() {
            let offset = stage.base() + (i * STAGE_CHUNK) as u32;
            self.block_write(sram, chunk)?;
            self.call_function(program, &[offset, sram, chunk.len() as u32], yield_now)?;
        }

        self.call_function(flush, &[], yield_now)?;
        self.call_function(enter_xip, &[], yield_now)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ProbeConfig;
    use crate::fake::FakeRp2040;
    use pretty_assertions::assert_eq;

    #[test]
    fn stage_tracks_contiguous_runs() {
        let mut stage = FlashStage::new();
        assert!(stage.accepts(0x1000));

        stage.append(0x1000, &[1, 2, 3, 4]);
        assert!(stage.accepts(0x1004));
        assert!(!stage.accepts(0x2000));

        stage.append(0x1004, &[5, 6]);
        assert_eq!(stage.base(), 0x1000);
        assert_eq!(stage.data(), &[1, 2, 3, 4, 5, 6]);

        stage.clear();
        assert!(stage.is_empty());
    }

    #[test]
    fn program_flash_runs_the_bootrom_sequence() {
        let mut target = Target::new(FakeRp2040::new(), ProbeConfig::default());
        target.connect().unwrap();
        target.halt().unwrap();

        let mut stage = FlashStage::new();
        let payload: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
        stage.append(0x0004_0000, &payload);

        target.program_flash(&stage, &mut || {}).unwrap();

        let fake = target.swd.engine_mut();
        let tags: Vec<[u8; 2]> = fake
            .rom_calls()
            .iter()
            .map(|c| fake.rom_func_tag(c.func))
            .collect();
        assert_eq!(
            tags,
            vec![*b"IF", *b"EX", *b"RE", *b"RP", *b"FC", *b"CX"]
        );

        // Erase covers the range rounded to a sector, with the right
        // opcode.
        let erase = &fake.rom_calls()[2];
        assert_eq!(erase.args, [0x0004_0000, 0x1000, 0x1000, 0x20]);

        // Program covers the payload rounded to a page, sourced from the
        // staging area in SRAM.
        let program = &fake.rom_calls()[3];
        assert_eq!(program.args[0], 0x0004_0000);
        assert_eq!(program.args[1], ProbeConfig::default().flash_staging_base);
        assert_eq!(program.args[2], 768);

        // The staged bytes made it into SRAM.
        let sram = ProbeConfig::default().flash_staging_base;
        assert_eq!(fake.byte(sram), 0);
        assert_eq!(fake.byte(sram + 599), 599u32 as u8);
        // Page padding.
        assert_eq!(fake.byte(sram + 600), 0xFF);
    }
}
