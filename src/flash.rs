//! Flash operation primitives and the in-memory emulator used off-hardware.
//!
//! The protocol core never touches FMC registers; everything it needs from
//! the flash controller goes through [`FlashOps`].

use anyhow::Result;

/// A contiguous flash address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub base: u32,
    pub size: u32,
}

impl Region {
    /// Whether `[addr, addr + len)` lies entirely inside this region.
    /// Widened to u64 so `addr + len` cannot wrap.
    pub fn contains_range(&self, addr: u32, len: u32) -> bool {
        let start = addr as u64;
        let end = start + len as u64;
        start >= self.base as u64 && end <= self.base as u64 + self.size as u64
    }

    pub fn contains(&self, addr: u32) -> bool {
        self.contains_range(addr, 1)
    }
}

/// APROM and Data Flash ranges plus the erase granularity. Fetched once at
/// session startup and read-only thereafter. The bootloader's own LDROM is
/// deliberately absent, which is what keeps it out of reach of every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashGeometry {
    pub aprom: Region,
    pub data_flash: Region,
    pub page_size: u32,
}

impl FlashGeometry {
    /// A range is programmable when it fits inside a single region.
    pub fn covers(&self, addr: u32, len: u32) -> bool {
        self.aprom.contains_range(addr, len) || self.data_flash.contains_range(addr, len)
    }

    pub fn page_aligned(&self, value: u32) -> bool {
        self.page_size != 0 && value % self.page_size == 0
    }
}

/// The flash controller as seen by the dispatcher.
pub trait FlashOps {
    fn geometry(&self) -> FlashGeometry;

    /// Erases one page starting at `addr` (page-aligned).
    fn erase_page(&mut self, addr: u32) -> Result<()>;

    /// Programs `data` at `addr` (4-byte aligned). NOR semantics: bits can
    /// only be cleared until the covering page is erased again.
    fn program(&mut self, addr: u32, data: &[u8]) -> Result<()>;

    fn read(&self, addr: u32, out: &mut [u8]) -> Result<()>;

    fn read_config(&self) -> Result<[u32; 2]>;

    fn write_config(&mut self, config: [u32; 2]) -> Result<()>;
}

/// Call counters, used to assert "zero flash mutations" in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlashStats {
    pub erases: usize,
    pub programs: usize,
}

/// In-memory flash emulator.
///
/// Backs the CLI off-hardware modes and the test suite. Erase fills a page
/// with 0xFF; program ANDs bytes into the existing contents, matching NOR
/// flash behavior.
pub struct MemFlash {
    geometry: FlashGeometry,
    aprom: Vec<u8>,
    data_flash: Vec<u8>,
    config: [u32; 2],
    pub stats: FlashStats,
}

impl MemFlash {
    pub fn new(geometry: FlashGeometry) -> MemFlash {
        MemFlash {
            geometry,
            aprom: vec![0xff; geometry.aprom.size as usize],
            data_flash: vec![0xff; geometry.data_flash.size as usize],
            config: [0xffff_ffff; 2],
            stats: FlashStats::default(),
        }
    }

    /// Seeds the APROM with an existing image (clipped to the region size).
    pub fn with_image(geometry: FlashGeometry, image: &[u8]) -> MemFlash {
        let mut flash = MemFlash::new(geometry);
        let n = image.len().min(flash.aprom.len());
        flash.aprom[..n].copy_from_slice(&image[..n]);
        flash
    }

    pub fn aprom_image(&self) -> &[u8] {
        &self.aprom
    }

    fn slot(&mut self, addr: u32, len: usize) -> Result<&mut [u8]> {
        let (region, store) = if self.geometry.aprom.contains(addr) {
            (self.geometry.aprom, &mut self.aprom)
        } else if self.geometry.data_flash.contains(addr) {
            (self.geometry.data_flash, &mut self.data_flash)
        } else {
            anyhow::bail!("address 0x{:08x} outside of flash", addr)
        };
        anyhow::ensure!(
            region.contains_range(addr, len as u32),
            "range 0x{:08x}+{} crosses the region end",
            addr,
            len
        );
        let off = (addr - region.base) as usize;
        Ok(&mut store[off..off + len])
    }
}

impl FlashOps for MemFlash {
    fn geometry(&self) -> FlashGeometry {
        self.geometry
    }

    fn erase_page(&mut self, addr: u32) -> Result<()> {
        anyhow::ensure!(
            self.geometry.page_aligned(addr),
            "erase address 0x{:08x} not page-aligned",
            addr
        );
        let page = self.geometry.page_size as usize;
        self.slot(addr, page)?.fill(0xff);
        self.stats.erases += 1;
        Ok(())
    }

    fn program(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let slot = self.slot(addr, data.len())?;
        for (cell, &byte) in slot.iter_mut().zip(data) {
            *cell &= byte;
        }
        self.stats.programs += 1;
        Ok(())
    }

    fn read(&self, addr: u32, out: &mut [u8]) -> Result<()> {
        let (region, store) = if self.geometry.aprom.contains(addr) {
            (self.geometry.aprom, &self.aprom)
        } else if self.geometry.data_flash.contains(addr) {
            (self.geometry.data_flash, &self.data_flash)
        } else {
            anyhow::bail!("address 0x{:08x} outside of flash", addr)
        };
        anyhow::ensure!(
            region.contains_range(addr, out.len() as u32),
            "range 0x{:08x}+{} crosses the region end",
            addr,
            out.len()
        );
        let off = (addr - region.base) as usize;
        out.copy_from_slice(&store[off..off + out.len()]);
        Ok(())
    }

    fn read_config(&self) -> Result<[u32; 2]> {
        Ok(self.config)
    }

    fn write_config(&mut self, config: [u32; 2]) -> Result<()> {
        self.config = config;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> FlashGeometry {
        FlashGeometry {
            aprom: Region {
                base: 0,
                size: 0x8000,
            },
            data_flash: Region {
                base: 0x1f000,
                size: 0x1000,
            },
            page_size: 0x200,
        }
    }

    #[test]
    fn program_clears_bits_until_erased() {
        let mut flash = MemFlash::new(geometry());
        flash.program(0x1000, &[0x0f]).unwrap();
        flash.program(0x1000, &[0xf0]).unwrap();
        let mut out = [0u8; 1];
        flash.read(0x1000, &mut out).unwrap();
        assert_eq!(out[0], 0x00);

        flash.erase_page(0x1000).unwrap();
        flash.read(0x1000, &mut out).unwrap();
        assert_eq!(out[0], 0xff);
    }

    #[test]
    fn region_boundaries_are_enforced() {
        let mut flash = MemFlash::new(geometry());
        assert!(flash.program(0x7fff, &[0, 0]).is_err());
        assert!(flash.erase_page(0x9000).is_err());
        let mut out = [0u8; 4];
        assert!(flash.read(0x8000, &mut out).is_err());
        // Data Flash is reachable even though it is not contiguous with APROM.
        assert!(flash.program(0x1f000, &[0xaa]).is_ok());
    }

    #[test]
    fn misaligned_erase_is_rejected() {
        let mut flash = MemFlash::new(geometry());
        assert!(flash.erase_page(0x1001).is_err());
        assert_eq!(flash.stats.erases, 0);
    }
}
