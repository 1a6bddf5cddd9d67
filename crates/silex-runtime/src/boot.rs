//! Boot handoff
//!
//! The loader hands the runtime one flat record describing the preloaded
//! assembly images, the memory map, the platform configuration root and
//! the debug port. The runtime copies what it needs during bring-up;
//! afterwards the record's memory is reclaimable by the page allocator.

/// Kind of one physical memory range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRangeKind {
    Usable,
    Reserved,
    AcpiReclaimable,
    LoaderImage,
    Framebuffer,
}

/// One entry of the boot memory map.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRange {
    pub kind: MemoryRangeKind,
    pub base: u64,
    pub length: u64,
}

/// One preloaded assembly image.
#[derive(Debug, Clone)]
pub struct PreloadedImage {
    pub name: String,
    pub base: usize,
    pub size: usize,
    pub flags: u32,
}

/// Optional framebuffer description, untouched by the runtime core.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    pub base: usize,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
}

/// The flat record supplied once by the bootloader.
#[derive(Debug, Clone)]
pub struct BootInfo {
    /// Physical base of the loaded-assemblies area.
    pub assemblies_base: usize,
    pub images: Vec<PreloadedImage>,
    /// Physical address of the root platform configuration table.
    pub acpi_root: usize,
    pub framebuffer: Option<FramebufferInfo>,
    /// Byte-oriented debug-serial port address.
    pub debug_port: u16,
    pub memory_map: Vec<MemoryRange>,
}

impl BootInfo {
    /// A record with nothing preloaded; what host tests bring up with.
    pub fn empty() -> BootInfo {
        BootInfo {
            assemblies_base: 0,
            images: Vec::new(),
            acpi_root: 0,
            framebuffer: None,
            debug_port: 0,
            memory_map: Vec::new(),
        }
    }

    /// Total bytes of usable memory in the map.
    pub fn usable_bytes(&self) -> u64 {
        self.memory_map
            .iter()
            .filter(|r| r.kind == MemoryRangeKind::Usable)
            .map(|r| r.length)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usable_bytes() {
        let mut info = BootInfo::empty();
        info.memory_map.push(MemoryRange {
            kind: MemoryRangeKind::Usable,
            base: 0x10_0000,
            length: 0x100_0000,
        });
        info.memory_map.push(MemoryRange {
            kind: MemoryRangeKind::Reserved,
            base: 0,
            length: 0x1000,
        });
        assert_eq!(info.usable_bytes(), 0x100_0000);
    }
}
