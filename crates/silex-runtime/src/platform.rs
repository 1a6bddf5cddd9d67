//! Kernel service seam
//!
//! The runtime core consumes a bounded set of services from the
//! surrounding kernel: physical pages, virtual mappings with RW/RX
//! protection, i-cache flushes, thread freeze/thaw and IPIs. They are
//! expressed as one trait so the core is testable on a host: the
//! [`HostPlatform`] maps anonymous pages with mmap and treats
//! freeze/thaw as no-ops (host tests park mutators cooperatively).

use crate::unwind::Context;

bitflags::bitflags! {
    /// Page protection for [`Platform::map_pages`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageProt: u32 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXEC = 0b100;
        const RW = 0b011;
        const RX = 0b101;
    }
}

/// Snapshot of a frozen thread, as handed over by the kernel scheduler.
#[derive(Debug, Clone)]
pub struct FrozenThread {
    pub context: Context,
}

/// Services the runtime core consumes from the kernel.
///
/// All addresses are virtual; on the host, "physical" allocation and
/// mapping collapse into one mmap call.
pub trait Platform: Send + Sync {
    /// Allocate `count` pages of backing memory and map them RW.
    /// Returns the base address.
    fn alloc_pages(&self, count: usize) -> Option<usize>;

    /// Return pages previously obtained from [`Platform::alloc_pages`].
    fn free_pages(&self, base: usize, count: usize);

    /// Change the protection of a previously allocated range.
    fn protect(&self, base: usize, count: usize, prot: PageProt) -> bool;

    /// Flush the instruction cache for a code range before first execution.
    fn icache_flush(&self, base: usize, len: usize);

    /// Freeze every other thread and return their contexts. The world
    /// stays frozen until [`Platform::thaw_all`].
    fn freeze_all_threads_except_self(&self) -> Vec<FrozenThread>;

    /// Resume all threads frozen by the previous call.
    fn thaw_all(&self);

    /// Prod every other CPU so long-running computation reaches its next
    /// trap check.
    fn send_ipi_all(&self);

    /// Write one byte to the debug channel.
    fn debug_out(&self, byte: u8);

    /// Stop the machine. Only reached through [`crate::error::fatal`].
    fn halt(&self) -> !;
}

/// mmap-backed host implementation used by tests and development builds.
#[cfg(unix)]
pub struct HostPlatform;

#[cfg(unix)]
impl Platform for HostPlatform {
    fn alloc_pages(&self, count: usize) -> Option<usize> {
        let len = count * crate::defaults::PAGE_SIZE;
        // Safety: anonymous private mapping; no fd, no existing range.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            None
        } else {
            Some(ptr as usize)
        }
    }

    fn free_pages(&self, base: usize, count: usize) {
        // Safety: range was produced by alloc_pages.
        unsafe {
            libc::munmap(base as *mut libc::c_void, count * crate::defaults::PAGE_SIZE);
        }
    }

    fn protect(&self, base: usize, count: usize, prot: PageProt) -> bool {
        let mut native = 0;
        if prot.contains(PageProt::READ) {
            native |= libc::PROT_READ;
        }
        if prot.contains(PageProt::WRITE) {
            native |= libc::PROT_WRITE;
        }
        if prot.contains(PageProt::EXEC) {
            native |= libc::PROT_EXEC;
        }
        // Safety: range was produced by alloc_pages.
        unsafe {
            libc::mprotect(
                base as *mut libc::c_void,
                count * crate::defaults::PAGE_SIZE,
                native,
            ) == 0
        }
    }

    fn icache_flush(&self, _base: usize, _len: usize) {
        // x86 keeps the i-cache coherent; the mprotect flip already issues
        // the necessary serialization on the host.
    }

    fn freeze_all_threads_except_self(&self) -> Vec<FrozenThread> {
        Vec::new()
    }

    fn thaw_all(&self) {}

    fn send_ipi_all(&self) {}

    fn debug_out(&self, byte: u8) {
        use std::io::Write;
        let _ = std::io::stderr().write_all(&[byte]);
    }

    fn halt(&self) -> ! {
        std::process::abort()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_free_pages() {
        let platform = HostPlatform;
        let base = platform.alloc_pages(2).unwrap();
        assert_eq!(base % crate::defaults::PAGE_SIZE, 0);

        // Freshly mapped pages are zeroed and writable.
        unsafe {
            let slice = std::slice::from_raw_parts_mut(base as *mut u8, 8192);
            assert!(slice.iter().all(|&b| b == 0));
            slice[0] = 0xAB;
            assert_eq!(slice[0], 0xAB);
        }
        platform.free_pages(base, 2);
    }

    #[test]
    fn test_protect_flip() {
        let platform = HostPlatform;
        let base = platform.alloc_pages(1).unwrap();
        unsafe { *(base as *mut u8) = 0xC3 };
        assert!(platform.protect(base, 1, PageProt::RX));
        assert!(platform.protect(base, 1, PageProt::RW));
        platform.free_pages(base, 1);
    }
}
