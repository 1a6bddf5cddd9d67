//! Executable code heap
//!
//! Page-aligned chunks from the platform, bump-allocated. Installing a
//! finished method copies its bytes into a writable span, flips the
//! span's pages to read-execute and flushes the i-cache - all under one
//! lock, so no page is ever writable and executable at once and no two
//! emissions interleave. The next installation starts on a fresh
//! writable page. Chunks are tagged with their owning assembly and
//! returned whole on unload.
//!
//! This heap is disjoint from the object heap: no GC object lives here
//! and the collector never scans it.

use crate::defaults::{CODE_CHUNK_SIZE, PAGE_SIZE};
use crate::platform::{PageProt, Platform};
use parking_lot::Mutex;
use std::sync::Arc;

struct Chunk {
    base: usize,
    size: usize,
    cursor: usize,
    assembly: u32,
}

struct Inner {
    chunks: Vec<Chunk>,
    total_code: usize,
}

/// The executable allocator. One lock serialises allocation and the
/// RW→RX flip.
pub struct CodeHeap {
    platform: Arc<dyn Platform>,
    inner: Mutex<Inner>,
}

impl CodeHeap {
    pub fn new(platform: Arc<dyn Platform>) -> CodeHeap {
        CodeHeap {
            platform,
            inner: Mutex::new(Inner {
                chunks: Vec::new(),
                total_code: 0,
            }),
        }
    }

    /// Bytes published so far.
    pub fn total_code(&self) -> usize {
        self.inner.lock().total_code
    }

    /// Copy `code` into executable memory for `assembly` and return its
    /// base address. The span is writable only inside this call; it is
    /// read-execute and i-cache-coherent before any thread can see the
    /// address.
    pub fn install(&self, code: &[u8], assembly: u32) -> Option<usize> {
        let size = code.len();
        let mut inner = self.inner.lock();

        let chunk = match inner
            .chunks
            .iter_mut()
            .rev()
            .find(|c| c.assembly == assembly && c.cursor + size <= c.size)
        {
            Some(c) => c,
            None => {
                let wanted = CODE_CHUNK_SIZE.max(size);
                let pages = (wanted + PAGE_SIZE - 1) / PAGE_SIZE;
                let base = self.platform.alloc_pages(pages)?;
                log::debug!("code heap: new chunk at {base:#x} for assembly {assembly}");
                inner.chunks.push(Chunk {
                    base,
                    size: pages * PAGE_SIZE,
                    cursor: 0,
                    assembly,
                });
                inner.chunks.last_mut().unwrap()
            }
        };

        let base = chunk.base + chunk.cursor;
        // Safety: the span is inside a chunk we own, currently RW, and
        // unreachable by any other thread until this call returns.
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), base as *mut u8, size);
        }

        let first_page = base / PAGE_SIZE * PAGE_SIZE;
        let end_page = (base + size + PAGE_SIZE - 1) / PAGE_SIZE * PAGE_SIZE;
        if !self
            .platform
            .protect(first_page, (end_page - first_page) / PAGE_SIZE, PageProt::RX)
        {
            crate::error::fatal("code heap", "page protection flip failed");
        }
        self.platform.icache_flush(base, size);

        // The tail of the last page is executable now; skip it so the
        // next installation starts on a writable page.
        chunk.cursor = (end_page - chunk.base).min(chunk.size);
        inner.total_code += size;
        Some(base)
    }

    /// Return every chunk owned by `assembly` to the page allocator.
    pub fn unload_assembly(&self, assembly: u32) {
        let mut inner = self.inner.lock();
        let platform = &self.platform;
        inner.chunks.retain(|c| {
            if c.assembly == assembly {
                platform.protect(c.base, c.size / PAGE_SIZE, PageProt::RW);
                platform.free_pages(c.base, c.size / PAGE_SIZE);
                false
            } else {
                true
            }
        });
    }
}

impl Drop for CodeHeap {
    fn drop(&mut self) {
        let inner = self.inner.lock();
        for chunk in &inner.chunks {
            self.platform
                .protect(chunk.base, chunk.size / PAGE_SIZE, PageProt::RW);
            self.platform.free_pages(chunk.base, chunk.size / PAGE_SIZE);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::platform::HostPlatform;

    fn code_heap() -> CodeHeap {
        CodeHeap::new(Arc::new(HostPlatform))
    }

    #[test]
    fn test_install_is_executable() {
        let heap = code_heap();
        // ret, padded with int3.
        let mut code = vec![0xC3u8];
        code.extend_from_slice(&[0xCC; 15]);
        let base = heap.install(&code, 1).unwrap();
        assert_eq!(heap.total_code(), 16);

        #[cfg(target_arch = "x86_64")]
        unsafe {
            let f: extern "C" fn() = std::mem::transmute(base);
            f();
        }
    }

    #[test]
    fn test_next_install_on_fresh_page() {
        let heap = code_heap();
        let a = heap.install(&[0xC3; 16], 1).unwrap();
        let b = heap.install(&[0xC3; 16], 1).unwrap();
        // b starts past a's (now read-execute) page and is writable
        // during its own installation only.
        assert_eq!(b % PAGE_SIZE, 0);
        assert!(b >= a + PAGE_SIZE - (a % PAGE_SIZE));
    }

    #[test]
    fn test_assemblies_get_separate_chunks() {
        let heap = code_heap();
        let a = heap.install(&[0xC3; 16], 1).unwrap();
        let b = heap.install(&[0xC3; 16], 2).unwrap();
        // Different assemblies never share a chunk.
        assert!(b.abs_diff(a) >= CODE_CHUNK_SIZE);
    }

    #[test]
    fn test_unload_returns_chunks() {
        let heap = code_heap();
        let before = heap.install(&[0xC3; 64], 7).unwrap();
        heap.unload_assembly(7);
        // A fresh installation builds a new chunk.
        let after = heap.install(&[0xC3; 64], 7).unwrap();
        let _ = (before, after);
    }

    #[test]
    fn test_large_install_gets_own_chunk() {
        let heap = code_heap();
        let big = vec![0xCCu8; CODE_CHUNK_SIZE + PAGE_SIZE];
        let base = heap.install(&big, 1).unwrap();
        assert_eq!(base % PAGE_SIZE, 0);
    }
}
