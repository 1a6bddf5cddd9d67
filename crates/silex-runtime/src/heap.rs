//! GC-managed heap
//!
//! Region-based allocator: contiguous virtual regions carved from the
//! platform page allocator, bump allocation within the active region, and
//! a first-fit free list fed by the sweeper. Blocks are contiguous inside
//! a region, so following block-size headers from the region base walks
//! every allocation - the invariant the collector's sweep and the heap
//! verifier both rely on.

use crate::defaults::{MIN_FREE_BLOCK, PAGE_SIZE, REGION_SIZE};
use crate::object::{ObjFlags, ObjRef, HEADER_SIZE};
use crate::platform::Platform;
use crate::types::MethodTable;
use std::sync::Arc;

/// One contiguous heap region.
pub struct Region {
    base: usize,
    size: usize,
    /// Bytes used from the base; the next block header lands here.
    cursor: usize,
}

impl Region {
    /// First object of the region, if any.
    fn first_object(&self) -> Option<ObjRef> {
        if self.cursor == 0 {
            None
        } else {
            Some(ObjRef(self.base + HEADER_SIZE))
        }
    }

    /// Walk every block in allocation order.
    fn walk(&self, mut f: impl FnMut(ObjRef)) {
        let mut obj = match self.first_object() {
            Some(o) => o,
            None => return,
        };
        let end = self.base + self.cursor;
        while obj.0 - HEADER_SIZE < end {
            f(obj);
            // Safety: blocks are contiguous and headers valid by invariant.
            let size = unsafe { obj.block_size() };
            obj = ObjRef(obj.0 + size);
        }
    }

    fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.cursor
    }
}

/// Allocation statistics kept by the heap.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStats {
    pub allocated_bytes: usize,
    pub region_count: usize,
    pub free_blocks: usize,
}

/// The managed heap.
pub struct GcHeap {
    platform: Arc<dyn Platform>,
    regions: Vec<Region>,
    /// Head of the free list; free blocks chain through their MT slot.
    free_head: ObjRef,
    free_count: usize,
    allocated_bytes: usize,
}

// Safety: the heap is only reached through the runtime's locks; mutators
// allocate under the heap lock and the collector runs with the world
// stopped.
unsafe impl Send for GcHeap {}

impl GcHeap {
    pub fn new(platform: Arc<dyn Platform>) -> GcHeap {
        GcHeap {
            platform,
            regions: Vec::new(),
            free_head: ObjRef::NULL,
            free_count: 0,
            allocated_bytes: 0,
        }
    }

    /// Live bytes currently accounted to objects (free blocks excluded).
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            allocated_bytes: self.allocated_bytes,
            region_count: self.regions.len(),
            free_blocks: self.free_count,
        }
    }

    /// Allocate a raw block of at least `block_size` bytes (header
    /// included) and return the object pointer. The resulting header
    /// carries the block's actual size (a free-list hit can be slightly
    /// larger when the remnant was too small to split); flags are clear
    /// and the MT slot and payload are zeroed.
    pub fn alloc_block(&mut self, block_size: usize) -> Option<ObjRef> {
        debug_assert!(block_size % 8 == 0 && block_size >= MIN_FREE_BLOCK);

        let obj = self
            .bump_alloc(block_size)
            .or_else(|| self.free_list_alloc(block_size))
            .or_else(|| {
                self.grow(block_size)?;
                self.bump_alloc(block_size)
            })?;

        // Safety: the block was just carved out of a region or free list
        // and its size header is already in place.
        unsafe {
            let actual = obj.block_size();
            std::ptr::write_bytes(obj.0 as *mut u8, 0, actual - HEADER_SIZE);
            *((obj.0 - 8) as *mut u64) = 0;
            self.allocated_bytes += actual;
        }
        Some(obj)
    }

    /// Allocate an instance of `mt` with its header and MT slot written.
    pub fn alloc_object(&mut self, mt: &'static MethodTable) -> Option<ObjRef> {
        let payload = mt.base_size().max(8);
        let block = HEADER_SIZE + (payload + 7) / 8 * 8;
        let obj = self.alloc_block(block)?;
        // Safety: fresh block.
        unsafe { obj.set_method_table(mt) };
        Some(obj)
    }

    /// Allocate an array of `len` elements of `mt` (an array type with a
    /// component size). Elements start zeroed. The payload covers the MT
    /// slot, the length word and the element run.
    pub fn alloc_array(&mut self, mt: &'static MethodTable, len: usize) -> Option<ObjRef> {
        let payload =
            crate::object::ARRAY_DATA_OFFSET + len.checked_mul(mt.component_size())?;
        let block = HEADER_SIZE + (payload.max(8) + 7) / 8 * 8;
        let obj = self.alloc_block(block)?;
        // Safety: fresh block.
        unsafe {
            obj.set_method_table(mt);
            obj.set_array_length(len);
        }
        Some(obj)
    }

    fn bump_alloc(&mut self, block_size: usize) -> Option<ObjRef> {
        let region = self.regions.last_mut()?;
        if region.cursor + block_size > region.size {
            return None;
        }
        let obj = ObjRef(region.base + region.cursor + HEADER_SIZE);
        region.cursor += block_size;
        // Safety: region memory is mapped RW; the block is fresh.
        unsafe { obj.set_block_size(block_size) };
        Some(obj)
    }

    /// First-fit over the free list, splitting when the remnant is big
    /// enough to stand alone as a block.
    fn free_list_alloc(&mut self, block_size: usize) -> Option<ObjRef> {
        let mut prev = ObjRef::NULL;
        let mut current = self.free_head;
        while !current.is_null() {
            // Safety: free-list entries keep valid headers.
            unsafe {
                let available = current.block_size();
                if available >= block_size {
                    let remnant = available - block_size;
                    if remnant >= MIN_FREE_BLOCK {
                        // Split: shrink this block, free the tail.
                        current.set_block_size(block_size);
                        let tail = ObjRef(current.0 + block_size);
                        tail.set_block_size(remnant);
                        *((tail.0 - 8) as *mut u64) = 0;
                        tail.set_flag(ObjFlags::FREE);
                        tail.set_free_next(current.free_next());
                        self.unlink(prev, tail);
                    } else {
                        self.unlink(prev, current.free_next());
                        self.free_count -= 1;
                    }
                    current.clear_flag(ObjFlags::FREE);
                    return Some(current);
                }
                prev = current;
                current = current.free_next();
            }
        }
        None
    }

    /// Replace the link that pointed at the allocated block.
    unsafe fn unlink(&mut self, prev: ObjRef, next: ObjRef) {
        if prev.is_null() {
            self.free_head = next;
        } else {
            prev.set_free_next(next);
        }
    }

    fn grow(&mut self, block_size: usize) -> Option<()> {
        let wanted = REGION_SIZE.max(block_size);
        let pages = (wanted + PAGE_SIZE - 1) / PAGE_SIZE;
        let base = self.platform.alloc_pages(pages)?;
        self.regions.push(Region {
            base,
            size: pages * PAGE_SIZE,
            cursor: 0,
        });
        log::debug!("heap: new region at {base:#x} ({} pages)", pages);
        Some(())
    }

    /// Convert an object into a free block and push it on the free list.
    /// Called by the sweeper with the world stopped.
    ///
    /// # Safety
    /// `obj` must be a live block owned by this heap.
    pub unsafe fn release(&mut self, obj: ObjRef) {
        let size = obj.block_size();
        debug_assert!(!obj.is_free_block());
        *((obj.0 - 8) as *mut u64) = 0;
        obj.set_flag(ObjFlags::FREE);
        obj.set_free_next(self.free_head);
        self.free_head = obj;
        self.free_count += 1;
        self.allocated_bytes -= size;
    }

    /// Walk every block in every region.
    pub fn walk(&self, mut f: impl FnMut(ObjRef)) {
        for region in &self.regions {
            region.walk(&mut f);
        }
    }

    /// Find the object whose block contains `addr`, for interior-pointer
    /// resolution. Returns `None` for addresses outside the heap or inside
    /// free blocks.
    pub fn find_object(&self, addr: usize) -> Option<ObjRef> {
        let region = self.regions.iter().find(|r| r.contains(addr))?;
        let mut found = None;
        region.walk(|obj| {
            // Safety: region walk yields valid headers.
            let size = unsafe { obj.block_size() };
            let start = obj.0 - HEADER_SIZE;
            if addr >= start && addr < start + size {
                let free = unsafe { obj.is_free_block() };
                if !free {
                    found = Some(obj);
                }
            }
        });
        found
    }

    /// True when `addr` is a plausible object pointer: inside a region and
    /// exactly at a non-free block's object position.
    pub fn is_object_start(&self, addr: usize) -> bool {
        if addr == 0 {
            return false;
        }
        let Some(region) = self.regions.iter().find(|r| r.contains(addr)) else {
            return false;
        };
        let mut hit = false;
        region.walk(|obj| {
            if obj.0 == addr {
                hit = !unsafe { obj.is_free_block() };
            }
        });
        hit
    }

    /// Assert the walkability invariant: headers chain exactly to each
    /// region's cursor and every block is an object or a free block.
    pub fn verify(&self) {
        for region in &self.regions {
            let mut pos = 0usize;
            region.walk(|obj| {
                assert_eq!(obj.0 - HEADER_SIZE, region.base + pos, "block chain broken");
                // Safety: walk yields header-valid blocks.
                let size = unsafe { obj.block_size() };
                assert!(size >= MIN_FREE_BLOCK, "undersized block");
                let free = unsafe { obj.is_free_block() };
                if !free {
                    let mt = unsafe { *(obj.0 as *const usize) };
                    assert!(mt != 0, "object without a MethodTable");
                }
                pos += size;
            });
            assert_eq!(pos, region.cursor, "cursor does not match walk");
        }
    }
}

impl Drop for GcHeap {
    fn drop(&mut self) {
        for region in &self.regions {
            self.platform.free_pages(region.base, region.size / PAGE_SIZE);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::platform::HostPlatform;
    use crate::types::{MethodTableBuilder, MtFlags};

    fn heap() -> GcHeap {
        GcHeap::new(Arc::new(HostPlatform))
    }

    fn plain_mt(base_size: u32) -> &'static MethodTable {
        let mut b = MethodTableBuilder::new("T");
        b.base_size = base_size;
        b.build()
    }

    #[test]
    fn test_alloc_writes_header() {
        let mut h = heap();
        let mt = plain_mt(24);
        let obj = h.alloc_object(mt).unwrap();
        assert_eq!(obj.0 % 8, 0);
        unsafe {
            assert_eq!(obj.block_size(), 16 + 24);
            assert!(!obj.is_marked());
            assert!(!obj.is_free_block());
            assert!(std::ptr::eq(obj.method_table(), mt));
        }
        h.verify();
    }

    #[test]
    fn test_blocks_are_contiguous() {
        let mut h = heap();
        let mt = plain_mt(8);
        let a = h.alloc_object(mt).unwrap();
        let b = h.alloc_object(mt).unwrap();
        unsafe {
            assert_eq!(b.0, a.0 + a.block_size());
        }
        h.verify();
    }

    #[test]
    fn test_array_alloc_zeroed() {
        let mut h = heap();
        let mt = {
            let mut b = MethodTableBuilder::new("Int32[]");
            b.component_size = 4;
            b.flags = MtFlags::IS_ARRAY;
            b.build()
        };
        let arr = h.alloc_array(mt, 10).unwrap();
        unsafe {
            assert_eq!(arr.array_length(), 10);
            // 16 bytes for MT+length, 40 element bytes
            assert_eq!(arr.block_size(), 16 + 16 + 40);
            let data = arr.field_ptr(crate::object::ARRAY_DATA_OFFSET);
            for i in 0..40 {
                assert_eq!(*data.add(i), 0);
            }
        }
    }

    #[test]
    fn test_free_list_reuse_exact() {
        let mut h = heap();
        let mt = plain_mt(32);
        let a = h.alloc_object(mt).unwrap();
        let _b = h.alloc_object(mt).unwrap();
        unsafe { h.release(a) };
        assert_eq!(h.stats().free_blocks, 1);

        // Bump allocation has priority while the region has space, so ask
        // the free list directly: the same-size block comes straight back.
        let c = h.free_list_alloc(16 + 32).unwrap();
        assert_eq!(c.0, a.0);
        assert_eq!(h.stats().free_blocks, 0);
        unsafe {
            assert!(!c.is_free_block());
            c.set_method_table(mt);
        }
        h.verify();
    }

    #[test]
    fn test_free_list_split() {
        let mut h = heap();
        let big = plain_mt(128);
        let small = plain_mt(8);
        let a = h.alloc_object(big).unwrap();
        let _fence = h.alloc_object(small).unwrap();
        unsafe { h.release(a) };

        // A much smaller allocation splits the 144-byte block: bump space
        // is still open, so force the free-list path by exhausting... the
        // bump pointer stays usable, so first-fit is only consulted after
        // region exhaustion. Simulate by asking for the block directly.
        let reused = h.free_list_alloc(16 + 16).unwrap();
        assert_eq!(reused.0, a.0);
        unsafe {
            assert_eq!(reused.block_size(), 32);
            let tail = ObjRef(reused.0 + 32);
            assert!(tail.is_free_block());
            assert_eq!(tail.block_size(), 144 - 32);
            reused.set_method_table(small);
        }
        h.verify();
    }

    #[test]
    fn test_too_small_remnant_not_split() {
        let mut h = heap();
        let mt = plain_mt(32); // block 48
        let a = h.alloc_object(mt).unwrap();
        let _fence = h.alloc_object(mt).unwrap();
        unsafe { h.release(a) };

        // 40-byte request leaves an 8-byte remnant: below MIN_FREE_BLOCK,
        // so the whole 48-byte block is handed out.
        let reused = h.free_list_alloc(40).unwrap();
        assert_eq!(reused.0, a.0);
        unsafe {
            assert_eq!(reused.block_size(), 48);
            reused.set_method_table(mt);
        }
        h.verify();
    }

    #[test]
    fn test_find_object_and_interior() {
        let mut h = heap();
        let mt = plain_mt(32);
        let a = h.alloc_object(mt).unwrap();
        assert_eq!(h.find_object(a.0), Some(a));
        assert_eq!(h.find_object(a.0 + 8), Some(a));
        assert_eq!(h.find_object(0x10), None);
        assert!(h.is_object_start(a.0));
        assert!(!h.is_object_start(a.0 + 8));
    }

    #[test]
    fn test_large_allocation_gets_own_region() {
        let mut h = heap();
        let huge = {
            let mut b = MethodTableBuilder::new("Blob");
            b.base_size = (2 * REGION_SIZE) as u32;
            b.build()
        };
        let obj = h.alloc_object(huge).unwrap();
        unsafe {
            assert_eq!(obj.block_size(), 16 + 2 * REGION_SIZE);
        }
        assert!(h.stats().region_count >= 1);
        h.verify();
    }
}
