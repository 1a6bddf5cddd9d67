//! Runtime type descriptors
//!
//! One `MethodTable` exists per loaded type and per generic instantiation.
//! It is the sole runtime descriptor: instance size, array component size,
//! flags, parent back-pointer for subtype tests, and the vtable of native
//! entries. Immediately *before* the MethodTable in memory sits its GCDesc:
//! a signed series count followed (downwards) by `(offset, run-length)`
//! pairs describing the contiguous runs of reference slots in an instance.
//! A negative count marks an array of value types whose elements contain
//! references; the series then give within-element offsets.
//!
//! Emitted code touches a MethodTable in exactly two ways: loading it from
//! an object header and indexing the vtable, so the vtable offset is a
//! layout constant checked by a test.

use crate::object::{ObjRef, ARRAY_DATA_OFFSET};
use std::alloc::Layout;
use std::sync::atomic::{AtomicUsize, Ordering};

bitflags::bitflags! {
    /// MethodTable flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MtFlags: u32 {
        const HAS_REFERENCES = 0b0000_0001;
        const HAS_FINALIZER = 0b0000_0010;
        const IS_ARRAY = 0b0000_0100;
        const IS_VALUE_TYPE = 0b0000_1000;
        const IS_INTERFACE = 0b0001_0000;
        const IS_STRING = 0b0010_0000;
    }
}

/// One run of reference slots: byte offset from the object pointer and the
/// byte length of the run (a multiple of 8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct GcSeries {
    pub offset: u32,
    pub run_bytes: u32,
}

/// Byte offset of the vtable from the MethodTable base.
pub const VTABLE_OFFSET: usize = std::mem::size_of::<MethodTable>();

/// Runtime type descriptor. Constructed only through [`MethodTableBuilder`];
/// lives for the lifetime of its assembly.
#[derive(Debug)]
#[repr(C)]
pub struct MethodTable {
    base_size: u32,
    component_size: u32,
    flags_bits: u32,
    vtable_len: u32,
    assembly: u32,
    token: u32,
    _reserved: u64,
    parent: *const MethodTable,
    name_ptr: *const u8,
    name_len: usize,
    // vtable entries (usize each) follow immediately.
}

// Safety: MethodTables are immutable after construction except for vtable
// slots, which are only mutated through atomics.
unsafe impl Send for MethodTable {}
unsafe impl Sync for MethodTable {}

impl MethodTable {
    /// Bytes allocated for an instance, including the MethodTable slot.
    #[inline]
    pub fn base_size(&self) -> usize {
        self.base_size as usize
    }

    /// Array element stride; zero for non-arrays (and non-strings).
    #[inline]
    pub fn component_size(&self) -> usize {
        self.component_size as usize
    }

    #[inline]
    pub fn flags(&self) -> MtFlags {
        MtFlags::from_bits_truncate(self.flags_bits)
    }

    #[inline]
    pub fn is_value_type(&self) -> bool {
        self.flags().contains(MtFlags::IS_VALUE_TYPE)
    }

    #[inline]
    pub fn is_array(&self) -> bool {
        self.flags().contains(MtFlags::IS_ARRAY)
    }

    #[inline]
    pub fn has_references(&self) -> bool {
        self.flags().contains(MtFlags::HAS_REFERENCES)
    }

    pub fn parent(&self) -> Option<&'static MethodTable> {
        if self.parent.is_null() {
            None
        } else {
            // Safety: parents outlive their children; both are leaked.
            Some(unsafe { &*self.parent })
        }
    }

    pub fn name(&self) -> &str {
        // Safety: the builder leaked the name alongside the table.
        unsafe {
            std::str::from_utf8_unchecked(std::slice::from_raw_parts(self.name_ptr, self.name_len))
        }
    }

    /// Owning assembly id (raw) and defining token (raw).
    pub fn origin(&self) -> (u32, u32) {
        (self.assembly, self.token)
    }

    #[inline]
    pub fn vtable_len(&self) -> usize {
        self.vtable_len as usize
    }

    fn vtable_entry(&self, slot: usize) -> &AtomicUsize {
        assert!(slot < self.vtable_len as usize, "vtable slot out of range");
        // Safety: the builder allocated vtable_len entries past the struct.
        unsafe {
            let base = (self as *const MethodTable as *const u8).add(VTABLE_OFFSET);
            &*(base as *const AtomicUsize).add(slot)
        }
    }

    /// Read a vtable slot: the native entry address for virtual dispatch.
    pub fn vtable_slot(&self, slot: usize) -> usize {
        self.vtable_entry(slot).load(Ordering::Acquire)
    }

    /// Patch a vtable slot when its method becomes Ready.
    pub fn patch_vtable_slot(&self, slot: usize, entry: usize) {
        self.vtable_entry(slot).store(entry, Ordering::Release);
    }

    /// Signed GCDesc series count stored just below the table.
    fn series_count_raw(&self) -> isize {
        // Safety: the builder wrote the count immediately before the table.
        unsafe { *(self as *const MethodTable as *const isize).sub(1) }
    }

    /// The GCDesc series. Empty when the type holds no references.
    pub fn gc_series(&self) -> &[GcSeries] {
        let count = self.series_count_raw().unsigned_abs();
        if count == 0 {
            return &[];
        }
        // Safety: series were written below the count by the builder.
        unsafe {
            let first = (self as *const MethodTable as *const GcSeries).sub(1 + count);
            std::slice::from_raw_parts(first, count)
        }
    }

    /// True when the GCDesc describes per-element offsets of a value-type
    /// array rather than whole-instance runs.
    pub fn gc_series_per_element(&self) -> bool {
        self.series_count_raw() < 0
    }

    /// Subtype test along the parent chain: is `self` assignable to `base`?
    pub fn is_assignable_to(&self, base: &MethodTable) -> bool {
        let mut current: *const MethodTable = self;
        loop {
            if std::ptr::eq(current, base) {
                return true;
            }
            // Safety: parent chain of leaked tables.
            let parent = unsafe { (*current).parent };
            if parent.is_null() {
                return false;
            }
            current = parent;
        }
    }

    /// Visit the address of every object-reference slot in `obj`.
    ///
    /// # Safety
    /// `obj` must be a live instance of this type.
    pub unsafe fn for_each_ref(&self, obj: ObjRef, mut f: impl FnMut(*mut ObjRef)) {
        if !self.has_references() {
            return;
        }
        if self.is_array() {
            let len = obj.array_length();
            if self.gc_series_per_element() {
                // Value-type elements containing references: apply the
                // per-element series at each element's base.
                let stride = self.component_size();
                for index in 0..len {
                    let element = obj.0 + ARRAY_DATA_OFFSET + index * stride;
                    for series in self.gc_series() {
                        visit_run(element + series.offset as usize, series.run_bytes, &mut f);
                    }
                }
            } else {
                // Array of object references.
                visit_run(obj.0 + ARRAY_DATA_OFFSET, (len * 8) as u32, &mut f);
            }
            return;
        }
        // Value-type series are value-relative; a boxed instance stores
        // the value just past the MethodTable slot.
        let rebase = if self.is_value_type() {
            crate::object::FIELDS_OFFSET
        } else {
            0
        };
        for series in self.gc_series() {
            visit_run(obj.0 + rebase + series.offset as usize, series.run_bytes, &mut f);
        }
    }
}

unsafe fn visit_run(base: usize, run_bytes: u32, f: &mut impl FnMut(*mut ObjRef)) {
    let mut addr = base;
    let end = base + run_bytes as usize;
    while addr < end {
        f(addr as *mut ObjRef);
        addr += 8;
    }
}

/// Builder for a MethodTable plus its GCDesc and vtable, laid out in one
/// leaked allocation.
pub struct MethodTableBuilder {
    pub name: String,
    pub base_size: u32,
    pub component_size: u32,
    pub flags: MtFlags,
    pub parent: Option<&'static MethodTable>,
    pub assembly: u32,
    pub token: u32,
    pub series: Vec<GcSeries>,
    /// Store the series count negated: per-element value-array descriptor.
    pub per_element_series: bool,
    pub vtable: Vec<usize>,
}

impl MethodTableBuilder {
    pub fn new(name: impl Into<String>) -> MethodTableBuilder {
        MethodTableBuilder {
            name: name.into(),
            base_size: 0,
            component_size: 0,
            flags: MtFlags::empty(),
            parent: None,
            assembly: 0,
            token: 0,
            series: Vec::new(),
            per_element_series: false,
            vtable: Vec::new(),
        }
    }

    /// Allocate and initialise the table. The allocation is intentionally
    /// leaked: MethodTables live until their assembly is unloaded, and the
    /// assembly registry tracks the blocks for that.
    pub fn build(self) -> &'static MethodTable {
        let desc_bytes = self.series.len() * 8 + 8;
        let total = desc_bytes + VTABLE_OFFSET + self.vtable.len() * 8;
        let layout = Layout::from_size_align(total, 16).expect("method table layout");
        // Safety: fresh allocation, fully initialised below.
        unsafe {
            let block = std::alloc::alloc_zeroed(layout);
            assert!(!block.is_null(), "method table allocation failed");

            // Series, lowest address first, then the signed count.
            let series_base = block as *mut GcSeries;
            for (i, s) in self.series.iter().enumerate() {
                series_base.add(i).write(*s);
            }
            let count = self.series.len() as isize;
            let count = if self.per_element_series { -count } else { count };
            (block.add(desc_bytes - 8) as *mut isize).write(count);

            let name = Box::leak(self.name.into_boxed_str());
            let mt = block.add(desc_bytes) as *mut MethodTable;
            mt.write(MethodTable {
                base_size: self.base_size,
                component_size: self.component_size,
                flags_bits: self.flags.bits(),
                vtable_len: self.vtable.len() as u32,
                assembly: self.assembly,
                token: self.token,
                _reserved: 0,
                parent: self
                    .parent
                    .map_or(std::ptr::null(), |p| p as *const MethodTable),
                name_ptr: name.as_ptr(),
                name_len: name.len(),
            });
            let vtable = (mt as *mut u8).add(VTABLE_OFFSET) as *mut usize;
            for (i, entry) in self.vtable.iter().enumerate() {
                vtable.add(i).write(*entry);
            }
            &*mt
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::HEADER_SIZE;

    #[test]
    fn test_layout_constants() {
        // Emitted code indexes the vtable at this offset; keep it fixed.
        assert_eq!(std::mem::size_of::<MethodTable>(), 56);
        assert_eq!(VTABLE_OFFSET, 56);
    }

    #[test]
    fn test_build_and_read_back() {
        let mt = {
            let mut b = MethodTableBuilder::new("Widget");
            b.base_size = 32;
            b.flags = MtFlags::HAS_REFERENCES;
            b.series = vec![GcSeries {
                offset: 8,
                run_bytes: 16,
            }];
            b.vtable = vec![0x1000, 0x2000];
            b.build()
        };
        assert_eq!(mt.base_size(), 32);
        assert_eq!(mt.name(), "Widget");
        assert!(mt.has_references());
        assert!(!mt.gc_series_per_element());
        assert_eq!(
            mt.gc_series(),
            &[GcSeries {
                offset: 8,
                run_bytes: 16
            }]
        );
        assert_eq!(mt.vtable_len(), 2);
        assert_eq!(mt.vtable_slot(0), 0x1000);
        mt.patch_vtable_slot(0, 0x3000);
        assert_eq!(mt.vtable_slot(0), 0x3000);
        assert_eq!(mt.vtable_slot(1), 0x2000);
    }

    #[test]
    fn test_subtype_chain() {
        let base = MethodTableBuilder::new("Base").build();
        let mid = {
            let mut b = MethodTableBuilder::new("Mid");
            b.parent = Some(base);
            b.build()
        };
        let leaf = {
            let mut b = MethodTableBuilder::new("Leaf");
            b.parent = Some(mid);
            b.build()
        };
        let other = MethodTableBuilder::new("Other").build();

        assert!(leaf.is_assignable_to(leaf));
        assert!(leaf.is_assignable_to(mid));
        assert!(leaf.is_assignable_to(base));
        assert!(!base.is_assignable_to(leaf));
        assert!(!leaf.is_assignable_to(other));
    }

    #[test]
    fn test_for_each_ref_object() {
        let mt = {
            let mut b = MethodTableBuilder::new("Pair");
            b.base_size = 24;
            b.flags = MtFlags::HAS_REFERENCES;
            b.series = vec![GcSeries {
                offset: 8,
                run_bytes: 16,
            }];
            b.build()
        };
        // Fake instance: header + MT slot + two ref fields.
        let mut block = [0u64; 5];
        let obj = ObjRef(block.as_mut_ptr() as usize + HEADER_SIZE);
        let mut offsets = Vec::new();
        unsafe {
            mt.for_each_ref(obj, |slot| offsets.push(slot as usize - obj.0));
        }
        assert_eq!(offsets, vec![8, 16]);
    }

    #[test]
    fn test_for_each_ref_value_array() {
        // Array of 2 elements, stride 16, one ref at offset 8 of each.
        let mt = {
            let mut b = MethodTableBuilder::new("Entry[]");
            b.component_size = 16;
            b.flags = MtFlags::HAS_REFERENCES | MtFlags::IS_ARRAY;
            b.series = vec![GcSeries {
                offset: 8,
                run_bytes: 8,
            }];
            b.per_element_series = true;
            b.build()
        };
        assert!(mt.gc_series_per_element());
        let mut block = [0u64; 8];
        let obj = ObjRef(block.as_mut_ptr() as usize + HEADER_SIZE);
        unsafe {
            obj.set_array_length(2);
            let mut offsets = Vec::new();
            mt.for_each_ref(obj, |slot| offsets.push(slot as usize - obj.0));
            // Elements at 16 and 32; refs at +8 within each.
            assert_eq!(offsets, vec![24, 40]);
        }
    }

    #[test]
    fn test_for_each_ref_object_array() {
        let mt = {
            let mut b = MethodTableBuilder::new("Object[]");
            b.component_size = 8;
            b.flags = MtFlags::HAS_REFERENCES | MtFlags::IS_ARRAY;
            b.build()
        };
        let mut block = [0u64; 8];
        let obj = ObjRef(block.as_mut_ptr() as usize + HEADER_SIZE);
        unsafe {
            obj.set_array_length(3);
            let mut count = 0;
            mt.for_each_ref(obj, |_| count += 1);
            assert_eq!(count, 3);
        }
    }
}
