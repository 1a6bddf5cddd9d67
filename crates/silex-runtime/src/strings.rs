//! String interning
//!
//! Two indices over one pool: `(assembly, user-string-token)` for bytecode
//! `ldstr`, and content hash for `String.Intern`. Every pool entry is a
//! permanent GC root. A miss allocates a new string from the GC heap,
//! pinned until the pool holds it, then indexed under both keys.

use crate::heap::GcHeap;
use crate::object::{fnv1a_utf16, ObjFlags, ObjRef, ARRAY_DATA_OFFSET};
use crate::types::MethodTable;
use rustc_hash::FxHashMap;

/// String instances share the array layout: length at offset 8, UTF-16
/// code units from offset 16, component size 2.
pub fn alloc_string(
    heap: &mut GcHeap,
    string_mt: &'static MethodTable,
    units: &[u16],
) -> Option<ObjRef> {
    let obj = heap.alloc_array(string_mt, units.len())?;
    // Safety: fresh allocation sized for `units`.
    unsafe {
        let data = obj.field_ptr(ARRAY_DATA_OFFSET) as *mut u16;
        std::ptr::copy_nonoverlapping(units.as_ptr(), data, units.len());
    }
    Some(obj)
}

/// Read a managed string's code units.
///
/// # Safety
/// `obj` must be a live string instance.
pub unsafe fn string_units(obj: ObjRef) -> &'static [u16] {
    let len = obj.array_length();
    std::slice::from_raw_parts(obj.field_ptr(ARRAY_DATA_OFFSET) as *const u16, len)
}

/// The intern pool. Callers serialise access (the runtime holds it behind
/// its lock); the pool itself is single-threaded state.
#[derive(Default)]
pub struct StringPool {
    by_token: FxHashMap<(u32, u32), ObjRef>,
    by_hash: FxHashMap<u32, Vec<ObjRef>>,
    handles: Vec<ObjRef>,
}

impl StringPool {
    pub fn new() -> StringPool {
        StringPool::default()
    }

    /// Every interned string; the collector treats these as roots.
    pub fn roots(&self) -> &[ObjRef] {
        &self.handles
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Resolve a `ldstr` literal: by token first, then by content, and
    /// only then a fresh allocation.
    pub fn intern_literal(
        &mut self,
        assembly: u32,
        token: u32,
        units: &[u16],
        heap: &mut GcHeap,
        string_mt: &'static MethodTable,
    ) -> Option<ObjRef> {
        if let Some(&existing) = self.by_token.get(&(assembly, token)) {
            return Some(existing);
        }
        let obj = match self.find_by_content(units) {
            Some(existing) => existing,
            None => {
                let fresh = alloc_string(heap, string_mt, units)?;
                // Safety: fresh string object.
                unsafe { fresh.set_flag(ObjFlags::PINNED) };
                self.insert_content(fresh, units);
                unsafe { fresh.clear_flag(ObjFlags::PINNED) };
                fresh
            }
        };
        self.by_token.insert((assembly, token), obj);
        Some(obj)
    }

    /// `String.Intern`: return the pooled twin of `obj`, inserting `obj`
    /// itself when its content is new.
    ///
    /// # Safety
    /// `obj` must be a live string instance.
    pub unsafe fn intern(&mut self, obj: ObjRef) -> ObjRef {
        let units = string_units(obj);
        if let Some(existing) = self.find_by_content(units) {
            return existing;
        }
        self.insert_content(obj, units);
        obj
    }

    fn find_by_content(&self, units: &[u16]) -> Option<ObjRef> {
        let hash = fnv1a_utf16(units);
        let bucket = self.by_hash.get(&hash)?;
        bucket
            .iter()
            .copied()
            // Safety: pool entries are live interned strings.
            .find(|&s| unsafe { string_units(s) } == units)
    }

    fn insert_content(&mut self, obj: ObjRef, units: &[u16]) {
        let hash = fnv1a_utf16(units);
        self.by_hash.entry(hash).or_default().push(obj);
        self.handles.push(obj);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::platform::HostPlatform;
    use crate::types::{MethodTableBuilder, MtFlags};
    use std::sync::Arc;

    fn string_mt() -> &'static MethodTable {
        let mut b = MethodTableBuilder::new("String");
        b.component_size = 2;
        b.flags = MtFlags::IS_STRING | MtFlags::IS_ARRAY;
        b.build()
    }

    fn units(s: &str) -> Vec<u16> {
        s.encode_utf16().collect()
    }

    #[test]
    fn test_literal_identity_by_token() {
        let mut heap = GcHeap::new(Arc::new(HostPlatform));
        let mt = string_mt();
        let mut pool = StringPool::new();

        let a = pool
            .intern_literal(1, 0x7000_0001, &units("abc"), &mut heap, mt)
            .unwrap();
        let b = pool
            .intern_literal(1, 0x7000_0001, &units("abc"), &mut heap, mt)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_same_content_different_token_shares() {
        let mut heap = GcHeap::new(Arc::new(HostPlatform));
        let mt = string_mt();
        let mut pool = StringPool::new();

        let a = pool
            .intern_literal(1, 0x7000_0001, &units("hello"), &mut heap, mt)
            .unwrap();
        let b = pool
            .intern_literal(2, 0x7000_0009, &units("hello"), &mut heap, mt)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_intern_of_equal_content_is_pointer_equal() {
        let mut heap = GcHeap::new(Arc::new(HostPlatform));
        let mt = string_mt();
        let mut pool = StringPool::new();

        let first = alloc_string(&mut heap, mt, &units("abc")).unwrap();
        let second = alloc_string(&mut heap, mt, &units("abc")).unwrap();
        assert_ne!(first, second);

        unsafe {
            let i1 = pool.intern(first);
            let i2 = pool.intern(second);
            assert_eq!(i1, first);
            assert_eq!(i2, first);
            // Intern is idempotent.
            assert_eq!(pool.intern(i1), first);
        }
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_distinct_content_distinct_entries() {
        let mut heap = GcHeap::new(Arc::new(HostPlatform));
        let mt = string_mt();
        let mut pool = StringPool::new();

        let a = pool
            .intern_literal(1, 1, &units("one"), &mut heap, mt)
            .unwrap();
        let b = pool
            .intern_literal(1, 2, &units("two"), &mut heap, mt)
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.roots().len(), 2);
        unsafe {
            assert_eq!(string_units(a), units("one").as_slice());
            assert_eq!(string_units(b), units("two").as_slice());
        }
    }

    #[test]
    fn test_interned_string_not_pinned_after_insert() {
        let mut heap = GcHeap::new(Arc::new(HostPlatform));
        let mt = string_mt();
        let mut pool = StringPool::new();
        let s = pool
            .intern_literal(1, 1, &units("x"), &mut heap, mt)
            .unwrap();
        unsafe { assert!(!s.is_pinned()) };
    }
}
