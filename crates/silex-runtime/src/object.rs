//! Managed object references and headers
//!
//! Every heap object carries a 16-byte header at negative offsets from the
//! object pointer:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ -16: block size (u32) │ reserved (u32)       │
//! │  -8: flags (u8) │ sync index (24b) │ hash    │
//! ├──────────────────────────────────────────────┤
//! │   0: MethodTable pointer                     │
//! │  +8: fields / elements                       │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The block-size field makes the heap linearly walkable; free blocks keep
//! the same header shape, set the free flag, and reuse the MethodTable
//! slot as the free-list next pointer.

use crate::types::MethodTable;

/// Total header bytes preceding every object.
pub const HEADER_SIZE: usize = 16;

/// Offset of the first field of a reference-type instance.
pub const FIELDS_OFFSET: usize = 8;

/// Offset of the length field of an array instance.
pub const ARRAY_LENGTH_OFFSET: usize = 8;

/// Offset of the first element of an array instance.
pub const ARRAY_DATA_OFFSET: usize = 16;

bitflags::bitflags! {
    /// Object header flags (low byte of the word at offset -8).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjFlags: u8 {
        const MARK = 0b0001;
        const PINNED = 0b0010;
        const FREE = 0b0100;
        const OLD_GEN = 0b1000;
    }
}

/// A managed object reference: the post-header address of an allocation.
///
/// Null is represented as zero. All accessors are unsafe; callers must
/// hold a reference into a live heap block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ObjRef(pub usize);

impl ObjRef {
    pub const NULL: ObjRef = ObjRef(0);

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    fn size_ptr(self) -> *mut u32 {
        (self.0 - 16) as *mut u32
    }

    #[inline]
    fn meta_ptr(self) -> *mut u64 {
        (self.0 - 8) as *mut u64
    }

    /// Total allocation size including the header.
    ///
    /// # Safety
    /// `self` must point into a live heap block.
    pub unsafe fn block_size(self) -> usize {
        *self.size_ptr() as usize
    }

    pub unsafe fn set_block_size(self, size: usize) {
        debug_assert!(size >= HEADER_SIZE + 8);
        *self.size_ptr() = size as u32;
        *self.size_ptr().add(1) = 0;
    }

    pub unsafe fn flags(self) -> ObjFlags {
        ObjFlags::from_bits_truncate(*self.meta_ptr() as u8)
    }

    pub unsafe fn set_flag(self, flag: ObjFlags) {
        *self.meta_ptr() |= flag.bits() as u64;
    }

    pub unsafe fn clear_flag(self, flag: ObjFlags) {
        *self.meta_ptr() &= !(flag.bits() as u64);
    }

    pub unsafe fn is_marked(self) -> bool {
        self.flags().contains(ObjFlags::MARK)
    }

    pub unsafe fn is_pinned(self) -> bool {
        self.flags().contains(ObjFlags::PINNED)
    }

    pub unsafe fn is_free_block(self) -> bool {
        self.flags().contains(ObjFlags::FREE)
    }

    /// 24-bit sync-block index.
    pub unsafe fn sync_index(self) -> u32 {
        ((*self.meta_ptr() >> 8) & 0x00FF_FFFF) as u32
    }

    pub unsafe fn set_sync_index(self, index: u32) {
        debug_assert!(index <= 0x00FF_FFFF);
        let meta = *self.meta_ptr();
        *self.meta_ptr() = (meta & !0x0000_0000_FFFF_FF00) | ((index as u64) << 8);
    }

    /// Stored identity hash; zero means not yet computed.
    pub unsafe fn raw_hash(self) -> u32 {
        (*self.meta_ptr() >> 32) as u32
    }

    pub unsafe fn set_raw_hash(self, hash: u32) {
        let meta = *self.meta_ptr();
        *self.meta_ptr() = (meta & 0x0000_0000_FFFF_FFFF) | ((hash as u64) << 32);
    }

    /// The object's MethodTable.
    pub unsafe fn method_table(self) -> &'static MethodTable {
        &*(*(self.0 as *const usize) as *const MethodTable)
    }

    pub unsafe fn set_method_table(self, mt: &'static MethodTable) {
        *(self.0 as *mut usize) = mt as *const MethodTable as usize;
    }

    /// Free-list successor; meaningful only with the free flag set.
    pub unsafe fn free_next(self) -> ObjRef {
        debug_assert!(self.is_free_block());
        ObjRef(*(self.0 as *const usize))
    }

    pub unsafe fn set_free_next(self, next: ObjRef) {
        *(self.0 as *mut usize) = next.0;
    }

    /// Raw pointer to `offset` bytes into the object.
    #[inline]
    pub fn field_ptr(self, offset: usize) -> *mut u8 {
        (self.0 + offset) as *mut u8
    }

    /// Array length, for array instances.
    pub unsafe fn array_length(self) -> usize {
        *(self.field_ptr(ARRAY_LENGTH_OFFSET) as *const usize)
    }

    pub unsafe fn set_array_length(self, len: usize) {
        *(self.field_ptr(ARRAY_LENGTH_OFFSET) as *mut usize) = len;
    }
}

/// Identity hash with lazy computation: derived from the address (objects
/// never move), folded so it is never zero, and cached in the header.
pub unsafe fn identity_hash(obj: ObjRef) -> u32 {
    let stored = obj.raw_hash();
    if stored != 0 {
        return stored;
    }
    let hash = fnv1a_u64(obj.0 as u64);
    let hash = if hash == 0 { 1 } else { hash };
    obj.set_raw_hash(hash);
    hash
}

/// FNV-1a over the eight bytes of a word.
pub fn fnv1a_u64(value: u64) -> u32 {
    let mut hash: u32 = 0x811C_9DC5;
    for shift in (0..64).step_by(8) {
        hash ^= ((value >> shift) & 0xFF) as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// FNV-1a over a UTF-16 code-unit sequence; used by the string pool.
pub fn fnv1a_utf16(units: &[u16]) -> u32 {
    let mut hash: u32 = 0x811C_9DC5;
    for unit in units {
        hash ^= (unit & 0xFF) as u32;
        hash = hash.wrapping_mul(0x0100_0193);
        hash ^= (unit >> 8) as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A fake heap block backing one object for header tests.
    fn scratch_block(buf: &mut [u64; 8]) -> ObjRef {
        ObjRef(buf.as_mut_ptr() as usize + HEADER_SIZE)
    }

    #[test]
    fn test_block_size_round_trip() {
        let mut buf = [0u64; 8];
        let obj = scratch_block(&mut buf);
        unsafe {
            obj.set_block_size(48);
            assert_eq!(obj.block_size(), 48);
        }
    }

    #[test]
    fn test_flags_do_not_disturb_hash() {
        let mut buf = [0u64; 8];
        let obj = scratch_block(&mut buf);
        unsafe {
            obj.set_raw_hash(0xDEAD_BEEF);
            obj.set_flag(ObjFlags::MARK);
            obj.set_flag(ObjFlags::PINNED);
            assert!(obj.is_marked());
            assert!(obj.is_pinned());
            assert_eq!(obj.raw_hash(), 0xDEAD_BEEF);

            obj.clear_flag(ObjFlags::MARK);
            assert!(!obj.is_marked());
            assert!(obj.is_pinned());
        }
    }

    #[test]
    fn test_sync_index_masking() {
        let mut buf = [0u64; 8];
        let obj = scratch_block(&mut buf);
        unsafe {
            obj.set_flag(ObjFlags::MARK);
            obj.set_raw_hash(7);
            obj.set_sync_index(0x00AB_CDEF);
            assert_eq!(obj.sync_index(), 0x00AB_CDEF);
            assert!(obj.is_marked());
            assert_eq!(obj.raw_hash(), 7);
        }
    }

    #[test]
    fn test_identity_hash_stable_and_nonzero() {
        let mut buf = [0u64; 8];
        let obj = scratch_block(&mut buf);
        unsafe {
            let first = identity_hash(obj);
            assert_ne!(first, 0);
            assert_eq!(identity_hash(obj), first);
            assert_eq!(obj.raw_hash(), first);
        }
    }

    #[test]
    fn test_fnv_utf16_differs() {
        let a = fnv1a_utf16(&[b'a' as u16, b'b' as u16]);
        let b = fnv1a_utf16(&[b'b' as u16, b'a' as u16]);
        assert_ne!(a, b);
    }
}
