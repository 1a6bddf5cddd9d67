//! Loaded assemblies
//!
//! The registry is the central directory of loaded images: one record per
//! assembly holding the image bytes, its metadata view, the token→
//! MethodTable map, the static-field arena and the resolved assembly
//! references. Unloading is dependency-checked: an assembly stays while
//! any other loaded assembly references it.

pub mod loader;

use crate::error::{Result, RuntimeError};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use silex_metadata::{MetadataView, TableId};
use std::sync::Arc;

/// Size of one assembly's static-field arena.
const STATICS_ARENA_SIZE: usize = 64 * 1024;

/// Per-assembly static-field storage: one contiguous block, slots handed
/// out at resolution time, reference slots doubling as GC roots.
pub struct StaticsArena {
    base: usize,
    size: usize,
    cursor: usize,
    ref_slots: Vec<usize>,
}

impl StaticsArena {
    fn new() -> StaticsArena {
        let block: Box<[u8]> = vec![0u8; STATICS_ARENA_SIZE].into_boxed_slice();
        StaticsArena {
            base: Box::leak(block).as_mut_ptr() as usize,
            size: STATICS_ARENA_SIZE,
            cursor: 0,
        ref_slots: Vec::new(),
        }
    }

    /// Assign a slot of `size` bytes (8-byte aligned). Reference-typed
    /// slots are recorded as roots.
    pub fn assign(&mut self, size: usize, is_ref: bool) -> usize {
        let aligned = (size.max(1) + 7) / 8 * 8;
        assert!(self.cursor + aligned <= self.size, "statics arena exhausted");
        let addr = self.base + self.cursor;
        self.cursor += aligned;
        if is_ref {
            self.ref_slots.push(addr);
        }
        addr
    }

    pub fn ref_slots(&self) -> &[usize] {
        &self.ref_slots
    }

    fn release(&mut self) {
        // Safety: base/size came from the leaked boxed slice above.
        unsafe {
            let _ = Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.base as *mut u8,
                self.size,
            ));
        }
        self.base = 0;
        self.cursor = 0;
        self.ref_slots.clear();
    }
}

/// One loaded assembly.
pub struct AssemblyRecord {
    pub id: u32,
    pub name: String,
    image: &'static [u8],
    pub view: MetadataView<'static>,
    /// TypeDef token → built MethodTable.
    pub types: Mutex<FxHashMap<u32, &'static crate::types::MethodTable>>,
    /// MethodDef token → vtable slot (virtual methods only).
    pub method_slots: Mutex<FxHashMap<u32, u32>>,
    /// Static Field token → assigned arena address.
    pub static_slots: Mutex<FxHashMap<u32, usize>>,
    pub statics: Mutex<StaticsArena>,
    /// AssemblyRef rid (1-based) → resolved assembly id.
    pub refs: Mutex<FxHashMap<u32, u32>>,
}

impl AssemblyRecord {
    pub fn image(&self) -> &'static [u8] {
        self.image
    }
}

/// The central directory of loaded assemblies.
#[derive(Default)]
pub struct AssemblyRegistry {
    records: RwLock<Vec<Arc<AssemblyRecord>>>,
}

impl AssemblyRegistry {
    pub fn new() -> AssemblyRegistry {
        AssemblyRegistry::default()
    }

    /// Load an assembly from raw image bytes. `bare_metadata` selects the
    /// headerless form (metadata root only, body RVAs are image offsets)
    /// used by synthesized images; boot images are full PE files.
    pub fn load(&self, name: &str, bytes: Vec<u8>, bare_metadata: bool) -> Result<u32> {
        let image: &'static [u8] = Box::leak(bytes.into_boxed_slice());
        let view = if bare_metadata {
            MetadataView::from_metadata_root(image)?
        } else {
            MetadataView::from_pe(image)?
        };
        let mut records = self.records.write();
        let id = records.len() as u32 + 1;
        records.push(Arc::new(AssemblyRecord {
            id,
            name: name.to_string(),
            image,
            view,
            types: Mutex::new(FxHashMap::default()),
            method_slots: Mutex::new(FxHashMap::default()),
            static_slots: Mutex::new(FxHashMap::default()),
            statics: Mutex::new(StaticsArena::new()),
            refs: Mutex::new(FxHashMap::default()),
        }));
        log::info!("assembly {id} loaded: {name}");
        Ok(id)
    }

    pub fn get(&self, id: u32) -> Result<Arc<AssemblyRecord>> {
        self.records
            .read()
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| RuntimeError::AssemblyNotFound(format!("#{id}")))
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<AssemblyRecord>> {
        self.records.read().iter().find(|r| r.name == name).cloned()
    }

    pub fn ids(&self) -> Vec<u32> {
        self.records.read().iter().map(|r| r.id).collect()
    }

    /// All static reference slots across assemblies, for root enumeration.
    pub fn static_roots(&self) -> Vec<usize> {
        let mut roots = Vec::new();
        for record in self.records.read().iter() {
            roots.extend_from_slice(record.statics.lock().ref_slots());
        }
        roots
    }

    /// Resolve an AssemblyRef of `from` to a loaded assembly id, matching
    /// by simple name (version and public-key token are honoured when the
    /// reference carries them; absent means wildcard).
    pub fn resolve_assembly_ref(&self, from: &AssemblyRecord, rid: u32) -> Result<u32> {
        if let Some(&id) = from.refs.lock().get(&rid) {
            return Ok(id);
        }
        let row = from.view.tables().assembly_ref(rid)?;
        let name = from.view.strings().get(row.name)?;
        let target = self
            .by_name(name)
            .ok_or_else(|| RuntimeError::AssemblyNotFound(name.to_string()))?;
        from.refs.lock().insert(rid, target.id);
        Ok(target.id)
    }

    /// True when any other loaded assembly references `id`.
    pub fn is_referenced(&self, id: u32) -> bool {
        for record in self.records.read().iter() {
            if record.id == id {
                continue;
            }
            // Resolved references are authoritative; unresolved ones are
            // compared by simple name.
            if record.refs.lock().values().any(|&r| r == id) {
                return true;
            }
            let count = record.view.tables().row_count(TableId::AssemblyRef);
            for rid in 1..=count {
                if let Ok(row) = record.view.tables().assembly_ref(rid) {
                    if let (Ok(name), Ok(target)) =
                        (record.view.strings().get(row.name), self.get(id))
                    {
                        if name == target.name {
                            return true;
                        }
                    }
                }
            }
        }
        false
    }

    /// Unload an assembly. Refused while referenced; reclaims the image,
    /// the statics arena and the registry entry. Code pages and compiled-
    /// method cells are reclaimed by the caller (runtime) which owns the
    /// code heap and method registry.
    pub fn unload(&self, id: u32) -> Result<()> {
        if self.is_referenced(id) {
            let name = self.get(id)?.name.clone();
            return Err(RuntimeError::AssemblyInUse(name));
        }
        let record = {
            let mut records = self.records.write();
            let at = records
                .iter()
                .position(|r| r.id == id)
                .ok_or_else(|| RuntimeError::AssemblyNotFound(format!("#{id}")))?;
            records.remove(at)
        };
        record.statics.lock().release();
        // The image bytes were leaked at load; reclaim them. MethodTables
        // remain leaked deliberately: dangling type pointers must never be
        // observable, and unload is refused while anyone could hold one.
        // Safety: the slice came from Box::leak in load().
        unsafe {
            let _ = Box::from_raw(record.image as *const [u8] as *mut [u8]);
        }
        log::info!("assembly {id} unloaded: {}", record.name);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statics_arena_assignment() {
        let mut arena = StaticsArena::new();
        let a = arena.assign(4, false);
        let b = arena.assign(8, true);
        let c = arena.assign(24, false);
        assert_eq!(b - a, 8);
        assert_eq!(c - b, 8);
        assert_eq!(arena.ref_slots(), &[b]);
        // Slots are zeroed and writable.
        unsafe {
            assert_eq!(*(a as *const u64), 0);
            *(c as *mut u64) = 7;
            assert_eq!(*(c as *const u64), 7);
        }
        arena.release();
    }

    fn empty_image() -> Vec<u8> {
        // A bare metadata root with empty streams, matching the builder
        // layout in silex-metadata's image tests.
        let mut tables = Vec::new();
        tables.extend_from_slice(&0u32.to_le_bytes());
        tables.push(2);
        tables.push(0);
        tables.push(0);
        tables.push(1);
        tables.extend_from_slice(&0u64.to_le_bytes());
        tables.extend_from_slice(&0u64.to_le_bytes());

        let streams: &[(&str, Vec<u8>)] = &[
            ("#~", tables),
            ("#Strings", b"\0".to_vec()),
            ("#US", vec![0]),
            ("#Blob", vec![0]),
            ("#GUID", Vec::new()),
        ];
        let version = b"v4.0.30319\0\0";
        let mut out = Vec::new();
        out.extend_from_slice(&0x424A_5342u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(version.len() as u32).to_le_bytes());
        out.extend_from_slice(version);
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&(streams.len() as u16).to_le_bytes());
        let mut headers_size = 0;
        for (name, _) in streams {
            headers_size += 8 + (name.len() + 1 + 3) / 4 * 4;
        }
        let mut offset = out.len() + headers_size;
        let mut payloads = Vec::new();
        for (name, data) in streams {
            out.extend_from_slice(&(offset as u32).to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.push(0);
            while out.len() % 4 != 0 {
                out.push(0);
            }
            offset += data.len();
            payloads.extend_from_slice(data);
        }
        out.extend_from_slice(&payloads);
        out
    }

    #[test]
    fn test_load_and_lookup() {
        let registry = AssemblyRegistry::new();
        let id = registry.load("corelib", empty_image(), true).unwrap();
        assert_eq!(id, 1);
        let record = registry.get(id).unwrap();
        assert_eq!(record.name, "corelib");
        assert!(registry.by_name("corelib").is_some());
        assert!(registry.by_name("missing").is_none());
        assert!(registry.get(9).is_err());
    }

    #[test]
    fn test_unload_unreferenced() {
        let registry = AssemblyRegistry::new();
        let id = registry.load("app", empty_image(), true).unwrap();
        registry.unload(id).unwrap();
        assert!(registry.get(id).is_err());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_unload_missing_fails() {
        let registry = AssemblyRegistry::new();
        assert!(registry.unload(3).is_err());
    }
}
