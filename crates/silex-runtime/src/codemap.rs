//! Compiled-code registry for unwind lookup
//!
//! Every published method registers its code range (and one extra range
//! per funclet) here, the runtime's equivalent of the platform's
//! `RUNTIME_FUNCTION` tables. Lookup by instruction pointer drives both
//! the GC's stack walk and exception dispatch. Ranges are kept sorted for
//! binary search; registration is rare, lookup is hot.

use crate::eh::NativeEhClause;
use crate::gc::stackmap::StackMap;
use crate::unwind::{virtual_unwind, Context, UnwindInfo};
use parking_lot::RwLock;
use std::sync::Arc;

/// Why a funclet exists; mirrors the owning clause kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncletKind {
    Catch,
    Filter,
    Finally,
    Fault,
}

/// One funclet's code range (method-relative) and unwind description.
#[derive(Debug)]
pub struct FuncletInfo {
    pub kind: FuncletKind,
    pub begin: u32,
    pub end: u32,
    pub unwind: UnwindInfo,
}

/// Everything the runtime keeps about one published method.
pub struct CompiledCode {
    pub assembly: u32,
    pub token: u32,
    pub name: String,
    pub code_base: usize,
    pub code_len: u32,
    pub prologue_len: u32,
    pub unwind: UnwindInfo,
    pub stack_map: StackMap,
    pub eh_clauses: Vec<NativeEhClause>,
    pub funclets: Vec<FuncletInfo>,
}

impl CompiledCode {
    pub fn entry(&self) -> usize {
        self.code_base
    }

    pub fn contains(&self, ip: usize) -> bool {
        ip >= self.code_base && ip < self.code_base + self.code_len as usize
    }

    /// Offset of `ip` from the method start.
    pub fn ip_offset(&self, ip: usize) -> u32 {
        debug_assert!(self.contains(ip));
        (ip - self.code_base) as u32
    }

    /// The funclet containing `offset`, if any.
    pub fn funclet_at(&self, offset: u32) -> Option<usize> {
        self.funclets
            .iter()
            .position(|f| offset >= f.begin && offset < f.end)
    }

    /// Unwind info governing `offset`: the funclet's when inside one.
    pub fn unwind_at(&self, offset: u32) -> (&UnwindInfo, u32) {
        match self.funclet_at(offset) {
            Some(i) => (&self.funclets[i].unwind, offset - self.funclets[i].begin),
            None => (&self.unwind, offset),
        }
    }
}

impl std::fmt::Debug for CompiledCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CompiledCode({} @ {:#x}+{:#x})",
            self.name, self.code_base, self.code_len
        )
    }
}

#[derive(Clone)]
struct Range {
    begin: usize,
    end: usize,
    code: Arc<CompiledCode>,
}

/// Process-wide sorted table of registered code ranges.
#[derive(Default)]
pub struct CodeMap {
    ranges: RwLock<Vec<Range>>,
}

impl CodeMap {
    pub fn new() -> CodeMap {
        CodeMap::default()
    }

    /// Register a method's range. Funclets live inside the method's range
    /// and need no separate entry; their unwind info is selected by
    /// offset through [`CompiledCode::unwind_at`].
    pub fn register(&self, code: Arc<CompiledCode>) {
        let mut ranges = self.ranges.write();
        let begin = code.code_base;
        let end = code.code_base + code.code_len as usize;
        let at = ranges.partition_point(|r| r.begin < begin);
        ranges.insert(at, Range { begin, end, code });
    }

    /// Drop every range belonging to `assembly`; part of assembly unload.
    pub fn unregister_assembly(&self, assembly: u32) {
        self.ranges.write().retain(|r| r.code.assembly != assembly);
    }

    /// The method whose code contains `ip`.
    pub fn lookup(&self, ip: usize) -> Option<Arc<CompiledCode>> {
        let ranges = self.ranges.read();
        let at = ranges.partition_point(|r| r.begin <= ip);
        if at == 0 {
            return None;
        }
        let range = &ranges[at - 1];
        if ip < range.end {
            Some(range.code.clone())
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.ranges.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.read().is_empty()
    }
}

/// One frame produced by a stack walk.
pub struct Frame {
    pub code: Arc<CompiledCode>,
    /// Context at the frame's current instruction (the return address for
    /// caller frames).
    pub context: Context,
    /// Instruction-pointer offset from the method start.
    pub ip_offset: u32,
}

/// Walk frames from `ctx` outward until an instruction pointer leaves the
/// registered code ranges (the runtime's well-known root frame).
///
/// # Safety
/// `ctx` must describe a live, parked thread whose frames conform to the
/// registered unwind info; the walk dereferences stack memory.
pub unsafe fn walk_stack(map: &CodeMap, ctx: &Context, mut f: impl FnMut(&Frame)) {
    let mut current = *ctx;
    while let Some(code) = map.lookup(current.rip as usize) {
        let ip_offset = code.ip_offset(current.rip as usize);
        let frame = Frame {
            code: code.clone(),
            context: current,
            ip_offset,
        };
        f(&frame);
        let (info, rel) = code.unwind_at(ip_offset);
        current = virtual_unwind(info, rel, &current);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::stackmap::StackMapBuilder;

    fn dummy_code(assembly: u32, base: usize, len: u32) -> Arc<CompiledCode> {
        Arc::new(CompiledCode {
            assembly,
            token: 0x0600_0001,
            name: format!("m_{base:x}"),
            code_base: base,
            code_len: len,
            prologue_len: 4,
            unwind: UnwindInfo::default(),
            stack_map: StackMap::decode(&StackMapBuilder::new().encode(len)).unwrap(),
            eh_clauses: Vec::new(),
            funclets: Vec::new(),
        })
    }

    #[test]
    fn test_lookup_hits_and_misses() {
        let map = CodeMap::new();
        map.register(dummy_code(1, 0x1000, 0x100));
        map.register(dummy_code(1, 0x3000, 0x80));
        map.register(dummy_code(2, 0x2000, 0x40));

        assert_eq!(map.lookup(0x1000).unwrap().code_base, 0x1000);
        assert_eq!(map.lookup(0x10FF).unwrap().code_base, 0x1000);
        assert!(map.lookup(0x1100).is_none());
        assert_eq!(map.lookup(0x2001).unwrap().code_base, 0x2000);
        assert_eq!(map.lookup(0x307F).unwrap().code_base, 0x3000);
        assert!(map.lookup(0x500).is_none());
        assert!(map.lookup(0x9000).is_none());
    }

    #[test]
    fn test_unregister_assembly() {
        let map = CodeMap::new();
        map.register(dummy_code(1, 0x1000, 0x100));
        map.register(dummy_code(2, 0x2000, 0x100));
        assert_eq!(map.len(), 2);

        map.unregister_assembly(1);
        assert!(map.lookup(0x1000).is_none());
        assert!(map.lookup(0x2000).is_some());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_funclet_unwind_selection() {
        let mut code = CompiledCode {
            assembly: 1,
            token: 1,
            name: "with_funclet".into(),
            code_base: 0x4000,
            code_len: 0x200,
            prologue_len: 22,
            unwind: UnwindInfo {
                prologue_len: 22,
                frame_reg: Some((5, 0)),
                codes: Vec::new(),
            },
            stack_map: StackMap::decode(&StackMapBuilder::new().encode(0x200)).unwrap(),
            eh_clauses: Vec::new(),
            funclets: Vec::new(),
        };
        code.funclets.push(FuncletInfo {
            kind: FuncletKind::Finally,
            begin: 0x100,
            end: 0x180,
            unwind: UnwindInfo {
                prologue_len: 12,
                frame_reg: None,
                codes: Vec::new(),
            },
        });

        assert_eq!(code.funclet_at(0x80), None);
        assert_eq!(code.funclet_at(0x100), Some(0));
        assert_eq!(code.funclet_at(0x17F), Some(0));
        assert_eq!(code.funclet_at(0x180), None);

        let (info, rel) = code.unwind_at(0x120);
        assert_eq!(info.prologue_len, 12);
        assert_eq!(rel, 0x20);
        let (info, rel) = code.unwind_at(0x80);
        assert_eq!(info.prologue_len, 22);
        assert_eq!(rel, 0x80);
    }
}
