//! Exception-handling tables
//!
//! The compiler converts a method body's IL clauses into native-offset
//! clauses whose handlers are funclet indexes. Clause order is preserved
//! from metadata: innermost first, which is the order both dispatch
//! passes scan in.

pub mod dispatch;

use crate::types::MethodTable;

/// Kind plus handler wiring of one native clause.
#[derive(Clone)]
pub enum NativeClauseKind {
    /// Typed catch: matches when the in-flight exception is assignable to
    /// `catch_type`.
    Catch {
        catch_type: &'static MethodTable,
        handler: usize,
    },
    /// Filtered catch: the filter funclet decides.
    Filter { filter: usize, handler: usize },
    Finally { handler: usize },
    Fault { handler: usize },
}

/// One clause with its protected range in native offsets.
#[derive(Clone)]
pub struct NativeEhClause {
    pub kind: NativeClauseKind,
    pub try_begin: u32,
    pub try_end: u32,
}

impl NativeEhClause {
    /// True when the faulting offset lies in the protected range.
    pub fn covers(&self, offset: u32) -> bool {
        offset >= self.try_begin && offset < self.try_end
    }

    /// Funclet index of the handler body.
    pub fn handler_funclet(&self) -> usize {
        match self.kind {
            NativeClauseKind::Catch { handler, .. }
            | NativeClauseKind::Filter { handler, .. }
            | NativeClauseKind::Finally { handler }
            | NativeClauseKind::Fault { handler } => handler,
        }
    }

    pub fn is_finally_or_fault(&self) -> bool {
        matches!(
            self.kind,
            NativeClauseKind::Finally { .. } | NativeClauseKind::Fault { .. }
        )
    }
}

impl std::fmt::Debug for NativeEhClause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            NativeClauseKind::Catch { catch_type, .. } => format!("catch {}", catch_type.name()),
            NativeClauseKind::Filter { .. } => "filter".to_string(),
            NativeClauseKind::Finally { .. } => "finally".to_string(),
            NativeClauseKind::Fault { .. } => "fault".to_string(),
        };
        write!(f, "{kind} try {:#x}..{:#x}", self.try_begin, self.try_end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MethodTableBuilder;

    #[test]
    fn test_covers_range() {
        let mt = MethodTableBuilder::new("E").build();
        let clause = NativeEhClause {
            kind: NativeClauseKind::Catch {
                catch_type: mt,
                handler: 0,
            },
            try_begin: 0x10,
            try_end: 0x30,
        };
        assert!(!clause.covers(0x0F));
        assert!(clause.covers(0x10));
        assert!(clause.covers(0x2F));
        assert!(!clause.covers(0x30));
        assert_eq!(clause.handler_funclet(), 0);
        assert!(!clause.is_finally_or_fault());
    }
}
