//! Runtime error taxonomy
//!
//! Recoverable failures surface as `RuntimeError` and are converted to
//! managed exceptions at the point where managed code observes them.
//! Corruption of the runtime's own invariants goes through [`fatal`],
//! which dumps a classification plus a stack trace to the debug channel
//! and halts; it must never be caught.

use silex_metadata::{MetadataError, Token};

/// Error during Tier-0 compilation of one method.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("unsupported opcode {0:?} at IL offset {1:#x}")]
    UnsupportedOpcode(String, u32),
    #[error("unresolvable token {0} ({1})")]
    UnresolvedToken(Token, &'static str),
    #[error("evaluation-stack mismatch at IL offset {0:#x}: {1}")]
    StackMismatch(u32, &'static str),
    #[error("evaluation-stack underflow at IL offset {0:#x}")]
    StackUnderflow(u32),
    #[error("method has no body")]
    NoBody,
    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),
    #[error("code heap exhausted")]
    CodeHeapExhausted,
}

/// Error surfaced by runtime services.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),
    #[error("compilation failed: {0}")]
    Compile(#[from] CompileError),
    #[error("type {namespace}.{name} not found")]
    TypeNotFound { namespace: String, name: String },
    #[error("method {0} not found")]
    MethodNotFound(String),
    #[error("field {0} not found")]
    FieldNotFound(String),
    #[error("assembly {0} not loaded")]
    AssemblyNotFound(String),
    #[error("assembly {0} is still referenced and cannot be unloaded")]
    AssemblyInUse(String),
    #[error("managed heap exhausted")]
    OutOfMemory,
    #[error("too many arguments for reflective invocation ({0})")]
    TooManyArgs(usize),
    #[error("managed exception in flight")]
    ManagedException,
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Halt the system over an unrecoverable invariant violation.
///
/// Emits one classification line plus whatever stack trace the unwinder
/// can build for the current context, then stops the machine through the
/// platform. Never returns and must never be caught.
pub fn fatal(class: &str, detail: &str) -> ! {
    log::error!("FATAL {class}: {detail}");
    crate::runtime::dump_stack_trace();
    crate::runtime::platform().halt()
}
