//! Just-in-time compilation
//!
//! - **emitter**: the pure x64 encoder
//! - **code_heap**: W^X executable memory
//! - **registry**: the compiled-method reservation/patching table
//! - **thunks**: emitted bridges, trampolines and transition stubs
//! - **compiler**: the Tier-0 IL→x64 pass

pub mod code_heap;
pub mod compiler;
pub mod emitter;
pub mod registry;
pub mod thunks;
