//! Silex managed runtime core
//!
//! The managed heart of the kernel:
//! - **jit**: Tier-0 CIL→x64 compiler, encoder, code heap, method
//!   registry and emitted runtime thunks
//! - **gc**: precise stop-the-world mark-sweep with stack-map-driven
//!   root enumeration
//! - **unwind** / **codemap** / **eh**: Windows-x64-shaped unwind info,
//!   the code-range registry both the GC and exception dispatch walk,
//!   and the two-pass dispatcher itself
//! - **types** / **assembly** / **strings**: MethodTables with GCDescs,
//!   loaded-assembly registries and the intern pool
//! - **platform** / **boot** / **runtime**: the kernel seam, the boot
//!   handoff and process-wide bring-up
//!
//! # Example
//!
//! ```rust,ignore
//! use silex_runtime::{boot, BootInfo, HostPlatform};
//!
//! let rt = boot(std::sync::Arc::new(HostPlatform), BootInfo::empty());
//! let assembly = rt.load_assembly("app", image_bytes, false)?;
//! let result = rt.resolve_and_invoke(assembly, method_token, &[2, 3])?;
//! ```

#![warn(rust_2018_idioms)]
#![allow(clippy::manual_div_ceil)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::new_without_default)]

pub mod assembly;
pub mod boot;
pub mod codemap;
pub mod defaults;
pub mod eh;
pub mod error;
pub mod gc;
pub mod heap;
pub mod jit;
pub mod object;
pub mod platform;
pub mod runtime;
pub mod strings;
pub mod trace;
pub mod types;
pub mod unwind;

pub use boot::BootInfo;
pub use error::{CompileError, Result, RuntimeError};
pub use object::ObjRef;
#[cfg(unix)]
pub use platform::HostPlatform;
pub use platform::{PageProt, Platform};
pub use runtime::{boot, runtime, try_runtime, Runtime, ThreadState};
pub use types::{GcSeries, MethodTable, MethodTableBuilder, MtFlags};
