//! Default constants for runtime configuration.
//!
//! Centralizes the tunables shared by the heap, collector, code heap and
//! compiler instead of scattering magic numbers.

/// Size of one GC heap region.
pub const REGION_SIZE: usize = 1024 * 1024;

/// Initial GC trigger threshold in bytes.
pub const GC_THRESHOLD: usize = 4 * 1024 * 1024;

/// Smallest remnant worth splitting off a free block. Equals the smallest
/// possible block: 16-byte header plus the next-pointer slot.
pub const MIN_FREE_BLOCK: usize = 24;

/// Size of one code-heap chunk.
pub const CODE_CHUNK_SIZE: usize = 256 * 1024;

/// Platform page size assumed for protection flips.
pub const PAGE_SIZE: usize = 4096;

/// Fixed size of one local-variable slot in a Tier-0 frame. Locals whose
/// type is larger get a correspondingly larger slot.
pub const LOCAL_SLOT: u32 = 64;

/// Worst-case emitted bytes per IL instruction, used to pre-reserve the
/// emission buffer. The largest lowering (value-type call with hidden
/// return buffer) stays well inside this.
pub const MAX_NATIVE_PER_IL: usize = 256;

/// Upper bound on emitted trampoline size; reservations carve this much.
pub const TRAMPOLINE_SIZE: usize = 160;

/// Maximum argument slots `resolve_and_invoke` marshals (register plus
/// stack); reflective calls with more arguments are rejected.
pub const MAX_INVOKE_ARGS: usize = 32;
