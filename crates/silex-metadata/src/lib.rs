//! ECMA-335 metadata access for the Silex runtime
//!
//! This crate provides the read-only view over a loaded assembly image that
//! the runtime core consumes:
//! - **Image**: PE/CLI header walk down to the metadata root (`image` module)
//! - **Streams**: #Strings, #US, #Blob and #GUID heap access (`streams` module)
//! - **Tables**: tables-stream decoding with 2/4-byte index handling (`tables` module)
//! - **Signatures**: method/field/locals blob decoding (`signature` module)
//! - **Bodies**: method headers, EH sections and CIL opcode decoding (`body` module)
//!
//! Nothing here allocates per lookup; the view borrows the image bytes for
//! its lifetime and resolves offsets on demand.

#![warn(rust_2018_idioms)]

pub mod body;
pub mod build;
pub mod image;
pub mod signature;
pub mod streams;
pub mod tables;
pub mod token;

pub use body::{
    CmpCond, ConvKind, Decoder, EhClause, EhClauseKind, IndKind, Instruction, MethodBody, Op,
};
pub use image::MetadataView;
pub use signature::{FieldSig, LocalsSig, MethodSig, TypeSig};
pub use streams::{BlobHeap, BlobReader, GuidHeap, StringsHeap, UserStringHeap};
pub use tables::TablesStream;
pub use token::{CodedIndex, FieldAttributes, MethodAttributes, TableId, Token, TypeAttributes};

/// Error raised by any layer of metadata decoding.
///
/// A resolution or decode failure is always reported; the view never
/// substitutes zeroed rows or empty blobs for malformed input.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("image truncated: needed {needed} bytes at offset {offset:#x}")]
    Truncated { offset: usize, needed: usize },
    #[error("not a PE image: {0}")]
    BadImage(&'static str),
    #[error("no CLI header in image")]
    NotCli,
    #[error("bad metadata root signature {0:#x}")]
    BadMetadataSignature(u32),
    #[error("missing metadata stream {0}")]
    MissingStream(&'static str),
    #[error("invalid table id {0:#x}")]
    BadTableId(u8),
    #[error("row {row} out of range for table {table:?}")]
    RowOutOfRange { table: TableId, row: u32 },
    #[error("invalid coded index value {0:#x}")]
    BadCodedIndex(u32),
    #[error("heap offset {offset:#x} out of range for {heap}")]
    BadHeapOffset { heap: &'static str, offset: u32 },
    #[error("malformed signature blob: {0}")]
    BadSignature(&'static str),
    #[error("malformed method body: {0}")]
    BadMethodBody(&'static str),
    #[error("unknown opcode {0:#x} at IL offset {1:#x}")]
    UnknownOpcode(u16, u32),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, MetadataError>;

pub(crate) fn read_u16(data: &[u8], offset: usize) -> Result<u16> {
    let bytes = data
        .get(offset..offset + 2)
        .ok_or(MetadataError::Truncated { offset, needed: 2 })?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

pub(crate) fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    let bytes = data
        .get(offset..offset + 4)
        .ok_or(MetadataError::Truncated { offset, needed: 4 })?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub(crate) fn read_u64(data: &[u8], offset: usize) -> Result<u64> {
    let bytes = data
        .get(offset..offset + 8)
        .ok_or(MetadataError::Truncated { offset, needed: 8 })?;
    Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
}

pub(crate) fn read_u8(data: &[u8], offset: usize) -> Result<u8> {
    data.get(offset)
        .copied()
        .ok_or(MetadataError::Truncated { offset, needed: 1 })
}
