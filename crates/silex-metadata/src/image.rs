//! Assembly image walk
//!
//! `MetadataView` is the read-only parser over one loaded assembly image.
//! It locates the CLI header through the PE headers, resolves the metadata
//! root, indexes the streams and exposes heap/table/body access. Images
//! loaded by the boot loader are unmapped PE files, so RVAs are translated
//! through the section table.

use crate::streams::{BlobHeap, GuidHeap, StringsHeap, UserStringHeap};
use crate::tables::TablesStream;
use crate::{read_u16, read_u32, MetadataError, Result};

const DOS_MAGIC: u16 = 0x5A4D; // "MZ"
const PE_MAGIC: u32 = 0x0000_4550; // "PE\0\0"
const METADATA_MAGIC: u32 = 0x424A_5342; // "BSJB"
const PE32_MAGIC: u16 = 0x010B;
const PE32_PLUS_MAGIC: u16 = 0x020B;

/// One section's RVA→file-offset mapping.
#[derive(Debug, Clone, Copy)]
struct Section {
    virtual_address: u32,
    virtual_size: u32,
    raw_offset: u32,
    raw_size: u32,
}

/// Read-only metadata view over a loaded assembly image.
pub struct MetadataView<'a> {
    image: &'a [u8],
    sections: Vec<Section>,
    strings: StringsHeap<'a>,
    user_strings: UserStringHeap<'a>,
    blobs: BlobHeap<'a>,
    guids: GuidHeap<'a>,
    tables: TablesStream<'a>,
}

impl<'a> MetadataView<'a> {
    /// Parse a PE/CLI image.
    pub fn from_pe(image: &'a [u8]) -> Result<MetadataView<'a>> {
        if read_u16(image, 0)? != DOS_MAGIC {
            return Err(MetadataError::BadImage("missing MZ signature"));
        }
        let pe_offset = read_u32(image, 0x3C)? as usize;
        if read_u32(image, pe_offset)? != PE_MAGIC {
            return Err(MetadataError::BadImage("missing PE signature"));
        }

        // COFF file header
        let coff = pe_offset + 4;
        let section_count = read_u16(image, coff + 2)? as usize;
        let opt_size = read_u16(image, coff + 16)? as usize;
        let opt = coff + 20;

        // Optional header: the CLI data directory is entry 14.
        let magic = read_u16(image, opt)?;
        let dir_base = match magic {
            PE32_MAGIC => opt + 96,
            PE32_PLUS_MAGIC => opt + 112,
            _ => return Err(MetadataError::BadImage("bad optional-header magic")),
        };
        let dir_count = read_u32(image, dir_base - 4)? as usize;
        if dir_count < 15 {
            return Err(MetadataError::NotCli);
        }
        let cli_rva = read_u32(image, dir_base + 14 * 8)?;
        if cli_rva == 0 {
            return Err(MetadataError::NotCli);
        }

        // Section table follows the optional header.
        let mut sections = Vec::with_capacity(section_count);
        let section_base = opt + opt_size;
        for i in 0..section_count {
            let s = section_base + i * 40;
            sections.push(Section {
                virtual_size: read_u32(image, s + 8)?,
                virtual_address: read_u32(image, s + 12)?,
                raw_size: read_u32(image, s + 16)?,
                raw_offset: read_u32(image, s + 20)?,
            });
        }

        let cli = rva_to_offset(&sections, cli_rva)?;
        // CLI header: cb, versions, then the metadata directory.
        let metadata_rva = read_u32(image, cli + 8)?;
        let metadata_size = read_u32(image, cli + 12)? as usize;
        let metadata_offset = rva_to_offset(&sections, metadata_rva)?;
        let root = image
            .get(metadata_offset..metadata_offset + metadata_size)
            .ok_or(MetadataError::Truncated {
                offset: metadata_offset,
                needed: metadata_size,
            })?;
        Self::with_root(image, sections, root)
    }

    /// Parse a bare metadata root (no PE wrapper). RVAs passed to
    /// [`MetadataView::body_bytes`] are then plain offsets into `image`.
    /// The synthesized images used in tests take this form.
    pub fn from_metadata_root(image: &'a [u8]) -> Result<MetadataView<'a>> {
        Self::with_root(image, Vec::new(), image)
    }

    fn with_root(
        image: &'a [u8],
        sections: Vec<Section>,
        root: &'a [u8],
    ) -> Result<MetadataView<'a>> {
        let signature = read_u32(root, 0)?;
        if signature != METADATA_MAGIC {
            return Err(MetadataError::BadMetadataSignature(signature));
        }
        let version_len = read_u32(root, 12)? as usize;
        let flags_offset = 16 + version_len;
        let stream_count = read_u16(root, flags_offset + 2)? as usize;

        let mut tables_data: Option<&[u8]> = None;
        let mut strings_data: &[u8] = &[];
        let mut us_data: &[u8] = &[];
        let mut blob_data: &[u8] = &[];
        let mut guid_data: &[u8] = &[];

        let mut pos = flags_offset + 4;
        for _ in 0..stream_count {
            let offset = read_u32(root, pos)? as usize;
            let size = read_u32(root, pos + 4)? as usize;
            let name_start = pos + 8;
            let name_end = root[name_start..]
                .iter()
                .position(|&b| b == 0)
                .map(|p| name_start + p)
                .ok_or(MetadataError::BadImage("unterminated stream name"))?;
            let name = &root[name_start..name_end];
            // Name is padded to the next 4-byte boundary including the NUL.
            pos = name_start + (name.len() + 1 + 3) / 4 * 4;

            let bytes = root
                .get(offset..offset + size)
                .ok_or(MetadataError::Truncated { offset, needed: size })?;
            match name {
                b"#~" | b"#-" => tables_data = Some(bytes),
                b"#Strings" => strings_data = bytes,
                b"#US" => us_data = bytes,
                b"#Blob" => blob_data = bytes,
                b"#GUID" => guid_data = bytes,
                _ => {}
            }
        }

        let tables_data = tables_data.ok_or(MetadataError::MissingStream("#~"))?;
        Ok(MetadataView {
            image,
            sections,
            strings: StringsHeap::new(strings_data),
            user_strings: UserStringHeap::new(us_data),
            blobs: BlobHeap::new(blob_data),
            guids: GuidHeap::new(guid_data),
            tables: TablesStream::parse(tables_data)?,
        })
    }

    /// The tables stream.
    pub fn tables(&self) -> &TablesStream<'a> {
        &self.tables
    }

    /// The #Strings heap.
    pub fn strings(&self) -> StringsHeap<'a> {
        self.strings
    }

    /// The #US heap.
    pub fn user_strings(&self) -> UserStringHeap<'a> {
        self.user_strings
    }

    /// The #Blob heap.
    pub fn blobs(&self) -> BlobHeap<'a> {
        self.blobs
    }

    /// The #GUID heap.
    pub fn guids(&self) -> GuidHeap<'a> {
        self.guids
    }

    /// Bytes starting at `rva`, for method-body parsing. For bare metadata
    /// roots the RVA is an offset into the image buffer.
    pub fn body_bytes(&self, rva: u32) -> Result<&'a [u8]> {
        let offset = if self.sections.is_empty() {
            rva as usize
        } else {
            rva_to_offset(&self.sections, rva)?
        };
        self.image.get(offset..).ok_or(MetadataError::Truncated {
            offset,
            needed: 1,
        })
    }
}

fn rva_to_offset(sections: &[Section], rva: u32) -> Result<usize> {
    for s in sections {
        let span = s.virtual_size.max(s.raw_size);
        if rva >= s.virtual_address && rva < s.virtual_address + span {
            return Ok((rva - s.virtual_address + s.raw_offset) as usize);
        }
    }
    Err(MetadataError::BadImage("rva outside all sections"))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Assemble a minimal metadata root with the given streams.
    pub(crate) fn build_root(streams: &[(&str, Vec<u8>)]) -> Vec<u8> {
        let version = b"v4.0.30319\0\0"; // padded to 4
        let mut header = Vec::new();
        header.extend_from_slice(&METADATA_MAGIC.to_le_bytes());
        header.extend_from_slice(&1u16.to_le_bytes());
        header.extend_from_slice(&1u16.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(&(version.len() as u32).to_le_bytes());
        header.extend_from_slice(version);
        header.extend_from_slice(&0u16.to_le_bytes()); // flags
        header.extend_from_slice(&(streams.len() as u16).to_le_bytes());

        // Stream headers, then payloads.
        let mut headers_size = 0;
        for (name, _) in streams {
            headers_size += 8 + (name.len() + 1 + 3) / 4 * 4;
        }
        let mut payload_offset = header.len() + headers_size;
        let mut payloads = Vec::new();
        for (name, data) in streams {
            header.extend_from_slice(&(payload_offset as u32).to_le_bytes());
            header.extend_from_slice(&(data.len() as u32).to_le_bytes());
            header.extend_from_slice(name.as_bytes());
            header.push(0);
            while header.len() % 4 != 0 {
                header.push(0);
            }
            payload_offset += data.len();
            payloads.extend_from_slice(data);
        }
        header.extend_from_slice(&payloads);
        header
    }

    fn empty_tables_stream() -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0u32.to_le_bytes());
        out.push(2);
        out.push(0);
        out.push(0); // heap sizes
        out.push(1);
        out.extend_from_slice(&0u64.to_le_bytes()); // valid
        out.extend_from_slice(&0u64.to_le_bytes()); // sorted
        out
    }

    #[test]
    fn test_bare_root_with_streams() {
        let root = build_root(&[
            ("#~", empty_tables_stream()),
            ("#Strings", b"\0Main\0".to_vec()),
            ("#US", vec![0]),
            ("#Blob", vec![0]),
            ("#GUID", vec![0; 16]),
        ]);
        let view = MetadataView::from_metadata_root(&root).unwrap();
        assert_eq!(view.strings().get(1).unwrap(), "Main");
        assert_eq!(view.guids().get(1).unwrap(), &[0u8; 16]);
        assert_eq!(
            view.tables().row_count(crate::token::TableId::TypeDef),
            0
        );
    }

    #[test]
    fn test_missing_tables_stream() {
        let root = build_root(&[("#Strings", b"\0".to_vec())]);
        assert!(matches!(
            MetadataView::from_metadata_root(&root),
            Err(MetadataError::MissingStream("#~"))
        ));
    }

    #[test]
    fn test_bad_signature() {
        let mut root = build_root(&[("#~", empty_tables_stream())]);
        root[0] = 0;
        assert!(matches!(
            MetadataView::from_metadata_root(&root),
            Err(MetadataError::BadMetadataSignature(_))
        ));
    }

    #[test]
    fn test_not_a_pe() {
        assert!(MetadataView::from_pe(&[0u8; 64]).is_err());
    }
}
