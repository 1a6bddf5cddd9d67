//! Tables-stream decoding
//!
//! The #~ stream holds up to 45 tables whose column widths depend on the
//! heap-size bits and on every table's row count. The layout is computed
//! once per image; row access after that is offset arithmetic over the
//! borrowed stream bytes.

use crate::token::{CodedIndex, TableId, ALL_TABLES};
use crate::{read_u16, read_u32, read_u64, read_u8, MetadataError, Result, Token};

/// Column shapes from ECMA-335 II.22.
#[derive(Debug, Clone, Copy)]
enum Column {
    /// Fixed-width integer column (1, 2, 4 or 8 bytes).
    Fixed(u8),
    /// Index into #Strings.
    Str,
    /// Index into #GUID.
    Guid,
    /// Index into #Blob.
    Blob,
    /// Row index into one table.
    Table(TableId),
    /// Coded index into a table family.
    Coded(CodedIndex),
}

/// Column schema per table, in physical column order.
fn schema(table: TableId) -> &'static [Column] {
    use CodedIndex::*;
    use Column::*;
    use TableId::*;
    match table {
        TableId::Module => &[Fixed(2), Str, Guid, Guid, Guid],
        TableId::TypeRef => &[Coded(ResolutionScope), Str, Str],
        TableId::TypeDef => &[
            Fixed(4),
            Str,
            Str,
            Coded(TypeDefOrRef),
            Table(Field),
            Table(MethodDef),
        ],
        TableId::FieldPtr => &[Table(Field)],
        TableId::Field => &[Fixed(2), Str, Blob],
        TableId::MethodPtr => &[Table(MethodDef)],
        TableId::MethodDef => &[Fixed(4), Fixed(2), Fixed(2), Str, Blob, Table(Param)],
        TableId::ParamPtr => &[Table(Param)],
        TableId::Param => &[Fixed(2), Fixed(2), Str],
        TableId::InterfaceImpl => &[Table(TypeDef), Coded(TypeDefOrRef)],
        TableId::MemberRef => &[Coded(MemberRefParent), Str, Blob],
        TableId::Constant => &[Fixed(2), Coded(HasConstant), Blob],
        TableId::CustomAttribute => &[
            Coded(HasCustomAttribute),
            Coded(CustomAttributeType),
            Blob,
        ],
        TableId::FieldMarshal => &[Coded(HasFieldMarshal), Blob],
        TableId::DeclSecurity => &[Fixed(2), Coded(HasDeclSecurity), Blob],
        TableId::ClassLayout => &[Fixed(2), Fixed(4), Table(TypeDef)],
        TableId::FieldLayout => &[Fixed(4), Table(Field)],
        TableId::StandAloneSig => &[Blob],
        TableId::EventMap => &[Table(TypeDef), Table(Event)],
        TableId::EventPtr => &[Table(Event)],
        TableId::Event => &[Fixed(2), Str, Coded(TypeDefOrRef)],
        TableId::PropertyMap => &[Table(TypeDef), Table(Property)],
        TableId::PropertyPtr => &[Table(Property)],
        TableId::Property => &[Fixed(2), Str, Blob],
        TableId::MethodSemantics => &[Fixed(2), Table(MethodDef), Coded(HasSemantics)],
        TableId::MethodImpl => &[
            Table(TypeDef),
            Coded(MethodDefOrRef),
            Coded(MethodDefOrRef),
        ],
        TableId::ModuleRef => &[Str],
        TableId::TypeSpec => &[Blob],
        TableId::ImplMap => &[Fixed(2), Coded(MemberForwarded), Str, Table(ModuleRef)],
        TableId::FieldRva => &[Fixed(4), Table(Field)],
        TableId::EncLog => &[Fixed(4), Fixed(4)],
        TableId::EncMap => &[Fixed(4)],
        TableId::Assembly => &[
            Fixed(4),
            Fixed(2),
            Fixed(2),
            Fixed(2),
            Fixed(2),
            Fixed(4),
            Blob,
            Str,
            Str,
        ],
        TableId::AssemblyProcessor => &[Fixed(4)],
        TableId::AssemblyOs => &[Fixed(4), Fixed(4), Fixed(4)],
        TableId::AssemblyRef => &[
            Fixed(2),
            Fixed(2),
            Fixed(2),
            Fixed(2),
            Fixed(4),
            Blob,
            Str,
            Str,
            Blob,
        ],
        TableId::AssemblyRefProcessor => &[Fixed(4), Table(AssemblyRef)],
        TableId::AssemblyRefOs => &[Fixed(4), Fixed(4), Fixed(4), Table(AssemblyRef)],
        TableId::File => &[Fixed(4), Str, Blob],
        TableId::ExportedType => &[Fixed(4), Fixed(4), Str, Str, Coded(Implementation)],
        TableId::ManifestResource => &[Fixed(4), Fixed(4), Str, Coded(Implementation)],
        TableId::NestedClass => &[Table(TypeDef), Table(TypeDef)],
        TableId::GenericParam => &[Fixed(2), Fixed(2), Coded(TypeOrMethodDef), Str],
        TableId::MethodSpec => &[Coded(MethodDefOrRef), Blob],
        TableId::GenericParamConstraint => &[Table(GenericParam), Coded(TypeDefOrRef)],
    }
}

/// Decoded view over the #~ stream.
pub struct TablesStream<'a> {
    data: &'a [u8],
    row_counts: [u32; 45],
    row_sizes: [u32; 45],
    /// Byte offset of each table's first row within the stream.
    table_offsets: [u32; 45],
    wide_strings: bool,
    wide_guids: bool,
    wide_blobs: bool,
}

impl<'a> TablesStream<'a> {
    /// Parse the #~ stream header and lay out row offsets.
    pub fn parse(data: &'a [u8]) -> Result<TablesStream<'a>> {
        // Header: reserved u32, major, minor, heap_sizes, reserved, valid
        // u64, sorted u64, then row counts for each set bit of `valid`.
        let heap_sizes = read_u8(data, 6)?;
        let valid = read_u64(data, 8)?;
        let _sorted = read_u64(data, 16)?;

        let mut row_counts = [0u32; 45];
        let mut offset = 24usize;
        for bit in 0..64u32 {
            if valid & (1 << bit) == 0 {
                continue;
            }
            let count = read_u32(data, offset)?;
            offset += 4;
            if bit < 45 {
                row_counts[bit as usize] = count;
            }
        }

        let mut stream = TablesStream {
            data,
            row_counts,
            row_sizes: [0; 45],
            table_offsets: [0; 45],
            wide_strings: heap_sizes & 0x01 != 0,
            wide_guids: heap_sizes & 0x02 != 0,
            wide_blobs: heap_sizes & 0x04 != 0,
        };

        let mut pos = offset as u32;
        for table in ALL_TABLES {
            let idx = table as usize;
            let size: u32 = schema(table)
                .iter()
                .map(|c| stream.column_width(*c) as u32)
                .sum();
            stream.row_sizes[idx] = size;
            stream.table_offsets[idx] = pos;
            pos += size * stream.row_counts[idx];
        }
        if pos as usize > data.len() {
            return Err(MetadataError::Truncated {
                offset: data.len(),
                needed: pos as usize - data.len(),
            });
        }
        Ok(stream)
    }

    /// Rows in `table`.
    pub fn row_count(&self, table: TableId) -> u32 {
        self.row_counts[table as usize]
    }

    fn table_index_width(&self, table: TableId) -> u8 {
        if self.row_counts[table as usize] < 0x1_0000 {
            2
        } else {
            4
        }
    }

    fn coded_index_width(&self, family: CodedIndex) -> u8 {
        let limit = 1u32 << (16 - family.tag_bits());
        let wide = family
            .tables()
            .iter()
            .flatten()
            .any(|t| self.row_counts[*t as usize] >= limit);
        if wide {
            4
        } else {
            2
        }
    }

    fn column_width(&self, column: Column) -> u8 {
        match column {
            Column::Fixed(n) => n,
            Column::Str => {
                if self.wide_strings {
                    4
                } else {
                    2
                }
            }
            Column::Guid => {
                if self.wide_guids {
                    4
                } else {
                    2
                }
            }
            Column::Blob => {
                if self.wide_blobs {
                    4
                } else {
                    2
                }
            }
            Column::Table(t) => self.table_index_width(t),
            Column::Coded(c) => self.coded_index_width(c),
        }
    }

    /// Read raw column `col` of one-based `row` in `table`.
    pub fn column(&self, table: TableId, row: u32, col: usize) -> Result<u32> {
        if row == 0 || row > self.row_counts[table as usize] {
            return Err(MetadataError::RowOutOfRange { table, row });
        }
        let columns = schema(table);
        let mut offset = self.table_offsets[table as usize]
            + (row - 1) * self.row_sizes[table as usize];
        for c in &columns[..col] {
            offset += self.column_width(*c) as u32;
        }
        let offset = offset as usize;
        match self.column_width(columns[col]) {
            1 => Ok(read_u8(self.data, offset)? as u32),
            2 => Ok(read_u16(self.data, offset)? as u32),
            4 => read_u32(self.data, offset),
            8 => Ok(read_u64(self.data, offset)? as u32),
            w => unreachable!("column width {w}"),
        }
    }

    /// Read a coded-index column and decode it to a token.
    pub fn coded_column(&self, table: TableId, row: u32, col: usize) -> Result<Token> {
        let Column::Coded(family) = schema(table)[col] else {
            unreachable!("column {col} of {table:?} is not a coded index");
        };
        family.decode(self.column(table, row, col)?)
    }

    /// Read a plain table-index column as a token into the target table.
    pub fn table_column(&self, table: TableId, row: u32, col: usize) -> Result<Token> {
        let Column::Table(target) = schema(table)[col] else {
            unreachable!("column {col} of {table:?} is not a table index");
        };
        Ok(Token::new(target, self.column(table, row, col)?))
    }

    /// Resolve a list column (e.g. TypeDef.FieldList): the half-open row
    /// range `[start, end)` owned by `row`, where `end` comes from the next
    /// row or the target table's row count.
    pub fn list_range(
        &self,
        table: TableId,
        row: u32,
        col: usize,
        target: TableId,
    ) -> Result<std::ops::Range<u32>> {
        let start = self.column(table, row, col)?;
        let end = if row < self.row_counts[table as usize] {
            self.column(table, row + 1, col)?
        } else {
            self.row_counts[target as usize] + 1
        };
        Ok(start..end.max(start))
    }
}

/// Typed row views for the tables the runtime consumes directly.
pub mod rows {
    use super::*;

    /// TypeRef row: resolution scope + namespace/name.
    #[derive(Debug, Clone)]
    pub struct TypeRefRow {
        pub resolution_scope: Token,
        pub name: u32,
        pub namespace: u32,
    }

    /// TypeDef row with its field/method list ranges resolved.
    #[derive(Debug, Clone)]
    pub struct TypeDefRow {
        pub flags: u32,
        pub name: u32,
        pub namespace: u32,
        pub extends: Token,
        pub fields: std::ops::Range<u32>,
        pub methods: std::ops::Range<u32>,
    }

    /// Field row.
    #[derive(Debug, Clone)]
    pub struct FieldRow {
        pub flags: u16,
        pub name: u32,
        pub signature: u32,
    }

    /// MethodDef row with its param list range resolved.
    #[derive(Debug, Clone)]
    pub struct MethodDefRow {
        pub rva: u32,
        pub impl_flags: u16,
        pub flags: u16,
        pub name: u32,
        pub signature: u32,
    }

    /// MemberRef row.
    #[derive(Debug, Clone)]
    pub struct MemberRefRow {
        pub class: Token,
        pub name: u32,
        pub signature: u32,
    }

    /// AssemblyRef row.
    #[derive(Debug, Clone)]
    pub struct AssemblyRefRow {
        pub version: (u16, u16, u16, u16),
        pub flags: u32,
        pub public_key_or_token: u32,
        pub name: u32,
    }

    /// ClassLayout row.
    #[derive(Debug, Clone)]
    pub struct ClassLayoutRow {
        pub packing_size: u16,
        pub class_size: u32,
        pub parent: Token,
    }

    impl<'a> TablesStream<'a> {
        pub fn type_ref(&self, row: u32) -> Result<TypeRefRow> {
            Ok(TypeRefRow {
                resolution_scope: self.coded_column(TableId::TypeRef, row, 0)?,
                name: self.column(TableId::TypeRef, row, 1)?,
                namespace: self.column(TableId::TypeRef, row, 2)?,
            })
        }

        pub fn type_def(&self, row: u32) -> Result<TypeDefRow> {
            Ok(TypeDefRow {
                flags: self.column(TableId::TypeDef, row, 0)?,
                name: self.column(TableId::TypeDef, row, 1)?,
                namespace: self.column(TableId::TypeDef, row, 2)?,
                extends: self.coded_column(TableId::TypeDef, row, 3)?,
                fields: self.list_range(TableId::TypeDef, row, 4, TableId::Field)?,
                methods: self.list_range(TableId::TypeDef, row, 5, TableId::MethodDef)?,
            })
        }

        pub fn field(&self, row: u32) -> Result<FieldRow> {
            Ok(FieldRow {
                flags: self.column(TableId::Field, row, 0)? as u16,
                name: self.column(TableId::Field, row, 1)?,
                signature: self.column(TableId::Field, row, 2)?,
            })
        }

        pub fn method_def(&self, row: u32) -> Result<MethodDefRow> {
            Ok(MethodDefRow {
                rva: self.column(TableId::MethodDef, row, 0)?,
                impl_flags: self.column(TableId::MethodDef, row, 1)? as u16,
                flags: self.column(TableId::MethodDef, row, 2)? as u16,
                name: self.column(TableId::MethodDef, row, 3)?,
                signature: self.column(TableId::MethodDef, row, 4)?,
            })
        }

        pub fn member_ref(&self, row: u32) -> Result<MemberRefRow> {
            Ok(MemberRefRow {
                class: self.coded_column(TableId::MemberRef, row, 0)?,
                name: self.column(TableId::MemberRef, row, 1)?,
                signature: self.column(TableId::MemberRef, row, 2)?,
            })
        }

        pub fn assembly_ref(&self, row: u32) -> Result<AssemblyRefRow> {
            Ok(AssemblyRefRow {
                version: (
                    self.column(TableId::AssemblyRef, row, 0)? as u16,
                    self.column(TableId::AssemblyRef, row, 1)? as u16,
                    self.column(TableId::AssemblyRef, row, 2)? as u16,
                    self.column(TableId::AssemblyRef, row, 3)? as u16,
                ),
                flags: self.column(TableId::AssemblyRef, row, 4)?,
                public_key_or_token: self.column(TableId::AssemblyRef, row, 5)?,
                name: self.column(TableId::AssemblyRef, row, 6)?,
            })
        }

        /// ClassLayout row for `type_def_row`, if one exists.
        pub fn class_layout_for(&self, type_def_row: u32) -> Result<Option<ClassLayoutRow>> {
            for row in 1..=self.row_count(TableId::ClassLayout) {
                let parent = self.table_column(TableId::ClassLayout, row, 2)?;
                if parent.rid() == type_def_row {
                    return Ok(Some(ClassLayoutRow {
                        packing_size: self.column(TableId::ClassLayout, row, 0)? as u16,
                        class_size: self.column(TableId::ClassLayout, row, 1)?,
                        parent,
                    }));
                }
            }
            Ok(None)
        }

        /// Signature blob index of a StandAloneSig row.
        pub fn stand_alone_sig(&self, row: u32) -> Result<u32> {
            self.column(TableId::StandAloneSig, row, 0)
        }

        /// Signature blob index of a TypeSpec row.
        pub fn type_spec(&self, row: u32) -> Result<u32> {
            self.column(TableId::TypeSpec, row, 0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal #~ stream with the given tables present.
    fn build_stream(tables: &[(TableId, Vec<Vec<u8>>)]) -> Vec<u8> {
        let mut valid = 0u64;
        for (t, _) in tables {
            valid |= 1 << (*t as u64);
        }
        let mut out = Vec::new();
        out.extend_from_slice(&0u32.to_le_bytes());
        out.push(2); // major
        out.push(0); // minor
        out.push(0); // heap sizes: all narrow
        out.push(1); // reserved
        out.extend_from_slice(&valid.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes()); // sorted
        for (_, rows) in tables {
            out.extend_from_slice(&(rows.len() as u32).to_le_bytes());
        }
        for (_, rows) in tables {
            for row in rows {
                out.extend_from_slice(row);
            }
        }
        out
    }

    fn u16le(v: u16) -> [u8; 2] {
        v.to_le_bytes()
    }

    #[test]
    fn test_empty_stream() {
        let data = build_stream(&[]);
        let stream = TablesStream::parse(&data).unwrap();
        for t in ALL_TABLES {
            assert_eq!(stream.row_count(t), 0);
        }
    }

    #[test]
    fn test_field_rows() {
        // Field: flags u16, name Str(2), sig Blob(2)
        let rows = vec![
            [u16le(0x0010), u16le(1), u16le(5)].concat(),
            [u16le(0x0006), u16le(9), u16le(7)].concat(),
        ];
        let data = build_stream(&[(TableId::Field, rows)]);
        let stream = TablesStream::parse(&data).unwrap();
        assert_eq!(stream.row_count(TableId::Field), 2);

        let f1 = stream.field(1).unwrap();
        assert_eq!(f1.flags, 0x0010);
        assert_eq!(f1.name, 1);
        assert_eq!(f1.signature, 5);

        let f2 = stream.field(2).unwrap();
        assert_eq!(f2.flags, 0x0006);
        assert_eq!(f2.name, 9);
        assert!(stream.field(3).is_err());
        assert!(stream.field(0).is_err());
    }

    #[test]
    fn test_typedef_list_ranges() {
        // Two TypeDefs over three Fields: first owns fields 1..2, second 2..4.
        let typedefs = vec![
            [
                &0u32.to_le_bytes()[..],
                &u16le(0),
                &u16le(0),
                &u16le(0), // extends: nil TypeDefOrRef
                &u16le(1), // field list start
                &u16le(1), // method list start
            ]
            .concat(),
            [
                &0u32.to_le_bytes()[..],
                &u16le(0),
                &u16le(0),
                &u16le(0),
                &u16le(2),
                &u16le(1),
            ]
            .concat(),
        ];
        let fields = vec![
            [u16le(0), u16le(0), u16le(0)].concat(),
            [u16le(0), u16le(0), u16le(0)].concat(),
            [u16le(0), u16le(0), u16le(0)].concat(),
        ];
        let data = build_stream(&[(TableId::TypeDef, typedefs), (TableId::Field, fields)]);
        let stream = TablesStream::parse(&data).unwrap();

        let t1 = stream.type_def(1).unwrap();
        let t2 = stream.type_def(2).unwrap();
        assert_eq!(t1.fields, 1..2);
        assert_eq!(t2.fields, 2..4);
        assert!(t1.extends.is_nil());
    }

    #[test]
    fn test_coded_column_decoding() {
        // TypeRef: ResolutionScope coded (2 tag bits), name, namespace.
        // Scope = AssemblyRef row 1 → tag 2.
        let rows = vec![[u16le((1 << 2) | 2), u16le(3), u16le(4)].concat()];
        let data = build_stream(&[(TableId::TypeRef, rows)]);
        let stream = TablesStream::parse(&data).unwrap();
        let r = stream.type_ref(1).unwrap();
        assert_eq!(r.resolution_scope, Token::new(TableId::AssemblyRef, 1));
        assert_eq!(r.name, 3);
        assert_eq!(r.namespace, 4);
    }

    #[test]
    fn test_truncated_stream_rejected() {
        let rows = vec![[u16le(0), u16le(0), u16le(0)].concat()];
        let mut data = build_stream(&[(TableId::Field, rows)]);
        data.truncate(data.len() - 2);
        assert!(TablesStream::parse(&data).is_err());
    }
}
