//! Metadata tokens, table identifiers and coded indexes
//!
//! A token is a 32-bit value: table id in the high byte, one-based row id in
//! the low 24 bits. Coded indexes pack a table tag into the low bits of a
//! row index and widen to 4 bytes only when the referenced tables are large.

use crate::{MetadataError, Result};

/// Identifier of a physical metadata table (ECMA-335 II.22).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TableId {
    Module = 0x00,
    TypeRef = 0x01,
    TypeDef = 0x02,
    FieldPtr = 0x03,
    Field = 0x04,
    MethodPtr = 0x05,
    MethodDef = 0x06,
    ParamPtr = 0x07,
    Param = 0x08,
    InterfaceImpl = 0x09,
    MemberRef = 0x0A,
    Constant = 0x0B,
    CustomAttribute = 0x0C,
    FieldMarshal = 0x0D,
    DeclSecurity = 0x0E,
    ClassLayout = 0x0F,
    FieldLayout = 0x10,
    StandAloneSig = 0x11,
    EventMap = 0x12,
    EventPtr = 0x13,
    Event = 0x14,
    PropertyMap = 0x15,
    PropertyPtr = 0x16,
    Property = 0x17,
    MethodSemantics = 0x18,
    MethodImpl = 0x19,
    ModuleRef = 0x1A,
    TypeSpec = 0x1B,
    ImplMap = 0x1C,
    FieldRva = 0x1D,
    EncLog = 0x1E,
    EncMap = 0x1F,
    Assembly = 0x20,
    AssemblyProcessor = 0x21,
    AssemblyOs = 0x22,
    AssemblyRef = 0x23,
    AssemblyRefProcessor = 0x24,
    AssemblyRefOs = 0x25,
    File = 0x26,
    ExportedType = 0x27,
    ManifestResource = 0x28,
    NestedClass = 0x29,
    GenericParam = 0x2A,
    MethodSpec = 0x2B,
    GenericParamConstraint = 0x2C,
}

/// All table ids in ascending order, as they appear in the tables stream.
pub const ALL_TABLES: [TableId; 45] = [
    TableId::Module,
    TableId::TypeRef,
    TableId::TypeDef,
    TableId::FieldPtr,
    TableId::Field,
    TableId::MethodPtr,
    TableId::MethodDef,
    TableId::ParamPtr,
    TableId::Param,
    TableId::InterfaceImpl,
    TableId::MemberRef,
    TableId::Constant,
    TableId::CustomAttribute,
    TableId::FieldMarshal,
    TableId::DeclSecurity,
    TableId::ClassLayout,
    TableId::FieldLayout,
    TableId::StandAloneSig,
    TableId::EventMap,
    TableId::EventPtr,
    TableId::Event,
    TableId::PropertyMap,
    TableId::PropertyPtr,
    TableId::Property,
    TableId::MethodSemantics,
    TableId::MethodImpl,
    TableId::ModuleRef,
    TableId::TypeSpec,
    TableId::ImplMap,
    TableId::FieldRva,
    TableId::EncLog,
    TableId::EncMap,
    TableId::Assembly,
    TableId::AssemblyProcessor,
    TableId::AssemblyOs,
    TableId::AssemblyRef,
    TableId::AssemblyRefProcessor,
    TableId::AssemblyRefOs,
    TableId::File,
    TableId::ExportedType,
    TableId::ManifestResource,
    TableId::NestedClass,
    TableId::GenericParam,
    TableId::MethodSpec,
    TableId::GenericParamConstraint,
];

impl TableId {
    /// Recover a table id from its numeric value.
    pub fn from_u8(value: u8) -> Result<TableId> {
        ALL_TABLES
            .get(value as usize)
            .copied()
            .filter(|t| *t as u8 == value)
            .ok_or(MetadataError::BadTableId(value))
    }
}

/// A 32-bit metadata token: table id in bits 24..32, row id in bits 0..24.
///
/// Row ids are one-based; a token with row id zero is the nil token for its
/// table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub u32);

impl Token {
    /// Build a token from table id and one-based row id.
    pub fn new(table: TableId, rid: u32) -> Token {
        debug_assert!(rid <= 0x00FF_FFFF);
        Token(((table as u32) << 24) | (rid & 0x00FF_FFFF))
    }

    /// The table this token addresses.
    pub fn table(self) -> Result<TableId> {
        TableId::from_u8((self.0 >> 24) as u8)
    }

    /// One-based row id.
    #[inline]
    pub fn rid(self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// True if the row id is zero (no row).
    #[inline]
    pub fn is_nil(self) -> bool {
        self.rid() == 0
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Token({:#010x})", self.0)
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// The coded-index families of ECMA-335 II.24.2.6.
///
/// Each family packs a tag selecting one of a fixed table list into the low
/// bits of a row id. The stored width is 2 bytes unless any referenced table
/// has too many rows for `16 - tag_bits` bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodedIndex {
    TypeDefOrRef,
    HasConstant,
    HasCustomAttribute,
    HasFieldMarshal,
    HasDeclSecurity,
    MemberRefParent,
    HasSemantics,
    MethodDefOrRef,
    MemberForwarded,
    Implementation,
    CustomAttributeType,
    ResolutionScope,
    TypeOrMethodDef,
}

impl CodedIndex {
    /// Tables selectable by this family, in tag order. `None` marks an
    /// unused tag value.
    pub fn tables(self) -> &'static [Option<TableId>] {
        use TableId::*;
        match self {
            CodedIndex::TypeDefOrRef => &[Some(TypeDef), Some(TypeRef), Some(TypeSpec)],
            CodedIndex::HasConstant => &[Some(Field), Some(Param), Some(Property)],
            CodedIndex::HasCustomAttribute => &[
                Some(MethodDef),
                Some(Field),
                Some(TypeRef),
                Some(TypeDef),
                Some(Param),
                Some(InterfaceImpl),
                Some(MemberRef),
                Some(Module),
                Some(DeclSecurity),
                Some(Property),
                Some(Event),
                Some(StandAloneSig),
                Some(ModuleRef),
                Some(TypeSpec),
                Some(Assembly),
                Some(AssemblyRef),
                Some(File),
                Some(ExportedType),
                Some(ManifestResource),
                Some(GenericParam),
                Some(GenericParamConstraint),
                Some(MethodSpec),
            ],
            CodedIndex::HasFieldMarshal => &[Some(Field), Some(Param)],
            CodedIndex::HasDeclSecurity => &[Some(TypeDef), Some(MethodDef), Some(Assembly)],
            CodedIndex::MemberRefParent => &[
                Some(TypeDef),
                Some(TypeRef),
                Some(ModuleRef),
                Some(MethodDef),
                Some(TypeSpec),
            ],
            CodedIndex::HasSemantics => &[Some(Event), Some(Property)],
            CodedIndex::MethodDefOrRef => &[Some(MethodDef), Some(MemberRef)],
            CodedIndex::MemberForwarded => &[Some(Field), Some(MethodDef)],
            CodedIndex::Implementation => &[Some(File), Some(AssemblyRef), Some(ExportedType)],
            CodedIndex::CustomAttributeType => {
                &[None, None, Some(MethodDef), Some(MemberRef), None]
            }
            CodedIndex::ResolutionScope => &[
                Some(Module),
                Some(ModuleRef),
                Some(AssemblyRef),
                Some(TypeRef),
            ],
            CodedIndex::TypeOrMethodDef => &[Some(TypeDef), Some(MethodDef)],
        }
    }

    /// Number of tag bits for this family.
    pub fn tag_bits(self) -> u32 {
        let n = self.tables().len() as u32;
        // Smallest k with 2^k >= n
        32 - (n - 1).leading_zeros()
    }

    /// Decode a raw coded value into a token.
    pub fn decode(self, raw: u32) -> Result<Token> {
        let bits = self.tag_bits();
        let tag = (raw & ((1 << bits) - 1)) as usize;
        let rid = raw >> bits;
        let table = self
            .tables()
            .get(tag)
            .copied()
            .flatten()
            .ok_or(MetadataError::BadCodedIndex(raw))?;
        Ok(Token::new(table, rid))
    }

    /// Encode a token into the raw coded value. Used by the test image
    /// builders; the runtime only decodes.
    pub fn encode(self, token: Token) -> Result<u32> {
        let table = token.table()?;
        let tag = self
            .tables()
            .iter()
            .position(|t| *t == Some(table))
            .ok_or(MetadataError::BadCodedIndex(token.0))?;
        Ok((token.rid() << self.tag_bits()) | tag as u32)
    }
}

bitflags::bitflags! {
    /// TypeDef attribute flags (ECMA-335 II.23.1.15), the subset the
    /// runtime inspects.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeAttributes: u32 {
        const INTERFACE = 0x0000_0020;
        const ABSTRACT = 0x0000_0080;
        const SEALED = 0x0000_0100;
        const EXPLICIT_LAYOUT = 0x0000_0010;
        const SEQUENTIAL_LAYOUT = 0x0000_0008;
        const BEFORE_FIELD_INIT = 0x0010_0000;
    }
}

bitflags::bitflags! {
    /// MethodDef attribute flags (ECMA-335 II.23.1.10), the subset the
    /// runtime inspects.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodAttributes: u16 {
        const STATIC = 0x0010;
        const FINAL = 0x0020;
        const VIRTUAL = 0x0040;
        const HIDE_BY_SIG = 0x0080;
        const NEW_SLOT = 0x0100;
        const ABSTRACT = 0x0400;
        const SPECIAL_NAME = 0x0800;
        const PINVOKE_IMPL = 0x2000;
        const RT_SPECIAL_NAME = 0x1000;
    }
}

bitflags::bitflags! {
    /// Field attribute flags (ECMA-335 II.23.1.5), the subset the runtime
    /// inspects.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FieldAttributes: u16 {
        const STATIC = 0x0010;
        const INIT_ONLY = 0x0020;
        const LITERAL = 0x0040;
        const NOT_SERIALIZED = 0x0080;
        const SPECIAL_NAME = 0x0200;
        const RT_SPECIAL_NAME = 0x0400;
        const HAS_FIELD_RVA = 0x0100;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_parts() {
        let t = Token::new(TableId::MethodDef, 0x2A);
        assert_eq!(t.0, 0x0600_002A);
        assert_eq!(t.table().unwrap(), TableId::MethodDef);
        assert_eq!(t.rid(), 0x2A);
        assert!(!t.is_nil());
        assert!(Token::new(TableId::TypeDef, 0).is_nil());
    }

    #[test]
    fn test_table_id_round_trip() {
        for id in ALL_TABLES {
            assert_eq!(TableId::from_u8(id as u8).unwrap(), id);
        }
        assert!(TableId::from_u8(0x2D).is_err());
        assert!(TableId::from_u8(0xFF).is_err());
    }

    #[test]
    fn test_coded_index_tag_bits() {
        assert_eq!(CodedIndex::TypeDefOrRef.tag_bits(), 2);
        assert_eq!(CodedIndex::HasCustomAttribute.tag_bits(), 5);
        assert_eq!(CodedIndex::MethodDefOrRef.tag_bits(), 1);
        assert_eq!(CodedIndex::MemberRefParent.tag_bits(), 3);
        assert_eq!(CodedIndex::CustomAttributeType.tag_bits(), 3);
        assert_eq!(CodedIndex::ResolutionScope.tag_bits(), 2);
    }

    #[test]
    fn test_coded_index_decode() {
        // TypeDefOrRef: tag 1 = TypeRef
        let tok = CodedIndex::TypeDefOrRef.decode((7 << 2) | 1).unwrap();
        assert_eq!(tok, Token::new(TableId::TypeRef, 7));

        // ResolutionScope: tag 2 = AssemblyRef
        let tok = CodedIndex::ResolutionScope.decode((3 << 2) | 2).unwrap();
        assert_eq!(tok, Token::new(TableId::AssemblyRef, 3));

        // CustomAttributeType tag 0 is unused
        assert!(CodedIndex::CustomAttributeType.decode(8).is_err());
    }

    #[test]
    fn test_coded_index_encode_round_trip() {
        let families = [
            CodedIndex::TypeDefOrRef,
            CodedIndex::MemberRefParent,
            CodedIndex::ResolutionScope,
            CodedIndex::MethodDefOrRef,
        ];
        for family in families {
            for (tag, table) in family.tables().iter().enumerate() {
                let Some(table) = table else { continue };
                let tok = Token::new(*table, 42);
                let raw = family.encode(tok).unwrap();
                assert_eq!(raw & ((1 << family.tag_bits()) - 1), tag as u32);
                assert_eq!(family.decode(raw).unwrap(), tok);
            }
        }
    }
}
