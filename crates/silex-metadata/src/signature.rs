//! Signature blob decoding
//!
//! Signatures are compressed trees stored in the #Blob heap. The decoder
//! produces `TypeSig` trees plus the method/field/locals wrappers the
//! runtime consumes. Element-type constants follow ECMA-335 II.23.1.16.

use crate::streams::BlobReader;
use crate::token::{CodedIndex, Token};
use crate::{MetadataError, Result};

// Element types (ECMA-335 II.23.1.16)
const ELEMENT_TYPE_VOID: u8 = 0x01;
const ELEMENT_TYPE_BOOLEAN: u8 = 0x02;
const ELEMENT_TYPE_CHAR: u8 = 0x03;
const ELEMENT_TYPE_I1: u8 = 0x04;
const ELEMENT_TYPE_U1: u8 = 0x05;
const ELEMENT_TYPE_I2: u8 = 0x06;
const ELEMENT_TYPE_U2: u8 = 0x07;
const ELEMENT_TYPE_I4: u8 = 0x08;
const ELEMENT_TYPE_U4: u8 = 0x09;
const ELEMENT_TYPE_I8: u8 = 0x0A;
const ELEMENT_TYPE_U8: u8 = 0x0B;
const ELEMENT_TYPE_R4: u8 = 0x0C;
const ELEMENT_TYPE_R8: u8 = 0x0D;
const ELEMENT_TYPE_STRING: u8 = 0x0E;
const ELEMENT_TYPE_PTR: u8 = 0x0F;
const ELEMENT_TYPE_BYREF: u8 = 0x10;
const ELEMENT_TYPE_VALUETYPE: u8 = 0x11;
const ELEMENT_TYPE_CLASS: u8 = 0x12;
const ELEMENT_TYPE_VAR: u8 = 0x13;
const ELEMENT_TYPE_ARRAY: u8 = 0x14;
const ELEMENT_TYPE_GENERICINST: u8 = 0x15;
const ELEMENT_TYPE_TYPEDBYREF: u8 = 0x16;
const ELEMENT_TYPE_I: u8 = 0x18;
const ELEMENT_TYPE_U: u8 = 0x19;
const ELEMENT_TYPE_FNPTR: u8 = 0x1B;
const ELEMENT_TYPE_OBJECT: u8 = 0x1C;
const ELEMENT_TYPE_SZARRAY: u8 = 0x1D;
const ELEMENT_TYPE_MVAR: u8 = 0x1E;
const ELEMENT_TYPE_CMOD_REQD: u8 = 0x1F;
const ELEMENT_TYPE_CMOD_OPT: u8 = 0x20;
const ELEMENT_TYPE_SENTINEL: u8 = 0x41;
const ELEMENT_TYPE_PINNED: u8 = 0x45;

// Calling-convention byte
const SIG_HAS_THIS: u8 = 0x20;
const SIG_EXPLICIT_THIS: u8 = 0x40;
const SIG_VARARG: u8 = 0x05;
const SIG_GENERIC: u8 = 0x10;
const SIG_FIELD: u8 = 0x06;
const SIG_LOCALS: u8 = 0x07;

/// A decoded type shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeSig {
    Void,
    Bool,
    Char,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    R4,
    R8,
    /// native int
    I,
    /// native unsigned int
    U,
    String,
    Object,
    /// Object-reference type by token.
    Class(Token),
    /// Value type by token.
    ValueType(Token),
    /// Single-dimension zero-based array.
    SzArray(Box<TypeSig>),
    /// Multi-dimensional array; only the rank matters to the runtime.
    Array { element: Box<TypeSig>, rank: u32 },
    /// Managed pointer.
    ByRef(Box<TypeSig>),
    /// Unmanaged pointer.
    Ptr(Box<TypeSig>),
    /// Generic type parameter (`!n`).
    Var(u32),
    /// Generic method parameter (`!!n`).
    MVar(u32),
    /// Instantiated generic type.
    GenericInst {
        is_value_type: bool,
        definition: Token,
        args: Vec<TypeSig>,
    },
    /// Function pointer.
    FnPtr(Box<MethodSig>),
    TypedByRef,
    /// Pinned local.
    Pinned(Box<TypeSig>),
}

impl TypeSig {
    /// True for types held as object references on the GC heap.
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            TypeSig::String
                | TypeSig::Object
                | TypeSig::Class(_)
                | TypeSig::SzArray(_)
                | TypeSig::Array { .. }
                | TypeSig::GenericInst {
                    is_value_type: false,
                    ..
                }
        )
    }

    /// True for value types that need token resolution to size.
    pub fn is_value_type(&self) -> bool {
        matches!(
            self,
            TypeSig::ValueType(_)
                | TypeSig::GenericInst {
                    is_value_type: true,
                    ..
                }
        )
    }
}

/// A decoded method signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSig {
    pub has_this: bool,
    pub explicit_this: bool,
    pub vararg: bool,
    /// Generic parameter count, zero for non-generic methods.
    pub generic_params: u32,
    pub ret: TypeSig,
    pub params: Vec<TypeSig>,
}

/// A decoded field signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldSig {
    pub ty: TypeSig,
}

/// A decoded locals signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalsSig {
    pub locals: Vec<TypeSig>,
}

impl MethodSig {
    /// Decode a MethodDef/MemberRef signature blob.
    pub fn parse(reader: &mut BlobReader<'_>) -> Result<MethodSig> {
        let conv = reader.read_u8()?;
        let has_this = conv & SIG_HAS_THIS != 0;
        let explicit_this = conv & SIG_EXPLICIT_THIS != 0;
        let vararg = conv & 0x0F == SIG_VARARG;
        let generic_params = if conv & SIG_GENERIC != 0 {
            reader.read_compressed_u32()?
        } else {
            0
        };
        let param_count = reader.read_compressed_u32()?;
        let ret = parse_type(reader)?;
        let mut params = Vec::with_capacity(param_count as usize);
        for _ in 0..param_count {
            if reader.peek_u8()? == ELEMENT_TYPE_SENTINEL {
                reader.read_u8()?;
            }
            params.push(parse_type(reader)?);
        }
        Ok(MethodSig {
            has_this,
            explicit_this,
            vararg,
            generic_params,
            ret,
            params,
        })
    }
}

impl FieldSig {
    /// Decode a Field signature blob.
    pub fn parse(reader: &mut BlobReader<'_>) -> Result<FieldSig> {
        let conv = reader.read_u8()?;
        if conv & 0x0F != SIG_FIELD {
            return Err(MetadataError::BadSignature("not a field signature"));
        }
        Ok(FieldSig {
            ty: parse_type(reader)?,
        })
    }
}

impl LocalsSig {
    /// Decode a StandAloneSig locals blob.
    pub fn parse(reader: &mut BlobReader<'_>) -> Result<LocalsSig> {
        let conv = reader.read_u8()?;
        if conv != SIG_LOCALS {
            return Err(MetadataError::BadSignature("not a locals signature"));
        }
        let count = reader.read_compressed_u32()?;
        let mut locals = Vec::with_capacity(count as usize);
        for _ in 0..count {
            locals.push(parse_type(reader)?);
        }
        Ok(LocalsSig { locals })
    }
}

/// Decode a TypeSpec blob: a bare type.
pub fn parse_type_spec(reader: &mut BlobReader<'_>) -> Result<TypeSig> {
    parse_type(reader)
}

fn parse_token(reader: &mut BlobReader<'_>) -> Result<Token> {
    CodedIndex::TypeDefOrRef.decode(reader.read_compressed_u32()?)
}

/// Decode one type, consuming custom modifiers in front of it.
pub fn parse_type(reader: &mut BlobReader<'_>) -> Result<TypeSig> {
    let mut elem = reader.read_u8()?;
    // Custom modifiers annotate the following type; the runtime ignores
    // them beyond skipping the modifier token.
    while elem == ELEMENT_TYPE_CMOD_REQD || elem == ELEMENT_TYPE_CMOD_OPT {
        let _ = parse_token(reader)?;
        elem = reader.read_u8()?;
    }
    Ok(match elem {
        ELEMENT_TYPE_VOID => TypeSig::Void,
        ELEMENT_TYPE_BOOLEAN => TypeSig::Bool,
        ELEMENT_TYPE_CHAR => TypeSig::Char,
        ELEMENT_TYPE_I1 => TypeSig::I1,
        ELEMENT_TYPE_U1 => TypeSig::U1,
        ELEMENT_TYPE_I2 => TypeSig::I2,
        ELEMENT_TYPE_U2 => TypeSig::U2,
        ELEMENT_TYPE_I4 => TypeSig::I4,
        ELEMENT_TYPE_U4 => TypeSig::U4,
        ELEMENT_TYPE_I8 => TypeSig::I8,
        ELEMENT_TYPE_U8 => TypeSig::U8,
        ELEMENT_TYPE_R4 => TypeSig::R4,
        ELEMENT_TYPE_R8 => TypeSig::R8,
        ELEMENT_TYPE_I => TypeSig::I,
        ELEMENT_TYPE_U => TypeSig::U,
        ELEMENT_TYPE_STRING => TypeSig::String,
        ELEMENT_TYPE_OBJECT => TypeSig::Object,
        ELEMENT_TYPE_TYPEDBYREF => TypeSig::TypedByRef,
        ELEMENT_TYPE_CLASS => TypeSig::Class(parse_token(reader)?),
        ELEMENT_TYPE_VALUETYPE => TypeSig::ValueType(parse_token(reader)?),
        ELEMENT_TYPE_SZARRAY => TypeSig::SzArray(Box::new(parse_type(reader)?)),
        ELEMENT_TYPE_ARRAY => {
            let element = Box::new(parse_type(reader)?);
            let rank = reader.read_compressed_u32()?;
            let sizes = reader.read_compressed_u32()?;
            for _ in 0..sizes {
                let _ = reader.read_compressed_u32()?;
            }
            let lo_bounds = reader.read_compressed_u32()?;
            for _ in 0..lo_bounds {
                let _ = reader.read_compressed_i32()?;
            }
            TypeSig::Array { element, rank }
        }
        ELEMENT_TYPE_BYREF => TypeSig::ByRef(Box::new(parse_type(reader)?)),
        ELEMENT_TYPE_PTR => TypeSig::Ptr(Box::new(parse_type(reader)?)),
        ELEMENT_TYPE_VAR => TypeSig::Var(reader.read_compressed_u32()?),
        ELEMENT_TYPE_MVAR => TypeSig::MVar(reader.read_compressed_u32()?),
        ELEMENT_TYPE_GENERICINST => {
            let kind = reader.read_u8()?;
            let is_value_type = match kind {
                ELEMENT_TYPE_CLASS => false,
                ELEMENT_TYPE_VALUETYPE => true,
                _ => return Err(MetadataError::BadSignature("bad generic inst kind")),
            };
            let definition = parse_token(reader)?;
            let count = reader.read_compressed_u32()?;
            let mut args = Vec::with_capacity(count as usize);
            for _ in 0..count {
                args.push(parse_type(reader)?);
            }
            TypeSig::GenericInst {
                is_value_type,
                definition,
                args,
            }
        }
        ELEMENT_TYPE_FNPTR => TypeSig::FnPtr(Box::new(MethodSig::parse(reader)?)),
        ELEMENT_TYPE_PINNED => TypeSig::Pinned(Box::new(parse_type(reader)?)),
        _ => return Err(MetadataError::BadSignature("unknown element type")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::TableId;

    fn reader(bytes: &[u8]) -> BlobReader<'_> {
        BlobReader::new(bytes, 0)
    }

    #[test]
    fn test_static_method_sig() {
        // default conv, 2 params, ret i4, params (i4, i4)
        let blob = [0x00, 0x02, 0x08, 0x08, 0x08];
        let sig = MethodSig::parse(&mut reader(&blob)).unwrap();
        assert!(!sig.has_this);
        assert_eq!(sig.ret, TypeSig::I4);
        assert_eq!(sig.params, vec![TypeSig::I4, TypeSig::I4]);
    }

    #[test]
    fn test_instance_method_sig() {
        // hasthis, 1 param, ret void, param string
        let blob = [0x20, 0x01, 0x01, 0x0E];
        let sig = MethodSig::parse(&mut reader(&blob)).unwrap();
        assert!(sig.has_this);
        assert_eq!(sig.ret, TypeSig::Void);
        assert_eq!(sig.params, vec![TypeSig::String]);
    }

    #[test]
    fn test_generic_method_sig() {
        // generic(1), 1 param, ret !!0, param !!0
        let blob = [0x10, 0x01, 0x01, 0x1E, 0x00, 0x1E, 0x00];
        let sig = MethodSig::parse(&mut reader(&blob)).unwrap();
        assert_eq!(sig.generic_params, 1);
        assert_eq!(sig.ret, TypeSig::MVar(0));
        assert_eq!(sig.params, vec![TypeSig::MVar(0)]);
    }

    #[test]
    fn test_field_sig_valuetype() {
        // FIELD, valuetype TypeDef[2]
        let coded = CodedIndex::TypeDefOrRef
            .encode(Token::new(TableId::TypeDef, 2))
            .unwrap();
        assert!(coded < 0x80);
        let blob = [SIG_FIELD, ELEMENT_TYPE_VALUETYPE, coded as u8];
        let sig = FieldSig::parse(&mut reader(&blob)).unwrap();
        assert_eq!(sig.ty, TypeSig::ValueType(Token::new(TableId::TypeDef, 2)));
        assert!(sig.ty.is_value_type());
    }

    #[test]
    fn test_locals_sig_with_pinned() {
        let blob = [
            SIG_LOCALS,
            0x03,
            0x08,                 // i4
            ELEMENT_TYPE_PINNED,
            0x1C,                 // pinned object
            ELEMENT_TYPE_SZARRAY,
            0x08,                 // i4[]
        ];
        let sig = LocalsSig::parse(&mut reader(&blob)).unwrap();
        assert_eq!(sig.locals.len(), 3);
        assert_eq!(sig.locals[0], TypeSig::I4);
        assert_eq!(
            sig.locals[1],
            TypeSig::Pinned(Box::new(TypeSig::Object))
        );
        assert!(sig.locals[2].is_reference());
    }

    #[test]
    fn test_generic_inst() {
        // class List`1<i4>: GENERICINST CLASS TypeDef[5] 1 I4
        let coded = CodedIndex::TypeDefOrRef
            .encode(Token::new(TableId::TypeDef, 5))
            .unwrap();
        let blob = [
            0x00,
            0x00,
            ELEMENT_TYPE_GENERICINST,
            ELEMENT_TYPE_CLASS,
            coded as u8,
            0x01,
            0x08,
        ];
        let sig = MethodSig::parse(&mut reader(&blob)).unwrap();
        match &sig.ret {
            TypeSig::GenericInst {
                is_value_type,
                definition,
                args,
            } => {
                assert!(!is_value_type);
                assert_eq!(*definition, Token::new(TableId::TypeDef, 5));
                assert_eq!(args, &vec![TypeSig::I4]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(sig.ret.is_reference());
    }

    #[test]
    fn test_bad_field_sig() {
        assert!(FieldSig::parse(&mut reader(&[0x00, 0x08])).is_err());
    }
}
