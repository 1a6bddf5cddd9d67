//! Method bodies and CIL opcode decoding
//!
//! Bodies come in tiny and fat shapes; fat bodies may carry exception
//! sections. The opcode decoder normalises the encoded forms (short
//! operands, the `ldarg.0`-style macros) into one `Op` value per
//! instruction, with branch targets already resolved to absolute IL
//! offsets - the shape the Tier-0 compiler consumes directly.

use crate::token::{TableId, Token};
use crate::{read_u16, read_u32, MetadataError, Result};

const TINY_FORMAT: u8 = 0x02;
const FAT_FORMAT: u8 = 0x03;
const FAT_MORE_SECTS: u16 = 0x08;
const FAT_INIT_LOCALS: u16 = 0x10;

const SECT_EH_TABLE: u8 = 0x01;
const SECT_FAT_FORMAT: u8 = 0x40;
const SECT_MORE_SECTS: u8 = 0x80;

/// Kind of an exception-handling clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EhClauseKind {
    /// Typed catch; the token resolves to the caught type.
    Catch(Token),
    /// Filtered handler; the filter code starts at the given IL offset.
    Filter { filter_offset: u32 },
    Finally,
    Fault,
}

/// One exception-handling clause, offsets in IL bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EhClause {
    pub kind: EhClauseKind,
    pub try_offset: u32,
    pub try_len: u32,
    pub handler_offset: u32,
    pub handler_len: u32,
}

impl EhClause {
    /// True if `il_offset` lies inside the try range.
    pub fn covers(&self, il_offset: u32) -> bool {
        il_offset >= self.try_offset && il_offset < self.try_offset + self.try_len
    }

    /// True if `il_offset` lies inside the handler range.
    pub fn handler_covers(&self, il_offset: u32) -> bool {
        il_offset >= self.handler_offset && il_offset < self.handler_offset + self.handler_len
    }
}

/// A parsed method body.
#[derive(Debug)]
pub struct MethodBody<'a> {
    pub max_stack: u32,
    pub code: &'a [u8],
    pub locals_token: Option<Token>,
    pub init_locals: bool,
    pub clauses: Vec<EhClause>,
}

impl<'a> MethodBody<'a> {
    /// Parse a body starting at `bytes[0]`.
    pub fn parse(bytes: &'a [u8]) -> Result<MethodBody<'a>> {
        let first = *bytes
            .first()
            .ok_or(MetadataError::BadMethodBody("empty body"))?;
        if first & 0x3 == TINY_FORMAT {
            let size = (first >> 2) as usize;
            let code = bytes
                .get(1..1 + size)
                .ok_or(MetadataError::BadMethodBody("tiny body truncated"))?;
            return Ok(MethodBody {
                max_stack: 8,
                code,
                locals_token: None,
                init_locals: false,
                clauses: Vec::new(),
            });
        }
        if first & 0x3 != FAT_FORMAT {
            return Err(MetadataError::BadMethodBody("unknown header format"));
        }

        let flags = read_u16(bytes, 0)? & 0x0FFF;
        let header_size = ((read_u16(bytes, 0)? >> 12) as usize) * 4;
        let max_stack = read_u16(bytes, 2)? as u32;
        let code_size = read_u32(bytes, 4)? as usize;
        let locals_raw = read_u32(bytes, 8)?;
        let locals_token = if locals_raw != 0 {
            let tok = Token(locals_raw);
            if tok.table()? != TableId::StandAloneSig {
                return Err(MetadataError::BadMethodBody("bad locals token"));
            }
            Some(tok)
        } else {
            None
        };

        let code = bytes
            .get(header_size..header_size + code_size)
            .ok_or(MetadataError::BadMethodBody("fat body truncated"))?;

        let mut clauses = Vec::new();
        if flags & FAT_MORE_SECTS != 0 {
            // Sections start at the next 4-byte boundary after the code.
            let mut pos = (header_size + code_size + 3) & !3;
            loop {
                let kind = crate::read_u8(bytes, pos)?;
                if kind & SECT_EH_TABLE == 0 {
                    return Err(MetadataError::BadMethodBody("unknown section kind"));
                }
                if kind & SECT_FAT_FORMAT != 0 {
                    let size = read_u32(bytes, pos)? >> 8;
                    let count = (size as usize - 4) / 24;
                    for i in 0..count {
                        let c = pos + 4 + i * 24;
                        clauses.push(parse_clause(
                            read_u32(bytes, c)?,
                            read_u32(bytes, c + 4)?,
                            read_u32(bytes, c + 8)?,
                            read_u32(bytes, c + 12)?,
                            read_u32(bytes, c + 16)?,
                            read_u32(bytes, c + 20)?,
                        )?);
                    }
                    pos += size as usize;
                } else {
                    let size = crate::read_u8(bytes, pos + 1)? as usize;
                    let count = (size - 4) / 12;
                    for i in 0..count {
                        let c = pos + 4 + i * 12;
                        clauses.push(parse_clause(
                            read_u16(bytes, c)? as u32,
                            read_u16(bytes, c + 2)? as u32,
                            crate::read_u8(bytes, c + 4)? as u32,
                            read_u16(bytes, c + 5)? as u32,
                            crate::read_u8(bytes, c + 7)? as u32,
                            read_u32(bytes, c + 8)?,
                        )?);
                    }
                    pos += size;
                }
                if kind & SECT_MORE_SECTS == 0 {
                    break;
                }
            }
        }

        Ok(MethodBody {
            max_stack,
            code,
            locals_token,
            init_locals: flags & FAT_INIT_LOCALS != 0,
            clauses,
        })
    }
}

fn parse_clause(
    flags: u32,
    try_offset: u32,
    try_len: u32,
    handler_offset: u32,
    handler_len: u32,
    class_or_filter: u32,
) -> Result<EhClause> {
    let kind = match flags {
        0 => EhClauseKind::Catch(Token(class_or_filter)),
        1 => EhClauseKind::Filter {
            filter_offset: class_or_filter,
        },
        2 => EhClauseKind::Finally,
        4 => EhClauseKind::Fault,
        _ => return Err(MetadataError::BadMethodBody("bad clause flags")),
    };
    Ok(EhClause {
        kind,
        try_offset,
        try_len,
        handler_offset,
        handler_len,
    })
}

/// Signedness-and-width selector for indirect and array element access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndKind {
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    /// native int
    I,
    R4,
    R8,
    /// object reference
    Ref,
}

impl IndKind {
    /// Bytes moved by this access.
    pub fn size(self) -> u32 {
        match self {
            IndKind::I1 | IndKind::U1 => 1,
            IndKind::I2 | IndKind::U2 => 2,
            IndKind::I4 | IndKind::U4 | IndKind::R4 => 4,
            IndKind::I8 | IndKind::I | IndKind::R8 | IndKind::Ref => 8,
        }
    }
}

/// Target width for conversion opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvKind {
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    I,
    U,
    R4,
    R8,
}

/// Comparison condition for compare-and-branch and compare opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpCond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A normalised CIL instruction.
///
/// Short forms, macro forms (`ldarg.0`…) and signed displacement encodings
/// are folded away; branch targets are absolute IL offsets.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Nop,
    Break,
    LdArg(u16),
    LdArgA(u16),
    StArg(u16),
    LdLoc(u16),
    LdLocA(u16),
    StLoc(u16),
    LdNull,
    LdcI4(i32),
    LdcI8(i64),
    LdcR4(f32),
    LdcR8(f64),
    Dup,
    Pop,
    Jmp(Token),
    Call(Token),
    CallI(Token),
    CallVirt(Token),
    NewObj(Token),
    Ret,
    Br(u32),
    BrFalse(u32),
    BrTrue(u32),
    BrCmp {
        cond: CmpCond,
        unsigned: bool,
        target: u32,
    },
    Switch(Vec<u32>),
    LdInd(IndKind),
    StInd(IndKind),
    Add,
    Sub,
    Mul,
    Div,
    DivUn,
    Rem,
    RemUn,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    ShrUn,
    Neg,
    Not,
    AddOvf { unsigned: bool },
    SubOvf { unsigned: bool },
    MulOvf { unsigned: bool },
    Conv(ConvKind),
    ConvOvf {
        kind: ConvKind,
        unsigned_src: bool,
    },
    ConvRUn,
    CkFinite,
    CpObj(Token),
    LdObj(Token),
    StObj(Token),
    InitObj(Token),
    CpBlk,
    InitBlk,
    LdStr(Token),
    CastClass(Token),
    IsInst(Token),
    Box(Token),
    Unbox(Token),
    UnboxAny(Token),
    Throw,
    Rethrow,
    LdFld(Token),
    LdFldA(Token),
    StFld(Token),
    LdsFld(Token),
    LdsFldA(Token),
    StsFld(Token),
    NewArr(Token),
    LdLen,
    LdElemA(Token),
    LdElem(IndKind),
    LdElemAny(Token),
    StElem(IndKind),
    StElemAny(Token),
    Ceq,
    Cgt,
    CgtUn,
    Clt,
    CltUn,
    LdFtn(Token),
    LdVirtFtn(Token),
    Leave(u32),
    EndFinally,
    EndFilter,
    LocAlloc,
    ArgList,
    MkRefAny(Token),
    RefAnyVal(Token),
    RefAnyType,
    LdToken(Token),
    SizeOf(Token),
    // Prefixes; each applies to the following instruction.
    Unaligned(u8),
    Volatile,
    Tail,
    Constrained(Token),
    ReadOnly,
}

/// One decoded instruction with its IL offset.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub offset: u32,
    pub op: Op,
}

/// Streaming decoder over a method's code bytes.
pub struct Decoder<'a> {
    code: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(code: &'a [u8]) -> Decoder<'a> {
        Decoder { code, pos: 0 }
    }

    /// Decode every instruction in the body.
    pub fn decode_all(code: &'a [u8]) -> Result<Vec<Instruction>> {
        let mut decoder = Decoder::new(code);
        let mut out = Vec::new();
        while let Some(instr) = decoder.next()? {
            out.push(instr);
        }
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        let v = crate::read_u8(self.code, self.pos)?;
        self.pos += 1;
        Ok(v)
    }

    fn u16(&mut self) -> Result<u16> {
        let v = read_u16(self.code, self.pos)?;
        self.pos += 2;
        Ok(v)
    }

    fn u32(&mut self) -> Result<u32> {
        let v = read_u32(self.code, self.pos)?;
        self.pos += 4;
        Ok(v)
    }

    fn u64(&mut self) -> Result<u64> {
        let v = crate::read_u64(self.code, self.pos)?;
        self.pos += 8;
        Ok(v)
    }

    fn token(&mut self) -> Result<Token> {
        Ok(Token(self.u32()?))
    }

    /// Branch target from a signed 8-bit displacement.
    fn target_s8(&mut self) -> Result<u32> {
        let rel = self.u8()? as i8 as i32;
        Ok((self.pos as i32 + rel) as u32)
    }

    /// Branch target from a signed 32-bit displacement.
    fn target_s32(&mut self) -> Result<u32> {
        let rel = self.u32()? as i32;
        Ok((self.pos as i32 + rel) as u32)
    }

    /// Decode the next instruction, or `None` at end of code.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<Instruction>> {
        if self.pos >= self.code.len() {
            return Ok(None);
        }
        let offset = self.pos as u32;
        let byte = self.u8()?;
        let op = match byte {
            0x00 => Op::Nop,
            0x01 => Op::Break,
            0x02..=0x05 => Op::LdArg((byte - 0x02) as u16),
            0x06..=0x09 => Op::LdLoc((byte - 0x06) as u16),
            0x0A..=0x0D => Op::StLoc((byte - 0x0A) as u16),
            0x0E => Op::LdArg(self.u8()? as u16),
            0x0F => Op::LdArgA(self.u8()? as u16),
            0x10 => Op::StArg(self.u8()? as u16),
            0x11 => Op::LdLoc(self.u8()? as u16),
            0x12 => Op::LdLocA(self.u8()? as u16),
            0x13 => Op::StLoc(self.u8()? as u16),
            0x14 => Op::LdNull,
            0x15 => Op::LdcI4(-1),
            0x16..=0x1E => Op::LdcI4((byte - 0x16) as i32),
            0x1F => Op::LdcI4(self.u8()? as i8 as i32),
            0x20 => Op::LdcI4(self.u32()? as i32),
            0x21 => Op::LdcI8(self.u64()? as i64),
            0x22 => Op::LdcR4(f32::from_bits(self.u32()?)),
            0x23 => Op::LdcR8(f64::from_bits(self.u64()?)),
            0x25 => Op::Dup,
            0x26 => Op::Pop,
            0x27 => Op::Jmp(self.token()?),
            0x28 => Op::Call(self.token()?),
            0x29 => Op::CallI(self.token()?),
            0x2A => Op::Ret,
            0x2B => Op::Br(self.target_s8()?),
            0x2C => Op::BrFalse(self.target_s8()?),
            0x2D => Op::BrTrue(self.target_s8()?),
            0x2E..=0x37 => {
                let (cond, unsigned) = branch_cond(byte - 0x2E);
                Op::BrCmp {
                    cond,
                    unsigned,
                    target: self.target_s8()?,
                }
            }
            0x38 => Op::Br(self.target_s32()?),
            0x39 => Op::BrFalse(self.target_s32()?),
            0x3A => Op::BrTrue(self.target_s32()?),
            0x3B..=0x44 => {
                let (cond, unsigned) = branch_cond(byte - 0x3B);
                Op::BrCmp {
                    cond,
                    unsigned,
                    target: self.target_s32()?,
                }
            }
            0x45 => {
                let count = self.u32()? as usize;
                let mut rels = Vec::with_capacity(count);
                for _ in 0..count {
                    rels.push(self.u32()? as i32);
                }
                let base = self.pos as i32;
                Op::Switch(rels.into_iter().map(|r| (base + r) as u32).collect())
            }
            0x46 => Op::LdInd(IndKind::I1),
            0x47 => Op::LdInd(IndKind::U1),
            0x48 => Op::LdInd(IndKind::I2),
            0x49 => Op::LdInd(IndKind::U2),
            0x4A => Op::LdInd(IndKind::I4),
            0x4B => Op::LdInd(IndKind::U4),
            0x4C => Op::LdInd(IndKind::I8),
            0x4D => Op::LdInd(IndKind::I),
            0x4E => Op::LdInd(IndKind::R4),
            0x4F => Op::LdInd(IndKind::R8),
            0x50 => Op::LdInd(IndKind::Ref),
            0x51 => Op::StInd(IndKind::Ref),
            0x52 => Op::StInd(IndKind::I1),
            0x53 => Op::StInd(IndKind::I2),
            0x54 => Op::StInd(IndKind::I4),
            0x55 => Op::StInd(IndKind::I8),
            0x56 => Op::StInd(IndKind::R4),
            0x57 => Op::StInd(IndKind::R8),
            0x58 => Op::Add,
            0x59 => Op::Sub,
            0x5A => Op::Mul,
            0x5B => Op::Div,
            0x5C => Op::DivUn,
            0x5D => Op::Rem,
            0x5E => Op::RemUn,
            0x5F => Op::And,
            0x60 => Op::Or,
            0x61 => Op::Xor,
            0x62 => Op::Shl,
            0x63 => Op::Shr,
            0x64 => Op::ShrUn,
            0x65 => Op::Neg,
            0x66 => Op::Not,
            0x67 => Op::Conv(ConvKind::I1),
            0x68 => Op::Conv(ConvKind::I2),
            0x69 => Op::Conv(ConvKind::I4),
            0x6A => Op::Conv(ConvKind::I8),
            0x6B => Op::Conv(ConvKind::R4),
            0x6C => Op::Conv(ConvKind::R8),
            0x6D => Op::Conv(ConvKind::U4),
            0x6E => Op::Conv(ConvKind::U8),
            0x6F => Op::CallVirt(self.token()?),
            0x70 => Op::CpObj(self.token()?),
            0x71 => Op::LdObj(self.token()?),
            0x72 => Op::LdStr(self.token()?),
            0x73 => Op::NewObj(self.token()?),
            0x74 => Op::CastClass(self.token()?),
            0x75 => Op::IsInst(self.token()?),
            0x76 => Op::ConvRUn,
            0x79 => Op::Unbox(self.token()?),
            0x7A => Op::Throw,
            0x7B => Op::LdFld(self.token()?),
            0x7C => Op::LdFldA(self.token()?),
            0x7D => Op::StFld(self.token()?),
            0x7E => Op::LdsFld(self.token()?),
            0x7F => Op::LdsFldA(self.token()?),
            0x80 => Op::StsFld(self.token()?),
            0x81 => Op::StObj(self.token()?),
            0x82 => Op::ConvOvf {
                kind: ConvKind::I1,
                unsigned_src: true,
            },
            0x83 => Op::ConvOvf {
                kind: ConvKind::I2,
                unsigned_src: true,
            },
            0x84 => Op::ConvOvf {
                kind: ConvKind::I4,
                unsigned_src: true,
            },
            0x85 => Op::ConvOvf {
                kind: ConvKind::I8,
                unsigned_src: true,
            },
            0x86 => Op::ConvOvf {
                kind: ConvKind::U1,
                unsigned_src: true,
            },
            0x87 => Op::ConvOvf {
                kind: ConvKind::U2,
                unsigned_src: true,
            },
            0x88 => Op::ConvOvf {
                kind: ConvKind::U4,
                unsigned_src: true,
            },
            0x89 => Op::ConvOvf {
                kind: ConvKind::U8,
                unsigned_src: true,
            },
            0x8A => Op::ConvOvf {
                kind: ConvKind::I,
                unsigned_src: true,
            },
            0x8B => Op::ConvOvf {
                kind: ConvKind::U,
                unsigned_src: true,
            },
            0x8C => Op::Box(self.token()?),
            0x8D => Op::NewArr(self.token()?),
            0x8E => Op::LdLen,
            0x8F => Op::LdElemA(self.token()?),
            0x90 => Op::LdElem(IndKind::I1),
            0x91 => Op::LdElem(IndKind::U1),
            0x92 => Op::LdElem(IndKind::I2),
            0x93 => Op::LdElem(IndKind::U2),
            0x94 => Op::LdElem(IndKind::I4),
            0x95 => Op::LdElem(IndKind::U4),
            0x96 => Op::LdElem(IndKind::I8),
            0x97 => Op::LdElem(IndKind::I),
            0x98 => Op::LdElem(IndKind::R4),
            0x99 => Op::LdElem(IndKind::R8),
            0x9A => Op::LdElem(IndKind::Ref),
            0x9B => Op::StElem(IndKind::I),
            0x9C => Op::StElem(IndKind::I1),
            0x9D => Op::StElem(IndKind::I2),
            0x9E => Op::StElem(IndKind::I4),
            0x9F => Op::StElem(IndKind::I8),
            0xA0 => Op::StElem(IndKind::R4),
            0xA1 => Op::StElem(IndKind::R8),
            0xA2 => Op::StElem(IndKind::Ref),
            0xA3 => Op::LdElemAny(self.token()?),
            0xA4 => Op::StElemAny(self.token()?),
            0xA5 => Op::UnboxAny(self.token()?),
            0xB3 => Op::ConvOvf {
                kind: ConvKind::I1,
                unsigned_src: false,
            },
            0xB4 => Op::ConvOvf {
                kind: ConvKind::U1,
                unsigned_src: false,
            },
            0xB5 => Op::ConvOvf {
                kind: ConvKind::I2,
                unsigned_src: false,
            },
            0xB6 => Op::ConvOvf {
                kind: ConvKind::U2,
                unsigned_src: false,
            },
            0xB7 => Op::ConvOvf {
                kind: ConvKind::I4,
                unsigned_src: false,
            },
            0xB8 => Op::ConvOvf {
                kind: ConvKind::U4,
                unsigned_src: false,
            },
            0xB9 => Op::ConvOvf {
                kind: ConvKind::I8,
                unsigned_src: false,
            },
            0xBA => Op::ConvOvf {
                kind: ConvKind::U8,
                unsigned_src: false,
            },
            0xC2 => Op::RefAnyVal(self.token()?),
            0xC3 => Op::CkFinite,
            0xC6 => Op::MkRefAny(self.token()?),
            0xD0 => Op::LdToken(self.token()?),
            0xD1 => Op::Conv(ConvKind::U2),
            0xD2 => Op::Conv(ConvKind::U1),
            0xD3 => Op::Conv(ConvKind::I),
            0xD4 => Op::ConvOvf {
                kind: ConvKind::I,
                unsigned_src: false,
            },
            0xD5 => Op::ConvOvf {
                kind: ConvKind::U,
                unsigned_src: false,
            },
            0xD6 => Op::AddOvf { unsigned: false },
            0xD7 => Op::AddOvf { unsigned: true },
            0xD8 => Op::MulOvf { unsigned: false },
            0xD9 => Op::MulOvf { unsigned: true },
            0xDA => Op::SubOvf { unsigned: false },
            0xDB => Op::SubOvf { unsigned: true },
            0xDC => Op::EndFinally,
            0xDD => Op::Leave(self.target_s32()?),
            0xDE => Op::Leave(self.target_s8()?),
            0xDF => Op::StInd(IndKind::I),
            0xE0 => Op::Conv(ConvKind::U),
            0xFE => {
                let second = self.u8()?;
                match second {
                    0x00 => Op::ArgList,
                    0x01 => Op::Ceq,
                    0x02 => Op::Cgt,
                    0x03 => Op::CgtUn,
                    0x04 => Op::Clt,
                    0x05 => Op::CltUn,
                    0x06 => Op::LdFtn(self.token()?),
                    0x07 => Op::LdVirtFtn(self.token()?),
                    0x09 => Op::LdArg(self.u16()?),
                    0x0A => Op::LdArgA(self.u16()?),
                    0x0B => Op::StArg(self.u16()?),
                    0x0C => Op::LdLoc(self.u16()?),
                    0x0D => Op::LdLocA(self.u16()?),
                    0x0E => Op::StLoc(self.u16()?),
                    0x0F => Op::LocAlloc,
                    0x11 => Op::EndFilter,
                    0x12 => Op::Unaligned(self.u8()?),
                    0x13 => Op::Volatile,
                    0x14 => Op::Tail,
                    0x15 => Op::InitObj(self.token()?),
                    0x16 => Op::Constrained(self.token()?),
                    0x17 => Op::CpBlk,
                    0x18 => Op::InitBlk,
                    0x1A => Op::Rethrow,
                    0x1C => Op::SizeOf(self.token()?),
                    0x1D => Op::RefAnyType,
                    0x1E => Op::ReadOnly,
                    _ => {
                        return Err(MetadataError::UnknownOpcode(
                            0xFE00 | second as u16,
                            offset,
                        ))
                    }
                }
            }
            _ => return Err(MetadataError::UnknownOpcode(byte as u16, offset)),
        };
        Ok(Some(Instruction { offset, op }))
    }
}

/// Condition/signedness for the beq..blt.un families, ordered as encoded.
fn branch_cond(index: u8) -> (CmpCond, bool) {
    match index {
        0 => (CmpCond::Eq, false),
        1 => (CmpCond::Ge, false),
        2 => (CmpCond::Gt, false),
        3 => (CmpCond::Le, false),
        4 => (CmpCond::Lt, false),
        5 => (CmpCond::Ne, true),
        6 => (CmpCond::Ge, true),
        7 => (CmpCond::Gt, true),
        8 => (CmpCond::Le, true),
        _ => (CmpCond::Lt, true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiny_body() {
        // ldarg.0, ldarg.1, add, ret - tiny header: size 4
        let bytes = [(4 << 2) | 0x02, 0x02, 0x03, 0x58, 0x2A];
        let body = MethodBody::parse(&bytes).unwrap();
        assert_eq!(body.max_stack, 8);
        assert_eq!(body.code, &bytes[1..]);
        assert!(body.clauses.is_empty());
        assert!(body.locals_token.is_none());
    }

    #[test]
    fn test_fat_body_with_eh() {
        let code = [0x00, 0x00, 0x00, 0x00, 0x2A]; // 5 bytes
        let mut bytes = Vec::new();
        // Fat header: flags 0x3 | 0x8 (more sects) | 0x10 (init locals),
        // header size 3 dwords.
        bytes.extend_from_slice(&(0x3013u16 | 0x8).to_le_bytes());
        bytes.extend_from_slice(&2u16.to_le_bytes()); // max stack
        bytes.extend_from_slice(&(code.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&0x1100_0001u32.to_le_bytes()); // locals token
        bytes.extend_from_slice(&code);
        while bytes.len() % 4 != 0 {
            bytes.push(0);
        }
        // Fat EH section: one finally clause
        let section_size = 4 + 24u32;
        bytes.push(SECT_EH_TABLE | SECT_FAT_FORMAT);
        bytes.extend_from_slice(&section_size.to_le_bytes()[..3]);
        for v in [2u32, 0, 3, 3, 2, 0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }

        let body = MethodBody::parse(&bytes).unwrap();
        assert_eq!(body.max_stack, 2);
        assert!(body.init_locals);
        assert_eq!(
            body.locals_token,
            Some(Token::new(TableId::StandAloneSig, 1))
        );
        assert_eq!(body.clauses.len(), 1);
        let clause = &body.clauses[0];
        assert_eq!(clause.kind, EhClauseKind::Finally);
        assert_eq!(clause.try_offset, 0);
        assert_eq!(clause.try_len, 3);
        assert!(clause.covers(2));
        assert!(!clause.covers(3));
        assert!(clause.handler_covers(4));
    }

    #[test]
    fn test_decode_add_method() {
        let code = [0x02, 0x03, 0x58, 0x2A];
        let ops = Decoder::decode_all(&code).unwrap();
        assert_eq!(
            ops.iter().map(|i| i.op.clone()).collect::<Vec<_>>(),
            vec![Op::LdArg(0), Op::LdArg(1), Op::Add, Op::Ret]
        );
        assert_eq!(ops[2].offset, 2);
    }

    #[test]
    fn test_decode_short_branch_targets() {
        // 0: br.s +2 (target 4); 2: ldc.i4.1; 3: ret; 4: ldc.i4.2; 5: ret
        let code = [0x2B, 0x02, 0x17, 0x2A, 0x18, 0x2A];
        let ops = Decoder::decode_all(&code).unwrap();
        assert_eq!(ops[0].op, Op::Br(4));
    }

    #[test]
    fn test_decode_backward_branch() {
        // 0: nop; 1: br.s -3 → target 0
        let code = [0x00, 0x2B, 0xFD];
        let ops = Decoder::decode_all(&code).unwrap();
        assert_eq!(ops[1].op, Op::Br(0));
    }

    #[test]
    fn test_decode_switch() {
        // switch with two targets; base = 1 + 4 + 8 = 13
        let mut code = vec![0x45];
        code.extend_from_slice(&2u32.to_le_bytes());
        code.extend_from_slice(&0i32.to_le_bytes());
        code.extend_from_slice(&2i32.to_le_bytes());
        code.push(0x2A); // 13: ret
        code.push(0x00);
        code.push(0x2A); // 15: ret
        let ops = Decoder::decode_all(&code).unwrap();
        assert_eq!(ops[0].op, Op::Switch(vec![13, 15]));
    }

    #[test]
    fn test_decode_ldc_forms() {
        let code = [
            0x15, // ldc.i4.m1
            0x1F, 0xFE, // ldc.i4.s -2
            0x20, 0xD2, 0x04, 0x00, 0x00, // ldc.i4 1234
        ];
        let ops = Decoder::decode_all(&code).unwrap();
        assert_eq!(ops[0].op, Op::LdcI4(-1));
        assert_eq!(ops[1].op, Op::LdcI4(-2));
        assert_eq!(ops[2].op, Op::LdcI4(1234));
    }

    #[test]
    fn test_decode_two_byte_opcodes() {
        let mut code = vec![0xFE, 0x01]; // ceq
        code.extend_from_slice(&[0xFE, 0x09, 0x05, 0x00]); // ldarg 5
        code.extend_from_slice(&[0xFE, 0x16]); // constrained.
        code.extend_from_slice(&0x0200_0001u32.to_le_bytes());
        let ops = Decoder::decode_all(&code).unwrap();
        assert_eq!(ops[0].op, Op::Ceq);
        assert_eq!(ops[1].op, Op::LdArg(5));
        assert_eq!(ops[2].op, Op::Constrained(Token(0x0200_0001)));
    }

    #[test]
    fn test_unknown_opcode() {
        assert!(matches!(
            Decoder::decode_all(&[0xC0]),
            Err(MetadataError::UnknownOpcode(0xC0, 0))
        ));
    }

    #[test]
    fn test_branch_cond_table() {
        // beq.s .. blt.un.s cover indexes 0..9
        let code = [0x33, 0x00]; // bne.un.s +0
        let ops = Decoder::decode_all(&code).unwrap();
        assert_eq!(
            ops[0].op,
            Op::BrCmp {
                cond: CmpCond::Ne,
                unsigned: true,
                target: 2
            }
        );
    }
}
