//! Metadata image synthesis
//!
//! A small writer producing bare metadata roots (no PE wrapper): tables
//! stream, heaps and method bodies in one buffer, with body RVAs equal to
//! their image offsets - the form [`crate::MetadataView::from_metadata_root`]
//! parses. The runtime's test suites synthesize assemblies with it; the
//! kernel's build tooling uses it to pack bootstrap images.
//!
//! Only narrow (2-byte) heap and table indexes are produced; the builder
//! asserts if a heap outgrows that, which test images never do.

use crate::body::EhClauseKind;
use crate::token::{CodedIndex, TableId, Token};
use crate::EhClause;
use rustc_hash::FxHashMap;

/// Element-type constants for hand-built signature blobs.
pub mod elem {
    pub const VOID: u8 = 0x01;
    pub const BOOLEAN: u8 = 0x02;
    pub const CHAR: u8 = 0x03;
    pub const I1: u8 = 0x04;
    pub const U1: u8 = 0x05;
    pub const I2: u8 = 0x06;
    pub const U2: u8 = 0x07;
    pub const I4: u8 = 0x08;
    pub const U4: u8 = 0x09;
    pub const I8: u8 = 0x0A;
    pub const U8: u8 = 0x0B;
    pub const R4: u8 = 0x0C;
    pub const R8: u8 = 0x0D;
    pub const STRING: u8 = 0x0E;
    pub const BYREF: u8 = 0x10;
    pub const VALUETYPE: u8 = 0x11;
    pub const CLASS: u8 = 0x12;
    pub const I: u8 = 0x18;
    pub const OBJECT: u8 = 0x1C;
    pub const SZARRAY: u8 = 0x1D;
}

/// Build a default (static) method signature blob.
pub fn method_sig(has_this: bool, ret: &[u8], params: &[&[u8]]) -> Vec<u8> {
    let mut out = vec![if has_this { 0x20 } else { 0x00 }, params.len() as u8];
    out.extend_from_slice(ret);
    for p in params {
        out.extend_from_slice(p);
    }
    out
}

/// Build a field signature blob.
pub fn field_sig(ty: &[u8]) -> Vec<u8> {
    let mut out = vec![0x06];
    out.extend_from_slice(ty);
    out
}

/// Build a locals signature blob.
pub fn locals_sig(locals: &[&[u8]]) -> Vec<u8> {
    let mut out = vec![0x07, locals.len() as u8];
    for l in locals {
        out.extend_from_slice(l);
    }
    out
}

/// Encode a TypeDefOrRef coded token as a compressed integer for use
/// inside signature blobs.
pub fn type_token(token: Token) -> Vec<u8> {
    let coded = CodedIndex::TypeDefOrRef.encode(token).expect("codable token");
    assert!(coded < 0x80, "builder supports one-byte coded tokens only");
    vec![coded as u8]
}

#[derive(Default)]
struct TypeDefEntry {
    flags: u32,
    name: u16,
    namespace: u16,
    extends: u16,
    field_start: u16,
    method_start: u16,
}

struct MethodEntry {
    impl_flags: u16,
    flags: u16,
    name: u16,
    signature: u16,
    body: Option<Vec<u8>>,
    rva: u32,
}

/// The image builder.
pub struct ImageBuilder {
    strings: Vec<u8>,
    string_map: FxHashMap<String, u16>,
    blobs: Vec<u8>,
    user_strings: Vec<u8>,
    guids: Vec<u8>,
    module_name: u16,
    type_refs: Vec<(u16, u16, u16)>,
    type_defs: Vec<TypeDefEntry>,
    fields: Vec<(u16, u16, u16)>,
    methods: Vec<MethodEntry>,
    member_refs: Vec<(u16, u16, u16)>,
    stand_alone_sigs: Vec<u16>,
    assembly_refs: Vec<u16>,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        ImageBuilder::new("module")
    }
}

impl ImageBuilder {
    pub fn new(module_name: &str) -> ImageBuilder {
        let mut builder = ImageBuilder {
            strings: vec![0],
            string_map: FxHashMap::default(),
            blobs: vec![0],
            user_strings: vec![0],
            guids: vec![0; 16],
            module_name: 0,
            type_refs: Vec::new(),
            type_defs: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            member_refs: Vec::new(),
            stand_alone_sigs: Vec::new(),
            assembly_refs: Vec::new(),
        };
        builder.module_name = builder.string(module_name);
        builder
    }

    /// Intern a string in #Strings.
    pub fn string(&mut self, s: &str) -> u16 {
        if let Some(&off) = self.string_map.get(s) {
            return off;
        }
        let off = self.strings.len() as u16;
        self.strings.extend_from_slice(s.as_bytes());
        self.strings.push(0);
        self.string_map.insert(s.to_string(), off);
        assert!(self.strings.len() < 0x1_0000);
        off
    }

    /// Store a blob in #Blob.
    pub fn blob(&mut self, bytes: &[u8]) -> u16 {
        let off = self.blobs.len() as u16;
        assert!(bytes.len() < 0x80);
        self.blobs.push(bytes.len() as u8);
        self.blobs.extend_from_slice(bytes);
        assert!(self.blobs.len() < 0x1_0000);
        off
    }

    /// Store a literal in #US and return its `ldstr` token.
    pub fn user_string(&mut self, s: &str) -> Token {
        let off = self.user_strings.len() as u32;
        let units: Vec<u16> = s.encode_utf16().collect();
        let byte_len = units.len() * 2 + 1;
        assert!(byte_len < 0x80);
        self.user_strings.push(byte_len as u8);
        for unit in units {
            self.user_strings.extend_from_slice(&unit.to_le_bytes());
        }
        self.user_strings.push(0);
        Token(0x7000_0000 | off)
    }

    /// Add an AssemblyRef row.
    pub fn assembly_ref(&mut self, name: &str) -> Token {
        let name = self.string(name);
        self.assembly_refs.push(name);
        Token::new(TableId::AssemblyRef, self.assembly_refs.len() as u32)
    }

    /// Add a TypeRef row.
    pub fn type_ref(&mut self, scope: Token, namespace: &str, name: &str) -> Token {
        let coded = CodedIndex::ResolutionScope.encode(scope).unwrap();
        assert!(coded < 0x1_0000);
        let name = self.string(name);
        let namespace = self.string(namespace);
        self.type_refs.push((coded as u16, name, namespace));
        Token::new(TableId::TypeRef, self.type_refs.len() as u32)
    }

    /// Add a TypeDef row. Fields and methods added afterwards belong to it
    /// until the next `add_type`.
    pub fn add_type(
        &mut self,
        namespace: &str,
        name: &str,
        flags: u32,
        extends: Option<Token>,
    ) -> Token {
        let name = self.string(name);
        let namespace = self.string(namespace);
        let extends = match extends {
            Some(t) => {
                let coded = CodedIndex::TypeDefOrRef.encode(t).unwrap();
                assert!(coded < 0x1_0000);
                coded as u16
            }
            None => 0,
        };
        self.type_defs.push(TypeDefEntry {
            flags,
            name,
            namespace,
            extends,
            field_start: self.fields.len() as u16 + 1,
            method_start: self.methods.len() as u16 + 1,
        });
        Token::new(TableId::TypeDef, self.type_defs.len() as u32)
    }

    /// Add a Field row to the current type.
    pub fn add_field(&mut self, name: &str, flags: u16, signature: &[u8]) -> Token {
        assert!(!self.type_defs.is_empty(), "field before any type");
        let name = self.string(name);
        let sig = self.blob(signature);
        self.fields.push((flags, name, sig));
        Token::new(TableId::Field, self.fields.len() as u32)
    }

    /// Add a MethodDef row with a body to the current type.
    pub fn add_method(
        &mut self,
        name: &str,
        flags: u16,
        signature: &[u8],
        body: MethodBodyDef,
    ) -> Token {
        assert!(!self.type_defs.is_empty(), "method before any type");
        let name = self.string(name);
        let sig = self.blob(signature);
        self.methods.push(MethodEntry {
            impl_flags: 0,
            flags,
            name,
            signature: sig,
            body: Some(body.encode()),
            rva: 0,
        });
        Token::new(TableId::MethodDef, self.methods.len() as u32)
    }

    /// Add a bodyless (abstract/runtime) MethodDef row.
    pub fn add_method_no_body(&mut self, name: &str, flags: u16, signature: &[u8]) -> Token {
        assert!(!self.type_defs.is_empty());
        let name = self.string(name);
        let sig = self.blob(signature);
        self.methods.push(MethodEntry {
            impl_flags: 0,
            flags,
            name,
            signature: sig,
            body: None,
            rva: 0,
        });
        Token::new(TableId::MethodDef, self.methods.len() as u32)
    }

    /// Add a MemberRef row.
    pub fn member_ref(&mut self, class: Token, name: &str, signature: &[u8]) -> Token {
        let coded = CodedIndex::MemberRefParent.encode(class).unwrap();
        assert!(coded < 0x1_0000);
        let name = self.string(name);
        let sig = self.blob(signature);
        self.member_refs.push((coded as u16, name, sig));
        Token::new(TableId::MemberRef, self.member_refs.len() as u32)
    }

    /// Add a StandAloneSig row (locals signatures).
    pub fn stand_alone_sig(&mut self, signature: &[u8]) -> Token {
        let sig = self.blob(signature);
        self.stand_alone_sigs.push(sig);
        Token::new(TableId::StandAloneSig, self.stand_alone_sigs.len() as u32)
    }

    /// Serialise the image: metadata root, then method bodies whose RVAs
    /// are their offsets in the returned buffer.
    pub fn finish(mut self) -> Vec<u8> {
        // The root's size is independent of RVA values (fixed 4-byte
        // column), so lay out the root once with zero RVAs, then place
        // bodies after it and serialise again with real RVAs.
        let root_len = self.serialize_root().len();
        let mut bodies = Vec::new();
        let mut body_offsets = Vec::new();
        for method in &self.methods {
            match &method.body {
                Some(encoded) => {
                    while (root_len + bodies.len()) % 4 != 0 {
                        bodies.push(0);
                    }
                    body_offsets.push((root_len + bodies.len()) as u32);
                    bodies.extend_from_slice(encoded);
                }
                None => body_offsets.push(0),
            }
        }
        for (method, rva) in self.methods.iter_mut().zip(&body_offsets) {
            method.rva = *rva;
        }
        let mut image = self.serialize_root();
        debug_assert_eq!(image.len(), root_len);
        image.extend_from_slice(&bodies);
        image
    }

    fn serialize_root(&self) -> Vec<u8> {
        let tables = self.serialize_tables();
        let streams: [(&str, &[u8]); 5] = [
            ("#~", &tables),
            ("#Strings", &self.strings),
            ("#US", &self.user_strings),
            ("#Blob", &self.blobs),
            ("#GUID", &self.guids),
        ];

        let version = b"v4.0.30319\0\0";
        let mut out = Vec::new();
        out.extend_from_slice(&0x424A_5342u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(version.len() as u32).to_le_bytes());
        out.extend_from_slice(version);
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&(streams.len() as u16).to_le_bytes());

        let mut headers_size = 0;
        for (name, _) in &streams {
            headers_size += 8 + (name.len() + 1 + 3) / 4 * 4;
        }
        let mut offset = out.len() + headers_size;
        let mut payloads = Vec::new();
        for (name, data) in &streams {
            out.extend_from_slice(&(offset as u32).to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.push(0);
            while out.len() % 4 != 0 {
                out.push(0);
            }
            offset += data.len();
            payloads.extend_from_slice(data);
        }
        out.extend_from_slice(&payloads);
        out
    }

    fn serialize_tables(&self) -> Vec<u8> {
        let mut valid = 1u64 << (TableId::Module as u64);
        let mut counts: Vec<u32> = vec![1];
        let mut add = |table: TableId, count: usize, valid: &mut u64, counts: &mut Vec<u32>| {
            if count > 0 {
                *valid |= 1 << (table as u64);
                counts.push(count as u32);
            }
        };
        add(TableId::TypeRef, self.type_refs.len(), &mut valid, &mut counts);
        add(TableId::TypeDef, self.type_defs.len(), &mut valid, &mut counts);
        add(TableId::Field, self.fields.len(), &mut valid, &mut counts);
        add(TableId::MethodDef, self.methods.len(), &mut valid, &mut counts);
        add(
            TableId::MemberRef,
            self.member_refs.len(),
            &mut valid,
            &mut counts,
        );
        add(
            TableId::StandAloneSig,
            self.stand_alone_sigs.len(),
            &mut valid,
            &mut counts,
        );
        add(
            TableId::AssemblyRef,
            self.assembly_refs.len(),
            &mut valid,
            &mut counts,
        );

        let mut out = Vec::new();
        out.extend_from_slice(&0u32.to_le_bytes());
        out.push(2);
        out.push(0);
        out.push(0); // heap sizes: all narrow
        out.push(1);
        out.extend_from_slice(&valid.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes());
        for count in &counts {
            out.extend_from_slice(&count.to_le_bytes());
        }

        let w16 = |out: &mut Vec<u8>, v: u16| out.extend_from_slice(&v.to_le_bytes());
        let w32 = |out: &mut Vec<u8>, v: u32| out.extend_from_slice(&v.to_le_bytes());

        // Module: generation, name, mvid, encid, encbaseid
        w16(&mut out, 0);
        w16(&mut out, self.module_name);
        w16(&mut out, 1);
        w16(&mut out, 0);
        w16(&mut out, 0);

        for (scope, name, namespace) in &self.type_refs {
            w16(&mut out, *scope);
            w16(&mut out, *name);
            w16(&mut out, *namespace);
        }
        for t in &self.type_defs {
            w32(&mut out, t.flags);
            w16(&mut out, t.name);
            w16(&mut out, t.namespace);
            w16(&mut out, t.extends);
            w16(&mut out, t.field_start);
            w16(&mut out, t.method_start);
        }
        for (flags, name, sig) in &self.fields {
            w16(&mut out, *flags);
            w16(&mut out, *name);
            w16(&mut out, *sig);
        }
        for m in &self.methods {
            w32(&mut out, m.rva);
            w16(&mut out, m.impl_flags);
            w16(&mut out, m.flags);
            w16(&mut out, m.name);
            w16(&mut out, m.signature);
            w16(&mut out, 1); // param list: empty
        }
        for (class, name, sig) in &self.member_refs {
            w16(&mut out, *class);
            w16(&mut out, *name);
            w16(&mut out, *sig);
        }
        for sig in &self.stand_alone_sigs {
            w16(&mut out, *sig);
        }
        for name in &self.assembly_refs {
            w16(&mut out, 0); // version 0.0.0.0
            w16(&mut out, 0);
            w16(&mut out, 0);
            w16(&mut out, 0);
            w32(&mut out, 0); // flags
            w16(&mut out, 0); // public key or token: absent
            w16(&mut out, *name);
            w16(&mut out, 0); // culture
            w16(&mut out, 0); // hash
        }
        out
    }
}

/// Body description for [`ImageBuilder::add_method`].
pub struct MethodBodyDef {
    pub max_stack: u16,
    pub code: Vec<u8>,
    pub locals: Option<Token>,
    pub init_locals: bool,
    pub clauses: Vec<EhClause>,
}

impl MethodBodyDef {
    pub fn tiny(code: Vec<u8>) -> MethodBodyDef {
        MethodBodyDef {
            max_stack: 8,
            code,
            locals: None,
            init_locals: false,
            clauses: Vec::new(),
        }
    }

    pub fn fat(max_stack: u16, code: Vec<u8>) -> MethodBodyDef {
        MethodBodyDef {
            max_stack,
            code,
            locals: None,
            init_locals: true,
            clauses: Vec::new(),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let tiny_ok = self.code.len() < 64
            && self.locals.is_none()
            && self.clauses.is_empty()
            && self.max_stack <= 8;
        if tiny_ok {
            let mut out = vec![((self.code.len() as u8) << 2) | 0x02];
            out.extend_from_slice(&self.code);
            return out;
        }

        let mut flags = 0x3003u16; // fat, header size 3 dwords
        if self.init_locals {
            flags |= 0x10;
        }
        if !self.clauses.is_empty() {
            flags |= 0x08;
        }
        let mut out = Vec::new();
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&self.max_stack.to_le_bytes());
        out.extend_from_slice(&(self.code.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.locals.map_or(0, |t| t.0).to_le_bytes());
        out.extend_from_slice(&self.code);

        if !self.clauses.is_empty() {
            while out.len() % 4 != 0 {
                out.push(0);
            }
            let size = 4 + self.clauses.len() as u32 * 24;
            out.push(0x01 | 0x40); // EH table, fat
            out.extend_from_slice(&size.to_le_bytes()[..3]);
            for clause in &self.clauses {
                let (flags, extra) = match clause.kind {
                    EhClauseKind::Catch(token) => (0u32, token.0),
                    EhClauseKind::Filter { filter_offset } => (1, filter_offset),
                    EhClauseKind::Finally => (2, 0),
                    EhClauseKind::Fault => (4, 0),
                };
                for v in [
                    flags,
                    clause.try_offset,
                    clause.try_len,
                    clause.handler_offset,
                    clause.handler_len,
                    extra,
                ] {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{Decoder, Op};
    use crate::signature::MethodSig;
    use crate::{MetadataView, MethodBody, TypeSig};

    #[test]
    fn test_round_trip_add_method() {
        let mut b = ImageBuilder::new("test");
        let program = b.add_type("", "Program", 0, None);
        let sig = method_sig(false, &[elem::I4], &[&[elem::I4], &[elem::I4]]);
        // ldarg.0; ldarg.1; add; ret
        let add = b.add_method(
            "Add",
            0x0016, // public static hidebysig
            &sig,
            MethodBodyDef::tiny(vec![0x02, 0x03, 0x58, 0x2A]),
        );
        let image = b.finish();

        let view = MetadataView::from_metadata_root(&image).unwrap();
        assert_eq!(view.tables().row_count(TableId::TypeDef), 1);
        assert_eq!(view.tables().row_count(TableId::MethodDef), 1);

        let t = view.tables().type_def(program.rid()).unwrap();
        assert_eq!(view.strings().get(t.name).unwrap(), "Program");
        assert_eq!(t.methods, 1..2);

        let m = view.tables().method_def(add.rid()).unwrap();
        assert_eq!(view.strings().get(m.name).unwrap(), "Add");
        let parsed = MethodSig::parse(&mut view.blobs().reader(m.signature).unwrap()).unwrap();
        assert_eq!(parsed.params, vec![TypeSig::I4, TypeSig::I4]);

        let body = MethodBody::parse(view.body_bytes(m.rva).unwrap()).unwrap();
        let ops = Decoder::decode_all(body.code).unwrap();
        assert_eq!(
            ops.iter().map(|i| i.op.clone()).collect::<Vec<_>>(),
            vec![Op::LdArg(0), Op::LdArg(1), Op::Add, Op::Ret]
        );
    }

    #[test]
    fn test_round_trip_user_string() {
        let mut b = ImageBuilder::new("test");
        b.add_type("", "T", 0, None);
        let tok = b.user_string("abc");
        let image = b.finish();
        let view = MetadataView::from_metadata_root(&image).unwrap();
        let units = view.user_strings().get(tok.0 & 0x00FF_FFFF).unwrap();
        assert_eq!(units, "abc".encode_utf16().collect::<Vec<_>>());
    }

    #[test]
    fn test_round_trip_fat_body_with_clause() {
        let mut b = ImageBuilder::new("test");
        b.add_type("", "T", 0, None);
        let mut body = MethodBodyDef::fat(2, vec![0x00; 16]);
        body.clauses.push(EhClause {
            kind: EhClauseKind::Finally,
            try_offset: 0,
            try_len: 8,
            handler_offset: 8,
            handler_len: 8,
        });
        let m = b.add_method("F", 0x16, &method_sig(false, &[elem::VOID], &[]), body);
        let image = b.finish();
        let view = MetadataView::from_metadata_root(&image).unwrap();
        let row = view.tables().method_def(m.rid()).unwrap();
        let parsed = MethodBody::parse(view.body_bytes(row.rva).unwrap()).unwrap();
        assert_eq!(parsed.clauses.len(), 1);
        assert_eq!(parsed.clauses[0].kind, EhClauseKind::Finally);
        assert!(parsed.init_locals);
    }

    #[test]
    fn test_round_trip_refs() {
        let mut b = ImageBuilder::new("test");
        let corelib = b.assembly_ref("corelib");
        let obj_ref = b.type_ref(corelib, "System", "Object");
        b.add_type("", "T", 0, Some(obj_ref));
        let mr = b.member_ref(obj_ref, "ToString", &method_sig(true, &[elem::STRING], &[]));
        let image = b.finish();

        let view = MetadataView::from_metadata_root(&image).unwrap();
        let tr = view.tables().type_ref(obj_ref.rid()).unwrap();
        assert_eq!(tr.resolution_scope, corelib);
        assert_eq!(view.strings().get(tr.name).unwrap(), "Object");
        assert_eq!(view.strings().get(tr.namespace).unwrap(), "System");

        let m = view.tables().member_ref(mr.rid()).unwrap();
        assert_eq!(m.class, obj_ref);
        assert_eq!(view.strings().get(m.name).unwrap(), "ToString");

        let ar = view.tables().assembly_ref(corelib.rid()).unwrap();
        assert_eq!(view.strings().get(ar.name).unwrap(), "corelib");
    }
}
