//! Type and member resolution
//!
//! The loader turns metadata tokens into runtime artifacts: MethodTables
//! (built lazily, cached per assembly), field layouts with GC series,
//! resolved methods with vtable slots, and generic instantiations cached
//! by open type and argument list. Virtual methods get a registry
//! reservation at type-load time so vtable slots always hold a callable
//! address (the trampoline) before any code references them.

use crate::assembly::{AssemblyRecord, AssemblyRegistry};
use crate::error::{Result, RuntimeError};
use crate::jit::registry::{CompiledMethodRegistry, MethodCell};
use crate::types::{GcSeries, MethodTable, MethodTableBuilder, MtFlags};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use silex_metadata::{
    signature, FieldSig, MethodAttributes, MethodSig, TableId, Token, TypeAttributes, TypeSig,
};
use std::sync::Arc;

/// Well-known types built at bring-up; resolution of `System.*` names
/// falls back to these when no loaded assembly defines them.
pub struct KnownTypes {
    pub object: &'static MethodTable,
    pub string: &'static MethodTable,
    pub value_type: &'static MethodTable,
    pub enum_base: &'static MethodTable,
    pub boolean: &'static MethodTable,
    pub char: &'static MethodTable,
    pub int8: &'static MethodTable,
    pub uint8: &'static MethodTable,
    pub int16: &'static MethodTable,
    pub uint16: &'static MethodTable,
    pub int32: &'static MethodTable,
    pub uint32: &'static MethodTable,
    pub int64: &'static MethodTable,
    pub uint64: &'static MethodTable,
    pub float32: &'static MethodTable,
    pub float64: &'static MethodTable,
    pub intptr: &'static MethodTable,
    pub uintptr: &'static MethodTable,
    /// 16-byte `{ pointer, type }` pair backing the typed-reference ops.
    pub typed_ref: &'static MethodTable,
    // The runtime-provided exception hierarchy; resolvable by name so
    // catch clauses match the instances the throw helpers allocate.
    pub exception: &'static MethodTable,
    pub null_reference_exception: &'static MethodTable,
    pub index_out_of_range_exception: &'static MethodTable,
    pub overflow_exception: &'static MethodTable,
    pub divide_by_zero_exception: &'static MethodTable,
    pub invalid_cast_exception: &'static MethodTable,
    pub stack_overflow_exception: &'static MethodTable,
    pub out_of_memory_exception: &'static MethodTable,
    pub compilation_failed_exception: &'static MethodTable,
    pub invalid_operation_exception: &'static MethodTable,
}

impl KnownTypes {
    pub fn bootstrap() -> KnownTypes {
        fn class(name: &str, parent: Option<&'static MethodTable>) -> &'static MethodTable {
            let mut b = MethodTableBuilder::new(name);
            b.base_size = 8;
            b.parent = parent;
            b.build()
        }
        fn primitive(
            name: &str,
            size: u32,
            parent: &'static MethodTable,
        ) -> &'static MethodTable {
            let mut b = MethodTableBuilder::new(name);
            b.base_size = size;
            b.flags = MtFlags::IS_VALUE_TYPE;
            b.parent = Some(parent);
            b.build()
        }

        let object = class("System.Object", None);
        let value_type = class("System.ValueType", Some(object));
        let enum_base = class("System.Enum", Some(value_type));
        let string = {
            let mut b = MethodTableBuilder::new("System.String");
            b.base_size = 16;
            b.component_size = 2;
            b.flags = MtFlags::IS_STRING | MtFlags::IS_ARRAY;
            b.parent = Some(object);
            b.build()
        };
        let exception = class("System.Exception", Some(object));
        KnownTypes {
            object,
            string,
            value_type,
            enum_base,
            exception,
            null_reference_exception: class("System.NullReferenceException", Some(exception)),
            index_out_of_range_exception: class(
                "System.IndexOutOfRangeException",
                Some(exception),
            ),
            overflow_exception: class("System.OverflowException", Some(exception)),
            divide_by_zero_exception: class("System.DivideByZeroException", Some(exception)),
            invalid_cast_exception: class("System.InvalidCastException", Some(exception)),
            stack_overflow_exception: class("System.StackOverflowException", Some(exception)),
            out_of_memory_exception: class("System.OutOfMemoryException", Some(exception)),
            compilation_failed_exception: class(
                "System.CompilationFailedException",
                Some(exception),
            ),
            invalid_operation_exception: class(
                "System.InvalidOperationException",
                Some(exception),
            ),
            boolean: primitive("System.Boolean", 1, value_type),
            char: primitive("System.Char", 2, value_type),
            int8: primitive("System.SByte", 1, value_type),
            uint8: primitive("System.Byte", 1, value_type),
            int16: primitive("System.Int16", 2, value_type),
            uint16: primitive("System.UInt16", 2, value_type),
            int32: primitive("System.Int32", 4, value_type),
            uint32: primitive("System.UInt32", 4, value_type),
            int64: primitive("System.Int64", 8, value_type),
            uint64: primitive("System.UInt64", 8, value_type),
            float32: primitive("System.Single", 4, value_type),
            float64: primitive("System.Double", 8, value_type),
            intptr: primitive("System.IntPtr", 8, value_type),
            uintptr: primitive("System.UIntPtr", 8, value_type),
            typed_ref: primitive("System.TypedReference", 16, value_type),
        }
    }

    fn by_name(&self, name: &str) -> Option<&'static MethodTable> {
        Some(match name {
            "Object" => self.object,
            "String" => self.string,
            "ValueType" => self.value_type,
            "Enum" => self.enum_base,
            "Boolean" => self.boolean,
            "Char" => self.char,
            "SByte" => self.int8,
            "Byte" => self.uint8,
            "Int16" => self.int16,
            "UInt16" => self.uint16,
            "Int32" => self.int32,
            "UInt32" => self.uint32,
            "Int64" => self.int64,
            "UInt64" => self.uint64,
            "Single" => self.float32,
            "Double" => self.float64,
            "IntPtr" => self.intptr,
            "UIntPtr" => self.uintptr,
            "TypedReference" => self.typed_ref,
            "Exception" => self.exception,
            "NullReferenceException" => self.null_reference_exception,
            "IndexOutOfRangeException" => self.index_out_of_range_exception,
            "OverflowException" => self.overflow_exception,
            "DivideByZeroException" => self.divide_by_zero_exception,
            "InvalidCastException" => self.invalid_cast_exception,
            "StackOverflowException" => self.stack_overflow_exception,
            "OutOfMemoryException" => self.out_of_memory_exception,
            "CompilationFailedException" => self.compilation_failed_exception,
            "InvalidOperationException" => self.invalid_operation_exception,
            _ => return None,
        })
    }
}

/// Memory shape of one type as used in a field or slot.
#[derive(Clone)]
pub struct Shape {
    pub size: u32,
    pub align: u32,
    pub is_ref: bool,
    /// Value-relative reference runs (value types with references).
    pub series: Vec<GcSeries>,
    pub mt: Option<&'static MethodTable>,
}

impl Shape {
    fn scalar(size: u32) -> Shape {
        Shape {
            size,
            align: size,
            is_ref: false,
            series: Vec::new(),
            mt: None,
        }
    }

    fn reference() -> Shape {
        Shape {
            size: 8,
            align: 8,
            is_ref: true,
            series: Vec::new(),
            mt: None,
        }
    }

    /// Slots this shape occupies on the evaluation stack.
    pub fn slot_count(&self) -> u32 {
        (self.size + 7) / 8
    }
}

/// One field's placement.
#[derive(Clone)]
pub struct FieldSlot {
    pub token: u32,
    pub name: String,
    /// Instance fields: offset from the object pointer for reference-type
    /// owners (first field at 8), from the value start for value-type
    /// owners. Static fields: zero, see `static_addr`.
    pub offset: u32,
    pub shape: Shape,
    pub sig: TypeSig,
    pub is_static: bool,
    pub static_addr: usize,
}

/// One type's complete field layout.
pub struct TypeLayout {
    pub slots: Vec<FieldSlot>,
    /// Instance payload bytes (excluding any object header or MT slot).
    pub instance_bytes: u32,
    /// Reference runs in the field-offset frame of `slots`.
    pub series: Vec<GcSeries>,
}

/// A resolved method target.
#[derive(Clone)]
pub struct ResolvedMethod {
    /// Owning assembly and MethodDef token, normalised across MemberRefs.
    pub assembly: u32,
    pub token: u32,
    pub name: String,
    pub sig: MethodSig,
    pub rva: u32,
    pub flags: MethodAttributes,
    pub declaring: &'static MethodTable,
    pub vtable_slot: Option<u32>,
}

/// A resolved field target.
#[derive(Clone)]
pub struct ResolvedField {
    pub declaring: &'static MethodTable,
    pub offset: u32,
    pub shape: Shape,
    pub sig: TypeSig,
    pub is_static: bool,
    pub static_addr: usize,
}

type TrampolineFactory = Box<dyn Fn(&Arc<MethodCell>) -> usize + Send + Sync>;

/// The loader. One per runtime; all state is caches.
pub struct TypeLoader {
    pub assemblies: Arc<AssemblyRegistry>,
    pub methods: Arc<CompiledMethodRegistry>,
    trampoline_factory: TrampolineFactory,
    pub known: KnownTypes,
    layouts: Mutex<FxHashMap<(u32, u32), Arc<TypeLayout>>>,
    arrays: Mutex<FxHashMap<String, &'static MethodTable>>,
    generic_insts: Mutex<FxHashMap<(u32, u32, Vec<usize>), &'static MethodTable>>,
    /// Per-vtable-slot (name, param count), for override matching.
    vtable_names: Mutex<FxHashMap<usize, Arc<Vec<(String, usize)>>>>,
}

impl TypeLoader {
    pub fn new(
        assemblies: Arc<AssemblyRegistry>,
        methods: Arc<CompiledMethodRegistry>,
        trampoline_factory: TrampolineFactory,
    ) -> TypeLoader {
        TypeLoader {
            assemblies,
            methods,
            trampoline_factory,
            known: KnownTypes::bootstrap(),
            layouts: Mutex::new(FxHashMap::default()),
            arrays: Mutex::new(FxHashMap::default()),
            generic_insts: Mutex::new(FxHashMap::default()),
            vtable_names: Mutex::new(FxHashMap::default()),
        }
    }

    // ---- types ----

    /// Resolve a type token in the context of `assembly`.
    pub fn resolve_type(&self, assembly: u32, token: Token) -> Result<&'static MethodTable> {
        let record = self.assemblies.get(assembly)?;
        match token.table()? {
            TableId::TypeDef => self.load_type_def(&record, token.rid()),
            TableId::TypeRef => self.resolve_type_ref(&record, token.rid()),
            TableId::TypeSpec => {
                let blob = record.view.tables().type_spec(token.rid())?;
                let sig = signature::parse_type_spec(&mut record.view.blobs().reader(blob)?)?;
                self.resolve_sig_type(assembly, &sig)
            }
            _ => Err(RuntimeError::Metadata(
                silex_metadata::MetadataError::BadTableId(token.0 as u8),
            )),
        }
    }

    /// Resolve a signature type to its MethodTable.
    pub fn resolve_sig_type(&self, assembly: u32, sig: &TypeSig) -> Result<&'static MethodTable> {
        Ok(match sig {
            TypeSig::Bool => self.known.boolean,
            TypeSig::Char => self.known.char,
            TypeSig::I1 => self.known.int8,
            TypeSig::U1 => self.known.uint8,
            TypeSig::I2 => self.known.int16,
            TypeSig::U2 => self.known.uint16,
            TypeSig::I4 => self.known.int32,
            TypeSig::U4 => self.known.uint32,
            TypeSig::I8 => self.known.int64,
            TypeSig::U8 => self.known.uint64,
            TypeSig::R4 => self.known.float32,
            TypeSig::R8 => self.known.float64,
            TypeSig::I | TypeSig::Ptr(_) | TypeSig::ByRef(_) | TypeSig::FnPtr(_) => {
                self.known.intptr
            }
            TypeSig::U => self.known.uintptr,
            TypeSig::String => self.known.string,
            TypeSig::Object => self.known.object,
            TypeSig::Class(t) | TypeSig::ValueType(t) => self.resolve_type(assembly, *t)?,
            TypeSig::SzArray(elem) => {
                let shape = self.shape_of(assembly, elem, None)?;
                self.array_of(assembly, elem, &shape)?
            }
            TypeSig::GenericInst {
                is_value_type,
                definition,
                args,
            } => self.instantiate_generic(assembly, *definition, args, *is_value_type)?,
            other => {
                return Err(RuntimeError::Compile(
                    crate::error::CompileError::UnresolvedToken(
                        Token(0),
                        match other {
                            TypeSig::Var(_) | TypeSig::MVar(_) => "open generic parameter",
                            _ => "unsupported signature type",
                        },
                    ),
                ))
            }
        })
    }

    fn resolve_type_ref(
        &self,
        record: &Arc<AssemblyRecord>,
        rid: u32,
    ) -> Result<&'static MethodTable> {
        let row = record.view.tables().type_ref(rid)?;
        let name = record.view.strings().get(row.name)?;
        let namespace = record.view.strings().get(row.namespace)?;
        match row.resolution_scope.table()? {
            TableId::Module | TableId::ModuleRef => {
                self.find_type_by_name(record, namespace, name)
            }
            TableId::AssemblyRef => {
                match self
                    .assemblies
                    .resolve_assembly_ref(record, row.resolution_scope.rid())
                {
                    Ok(id) => {
                        let target = self.assemblies.get(id)?;
                        self.find_type_by_name(&target, namespace, name)
                    }
                    Err(err) => {
                        // The reference may name a runtime-provided type
                        // even when no corelib image is loaded.
                        if namespace == "System" {
                            if let Some(mt) = self.known.by_name(name) {
                                return Ok(mt);
                            }
                        }
                        Err(err)
                    }
                }
            }
            _ => Err(RuntimeError::TypeNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
        }
    }

    /// Find a TypeDef by namespace and name, falling back to the built-in
    /// `System.*` types.
    pub fn find_type_by_name(
        &self,
        record: &Arc<AssemblyRecord>,
        namespace: &str,
        name: &str,
    ) -> Result<&'static MethodTable> {
        let tables = record.view.tables();
        for rid in 1..=tables.row_count(TableId::TypeDef) {
            let row = tables.type_def(rid)?;
            if record.view.strings().get(row.name)? == name
                && record.view.strings().get(row.namespace)? == namespace
            {
                return self.load_type_def(record, rid);
            }
        }
        if namespace == "System" {
            if let Some(mt) = self.known.by_name(name) {
                return Ok(mt);
            }
        }
        Err(RuntimeError::TypeNotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    fn load_type_def(
        &self,
        record: &Arc<AssemblyRecord>,
        rid: u32,
    ) -> Result<&'static MethodTable> {
        if let Some(&mt) = record.types.lock().get(&rid) {
            return Ok(mt);
        }

        let row = record.view.tables().type_def(rid)?;
        let name = record.view.strings().get(row.name)?.to_string();
        let namespace = record.view.strings().get(row.namespace)?;
        let full_name = if namespace.is_empty() {
            name.clone()
        } else {
            format!("{namespace}.{name}")
        };
        let flags = TypeAttributes::from_bits_truncate(row.flags);

        let parent = if row.extends.is_nil() {
            None
        } else {
            Some(self.resolve_type(record.id, row.extends)?)
        };
        let is_value_type = parent.is_some_and(|p| {
            std::ptr::eq(p, self.known.value_type) || std::ptr::eq(p, self.known.enum_base)
        });
        let is_interface = flags.contains(TypeAttributes::INTERFACE);

        let layout = self.layout_of(record, rid, is_value_type)?;

        // Instance size: explicit ClassLayout wins when larger.
        let mut payload = layout.instance_bytes;
        if let Some(cl) = record.view.tables().class_layout_for(rid)? {
            payload = payload.max(cl.class_size);
        }

        // Vtable: inherit the parent's, then place this type's virtuals.
        let mut vtable: Vec<usize> = Vec::new();
        let mut names: Vec<(String, usize)> = Vec::new();
        if let Some(p) = parent {
            for slot in 0..p.vtable_len() {
                vtable.push(p.vtable_slot(slot));
            }
            if let Some(parent_names) = self.vtable_names.lock().get(&(p as *const _ as usize)) {
                names = parent_names.as_ref().clone();
            }
            names.resize(vtable.len(), (String::new(), 0));
        }

        let mut pending_patches: Vec<(Arc<MethodCell>, usize)> = Vec::new();
        for method_rid in row.methods.clone() {
            let mrow = record.view.tables().method_def(method_rid)?;
            let mflags = MethodAttributes::from_bits_truncate(mrow.flags);
            if !mflags.contains(MethodAttributes::VIRTUAL) {
                continue;
            }
            let mname = record.view.strings().get(mrow.name)?.to_string();
            let msig = MethodSig::parse(&mut record.view.blobs().reader(mrow.signature)?)?;
            let token = Token::new(TableId::MethodDef, method_rid).0;
            let cell = self
                .methods
                .reserve(record.id, token, |c| (self.trampoline_factory)(c));

            let slot = if !mflags.contains(MethodAttributes::NEW_SLOT) {
                names
                    .iter()
                    .position(|(n, p)| *n == mname && *p == msig.params.len())
            } else {
                None
            };
            let slot = match slot {
                Some(s) => {
                    vtable[s] = cell.call_target();
                    names[s] = (mname, msig.params.len());
                    s
                }
                None => {
                    vtable.push(cell.call_target());
                    names.push((mname, msig.params.len()));
                    vtable.len() - 1
                }
            };
            record.method_slots.lock().insert(token, slot as u32);
            pending_patches.push((cell, slot));
        }

        let mut builder = MethodTableBuilder::new(full_name);
        builder.assembly = record.id;
        builder.token = Token::new(TableId::TypeDef, rid).0;
        builder.parent = parent.or(if is_interface {
            None
        } else {
            Some(self.known.object)
        });
        builder.base_size = if is_value_type {
            payload.max(1)
        } else {
            8 + (payload + 7) / 8 * 8
        };
        builder.series = layout.series.clone();
        builder.vtable = vtable;
        let mut mt_flags = MtFlags::empty();
        if is_value_type {
            mt_flags |= MtFlags::IS_VALUE_TYPE;
        }
        if is_interface {
            mt_flags |= MtFlags::IS_INTERFACE;
        }
        if !layout.series.is_empty() {
            mt_flags |= MtFlags::HAS_REFERENCES;
        }
        builder.flags = mt_flags;
        let mt = builder.build();

        record.types.lock().insert(rid, mt);
        self.vtable_names
            .lock()
            .insert(mt as *const _ as usize, Arc::new(names));
        for (cell, slot) in pending_patches {
            self.methods.add_vtable_patch(&cell, mt, slot);
        }
        log::debug!(
            "type loaded: {} (assembly {}, {} bytes)",
            mt.name(),
            record.id,
            mt.base_size()
        );
        Ok(mt)
    }

    // ---- layout ----

    /// Field layout of a TypeDef, cached. Assigns static-arena slots for
    /// static fields on first computation.
    pub fn layout_of(
        &self,
        record: &Arc<AssemblyRecord>,
        rid: u32,
        is_value_type: bool,
    ) -> Result<Arc<TypeLayout>> {
        if let Some(layout) = self.layouts.lock().get(&(record.id, rid)) {
            return Ok(layout.clone());
        }
        let layout = Arc::new(self.compute_layout(record, rid, is_value_type, None)?);
        self.layouts
            .lock()
            .insert((record.id, rid), layout.clone());
        Ok(layout)
    }

    fn compute_layout(
        &self,
        record: &Arc<AssemblyRecord>,
        rid: u32,
        is_value_type: bool,
        subst: Option<&[TypeSig]>,
    ) -> Result<TypeLayout> {
        let row = record.view.tables().type_def(rid)?;
        let base: u32 = if is_value_type { 0 } else { 8 };
        let mut cursor: u32 = 0;
        let mut slots = Vec::new();
        let mut ref_offsets: Vec<u32> = Vec::new();

        for field_rid in row.fields.clone() {
            let frow = record.view.tables().field(field_rid)?;
            let fname = record.view.strings().get(frow.name)?.to_string();
            let fsig = FieldSig::parse(&mut record.view.blobs().reader(frow.signature)?)?;
            let ty = match (&fsig.ty, subst) {
                (TypeSig::Var(i), Some(args)) => args
                    .get(*i as usize)
                    .cloned()
                    .ok_or(RuntimeError::Compile(
                        crate::error::CompileError::UnresolvedToken(
                            Token(0),
                            "generic argument out of range",
                        ),
                    ))?,
                _ => fsig.ty.clone(),
            };
            let is_static =
                silex_metadata::FieldAttributes::from_bits_truncate(frow.flags).contains(
                    silex_metadata::FieldAttributes::STATIC,
                );
            let token = Token::new(TableId::Field, field_rid).0;

            if is_static {
                let shape = self.shape_of(record.id, &ty, subst)?;
                let addr = {
                    let mut map = record.static_slots.lock();
                    match map.get(&token) {
                        Some(&a) => a,
                        None => {
                            let a = record
                                .statics
                                .lock()
                                .assign(shape.size as usize, shape.is_ref);
                            map.insert(token, a);
                            a
                        }
                    }
                };
                slots.push(FieldSlot {
                    token,
                    name: fname,
                    offset: 0,
                    shape,
                    sig: ty.clone(),
                    is_static: true,
                    static_addr: addr,
                });
                continue;
            }

            let shape = self.shape_of(record.id, &ty, subst)?;
            let align = shape.align.max(1);
            cursor = (cursor + align - 1) / align * align;
            let offset = base + cursor;
            if shape.is_ref {
                ref_offsets.push(offset);
            }
            for series in &shape.series {
                let mut run = series.offset;
                while run < series.offset + series.run_bytes {
                    ref_offsets.push(offset + run);
                    run += 8;
                }
            }
            cursor += shape.size;
            slots.push(FieldSlot {
                token,
                name: fname,
                offset,
                shape,
                sig: ty.clone(),
                is_static: false,
                static_addr: 0,
            });
        }

        Ok(TypeLayout {
            slots,
            instance_bytes: cursor,
            series: merge_series(ref_offsets),
        })
    }

    /// Shape of a signature type: size, alignment, refness and nested
    /// reference series.
    pub fn shape_of(
        &self,
        assembly: u32,
        sig: &TypeSig,
        subst: Option<&[TypeSig]>,
    ) -> Result<Shape> {
        Ok(match sig {
            TypeSig::Void => Shape::scalar(0),
            TypeSig::Bool | TypeSig::I1 | TypeSig::U1 => Shape::scalar(1),
            TypeSig::Char | TypeSig::I2 | TypeSig::U2 => Shape::scalar(2),
            TypeSig::I4 | TypeSig::U4 | TypeSig::R4 => Shape::scalar(4),
            TypeSig::I8 | TypeSig::U8 | TypeSig::R8 => Shape::scalar(8),
            TypeSig::I | TypeSig::U | TypeSig::Ptr(_) | TypeSig::ByRef(_) | TypeSig::FnPtr(_) => {
                Shape::scalar(8)
            }
            TypeSig::Var(i) | TypeSig::MVar(i) => match subst {
                Some(args) if (*i as usize) < args.len() => {
                    let arg = args[*i as usize].clone();
                    return self.shape_of(assembly, &arg, None);
                }
                _ => {
                    return Err(RuntimeError::Compile(
                        crate::error::CompileError::UnresolvedToken(
                            Token(0),
                            "open generic parameter",
                        ),
                    ))
                }
            },
            TypeSig::ValueType(_) | TypeSig::GenericInst { is_value_type: true, .. } => {
                let mt = self.resolve_sig_type(assembly, sig)?;
                Shape {
                    size: mt.base_size() as u32,
                    align: 8,
                    is_ref: false,
                    series: mt.gc_series().to_vec(),
                    mt: Some(mt),
                }
            }
            _ if sig.is_reference() => {
                let mut shape = Shape::reference();
                shape.mt = self.resolve_sig_type(assembly, sig).ok();
                shape
            }
            other => {
                return Err(RuntimeError::Compile(
                    crate::error::CompileError::UnresolvedToken(
                        Token(0),
                        match other {
                            TypeSig::TypedByRef => "typed references in fields",
                            _ => "unsupported field type",
                        },
                    ),
                ))
            }
        })
    }

    // ---- arrays and generics ----

    /// The array MethodTable for an element type, cached by element name.
    pub fn array_of(
        &self,
        _assembly: u32,
        elem_sig: &TypeSig,
        elem: &Shape,
    ) -> Result<&'static MethodTable> {
        let elem_name = match elem.mt {
            Some(mt) => mt.name().to_string(),
            None => format!("{elem_sig:?}"),
        };
        let key = format!("{elem_name}[]");
        if let Some(&mt) = self.arrays.lock().get(&key) {
            return Ok(mt);
        }

        let mut b = MethodTableBuilder::new(key.clone());
        b.parent = Some(self.known.object);
        b.base_size = 16;
        b.component_size = if elem.is_ref {
            8
        } else {
            elem.size.max(1)
        };
        let mut flags = MtFlags::IS_ARRAY;
        if elem.is_ref {
            flags |= MtFlags::HAS_REFERENCES;
        } else if !elem.series.is_empty() {
            flags |= MtFlags::HAS_REFERENCES;
            b.series = elem.series.clone();
            b.per_element_series = true;
        }
        b.flags = flags;
        let mt = b.build();
        self.arrays.lock().insert(key, mt);
        Ok(mt)
    }

    /// Instantiate a generic type over concrete arguments; cached by
    /// `(defining assembly, TypeDef rid, argument tables)`.
    fn instantiate_generic(
        &self,
        assembly: u32,
        definition: Token,
        args: &[TypeSig],
        is_value_type: bool,
    ) -> Result<&'static MethodTable> {
        // Normalise the definition down to its TypeDef.
        let record = self.assemblies.get(assembly)?;
        let (def_record, def_rid) = match definition.table()? {
            TableId::TypeDef => (record, definition.rid()),
            TableId::TypeRef => {
                let row = record.view.tables().type_ref(definition.rid())?;
                let name = record.view.strings().get(row.name)?.to_string();
                let namespace = record.view.strings().get(row.namespace)?.to_string();
                let target = match row.resolution_scope.table()? {
                    TableId::AssemblyRef => {
                        let id = self
                            .assemblies
                            .resolve_assembly_ref(&record, row.resolution_scope.rid())?;
                        self.assemblies.get(id)?
                    }
                    _ => record,
                };
                let tables = target.view.tables();
                let mut found = None;
                for rid in 1..=tables.row_count(TableId::TypeDef) {
                    let trow = tables.type_def(rid)?;
                    if target.view.strings().get(trow.name)? == name
                        && target.view.strings().get(trow.namespace)? == namespace
                    {
                        found = Some(rid);
                        break;
                    }
                }
                let rid = found.ok_or(RuntimeError::TypeNotFound { namespace, name })?;
                (target, rid)
            }
            _ => {
                return Err(RuntimeError::Compile(
                    crate::error::CompileError::UnresolvedToken(
                        definition,
                        "generic definition",
                    ),
                ))
            }
        };

        let arg_tables: Result<Vec<usize>> = args
            .iter()
            .map(|a| {
                self.resolve_sig_type(assembly, a)
                    .map(|mt| mt as *const _ as usize)
            })
            .collect();
        let key = (def_record.id, def_rid, arg_tables?);
        if let Some(&mt) = self.generic_insts.lock().get(&key) {
            return Ok(mt);
        }

        let layout = self.compute_layout(&def_record, def_rid, is_value_type, Some(args))?;
        let def_row = def_record.view.tables().type_def(def_rid)?;
        let def_name = def_record.view.strings().get(def_row.name)?;
        let arg_names: Vec<&str> = args
            .iter()
            .map(|a| {
                self.resolve_sig_type(assembly, a)
                    .map(|mt| mt.name())
                    .unwrap_or("?")
            })
            .collect();

        let mut b = MethodTableBuilder::new(format!("{def_name}<{}>", arg_names.join(", ")));
        b.assembly = def_record.id;
        b.token = Token::new(TableId::TypeDef, def_rid).0;
        b.parent = Some(if is_value_type {
            self.known.value_type
        } else {
            self.known.object
        });
        b.base_size = if is_value_type {
            layout.instance_bytes.max(1)
        } else {
            8 + (layout.instance_bytes + 7) / 8 * 8
        };
        b.series = layout.series.clone();
        let mut flags = MtFlags::empty();
        if is_value_type {
            flags |= MtFlags::IS_VALUE_TYPE;
        }
        if !layout.series.is_empty() {
            flags |= MtFlags::HAS_REFERENCES;
        }
        b.flags = flags;
        let mt = b.build();
        self.generic_insts.lock().insert(key, mt);
        Ok(mt)
    }

    // ---- members ----

    /// Resolve a method token (MethodDef or MemberRef) to its definition.
    pub fn resolve_method(&self, assembly: u32, token: Token) -> Result<ResolvedMethod> {
        let record = self.assemblies.get(assembly)?;
        match token.table()? {
            TableId::MethodDef => {
                let rid = token.rid();
                let row = record.view.tables().method_def(rid)?;
                let name = record.view.strings().get(row.name)?.to_string();
                let sig = MethodSig::parse(&mut record.view.blobs().reader(row.signature)?)?;
                let owner_rid = self.owner_of_method(&record, rid)?;
                let declaring = self.load_type_def(&record, owner_rid)?;
                let vtable_slot = record.method_slots.lock().get(&token.0).copied();
                Ok(ResolvedMethod {
                    assembly,
                    token: token.0,
                    name,
                    sig,
                    rva: row.rva,
                    flags: MethodAttributes::from_bits_truncate(row.flags),
                    declaring,
                    vtable_slot,
                })
            }
            TableId::MemberRef => {
                let row = record.view.tables().member_ref(token.rid())?;
                let name = record.view.strings().get(row.name)?.to_string();
                let sig = MethodSig::parse(&mut record.view.blobs().reader(row.signature)?)?;
                let class = self.resolve_type(assembly, row.class)?;
                let (owner_assembly, owner_token) = class.origin();
                if owner_assembly == 0 {
                    return Err(RuntimeError::MethodNotFound(format!(
                        "{}::{name}",
                        class.name()
                    )));
                }
                let owner = self.assemblies.get(owner_assembly)?;
                let owner_row = owner
                    .view
                    .tables()
                    .type_def(Token(owner_token).rid())?;
                for method_rid in owner_row.methods.clone() {
                    let mrow = owner.view.tables().method_def(method_rid)?;
                    if owner.view.strings().get(mrow.name)? != name {
                        continue;
                    }
                    let msig =
                        MethodSig::parse(&mut owner.view.blobs().reader(mrow.signature)?)?;
                    if msig.params.len() == sig.params.len() && msig.has_this == sig.has_this {
                        return self.resolve_method(
                            owner_assembly,
                            Token::new(TableId::MethodDef, method_rid),
                        );
                    }
                }
                Err(RuntimeError::MethodNotFound(format!(
                    "{}::{name}",
                    class.name()
                )))
            }
            TableId::MethodSpec => Err(RuntimeError::Compile(
                crate::error::CompileError::UnresolvedToken(
                    token,
                    "generic method instantiation",
                ),
            )),
            _ => Err(RuntimeError::MethodNotFound(format!("{token}"))),
        }
    }

    /// Resolve a field token (Field or MemberRef) to its placement.
    pub fn resolve_field(&self, assembly: u32, token: Token) -> Result<ResolvedField> {
        let record = self.assemblies.get(assembly)?;
        match token.table()? {
            TableId::Field => {
                let rid = token.rid();
                let owner_rid = self.owner_of_field(&record, rid)?;
                let declaring = self.load_type_def(&record, owner_rid)?;
                let layout = self.layout_of(&record, owner_rid, declaring.is_value_type())?;
                let slot = layout
                    .slots
                    .iter()
                    .find(|s| s.token == token.0)
                    .ok_or_else(|| RuntimeError::FieldNotFound(format!("{token}")))?;
                Ok(ResolvedField {
                    declaring,
                    offset: slot.offset,
                    shape: slot.shape.clone(),
                    sig: slot.sig.clone(),
                    is_static: slot.is_static,
                    static_addr: slot.static_addr,
                })
            }
            TableId::MemberRef => {
                let row = record.view.tables().member_ref(token.rid())?;
                let name = record.view.strings().get(row.name)?.to_string();
                let class = self.resolve_type(assembly, row.class)?;
                let (owner_assembly, owner_token) = class.origin();
                let owner = self.assemblies.get(owner_assembly)?;
                let owner_rid = Token(owner_token).rid();
                let layout = self.layout_of(&owner, owner_rid, class.is_value_type())?;
                let slot = layout
                    .slots
                    .iter()
                    .find(|s| s.name == name)
                    .ok_or_else(|| {
                        RuntimeError::FieldNotFound(format!("{}::{name}", class.name()))
                    })?;
                Ok(ResolvedField {
                    declaring: class,
                    offset: slot.offset,
                    shape: slot.shape.clone(),
                    sig: slot.sig.clone(),
                    is_static: slot.is_static,
                    static_addr: slot.static_addr,
                })
            }
            _ => Err(RuntimeError::FieldNotFound(format!("{token}"))),
        }
    }

    fn owner_of_method(&self, record: &Arc<AssemblyRecord>, method_rid: u32) -> Result<u32> {
        let tables = record.view.tables();
        for rid in 1..=tables.row_count(TableId::TypeDef) {
            if tables.type_def(rid)?.methods.contains(&method_rid) {
                return Ok(rid);
            }
        }
        Err(RuntimeError::MethodNotFound(format!(
            "method {method_rid} has no owner"
        )))
    }

    fn owner_of_field(&self, record: &Arc<AssemblyRecord>, field_rid: u32) -> Result<u32> {
        let tables = record.view.tables();
        for rid in 1..=tables.row_count(TableId::TypeDef) {
            if tables.type_def(rid)?.fields.contains(&field_rid) {
                return Ok(rid);
            }
        }
        Err(RuntimeError::FieldNotFound(format!(
            "field {field_rid} has no owner"
        )))
    }
}

/// Merge sorted-by-construction reference offsets into contiguous runs.
fn merge_series(mut offsets: Vec<u32>) -> Vec<GcSeries> {
    offsets.sort_unstable();
    offsets.dedup();
    let mut series: Vec<GcSeries> = Vec::new();
    for offset in offsets {
        match series.last_mut() {
            Some(last) if last.offset + last.run_bytes == offset => last.run_bytes += 8,
            _ => series.push(GcSeries {
                offset,
                run_bytes: 8,
            }),
        }
    }
    series
}

#[cfg(test)]
mod tests {
    use super::*;
    use silex_metadata::build::{elem, field_sig, method_sig, type_token, ImageBuilder, MethodBodyDef};

    fn loader_with(images: Vec<(&str, ImageBuilder)>) -> (TypeLoader, Vec<u32>) {
        let assemblies = Arc::new(AssemblyRegistry::new());
        let mut ids = Vec::new();
        for (name, builder) in images {
            ids.push(assemblies.load(name, builder.finish(), true).unwrap());
        }
        let methods = Arc::new(CompiledMethodRegistry::new());
        let loader = TypeLoader::new(assemblies, methods, Box::new(|_| 0xF00D_0000));
        (loader, ids)
    }

    fn corelib_refs(b: &mut ImageBuilder) -> (Token, Token) {
        let corelib = b.assembly_ref("corelib");
        let value_type = b.type_ref(corelib, "System", "ValueType");
        let object = b.type_ref(corelib, "System", "Object");
        (value_type, object)
    }

    #[test]
    fn test_merge_series() {
        assert_eq!(merge_series(vec![]), vec![]);
        assert_eq!(
            merge_series(vec![8, 16, 32]),
            vec![
                GcSeries {
                    offset: 8,
                    run_bytes: 16
                },
                GcSeries {
                    offset: 32,
                    run_bytes: 8
                }
            ]
        );
    }

    #[test]
    fn test_reference_type_layout() {
        let mut b = ImageBuilder::new("app");
        let (_vt, object) = corelib_refs(&mut b);
        b.add_type("", "Node", 0, Some(object));
        b.add_field("next", 0x06, &field_sig(&[elem::CLASS, 0x04])); // Node itself (TypeDef 1 coded = 4)
        b.add_field("value", 0x06, &field_sig(&[elem::I4]));
        b.add_field("name", 0x06, &field_sig(&[elem::STRING]));

        let (loader, ids) = loader_with(vec![("app", b)]);
        let mt = loader
            .resolve_type(ids[0], Token::new(TableId::TypeDef, 1))
            .unwrap();
        assert_eq!(mt.name(), "Node");
        assert!(!mt.is_value_type());
        assert!(mt.has_references());
        // next at 8, value at 16, name at 24 → payload 24 → base 32.
        assert_eq!(mt.base_size(), 32);
        assert_eq!(
            mt.gc_series(),
            &[
                GcSeries {
                    offset: 8,
                    run_bytes: 8
                },
                GcSeries {
                    offset: 24,
                    run_bytes: 8
                }
            ]
        );
        assert!(mt.is_assignable_to(loader.known.object));
    }

    #[test]
    fn test_value_type_layout_and_nesting() {
        let mut b = ImageBuilder::new("app");
        let (value_type, object) = corelib_refs(&mut b);
        // struct Inner { long a; long b; }
        let inner = b.add_type("", "Inner", 0x0100_0008, Some(value_type));
        b.add_field("a", 0x06, &field_sig(&[elem::I8]));
        b.add_field("b", 0x06, &field_sig(&[elem::I8]));
        // struct Outer { Inner inner; object tail; }
        b.add_type("", "Outer", 0x0100_0008, Some(value_type));
        b.add_field("inner", 0x06, &{
            let mut sig = vec![elem::VALUETYPE];
            sig.extend(type_token(inner));
            field_sig(&sig)
        });
        b.add_field("tail", 0x06, &field_sig(&[elem::OBJECT]));
        // class Holder { Outer o; }
        b.add_type("", "Holder", 0, Some(object));
        b.add_field("o", 0x06, &{
            let mut sig = vec![elem::VALUETYPE];
            sig.extend(type_token(Token::new(TableId::TypeDef, 2)));
            field_sig(&sig)
        });

        let (loader, ids) = loader_with(vec![("app", b)]);
        let inner_mt = loader
            .resolve_type(ids[0], Token::new(TableId::TypeDef, 1))
            .unwrap();
        assert!(inner_mt.is_value_type());
        assert_eq!(inner_mt.base_size(), 16);
        assert!(!inner_mt.has_references());

        let outer_mt = loader
            .resolve_type(ids[0], Token::new(TableId::TypeDef, 2))
            .unwrap();
        assert!(outer_mt.is_value_type());
        assert_eq!(outer_mt.base_size(), 24);
        // The object reference sits at value-relative offset 16.
        assert_eq!(
            outer_mt.gc_series(),
            &[GcSeries {
                offset: 16,
                run_bytes: 8
            }]
        );

        let holder_mt = loader
            .resolve_type(ids[0], Token::new(TableId::TypeDef, 3))
            .unwrap();
        // Outer embedded at 8; its ref at +16 → object-relative 24.
        assert_eq!(
            holder_mt.gc_series(),
            &[GcSeries {
                offset: 24,
                run_bytes: 8
            }]
        );
    }

    #[test]
    fn test_static_fields_get_arena_slots() {
        let mut b = ImageBuilder::new("app");
        let (_vt, object) = corelib_refs(&mut b);
        b.add_type("", "Globals", 0, Some(object));
        b.add_field("counter", 0x16, &field_sig(&[elem::I4])); // static
        b.add_field("cache", 0x16, &field_sig(&[elem::OBJECT])); // static ref

        let (loader, ids) = loader_with(vec![("app", b)]);
        let record = loader.assemblies.get(ids[0]).unwrap();
        let _ = loader
            .resolve_type(ids[0], Token::new(TableId::TypeDef, 1))
            .unwrap();

        let counter = loader
            .resolve_field(ids[0], Token::new(TableId::Field, 1))
            .unwrap();
        let cache = loader
            .resolve_field(ids[0], Token::new(TableId::Field, 2))
            .unwrap();
        assert!(counter.is_static);
        assert!(cache.is_static);
        assert_ne!(counter.static_addr, 0);
        assert_ne!(cache.static_addr, counter.static_addr);
        // Only the reference slot is a root.
        assert_eq!(record.statics.lock().ref_slots(), &[cache.static_addr]);
    }

    #[test]
    fn test_vtable_inheritance_and_override() {
        let mut b = ImageBuilder::new("app");
        let (_vt, object) = corelib_refs(&mut b);
        let base = b.add_type("", "Base", 0, Some(object));
        let speak_sig = method_sig(true, &[elem::I4], &[]);
        // virtual newslot Speak
        b.add_method(
            "Speak",
            0x01C6, // virtual | hidebysig | newslot | public-ish bits
            &speak_sig,
            MethodBodyDef::tiny(vec![0x16, 0x2A]), // ldc.i4.0; ret
        );
        b.add_type("", "Derived", 0, Some(base));
        // virtual (no newslot) Speak - overrides
        b.add_method(
            "Speak",
            0x00C6,
            &speak_sig,
            MethodBodyDef::tiny(vec![0x17, 0x2A]), // ldc.i4.1; ret
        );

        let (loader, ids) = loader_with(vec![("app", b)]);
        let base_mt = loader
            .resolve_type(ids[0], Token::new(TableId::TypeDef, 1))
            .unwrap();
        let derived_mt = loader
            .resolve_type(ids[0], Token::new(TableId::TypeDef, 2))
            .unwrap();

        assert_eq!(base_mt.vtable_len(), 1);
        assert_eq!(derived_mt.vtable_len(), 1);
        // Both slots hold the reservation trampoline for now.
        assert_eq!(base_mt.vtable_slot(0), 0xF00D_0000);
        assert_eq!(derived_mt.vtable_slot(0), 0xF00D_0000);
        assert!(derived_mt.is_assignable_to(base_mt));

        // Slot bookkeeping: both methods landed on slot 0 of their types.
        let record = loader.assemblies.get(ids[0]).unwrap();
        let slots = record.method_slots.lock();
        assert_eq!(slots[&Token::new(TableId::MethodDef, 1).0], 0);
        assert_eq!(slots[&Token::new(TableId::MethodDef, 2).0], 0);
    }

    #[test]
    fn test_resolve_method_def_and_member_ref() {
        // Library with the callee; app referencing it.
        let mut lib = ImageBuilder::new("lib");
        let (_vt, object) = corelib_refs(&mut lib);
        lib.add_type("Lib", "Math", 0, Some(object));
        let sig = method_sig(false, &[elem::I4], &[&[elem::I4]]);
        lib.add_method("Twice", 0x16, &sig, MethodBodyDef::tiny(vec![0x02, 0x02, 0x58, 0x2A]));

        let mut app = ImageBuilder::new("app");
        let libref = app.assembly_ref("lib");
        let math = app.type_ref(libref, "Lib", "Math");
        let sig2 = method_sig(false, &[elem::I4], &[&[elem::I4]]);
        let twice_ref = app.member_ref(math, "Twice", &sig2);
        let (_vt2, object2) = corelib_refs(&mut app);
        app.add_type("", "Main", 0, Some(object2));

        let (loader, ids) = loader_with(vec![("lib", lib), ("app", app)]);
        let resolved = loader.resolve_method(ids[1], twice_ref).unwrap();
        assert_eq!(resolved.assembly, ids[0]);
        assert_eq!(resolved.name, "Twice");
        assert_eq!(resolved.declaring.name(), "Lib.Math");
        assert!(resolved.rva != 0);
        assert_eq!(resolved.sig.params.len(), 1);
    }

    #[test]
    fn test_missing_type_reports_error() {
        let mut b = ImageBuilder::new("app");
        let other = b.assembly_ref("ghost");
        let t = b.type_ref(other, "Ns", "Gone");
        b.add_type("", "Main", 0, None);
        let (loader, ids) = loader_with(vec![("app", b)]);
        assert!(matches!(
            loader.resolve_type(ids[0], t),
            Err(RuntimeError::AssemblyNotFound(_))
        ));
    }

    #[test]
    fn test_builtin_type_ref_resolution() {
        let mut b = ImageBuilder::new("app");
        let corelib = b.assembly_ref("corelib");
        let int_ref = b.type_ref(corelib, "System", "Int32");
        b.add_type("", "Main", 0, None);
        let (loader, ids) = loader_with(vec![("app", b)]);
        // corelib is not loaded, but System.Int32 is runtime-provided.
        let mt = loader.resolve_type(ids[0], int_ref).unwrap();
        assert!(std::ptr::eq(mt, loader.known.int32));
    }

    #[test]
    fn test_array_method_tables_cached() {
        let (loader, _) = loader_with(vec![("app", {
            let mut b = ImageBuilder::new("app");
            b.add_type("", "Main", 0, None);
            b
        })]);
        let shape = loader.shape_of(1, &TypeSig::I4, None).unwrap();
        let a = loader.array_of(1, &TypeSig::I4, &shape).unwrap();
        let b = loader.array_of(1, &TypeSig::I4, &shape).unwrap();
        assert!(std::ptr::eq(a, b));
        assert!(a.is_array());
        assert_eq!(a.component_size(), 4);
        assert!(!a.has_references());

        let ref_shape = loader.shape_of(1, &TypeSig::Object, None).unwrap();
        let oa = loader.array_of(1, &TypeSig::Object, &ref_shape).unwrap();
        assert_eq!(oa.component_size(), 8);
        assert!(oa.has_references());
    }
}
