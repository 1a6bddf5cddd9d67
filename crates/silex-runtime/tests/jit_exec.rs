//! End-to-end execution: synthesized assemblies compiled by the Tier-0
//! JIT and run through the reflective-invocation surface.
//!
//! The emitter produces Windows-x64-convention code, which the host can
//! call directly through the entry thunk, so these tests run the real
//! pipeline: image parsing, lazy compilation through trampolines, stack
//! maps, unwind registration, GC cycles and exception dispatch.
#![cfg(all(target_arch = "x86_64", target_os = "linux"))]

use silex_metadata::build::{elem, field_sig, locals_sig, method_sig, type_token, ImageBuilder, MethodBodyDef};
use silex_metadata::{EhClause, EhClauseKind, TableId, Token};
use silex_runtime::jit::registry::Lookup;
use silex_runtime::{boot, BootInfo, HostPlatform, Runtime, RuntimeError};
use std::sync::Arc;

fn rt() -> &'static Runtime {
    boot(Arc::new(HostPlatform), BootInfo::empty())
}

fn token_bytes(t: Token) -> [u8; 4] {
    t.0.to_le_bytes()
}

/// Builder with an Object extends-target wired up.
fn image(name: &str) -> (ImageBuilder, Token) {
    let mut b = ImageBuilder::new(name);
    let corelib = b.assembly_ref("corelib");
    let object = b.type_ref(corelib, "System", "Object");
    (b, object)
}

#[test]
fn test_s1_add_returns_sum() {
    let (mut b, object) = image("s1_add");
    b.add_type("", "Program", 0, Some(object));
    let sig = method_sig(false, &[elem::I4], &[&[elem::I4], &[elem::I4]]);
    let add = b.add_method(
        "Add",
        0x0016,
        &sig,
        MethodBodyDef::tiny(vec![0x02, 0x03, 0x58, 0x2A]),
    );

    let rt = rt();
    let asm = rt.load_assembly("s1_add", b.finish(), true).unwrap();
    assert_eq!(rt.resolve_and_invoke(asm, add.0, &[2, 3]).unwrap(), 5);
    assert_eq!(rt.resolve_and_invoke(asm, add.0, &[40, 2]).unwrap(), 42);
    // Negative operands stay canonical through the 32-bit path.
    let r = rt
        .resolve_and_invoke(asm, add.0, &[(-7i64) as u64, 3])
        .unwrap();
    assert_eq!(r as i64, -4);
}

#[test]
fn test_branches_pick_max() {
    let (mut b, object) = image("branches");
    b.add_type("", "Program", 0, Some(object));
    let sig = method_sig(false, &[elem::I4], &[&[elem::I4], &[elem::I4]]);
    // if (a >= b) return a; return b;
    let max = b.add_method(
        "Max",
        0x0016,
        &sig,
        MethodBodyDef::tiny(vec![0x02, 0x03, 0x2F, 0x02, 0x03, 0x2A, 0x02, 0x2A]),
    );

    let rt = rt();
    let asm = rt.load_assembly("branches", b.finish(), true).unwrap();
    assert_eq!(rt.resolve_and_invoke(asm, max.0, &[2, 3]).unwrap(), 3);
    assert_eq!(rt.resolve_and_invoke(asm, max.0, &[9, 4]).unwrap(), 9);
    assert_eq!(rt.resolve_and_invoke(asm, max.0, &[6, 6]).unwrap(), 6);
}

#[test]
fn test_loop_sum_with_backedge_polls() {
    let (mut b, object) = image("loop_sum");
    b.add_type("", "Program", 0, Some(object));
    let sig = method_sig(false, &[elem::I4], &[&[elem::I4]]);
    let locals = b.stand_alone_sig(&locals_sig(&[&[elem::I4], &[elem::I4]]));
    // sum = 0; i = 1; while (i <= n) { sum += i; i += 1; } return sum;
    let mut body = MethodBodyDef::fat(
        4,
        vec![
            0x16, 0x0A, // sum = 0
            0x17, 0x0B, // i = 1
            0x07, 0x02, 0x30, 0x0A, // while !(i > n)
            0x06, 0x07, 0x58, 0x0A, // sum += i
            0x07, 0x17, 0x58, 0x0B, // i += 1
            0x2B, 0xF2, // loop
            0x06, 0x2A, // return sum
        ],
    );
    body.locals = Some(locals);
    let sum = b.add_method("Sum", 0x0016, &sig, body);

    let rt = rt();
    let asm = rt.load_assembly("loop_sum", b.finish(), true).unwrap();
    assert_eq!(rt.resolve_and_invoke(asm, sum.0, &[5]).unwrap(), 15);
    assert_eq!(rt.resolve_and_invoke(asm, sum.0, &[100]).unwrap(), 5050);
    assert_eq!(rt.resolve_and_invoke(asm, sum.0, &[0]).unwrap(), 0);
}

#[test]
fn test_s3_factorial_recurses_through_registry() {
    let (mut b, object) = image("s3_fact");
    b.add_type("", "Program", 0, Some(object));
    let sig = method_sig(false, &[elem::I4], &[&[elem::I4]]);
    // The first method of the image gets token 0x06000001, which the
    // body references before the method exists - the reservation makes
    // that stable.
    let self_token = Token::new(TableId::MethodDef, 1);
    let mut code = vec![
        0x02, 0x17, 0x30, 0x02, // if (n > 1) goto recurse
        0x17, 0x2A, // return 1
        0x02, 0x02, 0x17, 0x59, // n, n - 1
        0x28, // call Fact
    ];
    code.extend_from_slice(&token_bytes(self_token));
    code.extend_from_slice(&[0x5A, 0x2A]); // mul; ret
    let fact = b.add_method("Fact", 0x0016, &sig, MethodBodyDef::tiny(code));
    assert_eq!(fact, self_token);

    let rt = rt();
    let asm = rt.load_assembly("s3_fact", b.finish(), true).unwrap();
    assert_eq!(rt.resolve_and_invoke(asm, fact.0, &[10]).unwrap(), 3_628_800);

    // After the run the registry slot is Ready with a stable entry.
    let entry = match rt.methods.lookup(asm, fact.0) {
        Lookup::Ready(entry) => entry,
        other => panic!("factorial not Ready: {other:?}"),
    };
    assert_eq!(rt.resolve_and_invoke(asm, fact.0, &[6]).unwrap(), 720);
    match rt.methods.lookup(asm, fact.0) {
        Lookup::Ready(again) => assert_eq!(again, entry),
        other => panic!("factorial regressed: {other:?}"),
    }
}

#[test]
fn test_s6_value_type_locals_and_dup() {
    let mut b = ImageBuilder::new("s6_vt");
    let corelib = b.assembly_ref("corelib");
    let object = b.type_ref(corelib, "System", "Object");
    let value_type = b.type_ref(corelib, "System", "ValueType");

    // struct V24 { long f1; long f2; long f3; }
    let v24 = b.add_type("", "V24", 0x0008, Some(value_type));
    let f1 = b.add_field("f1", 0x0006, &field_sig(&[elem::I8]));
    let f2 = b.add_field("f2", 0x0006, &field_sig(&[elem::I8]));
    let f3 = b.add_field("f3", 0x0006, &field_sig(&[elem::I8]));
    b.add_type("", "Program", 0, Some(object));

    let locals = {
        let mut vt = vec![elem::VALUETYPE];
        vt.extend(type_token(v24));
        b.stand_alone_sig(&locals_sig(&[&vt]))
    };

    // V.f1 = 10; V.f2 = 20; V.f3 = 30; push V; dup; pop;
    // return (int)(V.f1 + V.f2 + V.f3) computed on the stack copy.
    let mut code = Vec::new();
    for (value, field) in [(10u8, f1), (20, f2), (30, f3)] {
        code.extend_from_slice(&[0x12, 0x00, 0x1F, value, 0x6A, 0x7D]);
        code.extend_from_slice(&token_bytes(field));
    }
    code.extend_from_slice(&[0x06, 0x25, 0x26, 0x7B]);
    code.extend_from_slice(&token_bytes(f1));
    code.push(0x06);
    code.push(0x7B);
    code.extend_from_slice(&token_bytes(f2));
    code.push(0x58);
    code.push(0x06);
    code.push(0x7B);
    code.extend_from_slice(&token_bytes(f3));
    code.extend_from_slice(&[0x58, 0x69, 0x2A]);

    let mut body = MethodBodyDef::fat(8, code);
    body.locals = Some(locals);
    let sig = method_sig(false, &[elem::I4], &[]);
    let test = b.add_method("Test24", 0x0016, &sig, body);

    let rt = rt();
    let asm = rt.load_assembly("s6_vt", b.finish(), true).unwrap();
    assert_eq!(rt.resolve_and_invoke(asm, test.0, &[]).unwrap(), 60);

    // The 24-byte value occupies three slots end to end.
    let v24_mt = rt
        .loader
        .resolve_type(asm, v24)
        .expect("value type loads");
    assert_eq!(v24_mt.base_size(), 24);
    assert!(v24_mt.is_value_type());
}

#[test]
fn test_constrained_calls_on_primitives_inline() {
    let mut b = ImageBuilder::new("constrained_prim");
    let corelib = b.assembly_ref("corelib");
    let object = b.type_ref(corelib, "System", "Object");
    let int32 = b.type_ref(corelib, "System", "Int32");
    b.add_type("", "Program", 0, Some(object));
    // Neither target exists as loadable metadata; the constrained path
    // must inline off the member shape alone.
    let hash_ref = b.member_ref(int32, "GetHashCode", &method_sig(true, &[elem::I4], &[]));
    let eq_ref = b.member_ref(
        int32,
        "Equals",
        &method_sig(true, &[elem::BOOLEAN], &[&[elem::I4]]),
    );

    // Hash(a): x = a; return x.GetHashCode();  — the value itself.
    let hash_locals = b.stand_alone_sig(&locals_sig(&[&[elem::I4]]));
    let mut hash_code = vec![0x02, 0x0A, 0x12, 0x00, 0xFE, 0x16];
    hash_code.extend_from_slice(&token_bytes(int32));
    hash_code.push(0x6F);
    hash_code.extend_from_slice(&token_bytes(hash_ref));
    hash_code.push(0x2A);
    let mut hash_body = MethodBodyDef::fat(2, hash_code);
    hash_body.locals = Some(hash_locals);
    let hash = b.add_method(
        "Hash",
        0x0016,
        &method_sig(false, &[elem::I4], &[&[elem::I4]]),
        hash_body,
    );

    // Eq(a, b): x = a; return x.Equals(b);
    let eq_locals = b.stand_alone_sig(&locals_sig(&[&[elem::I4]]));
    let mut eq_code = vec![0x02, 0x0A, 0x12, 0x00, 0x03, 0xFE, 0x16];
    eq_code.extend_from_slice(&token_bytes(int32));
    eq_code.push(0x6F);
    eq_code.extend_from_slice(&token_bytes(eq_ref));
    eq_code.push(0x2A);
    let mut eq_body = MethodBodyDef::fat(2, eq_code);
    eq_body.locals = Some(eq_locals);
    let eq = b.add_method(
        "Eq",
        0x0016,
        &method_sig(false, &[elem::I4], &[&[elem::I4], &[elem::I4]]),
        eq_body,
    );

    let rt = rt();
    let asm = rt.load_assembly("constrained_prim", b.finish(), true).unwrap();
    assert_eq!(rt.resolve_and_invoke(asm, hash.0, &[1234]).unwrap(), 1234);
    let negative = rt
        .resolve_and_invoke(asm, hash.0, &[(-7i64) as u64])
        .unwrap();
    assert_eq!(negative as i64, -7);

    assert_eq!(rt.resolve_and_invoke(asm, eq.0, &[5, 5]).unwrap(), 1);
    assert_eq!(rt.resolve_and_invoke(asm, eq.0, &[5, 6]).unwrap(), 0);
    let both_negative = rt
        .resolve_and_invoke(asm, eq.0, &[(-3i64) as u64, (-3i64) as u64])
        .unwrap();
    assert_eq!(both_negative, 1);
}

#[test]
fn test_constrained_calls_on_user_value_types() {
    let mut b = ImageBuilder::new("constrained_vt");
    let corelib = b.assembly_ref("corelib");
    let object = b.type_ref(corelib, "System", "Object");
    let value_type = b.type_ref(corelib, "System", "ValueType");

    let render_sig = method_sig(true, &[elem::I4], &[]);
    // class Formatter { virtual int Render() => 13; }
    let formatter = b.add_type("", "Formatter", 0, Some(object));
    b.add_method(
        "Render",
        0x01C6,
        &render_sig,
        MethodBodyDef::tiny(vec![0x1F, 0x0D, 0x2A]),
    );
    // struct SVal { long x; virtual int Render() => 42; }
    let sval = b.add_type("", "SVal", 0x0008, Some(value_type));
    b.add_field("x", 0x0006, &field_sig(&[elem::I8]));
    let sval_render = b.add_method(
        "Render",
        0x01C6,
        &render_sig,
        MethodBodyDef::tiny(vec![0x1F, 0x2A, 0x2A]),
    );
    b.add_type("", "Program", 0, Some(object));
    let render_ref = b.member_ref(formatter, "Render", &render_sig);

    let sval_local = {
        let mut vt = vec![elem::VALUETYPE];
        vt.extend(type_token(sval));
        vt
    };

    // Direct branch: the target is declared on the value type itself, so
    // the constrained call takes the managed pointer without boxing.
    let direct_locals = b.stand_alone_sig(&locals_sig(&[&sval_local]));
    let mut direct_code = vec![0x12, 0x00, 0xFE, 0x16];
    direct_code.extend_from_slice(&token_bytes(sval));
    direct_code.push(0x6F);
    direct_code.extend_from_slice(&token_bytes(sval_render));
    direct_code.push(0x2A);
    let mut direct_body = MethodBodyDef::fat(2, direct_code);
    direct_body.locals = Some(direct_locals);
    let direct = b.add_method(
        "Direct",
        0x0016,
        &method_sig(false, &[elem::I4], &[]),
        direct_body,
    );

    // Boxed branch: the target resolves to Formatter's declaration, so
    // the receiver boxes and dispatches through its own vtable slot;
    // landing on SVal's entry (42, not Formatter's 13) proves both the
    // boxing and the dispatch.
    let boxed_locals = b.stand_alone_sig(&locals_sig(&[&sval_local]));
    let mut boxed_code = vec![0x12, 0x00, 0xFE, 0x16];
    boxed_code.extend_from_slice(&token_bytes(sval));
    boxed_code.push(0x6F);
    boxed_code.extend_from_slice(&token_bytes(render_ref));
    boxed_code.push(0x2A);
    let mut boxed_body = MethodBodyDef::fat(2, boxed_code);
    boxed_body.locals = Some(boxed_locals);
    let boxed = b.add_method(
        "Boxed",
        0x0016,
        &method_sig(false, &[elem::I4], &[]),
        boxed_body,
    );

    let rt = rt();
    let asm = rt.load_assembly("constrained_vt", b.finish(), true).unwrap();
    assert_eq!(rt.resolve_and_invoke(asm, direct.0, &[]).unwrap(), 42);
    assert_eq!(rt.resolve_and_invoke(asm, boxed.0, &[]).unwrap(), 42);
}

#[test]
fn test_s4_array_survives_collection_via_static_root() {
    let mut b = ImageBuilder::new("s4_arrays");
    let corelib = b.assembly_ref("corelib");
    let object = b.type_ref(corelib, "System", "Object");
    let int32 = b.type_ref(corelib, "System", "Int32");

    b.add_type("", "Globals", 0, Some(object));
    let data = b.add_field("data", 0x0016, &field_sig(&[elem::SZARRAY, elem::I4]));
    b.add_type("", "Program", 0, Some(object));

    // Fill(n): data = new int[n]; for (i = 0; i < n; i++) data[i] = i;
    let fill_locals = b.stand_alone_sig(&locals_sig(&[&[elem::SZARRAY, elem::I4], &[elem::I4]]));
    let mut fill_code = vec![0x02, 0x8D];
    fill_code.extend_from_slice(&token_bytes(int32));
    fill_code.extend_from_slice(&[
        0x0A, // store arr
        0x16, 0x0B, // i = 0
        0x07, 0x02, 0x2F, 0x0A, // while !(i >= n)
        0x06, 0x07, 0x07, 0x9E, // arr[i] = i
        0x07, 0x17, 0x58, 0x0B, // i += 1
        0x2B, 0xF2, // loop
        0x06, 0x80,
    ]);
    fill_code.extend_from_slice(&token_bytes(data));
    fill_code.push(0x2A);
    let mut fill_body = MethodBodyDef::fat(4, fill_code);
    fill_body.locals = Some(fill_locals);
    let fill = b.add_method(
        "Fill",
        0x0016,
        &method_sig(false, &[elem::VOID], &[&[elem::I4]]),
        fill_body,
    );

    // Sum(): walk the static array.
    let sum_locals = b.stand_alone_sig(&locals_sig(&[
        &[elem::I4],
        &[elem::I4],
        &[elem::SZARRAY, elem::I4],
    ]));
    let mut sum_code = vec![0x7E];
    sum_code.extend_from_slice(&token_bytes(data));
    sum_code.extend_from_slice(&[
        0x0C, // arr local
        0x16, 0x0A, // sum = 0
        0x16, 0x0B, // i = 0
        0x07, 0x08, 0x8E, 0x69, 0x2F, 0x0C, // while !(i >= arr.Length)
        0x06, 0x08, 0x07, 0x94, 0x58, 0x0A, // sum += arr[i]
        0x07, 0x17, 0x58, 0x0B, // i += 1
        0x2B, 0xEE, // loop
        0x06, 0x2A, // return sum
    ]);
    let mut sum_body = MethodBodyDef::fat(4, sum_code);
    sum_body.locals = Some(sum_locals);
    let sum = b.add_method("Sum", 0x0016, &method_sig(false, &[elem::I4], &[]), sum_body);

    let rt = rt();
    let asm = rt.load_assembly("s4_arrays", b.finish(), true).unwrap();
    rt.resolve_and_invoke(asm, fill.0, &[1000]).unwrap();

    // The array is reachable only through the static slot; two forced
    // collections must leave it (and its backing store) intact.
    rt.collect();
    rt.collect();
    assert_eq!(rt.resolve_and_invoke(asm, sum.0, &[]).unwrap(), 499_500);
}

#[test]
fn test_s5_string_literals_intern_pointer_equal() {
    let (mut b, object) = image("s5_strings");
    b.add_type("", "Program", 0, Some(object));
    // Two distinct #US tokens with equal content: ldstr twice, ceq.
    let t1 = b.user_string("abc");
    let t2 = b.user_string("abc");
    assert_ne!(t1, t2);
    let mut code = vec![0x72];
    code.extend_from_slice(&token_bytes(t1));
    code.push(0x72);
    code.extend_from_slice(&token_bytes(t2));
    code.extend_from_slice(&[0xFE, 0x01, 0x2A]);
    let eq = b.add_method(
        "LiteralEq",
        0x0016,
        &method_sig(false, &[elem::I4], &[]),
        MethodBodyDef::tiny(code),
    );

    let rt = rt();
    let asm = rt.load_assembly("s5_strings", b.finish(), true).unwrap();
    assert_eq!(rt.resolve_and_invoke(asm, eq.0, &[]).unwrap(), 1);

    // The kernel-facing intern agrees with the literal pool.
    let lit = rt.load_user_string(asm, t1.0).unwrap();
    let interned = rt.intern_str("abc").unwrap();
    assert_eq!(lit, interned);
    assert_eq!(rt.intern_str("abc").unwrap(), interned);
}

#[test]
fn test_s2_catch_selection_prefers_innermost_clause() {
    let mut b = ImageBuilder::new("s2_catch");
    let corelib = b.assembly_ref("corelib");
    let object = b.type_ref(corelib, "System", "Object");

    let ctor_sig = method_sig(true, &[elem::VOID], &[]);
    let e0 = b.add_type("", "E0", 0, Some(object));
    b.add_method(".ctor", 0x1886, &ctor_sig, MethodBodyDef::tiny(vec![0x2A]));
    let e1 = b.add_type("", "E1", 0, Some(e0));
    let e1_ctor = b.add_method(".ctor", 0x1886, &ctor_sig, MethodBodyDef::tiny(vec![0x2A]));
    b.add_type("", "Program", 0, Some(object));

    let locals = b.stand_alone_sig(&locals_sig(&[&[elem::I4]]));
    // try { throw new E1(); } catch (E0) { r = 1; } catch (E1) { r = 2; }
    let mut code = vec![0x73];
    code.extend_from_slice(&token_bytes(e1_ctor));
    code.push(0x7A); // throw
    code.extend_from_slice(&[0x26, 0x17, 0x0A, 0xDE, 0x05]); // catch E0
    code.extend_from_slice(&[0x26, 0x18, 0x0A, 0xDE, 0x00]); // catch E1
    code.extend_from_slice(&[0x06, 0x2A]); // return r
    let mut body = MethodBodyDef::fat(2, code);
    body.locals = Some(locals);
    body.clauses = vec![
        EhClause {
            kind: EhClauseKind::Catch(e0),
            try_offset: 0,
            try_len: 6,
            handler_offset: 6,
            handler_len: 5,
        },
        EhClause {
            kind: EhClauseKind::Catch(e1),
            try_offset: 0,
            try_len: 6,
            handler_offset: 11,
            handler_len: 5,
        },
    ];
    let try_method = b.add_method("Try", 0x0016, &method_sig(false, &[elem::I4], &[]), body);

    let rt = rt();
    let asm = rt.load_assembly("s2_catch", b.finish(), true).unwrap();
    // E1 is assignable to E0, and the E0 clause comes first.
    assert_eq!(rt.resolve_and_invoke(asm, try_method.0, &[]).unwrap(), 1);
}

#[test]
fn test_divide_by_zero_is_caught_by_typed_clause() {
    let mut b = ImageBuilder::new("div_catch");
    let corelib = b.assembly_ref("corelib");
    let object = b.type_ref(corelib, "System", "Object");
    let dbz = b.type_ref(corelib, "System", "DivideByZeroException");
    b.add_type("", "Program", 0, Some(object));

    let locals = b.stand_alone_sig(&locals_sig(&[&[elem::I4]]));
    // try { r = a / b; } catch (DivideByZeroException) { r = -1; }
    let code = vec![
        0x02, 0x03, 0x5B, 0x0A, // r = a / b
        0xDE, 0x05, // leave end
        0x26, 0x15, 0x0A, 0xDE, 0x00, // handler: r = -1
        0x06, 0x2A, // end: return r
    ];
    let mut body = MethodBodyDef::fat(2, code);
    body.locals = Some(locals);
    body.clauses = vec![EhClause {
        kind: EhClauseKind::Catch(dbz),
        try_offset: 0,
        try_len: 6,
        handler_offset: 6,
        handler_len: 5,
    }];
    let safe_div = b.add_method(
        "SafeDiv",
        0x0016,
        &method_sig(false, &[elem::I4], &[&[elem::I4], &[elem::I4]]),
        body,
    );

    let rt = rt();
    let asm = rt.load_assembly("div_catch", b.finish(), true).unwrap();
    assert_eq!(rt.resolve_and_invoke(asm, safe_div.0, &[10, 2]).unwrap(), 5);
    let caught = rt.resolve_and_invoke(asm, safe_div.0, &[1, 0]).unwrap();
    assert_eq!(caught as i64, -1);
    assert_eq!(rt.resolve_and_invoke(asm, safe_div.0, &[9, 3]).unwrap(), 3);
}

#[test]
fn test_finally_runs_on_the_normal_path() {
    let mut b = ImageBuilder::new("finally_normal");
    let corelib = b.assembly_ref("corelib");
    let object = b.type_ref(corelib, "System", "Object");
    b.add_type("", "Globals", 0, Some(object));
    let counter = b.add_field("counter", 0x0016, &field_sig(&[elem::I4]));
    b.add_type("", "Program", 0, Some(object));

    // try { } finally { counter++; } return counter;
    let mut code = vec![0x00, 0xDE, 0x0D, 0x7E];
    code.extend_from_slice(&token_bytes(counter));
    code.extend_from_slice(&[0x17, 0x58, 0x80]);
    code.extend_from_slice(&token_bytes(counter));
    code.push(0xDC); // endfinally
    code.push(0x7E);
    code.extend_from_slice(&token_bytes(counter));
    code.push(0x2A);
    let mut body = MethodBodyDef::fat(2, code);
    body.clauses = vec![EhClause {
        kind: EhClauseKind::Finally,
        try_offset: 0,
        try_len: 3,
        handler_offset: 3,
        handler_len: 13,
    }];
    let run = b.add_method(
        "RunFinally",
        0x0016,
        &method_sig(false, &[elem::I4], &[]),
        body,
    );

    let rt = rt();
    let asm = rt.load_assembly("finally_normal", b.finish(), true).unwrap();
    assert_eq!(rt.resolve_and_invoke(asm, run.0, &[]).unwrap(), 1);
    assert_eq!(rt.resolve_and_invoke(asm, run.0, &[]).unwrap(), 2);
}

#[test]
fn test_overflow_variant_raises_at_max() {
    let (mut b, object) = image("ovf_add");
    b.add_type("", "Program", 0, Some(object));
    // int.MaxValue + 1 with add.ovf: propagates to the invoke boundary.
    let code = vec![0x20, 0xFF, 0xFF, 0xFF, 0x7F, 0x17, 0xD6, 0x2A];
    let ovf = b.add_method(
        "Ovf",
        0x0016,
        &method_sig(false, &[elem::I4], &[]),
        MethodBodyDef::tiny(code),
    );

    let rt = rt();
    let asm = rt.load_assembly("ovf_add", b.finish(), true).unwrap();
    assert!(matches!(
        rt.resolve_and_invoke(asm, ovf.0, &[]),
        Err(RuntimeError::ManagedException)
    ));
    // Non-overflowing operands compute normally through the same body?
    // add.ovf on (MAX, 1) always overflows; a plain add elsewhere shows
    // the wrapping contrast.
    let (mut b2, object2) = image("wrap_add");
    b2.add_type("", "Program", 0, Some(object2));
    let wrap = b2.add_method(
        "Wrap",
        0x0016,
        &method_sig(false, &[elem::I4], &[]),
        MethodBodyDef::tiny(vec![0x20, 0xFF, 0xFF, 0xFF, 0x7F, 0x17, 0x58, 0x2A]),
    );
    let asm2 = rt.load_assembly("wrap_add", b2.finish(), true).unwrap();
    let wrapped = rt.resolve_and_invoke(asm2, wrap.0, &[]).unwrap();
    assert_eq!(wrapped as i64, i32::MIN as i64);
}

#[test]
fn test_null_receiver_raises_null_reference() {
    let (mut b, object) = image("null_len");
    b.add_type("", "Program", 0, Some(object));
    // ldnull; ldlen - the null check converts to a managed exception.
    let nul = b.add_method(
        "NullLen",
        0x0016,
        &method_sig(false, &[elem::I4], &[]),
        MethodBodyDef::tiny(vec![0x14, 0x8E, 0x69, 0x2A]),
    );

    let rt = rt();
    let asm = rt.load_assembly("null_len", b.finish(), true).unwrap();
    assert!(matches!(
        rt.resolve_and_invoke(asm, nul.0, &[]),
        Err(RuntimeError::ManagedException)
    ));
}

#[test]
fn test_gc_inside_managed_code_walks_frames_precisely() {
    let mut b = ImageBuilder::new("gc_pressure");
    let corelib = b.assembly_ref("corelib");
    let object = b.type_ref(corelib, "System", "Object");
    let int32 = b.type_ref(corelib, "System", "Int32");
    b.add_type("", "Program", 0, Some(object));

    // for (i = 0; i < n; i++) { a = new int[3]; a[0] = i; sum += a[0]; }
    // With the trigger threshold forced to zero, every allocation stops
    // the world and walks this frame: the reference local must keep the
    // previous array alive and nothing else may be misread.
    let locals = b.stand_alone_sig(&locals_sig(&[
        &[elem::SZARRAY, elem::I4],
        &[elem::I4],
        &[elem::I4],
    ]));
    let mut code = vec![
        0x16, 0x0B, // i = 0
        0x16, 0x0C, // sum = 0
        0x07, 0x02, 0x2F, 0x17, // while !(i >= n)
        0x19, 0x8D, // a = new int[3]
    ];
    code.extend_from_slice(&token_bytes(int32));
    code.extend_from_slice(&[
        0x0A, // store a
        0x06, 0x16, 0x07, 0x9E, // a[0] = i
        0x08, 0x06, 0x16, 0x94, 0x58, 0x0C, // sum += a[0]
        0x07, 0x17, 0x58, 0x0B, // i += 1
        0x2B, 0xE5, // loop
        0x08, 0x2A, // return sum
    ]);
    let mut body = MethodBodyDef::fat(4, code);
    body.locals = Some(locals);
    let churn = b.add_method(
        "Churn",
        0x0016,
        &method_sig(false, &[elem::I4], &[&[elem::I4]]),
        body,
    );

    let rt = rt();
    let asm = rt.load_assembly("gc_pressure", b.finish(), true).unwrap();
    rt.collector.lock().set_threshold(0);
    let result = rt.resolve_and_invoke(asm, churn.0, &[50]);
    rt.collector
        .lock()
        .set_threshold(silex_runtime::defaults::GC_THRESHOLD);
    assert_eq!(result.unwrap(), 1225);
}

#[test]
fn test_gc_cycles_preserve_interned_roots() {
    let rt = rt();
    // Pool entries are permanent roots: back-to-back cycles must leave
    // them at the same address with the same content. (Exact freed-byte
    // accounting is covered by the collector's unit tests; this suite
    // shares its heap with concurrently running tests.)
    let anchor = rt.intern_str("gc-stability-anchor").unwrap();
    rt.collect();
    rt.collect();
    let again = rt.intern_str("gc-stability-anchor").unwrap();
    assert_eq!(anchor, again);
}
