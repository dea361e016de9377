//! End-to-end calls into libc through the whole binding stack.

#![cfg(unix)]

use std::sync::Arc;

use rivet_ffi::{
    last_error, BindingScope, CallConvention, DynamicLibrary, ExecutionLock, FfiError, Invoker,
    LayoutStyle, NativeType, OpenFlags, StructLayoutBuilder, Value,
};
use rivet_memory::HeapBuffer;

fn process_scope() -> BindingScope {
    let _ = env_logger::builder().is_test(true).try_init();
    let scope = BindingScope::new();
    scope.add_library(Arc::new(
        DynamicLibrary::open(None, OpenFlags::default()).unwrap(),
    ));
    scope
}

#[test]
fn abs_round_trips_the_full_i32_range() {
    let scope = process_scope();
    let abs = scope.attach_declaration("abs: (int) -> int", false).unwrap();

    for (input, expected) in [(0i64, 0i64), (42, 42), (-42, 42), (0x7fff_ffff, 0x7fff_ffff)] {
        let out = abs.invoke(&[Value::Int(input)]).unwrap();
        assert!(matches!(out, Value::Int(n) if n == expected), "abs({input})");
    }

    // One past i32::MAX must fail strictly, not wrap.
    assert!(matches!(
        abs.invoke(&[Value::Int(0x8000_0000)]),
        Err(FfiError::Range { .. })
    ));
}

#[test]
fn strlen_takes_a_string_copy() {
    let scope = process_scope();
    let strlen = scope
        .attach_declaration("strlen: (string) -> size_t", false)
        .unwrap();
    let out = strlen
        .invoke(&[Value::Str("hello, world".to_string())])
        .unwrap();
    assert!(matches!(out, Value::UInt(12)));
}

#[test]
fn snprintf_formats_promoted_varargs() {
    let scope = process_scope();
    let snprintf = scope
        .attach_declaration("snprintf: (pointer, size_t, string, ...) -> int", false)
        .unwrap();

    let buf = HeapBuffer::allocate(128, 1, true).unwrap();
    let out = snprintf
        .invoke(&[
            Value::Pointer(buf.region()),
            Value::UInt(128),
            Value::Str("%d %.1f %s".to_string()),
            // Each trailing argument is a (type name, value) pair. char and
            // float promote to int and double underneath.
            Value::Str("char".to_string()),
            Value::Int(65),
            Value::Str("float".to_string()),
            Value::Float(2.5),
            Value::Str("string".to_string()),
            Value::Str("ok".to_string()),
        ])
        .unwrap();
    assert!(matches!(out, Value::Int(n) if n > 0));
    assert_eq!(buf.region().get_c_string(0).unwrap(), b"65 2.5 ok");
}

#[test]
fn vararg_tags_resolve_through_the_calling_scope() {
    let scope = process_scope();
    scope.registry().typedef("int", "errcode").unwrap();
    let snprintf = scope
        .attach_declaration("snprintf: (pointer, size_t, string, ...) -> int", false)
        .unwrap();

    let buf = HeapBuffer::allocate(32, 1, true).unwrap();
    let args = [
        Value::Pointer(buf.region()),
        Value::UInt(32),
        Value::Str("%d".to_string()),
        Value::Str("errcode".to_string()),
        Value::Int(-7),
    ];

    let lock = ExecutionLock::new();
    let mut guard = lock.lock();
    let out = snprintf.invoke_with(&mut guard, &scope, &args).unwrap();
    assert!(matches!(out, Value::Int(2)));
    assert_eq!(buf.region().get_c_string(0).unwrap(), b"-7");
    drop(guard);

    // The alias is scope-local; the process-wide registry used by the
    // scope-less call path cannot see it.
    assert!(matches!(
        snprintf.invoke(&args),
        Err(FfiError::UnknownType(_))
    ));
}

#[test]
fn div_returns_a_struct_by_value() {
    // div_t { int quot; int rem; }
    let layout = Arc::new(
        StructLayoutBuilder::new(LayoutStyle::Natural)
            .add_field("quot", NativeType::i32())
            .unwrap()
            .add_field("rem", NativeType::i32())
            .unwrap()
            .build()
            .unwrap(),
    );
    let scope = process_scope();
    let address = scope.resolve("div").unwrap();
    let div = Invoker::build(
        address,
        vec![NativeType::i32(), NativeType::i32()],
        NativeType::structure(layout.clone()),
        CallConvention::Default,
        false,
    )
    .unwrap();

    let out = div.invoke(&[Value::Int(17), Value::Int(5)]).unwrap();
    let region = out.to_region().unwrap();
    assert!(matches!(layout.get(&region, "quot").unwrap(), Value::Int(3)));
    assert!(matches!(layout.get(&region, "rem").unwrap(), Value::Int(2)));
}

#[test]
fn struct_argument_passes_by_value() {
    // abs() only looks at the first int-sized word, but a one-field struct
    // wrapping an int is ABI-compatible with a plain int on the platforms
    // this test runs on. This exercises the struct staging path end to end.
    let layout = Arc::new(
        StructLayoutBuilder::new(LayoutStyle::Natural)
            .add_field("n", NativeType::i32())
            .unwrap()
            .build()
            .unwrap(),
    );
    let scope = process_scope();
    let address = scope.resolve("abs").unwrap();
    let abs = Invoker::build(
        address,
        vec![NativeType::structure(layout.clone())],
        NativeType::i32(),
        CallConvention::Default,
        false,
    )
    .unwrap();

    let buf = HeapBuffer::allocate(layout.size(), 1, true).unwrap();
    layout.put(&buf.region(), "n", &Value::Int(-9)).unwrap();
    let out = abs.invoke(&[Value::buffer(buf)]).unwrap();
    assert!(matches!(out, Value::Int(9)));
}

#[test]
fn getenv_null_return_becomes_nil() {
    let scope = process_scope();
    let getenv = scope
        .attach_declaration("getenv: (string) -> string", false)
        .unwrap();
    let out = getenv
        .invoke(&[Value::Str("RIVET_DEFINITELY_UNSET_VAR".to_string())])
        .unwrap();
    assert!(out.is_nil());
}

#[test]
fn errno_is_captured_after_the_call() {
    let scope = process_scope();
    let chdir = scope
        .attach_declaration("chdir: (string) -> int", false)
        .unwrap();
    let out = chdir
        .invoke(&[Value::Str("/rivet/no/such/directory".to_string())])
        .unwrap();
    assert!(matches!(out, Value::Int(-1)));
    assert_eq!(last_error(), libc::ENOENT);
}

#[test]
fn symbol_and_library_failures_are_distinct() {
    let scope = process_scope();
    assert!(matches!(
        scope.attach_declaration("rivet_not_a_symbol: () -> void", false),
        Err(FfiError::SymbolNotFound { .. })
    ));
    assert!(matches!(
        DynamicLibrary::open(Some(std::path::Path::new("/no/such.so")), OpenFlags::default()),
        Err(FfiError::Load { .. })
    ));
}
