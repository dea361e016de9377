//! Callback trampolines and the execution lock, exercised through libc.

#![cfg(unix)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rivet_ffi::{
    mark_interpreter_thread, BindingScope, CallbackTrampoline, DynamicLibrary, ExecutionLock,
    NativeType, OpenFlags, Signature, Value,
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

fn comparator() -> CallbackTrampoline {
    let signature = Arc::new(Signature::new(
        vec![NativeType::pointer(), NativeType::pointer()],
        NativeType::i32(),
    ));
    CallbackTrampoline::new(
        signature,
        Arc::new(|args: &[Value]| {
            let a = args[0].to_region().unwrap().get_i32(0).unwrap();
            let b = args[1].to_region().unwrap().get_i32(0).unwrap();
            Value::Int((a - b) as i64)
        }),
    )
    .unwrap()
}

fn fill_i32(buf: &HeapBuffer, values: &[i32]) {
    buf.region().put_array_of_i32(0, values).unwrap();
}

#[test]
fn qsort_calls_back_into_the_handler() {
    mark_interpreter_thread();
    let scope = process_scope();
    let qsort = scope
        .attach_declaration("qsort: (pointer, size_t, size_t, pointer) -> void", false)
        .unwrap();

    let cmp = comparator();
    let buf = HeapBuffer::allocate(4, 5, false).unwrap();
    fill_i32(&buf, &[3, 1, 4, 1, 5]);

    qsort
        .invoke(&[
            Value::Pointer(buf.region()),
            Value::UInt(5),
            Value::UInt(4),
            cmp.as_value(),
        ])
        .unwrap();

    assert_eq!(buf.region().get_array_of_i32(0, 5).unwrap(), vec![1, 1, 3, 4, 5]);
}

#[test]
fn qsort_from_a_foreign_thread_is_marshaled() {
    let scope = process_scope();
    let qsort = scope
        .attach_declaration("qsort: (pointer, size_t, size_t, pointer) -> void", false)
        .unwrap();
    let cmp = Arc::new(comparator());

    let buf = Arc::new(HeapBuffer::allocate(4, 4, false).unwrap());
    fill_i32(&buf, &[9, 2, 7, 2]);

    let qsort2 = qsort.clone();
    let cmp2 = cmp.clone();
    let buf2 = buf.clone();
    // The spawned thread is not interpreter-known, so every comparison is
    // marshaled to the dispatcher and the answer travels back.
    std::thread::spawn(move || {
        qsort2
            .invoke(&[
                Value::Pointer(buf2.region()),
                Value::UInt(4),
                Value::UInt(4),
                cmp2.as_value(),
            ])
            .unwrap();
    })
    .join()
    .unwrap();

    assert_eq!(buf.region().get_array_of_i32(0, 4).unwrap(), vec![2, 2, 7, 9]);
}

#[test]
fn blocking_call_releases_the_execution_lock() {
    let scope = process_scope();
    let usleep = scope
        .attach_declaration("usleep: (uint) -> int", true)
        .unwrap();

    let lock = Arc::new(ExecutionLock::new());
    let progressed = Arc::new(AtomicBool::new(false));

    let mut guard = lock.lock();
    let lock2 = lock.clone();
    let progressed2 = progressed.clone();
    let other = std::thread::spawn(move || {
        let _guard = lock2.lock();
        progressed2.store(true, Ordering::SeqCst);
    });

    // 200ms in native code with the lock released; the other interpreter
    // thread must get through in that window.
    usleep
        .invoke_with(&mut guard, &scope, &[Value::UInt(200_000)])
        .unwrap();
    other.join().unwrap();
    assert!(progressed.load(Ordering::SeqCst));
}
