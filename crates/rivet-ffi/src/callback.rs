//! Native-to-interpreter callbacks.
//!
//! A [`CallbackTrampoline`] materializes an interpreter handler as a native
//! code pointer. Native code calls the pointer like any C function; the
//! trampoline converts the native arguments into [`Value`]s, runs the
//! handler, and writes the converted result back.
//!
//! Dispatch has two regimes. On a thread the interpreter knows about the
//! handler runs in place. On a foreign thread (one a native library spawned
//! itself) the call is marshaled to a dedicated dispatcher thread and the
//! foreign thread blocks until the reply arrives, so handlers always run on
//! interpreter-known threads. A panicking handler never unwinds into
//! native frames; it is caught, logged, and a zero result returned.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crossbeam_channel::{bounded, unbounded, Sender};
use libffi::low::ffi_cif;
use libffi::middle::{Cif, Closure};
use libc::c_void;
use once_cell::sync::Lazy;

use rivet_memory::MemoryRegion;

use crate::error::{FfiError, Result};
use crate::lock::{
    holds_execution_lock, is_interpreter_thread, mark_interpreter_thread, ExecutionLock,
};
use crate::types::{NativeType, TypeKind};
use crate::value::Value;

/// A function signature: parameter types plus return type.
#[derive(Debug, Clone)]
pub struct Signature {
    pub args: Vec<NativeType>,
    pub ret: NativeType,
}

impl Signature {
    pub fn new(args: Vec<NativeType>, ret: NativeType) -> Self {
        Self { args, ret }
    }
}

/// The interpreter-side handler a trampoline invokes.
pub type CallbackHandler = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

struct TrampolineState {
    signature: Arc<Signature>,
    handler: CallbackHandler,
    /// When present, dispatch acquires this before running the handler
    /// unless the calling thread already holds it. An interpreter thread
    /// sitting in a blocking native call has released the lock, so its
    /// callbacks must reacquire before re-entering interpreter logic.
    lock: Option<Arc<ExecutionLock>>,
}

/// An owned native entry point bound to an interpreter handler.
///
/// The code pointer stays valid exactly as long as the trampoline value is
/// alive; handing the pointer to native code that outlives the trampoline
/// is the caller's bug to avoid.
pub struct CallbackTrampoline {
    code: usize,
    // Declared before `_state` so the closure (which borrows the state)
    // drops first.
    _closure: Closure<'static>,
    _state: Box<TrampolineState>,
}

// The state is Send + Sync and the closure is immutable after build.
unsafe impl Send for CallbackTrampoline {}
unsafe impl Sync for CallbackTrampoline {}

impl CallbackTrampoline {
    pub fn new(signature: Arc<Signature>, handler: CallbackHandler) -> Result<Self> {
        Self::build(signature, handler, None)
    }

    /// Like [`new`](Self::new), with an execution lock that foreign-thread
    /// dispatch acquires around the handler.
    pub fn with_lock(
        signature: Arc<Signature>,
        handler: CallbackHandler,
        lock: Arc<ExecutionLock>,
    ) -> Result<Self> {
        Self::build(signature, handler, Some(lock))
    }

    fn build(
        signature: Arc<Signature>,
        handler: CallbackHandler,
        lock: Option<Arc<ExecutionLock>>,
    ) -> Result<Self> {
        let mut arg_ffis = Vec::with_capacity(signature.args.len());
        for ty in &signature.args {
            check_arg_type(ty)?;
            arg_ffis.push(ty.ffi_type()?);
        }
        check_ret_type(&signature.ret)?;
        let ret_ffi = signature.ret.ffi_type()?;
        let cif = Cif::new(arg_ffis, ret_ffi);

        let state = Box::new(TrampolineState {
            signature,
            handler,
            lock,
        });
        // The box gives the state a stable address for the closure's
        // lifetime; the struct's drop order upholds the borrow.
        let state_ref: &'static TrampolineState =
            unsafe { &*(state.as_ref() as *const TrampolineState) };
        let closure = Closure::new(cif, trampoline_entry, state_ref);
        let code = *closure.code_ptr() as usize;
        log::debug!("built callback trampoline at {code:#x}");
        Ok(Self {
            code,
            _closure: closure,
            _state: state,
        })
    }

    /// The native entry point address.
    pub fn code(&self) -> usize {
        self.code
    }

    /// The entry point as a pointer value, ready to pass as a function
    /// argument or store into a struct field.
    pub fn as_value(&self) -> Value {
        Value::Pointer(MemoryRegion::unbounded(self.code as *mut u8))
    }
}

impl std::fmt::Debug for CallbackTrampoline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackTrampoline")
            .field("code", &format_args!("{:#x}", self.code))
            .finish()
    }
}

fn check_arg_type(ty: &NativeType) -> Result<()> {
    match ty.kind() {
        TypeKind::Bool
        | TypeKind::I8
        | TypeKind::U8
        | TypeKind::I16
        | TypeKind::U16
        | TypeKind::I32
        | TypeKind::U32
        | TypeKind::I64
        | TypeKind::U64
        | TypeKind::F32
        | TypeKind::F64
        | TypeKind::Pointer
        | TypeKind::CString
        | TypeKind::Function(_) => Ok(()),
        TypeKind::Mapped { inner, .. } => check_arg_type(inner),
        other_kind => Err(FfiError::TypeMismatch {
            expected: "scalar or pointer callback parameter",
            got: kind_name(other_kind).to_string(),
        }),
    }
}

fn check_ret_type(ty: &NativeType) -> Result<()> {
    match ty.kind() {
        TypeKind::Void
        | TypeKind::Bool
        | TypeKind::I8
        | TypeKind::U8
        | TypeKind::I16
        | TypeKind::U16
        | TypeKind::I32
        | TypeKind::U32
        | TypeKind::I64
        | TypeKind::U64
        | TypeKind::F32
        | TypeKind::F64
        | TypeKind::Pointer
        | TypeKind::Function(_) => Ok(()),
        TypeKind::Mapped { inner, .. } => check_ret_type(inner),
        // A string return would need storage that outlives the handler.
        other_kind => Err(FfiError::TypeMismatch {
            expected: "scalar or pointer callback return",
            got: kind_name(other_kind).to_string(),
        }),
    }
}

fn kind_name(kind: &TypeKind) -> &'static str {
    match kind {
        TypeKind::Struct(_) => "struct by value",
        TypeKind::Array { .. } => "inline array",
        TypeKind::LongDouble => "long double",
        TypeKind::CString => "string",
        TypeKind::Varargs => "varargs marker",
        TypeKind::Void => "void",
        _ => "unsupported type",
    }
}

unsafe extern "C" fn trampoline_entry(
    _cif: &ffi_cif,
    result: &mut u64,
    args: *const *const c_void,
    state: &TrampolineState,
) {
    *result = 0;
    let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<Value> {
        let values = read_args(&state.signature.args, args)?;
        Ok(dispatch(state, values))
    }));
    match outcome {
        Ok(Ok(value)) => {
            if let Err(e) = write_result(&state.signature.ret, result, value) {
                log::error!("callback result conversion failed: {e}; returning zero");
                *result = 0;
            }
        }
        Ok(Err(e)) => {
            log::error!("callback argument conversion failed: {e}; returning zero");
        }
        Err(_) => {
            log::error!("callback handler panicked; returning zero");
        }
    }
}

/// Convert the native argument slots into interpreter values. Each slot
/// points at storage of the declared parameter type.
unsafe fn read_args(types: &[NativeType], args: *const *const c_void) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(types.len());
    for (i, ty) in types.iter().enumerate() {
        values.push(read_arg(ty, *args.add(i))?);
    }
    Ok(values)
}

unsafe fn read_arg(ty: &NativeType, slot: *const c_void) -> Result<Value> {
    Ok(match ty.kind() {
        TypeKind::Bool => Value::Bool(*(slot as *const u8) != 0),
        TypeKind::I8 => Value::Int(*(slot as *const i8) as i64),
        TypeKind::U8 => Value::UInt(*(slot as *const u8) as u64),
        TypeKind::I16 => Value::Int(*(slot as *const i16) as i64),
        TypeKind::U16 => Value::UInt(*(slot as *const u16) as u64),
        TypeKind::I32 => Value::Int(*(slot as *const i32) as i64),
        TypeKind::U32 => Value::UInt(*(slot as *const u32) as u64),
        TypeKind::I64 => Value::Int(*(slot as *const i64)),
        TypeKind::U64 => Value::UInt(*(slot as *const u64)),
        TypeKind::F32 => Value::Float(*(slot as *const f32) as f64),
        TypeKind::F64 => Value::Float(*(slot as *const f64)),
        TypeKind::Pointer | TypeKind::Function(_) => {
            Value::Pointer(MemoryRegion::unbounded(*(slot as *const *mut u8)))
        }
        TypeKind::CString => {
            let ptr = *(slot as *const *mut u8);
            if ptr.is_null() {
                Value::Nil
            } else {
                let bytes = MemoryRegion::unbounded(ptr).get_c_string(0)?;
                Value::Str(String::from_utf8_lossy(&bytes).into_owned())
            }
        }
        TypeKind::Mapped { inner, converter } => {
            let raw = read_arg(inner, slot)?;
            converter.from_native(raw)?
        }
        other_kind => {
            return Err(FfiError::TypeMismatch {
                expected: "scalar or pointer callback parameter",
                got: kind_name(other_kind).to_string(),
            })
        }
    })
}

struct ForeignCall {
    run: Box<dyn FnOnce() -> Value + Send>,
    reply: Sender<Value>,
}

/// Single dispatcher thread that services callbacks arriving on foreign
/// threads. It marks itself interpreter-known so nested callbacks made
/// from a handler run in place instead of deadlocking on the channel.
static DISPATCHER: Lazy<Sender<ForeignCall>> = Lazy::new(|| {
    let (tx, rx) = unbounded::<ForeignCall>();
    std::thread::Builder::new()
        .name("rivet-callback-dispatch".to_string())
        .spawn(move || {
            mark_interpreter_thread();
            for call in rx {
                let value = (call.run)();
                let _ = call.reply.send(value);
            }
        })
        .expect("failed to spawn callback dispatcher thread");
    tx
});

fn dispatch(state: &TrampolineState, args: Vec<Value>) -> Value {
    if is_interpreter_thread() {
        let _guard = match &state.lock {
            Some(lock) if !holds_execution_lock() => Some(lock.lock()),
            _ => None,
        };
        return (state.handler)(&args);
    }
    log::trace!("marshaling callback from foreign thread");
    let handler = state.handler.clone();
    let lock = state.lock.clone();
    let (reply_tx, reply_rx) = bounded(1);
    let call = ForeignCall {
        run: Box::new(move || {
            let _guard = lock.as_ref().map(|l| l.lock());
            handler(&args)
        }),
        reply: reply_tx,
    };
    if DISPATCHER.send(call).is_err() {
        log::error!("callback dispatcher is gone; returning zero");
        return Value::Nil;
    }
    reply_rx.recv().unwrap_or(Value::Nil)
}

/// Write the handler's value into libffi's return slot. Integral returns
/// narrower than a word are widened the way libffi expects.
unsafe fn write_result(ty: &NativeType, result: &mut u64, value: Value) -> Result<()> {
    match ty.kind() {
        TypeKind::Void => {}
        TypeKind::Bool => *result = value.to_bool()? as u64,
        TypeKind::I8 => *result = value.to_i8()? as i64 as u64,
        TypeKind::U8 => *result = value.to_u8()? as u64,
        TypeKind::I16 => *result = value.to_i16()? as i64 as u64,
        TypeKind::U16 => *result = value.to_u16()? as u64,
        TypeKind::I32 => *result = value.to_i32()? as i64 as u64,
        TypeKind::U32 => *result = value.to_u32()? as u64,
        TypeKind::I64 => *result = value.to_i64()? as u64,
        TypeKind::U64 => *result = value.to_u64()?,
        TypeKind::F32 => *(result as *mut u64 as *mut f32) = value.to_f64()? as f32,
        TypeKind::F64 => *(result as *mut u64 as *mut f64) = value.to_f64()?,
        TypeKind::Pointer | TypeKind::Function(_) => {
            *(result as *mut u64 as *mut usize) = value.to_region()?.address();
        }
        TypeKind::Mapped { inner, converter } => {
            let native = converter.to_native(&value)?;
            write_result(inner, result, native)?;
        }
        other_kind => {
            return Err(FfiError::TypeMismatch {
                expected: "scalar or pointer callback return",
                got: kind_name(other_kind).to_string(),
            })
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_signature() -> Arc<Signature> {
        Arc::new(Signature::new(
            vec![NativeType::i32(), NativeType::i32()],
            NativeType::i32(),
        ))
    }

    #[test]
    fn test_in_place_dispatch() {
        mark_interpreter_thread();
        let tramp = CallbackTrampoline::new(
            add_signature(),
            Arc::new(|args: &[Value]| {
                let a = args[0].to_i64().unwrap();
                let b = args[1].to_i64().unwrap();
                Value::Int(a + b)
            }),
        )
        .unwrap();
        let f: extern "C" fn(i32, i32) -> i32 = unsafe { std::mem::transmute(tramp.code()) };
        assert_eq!(f(20, 22), 42);
        assert_eq!(f(-5, 3), -2);
    }

    #[test]
    fn test_in_place_dispatch_waits_for_a_held_lock() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::time::Duration;

        mark_interpreter_thread();
        let lock = Arc::new(ExecutionLock::new());
        let holder_ready = Arc::new(AtomicBool::new(false));
        let released = Arc::new(AtomicBool::new(false));

        let lock2 = lock.clone();
        let ready2 = holder_ready.clone();
        let released2 = released.clone();
        let holder = std::thread::spawn(move || {
            let _guard = lock2.lock();
            ready2.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(150));
            // The release flag becomes visible before the guard drops, so
            // any thread that acquires afterwards must observe it.
            released2.store(true, Ordering::SeqCst);
        });
        while !holder_ready.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }

        let released3 = released.clone();
        let tramp = CallbackTrampoline::with_lock(
            add_signature(),
            Arc::new(move |args: &[Value]| {
                assert!(
                    released3.load(Ordering::SeqCst),
                    "handler ran while another thread held the execution lock"
                );
                Value::Int(args[0].to_i64().unwrap() + args[1].to_i64().unwrap())
            }),
            lock.clone(),
        )
        .unwrap();
        // This thread is interpreter-known but does not hold the lock, so
        // dispatch must block on it instead of running straight through.
        let f: extern "C" fn(i32, i32) -> i32 = unsafe { std::mem::transmute(tramp.code()) };
        assert_eq!(f(5, 6), 11);
        holder.join().unwrap();
    }

    #[test]
    fn test_foreign_thread_dispatch() {
        let tramp = CallbackTrampoline::new(
            add_signature(),
            Arc::new(|args: &[Value]| {
                Value::Int(args[0].to_i64().unwrap() * args[1].to_i64().unwrap())
            }),
        )
        .unwrap();
        let code = tramp.code();
        // This spawned thread is not interpreter-known, so the call goes
        // through the dispatcher.
        let result = std::thread::spawn(move || {
            assert!(!is_interpreter_thread());
            let f: extern "C" fn(i32, i32) -> i32 = unsafe { std::mem::transmute(code) };
            f(6, 7)
        })
        .join()
        .unwrap();
        assert_eq!(result, 42);
    }

    #[test]
    fn test_panicking_handler_returns_zero() {
        mark_interpreter_thread();
        let tramp = CallbackTrampoline::new(
            add_signature(),
            Arc::new(|_args: &[Value]| panic!("handler bug")),
        )
        .unwrap();
        let f: extern "C" fn(i32, i32) -> i32 = unsafe { std::mem::transmute(tramp.code()) };
        assert_eq!(f(1, 2), 0);
    }

    #[test]
    fn test_struct_by_value_signature_is_rejected() {
        use crate::layout::{LayoutStyle, StructLayoutBuilder};
        let layout = Arc::new(
            StructLayoutBuilder::new(LayoutStyle::Natural)
                .add_field("x", NativeType::i32())
                .unwrap()
                .build()
                .unwrap(),
        );
        let sig = Arc::new(Signature::new(
            vec![NativeType::structure(layout)],
            NativeType::void(),
        ));
        assert!(matches!(
            CallbackTrampoline::new(sig, Arc::new(|_: &[Value]| Value::Nil)),
            Err(FfiError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_void_callback_delivers_each_argument_once() {
        use std::sync::Mutex;
        mark_interpreter_thread();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let sig = Arc::new(Signature::new(vec![NativeType::i32()], NativeType::void()));
        let tramp = CallbackTrampoline::new(
            sig,
            Arc::new(move |args: &[Value]| {
                seen2.lock().unwrap().push(args[0].to_i64().unwrap());
                Value::Nil
            }),
        )
        .unwrap();
        let f: extern "C" fn(i32) = unsafe { std::mem::transmute(tramp.code()) };
        f(0x7fff_ffff);
        f(-1);
        assert_eq!(*seen.lock().unwrap(), vec![0x7fff_ffff, -1]);
    }

    #[test]
    fn test_pointer_round_trip_through_handler() {
        mark_interpreter_thread();
        let sig = Arc::new(Signature::new(
            vec![NativeType::pointer()],
            NativeType::pointer(),
        ));
        let tramp =
            CallbackTrampoline::new(sig, Arc::new(|args: &[Value]| args[0].clone())).unwrap();
        let f: extern "C" fn(*const u8) -> *const u8 =
            unsafe { std::mem::transmute(tramp.code()) };
        let probe = 0xdead_b000usize as *const u8;
        assert_eq!(f(probe), probe);
    }
}
