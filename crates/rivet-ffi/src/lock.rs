//! The interpreter's global execution lock.
//!
//! The engine interoperates with a cooperative interpreter whose threads
//! serialize on one lock. The single suspension point in the whole core is
//! a blocking native call: the invoker releases the lock for the duration
//! of the call and reacquires it afterwards, so other interpreter threads
//! keep running while native code blocks.
//!
//! The lock is an explicit value passed where it is needed, never ambient
//! process state; one interpreter instance owns one lock.

use std::cell::Cell;

use parking_lot::{Mutex, MutexGuard};

pub struct ExecutionLock {
    inner: Mutex<()>,
}

impl ExecutionLock {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(()),
        }
    }

    /// Enter interpreter execution on this thread, blocking until the lock
    /// is available. Marks the thread as interpreter-known, which is what
    /// callback dispatch consults to pick its regime.
    pub fn lock(&self) -> ExecutionGuard<'_> {
        let held = self.inner.lock();
        mark_interpreter_thread();
        set_holds_lock(true);
        ExecutionGuard {
            lock: self,
            held: Some(held),
        }
    }
}

impl Default for ExecutionLock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ExecutionGuard<'a> {
    lock: &'a ExecutionLock,
    held: Option<MutexGuard<'a, ()>>,
}

impl ExecutionGuard<'_> {
    /// Run `f` with the execution lock released, reacquiring before
    /// returning. The suspension window for blocking native calls.
    pub fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.held.take();
        set_holds_lock(false);
        let result = f();
        self.held = Some(self.lock.inner.lock());
        set_holds_lock(true);
        result
    }
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        if self.held.is_some() {
            set_holds_lock(false);
        }
    }
}

thread_local! {
    static INTERPRETER_THREAD: Cell<bool> = const { Cell::new(false) };
    static HOLDS_LOCK: Cell<bool> = const { Cell::new(false) };
}

fn set_holds_lock(value: bool) {
    HOLDS_LOCK.with(|flag| flag.set(value));
}

/// Whether the current thread holds an execution lock right now. False
/// inside an [`ExecutionGuard::unlocked`] window; callback dispatch uses
/// this to decide whether it must acquire the lock before running a
/// handler in place.
pub fn holds_execution_lock() -> bool {
    HOLDS_LOCK.with(|flag| flag.get())
}

/// Mark the current OS thread as known to the interpreter. Threads the
/// interpreter never created (library-spawned ones) stay unmarked, and
/// callbacks arriving on them are marshaled instead of run in place.
pub fn mark_interpreter_thread() {
    INTERPRETER_THREAD.with(|flag| flag.set(true));
}

pub fn is_interpreter_thread() -> bool {
    INTERPRETER_THREAD.with(|flag| flag.get())
}
