//! Event dispatch: hook registries and per-traced-thread state.
//!
//! Hooks are plain function pointers in tables built once at engine
//! construction. A hook receives the engine (its handler), the stopped
//! thread, the register file at the stop and the thread's mutable state;
//! hooks never block and never suspend.

use std::sync::atomic::AtomicBool;
use std::sync::Mutex;

use nix::libc::user_regs_struct;
use nix::unistd::Pid;

use crate::engine::Engine;

/// Callback invoked on a syscall or breakpoint stop.
pub type HookFn = fn(&Engine, Pid, &user_regs_struct, &mut ThreadInner);

/// Hook keyed by syscall number; `invoke` fires on the entry stop,
/// `result` on the exit stop.
pub struct SyscallHook {
    pub nr: i64,
    pub invoke: Option<HookFn>,
    pub result: Option<HookFn>,
}

/// Hook keyed by a raw ELF symbol name. A present `result` makes the
/// function return-tracked (a breakpoint is planted at the caller's
/// return address on entry).
pub struct FunctionHook {
    pub name: &'static str,
    pub invoke: Option<HookFn>,
    pub result: Option<HookFn>,
}

/// A pending result breakpoint: where the traced call returns to and
/// which function-hook owns the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnBreakpoint {
    pub addr: u64,
    pub function: usize,
}

/// State only ever mutated by the thread's own supervisor.
#[derive(Debug, Default)]
pub struct ThreadInner {
    /// Per syscall-hook slot: currently between entry and exit stop.
    pub syscall_in_flight: Vec<bool>,
    /// Outstanding return breakpoints, innermost last.
    pub ret_stack: Vec<ReturnBreakpoint>,
}

/// Per-thread context shared between that thread's supervisor and the
/// step-over protocol of the others.
#[derive(Debug)]
pub struct ThreadState {
    /// Set while the thread is held in SIGSTOP during another thread's
    /// step-over. Atomic so step-over never takes a foreign inner lock.
    pub paused: AtomicBool,
    pub inner: Mutex<ThreadInner>,
}

impl ThreadState {
    pub fn new(syscall_slots: usize) -> Self {
        Self {
            paused: AtomicBool::new(false),
            inner: Mutex::new(ThreadInner {
                syscall_in_flight: vec![false; syscall_slots],
                ret_stack: Vec::new(),
            }),
        }
    }
}
