//! Built-in hook tables for the traced syscalls and allocator functions.
//!
//! Arguments follow the x86-64 syscall and SysV call conventions: rdi,
//! rsi, rdx (and r8 for the mmap fd), results in rax. Each hook forwards
//! into [`Engine::record_invoke`] / [`Engine::record_result`] with the
//! operation kind and the argument slots worth keeping.

use nix::libc;
use nix::libc::user_regs_struct;
use nix::unistd::Pid;

use crate::dispatch::{FunctionHook, SyscallHook, ThreadInner};
use crate::engine::Engine;
use crate::ops::Operation;

/// Syscall hook table. The first mmap pair is the library watcher that
/// drives breakpoint discovery; the second records the mmap event itself.
pub fn syscall_hooks() -> Vec<SyscallHook> {
    vec![
        SyscallHook {
            nr: libc::SYS_mmap,
            invoke: Some(watch_mmap_invoke),
            result: Some(watch_mmap_result),
        },
        SyscallHook {
            nr: libc::SYS_brk,
            invoke: Some(on_brk_invoke),
            result: Some(on_brk_result),
        },
        SyscallHook {
            nr: libc::SYS_mmap,
            invoke: Some(on_mmap_invoke),
            result: Some(on_mmap_result),
        },
        SyscallHook {
            nr: libc::SYS_munmap,
            invoke: Some(on_munmap_invoke),
            result: Some(on_munmap_result),
        },
        SyscallHook {
            nr: libc::SYS_clone,
            invoke: Some(on_clone_invoke),
            result: Some(on_clone_result),
        },
        SyscallHook {
            nr: libc::SYS_clone3,
            invoke: Some(on_clone3_invoke),
            result: Some(on_clone3_result),
        },
        SyscallHook {
            nr: libc::SYS_fork,
            invoke: Some(on_fork_invoke),
            result: Some(on_fork_result),
        },
        SyscallHook {
            nr: libc::SYS_vfork,
            invoke: Some(on_vfork_invoke),
            result: Some(on_vfork_result),
        },
        SyscallHook {
            nr: libc::SYS_execve,
            invoke: Some(on_execve_invoke),
            result: Some(on_execve_result),
        },
    ]
}

/// Function hook table, keyed by raw ELF symbol names (the C++ operator
/// new/delete entries are the Itanium-mangled symbols).
pub fn function_hooks() -> Vec<FunctionHook> {
    vec![
        FunctionHook {
            name: "sbrk",
            invoke: Some(on_sbrk_invoke),
            result: Some(on_sbrk_result),
        },
        FunctionHook {
            name: "free",
            invoke: Some(on_free_invoke),
            result: None,
        },
        FunctionHook {
            name: "malloc",
            invoke: Some(on_malloc_invoke),
            result: Some(on_malloc_result),
        },
        FunctionHook {
            name: "calloc",
            invoke: Some(on_calloc_invoke),
            result: Some(on_calloc_result),
        },
        FunctionHook {
            name: "realloc",
            invoke: Some(on_realloc_invoke),
            result: Some(on_realloc_result),
        },
        FunctionHook {
            name: "valloc",
            invoke: Some(on_valloc_invoke),
            result: Some(on_valloc_result),
        },
        FunctionHook {
            name: "posix_memalign",
            invoke: Some(on_posix_memalign_invoke),
            result: Some(on_posix_memalign_result),
        },
        FunctionHook {
            name: "aligned_alloc",
            invoke: Some(on_aligned_alloc_invoke),
            result: Some(on_aligned_alloc_result),
        },
        FunctionHook {
            name: "_Znwm",
            invoke: Some(on_new_invoke),
            result: Some(on_new_result),
        },
        FunctionHook {
            name: "_Znam",
            invoke: Some(on_new_array_invoke),
            result: Some(on_new_array_result),
        },
        FunctionHook {
            name: "_ZdlPv",
            invoke: Some(on_delete_legacy_invoke),
            result: None,
        },
        FunctionHook {
            name: "_ZdlPvm",
            invoke: Some(on_delete_invoke),
            result: None,
        },
        FunctionHook {
            name: "_ZdaPv",
            invoke: Some(on_delete_array_invoke),
            result: None,
        },
    ]
}

// --- library-load watcher ------------------------------------------------

/// Entry side of the watcher: if the mapped fd resolves to a shared
/// object (".so" terminal or versioned), queue it for breakpoint setup.
fn watch_mmap_invoke(engine: &Engine, _tid: Pid, regs: &user_regs_struct, _thread: &mut ThreadInner) {
    let path = match crate::target_info::file_path(engine.target_pid(), regs.r8) {
        Ok(path) => path,
        Err(_) => return, // anonymous mapping or dead fd
    };
    let is_shared_object = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(".so") || n.contains(".so."))
        .unwrap_or(false);
    if is_shared_object {
        engine.queue_library(path);
    }
}

/// Exit side: a remap over the known breakpoint range can have wiped the
/// trap bytes, so re-arm everything inside the new mapping.
fn watch_mmap_result(engine: &Engine, tid: Pid, regs: &user_regs_struct, _thread: &mut ThreadInner) {
    let len = regs.rsi;
    if let Some(end) = regs.rax.checked_add(len) {
        engine.rearm_overlapping(tid, regs.rax, end);
    }
}

// --- syscall events ------------------------------------------------------

fn on_brk_invoke(engine: &Engine, tid: Pid, regs: &user_regs_struct, _thread: &mut ThreadInner) {
    engine.record_invoke(Operation::Brk, tid, regs.rdi, 0, regs);
}

fn on_brk_result(engine: &Engine, tid: Pid, regs: &user_regs_struct, _thread: &mut ThreadInner) {
    engine.record_result(Operation::Brk, tid, regs.rax);
}

fn on_mmap_invoke(engine: &Engine, tid: Pid, regs: &user_regs_struct, _thread: &mut ThreadInner) {
    engine.record_invoke(Operation::Mmap, tid, regs.rdi, regs.rsi, regs);
}

fn on_mmap_result(engine: &Engine, tid: Pid, regs: &user_regs_struct, _thread: &mut ThreadInner) {
    engine.record_result(Operation::Mmap, tid, regs.rax);
}

fn on_munmap_invoke(engine: &Engine, tid: Pid, regs: &user_regs_struct, _thread: &mut ThreadInner) {
    engine.record_invoke(Operation::Munmap, tid, regs.rdi, regs.rsi, regs);
}

fn on_munmap_result(engine: &Engine, tid: Pid, regs: &user_regs_struct, _thread: &mut ThreadInner) {
    engine.record_result(Operation::Munmap, tid, regs.rax);
}

fn on_clone_invoke(engine: &Engine, tid: Pid, regs: &user_regs_struct, _thread: &mut ThreadInner) {
    // rdi: clone flags
    engine.record_invoke(Operation::Clone, tid, regs.rdi, 0, regs);
}

fn on_clone_result(engine: &Engine, tid: Pid, regs: &user_regs_struct, _thread: &mut ThreadInner) {
    // rax: child tid
    engine.record_result(Operation::Clone, tid, regs.rax);
}

fn on_clone3_invoke(engine: &Engine, tid: Pid, regs: &user_regs_struct, _thread: &mut ThreadInner) {
    engine.record_invoke(Operation::Clone3, tid, regs.rdi, 0, regs);
}

fn on_clone3_result(engine: &Engine, tid: Pid, regs: &user_regs_struct, _thread: &mut ThreadInner) {
    engine.record_result(Operation::Clone3, tid, regs.rax);
}

fn on_fork_invoke(engine: &Engine, tid: Pid, regs: &user_regs_struct, _thread: &mut ThreadInner) {
    engine.record_invoke(Operation::Fork, tid, 0, 0, regs);
}

fn on_fork_result(engine: &Engine, tid: Pid, regs: &user_regs_struct, _thread: &mut ThreadInner) {
    engine.record_result(Operation::Fork, tid, regs.rax);
}

fn on_vfork_invoke(engine: &Engine, tid: Pid, regs: &user_regs_struct, _thread: &mut ThreadInner) {
    engine.record_invoke(Operation::Vfork, tid, 0, 0, regs);
}

fn on_vfork_result(engine: &Engine, tid: Pid, regs: &user_regs_struct, _thread: &mut ThreadInner) {
    engine.record_result(Operation::Vfork, tid, regs.rax);
}

fn on_execve_invoke(engine: &Engine, tid: Pid, regs: &user_regs_struct, _thread: &mut ThreadInner) {
    engine.record_invoke(Operation::Execve, tid, regs.rdi, regs.rsi, regs);
}

fn on_execve_result(engine: &Engine, tid: Pid, regs: &user_regs_struct, _thread: &mut ThreadInner) {
    engine.record_result(Operation::Execve, tid, regs.rax);
}

// --- allocator functions -------------------------------------------------

fn on_sbrk_invoke(engine: &Engine, tid: Pid, regs: &user_regs_struct, _thread: &mut ThreadInner) {
    engine.record_invoke(Operation::Sbrk, tid, regs.rdi, 0, regs);
}

fn on_sbrk_result(engine: &Engine, tid: Pid, regs: &user_regs_struct, _thread: &mut ThreadInner) {
    engine.record_result(Operation::Sbrk, tid, regs.rax);
}

fn on_free_invoke(engine: &Engine, tid: Pid, regs: &user_regs_struct, _thread: &mut ThreadInner) {
    engine.record_invoke(Operation::Free, tid, regs.rdi, 0, regs);
}

fn on_malloc_invoke(engine: &Engine, tid: Pid, regs: &user_regs_struct, _thread: &mut ThreadInner) {
    engine.record_invoke(Operation::Malloc, tid, regs.rdi, 0, regs);
}

fn on_malloc_result(engine: &Engine, tid: Pid, regs: &user_regs_struct, _thread: &mut ThreadInner) {
    engine.record_result(Operation::Malloc, tid, regs.rax);
}

fn on_calloc_invoke(engine: &Engine, tid: Pid, regs: &user_regs_struct, _thread: &mut ThreadInner) {
    engine.record_invoke(Operation::Calloc, tid, regs.rdi, regs.rsi, regs);
}

fn on_calloc_result(engine: &Engine, tid: Pid, regs: &user_regs_struct, _thread: &mut ThreadInner) {
    engine.record_result(Operation::Calloc, tid, regs.rax);
}

fn on_realloc_invoke(engine: &Engine, tid: Pid, regs: &user_regs_struct, _thread: &mut ThreadInner) {
    engine.record_invoke(Operation::Realloc, tid, regs.rdi, regs.rsi, regs);
}

fn on_realloc_result(engine: &Engine, tid: Pid, regs: &user_regs_struct, _thread: &mut ThreadInner) {
    engine.record_result(Operation::Realloc, tid, regs.rax);
}

fn on_valloc_invoke(engine: &Engine, tid: Pid, regs: &user_regs_struct, _thread: &mut ThreadInner) {
    engine.record_invoke(Operation::Valloc, tid, regs.rdi, 0, regs);
}

fn on_valloc_result(engine: &Engine, tid: Pid, regs: &user_regs_struct, _thread: &mut ThreadInner) {
    engine.record_result(Operation::Valloc, tid, regs.rax);
}

fn on_posix_memalign_invoke(
    engine: &Engine,
    tid: Pid,
    regs: &user_regs_struct,
    _thread: &mut ThreadInner,
) {
    // posix_memalign(&ptr, alignment, size): the interesting pair is
    // (size, alignment) and the out-pointer lives in rdi.
    engine.record_invoke(Operation::PosixMemalign, tid, regs.rdx, regs.rsi, regs);
}

fn on_posix_memalign_result(
    engine: &Engine,
    tid: Pid,
    regs: &user_regs_struct,
    _thread: &mut ThreadInner,
) {
    engine.record_result(Operation::PosixMemalign, tid, regs.rdi);
}

fn on_aligned_alloc_invoke(
    engine: &Engine,
    tid: Pid,
    regs: &user_regs_struct,
    _thread: &mut ThreadInner,
) {
    engine.record_invoke(Operation::AlignedAlloc, tid, regs.rdi, regs.rsi, regs);
}

fn on_aligned_alloc_result(
    engine: &Engine,
    tid: Pid,
    regs: &user_regs_struct,
    _thread: &mut ThreadInner,
) {
    engine.record_result(Operation::AlignedAlloc, tid, regs.rax);
}

fn on_new_invoke(engine: &Engine, tid: Pid, regs: &user_regs_struct, _thread: &mut ThreadInner) {
    engine.record_invoke(Operation::New, tid, regs.rdi, 0, regs);
}

fn on_new_result(engine: &Engine, tid: Pid, regs: &user_regs_struct, _thread: &mut ThreadInner) {
    engine.record_result(Operation::New, tid, regs.rax);
}

fn on_new_array_invoke(engine: &Engine, tid: Pid, regs: &user_regs_struct, _thread: &mut ThreadInner) {
    engine.record_invoke(Operation::NewArray, tid, regs.rdi, 0, regs);
}

fn on_new_array_result(engine: &Engine, tid: Pid, regs: &user_regs_struct, _thread: &mut ThreadInner) {
    engine.record_result(Operation::NewArray, tid, regs.rax);
}

fn on_delete_legacy_invoke(
    engine: &Engine,
    tid: Pid,
    regs: &user_regs_struct,
    _thread: &mut ThreadInner,
) {
    engine.record_invoke(Operation::DeleteLegacy, tid, regs.rdi, 0, regs);
}

fn on_delete_invoke(engine: &Engine, tid: Pid, regs: &user_regs_struct, _thread: &mut ThreadInner) {
    // sized delete: pointer and size
    engine.record_invoke(Operation::Delete, tid, regs.rdi, regs.rsi, regs);
}

fn on_delete_array_invoke(
    engine: &Engine,
    tid: Pid,
    regs: &user_regs_struct,
    _thread: &mut ThreadInner,
) {
    engine.record_invoke(Operation::DeleteArray, tid, regs.rdi, 0, regs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_only_hooks_are_not_return_tracked() {
        for hook in function_hooks() {
            match hook.name {
                "free" | "_ZdlPv" | "_ZdlPvm" | "_ZdaPv" => {
                    assert!(hook.result.is_none(), "{} must be entry-only", hook.name)
                }
                _ => assert!(hook.result.is_some(), "{} must be return-tracked", hook.name),
            }
        }
    }

    #[test]
    fn test_mmap_has_watcher_and_event_hooks() {
        let hooks = syscall_hooks();
        let mmap_slots = hooks.iter().filter(|h| h.nr == libc::SYS_mmap).count();
        assert_eq!(mmap_slots, 2);
    }

    #[test]
    fn test_every_syscall_hook_has_both_phases() {
        for hook in syscall_hooks() {
            assert!(hook.invoke.is_some());
            assert!(hook.result.is_some());
        }
    }
}
