//! Remote stack unwinding for a stopped tracee thread.
//!
//! Walks the x86-64 frame-pointer chain of the remote process with
//! `process_vm_readv`, starting from the registers captured at the stop.
//! The first entry is always the stop's RIP. Unwinding fails softly: when
//! the chain cannot be followed any further, whatever was gathered so far
//! is returned.
//!
//! Binaries compiled with `-fomit-frame-pointer` may yield short stacks;
//! that degrades the trace but never the tracee.

use std::io::IoSliceMut;

use nix::libc::user_regs_struct;
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::unistd::Pid;

/// Hard bound on captured frames, matching the on-disk record format.
pub const STACK_MAX: usize = 100;

/// Instruction pointers from innermost (current) outward.
///
/// `max_depth` caps the walk below [`STACK_MAX`]; a zero or negative cap
/// yields an empty stack.
pub fn unwind(tid: Pid, regs: &user_regs_struct, max_depth: i32) -> Vec<u64> {
    if max_depth <= 0 {
        return Vec::new();
    }
    let limit = STACK_MAX.min(max_depth as usize);
    let mut stack = Vec::with_capacity(16);

    stack.push(regs.rip);
    let mut rbp = regs.rbp;

    while stack.len() < limit {
        if rbp == 0 {
            break;
        }
        // Frame layout: [rbp] = saved rbp, [rbp + 8] = return address.
        let saved_rbp = match read_word(tid, rbp) {
            Ok(word) => word,
            Err(_) => break,
        };
        let ret_addr = match read_word(tid, rbp.wrapping_add(8)) {
            Ok(word) => word,
            Err(_) => break,
        };
        if ret_addr == 0 {
            break;
        }
        stack.push(ret_addr);
        rbp = saved_rbp;
    }

    stack
}

fn read_word(tid: Pid, addr: u64) -> nix::Result<u64> {
    let mut buf = [0u8; 8];
    let mut local = [IoSliceMut::new(&mut buf)];
    let remote = [RemoteIoVec {
        base: addr as usize,
        len: 8,
    }];
    process_vm_readv(tid, &mut local, &remote)?;
    Ok(u64::from_ne_bytes(buf))
}
