//! The tracing engine: attach/launch, per-thread supervisors, syscall
//! stops, software breakpoints and library-load discovery.
//!
//! One supervisor thread blocks in `waitpid` per traced TID and never
//! waits on another TID (step-over is the one exception, where it briefly
//! reaps the SIGSTOPs it sent). All breakpoint byte manipulation happens
//! under the breakpoints write lock so no tracee thread can execute
//! through a disarmed trap on another thread's behalf.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::libc;
use nix::libc::user_regs_struct;
use nix::sys::ptrace::{self, AddressType, Options};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dispatch::{FunctionHook, ReturnBreakpoint, SyscallHook, ThreadState};
use crate::ops::Operation;
use crate::stack_unwind;
use crate::stats::Stats;
use crate::target_info;
use crate::trace_store::{StoreConfig, TraceRecord, TraceStore};

const INT3: i64 = 0xcc;
const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

/// Software breakpoints planted in the tracee, address to original word.
struct BreakpointTable {
    map: BTreeMap<u64, i64>,
    min: u64,
    max: u64,
}

impl BreakpointTable {
    fn new() -> Self {
        Self {
            map: BTreeMap::new(),
            min: 0,
            max: 0,
        }
    }

    fn contains(&self, addr: u64) -> bool {
        self.map.contains_key(&addr)
    }

    fn range(&self) -> (u64, u64) {
        (self.min, self.max)
    }

    /// Read and remember the original word at `addr`, then arm the trap.
    fn add(&mut self, tid: Pid, addr: u64) -> Result<()> {
        let orig = ptrace::read(tid, addr as AddressType)
            .with_context(|| format!("reading word at {:#x}", addr))?;
        self.map.insert(addr, orig);
        if self.min == 0 || addr < self.min {
            self.min = addr;
        }
        if self.max == 0 || addr > self.max {
            self.max = addr;
        }
        self.arm(tid, addr)
    }

    fn arm(&self, tid: Pid, addr: u64) -> Result<()> {
        let orig = *self
            .map
            .get(&addr)
            .with_context(|| format!("arming unknown breakpoint {:#x}", addr))?;
        let word = (orig & !0xff) | INT3;
        // Safety: addr is a code address the tracee is stopped under; the
        // poke replaces one byte we read back on disarm.
        unsafe { ptrace::write(tid, addr as AddressType, word) }
            .with_context(|| format!("arming breakpoint at {:#x}", addr))?;
        Ok(())
    }

    fn disarm(&self, tid: Pid, addr: u64) -> Result<()> {
        let data = ptrace::read(tid, addr as AddressType)
            .with_context(|| format!("reading word at {:#x}", addr))?;
        if data & 0xff != INT3 {
            warn!(tid = tid.as_raw(), addr = format_args!("{:#x}", addr),
                  "breakpoint already disarmed");
            return Ok(());
        }
        let orig = *self
            .map
            .get(&addr)
            .with_context(|| format!("disarming unknown breakpoint {:#x}", addr))?;
        // Safety: restores the original byte recorded when the breakpoint
        // was planted; the tracee is stopped.
        unsafe { ptrace::write(tid, addr as AddressType, (data & !0xff) | (orig & 0xff)) }
            .with_context(|| format!("disarming breakpoint at {:#x}", addr))?;
        Ok(())
    }

    /// Re-arm every breakpoint inside `[lo, hi)` whose trap byte has been
    /// wiped, refreshing the remembered word from the new mapping.
    fn rearm_range(&mut self, tid: Pid, lo: u64, hi: u64) {
        let addrs: Vec<u64> = self.map.range(lo..hi).map(|(&a, _)| a).collect();
        for addr in addrs {
            let current = match ptrace::read(tid, addr as AddressType) {
                Ok(word) => word,
                Err(e) => {
                    warn!(tid = tid.as_raw(), addr = format_args!("{:#x}", addr),
                          error = %e, "cannot probe remapped breakpoint");
                    continue;
                }
            };
            if current & 0xff == INT3 {
                continue;
            }
            self.map.insert(addr, current);
            if let Err(e) = self.arm(tid, addr) {
                warn!(tid = tid.as_raw(), addr = format_args!("{:#x}", addr),
                      error = %e, "re-arming remapped breakpoint failed");
            }
        }
    }
}

#[derive(Default)]
struct Libraries {
    loading: HashSet<String>,
    loaded: HashSet<String>,
}

/// The single owning value behind a trace run. Created in `main`, shared
/// (via `Arc`) with every supervisor; owns the dispatch tables, the
/// breakpoint state and the record-store handle.
pub struct Engine {
    /// Back-reference handed to freshly spawned supervisor threads.
    self_ref: Weak<Engine>,
    config: Config,
    store: Arc<TraceStore>,
    stats: Stats,
    syscall_hooks: Vec<SyscallHook>,
    function_hooks: Vec<FunctionHook>,
    /// Breakpoint address to function-hook index.
    functions: RwLock<BTreeMap<u64, usize>>,
    breakpoints: RwLock<BreakpointTable>,
    threads: RwLock<HashMap<i32, Arc<ThreadState>>>,
    libraries: Mutex<Libraries>,
    pending_libraries: AtomicBool,
    doing_setup: AtomicBool,
    active_threads: AtomicUsize,
    supervisors: Mutex<Vec<JoinHandle<()>>>,
    target_pid: OnceLock<Pid>,
    target_path: OnceLock<PathBuf>,
}

impl Engine {
    pub fn new(config: Config) -> Arc<Self> {
        let store = TraceStore::new(StoreConfig {
            save: config.save,
            binary_path: config.save_binary_path.clone(),
            print_log: config.print_log,
            print_stack: config.print_stack,
            print_save: config.print_save,
        });
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            config,
            store,
            stats: Stats::new(),
            syscall_hooks: crate::hooks::syscall_hooks(),
            function_hooks: crate::hooks::function_hooks(),
            functions: RwLock::new(BTreeMap::new()),
            breakpoints: RwLock::new(BreakpointTable::new()),
            threads: RwLock::new(HashMap::new()),
            libraries: Mutex::new(Libraries::default()),
            pending_libraries: AtomicBool::new(false),
            doing_setup: AtomicBool::new(false),
            active_threads: AtomicUsize::new(0),
            supervisors: Mutex::new(Vec::new()),
            target_pid: OnceLock::new(),
            target_path: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn store(&self) -> &Arc<TraceStore> {
        &self.store
    }

    pub fn target_pid(&self) -> Pid {
        self.target_pid.get().copied().unwrap_or(Pid::from_raw(0))
    }

    pub fn target_path(&self) -> Option<&PathBuf> {
        self.target_path.get()
    }

    /// Launch or attach, then supervise the target until every traced
    /// thread has exited and the record store is drained.
    pub fn run(&self) -> Result<()> {
        let pid = match self.config.pid {
            Some(raw) => self.attach_target(Pid::from_raw(raw))?,
            None => self.spawn_target()?,
        };
        let _ = self.target_pid.set(pid);

        waitpid(pid, None).context("waiting for first stop")?;

        let path = target_info::target_path(pid).context("resolving target path")?;
        info!(pid = pid.as_raw(), path = %path.display(), "tracing target");
        // Seed discovery with the executable itself: the first syscall
        // stop then instruments the whole initial map, which also covers
        // attach targets that never dlopen anything afterwards.
        self.queue_library(path.clone());
        let _ = self.target_path.set(path);

        self.store.start(pid)?;
        self.add_thread(pid);
        if self.config.pid.is_some() {
            self.adopt_existing_threads(pid);
        }

        let outcome = self.trace_thread(pid);

        while self.active_threads.load(Ordering::Acquire) != 0 {
            std::thread::sleep(SHUTDOWN_POLL);
        }
        let handles: Vec<_> = {
            let mut supervisors = self.supervisors.lock().expect("supervisor list lock");
            supervisors.drain(..).collect()
        };
        for handle in handles {
            if handle.join().is_err() {
                warn!("supervisor thread panicked");
            }
        }
        self.store.stop();
        outcome
    }

    fn spawn_target(&self) -> Result<Pid> {
        let command = &self.config.command;
        anyhow::ensure!(!command.is_empty(), "no target command given");
        match unsafe { fork() }.context("forking for target")? {
            ForkResult::Parent { child } => Ok(child),
            ForkResult::Child => {
                if ptrace::traceme().is_err() {
                    std::process::exit(127);
                }
                let err = Command::new(&command[0]).args(&command[1..]).exec();
                eprintln!("failed to exec {}: {}", command[0], err);
                std::process::exit(1);
            }
        }
    }

    fn attach_target(&self, pid: Pid) -> Result<Pid> {
        ptrace::attach(pid).with_context(|| format!("attaching to pid {}", pid))?;
        Ok(pid)
    }

    /// Attach-mode only: every sibling TID already alive gets its own
    /// supervisor.
    fn adopt_existing_threads(&self, pid: Pid) {
        let task_dir = format!("/proc/{}/task", pid);
        let entries = match std::fs::read_dir(&task_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(pid = pid.as_raw(), error = %e, "cannot enumerate tasks");
                return;
            }
        };
        for entry in entries.flatten() {
            let tid = match entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) {
                Some(tid) if tid != pid.as_raw() => Pid::from_raw(tid),
                _ => continue,
            };
            if let Err(e) = ptrace::attach(tid) {
                warn!(tid = tid.as_raw(), error = %e, "cannot attach thread");
                continue;
            }
            self.stats.add_child(pid.as_raw(), tid.as_raw());
            self.add_thread(tid);
            self.spawn_supervisor(tid, false);
        }
    }

    /// Supervisor loop for one TID: set trace options, then dispatch
    /// every stop until the thread exits.
    fn trace_thread(&self, tid: Pid) -> Result<()> {
        debug!(tid = tid.as_raw(), "supervisor started");

        ptrace::setoptions(
            tid,
            Options::PTRACE_O_TRACESYSGOOD
                | Options::PTRACE_O_TRACECLONE
                | Options::PTRACE_O_TRACEFORK
                | Options::PTRACE_O_TRACEVFORK
                | Options::PTRACE_O_TRACEEXEC
                | Options::PTRACE_O_EXITKILL,
        )
        .context("setting ptrace options")?;
        ptrace::syscall(tid, None).context("starting syscall tracing")?;

        loop {
            let status = match waitpid(tid, Some(WaitPidFlag::__WALL)) {
                Ok(status) => status,
                Err(Errno::ECHILD) => break,
                Err(e) => return Err(e).context("waiting for tracee stop"),
            };

            let mut deliver: Option<Signal> = None;
            match status {
                WaitStatus::Exited(..) | WaitStatus::Signaled(..) => break,
                WaitStatus::PtraceEvent(_, _, event)
                    if event == libc::PTRACE_EVENT_CLONE
                        || event == libc::PTRACE_EVENT_FORK
                        || event == libc::PTRACE_EVENT_VFORK =>
                {
                    if let Err(e) = self.trace_new_thread(tid) {
                        warn!(tid = tid.as_raw(), error = %e, "new-thread adoption failed");
                    }
                }
                WaitStatus::PtraceEvent(..) => {} // exec and friends: just resume
                WaitStatus::PtraceSyscall(_) => {
                    // Discovery first, but the stop still toggles the
                    // in-flight flags: skipping trace_syscall here would
                    // desynchronise entry/exit pairing.
                    if self.pending_libraries.load(Ordering::Acquire) {
                        if let Err(e) = self.setup_breakpoints(tid) {
                            warn!(tid = tid.as_raw(), error = %e, "breakpoint setup failed");
                        }
                    }
                    if let Err(e) = self.trace_syscall(tid) {
                        warn!(tid = tid.as_raw(), error = %e, "syscall stop handling failed");
                    }
                }
                WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                    if let Err(e) = self.trace_breakpoint(tid) {
                        warn!(tid = tid.as_raw(), error = %e, "breakpoint stop handling failed");
                    }
                }
                WaitStatus::Stopped(_, signal) => {
                    deliver = Some(signal);
                }
                _ => {}
            }

            match ptrace::syscall(tid, deliver) {
                Ok(()) => {}
                Err(Errno::ESRCH) => break,
                Err(e) => return Err(e).context("resuming tracee"),
            }
        }

        debug!(tid = tid.as_raw(), "supervisor finished");
        Ok(())
    }

    /// Clone/fork/vfork event: register the child, hand it its own
    /// supervisor task.
    fn trace_new_thread(&self, tid: Pid) -> Result<()> {
        let raw = ptrace::getevent(tid).context("reading clone event message")?;
        if raw < 0 {
            return Ok(());
        }
        let child = Pid::from_raw(raw as i32);
        info!(parent = tid.as_raw(), child = child.as_raw(), "new thread");
        self.stats.add_child(tid.as_raw(), child.as_raw());

        waitpid(child, Some(WaitPidFlag::__WALL)).context("waiting for new thread stop")?;
        ptrace::detach(child, Signal::SIGSTOP).context("parking new thread")?;
        self.add_thread(child);
        self.spawn_supervisor(child, true);
        Ok(())
    }

    fn spawn_supervisor(&self, tid: Pid, reattach: bool) {
        let Some(engine) = self.self_ref.upgrade() else {
            return;
        };
        self.active_threads.fetch_add(1, Ordering::AcqRel);
        let spawned = std::thread::Builder::new()
            .name(format!("supervisor-{}", tid.as_raw()))
            .spawn(move || {
                let result = if reattach {
                    ptrace::attach(tid)
                        .map_err(anyhow::Error::from)
                        .and_then(|()| {
                            waitpid(tid, None).context("waiting for reattach stop")?;
                            engine.trace_thread(tid)
                        })
                } else {
                    waitpid(tid, None)
                        .context("waiting for attach stop")
                        .and_then(|_| engine.trace_thread(tid))
                };
                if let Err(e) = result {
                    warn!(tid = tid.as_raw(), error = %e, "supervisor exited with error");
                }
                engine.active_threads.fetch_sub(1, Ordering::AcqRel);
            });
        match spawned {
            Ok(handle) => self
                .supervisors
                .lock()
                .expect("supervisor list lock")
                .push(handle),
            Err(e) => {
                self.active_threads.fetch_sub(1, Ordering::AcqRel);
                warn!(tid = tid.as_raw(), error = %e, "cannot spawn supervisor");
            }
        }
    }

    /// Syscall entry/exit stop: toggle the per-thread in-flight flag of
    /// every hook slot matching `orig_rax` and fire the matching phase.
    fn trace_syscall(&self, tid: Pid) -> Result<()> {
        let state = self
            .thread(tid)
            .context("syscall stop for unregistered thread")?;
        let regs = ptrace::getregs(tid).context("reading registers")?;
        let mut inner = state.inner.lock().expect("thread state lock");

        for (slot, hook) in self.syscall_hooks.iter().enumerate() {
            if hook.nr as u64 != regs.orig_rax {
                continue;
            }
            if inner.syscall_in_flight[slot] {
                if let Some(result) = hook.result {
                    result(self, tid, &regs, &mut inner);
                }
                inner.syscall_in_flight[slot] = false;
            } else {
                if let Some(invoke) = hook.invoke {
                    invoke(self, tid, &regs, &mut inner);
                }
                inner.syscall_in_flight[slot] = true;
            }
        }
        Ok(())
    }

    /// SIGTRAP stop: classify the address behind RIP as function entry,
    /// pending return site or stale armed byte, then step over it.
    fn trace_breakpoint(&self, tid: Pid) -> Result<()> {
        let state = self
            .thread(tid)
            .context("breakpoint stop for unregistered thread")?;
        let regs = ptrace::getregs(tid).context("reading registers")?;
        // int3 leaves RIP one past the trap byte.
        let addr = regs.rip.wrapping_sub(1);
        let mut inner = state.inner.lock().expect("thread state lock");

        let entry = { self.functions.read().expect("functions lock").get(&addr).copied() };
        if let Some(index) = entry {
            let hook = &self.function_hooks[index];
            if let Some(invoke) = hook.invoke {
                invoke(self, tid, &regs, &mut inner);
            }
            if hook.result.is_some() {
                // The return address sits at *RSP while we are still on
                // the first instruction of the callee.
                let ret_addr = ptrace::read(tid, regs.rsp as AddressType)
                    .context("reading return address")? as u64;
                inner.ret_stack.push(ReturnBreakpoint {
                    addr: ret_addr,
                    function: index,
                });
                let mut breakpoints = self.breakpoints.write().expect("breakpoints lock");
                if !breakpoints.contains(ret_addr) {
                    breakpoints.add(tid, ret_addr)?;
                }
            }
            return self.step_over(tid, addr, &regs);
        }

        if let Some(top) = inner.ret_stack.last().copied() {
            if top.addr == addr {
                inner.ret_stack.pop();
                if let Some(result) = self.function_hooks[top.function].result {
                    result(self, tid, &regs, &mut inner);
                }
                // The address stays armed for future calls; only the
                // function association is released.
                return self.step_over(tid, addr, &regs);
            }
        }

        let armed = { self.breakpoints.read().expect("breakpoints lock").contains(addr) };
        if armed {
            // A return site planted for another thread's call.
            return self.step_over(tid, addr, &regs);
        }

        debug!(tid = tid.as_raw(), rip = format_args!("{:#x}", regs.rip),
               "SIGTRAP outside known breakpoints");
        Ok(())
    }

    /// Execute the original instruction under an armed breakpoint without
    /// any other thread observing the disarmed byte.
    fn step_over(&self, tid: Pid, addr: u64, regs: &user_regs_struct) -> Result<()> {
        let breakpoints = self.breakpoints.write().expect("breakpoints lock");
        self.pause_others(tid);

        let outcome = (|| -> Result<bool> {
            let mut rewound = *regs;
            rewound.rip = addr;
            ptrace::setregs(tid, rewound).context("rewinding RIP")?;
            breakpoints.disarm(tid, addr)?;

            // The first step after re-enabling can report an immediate
            // stop; a second step guarantees forward progress.
            for _ in 0..2 {
                ptrace::step(tid, None).context("single-stepping")?;
                match waitpid(tid, Some(WaitPidFlag::__WALL)) {
                    Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => {
                        return Ok(false);
                    }
                    Ok(_) => {}
                    Err(e) => return Err(e).context("waiting for single step"),
                }
            }
            Ok(true)
        })();

        let result = match outcome {
            Ok(true) => breakpoints.arm(tid, addr),
            Ok(false) => Ok(()), // thread is gone, nothing to re-arm
            Err(e) => {
                warn!(tid = tid.as_raw(), addr = format_args!("{:#x}", addr),
                      error = %e, "step-over failed");
                Err(e)
            }
        };

        self.continue_others();
        result
    }

    /// SIGSTOP every other running thread and wait until each is actually
    /// stopped. Threads already sitting in a ptrace-stop are skipped: they
    /// cannot run through the disarmed window.
    fn pause_others(&self, tid: Pid) {
        let threads = self.threads.read().expect("threads lock");
        for (&raw, state) in threads.iter() {
            state.paused.store(false, Ordering::Release);
            let other = Pid::from_raw(raw);
            if other == tid || ptrace::getsiginfo(other).is_ok() {
                continue;
            }
            if let Err(e) = kill(other, Signal::SIGSTOP) {
                warn!(tid = raw, error = %e, "cannot pause thread");
                continue;
            }
            match waitpid(other, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => {}
                Ok(_) => state.paused.store(true, Ordering::Release),
                Err(e) => warn!(tid = raw, error = %e, "waiting for paused thread"),
            }
        }
    }

    fn continue_others(&self) {
        let threads = self.threads.read().expect("threads lock");
        for (&raw, state) in threads.iter() {
            if !state.paused.swap(false, Ordering::AcqRel) {
                continue;
            }
            if let Err(e) = ptrace::syscall(Pid::from_raw(raw), None) {
                warn!(tid = raw, error = %e, "cannot resume paused thread");
            }
        }
    }

    /// Walk the process map and plant breakpoints for every hooked symbol
    /// in objects not seen before. Guarded against concurrent SIGTRAPs
    /// re-entering from other supervisors.
    fn setup_breakpoints(&self, tid: Pid) -> Result<()> {
        if self.doing_setup.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.setup_breakpoints_inner(tid);
        self.doing_setup.store(false, Ordering::Release);
        result
    }

    fn setup_breakpoints_inner(&self, tid: Pid) -> Result<()> {
        let pid = self.target_pid();
        let exclude = {
            let libraries = self.libraries.lock().expect("libraries lock");
            libraries.loaded.clone()
        };

        let mut discovered: Vec<(String, u64)> = Vec::new();
        target_info::scan_maps(pid, &exclude, |path, base| {
            discovered.push((path.to_string(), base));
            false
        })
        .context("scanning process maps")?;

        for (path, base) in discovered {
            {
                let mut libraries = self.libraries.lock().expect("libraries lock");
                libraries.loaded.insert(path.clone());
                libraries.loading.remove(&path);
                self.pending_libraries
                    .store(!libraries.loading.is_empty(), Ordering::Release);
            }
            self.store.on_library_loaded();

            let file = std::path::Path::new(&path);
            if !file.is_file() || !target_info::has_elf_magic(file) {
                continue;
            }
            info!(path = %path, base = format_args!("{:#x}", base), "loading library");

            let mut functions = self.functions.write().expect("functions lock");
            let mut breakpoints = self.breakpoints.write().expect("breakpoints lock");
            let scan = target_info::enumerate_dynsym(file, |name, offset| {
                if offset == 0 {
                    return false;
                }
                for (index, hook) in self.function_hooks.iter().enumerate() {
                    if hook.name != name {
                        continue;
                    }
                    let addr = base + offset;
                    if breakpoints.contains(addr) {
                        continue;
                    }
                    functions.insert(addr, index);
                    debug!(
                        name = name,
                        index = index,
                        path = %path,
                        addr = format_args!("{:#x}", addr),
                        "planting breakpoint"
                    );
                    if let Err(e) = breakpoints.add(tid, addr) {
                        warn!(name = name, addr = format_args!("{:#x}", addr),
                              error = %e, "planting breakpoint failed");
                    }
                }
                false
            });
            if let Err(e) = scan {
                warn!(path = %path, error = %e, "skipping unparsable library");
            }
        }
        Ok(())
    }

    // --- hook services ---------------------------------------------------

    /// Record an entry event, unwinding the stopped thread's stack unless
    /// unwinding is disabled.
    pub(crate) fn record_invoke(
        &self,
        op: Operation,
        tid: Pid,
        arg0: u64,
        arg1: u64,
        regs: &user_regs_struct,
    ) {
        self.stats.count_invoke(op);
        if !self.config.trace {
            return;
        }
        let stack = if self.config.stack_depth > 0 {
            stack_unwind::unwind(tid, regs, self.config.stack_depth)
        } else {
            Vec::new()
        };
        self.stats.note_stack_depth(stack.len());
        self.store.push(TraceRecord {
            tag: op.invoke_tag(),
            tid: tid.as_raw(),
            args: [arg0, arg1],
            timestamp_ns: self.store.now_ns(),
            stack,
        });
    }

    /// Record a return event; result records carry no stack.
    pub(crate) fn record_result(&self, op: Operation, tid: Pid, ret: u64) {
        self.stats.count_result(op);
        if !self.config.trace {
            return;
        }
        self.store.push(TraceRecord {
            tag: op.result_tag(),
            tid: tid.as_raw(),
            args: [ret, 0],
            timestamp_ns: self.store.now_ns(),
            stack: Vec::new(),
        });
    }

    /// Queue a freshly mapped shared object for breakpoint setup.
    pub(crate) fn queue_library(&self, path: PathBuf) {
        let path = path.to_string_lossy().into_owned();
        let mut libraries = self.libraries.lock().expect("libraries lock");
        if libraries.loaded.contains(&path) {
            return;
        }
        debug!(path = %path, "library pending discovery");
        libraries.loading.insert(path);
        self.pending_libraries.store(true, Ordering::Release);
    }

    /// Re-arm breakpoints wiped by a remap overlapping the known range.
    pub(crate) fn rearm_overlapping(&self, tid: Pid, lo: u64, hi: u64) {
        let overlaps = {
            let breakpoints = self.breakpoints.read().expect("breakpoints lock");
            let (min, max) = breakpoints.range();
            min != 0 && lo < max && hi > min
        };
        if !overlaps {
            return;
        }
        self.breakpoints
            .write()
            .expect("breakpoints lock")
            .rearm_range(tid, lo, hi);
        self.store.on_library_loaded();
    }

    /// Freeze the run's statistics into the printable/saveable report.
    pub fn build_report(&self) -> crate::stats::StatReport {
        let (child_tids, tid_relations) = self.stats.children();
        let commands = match self.config.pid {
            Some(pid) => vec!["-p".to_string(), pid.to_string()],
            None => self.config.command.clone(),
        };
        crate::stats::StatReport {
            extra: self.config.extra.clone(),
            argv: std::env::args().collect(),
            commands,
            target: self.config.target_name.clone(),
            target_full_path: self
                .target_path
                .get()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            working_directory: std::env::current_dir()
                .map(|d| d.display().to_string())
                .unwrap_or_default(),
            save_path: self.config.parent_dir().display().to_string(),
            max_stack_size: self.stats.max_stack_size(),
            filename_max_length: self.store.filename_max_length(),
            function_max_length: self.store.function_max_length(),
            main_pid: self.target_pid().as_raw(),
            child_tids,
            tid_relations,
            timestamp_start: self.config.start_timestamp.clone(),
            timestamp_end: crate::config::timestamp_now(),
            time_end_ns: self.store.now_ns(),
            op_invoke_counts: self.stats.invoke_counts(),
            op_result_counts: self.stats.result_counts(),
        }
    }

    // --- thread registry -------------------------------------------------

    fn thread(&self, tid: Pid) -> Option<Arc<ThreadState>> {
        self.threads
            .read()
            .expect("threads lock")
            .get(&tid.as_raw())
            .cloned()
    }

    fn add_thread(&self, tid: Pid) -> Arc<ThreadState> {
        let mut threads = self.threads.write().expect("threads lock");
        threads
            .entry(tid.as_raw())
            .or_insert_with(|| Arc::new(ThreadState::new(self.syscall_hooks.len())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_engine() -> Arc<Engine> {
        let mut config = Config::default();
        config.save = false;
        config.trace = true;
        Engine::new(config)
    }

    #[test]
    fn test_breakpoint_range_extends_both_ways() {
        let mut table = BreakpointTable::new();
        // Exercise the range bookkeeping without touching a tracee.
        table.map.insert(0x100, 0);
        table.min = 0x100;
        table.max = 0x100;
        for addr in [0x80u64, 0x200, 0x150] {
            table.map.insert(addr, 0);
            if table.min == 0 || addr < table.min {
                table.min = addr;
            }
            if table.max == 0 || addr > table.max {
                table.max = addr;
            }
        }
        assert_eq!(table.range(), (0x80, 0x200));
    }

    #[test]
    fn test_add_thread_is_idempotent() {
        let engine = test_engine();
        let tid = Pid::from_raw(1234);
        let first = engine.add_thread(tid);
        let second = engine.add_thread(tid);
        assert!(Arc::ptr_eq(&first, &second));
        let slots = first.inner.lock().unwrap().syscall_in_flight.len();
        assert_eq!(slots, engine.syscall_hooks.len());
    }

    #[test]
    fn test_queue_library_skips_loaded() {
        let engine = test_engine();
        {
            let mut libraries = engine.libraries.lock().unwrap();
            libraries.loaded.insert("/usr/lib/libc.so.6".to_string());
        }
        engine.queue_library(PathBuf::from("/usr/lib/libc.so.6"));
        assert!(!engine.pending_libraries.load(Ordering::Acquire));

        engine.queue_library(PathBuf::from("/usr/lib/libfoo.so.1"));
        assert!(engine.pending_libraries.load(Ordering::Acquire));
    }

    #[test]
    fn test_no_trace_mode_counts_but_drops() {
        // A no-trace engine keeps statistics flowing without touching the
        // (unstarted) store.
        let mut config = Config::default();
        config.trace = false;
        let silent = Engine::new(config);
        let regs: user_regs_struct = unsafe { std::mem::zeroed() };
        silent.record_invoke(Operation::Malloc, Pid::from_raw(1), 32, 0, &regs);
        silent.record_result(Operation::Malloc, Pid::from_raw(1), 0x1000);
        assert_eq!(silent.stats().invoke_count(Operation::Malloc), 1);
        assert_eq!(silent.stats().result_count(Operation::Malloc), 1);
    }
}
