//! Trace record store: lock-free event queue, background symbolising
//! worker and the compressed binary stream.
//!
//! Producers (the per-thread supervisors, via hooks) enqueue fixed-shape
//! records without blocking; a dedicated worker thread pops them, resolves
//! call-stack addresses to interned names and serialises everything
//! through the compressed sink. The symboliser handle lives on the worker
//! thread only; the engine just raises the dirty flag when the tracee maps
//! a new object.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam::queue::SegQueue;
use nix::unistd::Pid;
use tracing::{error, info, warn};

use crate::compress::CompressedWriter;
use crate::ops::{self, Operation, FILE_NAME_ENTRY, FUNC_NAME_ENTRY};
use crate::symbolize::Symbolizer;

/// Placeholder interned for names the debug info cannot provide.
const NIL_NAME: &str = "<nil>";

/// How long the worker naps when the queue is drained.
const IDLE_SLEEP: Duration = Duration::from_millis(25);

/// One event as captured at the stop, before symbolisation.
#[derive(Debug, Clone)]
pub struct TraceRecord {
    pub tag: u8,
    pub tid: i32,
    pub args: [u64; 2],
    pub timestamp_ns: i64,
    /// Instruction pointers, innermost first. Empty for result records.
    pub stack: Vec<u64>,
}

/// A symbolised stack slot as it appears on the stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ResolvedFrame {
    file_index: u32,
    func_index: u32,
    line: i32,
    column: i32,
}

/// Behaviour toggles the store needs from the invocation.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub save: bool,
    pub binary_path: PathBuf,
    pub print_log: bool,
    pub print_stack: bool,
    pub print_save: bool,
}

pub struct TraceStore {
    self_ref: Weak<TraceStore>,
    config: StoreConfig,
    queue: SegQueue<TraceRecord>,
    accepting: AtomicBool,
    stopped: AtomicBool,
    dirty: AtomicBool,
    start: Instant,
    worker: Mutex<Option<JoinHandle<()>>>,
    filename_max_length: AtomicI32,
    function_max_length: AtomicI32,
}

impl TraceStore {
    pub fn new(config: StoreConfig) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            config,
            queue: SegQueue::new(),
            accepting: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            dirty: AtomicBool::new(true),
            start: Instant::now(),
            worker: Mutex::new(None),
            filename_max_length: AtomicI32::new(-1),
            function_max_length: AtomicI32::new(-1),
        })
    }

    /// Nanoseconds since the store was created, on the steady clock all
    /// record timestamps share.
    pub fn now_ns(&self) -> i64 {
        self.start.elapsed().as_nanos() as i64
    }

    /// Open the sink and start the worker for the given tracee.
    pub fn start(&self, pid: Pid) -> Result<()> {
        let sink = if self.config.save {
            Some(
                CompressedWriter::create(&self.config.binary_path).with_context(|| {
                    format!("opening trace sink {}", self.config.binary_path.display())
                })?,
            )
        } else {
            None
        };

        let store = self
            .self_ref
            .upgrade()
            .context("trace store already dropped")?;
        let handle = std::thread::Builder::new()
            .name("trace-worker".into())
            .spawn(move || store.worker_loop(pid, sink))
            .context("spawning trace worker")?;
        *self.worker.lock().expect("worker handle lock") = Some(handle);
        self.accepting.store(true, Ordering::Release);
        info!(pid = %pid, save = self.config.save, "trace store started");
        Ok(())
    }

    /// Non-blocking enqueue from any supervisor thread. Returns `false`
    /// (after logging) when the store is not accepting records.
    pub fn push(&self, record: TraceRecord) -> bool {
        if self.config.print_log {
            self.show(&record);
        }
        if !self.accepting.load(Ordering::Acquire) || self.stopped.load(Ordering::Acquire) {
            warn!(
                tid = record.tid,
                tag = record.tag,
                "dropping trace record: store not accepting"
            );
            return false;
        }
        self.queue.push(record);
        true
    }

    /// Flag that the tracee mapped a new object; the worker rebuilds its
    /// process report before the next resolution pass.
    pub fn on_library_loaded(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Stop accepting records, drain the queue and close the sink.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let handle = self.worker.lock().expect("worker handle lock").take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("trace worker panicked");
            }
        }
    }

    pub fn filename_max_length(&self) -> i32 {
        self.filename_max_length.load(Ordering::Acquire)
    }

    pub fn function_max_length(&self) -> i32 {
        self.function_max_length.load(Ordering::Acquire)
    }

    fn worker_loop(&self, pid: Pid, sink: Option<CompressedWriter>) {
        let mut processor = Processor {
            store: self,
            symbolizer: Symbolizer::new(pid),
            sink,
            file_names: HashMap::new(),
            func_names: HashMap::new(),
            frame_cache: HashMap::new(),
        };

        while !self.stopped.load(Ordering::Acquire)
            || !self.queue.is_empty()
            || self.dirty.load(Ordering::Acquire)
        {
            if self.dirty.swap(false, Ordering::AcqRel) {
                if let Err(e) = processor.symbolizer.refresh() {
                    warn!(error = %e, "symbolizer refresh failed");
                }
                processor.frame_cache.clear();
                continue;
            }
            match self.queue.pop() {
                Some(record) => {
                    if let Err(e) = processor.process(record) {
                        error!(error = %e, "trace sink write failed");
                        break;
                    }
                }
                None => std::thread::sleep(IDLE_SLEEP),
            }
        }

        if let Some(sink) = processor.sink.take() {
            if let Err(e) = sink.finish() {
                error!(error = %e, "closing trace sink failed");
            }
        }
    }

    /// Per-event console logging, mirroring the stream content.
    fn show(&self, record: &TraceRecord) {
        let op = match Operation::from_tag(record.tag) {
            Some(op) => op,
            None => return,
        };
        // Sub-microsecond digits add nothing when eyeballing a log.
        let time_us = record.timestamp_ns / 1000;
        if ops::is_invoke(record.tag) {
            let mut line = format!("[{}][{}] invoke [{:>7}]", record.tid, time_us, op.name());
            match op.argc() {
                2 => line.push_str(&format!(" arg = [{:#x}, {:#x}]", record.args[0], record.args[1])),
                1 => line.push_str(&format!(" arg = [{:#x}]", record.args[0])),
                _ => {}
            }
            if !record.stack.is_empty() {
                line.push_str(&format!(", stack_size = [{}]", record.stack.len()));
            }
            println!("{}.", line);
            if self.config.print_stack {
                for (i, ip) in record.stack.iter().enumerate() {
                    println!("  stack[{}] = [{:#x}]", i, ip);
                }
            }
        } else {
            let mut line = format!("[{}][{}] result [{:>7}]", record.tid, time_us, op.name());
            if op.has_return() {
                line.push_str(&format!(" ret = [{:#x}]", record.args[0]));
            }
            println!("{}.", line);
        }
    }
}

/// Worker-thread state: name tables, frame cache, debug info and sink.
struct Processor<'a> {
    store: &'a TraceStore,
    symbolizer: Symbolizer,
    sink: Option<CompressedWriter>,
    file_names: HashMap<String, u32>,
    func_names: HashMap<String, u32>,
    frame_cache: HashMap<u64, ResolvedFrame>,
}

impl Processor<'_> {
    fn process(&mut self, record: TraceRecord) -> Result<()> {
        let mut frames = Vec::with_capacity(record.stack.len());
        for &ip in &record.stack {
            if let Some(frame) = self.frame_cache.get(&ip) {
                frames.push(*frame);
                continue;
            }
            match self.symbolizer.resolve(ip) {
                Some(symbol) => {
                    let func_index =
                        self.intern(FUNC_NAME_ENTRY, symbol.function.as_deref())?;
                    let file_index = self.intern(FILE_NAME_ENTRY, symbol.file.as_deref())?;
                    let frame = ResolvedFrame {
                        file_index,
                        func_index,
                        line: symbol.line,
                        column: symbol.column,
                    };
                    self.frame_cache.insert(ip, frame);
                    frames.push(frame);
                }
                // Unknown module: keep the slot so depth is preserved, but
                // do not cache it; the module may appear after a refresh.
                None => frames.push(ResolvedFrame::default()),
            }
        }
        self.write_record(&record, &frames)
    }

    /// Intern a name into the table selected by `entry_tag`, emitting the
    /// framing record on first use.
    fn intern(&mut self, entry_tag: u8, name: Option<&str>) -> Result<u32> {
        let name = name.unwrap_or(NIL_NAME);
        let table = match entry_tag {
            FILE_NAME_ENTRY => &mut self.file_names,
            _ => &mut self.func_names,
        };
        if let Some(&index) = table.get(name) {
            return Ok(index);
        }
        let index = table.len() as u32;
        table.insert(name.to_string(), index);

        let highwater = match entry_tag {
            FILE_NAME_ENTRY => &self.store.filename_max_length,
            _ => &self.store.function_max_length,
        };
        highwater.fetch_max(name.len() as i32, Ordering::AcqRel);

        if let Some(sink) = self.sink.as_mut() {
            let len = name.len().min(u16::MAX as usize) as u16;
            sink.write_all(&[entry_tag])?;
            sink.write_all(&len.to_le_bytes())?;
            sink.write_all(&name.as_bytes()[..len as usize])?;
        }
        if self.store.config.print_save {
            let kind = if entry_tag == FILE_NAME_ENTRY {
                "filename"
            } else {
                "function"
            };
            println!(
                "[{}][{}]: len=[{:2}], name=[{}]",
                kind,
                self.store.now_ns() / 1000,
                name.len(),
                name
            );
        }
        Ok(index)
    }

    fn write_record(&mut self, record: &TraceRecord, frames: &[ResolvedFrame]) -> Result<()> {
        if let Some(sink) = self.sink.as_mut() {
            sink.write_all(&[record.tag])?;
            sink.write_all(&record.tid.to_le_bytes())?;
            sink.write_all(&record.args[0].to_le_bytes())?;
            sink.write_all(&record.args[1].to_le_bytes())?;
            sink.write_all(&record.timestamp_ns.to_le_bytes())?;
            sink.write_all(&(frames.len() as u16).to_le_bytes())?;
            for frame in frames {
                sink.write_all(&frame.file_index.to_le_bytes())?;
                sink.write_all(&frame.func_index.to_le_bytes())?;
                sink.write_all(&frame.line.to_le_bytes())?;
                sink.write_all(&frame.column.to_le_bytes())?;
            }
        }
        if self.store.config.print_save {
            let op = Operation::from_tag(record.tag).unwrap_or(Operation::Unknown);
            println!(
                "[traceinfo][{}]: tag=[{}({} {})] tid=[{}] args=[{:#x}, {:#x}], stacksize=[{}]",
                record.timestamp_ns / 1000,
                record.tag,
                if ops::is_invoke(record.tag) { "invoke" } else { "result" },
                op.name(),
                record.tid,
                record.args[0],
                record.args[1],
                frames.len()
            );
        }
        Ok(())
    }
}
