//! Aggregate counters for a trace run and the end-of-run report.
//!
//! Counters are updated from hook context on any supervisor thread, so
//! everything hot is atomic; the child-tid lists only grow on thread
//! birth and sit behind a mutex.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};

use crate::ops::{Operation, ALL_OPS, OP_COUNT};

#[derive(Default)]
struct ChildInfo {
    tids: Vec<i32>,
    relations: Vec<(i32, i32)>,
}

/// Live counters, shared by all supervisors.
pub struct Stats {
    invoke_counts: [AtomicU64; OP_COUNT],
    result_counts: [AtomicU64; OP_COUNT],
    max_stack_size: AtomicI32,
    children: Mutex<ChildInfo>,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            invoke_counts: std::array::from_fn(|_| AtomicU64::new(0)),
            result_counts: std::array::from_fn(|_| AtomicU64::new(0)),
            max_stack_size: AtomicI32::new(-1),
            children: Mutex::new(ChildInfo::default()),
        }
    }

    pub fn count_invoke(&self, op: Operation) {
        self.invoke_counts[op.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_result(&self, op: Operation) {
        self.result_counts[op.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_stack_depth(&self, depth: usize) {
        self.max_stack_size.fetch_max(depth as i32, Ordering::Relaxed);
    }

    pub fn add_child(&self, parent: i32, child: i32) {
        let mut children = self.children.lock().expect("child info lock");
        children.tids.push(child);
        children.relations.push((parent, child));
    }

    pub fn invoke_count(&self, op: Operation) -> u64 {
        self.invoke_counts[op.index()].load(Ordering::Relaxed)
    }

    pub fn result_count(&self, op: Operation) -> u64 {
        self.result_counts[op.index()].load(Ordering::Relaxed)
    }

    pub fn invoke_counts(&self) -> [u64; OP_COUNT] {
        std::array::from_fn(|i| self.invoke_counts[i].load(Ordering::Relaxed))
    }

    pub fn result_counts(&self) -> [u64; OP_COUNT] {
        std::array::from_fn(|i| self.result_counts[i].load(Ordering::Relaxed))
    }

    pub fn max_stack_size(&self) -> i32 {
        self.max_stack_size.load(Ordering::Relaxed)
    }

    pub fn children(&self) -> (Vec<i32>, Vec<(i32, i32)>) {
        let children = self.children.lock().expect("child info lock");
        (children.tids.clone(), children.relations.clone())
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

/// Frozen end-of-run statistics, printed to stdout and saved as
/// `statinfo.txt`.
#[derive(Debug, Clone)]
pub struct StatReport {
    pub extra: Vec<(String, String)>,
    pub argv: Vec<String>,
    pub commands: Vec<String>,
    pub target: String,
    pub target_full_path: String,
    pub working_directory: String,
    pub save_path: String,
    pub max_stack_size: i32,
    pub filename_max_length: i32,
    pub function_max_length: i32,
    pub main_pid: i32,
    pub child_tids: Vec<i32>,
    pub tid_relations: Vec<(i32, i32)>,
    pub timestamp_start: String,
    pub timestamp_end: String,
    pub time_end_ns: i64,
    pub op_invoke_counts: [u64; OP_COUNT],
    pub op_result_counts: [u64; OP_COUNT],
}

const ALIGN: usize = 25;

impl StatReport {
    pub fn invoke_total(&self) -> u64 {
        self.op_invoke_counts.iter().sum()
    }

    pub fn result_total(&self) -> u64 {
        self.op_result_counts.iter().sum()
    }

    pub fn total_count(&self) -> u64 {
        self.invoke_total() + self.result_total()
    }

    pub fn print(&self) {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        if let Err(e) = self.write(&mut out, true) {
            tracing::warn!(error = %e, "printing statistics failed");
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("creating stats file {}", path.display()))?;
        let mut out = BufWriter::new(file);
        self.write(&mut out, false).context("writing stats file")?;
        Ok(())
    }

    fn write<W: Write>(&self, out: &mut W, console: bool) -> io::Result<()> {
        let section = |out: &mut W, title: &str| -> io::Result<()> {
            if console {
                writeln!(out, "{}", title)?;
            }
            Ok(())
        };
        let head = |name: &str| format!("{:<ALIGN$}: ", name);

        section(out, "================ Statistic Information ================")?;

        if !self.extra.is_empty() {
            section(out, "-------- Extra Keys")?;
            writeln!(out, "{}{}", head("num_of_extrakeys"), self.extra.len())?;
            for (key, value) in &self.extra {
                writeln!(out, "{}{}", head(key), value)?;
            }
        }

        section(out, "-------- Basic Information")?;
        writeln!(out, "{}{}", head("argc"), self.argv.len())?;
        writeln!(out, "{}{}", head("argv[]"), self.argv.join(" "))?;
        let own_args = self.argv.len().saturating_sub(self.commands.len());
        writeln!(
            out,
            "{}{}",
            head("mprofiler_args"),
            self.argv[1.min(own_args)..own_args].join(" ")
        )?;
        writeln!(out, "{}{}", head("executed_commands"), self.commands.join(" "))?;
        writeln!(out, "{}{}", head("target"), self.target)?;
        writeln!(out, "{}{}", head("target_full_path"), self.target_full_path)?;
        writeln!(out, "{}{}", head("working_directory"), self.working_directory)?;
        writeln!(out, "{}{}", head("save_path"), self.save_path)?;

        section(out, "-------- Trace Information")?;
        writeln!(out, "{}{}", head("total_traceinfo_count"), self.total_count())?;
        writeln!(out, "{}{}", head("max_stack_size"), self.max_stack_size)?;
        writeln!(out, "{}{}", head("filename_max_length"), self.filename_max_length)?;
        writeln!(out, "{}{}", head("function_max_length"), self.function_max_length)?;

        section(out, "-------- Process Information")?;
        writeln!(out, "{}{}", head("main_pid"), self.main_pid)?;
        writeln!(out, "{}{}", head("child_tid_num"), self.child_tids.len())?;
        if !self.child_tids.is_empty() {
            let tids: Vec<String> = self.child_tids.iter().map(|t| t.to_string()).collect();
            writeln!(out, "{}{}", head("child_tid_list"), tids.join(" "))?;
            let relations: Vec<String> = self
                .tid_relations
                .iter()
                .map(|(parent, child)| format!("{}>{}", parent, child))
                .collect();
            writeln!(out, "{}{}", head("tid_relations"), relations.join(" "))?;
        }

        section(out, "-------- Time Cost")?;
        writeln!(out, "{}{}", head("timestamp_start"), self.timestamp_start)?;
        writeln!(out, "{}{}", head("timestamp_end"), self.timestamp_end)?;
        writeln!(out, "{}{}", head("time_end"), self.time_end_ns)?;

        section(out, "-------- Operation Called")?;
        let width = self.total_count().to_string().len();
        for op in ALL_OPS {
            let invoked = self.op_invoke_counts[op.index()];
            let resulted = self.op_result_counts[op.index()];
            if invoked == 0 && console {
                continue;
            }
            let name = format!("num_of_{}", op.name());
            if console {
                if op.has_return() {
                    writeln!(out, "{}{:width$} / {:width$}", head(&name), invoked, resulted)?;
                } else {
                    writeln!(out, "{}{:width$}", head(&name), invoked)?;
                }
            } else {
                writeln!(out, "{}{} {}", head(&name), invoked, resulted)?;
            }
        }
        if console {
            writeln!(
                out,
                "{}{:width$} / {:width$}",
                head("total_invoke/result"),
                self.invoke_total(),
                self.result_total()
            )?;
        } else {
            writeln!(
                out,
                "{}{} {}",
                head("total_invoke/result"),
                self.invoke_total(),
                self.result_total()
            )?;
        }

        section(out, "================ ===================== ================")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_report() -> StatReport {
        let mut op_invoke_counts = [0u64; OP_COUNT];
        let mut op_result_counts = [0u64; OP_COUNT];
        op_invoke_counts[Operation::Malloc.index()] = 3;
        op_result_counts[Operation::Malloc.index()] = 3;
        op_invoke_counts[Operation::Free.index()] = 3;
        StatReport {
            extra: vec![("run".to_string(), "ci".to_string())],
            argv: vec!["mprofiler".to_string(), "./target".to_string()],
            commands: vec!["./target".to_string()],
            target: "target".to_string(),
            target_full_path: "/tmp/target".to_string(),
            working_directory: "/tmp".to_string(),
            save_path: "tracedata/target/now".to_string(),
            max_stack_size: 12,
            filename_max_length: 20,
            function_max_length: 30,
            main_pid: 4321,
            child_tids: vec![4322, 4323],
            tid_relations: vec![(4321, 4322), (4321, 4323)],
            timestamp_start: "20260802-120000-000000001".to_string(),
            timestamp_end: "20260802-120001-000000002".to_string(),
            time_end_ns: 1_000_000_001,
            op_invoke_counts,
            op_result_counts,
        }
    }

    #[test]
    fn test_stats_counting() {
        let stats = Stats::new();
        stats.count_invoke(Operation::Malloc);
        stats.count_invoke(Operation::Malloc);
        stats.count_result(Operation::Malloc);
        assert_eq!(stats.invoke_count(Operation::Malloc), 2);
        assert_eq!(stats.result_count(Operation::Malloc), 1);
        assert_eq!(stats.invoke_count(Operation::Free), 0);
    }

    #[test]
    fn test_stack_depth_highwater() {
        let stats = Stats::new();
        assert_eq!(stats.max_stack_size(), -1);
        stats.note_stack_depth(3);
        stats.note_stack_depth(1);
        assert_eq!(stats.max_stack_size(), 3);
    }

    #[test]
    fn test_child_bookkeeping() {
        let stats = Stats::new();
        stats.add_child(10, 11);
        stats.add_child(10, 12);
        let (tids, relations) = stats.children();
        assert_eq!(tids, vec![11, 12]);
        assert_eq!(relations, vec![(10, 11), (10, 12)]);
    }

    #[test]
    fn test_report_totals_match_per_op_sums() {
        let report = sample_report();
        assert_eq!(report.invoke_total(), 6);
        assert_eq!(report.result_total(), 3);
        assert_eq!(report.total_count(), 9);
    }

    #[test]
    fn test_report_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("statinfo.txt");
        let report = sample_report();
        report.save(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("main_pid"));
        assert!(text.contains("4321"));
        assert!(text.contains("num_of_malloc"));
        assert!(text.contains("child_tid_list"));
        assert!(text.contains("4322 4323"));
        assert!(text.contains("tid_relations"));
        assert!(text.contains("4321>4322"));
        // File output carries every operation, counted or not.
        assert!(text.contains("num_of_valloc"));
        // Section banners are console-only decoration.
        assert!(!text.contains("================"));
    }

    #[test]
    fn test_extra_keys_in_report() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("statinfo.txt");
        sample_report().save(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("num_of_extrakeys"));
        assert!(text.contains("run"));
    }
}
