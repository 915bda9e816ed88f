//! mprofiler - out-of-process memory allocation tracer for Linux x86-64.
//!
//! Attaches to (or launches) a target process, plants software
//! breakpoints on allocator entry points in every loaded object, pairs
//! each entry with its return, unwinds and symbolises remote call stacks
//! and streams compressed binary records to disk for offline analysis.

pub mod cli;
pub mod compress;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod hooks;
pub mod ops;
pub mod stack_unwind;
pub mod stats;
pub mod symbolize;
pub mod target_info;
pub mod trace_store;
