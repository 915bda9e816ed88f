//! Command-line parsing for mprofiler.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "mprofiler")]
#[command(version)]
#[command(about = "Out-of-process memory allocation tracer", long_about = None)]
#[command(after_help = "Examples:
  mprofiler -p 12345          Attach to the process with pid 12345.
  mprofiler ./app args...     Run ./app under the tracer.")]
pub struct Cli {
    /// Attach to a running process by PID (mutually exclusive with a command)
    #[arg(short = 'p', long = "pid", value_name = "PID", conflicts_with = "command")]
    pub pid: Option<i32>,

    /// Collect nothing (dry run); operation counters still accumulate
    #[arg(long = "no-trace")]
    pub no_trace: bool,

    /// Do not unwind call stacks; events carry depth 0
    #[arg(long = "no-stack")]
    pub no_stack: bool,

    /// Cap unwind depth; a negative value disables unwinding
    #[arg(long = "stack", value_name = "DEPTH", allow_hyphen_values = true)]
    pub stack: Option<i32>,

    /// Do not write the binary trace stream
    #[arg(long = "no-save")]
    pub no_save: bool,

    /// Root output directory
    #[arg(long = "save-dir", value_name = "PATH", default_value = "tracedata")]
    pub save_dir: PathBuf,

    /// Subdirectory under the save dir. Presets: "/name/time" "/name-time"
    /// "/time-name" "/name"; empty expands to name/time
    #[arg(long = "category", value_name = "CATEGORY", default_value = "")]
    pub category: String,

    /// Print every invoke/result event (default on)
    #[arg(long = "print-log", overrides_with = "no_print_log")]
    print_log: bool,
    #[arg(long = "no-print-log", overrides_with = "print_log")]
    no_print_log: bool,

    /// Print captured call stacks with each event
    #[arg(long = "print-stack", overrides_with = "no_print_stack")]
    print_stack: bool,
    #[arg(long = "no-print-stack", overrides_with = "print_stack")]
    no_print_stack: bool,

    /// Print every entry written to the binary stream
    #[arg(long = "print-save", overrides_with = "no_print_save")]
    print_save: bool,
    #[arg(long = "no-print-save", overrides_with = "print_save")]
    no_print_save: bool,

    /// Print the statistics summary on exit (default on)
    #[arg(long = "print-stat", overrides_with = "no_print_stat")]
    print_stat: bool,
    #[arg(long = "no-print-stat", overrides_with = "print_stat")]
    no_print_stat: bool,

    /// Extra key/value pairs recorded in the stats file
    #[arg(long = "extra", value_name = "K1=V1,K2=V2")]
    pub extra: Option<String>,

    /// Target command and its arguments
    #[arg(value_name = "COMMAND", trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl Cli {
    pub fn print_log(&self) -> bool {
        !self.no_print_log
    }

    pub fn print_stack(&self) -> bool {
        self.print_stack
    }

    pub fn print_save(&self) -> bool {
        self.print_save
    }

    pub fn print_stat(&self) -> bool {
        !self.no_print_stat
    }
}
