use std::path::Path;

use clap::error::ErrorKind;
use clap::Parser;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use mprofiler::cli::Cli;
use mprofiler::config::Config;
use mprofiler::engine::Engine;

fn main() {
    // Bad arguments exit -1, help and version exit 0; clap's default
    // exit code of 2 fits neither.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            print!("{}", e);
            std::process::exit(0);
        }
        Err(e) => {
            eprint!("{}", e);
            std::process::exit(-1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    std::process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    // Preflight: anything wrong here fails before any tracing starts.
    if cli.pid.is_none() && cli.command.is_empty() {
        eprintln!("mprofiler: specify a target command or -p PID (see --help)");
        return -1;
    }
    if let Some(pid) = cli.pid {
        if pid <= 0 {
            eprintln!("mprofiler: pid out of range: {}", pid);
            return -1;
        }
    }
    if let Some(target) = cli.command.first() {
        if !Path::new(target).exists() {
            eprintln!("mprofiler: target program not found: {}", target);
            return 1;
        }
    }

    let mut config = match Config::from_cli(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("mprofiler: {}", e);
            return -1;
        }
    };
    if let Err(e) = config.init() {
        eprintln!("mprofiler: cannot prepare output directory: {}", e);
        return -1;
    }
    let print_stat = config.print_stat;
    let stat_info_path = config.stat_info_path.clone();

    let engine = Engine::new(config);
    if let Err(e) = engine.run() {
        error!(error = %e, "tracing failed");
        return -1;
    }

    let report = engine.build_report();
    if print_stat {
        report.print();
    }
    if let Err(e) = report.save(&stat_info_path) {
        warn!(error = %e, "saving statistics failed");
    }
    0
}
