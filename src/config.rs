//! Resolved invocation: trace toggles, output locations and run metadata.
//!
//! `Config` is built from the parsed command line once, then `init`
//! resolves the output category (including its presets) against the
//! startup timestamp and creates the output directory.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

use crate::cli::Cli;

pub const SAVE_BINARY_FILENAME: &str = "memory.profile";
pub const STAT_INFO_FILENAME: &str = "statinfo.txt";

const DEFAULT_STACK_DEPTH: i32 = 100;

#[derive(Debug, Clone)]
pub struct Config {
    /// Attach target; `None` means a command is spawned.
    pub pid: Option<i32>,
    /// Target command and its arguments (spawn mode).
    pub command: Vec<String>,
    /// Capture events at all (`--no-trace` clears it).
    pub trace: bool,
    /// Unwind depth cap; zero or negative disables unwinding.
    pub stack_depth: i32,
    /// Write the binary stream (`--no-save` clears it).
    pub save: bool,
    pub print_log: bool,
    pub print_stack: bool,
    pub print_save: bool,
    pub print_stat: bool,
    pub save_dir: PathBuf,
    pub category: String,
    pub extra: Vec<(String, String)>,
    /// Basename of the target executable, used by category presets.
    pub target_name: String,
    pub start_timestamp: String,
    pub save_binary_path: PathBuf,
    pub stat_info_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pid: None,
            command: Vec::new(),
            trace: true,
            stack_depth: DEFAULT_STACK_DEPTH,
            save: true,
            print_log: true,
            print_stack: false,
            print_save: false,
            print_stat: true,
            save_dir: PathBuf::from("tracedata"),
            category: String::new(),
            extra: Vec::new(),
            target_name: String::new(),
            start_timestamp: String::new(),
            save_binary_path: PathBuf::from("tracedata").join(SAVE_BINARY_FILENAME),
            stat_info_path: PathBuf::from("tracedata").join(STAT_INFO_FILENAME),
        }
    }
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let stack_depth = if cli.no_stack {
            0
        } else {
            cli.stack.unwrap_or(DEFAULT_STACK_DEPTH)
        };
        let target_name = cli
            .command
            .first()
            .map(|target| {
                Path::new(target)
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| target.clone())
            })
            .unwrap_or_default();

        Ok(Self {
            pid: cli.pid,
            command: cli.command.clone(),
            trace: !cli.no_trace,
            stack_depth,
            save: !cli.no_save,
            print_log: cli.print_log(),
            print_stack: cli.print_stack(),
            print_save: cli.print_save(),
            print_stat: cli.print_stat(),
            save_dir: cli.save_dir.clone(),
            category: cli.category.clone(),
            extra: parse_extra(cli.extra.as_deref())?,
            target_name,
            ..Self::default()
        })
    }

    /// Fix the startup timestamp, expand the category preset and create
    /// the output directory the run will write into.
    pub fn init(&mut self) -> Result<()> {
        self.start_timestamp = timestamp_now();
        self.category = self.resolve_category();

        let parent = self.parent_dir();
        std::fs::create_dir_all(&parent)?;
        self.save_binary_path = parent.join(SAVE_BINARY_FILENAME);
        self.stat_info_path = parent.join(STAT_INFO_FILENAME);
        Ok(())
    }

    pub fn parent_dir(&self) -> PathBuf {
        self.save_dir.join(&self.category)
    }

    fn resolve_category(&self) -> String {
        let name = &self.target_name;
        let time = &self.start_timestamp;
        match self.category.as_str() {
            "/name/time" => format!("{}/{}", name, time),
            "/name-time" => format!("{}-{}", name, time),
            "/time-name" => format!("{}-{}", time, name),
            "/name" => name.clone(),
            "" => format!("{}/{}", name, time),
            other => other.to_string(),
        }
    }
}

/// Parse `--extra k1=v1,k2=v2,...` into key/value pairs.
fn parse_extra(arg: Option<&str>) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    let Some(arg) = arg else {
        return Ok(pairs);
    };
    for piece in arg.split(',') {
        match piece.split_once('=') {
            Some((key, value)) if !key.is_empty() && !value.is_empty() => {
                pairs.push((key.to_string(), value.to_string()));
            }
            _ => bail!("invalid extra key-value pair: {piece:?}"),
        }
    }
    Ok(pairs)
}

/// Local wall-clock timestamp `YYYYmmdd-HHMMSS-<nanos>`, used both for
/// output directories and the statistics file.
pub fn timestamp_now() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = now.as_secs() as libc::time_t;
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    // Safety: secs and tm are valid for the duration of the call.
    unsafe { libc::localtime_r(&secs, &mut tm) };
    format!(
        "{:04}{:02}{:02}-{:02}{:02}{:02}-{:09}",
        tm.tm_year + 1900,
        tm.tm_mon + 1,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec,
        now.subsec_nanos()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(category: &str) -> Config {
        Config {
            target_name: "demo".to_string(),
            start_timestamp: "20260802-101500-000000042".to_string(),
            category: category.to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn test_category_presets() {
        assert_eq!(
            config_with("/name/time").resolve_category(),
            "demo/20260802-101500-000000042"
        );
        assert_eq!(
            config_with("/name-time").resolve_category(),
            "demo-20260802-101500-000000042"
        );
        assert_eq!(
            config_with("/time-name").resolve_category(),
            "20260802-101500-000000042-demo"
        );
        assert_eq!(config_with("/name").resolve_category(), "demo");
    }

    #[test]
    fn test_empty_category_defaults_to_name_time() {
        assert_eq!(
            config_with("").resolve_category(),
            "demo/20260802-101500-000000042"
        );
    }

    #[test]
    fn test_literal_category_passes_through() {
        assert_eq!(config_with("nightly/run1").resolve_category(), "nightly/run1");
    }

    #[test]
    fn test_parse_extra_pairs() {
        let pairs = parse_extra(Some("build=release,host=ci-01")).unwrap();
        assert_eq!(
            pairs,
            vec![
                ("build".to_string(), "release".to_string()),
                ("host".to_string(), "ci-01".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_extra_rejects_bad_pairs() {
        assert!(parse_extra(Some("novalue")).is_err());
        assert!(parse_extra(Some("=v")).is_err());
        assert!(parse_extra(Some("k=")).is_err());
        assert!(parse_extra(Some("a=b,,c=d")).is_err());
    }

    #[test]
    fn test_parse_extra_none() {
        assert!(parse_extra(None).unwrap().is_empty());
    }

    #[test]
    fn test_timestamp_shape() {
        let stamp = timestamp_now();
        // YYYYmmdd-HHMMSS-nnnnnnnnn
        assert_eq!(stamp.len(), 8 + 1 + 6 + 1 + 9);
        assert_eq!(stamp.as_bytes()[8], b'-');
        assert_eq!(stamp.as_bytes()[15], b'-');
    }

    #[test]
    fn test_init_creates_output_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config {
            save_dir: dir.path().join("out"),
            target_name: "demo".to_string(),
            ..Config::default()
        };
        config.init().unwrap();
        assert!(config.parent_dir().is_dir());
        assert!(config.save_binary_path.ends_with(SAVE_BINARY_FILENAME));
        assert!(config.stat_info_path.ends_with(STAT_INFO_FILENAME));
    }
}
