//! Agent configuration: a flat flag surface with environment-variable
//! aliases so the same binary configures cleanly from a shell, a systemd
//! unit, or a DaemonSet env block.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "dentrymon", about = "Per-node dentry cache observability agent")]
pub struct Settings {
    /// HTTP listen address for the metrics endpoint
    #[arg(long, env = "DENTRYMON_LISTEN", default_value = "0.0.0.0:9090")]
    pub listen: String,

    /// Path to the host /proc mount
    #[arg(long = "proc", env = "DENTRYMON_PROC", default_value = "/proc")]
    pub proc_root: PathBuf,

    /// Path to the host cgroup filesystem
    #[arg(long = "cgroup", env = "DENTRYMON_CGROUP", default_value = "/sys/fs/cgroup")]
    pub cgroup_root: PathBuf,

    /// BPF counter map poll interval in seconds
    #[arg(long = "poll-interval", env = "DENTRYMON_POLL_INTERVAL", default_value_t = 5)]
    pub poll_interval_secs: u64,

    /// Cgroup-to-pod resolver refresh interval in seconds
    #[arg(long = "resolve-interval", env = "DENTRYMON_RESOLVE_INTERVAL", default_value_t = 30)]
    pub resolve_interval_secs: u64,

    /// Enable dentry path tracing at startup
    #[arg(long = "trace-enabled", env = "DENTRYMON_TRACE_ENABLED")]
    pub trace_enabled: bool,

    /// Directory for rotated trace TSV output
    #[arg(long = "trace-dir", env = "DENTRYMON_TRACE_DIR", default_value = "/data/traces")]
    pub trace_dir: PathBuf,

    /// Max trace file size in MB before rotation
    #[arg(long = "trace-max-size", env = "DENTRYMON_TRACE_MAX_SIZE", default_value_t = 100)]
    pub trace_max_size_mb: u64,

    /// Number of rotated trace files to keep
    #[arg(long = "trace-max-files", env = "DENTRYMON_TRACE_MAX_FILES", default_value_t = 3)]
    pub trace_max_files: usize,

    /// Comma-separated path substring filters (empty matches everything)
    #[arg(long = "trace-patterns", env = "DENTRYMON_TRACE_PATTERNS", default_value = "")]
    pub trace_patterns: String,
}

impl Settings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn resolve_interval(&self) -> Duration {
        Duration::from_secs(self.resolve_interval_secs)
    }

    pub fn trace_max_size_bytes(&self) -> u64 {
        self.trace_max_size_mb * 1024 * 1024
    }

    /// Split the comma-separated pattern list, dropping empty entries so
    /// `--trace-patterns ""` means "match everything".
    pub fn patterns(&self) -> Vec<String> {
        self.trace_patterns
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Settings {
        Settings::try_parse_from(std::iter::once("dentrymon").chain(args.iter().copied()))
            .expect("settings should parse")
    }

    #[test]
    #[serial_test::serial]
    fn defaults_match_flag_table() {
        let s = parse(&[]);
        assert_eq!(s.listen, "0.0.0.0:9090");
        assert_eq!(s.proc_root, PathBuf::from("/proc"));
        assert_eq!(s.cgroup_root, PathBuf::from("/sys/fs/cgroup"));
        assert_eq!(s.poll_interval(), Duration::from_secs(5));
        assert_eq!(s.resolve_interval(), Duration::from_secs(30));
        assert!(!s.trace_enabled);
        assert_eq!(s.trace_dir, PathBuf::from("/data/traces"));
        assert_eq!(s.trace_max_size_bytes(), 100 * 1024 * 1024);
        assert_eq!(s.trace_max_files, 3);
        assert!(s.patterns().is_empty());
    }

    #[test]
    fn patterns_split_on_commas() {
        let s = parse(&["--trace-patterns", ".ibd,#sql, .frm"]);
        assert_eq!(s.patterns(), vec![".ibd", "#sql", ".frm"]);
    }

    #[test]
    fn empty_pattern_entries_are_dropped() {
        let s = parse(&["--trace-patterns", ",,.log,"]);
        assert_eq!(s.patterns(), vec![".log"]);
    }

    #[test]
    fn flags_override_defaults() {
        let s = parse(&[
            "--listen",
            "127.0.0.1:9999",
            "--trace-enabled",
            "--trace-max-size",
            "1",
            "--trace-max-files",
            "2",
        ]);
        assert_eq!(s.listen, "127.0.0.1:9999");
        assert!(s.trace_enabled);
        assert_eq!(s.trace_max_size_bytes(), 1024 * 1024);
        assert_eq!(s.trace_max_files, 2);
    }

    #[test]
    #[serial_test::serial]
    fn env_aliases_apply() {
        unsafe {
            std::env::set_var("DENTRYMON_POLL_INTERVAL", "7");
        }
        let s = parse(&[]);
        assert_eq!(s.poll_interval(), Duration::from_secs(7));
        unsafe {
            std::env::remove_var("DENTRYMON_POLL_INTERVAL");
        }
    }
}
