//! Size-rotated TSV output for enriched trace events.
//!
//! One active `traces.tsv` plus numbered predecessors `.1..N`, `.1` being
//! the most recent. Rotation steps are best-effort: a failed rename or
//! remove is logged and the next append retries file creation, so a bad
//! disk moment never wedges the pipeline.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use log::warn;

use super::TraceEvent;

const BASE_NAME: &str = "traces.tsv";
pub const TSV_HEADER: &str = "timestamp\tpod\tcontainer\tcgroup_id\toperation\tpath\tfstype\n";

struct ActiveFile {
    buf: BufWriter<File>,
    size: u64,
}

pub struct TsvWriter {
    dir: PathBuf,
    max_size: u64,
    max_files: usize,
    // Lock covers buffer write, size accounting, and the rotation
    // decision; None after a failed open, retried on the next append.
    active: Mutex<Option<ActiveFile>>,
}

impl TsvWriter {
    /// Create the output directory and open (or continue) the active file.
    pub fn new(dir: impl Into<PathBuf>, max_size: u64, max_files: usize) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create trace dir {}", dir.display()))?;

        let writer = Self {
            dir,
            max_size,
            max_files,
            active: Mutex::new(None),
        };
        let active = writer.open_active()?;
        *writer.active.lock().unwrap_or_else(|e| e.into_inner()) = Some(active);
        Ok(writer)
    }

    fn active_path(&self) -> PathBuf {
        self.dir.join(BASE_NAME)
    }

    fn rotated_path(&self, n: usize) -> PathBuf {
        self.dir.join(format!("{BASE_NAME}.{n}"))
    }

    /// Open the active file in append mode, writing the header when it is
    /// empty (fresh file or just rotated).
    fn open_active(&self) -> Result<ActiveFile> {
        let path = self.active_path();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open trace file {}", path.display()))?;
        let mut size = file.metadata().context("stat trace file")?.len();

        let mut buf = BufWriter::with_capacity(64 * 1024, file);
        if size == 0 {
            buf.write_all(TSV_HEADER.as_bytes()).context("write header")?;
            size += TSV_HEADER.len() as u64;
        }

        Ok(ActiveFile { buf, size })
    }

    /// Append one event as a tab-separated line, rotating when the
    /// accumulated size crosses the threshold.
    pub fn write_event(&self, event: &TraceEvent) -> Result<()> {
        let line = format_line(event);

        let mut guard = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(self.open_active()?);
        }
        let active = guard.as_mut().expect("active file was just opened");

        active.buf.write_all(line.as_bytes()).context("write trace line")?;
        active.size += line.len() as u64;

        if active.size >= self.max_size {
            if let Err(e) = self.rotate(&mut guard) {
                warn!("trace writer: rotation error: {e:#}");
            }
        }
        Ok(())
    }

    /// Flush, close, shift `.i` → `.i+1`, move the active file to `.1`,
    /// reopen fresh.
    fn rotate(&self, guard: &mut Option<ActiveFile>) -> Result<()> {
        if let Some(mut active) = guard.take() {
            active.buf.flush().context("flush before rotate")?;
        }

        let _ = std::fs::remove_file(self.rotated_path(self.max_files));
        for i in (1..self.max_files).rev() {
            let _ = std::fs::rename(self.rotated_path(i), self.rotated_path(i + 1));
        }
        if self.max_files > 0 {
            let _ = std::fs::rename(self.active_path(), self.rotated_path(1));
        } else {
            let _ = std::fs::remove_file(self.active_path());
        }

        *guard = Some(self.open_active()?);
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        let mut guard = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(active) = guard.as_mut() {
            active.buf.flush().context("flush trace buffer")?;
        }
        Ok(())
    }

    /// Final flush and close. Subsequent writes would reopen the file, but
    /// the engine only calls this after the consumer has stopped.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mut active) = guard.take() {
            active.buf.flush().context("flush on close")?;
        }
        Ok(())
    }
}

fn format_line(event: &TraceEvent) -> String {
    format!(
        "{}\t{}\t{}\t{}\t{}\t{}\t{}\n",
        event.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
        event.pod,
        event.container,
        event.cgroup_id,
        event.operation,
        event.path,
        event.fstype,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::Path;

    fn event(path: &str) -> TraceEvent {
        TraceEvent {
            timestamp: Utc::now(),
            pod: "pod-12345678-9a".to_string(),
            container: "abc123".to_string(),
            cgroup_id: 42,
            operation: "alloc",
            path: path.to_string(),
            fstype: "ext4".to_string(),
        }
    }

    fn list_dir(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn lines_have_seven_fields_and_rfc3339_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TsvWriter::new(dir.path(), 1024 * 1024, 3).unwrap();
        writer.write_event(&event("/var/lib/mysql/foo.ibd")).unwrap();
        writer.close().unwrap();

        let content = std::fs::read_to_string(dir.path().join("traces.tsv")).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next().unwrap(), TSV_HEADER.trim_end());

        let record = lines.next().unwrap();
        let fields: Vec<&str> = record.split('\t').collect();
        assert_eq!(fields.len(), 7);
        assert!(chrono::DateTime::parse_from_rfc3339(fields[0]).is_ok());
        assert_eq!(fields[4], "alloc");
        assert_eq!(fields[5], "/var/lib/mysql/foo.ibd");
        assert!(content.ends_with('\n'));
    }

    #[test]
    fn header_written_once_per_file() {
        let dir = tempfile::tempdir().unwrap();
        {
            let writer = TsvWriter::new(dir.path(), 1024 * 1024, 3).unwrap();
            writer.write_event(&event("/a")).unwrap();
            writer.close().unwrap();
        }
        // Reopening an existing non-empty file must not repeat the header.
        {
            let writer = TsvWriter::new(dir.path(), 1024 * 1024, 3).unwrap();
            writer.write_event(&event("/b")).unwrap();
            writer.close().unwrap();
        }

        let content = std::fs::read_to_string(dir.path().join("traces.tsv")).unwrap();
        assert_eq!(content.matches("timestamp\tpod").count(), 1);
        assert_eq!(content.lines().count(), 3);
    }

    #[test]
    fn rotation_keeps_contiguous_predecessors() {
        let dir = tempfile::tempdir().unwrap();
        // Tiny threshold: every event triggers a rotation.
        let writer = TsvWriter::new(dir.path(), 1, 2).unwrap();
        for i in 0..5 {
            writer.write_event(&event(&format!("/f{i}"))).unwrap();
        }
        writer.close().unwrap();

        assert_eq!(
            list_dir(dir.path()),
            vec!["traces.tsv", "traces.tsv.1", "traces.tsv.2"]
        );
    }

    #[test]
    fn rotation_under_capacity_keeps_fewer_files() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TsvWriter::new(dir.path(), 1, 3).unwrap();
        writer.write_event(&event("/only")).unwrap();
        writer.close().unwrap();

        // One fill produces exactly one predecessor, no gaps.
        assert_eq!(list_dir(dir.path()), vec!["traces.tsv", "traces.tsv.1"]);
    }

    #[test]
    fn newest_rotation_is_dot_one() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TsvWriter::new(dir.path(), 1, 2).unwrap();
        writer.write_event(&event("/first")).unwrap();
        writer.write_event(&event("/second")).unwrap();
        writer.close().unwrap();

        let newest = std::fs::read_to_string(dir.path().join("traces.tsv.1")).unwrap();
        let oldest = std::fs::read_to_string(dir.path().join("traces.tsv.2")).unwrap();
        assert!(newest.contains("/second"));
        assert!(oldest.contains("/first"));
    }

    #[test]
    fn zero_max_files_keeps_no_predecessors() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TsvWriter::new(dir.path(), 1, 0).unwrap();
        writer.write_event(&event("/a")).unwrap();
        writer.write_event(&event("/b")).unwrap();
        writer.close().unwrap();

        assert_eq!(list_dir(dir.path()), vec!["traces.tsv"]);
    }

    #[test]
    fn fresh_active_file_holds_only_the_header() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TsvWriter::new(dir.path(), 1, 2).unwrap();
        writer.write_event(&event("/x")).unwrap();
        writer.close().unwrap();

        let active = std::fs::read_to_string(dir.path().join("traces.tsv")).unwrap();
        assert_eq!(active, TSV_HEADER);
    }
}
