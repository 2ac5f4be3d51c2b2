//! Cgroup-to-pod identity resolution.
//!
//! eBPF probes key everything by the cgroup id returned from
//! `bpf_get_current_cgroup_id()`, which is the inode number of the cgroup
//! directory. This module periodically scans the host `/proc`, parses each
//! process's cgroup-v2 path, extracts Kubernetes pod/container identity
//! from it, and stats the matching directory under the host cgroup mount
//! to recover that inode. No API-server round trips: everything is derived
//! from the two host filesystems.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{debug, warn};

use crate::probes::shutdown_flag;

/// Resolved identity for one cgroup id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    /// Display label, `pod-<short-uid>`. The real pod name lives in the
    /// API server; the UID-derived label keeps the agent node-local.
    pub pod: String,
    /// Container id as it appears in the cgroup path. Empty when the path
    /// carries only a pod-level cgroup.
    pub container: String,
    pub cgroup_id: u64,
}

/// Thread-safe cgroup_id → PodInfo map with wholesale snapshot refresh.
///
/// Readers take the read lock for a single lookup; `refresh()` builds a
/// complete replacement map and swaps it in, so container deletions are
/// reflected and readers never observe a half-updated state.
pub struct PodResolver {
    cache: RwLock<HashMap<u64, Arc<PodInfo>>>,
    proc_root: PathBuf,
    cgroup_root: PathBuf,
}

impl PodResolver {
    pub fn new(proc_root: impl Into<PathBuf>, cgroup_root: impl Into<PathBuf>) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            proc_root: proc_root.into(),
            cgroup_root: cgroup_root.into(),
        }
    }

    /// Non-blocking lookup against the current snapshot. `None` means
    /// "not resolved yet", not an error; callers label such cgroups
    /// synthetically.
    pub fn resolve(&self, cgroup_id: u64) -> Option<Arc<PodInfo>> {
        self.cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&cgroup_id)
            .cloned()
    }

    /// Copy of all current mappings.
    pub fn snapshot(&self) -> HashMap<u64, Arc<PodInfo>> {
        self.cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Scan the host /proc and replace the snapshot. Returns the number of
    /// mappings in the new snapshot. A failed directory enumeration keeps
    /// the previous snapshot.
    pub fn refresh(&self) -> usize {
        let entries = match fs::read_dir(&self.proc_root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("resolver: cannot read {}: {e}", self.proc_root.display());
                return self.cache.read().unwrap_or_else(|e| e.into_inner()).len();
            }
        };

        let mut fresh: HashMap<u64, Arc<PodInfo>> = HashMap::new();

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            if pid == 0 {
                continue;
            }

            let cgroup_file = self.proc_root.join(name).join("cgroup");
            let Some(cg_path) = read_cgroup_v2_path(&cgroup_file) else {
                continue;
            };
            let cg_path = normalize_cgroup_path(&cg_path);
            if !cg_path.contains("kubepods") {
                continue;
            }
            let Some((pod_uid, container)) = parse_pod_identity(&cg_path) else {
                continue;
            };

            // The join key: inode of the cgroup directory, identical to
            // what bpf_get_current_cgroup_id() reports in the probes.
            let full = self.cgroup_root.join(cg_path.trim_start_matches('/'));
            let Ok(meta) = fs::metadata(&full) else {
                debug!("resolver: no cgroup dir for {cg_path}");
                continue;
            };
            let cgroup_id = meta.ino();

            // Processes sharing a cgroup collapse onto one entry.
            fresh.entry(cgroup_id).or_insert_with(|| {
                Arc::new(PodInfo {
                    pod: format!("pod-{}", shorten_uid(&pod_uid)),
                    container,
                    cgroup_id,
                })
            });
        }

        let count = fresh.len();
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = fresh;
        debug!("resolver: refreshed, {count} cgroup mappings");
        count
    }

    /// Background refresh until shutdown is requested.
    pub fn spawn_refresh_task(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let resolver = Arc::clone(self);
        let shutdown = shutdown_flag();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // the caller already ran the initial scan
            loop {
                ticker.tick().await;
                if shutdown.load(std::sync::atomic::Ordering::Relaxed) {
                    break;
                }
                let resolver = Arc::clone(&resolver);
                // stat + readdir are blocking I/O; keep them off the runtime
                let _ = tokio::task::spawn_blocking(move || resolver.refresh()).await;
            }
        })
    }
}

/// Read `/proc/<pid>/cgroup` and return the cgroup-v2 path (the `0::` line).
fn read_cgroup_v2_path(path: &Path) -> Option<String> {
    let content = fs::read_to_string(path).ok()?;
    for line in content.lines() {
        if let Some(cg) = line.strip_prefix("0::") {
            return Some(cg.to_string());
        }
    }
    None
}

/// Lexically clean a cgroup path and repair the `/kubepods` prefix.
///
/// When the agent reads host /proc from inside its own container, the
/// recorded path can be relative to the agent's cgroup (for example
/// `/../../../burstable/pod<uid>/<cid>`). Cleaning strips the `..` hops;
/// if that lost the `kubepods` segment but a QoS-class segment survived,
/// the canonical prefix is restored in front of it.
fn normalize_cgroup_path(raw: &str) -> String {
    let mut cleaned = clean_path(raw);
    if !cleaned.contains("kubepods") {
        for qos in ["/burstable/", "/besteffort/", "/guaranteed/"] {
            if let Some(idx) = cleaned.find(qos) {
                cleaned = format!("/kubepods{}", &cleaned[idx..]);
                break;
            }
        }
    }
    cleaned
}

/// Lexical path cleaning: collapse `.`, resolve `..` against preceding
/// components, never escape above the root.
fn clean_path(raw: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for comp in raw.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    if out.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", out.join("/"))
    }
}

/// Extract `(pod_uid, container_id)` from a normalized kubepods cgroup
/// path. Both the systemd slice form and the plain cgroupfs form are
/// recognized; the leaf-most match wins. The container id may be empty
/// for pod-level cgroups.
fn parse_pod_identity(cg_path: &str) -> Option<(String, String)> {
    let mut pod_uid: Option<String> = None;
    let mut container = String::new();

    for segment in cg_path.split('/') {
        if let Some(uid) = pod_uid_from_segment(segment) {
            pod_uid = Some(uid);
        }
        if let Some(cid) = container_from_segment(segment) {
            container = cid;
        }
    }

    pod_uid.map(|uid| (uid, container))
}

/// `pod<uid>` either as the whole segment (cgroupfs driver) or behind a
/// `-pod` boundary inside a `.slice` name (systemd driver).
fn pod_uid_from_segment(segment: &str) -> Option<String> {
    let segment = segment.strip_suffix(".slice").unwrap_or(segment);
    let rest = if let Some(rest) = segment.strip_prefix("pod") {
        rest
    } else if let Some(idx) = segment.rfind("-pod") {
        &segment[idx + 4..]
    } else {
        return None;
    };
    if rest.is_empty() {
        None
    } else {
        Some(rest.to_string())
    }
}

fn container_from_segment(segment: &str) -> Option<String> {
    if let Some(inner) = segment
        .strip_prefix("cri-containerd-")
        .and_then(|s| s.strip_suffix(".scope"))
    {
        return Some(inner.to_string());
    }
    if segment.len() == 64 && segment.chars().all(|c| c.is_ascii_hexdigit()) {
        return Some(segment.to_string());
    }
    None
}

/// Display form of a pod UID: systemd underscore escaping undone, then
/// truncated to 12 characters.
fn shorten_uid(uid: &str) -> String {
    let uid = uid.replace('_', "-");
    if uid.len() > 12 {
        uid[..12].to_string()
    } else {
        uid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CID: &str = "a1b2c3d4e5f6a1b2c3d4e5f6a1b2c3d4e5f6a1b2c3d4e5f6a1b2c3d4e5f6a1b2";

    #[test]
    fn systemd_and_cgroupfs_paths_agree() {
        let systemd = format!(
            "/kubepods.slice/kubepods-burstable.slice/kubepods-burstable-pod12345678_9abc.slice/cri-containerd-{CID}.scope"
        );
        let cgroupfs = format!("/kubepods/burstable/pod12345678_9abc/{CID}");

        let a = parse_pod_identity(&systemd).unwrap();
        let b = parse_pod_identity(&cgroupfs).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.0, "12345678_9abc");
        assert_eq!(a.1, CID);
    }

    #[test]
    fn pod_level_cgroup_has_empty_container() {
        let (uid, container) =
            parse_pod_identity("/kubepods/besteffort/podabc123").unwrap();
        assert_eq!(uid, "abc123");
        assert!(container.is_empty());
    }

    #[test]
    fn non_pod_kubepods_segments_are_rejected() {
        assert!(parse_pod_identity("/kubepods.slice").is_none());
        assert!(parse_pod_identity("/kubepods.slice/kubepods-burstable.slice").is_none());
    }

    #[test]
    fn non_kubernetes_paths_are_rejected() {
        assert!(parse_pod_identity("/user.slice/user-1000.slice/session-1.scope").is_none());
        assert!(parse_pod_identity("/system.slice/sshd.service").is_none());
    }

    #[test]
    fn clean_path_resolves_relative_components() {
        assert_eq!(clean_path("/a/b/../c"), "/a/c");
        assert_eq!(clean_path("/../../../burstable/podx/cid"), "/burstable/podx/cid");
        assert_eq!(clean_path("/"), "/");
        assert_eq!(clean_path("/a/./b"), "/a/b");
        assert_eq!(clean_path("/a//b"), "/a/b");
    }

    #[test]
    fn lost_kubepods_prefix_is_repaired() {
        let normalized = normalize_cgroup_path("/../../../burstable/pod42/ctr");
        assert_eq!(normalized, "/kubepods/burstable/pod42/ctr");

        // Already-absolute paths stay untouched.
        let normalized = normalize_cgroup_path("/kubepods/guaranteed/pod42/ctr");
        assert_eq!(normalized, "/kubepods/guaranteed/pod42/ctr");
    }

    #[test]
    fn paths_without_qos_hint_stay_unrepaired() {
        let normalized = normalize_cgroup_path("/../../pod42/ctr");
        assert!(!normalized.contains("kubepods"));
    }

    #[test]
    fn uid_display_form_is_dashed_and_short() {
        assert_eq!(shorten_uid("1234_5678_9abc_def0"), "1234-5678-9a");
        assert_eq!(shorten_uid("short"), "short");
    }

    #[test]
    fn refresh_joins_on_cgroup_inode() {
        let root = tempfile::tempdir().unwrap();
        let proc_root = root.path().join("proc");
        let cg_root = root.path().join("cgroup");

        let cg_rel = format!("kubepods/burstable/pod12345678_9abc/{CID}");
        let cg_dir = cg_root.join(&cg_rel);
        fs::create_dir_all(&cg_dir).unwrap();

        fs::create_dir_all(proc_root.join("4242")).unwrap();
        fs::write(
            proc_root.join("4242").join("cgroup"),
            format!("0::/{cg_rel}\n"),
        )
        .unwrap();
        // Non-numeric and non-kubepods entries must be skipped, not fail.
        fs::create_dir_all(proc_root.join("self")).unwrap();
        fs::create_dir_all(proc_root.join("77")).unwrap();
        fs::write(proc_root.join("77").join("cgroup"), "0::/system.slice/sshd.service\n")
            .unwrap();

        let resolver = PodResolver::new(&proc_root, &cg_root);
        assert_eq!(resolver.refresh(), 1);

        let ino = fs::metadata(&cg_dir).unwrap().ino();
        let info = resolver.resolve(ino).expect("inode should resolve");
        assert_eq!(info.pod, "pod-12345678-9a");
        assert_eq!(info.container, CID);
        assert_eq!(info.cgroup_id, ino);

        assert!(resolver.resolve(ino.wrapping_add(1)).is_none());
    }

    #[test]
    fn refresh_replaces_the_whole_snapshot() {
        let root = tempfile::tempdir().unwrap();
        let proc_root = root.path().join("proc");
        let cg_root = root.path().join("cgroup");

        let cg_rel = "kubepods/besteffort/podaaaa";
        fs::create_dir_all(cg_root.join(cg_rel)).unwrap();
        fs::create_dir_all(proc_root.join("10")).unwrap();
        fs::write(proc_root.join("10").join("cgroup"), format!("0::/{cg_rel}\n")).unwrap();

        let resolver = PodResolver::new(&proc_root, &cg_root);
        assert_eq!(resolver.refresh(), 1);

        // The pod goes away; the next refresh must drop it.
        fs::remove_dir_all(proc_root.join("10")).unwrap();
        assert_eq!(resolver.refresh(), 0);
        assert!(resolver.snapshot().is_empty());
    }
}
