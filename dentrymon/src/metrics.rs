//! Metrics collection and the pull-model HTTP surface.
//!
//! A background task polls the kernel stats map into an in-process
//! snapshot; scrapes render that snapshot plus the node-wide counters and
//! `/proc/sys/fs/dentry-state` gauges as Prometheus text exposition.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{extract::State, http::header, response::IntoResponse, routing::get, Router};
use aya::maps::{Array, HashMap as BpfHashMap, Map, MapData};
use dentrymon_common::DentryStats;
use log::{info, warn};

use crate::probes::shutdown_flag;
use crate::resolver::PodResolver;

pub struct Collector {
    stats_map: BpfHashMap<MapData, u64, DentryStats>,
    reclaim_map: Array<MapData, u64>,
    drops_map: Array<MapData, u64>,
    resolver: Arc<PodResolver>,
    proc_root: PathBuf,
    snapshot: Mutex<HashMap<u64, DentryStats>>,
}

impl Collector {
    pub fn new(
        stats_map: Map,
        reclaim_map: Map,
        drops_map: Map,
        resolver: Arc<PodResolver>,
        proc_root: impl Into<PathBuf>,
    ) -> Result<Self> {
        Ok(Self {
            stats_map: BpfHashMap::try_from(stats_map)
                .context("DENTRY_STATS is not a HashMap")?,
            reclaim_map: Array::try_from(reclaim_map)
                .context("RECLAIM_COUNT is not an Array")?,
            drops_map: Array::try_from(drops_map).context("TRACE_DROPS is not an Array")?,
            resolver,
            proc_root: proc_root.into(),
            snapshot: Mutex::new(HashMap::new()),
        })
    }

    /// Iterate the kernel map into a fresh snapshot. Entries evicted by
    /// the kernel between polls simply disappear; iteration errors keep
    /// the previous snapshot for the affected pass.
    pub fn poll(&self) {
        let mut fresh = HashMap::new();
        for entry in self.stats_map.iter() {
            match entry {
                Ok((cgid, stats)) => {
                    fresh.insert(cgid, stats);
                }
                Err(e) => {
                    warn!("collector: stats map iteration error: {e}");
                    return;
                }
            }
        }
        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = fresh;
    }

    /// Background poll loop until shutdown.
    pub fn spawn_poll_task(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let collector = Arc::clone(self);
        let shutdown = shutdown_flag();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // initial poll already ran at startup
            loop {
                ticker.tick().await;
                if shutdown.load(std::sync::atomic::Ordering::Relaxed) {
                    break;
                }
                let collector = Arc::clone(&collector);
                let _ = tokio::task::spawn_blocking(move || collector.poll()).await;
            }
        })
    }

    /// Render the full exposition.
    pub fn render(&self) -> String {
        let mut entries: Vec<(u64, DentryStats)> = {
            let snapshot = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
            snapshot.iter().map(|(k, v)| (*k, *v)).collect()
        };
        entries.sort_by_key(|(cgid, _)| *cgid);

        let labeled: Vec<(String, String, DentryStats)> = entries
            .into_iter()
            .map(|(cgid, stats)| {
                let (pod, container) = match self.resolver.resolve(cgid) {
                    Some(info) => (info.pod.clone(), info.container.clone()),
                    // Unresolved activity still gets a synthetic label so
                    // it is never silently dropped from the exposition.
                    None => (format!("cgroup-{cgid}"), String::new()),
                };
                (pod, container, stats)
            })
            .collect();

        let mut out = String::new();
        render_counter_series(
            &mut out,
            "dentry_alloc_total",
            "Total dentry allocations per container",
            &labeled,
            |s| s.alloc,
        );
        render_counter_series(
            &mut out,
            "dentry_positive_total",
            "Total positive dentry instantiations per container",
            &labeled,
            |s| s.positive,
        );
        render_counter_series(
            &mut out,
            "dentry_negative_total",
            "Total negative dentry instantiations per container",
            &labeled,
            |s| s.negative,
        );

        if let Ok(reclaim) = self.reclaim_map.get(&0, 0) {
            let _ = writeln!(
                out,
                "# HELP dentry_reclaim_total Total dentry reclaim events (shrink_dcache_sb calls)\n\
                 # TYPE dentry_reclaim_total counter\n\
                 dentry_reclaim_total {reclaim}"
            );
        }

        if let Ok(drops) = self.drops_map.get(&0, 0) {
            let _ = writeln!(
                out,
                "# HELP dentry_trace_dropped_total Trace events lost to failed ring buffer reservations\n\
                 # TYPE dentry_trace_dropped_total counter\n\
                 dentry_trace_dropped_total {drops}"
            );
        }

        if let Some((total, unused, negative)) = read_dentry_state(&self.proc_root) {
            let _ = writeln!(
                out,
                "# HELP dentry_count Node-level dentry counts from /proc/sys/fs/dentry-state\n\
                 # TYPE dentry_count gauge\n\
                 dentry_count{{type=\"total\"}} {total}\n\
                 dentry_count{{type=\"unused\"}} {unused}\n\
                 dentry_count{{type=\"negative\"}} {negative}"
            );
        }

        out
    }
}

fn render_counter_series(
    out: &mut String,
    name: &str,
    help: &str,
    entries: &[(String, String, DentryStats)],
    value: impl Fn(&DentryStats) -> u64,
) {
    let _ = writeln!(out, "# HELP {name} {help}\n# TYPE {name} counter");
    for (pod, container, stats) in entries {
        let _ = writeln!(
            out,
            "{name}{{pod=\"{pod}\",container=\"{container}\"}} {}",
            value(stats)
        );
    }
}

/// Parse `/proc/sys/fs/dentry-state`.
/// Fields: nr_dentry nr_unused age_limit want_pages nr_negative dummy.
fn read_dentry_state(proc_root: &Path) -> Option<(i64, i64, i64)> {
    let content = fs::read_to_string(proc_root.join("sys/fs/dentry-state")).ok()?;
    parse_dentry_state(&content)
}

fn parse_dentry_state(content: &str) -> Option<(i64, i64, i64)> {
    let fields: Vec<&str> = content.split_whitespace().collect();
    if fields.len() < 5 {
        return None;
    }
    let total = fields[0].parse().ok()?;
    let unused = fields[1].parse().ok()?;
    let negative = fields[4].parse().ok()?;
    Some((total, unused, negative))
}

/// `GET /metrics` + `GET /healthz`. Other methods get 405 from the router.
pub fn router(collector: Arc<Collector>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { "ok\n" }))
        .with_state(collector)
}

async fn metrics_handler(State(collector): State<Arc<Collector>>) -> impl IntoResponse {
    let body = tokio::task::spawn_blocking(move || collector.render())
        .await
        .unwrap_or_default();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

/// Serve an app (this router plus whatever else is merged onto it) until
/// the shutdown channel flips.
pub async fn serve(
    listener: tokio::net::TcpListener,
    app: Router,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    info!("HTTP server listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.wait_for(|stop| *stop).await;
        })
        .await
        .context("HTTP server error")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dentry_state_parses_standard_line() {
        let parsed = parse_dentry_state("187520\t170830\t45\t0\t12054\t0\n").unwrap();
        assert_eq!(parsed, (187520, 170830, 12054));
    }

    #[test]
    fn dentry_state_tolerates_garbage() {
        assert!(parse_dentry_state("").is_none());
        assert!(parse_dentry_state("1 2 3").is_none());
        assert!(parse_dentry_state("a b c d e f").is_none());
    }

    #[test]
    fn counter_series_renders_labels_and_values() {
        let entries = vec![
            (
                "pod-12345678-9a".to_string(),
                "abc".to_string(),
                DentryStats {
                    alloc: 7,
                    positive: 5,
                    negative: 2,
                },
            ),
            (
                "cgroup-99".to_string(),
                String::new(),
                DentryStats {
                    alloc: 1,
                    positive: 0,
                    negative: 0,
                },
            ),
        ];

        let mut out = String::new();
        render_counter_series(&mut out, "dentry_alloc_total", "help text", &entries, |s| {
            s.alloc
        });

        assert!(out.contains("# TYPE dentry_alloc_total counter"));
        assert!(out.contains("dentry_alloc_total{pod=\"pod-12345678-9a\",container=\"abc\"} 7"));
        // Unresolved cgroups keep a synthetic pod label and empty container.
        assert!(out.contains("dentry_alloc_total{pod=\"cgroup-99\",container=\"\"} 1"));
    }
}
