//! Trace pipeline: drains the kernel ring buffer, rebuilds paths from
//! leaf-first components, filters, enriches with pod identity and wall
//! time, and hands records to the TSV writer and the in-memory window.

pub mod http;
pub mod window;
pub mod writer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use aya::maps::{Array, Map, MapData, RingBuf};
use chrono::{DateTime, Utc};
use dentrymon_common::{
    DentryTraceEvent, TraceConfig, MAX_PATH_DEPTH, OP_ALLOC, OP_NEGATIVE, OP_POSITIVE,
};
use log::{info, warn};
use serde::Serialize;

use crate::probes::shutdown_flag;
use crate::resolver::PodResolver;
use window::TraceWindow;
use writer::TsvWriter;

const IDLE_POLL: Duration = Duration::from_millis(10);

/// Events retained for the HTTP query surface.
pub const WINDOW_CAPACITY: usize = 1024;

/// Enriched trace event, ready for output.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    /// Wall-clock time of consumption. The kernel timestamp only orders
    /// events within a producer CPU and is not surfaced to operators.
    pub timestamp: DateTime<Utc>,
    pub pod: String,
    pub container: String,
    pub cgroup_id: u64,
    pub operation: &'static str,
    pub path: String,
    pub fstype: String,
}

/// Runtime tracing state: the kernel on/off switch plus the userspace
/// pattern filters. Shared between the consumer and the HTTP config
/// endpoint, so both startup flags and PUTs take the same path.
pub struct TraceControl {
    config_map: Mutex<Array<MapData, TraceConfig>>,
    patterns: RwLock<Vec<String>>,
    enabled: AtomicBool,
}

impl TraceControl {
    /// Wrap the kernel config map and apply the initial configuration.
    pub fn new(config_map: Map, enabled: bool, patterns: Vec<String>) -> Result<Self> {
        let control = Self {
            config_map: Mutex::new(
                Array::try_from(config_map).context("TRACE_CONFIG is not an Array")?,
            ),
            patterns: RwLock::new(patterns),
            enabled: AtomicBool::new(false),
        };
        control.set_enabled(enabled)?;
        Ok(control)
    }

    /// Push the switch into the kernel map; the emission path reads it on
    /// every allocation. Last write wins.
    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        let config = TraceConfig {
            enabled: enabled as u32,
            _pad: 0,
        };
        self.config_map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .set(0, config, 0)
            .context("update trace config map")?;
        self.enabled.store(enabled, Ordering::Relaxed);
        info!("trace config applied: enabled={enabled}");
        Ok(())
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn patterns(&self) -> Vec<String> {
        self.patterns.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_patterns(&self, patterns: Vec<String>) {
        *self.patterns.write().unwrap_or_else(|e| e.into_inner()) = patterns;
    }
}

pub struct TracePipeline {
    ring: RingBuf<MapData>,
    resolver: Arc<PodResolver>,
    control: Arc<TraceControl>,
    window: Arc<TraceWindow>,
    writer: Arc<TsvWriter>,
}

impl TracePipeline {
    pub fn new(
        ring_map: Map,
        resolver: Arc<PodResolver>,
        control: Arc<TraceControl>,
        window: Arc<TraceWindow>,
        writer: Arc<TsvWriter>,
    ) -> Result<Self> {
        Ok(Self {
            ring: RingBuf::try_from(ring_map).context("TRACE_EVENTS is not a ring buffer")?,
            resolver,
            control,
            window,
            writer,
        })
    }

    /// Run the consumer on a dedicated thread until shutdown. Decode and
    /// write errors are logged per event and never stop the loop.
    pub fn spawn(mut self) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("trace-consumer".to_string())
            .spawn(move || {
                let shutdown = shutdown_flag();
                while !shutdown.load(std::sync::atomic::Ordering::Relaxed) {
                    let mut has_work = false;
                    while let Some(item) = self.ring.next() {
                        has_work = true;
                        let raw = decode(&item);
                        let len = item.len();
                        drop(item);
                        match raw {
                            Some(raw) => self.handle(&raw),
                            None => warn!("trace: short ring buffer record ({len} bytes)"),
                        }
                    }
                    if !has_work {
                        std::thread::sleep(IDLE_POLL);
                    }
                }
            })
            .expect("failed to spawn trace consumer thread")
    }

    fn handle(&self, raw: &DentryTraceEvent) {
        let path = build_path(raw);
        let patterns = self.control.patterns();
        if !patterns.is_empty() && !matches_any(&path, &patterns) {
            return;
        }

        let (pod, container) = match self.resolver.resolve(raw.cgroup_id) {
            Some(info) => (info.pod.clone(), info.container.clone()),
            None => (String::new(), String::new()),
        };

        let event = TraceEvent {
            timestamp: Utc::now(),
            pod,
            container,
            cgroup_id: raw.cgroup_id,
            operation: op_name(raw.operation),
            path,
            fstype: nul_trimmed(&raw.fstype),
        };

        if let Err(e) = self.writer.write_event(&event) {
            warn!("trace: write error: {e:#}");
        }
        self.window.push(Arc::new(event));
    }
}

/// Decode a raw ring buffer record. Records shorter than the event layout
/// are malformed and rejected.
fn decode(bytes: &[u8]) -> Option<DentryTraceEvent> {
    if bytes.len() < std::mem::size_of::<DentryTraceEvent>() {
        return None;
    }
    Some(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const DentryTraceEvent) })
}

/// Reconstruct a path from leaf-first components.
///
/// A leading `/` means the kernel walk reached the filesystem root; its
/// absence marks a partial path and is deliberately left visible. An
/// event with no usable components renders as `/` regardless of the
/// flag; there is no partial path to preserve.
pub fn build_path(event: &DentryTraceEvent) -> String {
    let depth = (event.component_depth() as usize).min(MAX_PATH_DEPTH);

    let mut parts: Vec<String> = Vec::with_capacity(depth);
    for i in (0..depth).rev() {
        let name = nul_trimmed(&event.names[i]);
        if name.is_empty() || name == "/" {
            continue;
        }
        parts.push(name);
    }

    if parts.is_empty() {
        return "/".to_string();
    }

    let joined = parts.join("/");
    if event.reached_root() {
        format!("/{joined}")
    } else {
        joined
    }
}

/// String up to the first NUL. Slots with no terminator at all are ring
/// buffer garbage past the valid depth and read as empty.
fn nul_trimmed(slot: &[u8]) -> String {
    match slot.iter().position(|&b| b == 0) {
        Some(end) => String::from_utf8_lossy(&slot[..end]).into_owned(),
        None => String::new(),
    }
}

fn op_name(op: u32) -> &'static str {
    match op {
        OP_ALLOC => "alloc",
        OP_POSITIVE => "positive",
        OP_NEGATIVE => "negative",
        _ => "unknown",
    }
}

fn matches_any(path: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| !p.is_empty() && path.contains(p.as_str()))
}
