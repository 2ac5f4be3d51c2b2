#![no_std]

//! Structs and constants shared between the dentrymon agent and its eBPF
//! programs. Everything here is `#[repr(C)]` and layout-stable: the kernel
//! side writes these bytes, the user side reads them back unchanged.

/// Maximum number of path components captured per trace event.
pub const MAX_PATH_DEPTH: usize = 8;

/// Maximum length of a single captured name component, including NUL.
pub const MAX_NAME_LEN: usize = 64;

/// Maximum length of the filesystem type name, including NUL.
pub const FSTYPE_LEN: usize = 16;

/// Bit 31 of `DentryTraceEvent::depth`: the parent walk reached the
/// filesystem root instead of hitting the depth cap.
pub const DEPTH_ROOT_FLAG: u32 = 0x8000_0000;

/// Capacity of the per-cgroup stats map.
pub const STATS_MAX_ENTRIES: u32 = 4096;

/// Ring buffer size for trace events (2 MiB).
pub const TRACE_RINGBUF_BYTES: u32 = 2 * 1024 * 1024;

pub const OP_ALLOC: u32 = 0;
pub const OP_POSITIVE: u32 = 1;
pub const OP_NEGATIVE: u32 = 2;

/// Per-cgroup dentry counters. Monotonically non-decreasing for the
/// lifetime of the map entry.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct DentryStats {
    pub alloc: u64,
    pub positive: u64,
    pub negative: u64,
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for DentryStats {}

/// Tracing on/off switch, written by userspace into a single-entry array
/// map and read on the emission fast path.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct TraceConfig {
    pub enabled: u32,
    pub _pad: u32,
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for TraceConfig {}

/// Raw trace event emitted on dentry allocation.
///
/// `names` is filled leaf-first: `names[0]` is the new dentry's own name,
/// `names[1]` its parent directory, and so on toward the root. Only the
/// first `depth & !DEPTH_ROOT_FLAG` slots are valid; later slots carry
/// whatever the ring buffer reservation happened to contain.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DentryTraceEvent {
    pub timestamp: u64,
    pub cgroup_id: u64,
    pub operation: u32,
    pub depth: u32,
    pub names: [[u8; MAX_NAME_LEN]; MAX_PATH_DEPTH],
    pub fstype: [u8; FSTYPE_LEN],
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for DentryTraceEvent {}

impl DentryTraceEvent {
    /// Component count with the root flag stripped.
    pub fn component_depth(&self) -> u32 {
        self.depth & !DEPTH_ROOT_FLAG
    }

    pub fn reached_root(&self) -> bool {
        self.depth & DEPTH_ROOT_FLAG != 0
    }
}
