//! Kernel-side dentry lifecycle probes.
//!
//! Four kprobes: two on `d_alloc` (one counting, one path-capturing), one
//! on `d_instantiate` (positive/negative classification), one on
//! `shrink_dcache_sb` (reclaim). Counting and path capture are split so
//! the hot counting path stays trivial and keeps working even if the
//! verifier rejects the tracing program on some kernel.

#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::BPF_NOEXIST,
    helpers::{
        bpf_get_current_cgroup_id, bpf_ktime_get_ns, bpf_probe_read_kernel,
        bpf_probe_read_kernel_str_bytes,
    },
    macros::{kprobe, map},
    maps::{Array, HashMap, RingBuf},
    programs::ProbeContext,
};
use aya_log_ebpf::debug;
use dentrymon_common::{
    DentryStats, DentryTraceEvent, TraceConfig, DEPTH_ROOT_FLAG, FSTYPE_LEN, MAX_NAME_LEN,
    OP_ALLOC, STATS_MAX_ENTRIES, TRACE_RINGBUF_BYTES,
};

// struct offsets for x86_64 kernels (5.15+). aya has no CO-RE relocation
// for hand-rolled reads, so these mirror the layout of the probed structs.
const D_PARENT_OFFSET: u64 = 0x18; // dentry.d_parent
const D_NAME_OFFSET: u64 = 0x20; // dentry.d_name (struct qstr)
const QSTR_NAME_OFFSET: u64 = 0x8; // qstr.name
const D_SB_OFFSET: u64 = 0x70; // dentry.d_sb
const S_TYPE_OFFSET: u64 = 0x28; // super_block.s_type
const FS_NAME_OFFSET: u64 = 0x0; // file_system_type.name

#[map]
static DENTRY_STATS: HashMap<u64, DentryStats> =
    HashMap::with_max_entries(STATS_MAX_ENTRIES, 0);

#[map]
static TRACE_EVENTS: RingBuf = RingBuf::with_byte_size(TRACE_RINGBUF_BYTES, 0);

#[map]
static TRACE_CONFIG: Array<TraceConfig> = Array::with_max_entries(1, 0);

#[map]
static RECLAIM_COUNT: Array<u64> = Array::with_max_entries(1, 0);

#[map]
static TRACE_DROPS: Array<u64> = Array::with_max_entries(1, 0);

/// Look up the stats record for a cgroup, creating it on first sight.
/// Two CPUs may race the insert; both start from the same zero struct, so
/// whichever lands second loses nothing but a single increment.
#[inline(always)]
fn stats_ptr(cgid: u64) -> Option<*mut DentryStats> {
    if let Some(ptr) = DENTRY_STATS.get_ptr_mut(&cgid) {
        return Some(ptr);
    }
    let zero = DentryStats::default();
    let _ = DENTRY_STATS.insert(&cgid, &zero, BPF_NOEXIST as u64);
    DENTRY_STATS.get_ptr_mut(&cgid)
}

#[inline(always)]
fn tracing_enabled() -> bool {
    match TRACE_CONFIG.get_ptr(0) {
        Some(cfg) => unsafe { (*cfg).enabled != 0 },
        None => false,
    }
}

#[inline(always)]
fn bump(counter: &Array<u64>) {
    if let Some(ptr) = counter.get_ptr_mut(0) {
        unsafe { *ptr = (*ptr).wrapping_add(1) };
    }
}

/// Read `dentry->d_name.name` into a fixed slot. On any failure the slot
/// is NUL'd so userspace sees an empty component.
#[inline(always)]
fn read_dentry_name(dentry: u64, slot: &mut [u8; MAX_NAME_LEN]) {
    slot[0] = 0;
    let name_ptr: u64 = match unsafe {
        bpf_probe_read_kernel((dentry + D_NAME_OFFSET + QSTR_NAME_OFFSET) as *const u64)
    } {
        Ok(ptr) => ptr,
        Err(_) => return,
    };
    if name_ptr == 0 {
        return;
    }
    let _ = unsafe { bpf_probe_read_kernel_str_bytes(name_ptr as *const u8, slot) };
}

/// Read `dentry->d_parent`, or 0 on failure.
#[inline(always)]
fn read_parent(dentry: u64) -> u64 {
    unsafe { bpf_probe_read_kernel((dentry + D_PARENT_OFFSET) as *const u64) }.unwrap_or(0)
}

/// Read `dentry->d_sb->s_type->name` into the fstype slot.
#[inline(always)]
fn read_fstype(dentry: u64, slot: &mut [u8; FSTYPE_LEN]) {
    slot[0] = 0;
    let sb: u64 = match unsafe { bpf_probe_read_kernel((dentry + D_SB_OFFSET) as *const u64) } {
        Ok(ptr) => ptr,
        Err(_) => return,
    };
    if sb == 0 {
        return;
    }
    let fst: u64 = match unsafe { bpf_probe_read_kernel((sb + S_TYPE_OFFSET) as *const u64) } {
        Ok(ptr) => ptr,
        Err(_) => return,
    };
    if fst == 0 {
        return;
    }
    let name_ptr: u64 =
        match unsafe { bpf_probe_read_kernel((fst + FS_NAME_OFFSET) as *const u64) } {
            Ok(ptr) => ptr,
            Err(_) => return,
        };
    if name_ptr == 0 {
        return;
    }
    let _ = unsafe { bpf_probe_read_kernel_str_bytes(name_ptr as *const u8, slot) };
}

/// Counting probe on `d_alloc(struct dentry *parent, const struct qstr *name)`.
#[kprobe]
pub fn dentry_alloc(_ctx: ProbeContext) -> u32 {
    let cgid = unsafe { bpf_get_current_cgroup_id() };
    if let Some(stats) = stats_ptr(cgid) {
        unsafe { (*stats).alloc = (*stats).alloc.wrapping_add(1) };
    }
    0
}

/// Path-capture probe on `d_alloc`. Emits a leaf-first component list for
/// the new dentry when tracing is enabled. Never blocks: a failed ring
/// buffer reservation is counted and dropped.
#[kprobe]
pub fn dentry_alloc_path(ctx: ProbeContext) -> u32 {
    match try_dentry_alloc_path(&ctx) {
        Ok(ret) => ret,
        Err(ret) => ret,
    }
}

#[inline(always)]
fn try_dentry_alloc_path(ctx: &ProbeContext) -> Result<u32, u32> {
    if !tracing_enabled() {
        return Ok(0);
    }

    let parent: u64 = ctx.arg(0).ok_or(1u32)?;
    let qstr: u64 = ctx.arg(1).ok_or(1u32)?;
    if parent == 0 || qstr == 0 {
        return Ok(0);
    }

    let mut entry = match TRACE_EVENTS.reserve::<DentryTraceEvent>(0) {
        Some(entry) => entry,
        None => {
            bump(&TRACE_DROPS);
            return Ok(0);
        }
    };
    let event = entry.as_mut_ptr();

    unsafe {
        (*event).timestamp = bpf_ktime_get_ns();
        (*event).cgroup_id = bpf_get_current_cgroup_id();
        (*event).operation = OP_ALLOC;

        // names[0]: the new dentry's own name, from the qstr argument.
        (*event).names[0][0] = 0;
        if let Ok(name_ptr) = bpf_probe_read_kernel((qstr + QSTR_NAME_OFFSET) as *const u64) {
            if name_ptr != 0 {
                let _ = bpf_probe_read_kernel_str_bytes(
                    name_ptr as *const u8,
                    &mut (*event).names[0],
                );
            }
        }
        (*event).depth = 1;

        // names[1]: the parent directory.
        read_dentry_name(parent, &mut (*event).names[1]);
        (*event).depth = 2;

        read_fstype(parent, &mut (*event).fstype);

        // Walk d_parent for the remaining slots. The verifier rejects
        // bounded loops whose pointer loads depend on prior iterations,
        // so the walk is unrolled one macro expansion per slot.
        let mut current = parent;
        let mut reached_root = false;

        macro_rules! walk_step {
            ($idx:expr) => {
                if !reached_root {
                    let next = read_parent(current);
                    if next == 0 || next == current {
                        reached_root = true;
                    } else {
                        read_dentry_name(next, &mut (*event).names[$idx]);
                        (*event).depth = $idx as u32 + 1;
                        current = next;
                    }
                }
            };
        }

        walk_step!(2);
        walk_step!(3);
        walk_step!(4);
        walk_step!(5);
        walk_step!(6);
        walk_step!(7);

        // A walk that lands exactly on the root at the depth cap is still
        // a complete path.
        if !reached_root {
            let next = read_parent(current);
            if next == 0 || next == current {
                reached_root = true;
            }
        }

        if reached_root {
            (*event).depth |= DEPTH_ROOT_FLAG;
        }
    }

    entry.submit(0);
    Ok(0)
}

/// Probe on `d_instantiate(struct dentry *dentry, struct inode *inode)`.
/// A non-null inode makes the dentry positive, a null one negative.
#[kprobe]
pub fn dentry_instantiate(ctx: ProbeContext) -> u32 {
    match try_dentry_instantiate(&ctx) {
        Ok(ret) => ret,
        Err(ret) => ret,
    }
}

#[inline(always)]
fn try_dentry_instantiate(ctx: &ProbeContext) -> Result<u32, u32> {
    let inode: u64 = ctx.arg(1).ok_or(1u32)?;
    let cgid = unsafe { bpf_get_current_cgroup_id() };

    let stats = match stats_ptr(cgid) {
        Some(ptr) => ptr,
        None => return Ok(0),
    };

    unsafe {
        if inode != 0 {
            (*stats).positive = (*stats).positive.wrapping_add(1);
        } else {
            (*stats).negative = (*stats).negative.wrapping_add(1);
        }
    }
    Ok(0)
}

/// Probe on `shrink_dcache_sb`: node-wide reclaim counter. Low frequency,
/// so logging here is affordable.
#[kprobe]
pub fn dentry_reclaim(ctx: ProbeContext) -> u32 {
    bump(&RECLAIM_COUNT);
    debug!(&ctx, "dentry cache shrink observed");
    0
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";
