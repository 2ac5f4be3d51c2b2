//! eBPF object loading, kprobe attachment, and the shared shutdown flag.
//!
//! The three counting probes are mandatory: if any of them fails to
//! attach, startup fails. The path-capture probe is best-effort; a
//! verifier that rejects it costs tracing, never metrics.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{Context, Result};
use aya::{include_bytes_aligned, programs::KProbe, Ebpf};
use aya_log::EbpfLogger;
use log::{debug, info, warn};

static SHUTDOWN: once_cell::sync::Lazy<Arc<AtomicBool>> =
    once_cell::sync::Lazy::new(|| Arc::new(AtomicBool::new(false)));

pub fn shutdown_flag() -> Arc<AtomicBool> {
    SHUTDOWN.clone()
}

pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

/// Load the embedded eBPF object.
///
/// Bumps RLIMIT_MEMLOCK first: kernels without cgroup-based BPF memory
/// accounting reject map creation under the default limit.
pub fn load() -> Result<Ebpf> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!("failed to raise RLIMIT_MEMLOCK (ret={ret}); continuing");
    }

    let mut bpf = Ebpf::load(include_bytes_aligned!(concat!(
        env!("OUT_DIR"),
        "/dentrymon"
    )))
    .context("failed to load eBPF object")?;

    if let Err(e) = EbpfLogger::init(&mut bpf) {
        warn!("failed to initialize eBPF logger: {e}");
    }

    Ok(bpf)
}

/// Attach all kprobes. Returns whether the optional path-capture probe is
/// attached; the counting probes propagate their errors.
pub fn attach(bpf: &mut Ebpf) -> Result<bool> {
    attach_kprobe(bpf, "dentry_alloc", "d_alloc")
        .context("failed to attach kprobe/d_alloc")?;
    attach_kprobe(bpf, "dentry_instantiate", "d_instantiate")
        .context("failed to attach kprobe/d_instantiate")?;
    attach_kprobe(bpf, "dentry_reclaim", "shrink_dcache_sb")
        .context("failed to attach kprobe/shrink_dcache_sb")?;

    let tracing_attached = match attach_kprobe(bpf, "dentry_alloc_path", "d_alloc") {
        Ok(()) => true,
        Err(e) => {
            warn!("failed to attach path-capture kprobe, tracing disabled: {e:#}");
            false
        }
    };

    Ok(tracing_attached)
}

fn attach_kprobe(bpf: &mut Ebpf, program_name: &str, target_fn: &str) -> Result<()> {
    let program: &mut KProbe = bpf
        .program_mut(program_name)
        .with_context(|| format!("program {program_name} not found in eBPF object"))?
        .try_into()?;
    program.load()?;
    program
        .attach(target_fn, 0)
        .with_context(|| format!("attach to {target_fn}"))?;
    info!("attached kprobe/{target_fn} ({program_name})");
    Ok(())
}
