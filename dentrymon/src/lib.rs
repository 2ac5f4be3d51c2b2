pub mod metrics;
pub mod probes;
pub mod resolver;
pub mod settings;
pub mod trace;

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::signal::unix::{signal, SignalKind};

use crate::metrics::Collector;
use crate::resolver::PodResolver;
use crate::settings::Settings;
use crate::trace::http::TraceApi;
use crate::trace::window::TraceWindow;
use crate::trace::writer::TsvWriter;
use crate::trace::{TraceControl, TracePipeline};

/// The agent: owns the loaded probes and the worker set for one process
/// lifetime.
pub struct Agent {
    settings: Settings,
}

impl Agent {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Load and attach probes, start the workers, serve the endpoint, and
    /// block until SIGINT/SIGTERM. Fatal initialization errors propagate;
    /// everything after startup degrades instead of failing.
    pub async fn run(self) -> Result<()> {
        let settings = &self.settings;

        let mut bpf = probes::load()?;
        let tracing_attached = probes::attach(&mut bpf)?;

        let trace_enabled = settings.trace_enabled && tracing_attached;
        if settings.trace_enabled && !tracing_attached {
            warn!("tracing requested but path-capture probe unavailable; running metrics only");
        }
        let config_map = bpf.take_map("TRACE_CONFIG").context("TRACE_CONFIG map missing")?;
        let control = Arc::new(TraceControl::new(
            config_map,
            trace_enabled,
            settings.patterns(),
        )?);

        // Cgroup → pod resolver. A failed first scan is a warning: scrapes
        // fall back to synthetic cgroup labels until a refresh succeeds.
        let resolver = Arc::new(PodResolver::new(&settings.proc_root, &settings.cgroup_root));
        let mappings = resolver.refresh();
        info!("resolver ready with {mappings} cgroup mappings");
        resolver.spawn_refresh_task(settings.resolve_interval());

        // Metrics collector over the kernel maps.
        let stats_map = bpf.take_map("DENTRY_STATS").context("DENTRY_STATS map missing")?;
        let reclaim_map = bpf.take_map("RECLAIM_COUNT").context("RECLAIM_COUNT map missing")?;
        let drops_map = bpf.take_map("TRACE_DROPS").context("TRACE_DROPS map missing")?;
        let collector = Arc::new(Collector::new(
            stats_map,
            reclaim_map,
            drops_map,
            Arc::clone(&resolver),
            &settings.proc_root,
        )?);
        collector.poll();
        collector.spawn_poll_task(settings.poll_interval());
        info!("metrics collector started (poll every {:?})", settings.poll_interval());

        // Trace pipeline: writer, consumer thread, periodic flusher.
        let writer = Arc::new(TsvWriter::new(
            &settings.trace_dir,
            settings.trace_max_size_bytes(),
            settings.trace_max_files,
        )?);
        let ring_map = bpf.take_map("TRACE_EVENTS").context("TRACE_EVENTS map missing")?;
        let window = Arc::new(TraceWindow::new(trace::WINDOW_CAPACITY));
        let pipeline = TracePipeline::new(
            ring_map,
            Arc::clone(&resolver),
            Arc::clone(&control),
            Arc::clone(&window),
            Arc::clone(&writer),
        )?;
        let consumer = pipeline.spawn();
        info!(
            "trace consumer started (dir={}, max_size={}MB, max_files={}, enabled={})",
            settings.trace_dir.display(),
            settings.trace_max_size_mb,
            settings.trace_max_files,
            trace_enabled,
        );

        let flush_writer = Arc::clone(&writer);
        let flush_shutdown = probes::shutdown_flag();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                ticker.tick().await;
                if flush_shutdown.load(std::sync::atomic::Ordering::Relaxed) {
                    break;
                }
                if let Err(e) = flush_writer.flush() {
                    warn!("trace flush error: {e:#}");
                }
            }
        });

        // HTTP surface: metrics plus the trace query/config endpoints.
        let listener = tokio::net::TcpListener::bind(&settings.listen)
            .await
            .with_context(|| format!("bind {}", settings.listen))?;
        let app = metrics::router(Arc::clone(&collector)).merge(trace::http::router(TraceApi {
            window: Arc::clone(&window),
            control: Arc::clone(&control),
        }));
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let server = tokio::spawn(metrics::serve(listener, app, shutdown_rx));

        wait_for_signal().await?;
        info!("shutdown signal received");

        probes::request_shutdown();
        let _ = shutdown_tx.send(true);
        if let Ok(Err(e)) = server.await {
            warn!("HTTP server shutdown error: {e:#}");
        }

        // The consumer notices the flag within one poll interval; join it
        // off the runtime, then drain the writer.
        tokio::task::spawn_blocking(move || {
            let _ = consumer.join();
        })
        .await
        .ok();
        if let Err(e) = writer.close() {
            warn!("trace writer close error: {e:#}");
        }

        drop(bpf); // detaches all kprobes and frees the maps
        info!("dentrymon stopped");
        Ok(())
    }
}

async fn wait_for_signal() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}
