use anyhow::Result;
use clap::Parser;
use log::info;
use tracing_subscriber::EnvFilter;

use dentrymon::settings::Settings;
use dentrymon::Agent;

#[tokio::main]
async fn main() -> Result<()> {
    // Optional env file for systemd/DaemonSet deployments; flags and
    // DENTRYMON_* variables both feed the same Settings surface.
    dotenvy::dotenv().ok();
    let settings = Settings::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(
        "dentrymon starting (listen={}, proc={}, cgroup={})",
        settings.listen,
        settings.proc_root.display(),
        settings.cgroup_root.display(),
    );

    Agent::new(settings).run().await
}
