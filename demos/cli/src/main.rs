//! Demo CLI: opens a libvirt connection, provisions one pooled VM against
//! the golden snapshot, and tears it down. Out of scope for the core
//! subsystem itself — this just exercises the public API end to end.

use std::sync::Arc;
use std::time::Duration;

use agent_vm::{Connection, PoolConfig, SystemClock, Template, VMPool};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let uri = std::env::var("AGENT_VM_LIBVIRT_URI").unwrap_or_else(|_| "qemu:///system".into());
    let connection = Connection::scoped(&uri).await?;
    info!(%uri, "connected to libvirt");

    let boot_template = Template::new("agent-vm-pool-boot");
    let mut config = PoolConfig::new(1, boot_template);
    config.acquire_wait = Duration::from_secs(10);
    let pool = VMPool::new(config, Arc::new(SystemClock));

    // `connection` drops (and closes) here on every exit path below,
    // including the early return from `?`.
    let pooled = pool.acquire(&connection).await?;
    info!(vm = pooled.key(), "acquired pooled vm");
    pool.release(pooled.key(), chrono::Utc::now()).await;

    Ok(())
}
