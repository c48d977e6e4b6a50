use anyhow::Context;
use shortio_relay::{config, link_service::link_service_capsule};
use time::OffsetDateTime;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let container = config::init_container().await?;

    let report = container
        .read(link_service_capsule)
        .sweep_expired(OffsetDateTime::now_utc())
        .await
        .context("Failed to sweep expired links")?;
    info!(removed = report.removed, failed = report.failed, "Sweep pass complete");
    Ok(())
}
