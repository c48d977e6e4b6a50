use std::sync::Arc;

use shortio_relay::{
    config,
    link_service::{link_service_capsule, spawn_periodic_sweep},
    routes::{self, AppState},
};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let container = config::init_container().await?;
    let links = container.read(link_service_capsule);
    let sweep_config = container.read(config::sweep_config_capsule);

    if let Some(period) = sweep_config.interval {
        spawn_periodic_sweep(Arc::clone(&links), period);
    }

    let app = routes::router(AppState {
        links,
        sweep_token: sweep_config.token.map(Arc::from),
    });

    let listener = TcpListener::bind(container.read(config::addr_capsule)).await?;
    info!(addr = %listener.local_addr()?, "Started listening on TCP");
    axum::serve(listener, app).await?;
    Ok(())
}
