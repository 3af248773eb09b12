#![forbid(unsafe_code)]

use std::sync::Arc;

use mb_adapter::{bind_addr_from_env, router, AdapterRuntime};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let addr = bind_addr_from_env()?;
    let runtime = Arc::new(AdapterRuntime::default_from_env());
    let app = router(runtime);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "mb_background_http listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "ctrl-c handler unavailable, serving until killed");
                std::future::pending::<()>().await;
            }
        })
        .await?;
    info!("mb_background_http stopped");
    Ok(())
}
