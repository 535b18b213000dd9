use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use visagerd::dbus_interface::{VisagerService, BUS_NAME, OBJECT_PATH};
use visagerd::{Config, Pipeline, SubprocessBackend};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "visagerd starting");

    let config = Config::load().context("loading configuration")?;
    tracing::info!(
        photos_root = %config.photos_root.display(),
        store = %config.store_path.display(),
        model = %config.model_tag,
        threshold = config.match_threshold,
        "configuration loaded"
    );

    let backend = SubprocessBackend::new(
        &config.backend_command,
        &config.model_tag,
        config.startup_timeout(),
        config.job_timeout(),
    )
    .context("configuring recognizer backend")?;
    let pipeline = Pipeline::new(&config, backend).context("building pipeline")?;

    // Keep serving without a backend; health reports it and the next job
    // retries the spawn.
    if let Err(e) = pipeline.initialize().await {
        tracing::error!(error = %e, "recognizer backend failed to start");
    }
    pipeline.start();

    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, VisagerService::new(pipeline.clone()))?
        .build()
        .await
        .context("registering on the session bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "visagerd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("visagerd shutting down");
    pipeline.shutdown().await;

    Ok(())
}
