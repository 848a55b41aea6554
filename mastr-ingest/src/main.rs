use anyhow::Result;
use mastr_ingest::{config::AppConfig, jobs, metrics_server, observability};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    observability::init_tracing();

    // Load configuration
    let cfg = AppConfig::load()?;

    // Start metrics server if configured
    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    tracing::info!(
        technologies = ?cfg.technologies,
        data_dir = %cfg.data_dir.display(),
        version = %cfg.data_version,
        "starting registry download"
    );

    jobs::run(&cfg).await?;

    tracing::info!("registry download finished");
    Ok(())
}
