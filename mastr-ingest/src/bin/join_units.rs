use anyhow::{bail, Result};
use mastr_ingest::{config::AppConfig, jobs, observability, Technology};
use std::env;

fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        bail!("usage: join_units <technology>");
    }
    let tech: Technology = args[1].parse().map_err(|e: String| anyhow::anyhow!(e))?;

    let cfg = AppConfig::load()?;
    let table = jobs::make_unified(&cfg, tech)?;

    tracing::info!(%tech, rows = table.len(), columns = table.columns.len(), "unified table written");
    Ok(())
}
